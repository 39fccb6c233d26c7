// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod errors;
pub mod exec;
pub mod jobspec;
pub mod logging;
pub mod ports;
pub mod record;
pub mod util;

pub use errors::{ExecError, ExecResult};
pub use exec::{kill, retrieve, stash, submit, unstash, upload};
pub use record::CalculationRecord;
