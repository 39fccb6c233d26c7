// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod repository;
pub mod scheduler;
pub mod transport;

pub use repository::{FolderId, NodeKind, ProvenanceLink, Repository};
pub use scheduler::{JobInfo, JobState, Scheduler};
pub use transport::{CompressFormat, Transport};
