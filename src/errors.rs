// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error;

use crate::ports::repository::RepositoryError;
use crate::ports::scheduler::SchedulerError;
use crate::ports::transport::TransportError;

/// Failure modes of the lifecycle stages.
///
/// None of these are retried internally; a stage that fails leaves the
/// calculation record untouched so that the caller's retry policy can
/// re-invoke it from scratch.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The computer or calculation is misconfigured (e.g. a blank remote
    /// base directory). Re-invoking without fixing the setup will fail again.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A copy-mode stash failed partway; the partial target has been removed
    /// on a best-effort basis.
    #[error("stashing failed: {0}")]
    Stashing(String),

    /// A remote operation failed and a confirmatory check showed the failure
    /// is not transient.
    #[error("remote operation failed: {0}")]
    RemoteOperation(String),

    /// The requested operation is outside what this core implements, such as
    /// a remote-to-remote copy between two different computers.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ExecResult<T> = Result<T, ExecError>;
