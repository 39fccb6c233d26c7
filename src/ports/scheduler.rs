// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler rejected the submission: {0}")]
    SubmissionFailed(String),

    #[error("scheduler command failed: {0}")]
    Command(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Coarse batch-system job states, normalized across scheduler plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    QueuedHeld,
    Running,
    Suspended,
    Done,
    Undetermined,
}

impl JobState {
    /// Terminal from the batch system's point of view. The kill stage uses
    /// this to distinguish a failed kill from a race with natural completion.
    pub fn is_done(self) -> bool {
        matches!(self, JobState::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub state: JobState,
}

#[async_trait]
/// Batch scheduler boundary. Implementations translate these calls into the
/// concrete command syntax of SLURM, PBS, direct execution and so on.
pub trait Scheduler: Send + Sync {
    /// Submit the script at `script` inside `workdir`; returns the job id
    /// assigned by the batch system.
    async fn submit_job(&self, workdir: &str, script: &str) -> SchedulerResult<String>;

    /// Look up the current state of the given jobs. Jobs unknown to the
    /// scheduler (typically because they finished long ago) are absent from
    /// the returned map.
    async fn get_jobs(&self, job_ids: &[String]) -> SchedulerResult<HashMap<String, JobInfo>>;

    /// Request termination of a job; returns whether the scheduler accepted
    /// the request.
    async fn kill_job(&self, job_id: &str) -> SchedulerResult<bool>;
}
