// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::errors::{ExecError, ExecResult};
use crate::logging::CalcScope;
use crate::ports::scheduler::Scheduler;
use crate::record::CalculationRecord;

/// Terminate the calculation's batch job, tolerating the race where the job
/// finishes on its own while the kill is in flight.
///
/// A kill that the scheduler reports as failed is only escalated to an error
/// when a confirmatory lookup still shows the job alive; a job that has
/// vanished or reached a done state is treated as successfully killed.
pub async fn kill(record: &CalculationRecord, scheduler: &dyn Scheduler) -> ExecResult<()> {
    let scope = CalcScope::new(record.uuid());

    let Some(job_id) = record.job_id() else {
        log::info!("{scope}: never submitted, nothing to kill");
        return Ok(());
    };

    if scheduler.kill_job(job_id).await? {
        log::info!("{scope}: killed job {job_id}");
        return Ok(());
    }

    let jobs = scheduler.get_jobs(&[job_id.to_string()]).await?;
    match jobs.get(job_id) {
        Some(info) if !info.state.is_done() => Err(ExecError::RemoteOperation(format!(
            "could not kill job {job_id}: scheduler still reports it as {:?}",
            info.state
        ))),
        _ => {
            log::warn!(
                "{scope}: kill of job {job_id} reported failure but the job is already gone"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{new_record, record_with_workdir, StubScheduler};
    use crate::ports::scheduler::JobState;

    async fn submitted_record(env: &std::path::Path, job_id: &str) -> CalculationRecord {
        let mut record = record_with_workdir(&env.join("work"));
        let scheduler = StubScheduler::new(job_id);
        crate::exec::submit(&mut record, &scheduler).await.unwrap();
        record
    }

    #[tokio::test]
    async fn kill_without_a_job_id_is_a_noop() {
        let env = tempfile::tempdir().unwrap();
        let record = new_record(env.path());
        let scheduler = StubScheduler::new("9");

        kill(&record, &scheduler).await.unwrap();
        assert!(scheduler.kills().is_empty());
    }

    #[tokio::test]
    async fn kill_succeeds_when_the_scheduler_accepts() {
        let env = tempfile::tempdir().unwrap();
        let record = submitted_record(env.path(), "9").await;
        let scheduler = StubScheduler::new("9");

        kill(&record, &scheduler).await.unwrap();
        assert_eq!(scheduler.kills(), vec!["9".to_string()]);
    }

    #[tokio::test]
    async fn failed_kill_of_a_vanished_job_is_tolerated() {
        let env = tempfile::tempdir().unwrap();
        let record = submitted_record(env.path(), "9").await;
        // kill_job reports failure and the job is no longer known.
        let scheduler = StubScheduler::new("9").with_kill_result(false);

        kill(&record, &scheduler).await.unwrap();
    }

    #[tokio::test]
    async fn failed_kill_of_a_done_job_is_tolerated() {
        let env = tempfile::tempdir().unwrap();
        let record = submitted_record(env.path(), "9").await;
        let scheduler = StubScheduler::new("9").with_kill_result(false);
        scheduler.set_job_state("9", JobState::Done);

        kill(&record, &scheduler).await.unwrap();
    }

    #[tokio::test]
    async fn failed_kill_of_a_live_job_is_an_error() {
        let env = tempfile::tempdir().unwrap();
        let record = submitted_record(env.path(), "9").await;
        let scheduler = StubScheduler::new("9").with_kill_result(false);
        scheduler.set_job_state("9", JobState::Running);

        let err = kill(&record, &scheduler).await.unwrap_err();
        assert!(matches!(err, ExecError::RemoteOperation(_)));
    }
}
