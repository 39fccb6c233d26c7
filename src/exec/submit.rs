// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::errors::{ExecError, ExecResult};
use crate::logging::CalcScope;
use crate::ports::scheduler::Scheduler;
use crate::record::CalculationRecord;

/// Hand the uploaded working directory to the batch scheduler.
///
/// Never resubmits: once a job id is recorded it is returned unchanged, so a
/// crash between the scheduler accepting the job and the record being
/// persisted costs at most one duplicate submission attempt by the caller,
/// never a duplicate job.
pub async fn submit(
    record: &mut CalculationRecord,
    scheduler: &dyn Scheduler,
) -> ExecResult<String> {
    let scope = CalcScope::new(record.uuid());

    if let Some(job_id) = record.job_id() {
        log::info!("{scope}: already submitted as job {job_id}, not resubmitting");
        return Ok(job_id.to_string());
    }

    let workdir = record.remote_workdir().ok_or_else(|| {
        ExecError::Configuration(
            "cannot submit a calculation without a remote working directory".to_string(),
        )
    })?;

    let job_id = scheduler
        .submit_job(workdir, &record.options().submit_script_filename)
        .await?;
    record.set_job_id(job_id.clone());
    log::info!("{scope}: submitted as job {job_id}");
    Ok(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{new_record, record_with_workdir, StubScheduler};

    #[tokio::test]
    async fn submit_records_the_job_id_once() {
        let env = tempfile::tempdir().unwrap();
        let mut record = record_with_workdir(&env.path().join("work"));
        let scheduler = StubScheduler::new("77");

        let first = submit(&mut record, &scheduler).await.unwrap();
        assert_eq!(first, "77");
        assert_eq!(record.job_id(), Some("77"));

        // A second invocation returns the recorded id without resubmitting.
        let second = submit(&mut record, &scheduler).await.unwrap();
        assert_eq!(second, "77");
        assert_eq!(scheduler.submissions().len(), 1);
    }

    #[tokio::test]
    async fn submit_before_upload_is_a_configuration_error() {
        let env = tempfile::tempdir().unwrap();
        let mut record = new_record(env.path());
        let scheduler = StubScheduler::new("77");

        let err = submit(&mut record, &scheduler).await.unwrap_err();
        assert!(matches!(err, ExecError::Configuration(_)));
        assert!(scheduler.submissions().is_empty());
    }
}
