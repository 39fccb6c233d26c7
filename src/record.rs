// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobspec::RetrieveEntry;
use crate::ports::repository::FolderId;
use crate::ports::transport::CompressFormat;

/// Default link label under which the permanent output folder is persisted.
pub const DEFAULT_RETRIEVED_LABEL: &str = "retrieved";

/// Default file name of the rendered submission script inside the sandbox.
pub const DEFAULT_SUBMIT_SCRIPT: &str = "_submit.sh";

/// The remote machine a calculation runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computer {
    pub id: String,
    pub label: String,
    /// Base working directory template; a `{username}` placeholder is
    /// resolved against `Transport::whoami` at upload time.
    pub workdir: String,
}

/// Whether a calculation is an ordinary job or a dedicated stash job whose
/// entire purpose is moving files into the stash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcKind {
    Standard,
    Stash,
}

/// Batch resources requested for the job. Interpreted by the scheduler
/// plugin, carried opaquely here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOptions {
    pub num_machines: u32,
    pub num_cores_per_machine: u32,
    pub max_wallclock_secs: Option<u64>,
    pub queue_name: Option<String>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            num_machines: 1,
            num_cores_per_machine: 1,
            max_wallclock_secs: None,
            queue_name: None,
        }
    }
}

/// Closed set of stashing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StashMode {
    Copy,
    CompressTar,
    CompressTarGz,
    CompressTarBz2,
    CompressTarXz,
    SubmitCustomCode,
}

impl StashMode {
    /// The archive format for the compressing modes, `None` otherwise.
    pub fn compress_format(self) -> Option<CompressFormat> {
        match self {
            StashMode::CompressTar => Some(CompressFormat::Tar),
            StashMode::CompressTarGz => Some(CompressFormat::TarGz),
            StashMode::CompressTarBz2 => Some(CompressFormat::TarBz2),
            StashMode::CompressTarXz => Some(CompressFormat::TarXz),
            StashMode::Copy | StashMode::SubmitCustomCode => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashOptions {
    pub mode: StashMode,
    /// Working-directory-relative paths or glob patterns to stash.
    pub source_list: Vec<String>,
    /// Base directory of the stash area on the same machine.
    pub target_base: String,
    /// Follow symlinks when archiving.
    pub dereference: bool,
    /// Treat a missing source as a failure instead of skipping it.
    pub fail_on_missing: bool,
}

/// Where unstashed files are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnstashTarget {
    /// The working directory the stashed files originally came from, found
    /// by walking provenance links upward from the stash source.
    OriginalPlace,
    /// A fresh sharded working directory.
    NewRemoteData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstashOptions {
    pub target_mode: UnstashTarget,
    /// Identifier of the stash node being unstashed.
    pub source_node: String,
    pub source_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcOptions {
    pub resources: ResourceOptions,
    pub stash: Option<StashOptions>,
    pub unstash: Option<UnstashOptions>,
    /// Link label for the permanent output folder; defaults to "retrieved".
    pub retrieved_link_label: Option<String>,
    pub submit_script_filename: String,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self {
            resources: ResourceOptions::default(),
            stash: None,
            unstash: None,
            retrieved_link_label: None,
            submit_script_filename: DEFAULT_SUBMIT_SCRIPT.to_string(),
        }
    }
}

/// Handle to the remote working directory of a calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub computer_id: String,
    pub path: String,
}

/// Stash metadata persisted when the stash stage succeeds. Which variant is
/// produced depends on the stash mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StashRecord {
    Folder {
        target_basepath: String,
        source_list: Vec<String>,
    },
    Compressed {
        target: String,
        source_list: Vec<String>,
        format: CompressFormat,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Outputs {
    remote_folder: Option<RemoteFolder>,
    retrieved: Option<FolderId>,
    remote_stash: Option<StashRecord>,
}

/// Persisted state of one remote calculation job.
///
/// The record is exclusively owned by the lifecycle task processing the
/// calculation; the `&mut` receivers on the setters encode that single-writer
/// contract. The presence of each output link is the sole idempotency signal
/// for its stage, so the setters never overwrite: a second set is dropped
/// with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationRecord {
    uuid: Uuid,
    computer: Computer,
    kind: CalcKind,
    options: CalcOptions,
    remote_workdir: Option<String>,
    job_id: Option<String>,
    retrieve_list: Vec<RetrieveEntry>,
    retrieve_temporary_list: Vec<RetrieveEntry>,
    outputs: Outputs,
}

impl CalculationRecord {
    pub fn new(uuid: Uuid, computer: Computer, kind: CalcKind, options: CalcOptions) -> Self {
        Self {
            uuid,
            computer,
            kind,
            options,
            remote_workdir: None,
            job_id: None,
            retrieve_list: Vec::new(),
            retrieve_temporary_list: Vec::new(),
            outputs: Outputs::default(),
        }
    }

    /// Replace the options at construction time. Options are immutable once
    /// the record is handed to a lifecycle task, so this consumes the record.
    pub fn with_options(mut self, options: CalcOptions) -> Self {
        self.options = options;
        self
    }

    /// Mark the record as a dedicated stash job at construction time.
    pub fn with_kind(mut self, kind: CalcKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn computer(&self) -> &Computer {
        &self.computer
    }

    pub fn kind(&self) -> CalcKind {
        self.kind
    }

    pub fn options(&self) -> &CalcOptions {
        &self.options
    }

    pub fn remote_workdir(&self) -> Option<&str> {
        self.remote_workdir.as_deref()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn retrieve_list(&self) -> &[RetrieveEntry] {
        &self.retrieve_list
    }

    pub fn retrieve_temporary_list(&self) -> &[RetrieveEntry] {
        &self.retrieve_temporary_list
    }

    pub fn remote_folder(&self) -> Option<&RemoteFolder> {
        self.outputs.remote_folder.as_ref()
    }

    pub fn retrieved(&self) -> Option<&FolderId> {
        self.outputs.retrieved.as_ref()
    }

    pub fn remote_stash(&self) -> Option<&StashRecord> {
        self.outputs.remote_stash.as_ref()
    }

    pub fn retrieved_link_label(&self) -> &str {
        self.options
            .retrieved_link_label
            .as_deref()
            .unwrap_or(DEFAULT_RETRIEVED_LABEL)
    }

    pub fn set_remote_workdir(&mut self, workdir: String) {
        if let Some(existing) = &self.remote_workdir {
            log::warn!(
                "calc<{}>: remote workdir already set to {existing}, ignoring {workdir}",
                self.uuid
            );
            return;
        }
        self.remote_workdir = Some(workdir);
    }

    pub fn set_job_id(&mut self, job_id: String) {
        if let Some(existing) = &self.job_id {
            log::warn!(
                "calc<{}>: job id already set to {existing}, ignoring {job_id}",
                self.uuid
            );
            return;
        }
        self.job_id = Some(job_id);
    }

    /// Persist the retrieve lists decided at upload time so that the
    /// retrieve stage needs nothing beyond the record.
    pub fn set_retrieve_lists(
        &mut self,
        permanent: Vec<RetrieveEntry>,
        temporary: Vec<RetrieveEntry>,
    ) {
        self.retrieve_list = permanent;
        self.retrieve_temporary_list = temporary;
    }

    pub fn attach_remote_folder(&mut self, folder: RemoteFolder) {
        if self.outputs.remote_folder.is_some() {
            log::warn!("calc<{}>: remote folder link already exists, not replacing", self.uuid);
            return;
        }
        self.outputs.remote_folder = Some(folder);
    }

    pub fn attach_retrieved(&mut self, folder: FolderId) {
        if self.outputs.retrieved.is_some() {
            log::warn!("calc<{}>: retrieved link already exists, not replacing", self.uuid);
            return;
        }
        self.outputs.retrieved = Some(folder);
    }

    pub fn attach_remote_stash(&mut self, stash: StashRecord) {
        if self.outputs.remote_stash.is_some() {
            log::warn!("calc<{}>: remote stash link already exists, not replacing", self.uuid);
            return;
        }
        self.outputs.remote_stash = Some(stash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CalculationRecord {
        CalculationRecord::new(
            Uuid::new_v4(),
            Computer {
                id: "hpc1".into(),
                label: "cluster".into(),
                workdir: "/scratch/{username}".into(),
            },
            CalcKind::Standard,
            CalcOptions::default(),
        )
    }

    #[test]
    fn lifecycle_fields_set_once() {
        let mut rec = record();
        rec.set_remote_workdir("/scratch/u/ab/cd/rest".into());
        rec.set_remote_workdir("/elsewhere".into());
        assert_eq!(rec.remote_workdir(), Some("/scratch/u/ab/cd/rest"));

        rec.set_job_id("101".into());
        rec.set_job_id("202".into());
        assert_eq!(rec.job_id(), Some("101"));
    }

    #[test]
    fn output_links_attach_at_most_once() {
        let mut rec = record();
        rec.attach_retrieved(FolderId("F1".into()));
        rec.attach_retrieved(FolderId("F2".into()));
        assert_eq!(rec.retrieved(), Some(&FolderId("F1".into())));

        rec.attach_remote_stash(StashRecord::Folder {
            target_basepath: "/stash/ab".into(),
            source_list: vec!["out.log".into()],
        });
        rec.attach_remote_stash(StashRecord::Folder {
            target_basepath: "/stash/cd".into(),
            source_list: vec![],
        });
        match rec.remote_stash() {
            Some(StashRecord::Folder { target_basepath, .. }) => {
                assert_eq!(target_basepath, "/stash/ab");
            }
            other => panic!("unexpected stash record: {other:?}"),
        }
    }

    #[test]
    fn retrieved_label_falls_back_to_default() {
        let mut rec = record();
        assert_eq!(rec.retrieved_link_label(), DEFAULT_RETRIEVED_LABEL);
        rec.options.retrieved_link_label = Some("outputs".into());
        assert_eq!(rec.retrieved_link_label(), "outputs");
    }

    #[test]
    fn record_round_trips_through_serde() {
        let mut rec = record();
        rec.set_remote_workdir("/scratch/u/ab/cd/rest".into());
        rec.attach_remote_folder(RemoteFolder {
            computer_id: "hpc1".into(),
            path: "/scratch/u/ab/cd/rest".into(),
        });
        let json = serde_json::to_string(&rec).unwrap();
        let back: CalculationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
