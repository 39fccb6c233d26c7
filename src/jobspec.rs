// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// The three sources a job's input files are drawn from. The upload stage
/// executes them in the order the spec requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyPhase {
    Sandbox,
    Local,
    Remote,
}

/// Default phase order: remote artifacts first so that locally rendered
/// inputs win when paths collide.
pub const DEFAULT_COPY_ORDER: [CopyPhase; 3] =
    [CopyPhase::Remote, CopyPhase::Local, CopyPhase::Sandbox];

/// A file or tree drawn from the repository of another stored node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCopyItem {
    pub source_node: String,
    pub source_rel_path: String,
    pub target_rel_path: String,
}

/// A file or tree already on a remote machine, copied or symlinked into the
/// working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCopyItem {
    pub computer_id: String,
    pub source_abs_path: String,
    pub target_rel_path: String,
}

/// One entry of a retrieve list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrieveEntry {
    /// Bare path or glob, resolved against the remote working directory
    /// unless absolute; staged locally under its base name.
    Path(String),
    /// Glob pattern whose matches are staged under `target`, keeping the
    /// last `depth` directory levels of each match (`None` keeps the full
    /// relative path, `Some(0)` flattens to the base name).
    Nested {
        pattern: String,
        target: String,
        depth: Option<u32>,
    },
}

/// How a code's payload reaches the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePayload {
    /// A single executable that already lives on the remote machine; nothing
    /// is staged.
    Remote { executable: String },
    /// A small local file tree copied wholesale into the working directory;
    /// `entry_point` is made executable afterwards.
    Portable { root: PathBuf, entry_point: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    pub label: String,
    pub payload: CodePayload,
}

/// Everything the upload stage needs to know about one prepared job, produced
/// upstream by the input generation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub uuid: Uuid,
    pub codes: Vec<CodeInfo>,
    pub local_copy_list: Vec<LocalCopyItem>,
    pub remote_copy_list: Vec<RemoteCopyItem>,
    pub remote_symlink_list: Vec<RemoteCopyItem>,
    /// Sandbox paths (files or whole directories) that must not end up in
    /// the permanent record storage.
    pub provenance_exclude_list: Vec<String>,
    pub retrieve_list: Vec<RetrieveEntry>,
    pub retrieve_temporary_list: Vec<RetrieveEntry>,
    pub file_copy_operation_order: Vec<CopyPhase>,
}

impl JobSpec {
    /// A spec with empty copy and retrieve lists and the default phase order.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            codes: Vec::new(),
            local_copy_list: Vec::new(),
            remote_copy_list: Vec::new(),
            remote_symlink_list: Vec::new(),
            provenance_exclude_list: Vec::new(),
            retrieve_list: Vec::new(),
            retrieve_temporary_list: Vec::new(),
            file_copy_operation_order: DEFAULT_COPY_ORDER.to_vec(),
        }
    }
}
