// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::record::StashRecord;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("stored node not found: {0}")]
    NodeNotFound(String),

    #[error("repository I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Identifier of a persisted output folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderId(pub String);

/// Kind of a node reachable through provenance links, as far as the unstash
/// anchor walk cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Calculation,
    StashJob,
    Data,
}

/// One incoming provenance link of a stored node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceLink {
    /// Identifier of the node on the source side of the link.
    pub source: String,
    pub kind: NodeKind,
    /// Remote path the source node points at, when it is remote data.
    pub remote_path: Option<String>,
}

#[async_trait]
/// Provenance and record storage boundary. The lifecycle core only ever
/// creates content through `put_file`/`put_folder`; link bookkeeping on the
/// calculation record itself stays in [`crate::record::CalculationRecord`].
pub trait Repository: Send + Sync {
    /// Persist one file from the local sandbox into the calculation's
    /// permanent record storage under `rel_path`.
    async fn put_file(&self, calc: Uuid, rel_path: &str, local: &Path) -> RepositoryResult<()>;

    /// Persist a staged directory tree as a single output folder in one
    /// pass; returns the identifier of the new folder.
    async fn put_folder(&self, calc: Uuid, label: &str, root: &Path) -> RepositoryResult<FolderId>;

    /// Stage the file or tree stored under `rel_path` of an already-stored
    /// node into the local path `dest`.
    async fn export_node(&self, node: &str, rel_path: &str, dest: &Path) -> RepositoryResult<()>;

    /// Load the stash metadata persisted for a stash node.
    async fn load_stash(&self, node: &str) -> RepositoryResult<StashRecord>;

    /// Snapshot of the incoming provenance links of a node. Fetched once per
    /// node by the unstash anchor walk.
    async fn incoming_links(&self, node: &str) -> RepositoryResult<Vec<ProvenanceLink>>;
}
