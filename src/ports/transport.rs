// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote source does not exist. Callers that tolerate missing files
    /// match on this variant; everything else is treated as fatal.
    #[error("remote path does not exist: {0}")]
    NotFound(String),

    #[error("invalid transport operation: {0}")]
    InvalidArgument(String),

    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Archive formats supported by `Transport::compress` / `Transport::extract`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl CompressFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CompressFormat::Tar => "tar",
            CompressFormat::TarGz => "tar.gz",
            CompressFormat::TarBz2 => "tar.bz2",
            CompressFormat::TarXz => "tar.xz",
        }
    }
}

#[async_trait]
/// Remote filesystem and shell boundary.
///
/// Every method is a suspension point; the lifecycle stages perform no other
/// I/O. Connection scoping and reuse throttling are the host's concern: a
/// stage receives a transport that is already usable and calls
/// `connect`/`disconnect` only when it owns the session for its whole
/// duration. Remote paths are `/`-separated strings; `put` and `get` copy
/// files or whole trees.
pub trait Transport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;
    async fn disconnect(&self) -> TransportResult<()>;

    async fn path_exists(&self, path: &str) -> TransportResult<bool>;

    /// Create `path` and any missing parents. With `ignore_existing` false it
    /// is an error if the final component already exists; existing parents
    /// are never an error.
    async fn makedirs(&self, path: &str, ignore_existing: bool) -> TransportResult<()>;

    /// Create a single directory whose parent must already exist.
    async fn mkdir(&self, path: &str) -> TransportResult<()>;

    async fn is_dir(&self, path: &str) -> TransportResult<bool>;
    async fn is_file(&self, path: &str) -> TransportResult<bool>;

    /// Remote-to-remote copy of a file or tree on the same machine.
    async fn copy(&self, src: &str, dst: &str) -> TransportResult<()>;

    /// Upload a local file or tree to the remote machine.
    async fn put(&self, local: &Path, remote: &str) -> TransportResult<()>;

    /// Download a remote file or tree. With `ignore_nonexisting` a missing
    /// remote source is a silent no-op.
    async fn get(&self, remote: &str, local: &Path, ignore_nonexisting: bool)
    -> TransportResult<()>;

    /// Expand a glob pattern against the remote filesystem. A pattern that
    /// matches nothing yields an empty list, not an error.
    async fn glob(&self, pattern: &str) -> TransportResult<Vec<String>>;

    async fn symlink(&self, src: &str, dst: &str) -> TransportResult<()>;
    async fn chmod(&self, path: &str, mode: u32) -> TransportResult<()>;

    /// Remove a file or directory tree.
    async fn rmtree(&self, path: &str) -> TransportResult<()>;

    /// Archive `sources` (absolute remote paths) into `dest`, with archive
    /// member names taken relative to `root_dir`.
    async fn compress(
        &self,
        format: CompressFormat,
        sources: &[String],
        dest: &str,
        root_dir: &str,
        overwrite: bool,
        dereference: bool,
    ) -> TransportResult<()>;

    /// Unpack the archive at `source` into the directory `dest`.
    async fn extract(
        &self,
        source: &str,
        dest: &str,
        overwrite: bool,
        strip_components: u32,
    ) -> TransportResult<()>;

    /// Login name on the remote machine, used to resolve templated base
    /// directories.
    async fn whoami(&self) -> TransportResult<String>;
}
