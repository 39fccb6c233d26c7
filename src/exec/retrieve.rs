// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Retrieve stage: pulls the job's outputs back from the remote working
//! directory. Permanent outputs are staged into a local sandbox and
//! persisted as one output folder in a single pass; temporary outputs land
//! in a caller-owned ephemeral directory and never enter the record storage.

use std::path::Path;

use crate::errors::{ExecError, ExecResult};
use crate::jobspec::RetrieveEntry;
use crate::logging::CalcScope;
use crate::ports::repository::{FolderId, Repository};
use crate::ports::transport::Transport;
use crate::record::CalculationRecord;
use crate::util::remote_path::{basename, has_glob, join_remote, relative_to, retained_suffix};

/// Retrieve the calculation's outputs. Returns the identifier of the
/// persisted output folder, or `None` when the stage had already completed.
pub async fn retrieve(
    record: &mut CalculationRecord,
    transport: &dyn Transport,
    repository: &dyn Repository,
    temp_dir: &Path,
) -> ExecResult<Option<FolderId>> {
    let scope = CalcScope::new(record.uuid());

    if let Some(folder) = record.retrieved() {
        log::info!("{scope}: outputs already retrieved as {}, nothing to do", folder.0);
        return Ok(None);
    }

    let workdir = record
        .remote_workdir()
        .ok_or_else(|| {
            ExecError::Configuration(
                "cannot retrieve a calculation without a remote working directory".to_string(),
            )
        })?
        .to_string();
    let permanent = record.retrieve_list().to_vec();
    let temporary = record.retrieve_temporary_list().to_vec();
    log::debug!("{scope}: retrieving outputs from {workdir}");

    let staging = tempfile::tempdir()?;
    retrieve_files_from_list(transport, &workdir, &permanent, staging.path(), &scope).await?;
    if !temporary.is_empty() {
        retrieve_files_from_list(transport, &workdir, &temporary, temp_dir, &scope).await?;
    }

    let folder = repository
        .put_folder(record.uuid(), record.retrieved_link_label(), staging.path())
        .await?;
    record.attach_retrieved(folder.clone());
    log::info!("{scope}: retrieved outputs stored as {}", folder.0);
    Ok(Some(folder))
}

/// Stage the remote paths described by `entries` into `dest`.
///
/// Bare entries resolve against the working directory unless absolute, are
/// glob-expanded when they contain wildcard characters, and keep only their
/// base name locally. Nested entries glob-expand their pattern and keep the
/// depth-derived suffix of each match's relative path under the entry's
/// target directory. Missing remote sources are tolerated silently in both
/// forms.
pub(crate) async fn retrieve_files_from_list(
    transport: &dyn Transport,
    workdir: &str,
    entries: &[RetrieveEntry],
    dest: &Path,
    scope: &CalcScope,
) -> ExecResult<()> {
    tokio::fs::create_dir_all(dest).await?;
    for entry in entries {
        match entry {
            RetrieveEntry::Path(path) => {
                let absolute = path.starts_with('/');
                let remotes = if has_glob(path) {
                    let pattern = if absolute {
                        path.clone()
                    } else {
                        join_remote(workdir, path)
                    };
                    transport.glob(&pattern).await?
                } else if absolute {
                    vec![path.clone()]
                } else {
                    vec![join_remote(workdir, path)]
                };
                for remote in remotes {
                    let local = dest.join(basename(&remote));
                    log::debug!("{scope}: retrieving {remote} to {}", local.display());
                    transport.get(&remote, &local, true).await?;
                }
            }
            RetrieveEntry::Nested {
                pattern,
                target,
                depth,
            } => {
                let remotes = if has_glob(pattern) {
                    transport.glob(&join_remote(workdir, pattern)).await?
                } else {
                    vec![join_remote(workdir, pattern)]
                };
                for remote in remotes {
                    let Some(rel) = relative_to(&remote, workdir) else {
                        continue;
                    };
                    let suffix = retained_suffix(rel, *depth);
                    let mut local = dest.to_path_buf();
                    if !target.is_empty() && target != "." {
                        local.push(target);
                    }
                    local.push(&suffix);
                    if let Some(parent) = local.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    log::debug!("{scope}: retrieving {remote} to {}", local.display());
                    transport.get(&remote, &local, true).await?;
                }
            }
        }
    }
    Ok(())
}
