// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Upload stage: stages all inputs of a prepared job into a sharded remote
//! working directory. Safe to re-invoke after a crash at any point: the
//! `remote_folder` output link gates the whole stage, and a half-written
//! working directory left behind by a previous attempt is archived, never
//! reused.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::{ExecError, ExecResult};
use crate::jobspec::{CodePayload, CopyPhase, JobSpec};
use crate::logging::CalcScope;
use crate::ports::repository::Repository;
use crate::ports::transport::{Transport, TransportError};
use crate::record::{CalculationRecord, RemoteFolder};
use crate::util::remote_path::{join_remote, normalize_rel, shard_uuid, LOST_FOUND_DIR};

/// Manifest files written into the sandbox instead of performing transport
/// I/O when uploading in dry-run mode.
pub const DRY_RUN_SANDBOX_MANIFEST: &str = "_dry_run_sandbox_copy.txt";
pub const DRY_RUN_REMOTE_MANIFEST: &str = "_dry_run_remote_copy.txt";

const EXECUTABLE_MODE: u32 = 0o755;

/// Stage all inputs of `spec` into the calculation's remote working
/// directory and persist the sandbox contents into the permanent record
/// storage.
///
/// Returns the handle to the freshly created working directory, or `None`
/// when the stage had already completed (idempotent re-entry) or when
/// running in dry-run mode, where the sandbox itself plays the role of the
/// working directory and no record state is touched.
pub async fn upload(
    record: &mut CalculationRecord,
    transport: &dyn Transport,
    repository: &dyn Repository,
    spec: &JobSpec,
    sandbox: &Path,
    dry_run: bool,
) -> ExecResult<Option<RemoteFolder>> {
    let scope = CalcScope::new(record.uuid());

    if let Some(folder) = record.remote_folder() {
        log::info!(
            "{scope}: remote working directory {} already uploaded, nothing to do",
            folder.path
        );
        return Ok(None);
    }

    let workdir = if dry_run {
        sandbox.to_string_lossy().into_owned()
    } else {
        derive_remote_workdir(record, transport, &scope).await?
    };
    log::debug!("{scope}: working directory is {workdir}");

    if !dry_run {
        stage_portable_codes(transport, spec, &workdir, &scope).await?;
    }

    for phase in &spec.file_copy_operation_order {
        match phase {
            CopyPhase::Sandbox => {
                copy_sandbox_files(transport, sandbox, &workdir, dry_run, &scope).await?;
            }
            CopyPhase::Local => {
                copy_local_files(repository, transport, spec, sandbox, &workdir, dry_run, &scope)
                    .await?;
            }
            CopyPhase::Remote => {
                copy_remote_files(record, transport, spec, sandbox, &workdir, dry_run, &scope)
                    .await?;
            }
        }
    }

    if dry_run {
        log::info!("{scope}: dry run staged into {}", sandbox.display());
        return Ok(None);
    }

    persist_sandbox_files(record, repository, spec, sandbox, &scope).await?;

    record.set_retrieve_lists(
        spec.retrieve_list.clone(),
        spec.retrieve_temporary_list.clone(),
    );
    record.set_remote_workdir(workdir.clone());
    let handle = RemoteFolder {
        computer_id: record.computer().id.clone(),
        path: workdir,
    };
    record.attach_remote_folder(handle.clone());
    log::info!("{scope}: upload complete, working directory {}", handle.path);
    Ok(Some(handle))
}

/// Resolve a computer's templated base directory against the remote login
/// name. Fails when the template is, or resolves to, a blank path.
pub(crate) async fn resolve_base_dir(
    computer: &crate::record::Computer,
    transport: &dyn Transport,
) -> ExecResult<String> {
    let template = computer.workdir.trim();
    if template.is_empty() {
        return Err(ExecError::Configuration(format!(
            "computer '{}' does not define a remote working directory",
            computer.label
        )));
    }
    let base = if template.contains("{username}") {
        let username = transport.whoami().await?;
        template.replace("{username}", &username)
    } else {
        template.to_string()
    };
    if base.trim().is_empty() {
        return Err(ExecError::Configuration(format!(
            "remote working directory of computer '{}' resolved to an empty path",
            computer.label
        )));
    }
    Ok(base)
}

/// Resolve the computer's base directory template, make sure it exists, and
/// carve out a fresh sharded leaf for this calculation. A leaf left behind
/// by a crashed earlier attempt is moved wholesale into
/// `lost+found/<uuid>` so that no remote data is ever lost.
async fn derive_remote_workdir(
    record: &CalculationRecord,
    transport: &dyn Transport,
    scope: &CalcScope,
) -> ExecResult<String> {
    let base = resolve_base_dir(record.computer(), transport).await?;

    if !transport.path_exists(&base).await? {
        log::debug!("{scope}: creating base directory {base}");
        transport.makedirs(&base, true).await?;
    }

    let leaf = join_remote(&base, &shard_uuid(&record.uuid()));
    if transport.path_exists(&leaf).await? {
        let lost_found = join_remote(&base, LOST_FOUND_DIR);
        let archive = join_remote(&lost_found, &record.uuid().to_string());
        log::warn!(
            "{scope}: working directory {leaf} already exists, moving its contents to {archive}"
        );
        transport.makedirs(&lost_found, true).await?;
        transport.copy(&leaf, &archive).await?;
        transport.rmtree(&leaf).await?;
    }
    transport.makedirs(&leaf, false).await?;
    Ok(leaf)
}

/// Copy the file trees of portable codes into the working directory and mark
/// their entry points executable. Codes living on the remote machine stage
/// nothing.
async fn stage_portable_codes(
    transport: &dyn Transport,
    spec: &JobSpec,
    workdir: &str,
    scope: &CalcScope,
) -> ExecResult<()> {
    for code in &spec.codes {
        let CodePayload::Portable { root, entry_point } = &code.payload else {
            continue;
        };
        log::debug!("{scope}: staging code '{}' from {}", code.label, root.display());
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from).map_err(ExecError::Io)?;
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let remote = join_remote(workdir, &path_to_slash(rel));
            if entry.file_type().is_dir() {
                transport.makedirs(&remote, true).await?;
            } else {
                transport.put(entry.path(), &remote).await?;
            }
        }
        transport
            .chmod(&join_remote(workdir, entry_point), EXECUTABLE_MODE)
            .await?;
    }
    Ok(())
}

/// Upload the locally rendered sandbox wholesale. In a real run an entry
/// that already exists remotely is left alone; in a dry run the sandbox is
/// the working directory, so only a manifest of what would have been
/// uploaded is written.
async fn copy_sandbox_files(
    transport: &dyn Transport,
    sandbox: &Path,
    workdir: &str,
    dry_run: bool,
    scope: &CalcScope,
) -> ExecResult<()> {
    if dry_run {
        let mut lines = Vec::new();
        for (_, rel) in sandbox_files(sandbox)? {
            lines.push(format!("would have uploaded {rel} to {workdir}"));
        }
        write_manifest(sandbox, DRY_RUN_SANDBOX_MANIFEST, &lines).await?;
        return Ok(());
    }

    for entry in WalkDir::new(sandbox).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from).map_err(ExecError::Io)?;
        let Ok(rel) = entry.path().strip_prefix(sandbox) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let remote = join_remote(workdir, &path_to_slash(rel));
        if entry.file_type().is_dir() {
            transport.makedirs(&remote, true).await?;
        } else if transport.path_exists(&remote).await? {
            log::debug!("{scope}: {} already staged, skipping", rel.display());
        } else {
            transport.put(entry.path(), &remote).await?;
        }
    }
    Ok(())
}

/// Stage files out of other stored nodes' repositories, through a temporary
/// local directory, into the working directory.
async fn copy_local_files(
    repository: &dyn Repository,
    transport: &dyn Transport,
    spec: &JobSpec,
    sandbox: &Path,
    workdir: &str,
    dry_run: bool,
    scope: &CalcScope,
) -> ExecResult<()> {
    for item in &spec.local_copy_list {
        log::debug!(
            "{scope}: staging {} of node {} to {}",
            item.source_rel_path,
            item.source_node,
            item.target_rel_path
        );
        let staging = tempfile::tempdir()?;
        let staged = staging.path().join("payload");
        repository
            .export_node(&item.source_node, &item.source_rel_path, &staged)
            .await?;

        if dry_run {
            // The working directory is the sandbox; stage with local I/O only.
            let dest = sandbox.join(&item.target_rel_path);
            copy_local_tree(&staged, &dest).await?;
            continue;
        }

        let target = join_remote(workdir, &item.target_rel_path);
        let staged_meta = tokio::fs::metadata(&staged).await?;
        if staged_meta.is_file() && transport.is_dir(&target).await? {
            return Err(TransportError::InvalidArgument(format!(
                "cannot copy file {} of node {} onto existing remote directory {target}",
                item.source_rel_path, item.source_node
            ))
            .into());
        }
        let rel = normalize_rel(&item.target_rel_path);
        if let Some((parent, _)) = rel.rsplit_once('/') {
            transport.makedirs(&join_remote(workdir, parent), true).await?;
        }
        transport.put(&staged, &target).await?;
    }
    Ok(())
}

/// Copy or symlink files that already live on the remote machine. A missing
/// copy source is logged and skipped; any other failure aborts the stage.
async fn copy_remote_files(
    record: &CalculationRecord,
    transport: &dyn Transport,
    spec: &JobSpec,
    sandbox: &Path,
    workdir: &str,
    dry_run: bool,
    scope: &CalcScope,
) -> ExecResult<()> {
    if dry_run {
        let mut lines = Vec::new();
        for item in &spec.remote_copy_list {
            lines.push(format!(
                "would have copied {}:{} to {}",
                item.computer_id, item.source_abs_path, item.target_rel_path
            ));
        }
        for item in &spec.remote_symlink_list {
            lines.push(format!(
                "would have created symlink {}:{} at {}",
                item.computer_id, item.source_abs_path, item.target_rel_path
            ));
        }
        write_manifest(sandbox, DRY_RUN_REMOTE_MANIFEST, &lines).await?;
        return Ok(());
    }

    let computer_id = &record.computer().id;
    for item in &spec.remote_copy_list {
        if &item.computer_id != computer_id {
            return Err(ExecError::Unsupported(format!(
                "remote copy from computer '{}' to computer '{computer_id}' is not implemented",
                item.computer_id
            )));
        }
        if crate::util::remote_path::has_glob(&item.source_abs_path) {
            let matches = transport.glob(&item.source_abs_path).await?;
            if matches.is_empty() {
                log::warn!(
                    "{scope}: remote copy pattern {} matched nothing, skipping",
                    item.source_abs_path
                );
                continue;
            }
            let dir = join_remote(workdir, &item.target_rel_path);
            transport.makedirs(&dir, true).await?;
            for matched in matches {
                let target = join_remote(&dir, crate::util::remote_path::basename(&matched));
                copy_tolerating_missing(transport, &matched, &target, scope).await?;
            }
        } else {
            let target = join_remote(workdir, &item.target_rel_path);
            ensure_remote_parent(transport, workdir, &item.target_rel_path).await?;
            copy_tolerating_missing(transport, &item.source_abs_path, &target, scope).await?;
        }
    }
    for item in &spec.remote_symlink_list {
        if &item.computer_id != computer_id {
            return Err(ExecError::Unsupported(format!(
                "remote symlink from computer '{}' to computer '{computer_id}' is not supported",
                item.computer_id
            )));
        }
        let target = join_remote(workdir, &item.target_rel_path);
        ensure_remote_parent(transport, workdir, &item.target_rel_path).await?;
        transport.symlink(&item.source_abs_path, &target).await?;
    }
    Ok(())
}

/// Persist every sandbox file into the calculation's permanent record
/// storage, except paths excluded from provenance. Exclusion entries and
/// sandbox paths are normalized before comparison, and an entry naming a
/// directory excludes everything below it.
async fn persist_sandbox_files(
    record: &CalculationRecord,
    repository: &dyn Repository,
    spec: &JobSpec,
    sandbox: &Path,
    scope: &CalcScope,
) -> ExecResult<()> {
    let exclude: Vec<String> = spec
        .provenance_exclude_list
        .iter()
        .map(|entry| normalize_rel(entry))
        .collect();
    for (path, rel) in sandbox_files(sandbox)? {
        if is_excluded(&rel, &exclude) {
            log::debug!("{scope}: {rel} excluded from permanent storage");
            continue;
        }
        repository.put_file(record.uuid(), &rel, &path).await?;
    }
    Ok(())
}

/// Remote-to-remote copy where a missing source is only worth a warning;
/// every other failure aborts the upload.
async fn copy_tolerating_missing(
    transport: &dyn Transport,
    source: &str,
    target: &str,
    scope: &CalcScope,
) -> ExecResult<()> {
    match transport.copy(source, target).await {
        Ok(()) => Ok(()),
        Err(TransportError::NotFound(path)) => {
            log::warn!("{scope}: could not copy {path}: it does not exist, skipping");
            Ok(())
        }
        Err(err) => {
            log::error!("{scope}: remote copy of {source} to {target} failed, aborting upload");
            Err(err.into())
        }
    }
}

fn is_excluded(rel: &str, exclude: &[String]) -> bool {
    exclude
        .iter()
        .any(|entry| rel == entry || rel.strip_prefix(entry.as_str()).is_some_and(|rest| rest.starts_with('/')))
}

async fn ensure_remote_parent(
    transport: &dyn Transport,
    workdir: &str,
    target_rel: &str,
) -> ExecResult<()> {
    let rel = normalize_rel(target_rel);
    if let Some((parent, _)) = rel.rsplit_once('/') {
        transport.makedirs(&join_remote(workdir, parent), true).await?;
    }
    Ok(())
}

/// All regular files in the sandbox as `(absolute path, slash-form relative
/// path)`, in a stable order, skipping dry-run manifests.
fn sandbox_files(sandbox: &Path) -> ExecResult<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(sandbox).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from).map_err(ExecError::Io)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(sandbox) else {
            continue;
        };
        let rel = path_to_slash(rel);
        if rel == DRY_RUN_SANDBOX_MANIFEST || rel == DRY_RUN_REMOTE_MANIFEST {
            continue;
        }
        out.push((entry.path().to_path_buf(), rel));
    }
    Ok(out)
}

async fn write_manifest(sandbox: &Path, name: &str, lines: &[String]) -> ExecResult<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    tokio::fs::write(sandbox.join(name), content).await?;
    Ok(())
}

/// Copy a staged file or tree with local I/O only (dry-run staging).
async fn copy_local_tree(src: &Path, dest: &Path) -> ExecResult<()> {
    let meta = tokio::fs::metadata(src).await?;
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dest).await?;
        return Ok(());
    }
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from).map_err(ExecError::Io)?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            tokio::fs::create_dir_all(&target).await?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(entry.path(), &target).await?;
        }
    }
    Ok(())
}

/// Convert a relative path to a forward-slash string.
fn path_to_slash(path: &Path) -> String {
    let mut out = String::new();
    for comp in path.components() {
        if let std::path::Component::Normal(os) = comp {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&os.to_string_lossy());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::is_excluded;

    #[test]
    fn exclusion_matches_files_and_parent_directories() {
        let exclude = vec!["scratch".to_string(), "sub/skip.txt".to_string()];
        assert!(is_excluded("scratch", &exclude));
        assert!(is_excluded("scratch/a/b.txt", &exclude));
        assert!(is_excluded("sub/skip.txt", &exclude));
        assert!(!is_excluded("sub/keep.txt", &exclude));
        assert!(!is_excluded("scratchier/file.txt", &exclude));
    }
}
