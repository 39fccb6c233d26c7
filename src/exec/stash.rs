// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Stash stage: moves or archives selected working-directory files into a
//! durable stash location after the job has run. Each strategy maps the
//! stash options to exactly one persisted stash record; which strategy runs
//! is an exhaustive match over the closed set of modes, so a new mode is a
//! compile error here rather than a silently skipped branch.

use crate::errors::{ExecError, ExecResult};
use crate::logging::CalcScope;
use crate::ports::transport::{CompressFormat, Transport, TransportError};
use crate::record::{CalcKind, CalculationRecord, StashMode, StashOptions, StashRecord};
use crate::util::remote_path::{has_glob, join_remote, normalize_rel, relative_to, shard_uuid};

/// Stash the calculation's working-directory files according to its stash
/// options. A record that already carries a stash link is left untouched.
pub async fn stash(record: &mut CalculationRecord, transport: &dyn Transport) -> ExecResult<()> {
    let scope = CalcScope::new(record.uuid());

    if record.remote_stash().is_some() {
        log::info!("{scope}: stash output already exists, nothing to do");
        return Ok(());
    }
    let Some(options) = record.options().stash.clone() else {
        log::warn!("{scope}: no stash options defined, skipping");
        return Ok(());
    };
    let workdir = record
        .remote_workdir()
        .ok_or_else(|| {
            ExecError::Configuration(
                "cannot stash a calculation without a remote working directory".to_string(),
            )
        })?
        .to_string();
    let target_root = join_remote(&options.target_base, &shard_uuid(&record.uuid()));

    let created = match options.mode {
        StashMode::Copy => {
            stash_by_copy(transport, &workdir, &target_root, &options, &scope).await?;
            Some(StashRecord::Folder {
                target_basepath: target_root.clone(),
                source_list: options.source_list.clone(),
            })
        }
        StashMode::CompressTar => {
            stash_by_compression(transport, &workdir, &target_root, CompressFormat::Tar, &options, &scope).await
        }
        StashMode::CompressTarGz => {
            stash_by_compression(transport, &workdir, &target_root, CompressFormat::TarGz, &options, &scope).await
        }
        StashMode::CompressTarBz2 => {
            stash_by_compression(transport, &workdir, &target_root, CompressFormat::TarBz2, &options, &scope).await
        }
        StashMode::CompressTarXz => {
            stash_by_compression(transport, &workdir, &target_root, CompressFormat::TarXz, &options, &scope).await
        }
        StashMode::SubmitCustomCode => {
            stash_by_custom_code(record.kind(), &options, &target_root, &scope)
        }
    };

    if let Some(stash_record) = created {
        record.attach_remote_stash(stash_record);
        log::info!("{scope}: stashed working directory files under {target_root}");
    }
    Ok(())
}

/// Expand a source list against a remote base directory. Glob entries are
/// expanded remotely; every returned pair is `(absolute source, path
/// relative to the base)`, the relative part being what gets re-anchored
/// under the stash target.
pub(crate) async fn expand_source_list(
    transport: &dyn Transport,
    base: &str,
    source_list: &[String],
) -> ExecResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in source_list {
        if has_glob(entry) {
            let pattern = join_remote(base, entry);
            for matched in transport.glob(&pattern).await? {
                let Some(rel) = relative_to(&matched, base).map(str::to_string) else {
                    continue;
                };
                out.push((matched, rel));
            }
        } else {
            out.push((join_remote(base, entry), normalize_rel(entry)));
        }
    }
    Ok(out)
}

/// Copy each source into the stash target, preserving relative paths. Any
/// failure other than a tolerated missing source removes the partially
/// written target subtree and is fatal.
async fn stash_by_copy(
    transport: &dyn Transport,
    workdir: &str,
    target_root: &str,
    options: &StashOptions,
    scope: &CalcScope,
) -> ExecResult<()> {
    let sources = expand_source_list(transport, workdir, &options.source_list)
        .await
        .map_err(|err| ExecError::Stashing(format!("failed to expand stash sources: {err}")))?;

    transport
        .makedirs(target_root, true)
        .await
        .map_err(|err| ExecError::Stashing(format!("failed to create {target_root}: {err}")))?;

    for (source, rel) in &sources {
        let dest = join_remote(target_root, rel);
        if let Some((parent, _)) = rel.rsplit_once('/') {
            if let Err(err) = transport.makedirs(&join_remote(target_root, parent), true).await {
                return cleanup_and_fail(transport, target_root, source, &dest, err, scope).await;
            }
        }
        match transport.copy(source, &dest).await {
            Ok(()) => {}
            Err(TransportError::NotFound(path)) if !options.fail_on_missing => {
                log::warn!("{scope}: stash source {path} does not exist, skipping");
            }
            Err(err) => {
                return cleanup_and_fail(transport, target_root, source, &dest, err, scope).await;
            }
        }
    }
    Ok(())
}

async fn cleanup_and_fail(
    transport: &dyn Transport,
    target_root: &str,
    source: &str,
    dest: &str,
    err: TransportError,
    scope: &CalcScope,
) -> ExecResult<()> {
    if let Err(cleanup) = transport.rmtree(target_root).await {
        log::warn!("{scope}: could not remove partial stash target {target_root}: {cleanup}");
    }
    Err(ExecError::Stashing(format!(
        "failed to stash {source} to {dest}: {err}"
    )))
}

/// Archive the sources into a single file next to where the copy mode would
/// have placed its folder. A failure here is logged but never raised, so the
/// calculation does not bounce through the caller's retry policy; the
/// missing stash link is what signals the stash never happened.
async fn stash_by_compression(
    transport: &dyn Transport,
    workdir: &str,
    target_root: &str,
    format: CompressFormat,
    options: &StashOptions,
    scope: &CalcScope,
) -> Option<StashRecord> {
    let dest = format!("{target_root}.{}", format.extension());
    match try_compress(transport, workdir, &dest, format, options).await {
        Ok(()) => Some(StashRecord::Compressed {
            target: dest,
            source_list: options.source_list.clone(),
            format,
        }),
        Err(err) => {
            log::warn!("{scope}: could not compress stash into {dest}: {err}");
            None
        }
    }
}

async fn try_compress(
    transport: &dyn Transport,
    workdir: &str,
    dest: &str,
    format: CompressFormat,
    options: &StashOptions,
) -> ExecResult<()> {
    let sources = expand_source_list(transport, workdir, &options.source_list).await?;
    let absolute: Vec<String> = sources.into_iter().map(|(source, _)| source).collect();
    if let Some((parent, _)) = dest.rsplit_once('/') {
        transport.makedirs(parent, true).await?;
    }
    transport
        .compress(format, &absolute, dest, workdir, false, options.dereference)
        .await?;
    Ok(())
}

/// The submitted job performs the stashing itself; this strategy only
/// records where the files end up. Valid only for a dedicated stash job.
fn stash_by_custom_code(
    kind: CalcKind,
    options: &StashOptions,
    target_root: &str,
    scope: &CalcScope,
) -> Option<StashRecord> {
    if kind != CalcKind::Stash {
        log::warn!(
            "{scope}: stash mode submit_custom_code is only valid for a dedicated stash job, \
             skipping"
        );
        return None;
    }
    Some(StashRecord::Folder {
        target_basepath: target_root.to_string(),
        source_list: options.source_list.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{record_with_workdir, LocalTransport};
    use crate::record::{CalcKind, StashMode, StashOptions, StashRecord};
    use std::fs;

    fn stash_options(target_base: &str, mode: StashMode) -> StashOptions {
        StashOptions {
            mode,
            source_list: vec!["out.log".into(), "data/*.dat".into()],
            target_base: target_base.into(),
            dereference: false,
            fail_on_missing: false,
        }
    }

    fn populate_workdir(workdir: &std::path::Path) {
        fs::create_dir_all(workdir.join("data")).unwrap();
        fs::write(workdir.join("out.log"), "log").unwrap();
        fs::write(workdir.join("data/a.dat"), "a").unwrap();
        fs::write(workdir.join("data/b.dat"), "b").unwrap();
    }

    #[tokio::test]
    async fn copy_mode_reanchors_sources_under_sharded_target() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        populate_workdir(&workdir);
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(stash_options(&target_base.to_string_lossy(), StashMode::Copy));
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();

        let shard = shard_uuid(&record.uuid());
        let root = target_base.join(&shard);
        assert!(root.join("out.log").is_file());
        assert!(root.join("data/a.dat").is_file());
        assert!(root.join("data/b.dat").is_file());
        match record.remote_stash() {
            Some(StashRecord::Folder { target_basepath, source_list }) => {
                assert!(target_basepath.ends_with(&shard));
                assert_eq!(source_list.len(), 2);
            }
            other => panic!("unexpected stash record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stash_is_gated_by_the_existing_link() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        populate_workdir(&workdir);
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(stash_options(&target_base.to_string_lossy(), StashMode::Copy));
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();
        let writes = transport.write_op_count();
        stash(&mut record, &transport).await.unwrap();
        assert_eq!(transport.write_op_count(), writes);
    }

    #[tokio::test]
    async fn copy_mode_failure_cleans_up_and_raises() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        populate_workdir(&workdir);
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        let mut stash_opts = stash_options(&target_base.to_string_lossy(), StashMode::Copy);
        stash_opts.fail_on_missing = true;
        options.stash = Some(stash_opts);
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        transport.fail_copy_of(workdir.join("data/b.dat").to_string_lossy().as_ref());

        let err = stash(&mut record, &transport).await.unwrap_err();
        assert!(matches!(err, ExecError::Stashing(_)));
        assert!(record.remote_stash().is_none());
        // The partially written shard leaf is gone.
        let root = target_base.join(shard_uuid(&record.uuid()));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn copy_mode_missing_source_raises_when_not_tolerated() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        fs::create_dir_all(&workdir).unwrap();
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(StashOptions {
            mode: StashMode::Copy,
            source_list: vec!["missing.log".into()],
            target_base: target_base.to_string_lossy().into_owned(),
            dereference: false,
            fail_on_missing: true,
        });
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        let err = stash(&mut record, &transport).await.unwrap_err();
        assert!(matches!(err, ExecError::Stashing(_)));
    }

    #[tokio::test]
    async fn copy_mode_missing_source_skipped_when_tolerated() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("out.log"), "log").unwrap();
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(StashOptions {
            mode: StashMode::Copy,
            source_list: vec!["out.log".into(), "missing.log".into()],
            target_base: target_base.to_string_lossy().into_owned(),
            dereference: false,
            fail_on_missing: false,
        });
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();
        assert!(record.remote_stash().is_some());
        let root = target_base.join(shard_uuid(&record.uuid()));
        assert!(root.join("out.log").is_file());
        assert!(!root.join("missing.log").exists());
    }

    #[tokio::test]
    async fn compression_failure_is_silent_and_links_nothing() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        populate_workdir(&workdir);
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(stash_options(
            &target_base.to_string_lossy(),
            StashMode::CompressTarGz,
        ));
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        transport.fail_compression();

        stash(&mut record, &transport).await.unwrap();
        assert!(record.remote_stash().is_none());
        let dest = target_base.join(format!("{}.tar.gz", shard_uuid(&record.uuid())));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn compression_success_links_a_compressed_record() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        populate_workdir(&workdir);
        let target_base = env.path().join("stash");

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(stash_options(
            &target_base.to_string_lossy(),
            StashMode::CompressTarGz,
        ));
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();

        let dest = target_base.join(format!("{}.tar.gz", shard_uuid(&record.uuid())));
        assert!(dest.is_file());
        match record.remote_stash() {
            Some(StashRecord::Compressed { target, format, .. }) => {
                assert!(target.ends_with(".tar.gz"));
                assert_eq!(*format, CompressFormat::TarGz);
            }
            other => panic!("unexpected stash record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_code_mode_is_a_noop_for_ordinary_calculations() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        fs::create_dir_all(&workdir).unwrap();

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(StashOptions {
            mode: StashMode::SubmitCustomCode,
            source_list: vec!["out.log".into()],
            target_base: env.path().join("stash").to_string_lossy().into_owned(),
            dereference: false,
            fail_on_missing: false,
        });
        let mut record = record.with_options(options);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();
        assert!(record.remote_stash().is_none());
    }

    #[tokio::test]
    async fn custom_code_mode_links_for_a_dedicated_stash_job() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        fs::create_dir_all(&workdir).unwrap();

        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(StashOptions {
            mode: StashMode::SubmitCustomCode,
            source_list: vec!["out.log".into()],
            target_base: env.path().join("stash").to_string_lossy().into_owned(),
            dereference: false,
            fail_on_missing: false,
        });
        let mut record = record.with_options(options).with_kind(CalcKind::Stash);

        let transport = LocalTransport::new();
        stash(&mut record, &transport).await.unwrap();
        assert!(matches!(record.remote_stash(), Some(StashRecord::Folder { .. })));
    }
}
