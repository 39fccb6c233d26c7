// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Unstash stage: brings previously stashed files back onto the machine,
//! either into the working directory they originally came from or into a
//! fresh sharded directory.

use std::collections::{HashSet, VecDeque};

use crate::errors::{ExecError, ExecResult};
use crate::exec::stash::expand_source_list;
use crate::exec::upload::resolve_base_dir;
use crate::logging::CalcScope;
use crate::ports::repository::{NodeKind, Repository};
use crate::ports::transport::{Transport, TransportError};
use crate::record::{CalculationRecord, StashRecord, UnstashTarget};
use crate::util::remote_path::{join_remote, shard_uuid};

/// Upper bound on the provenance walk that locates the original working
/// directory. The graph is acyclic in practice, but the walk must terminate
/// even on a malformed one.
const MAX_ANCHOR_DEPTH: usize = 32;

/// Restore stashed files according to the record's unstash options.
pub async fn unstash(
    record: &CalculationRecord,
    transport: &dyn Transport,
    repository: &dyn Repository,
) -> ExecResult<()> {
    let scope = CalcScope::new(record.uuid());

    let Some(options) = record.options().unstash.clone() else {
        log::warn!("{scope}: no unstash options defined, skipping");
        return Ok(());
    };

    let stash = repository.load_stash(&options.source_node).await?;

    // A compressed stash can only be restored in its entirety, so the
    // request must name exactly the sources that were archived.
    if let StashRecord::Compressed { source_list, .. } = &stash {
        if !same_sources(&options.source_list, source_list) {
            log::error!(
                "{scope}: requested sources {:?} do not match the stashed sources {:?}, \
                 not unstashing",
                options.source_list,
                source_list
            );
            return Ok(());
        }
    }

    let destination = match options.target_mode {
        UnstashTarget::OriginalPlace => {
            resolve_original_place(repository, &options.source_node).await?
        }
        UnstashTarget::NewRemoteData => {
            let base = resolve_base_dir(record.computer(), transport).await?;
            join_remote(&base, &shard_uuid(&record.uuid()))
        }
    };
    transport.makedirs(&destination, true).await?;

    match stash {
        StashRecord::Folder { target_basepath, .. } => {
            let sources =
                expand_source_list(transport, &target_basepath, &options.source_list).await?;
            for (source, rel) in &sources {
                let dest = join_remote(&destination, rel);
                if let Some((parent, _)) = rel.rsplit_once('/') {
                    transport
                        .makedirs(&join_remote(&destination, parent), true)
                        .await?;
                }
                match transport.copy(source, &dest).await {
                    Ok(()) => {}
                    Err(TransportError::NotFound(path)) => {
                        log::warn!("{scope}: stashed source {path} does not exist, skipping");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        StashRecord::Compressed { target, .. } => {
            transport.extract(&target, &destination, false, 0).await?;
        }
    }

    log::info!("{scope}: unstashed into {destination}");
    Ok(())
}

/// Find the working directory the stashed files originally came from by
/// walking incoming provenance links upward from the stash source. The walk
/// uses an explicit worklist over per-node snapshots and gives up with an
/// error once the depth bound is hit without finding an anchor: the first
/// node that is not itself a stash job and points at a remote path.
async fn resolve_original_place(
    repository: &dyn Repository,
    source_node: &str,
) -> ExecResult<String> {
    let mut queue: VecDeque<(String, usize)> = VecDeque::from([(source_node.to_string(), 0)]);
    let mut seen: HashSet<String> = HashSet::from([source_node.to_string()]);

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= MAX_ANCHOR_DEPTH {
            continue;
        }
        for link in repository.incoming_links(&node).await? {
            if link.kind != NodeKind::StashJob {
                if let Some(path) = link.remote_path {
                    return Ok(path);
                }
            }
            if seen.insert(link.source.clone()) {
                queue.push_back((link.source, depth + 1));
            }
        }
    }

    Err(ExecError::RemoteOperation(format!(
        "could not determine the original location of the files stashed in node {source_node}"
    )))
}

fn same_sources(requested: &[String], stashed: &[String]) -> bool {
    let mut requested: Vec<&String> = requested.iter().collect();
    let mut stashed: Vec<&String> = stashed.iter().collect();
    requested.sort();
    stashed.sort();
    requested == stashed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{record_with_workdir, LocalTransport, MemoryRepository};
    use crate::ports::repository::ProvenanceLink;
    use crate::ports::transport::CompressFormat;
    use crate::record::{StashMode, StashOptions, UnstashOptions};
    use std::fs;

    fn link(source: &str, kind: NodeKind, remote_path: Option<&str>) -> ProvenanceLink {
        ProvenanceLink {
            source: source.to_string(),
            kind,
            remote_path: remote_path.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn anchor_walk_skips_stash_jobs_and_finds_the_original_workdir() {
        let repository = MemoryRepository::new();
        repository.add_links("stash1", vec![link("stashjob", NodeKind::StashJob, None)]);
        repository.add_links(
            "stashjob",
            vec![link("rfolder", NodeKind::Data, Some("/original/workdir"))],
        );

        let place = resolve_original_place(&repository, "stash1").await.unwrap();
        assert_eq!(place, "/original/workdir");
    }

    #[tokio::test]
    async fn anchor_walk_without_anchor_is_an_error() {
        let repository = MemoryRepository::new();
        repository.add_links("stash1", vec![link("stashjob", NodeKind::StashJob, None)]);

        let err = resolve_original_place(&repository, "stash1").await.unwrap_err();
        assert!(matches!(err, ExecError::RemoteOperation(_)));
    }

    #[tokio::test]
    async fn folder_stash_is_copied_back_to_the_original_place() {
        let env = tempfile::tempdir().unwrap();
        let stash_root = env.path().join("stash/ab/cd/rest");
        fs::create_dir_all(stash_root.join("data")).unwrap();
        fs::write(stash_root.join("out.log"), "log").unwrap();
        fs::write(stash_root.join("data/a.dat"), "a").unwrap();
        let original = env.path().join("original");
        fs::create_dir_all(&original).unwrap();

        let repository = MemoryRepository::new();
        repository.add_stash(
            "stash1",
            StashRecord::Folder {
                target_basepath: stash_root.to_string_lossy().into_owned(),
                source_list: vec!["out.log".into(), "data/a.dat".into()],
            },
        );
        repository.add_links("stash1", vec![link("stashjob", NodeKind::StashJob, None)]);
        repository.add_links(
            "stashjob",
            vec![link(
                "rfolder",
                NodeKind::Data,
                Some(original.to_string_lossy().as_ref()),
            )],
        );

        let record = record_with_workdir(&original);
        let mut options = record.options().clone();
        options.unstash = Some(UnstashOptions {
            target_mode: UnstashTarget::OriginalPlace,
            source_node: "stash1".into(),
            source_list: vec!["out.log".into(), "data/a.dat".into()],
        });
        let record = record.with_options(options);

        let transport = LocalTransport::new();
        unstash(&record, &transport, &repository).await.unwrap();

        assert!(original.join("out.log").is_file());
        assert!(original.join("data/a.dat").is_file());
    }

    #[tokio::test]
    async fn compressed_stash_with_mismatched_sources_is_reported_not_raised() {
        let env = tempfile::tempdir().unwrap();
        let original = env.path().join("original");
        fs::create_dir_all(&original).unwrap();

        let repository = MemoryRepository::new();
        repository.add_stash(
            "stash1",
            StashRecord::Compressed {
                target: env.path().join("stash.tar.gz").to_string_lossy().into_owned(),
                source_list: vec!["out.log".into(), "data".into()],
                format: CompressFormat::TarGz,
            },
        );

        let record = record_with_workdir(&original);
        let mut options = record.options().clone();
        options.unstash = Some(UnstashOptions {
            target_mode: UnstashTarget::OriginalPlace,
            source_node: "stash1".into(),
            source_list: vec!["out.log".into()],
        });
        let record = record.with_options(options);

        let transport = LocalTransport::new();
        unstash(&record, &transport, &repository).await.unwrap();
        // Nothing was extracted and no transport write happened.
        assert_eq!(transport.write_op_count(), 0);
    }

    #[tokio::test]
    async fn compressed_stash_round_trips_through_stash_and_unstash() {
        let env = tempfile::tempdir().unwrap();
        let workdir = env.path().join("work");
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("out.log"), "log content").unwrap();
        let target_base = env.path().join("stash");

        // Stash with compression first.
        let record = record_with_workdir(&workdir);
        let mut options = record.options().clone();
        options.stash = Some(StashOptions {
            mode: StashMode::CompressTarGz,
            source_list: vec!["out.log".into()],
            target_base: target_base.to_string_lossy().into_owned(),
            dereference: false,
            fail_on_missing: true,
        });
        let mut record = record.with_options(options);
        let transport = LocalTransport::new();
        crate::exec::stash(&mut record, &transport).await.unwrap();
        let Some(StashRecord::Compressed { target, .. }) = record.remote_stash().cloned() else {
            panic!("expected a compressed stash record");
        };

        // Now unstash it into the original place.
        let original = env.path().join("restored");
        fs::create_dir_all(&original).unwrap();
        let repository = MemoryRepository::new();
        repository.add_stash(
            "stash1",
            StashRecord::Compressed {
                target,
                source_list: vec!["out.log".into()],
                format: CompressFormat::TarGz,
            },
        );
        repository.add_links("stash1", vec![link("stashjob", NodeKind::StashJob, None)]);
        repository.add_links(
            "stashjob",
            vec![link(
                "rfolder",
                NodeKind::Data,
                Some(original.to_string_lossy().as_ref()),
            )],
        );

        let unstash_record = record_with_workdir(&original);
        let mut options = unstash_record.options().clone();
        options.unstash = Some(UnstashOptions {
            target_mode: UnstashTarget::OriginalPlace,
            source_node: "stash1".into(),
            source_list: vec!["out.log".into()],
        });
        let unstash_record = unstash_record.with_options(options);

        unstash(&unstash_record, &transport, &repository).await.unwrap();
        assert_eq!(
            fs::read_to_string(original.join("out.log")).unwrap(),
            "log content"
        );
    }

    #[tokio::test]
    async fn new_remote_data_mode_creates_a_fresh_sharded_directory() {
        let env = tempfile::tempdir().unwrap();
        let stash_root = env.path().join("stash-root");
        fs::create_dir_all(&stash_root).unwrap();
        fs::write(stash_root.join("out.log"), "log").unwrap();

        let repository = MemoryRepository::new();
        repository.add_stash(
            "stash1",
            StashRecord::Folder {
                target_basepath: stash_root.to_string_lossy().into_owned(),
                source_list: vec!["out.log".into()],
            },
        );

        let record = record_with_workdir(&env.path().join("unused"));
        let mut options = record.options().clone();
        options.unstash = Some(UnstashOptions {
            target_mode: UnstashTarget::NewRemoteData,
            source_node: "stash1".into(),
            source_list: vec!["out.log".into()],
        });
        let record = record.with_options(options);

        let transport = LocalTransport::new();
        unstash(&record, &transport, &repository).await.unwrap();

        let base = record.computer().workdir.replace("{username}", "testuser");
        let destination =
            std::path::PathBuf::from(base).join(shard_uuid(&record.uuid()));
        assert!(destination.join("out.log").is_file());
    }
}
