// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Shared fakes for the lifecycle stage tests: a transport backed by the
//! local filesystem that records every write operation, a scripted
//! scheduler, and an in-memory repository.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::ports::repository::{
    FolderId, ProvenanceLink, Repository, RepositoryError, RepositoryResult,
};
use crate::ports::scheduler::{JobInfo, JobState, Scheduler, SchedulerResult};
use crate::ports::transport::{CompressFormat, Transport, TransportError, TransportResult};
use crate::record::{CalcKind, CalcOptions, CalculationRecord, Computer, StashRecord};

/// Transport whose "remote" filesystem is the local one, with remote paths
/// being absolute local paths. Records every mutating call so tests can
/// assert that an idempotent re-entry performs zero writes.
pub(crate) struct LocalTransport {
    ops: Mutex<Vec<String>>,
    fail_copy: Mutex<HashSet<String>>,
    fail_compress: AtomicBool,
    username: String,
}

impl LocalTransport {
    pub(crate) fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            fail_copy: Mutex::new(HashSet::new()),
            fail_compress: AtomicBool::new(false),
            username: "testuser".to_string(),
        }
    }

    pub(crate) fn write_op_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// Force the next copies of this exact source path to fail.
    pub(crate) fn fail_copy_of(&self, source: &str) {
        self.fail_copy.lock().unwrap().insert(source.to_string());
    }

    pub(crate) fn fail_compression(&self) {
        self.fail_compress.store(true, Ordering::SeqCst);
    }

    fn record_op(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> TransportResult<bool> {
        Ok(Path::new(path).exists())
    }

    async fn makedirs(&self, path: &str, ignore_existing: bool) -> TransportResult<()> {
        self.record_op(format!("makedirs:{path}"));
        if Path::new(path).exists() {
            if ignore_existing {
                return Ok(());
            }
            return Err(TransportError::InvalidArgument(format!(
                "path already exists: {path}"
            )));
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> TransportResult<()> {
        self.record_op(format!("mkdir:{path}"));
        std::fs::create_dir(path)?;
        Ok(())
    }

    async fn is_dir(&self, path: &str) -> TransportResult<bool> {
        Ok(Path::new(path).is_dir())
    }

    async fn is_file(&self, path: &str) -> TransportResult<bool> {
        Ok(Path::new(path).is_file())
    }

    async fn copy(&self, src: &str, dst: &str) -> TransportResult<()> {
        self.record_op(format!("copy:{src}->{dst}"));
        if !Path::new(src).exists() {
            return Err(TransportError::NotFound(src.to_string()));
        }
        if self.fail_copy.lock().unwrap().contains(src) {
            return Err(TransportError::Other(format!(
                "forced copy failure for {src}"
            )));
        }
        copy_tree(Path::new(src), Path::new(dst))?;
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> TransportResult<()> {
        self.record_op(format!("put:{remote}"));
        copy_tree(local, Path::new(remote))?;
        Ok(())
    }

    async fn get(
        &self,
        remote: &str,
        local: &Path,
        ignore_nonexisting: bool,
    ) -> TransportResult<()> {
        if !Path::new(remote).exists() {
            if ignore_nonexisting {
                return Ok(());
            }
            return Err(TransportError::NotFound(remote.to_string()));
        }
        copy_tree(Path::new(remote), local)?;
        Ok(())
    }

    async fn glob(&self, pattern: &str) -> TransportResult<Vec<String>> {
        let matcher = globset::GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?
            .compile_matcher();
        let root = static_prefix_dir(pattern);
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(std::io::Error::from)?;
            let path = entry.path().to_string_lossy().into_owned();
            if matcher.is_match(&path) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn symlink(&self, src: &str, dst: &str) -> TransportResult<()> {
        self.record_op(format!("symlink:{src}->{dst}"));
        std::os::unix::fs::symlink(src, dst)?;
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> TransportResult<()> {
        use std::os::unix::fs::PermissionsExt;
        self.record_op(format!("chmod:{path}:{mode:o}"));
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    async fn rmtree(&self, path: &str) -> TransportResult<()> {
        self.record_op(format!("rmtree:{path}"));
        let p = Path::new(path);
        if !p.exists() {
            return Err(TransportError::NotFound(path.to_string()));
        }
        if p.is_dir() {
            std::fs::remove_dir_all(p)?;
        } else {
            std::fs::remove_file(p)?;
        }
        Ok(())
    }

    async fn compress(
        &self,
        _format: CompressFormat,
        sources: &[String],
        dest: &str,
        root_dir: &str,
        overwrite: bool,
        dereference: bool,
    ) -> TransportResult<()> {
        self.record_op(format!("compress:{dest}"));
        if self.fail_compress.load(Ordering::SeqCst) {
            return Err(TransportError::Other("forced compression failure".into()));
        }
        if Path::new(dest).exists() && !overwrite {
            return Err(TransportError::InvalidArgument(format!(
                "archive already exists: {dest}"
            )));
        }
        // Always writes a plain tar; the tests never decompress externally.
        let file = std::fs::File::create(dest)?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(dereference);
        for source in sources {
            let path = Path::new(source);
            if !path.exists() {
                return Err(TransportError::NotFound(source.clone()));
            }
            let name = crate::util::remote_path::relative_to(source, root_dir)
                .unwrap_or_else(|| crate::util::remote_path::basename(source));
            if path.is_dir() {
                builder.append_dir_all(name, path)?;
            } else {
                builder.append_path_with_name(path, name)?;
            }
        }
        builder.finish()?;
        Ok(())
    }

    async fn extract(
        &self,
        source: &str,
        dest: &str,
        _overwrite: bool,
        strip_components: u32,
    ) -> TransportResult<()> {
        self.record_op(format!("extract:{source}->{dest}"));
        if strip_components != 0 {
            return Err(TransportError::Other(
                "strip_components is not supported by the test transport".into(),
            ));
        }
        let file = std::fs::File::open(source)
            .map_err(|_| TransportError::NotFound(source.to_string()))?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(dest)?;
        Ok(())
    }

    async fn whoami(&self) -> TransportResult<String> {
        Ok(self.username.clone())
    }
}

/// Directory to start walking from when expanding a glob: everything before
/// the first wildcard component.
fn static_prefix_dir(pattern: &str) -> PathBuf {
    let idx = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    match pattern[..idx].rfind('/') {
        Some(0) => PathBuf::from("/"),
        Some(i) => PathBuf::from(&pattern[..i]),
        None => PathBuf::from("."),
    }
}

/// Scheduler whose answers are scripted by the test.
pub(crate) struct StubScheduler {
    next_job_id: String,
    kill_result: bool,
    submissions: Mutex<Vec<(String, String)>>,
    kills: Mutex<Vec<String>>,
    jobs: Mutex<HashMap<String, JobInfo>>,
}

impl StubScheduler {
    pub(crate) fn new(job_id: &str) -> Self {
        Self {
            next_job_id: job_id.to_string(),
            kill_result: true,
            submissions: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_kill_result(mut self, accepted: bool) -> Self {
        self.kill_result = accepted;
        self
    }

    pub(crate) fn set_job_state(&self, job_id: &str, state: JobState) {
        self.jobs.lock().unwrap().insert(
            job_id.to_string(),
            JobInfo {
                job_id: job_id.to_string(),
                state,
            },
        );
    }

    pub(crate) fn submissions(&self) -> Vec<(String, String)> {
        self.submissions.lock().unwrap().clone()
    }

    pub(crate) fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for StubScheduler {
    async fn submit_job(&self, workdir: &str, script: &str) -> SchedulerResult<String> {
        self.submissions
            .lock()
            .unwrap()
            .push((workdir.to_string(), script.to_string()));
        Ok(self.next_job_id.clone())
    }

    async fn get_jobs(&self, job_ids: &[String]) -> SchedulerResult<HashMap<String, JobInfo>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(job_ids
            .iter()
            .filter_map(|id| jobs.get(id).cloned().map(|info| (id.clone(), info)))
            .collect())
    }

    async fn kill_job(&self, job_id: &str) -> SchedulerResult<bool> {
        self.kills.lock().unwrap().push(job_id.to_string());
        Ok(self.kill_result)
    }
}

/// In-memory provenance store.
pub(crate) struct MemoryRepository {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    folders: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    nodes: Mutex<HashMap<String, PathBuf>>,
    stashes: Mutex<HashMap<String, StashRecord>>,
    links: Mutex<HashMap<String, Vec<ProvenanceLink>>>,
    next_folder: AtomicUsize,
}

impl MemoryRepository {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            folders: Mutex::new(BTreeMap::new()),
            nodes: Mutex::new(HashMap::new()),
            stashes: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            next_folder: AtomicUsize::new(1),
        }
    }

    /// Register a stored node whose repository content lives at `root`.
    pub(crate) fn add_node(&self, id: &str, root: &Path) {
        self.nodes
            .lock()
            .unwrap()
            .insert(id.to_string(), root.to_path_buf());
    }

    pub(crate) fn add_stash(&self, id: &str, record: StashRecord) {
        self.stashes.lock().unwrap().insert(id.to_string(), record);
    }

    pub(crate) fn add_links(&self, id: &str, links: Vec<ProvenanceLink>) {
        self.links.lock().unwrap().insert(id.to_string(), links);
    }

    /// Relative paths persisted for a calculation through `put_file`.
    pub(crate) fn stored_files(&self, calc: Uuid) -> Vec<String> {
        let prefix = format!("{calc}/");
        self.files
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Relative paths inside a persisted output folder.
    pub(crate) fn folder_files(&self, folder: &FolderId) -> Vec<String> {
        self.folders
            .lock()
            .unwrap()
            .get(&folder.0)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_file(&self, calc: Uuid, rel_path: &str, local: &Path) -> RepositoryResult<()> {
        let content = std::fs::read(local)?;
        self.files
            .lock()
            .unwrap()
            .insert(format!("{calc}/{rel_path}"), content);
        Ok(())
    }

    async fn put_folder(
        &self,
        _calc: Uuid,
        label: &str,
        root: &Path,
    ) -> RepositoryResult<FolderId> {
        let mut contents = BTreeMap::new();
        for entry in WalkDir::new(root) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|err| RepositoryError::Other(err.to_string()))?
                .to_string_lossy()
                .into_owned();
            contents.insert(rel, std::fs::read(entry.path())?);
        }
        let id = format!("{label}-{}", self.next_folder.fetch_add(1, Ordering::SeqCst));
        self.folders.lock().unwrap().insert(id.clone(), contents);
        Ok(FolderId(id))
    }

    async fn export_node(&self, node: &str, rel_path: &str, dest: &Path) -> RepositoryResult<()> {
        let root = self
            .nodes
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| RepositoryError::NodeNotFound(node.to_string()))?;
        let source = if rel_path.is_empty() || rel_path == "." {
            root
        } else {
            root.join(rel_path)
        };
        if !source.exists() {
            return Err(RepositoryError::NodeNotFound(format!("{node}:{rel_path}")));
        }
        copy_tree(&source, dest)?;
        Ok(())
    }

    async fn load_stash(&self, node: &str) -> RepositoryResult<StashRecord> {
        self.stashes
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| RepositoryError::NodeNotFound(node.to_string()))
    }

    async fn incoming_links(&self, node: &str) -> RepositoryResult<Vec<ProvenanceLink>> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default())
    }
}

/// Copy a file or directory tree with plain local I/O.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(src)?;
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
        return Ok(());
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = if rel.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(rel)
        };
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Computer whose base directory template lives under `base` and uses the
/// `{username}` placeholder resolved by [`LocalTransport::whoami`].
pub(crate) fn test_computer(base: &Path) -> Computer {
    Computer {
        id: "hpc1".to_string(),
        label: "test-cluster".to_string(),
        workdir: format!("{}/scratch/{{username}}", base.display()),
    }
}

pub(crate) fn new_record(base: &Path) -> CalculationRecord {
    CalculationRecord::new(
        Uuid::new_v4(),
        test_computer(base),
        CalcKind::Standard,
        CalcOptions::default(),
    )
}

/// Record whose upload already completed into `workdir`, for stages that
/// start from an uploaded calculation.
pub(crate) fn record_with_workdir(workdir: &Path) -> CalculationRecord {
    let base = workdir.parent().unwrap_or(workdir);
    let mut record = new_record(base);
    record.set_remote_workdir(workdir.to_string_lossy().into_owned());
    record
}
