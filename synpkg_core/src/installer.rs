/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::installer
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Reference packager: tracks install tasks, stages bundles
    under the applications directory, enforces the storage
    quota, and records installed packages in the store.

  Security / Safety Notes:
    Package ids are validated before they become directory
    names. Tokens are forwarded to the fetcher only. Partial
    bundles are removed on cancellation or failure.

  Dependencies:
    tokio for tasks, locks and broadcast events; sha2 for
    bundle digests; chrono for install stamps; libc for
    filesystem free-space queries.

  Operational Scope:
    Constructed by the plugin facade on initialisation and
    driven exclusively through the `Packager` trait.

  Revision History:
    2026-10-17 COD  Implemented bundle installer state machine.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Explicit task state machine with terminal states
    - Cooperative cancellation between chunks
    - Persist-then-acknowledge for installed records
============================================================*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::PackagerConfig;
use crate::error::{PackagerError, Result};
use crate::fetch::{BundleFetcher, BundleLocation, FetchError};
use crate::logger::{redact_url, Logger};
use crate::package_info::{PackageInfo, SharedPackageInfo};
use crate::packager::{
    InstallRequest, InstallerEvent, InstallerEventKind, Packager, PackagerResult, Status,
};
use crate::store::PackageStore;

const DEFAULT_PACKAGE_TYPE: &str = "application";
const EVENT_CAPACITY: usize = 64;
/// Finished tasks kept for progress queries before the oldest are dropped.
const FINISHED_TASK_LIMIT: usize = 64;

/// Lifecycle of one install task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Downloading,
    Installed,
    Cancelled,
    Failed(Status),
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Installed | TaskPhase::Cancelled | TaskPhase::Failed(_)
        )
    }
}

struct TaskEntry {
    seq: u64,
    pkg_id: String,
    phase: TaskPhase,
    progress: u32,
    /// Quota bytes held by this task until it commits or ends.
    reserved: u64,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct InstallerState {
    store: PackageStore,
    tasks: HashMap<String, TaskEntry>,
    /// Sum of `reserved` over all tasks.
    reserved_bytes: u64,
}

impl InstallerState {
    /// Bytes counted against the quota: recorded packages plus in-flight reservations.
    fn committed_bytes(&self) -> u64 {
        self.store.used_bytes().saturating_add(self.reserved_bytes)
    }

    fn release(&mut self, task_id: &str) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            let held = std::mem::take(&mut entry.reserved);
            self.reserved_bytes = self.reserved_bytes.saturating_sub(held);
        }
    }

    /// Drop the oldest finished tasks beyond `FINISHED_TASK_LIMIT`.
    fn prune_finished(&mut self) {
        let mut finished: Vec<(u64, String)> = self
            .tasks
            .iter()
            .filter(|(_, entry)| entry.phase.is_terminal())
            .map(|(task_id, entry)| (entry.seq, task_id.clone()))
            .collect();
        if finished.len() <= FINISHED_TASK_LIMIT {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - FINISHED_TASK_LIMIT;
        for (_, task_id) in finished.into_iter().take(excess) {
            self.tasks.remove(&task_id);
        }
    }
}

/// One installable entry of the repository index.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    packages: Vec<RepositoryEntry>,
}

struct Shared {
    apps_dir: PathBuf,
    quota_bytes: u64,
    chunk_size: usize,
    index_path: Option<PathBuf>,
    fetcher: BundleFetcher,
    logger: Arc<Logger>,
    events: broadcast::Sender<InstallerEvent>,
    next_task: AtomicU64,
    state: Mutex<InstallerState>,
    repository: Mutex<Vec<RepositoryEntry>>,
}

/// Packager backed by a local applications directory and package store.
#[derive(Clone)]
pub struct BundleInstaller {
    shared: Arc<Shared>,
}

impl BundleInstaller {
    pub fn new(config: &PackagerConfig, logger: Arc<Logger>) -> Result<Self> {
        let store = PackageStore::open(config.store_path())?;
        if store.is_empty() {
            logger.info(
                "STORE",
                format!("No installed packages recorded at {}", store.path().display()),
            );
        } else {
            logger.info(
                "STORE",
                format!(
                    "Loaded {} installed packages from {}",
                    store.len(),
                    store.path().display()
                ),
            );
        }

        let index_path = config.repository_index().map(Path::to_path_buf);
        let repository = match index_path.as_deref() {
            Some(path) if path.exists() => load_repository(path)?,
            _ => Vec::new(),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Shared {
            apps_dir: config.apps_dir(),
            quota_bytes: config.installer.quota_bytes,
            chunk_size: config.installer.chunk_size,
            index_path,
            fetcher: BundleFetcher::new(&config.installer)?,
            logger,
            events,
            next_task: AtomicU64::new(1),
            state: Mutex::new(InstallerState {
                store,
                tasks: HashMap::new(),
                reserved_bytes: 0,
            }),
            repository: Mutex::new(repository),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Current phase of a task, if known.
    #[cfg(test)]
    pub async fn task_phase(&self, task: &str) -> Option<TaskPhase> {
        let state = self.shared.state.lock().await;
        state.tasks.get(task).map(|entry| entry.phase)
    }
}

#[async_trait]
impl Packager for BundleInstaller {
    fn name(&self) -> &'static str {
        "BundleInstaller"
    }

    async fn install(
        &self,
        package: &str,
        version: &str,
        architecture: &str,
    ) -> PackagerResult<()> {
        if self.shared.index_path.is_none() {
            return Err(Status::NOT_SUPPORTED);
        }
        if package.is_empty() {
            return Err(Status::BAD_REQUEST);
        }

        let entry = {
            let repository = self.shared.repository.lock().await;
            repository
                .iter()
                .find(|entry| {
                    entry.name == package
                        && (version.is_empty() || entry.version == version)
                        && (architecture.is_empty()
                            || entry.architecture.is_empty()
                            || entry.architecture == architecture)
                })
                .cloned()
        };
        let entry = entry.ok_or(Status::UNKNOWN_KEY)?;

        let request = InstallRequest {
            pkg_id: if entry.id.is_empty() {
                entry.name.clone()
            } else {
                entry.id.clone()
            },
            name: entry.name.clone(),
            version: entry.version.clone(),
            kind: entry.kind.clone(),
            url: entry.url.clone(),
            ..InstallRequest::default()
        };
        self.install_bundle(request).await.map(|_| ())
    }

    async fn synchronize_repository(&self) -> PackagerResult<()> {
        let path = self.shared.index_path.as_deref().ok_or(Status::NOT_SUPPORTED)?;
        let entries = load_repository(path).map_err(|err| {
            self.shared.logger.error("REPO", err.to_string());
            Status::UNAVAILABLE
        })?;
        self.shared
            .logger
            .info("REPO", format!("Repository index lists {} packages", entries.len()));
        *self.shared.repository.lock().await = entries;
        Ok(())
    }

    async fn install_bundle(&self, request: InstallRequest) -> PackagerResult<String> {
        if request.pkg_id.is_empty() || request.url.is_empty() {
            return Err(Status::BAD_REQUEST);
        }
        if !is_safe_pkg_id(&request.pkg_id) {
            return Err(Status::BAD_REQUEST);
        }
        let location = BundleLocation::parse(&request.url).map_err(|err| err.status)?;

        let mut state = self.shared.state.lock().await;
        if state.store.contains(&request.pkg_id) {
            return Err(Status::ILLEGAL_STATE);
        }
        if active_task(&state, &request.pkg_id).is_some() {
            return Err(Status::INPROGRESS);
        }

        let seq = self.shared.next_task.fetch_add(1, Ordering::SeqCst);
        let task_id = format!("task-{seq}");
        let cancel = Arc::new(AtomicBool::new(false));
        self.shared.logger.info(
            "INSTALL",
            format!(
                "{} queued {} from {}",
                task_id,
                request.pkg_id,
                redact_url(&request.url)
            ),
        );

        let worker = Worker {
            shared: self.shared.clone(),
            task_id: task_id.clone(),
            cancel: cancel.clone(),
            request: request.clone(),
            location,
        };
        state.prune_finished();
        let handle = tokio::spawn(worker.run());
        state.tasks.insert(
            task_id.clone(),
            TaskEntry {
                seq,
                pkg_id: request.pkg_id,
                phase: TaskPhase::Pending,
                progress: 0,
                reserved: 0,
                cancel,
                handle: Some(handle),
            },
        );
        Ok(task_id)
    }

    async fn remove(&self, pkg_id: &str, listener: &str) -> PackagerResult<()> {
        if pkg_id.is_empty() {
            return Err(Status::BAD_REQUEST);
        }
        let mut state = self.shared.state.lock().await;
        if active_task(&state, pkg_id).is_some() {
            return Err(Status::INPROGRESS);
        }
        let removed = state.store.remove(pkg_id).ok_or(Status::UNKNOWN_KEY)?;
        if let Err(err) = state.store.persist() {
            self.shared.logger.error("STORE", err.to_string());
            state.store.insert(removed);
            return Err(Status::WRITE_ERROR);
        }

        let bundle_dir = self.shared.apps_dir.join(pkg_id);
        if let Err(err) = remove_dir_if_present(&bundle_dir).await {
            self.shared.logger.warn(
                "REMOVE",
                format!("Failed to delete {}: {err}", bundle_dir.display()),
            );
        }
        drop(state);

        self.shared.logger.info("REMOVE", format!("Removed {pkg_id}"));
        self.shared.publish(InstallerEvent {
            listener: listener.to_string(),
            task: None,
            pkg_id: pkg_id.to_string(),
            kind: InstallerEventKind::Removed,
        });
        Ok(())
    }

    async fn cancel(&self, pkg_id: &str, task: &str, listener: &str) -> PackagerResult<()> {
        let state = self.shared.state.lock().await;
        let task_id = if task.is_empty() {
            if pkg_id.is_empty() {
                return Err(Status::BAD_REQUEST);
            }
            active_task(&state, pkg_id).ok_or(Status::UNKNOWN_KEY)?
        } else {
            task.to_string()
        };

        let entry = state.tasks.get(&task_id).ok_or(Status::UNKNOWN_KEY)?;
        if !pkg_id.is_empty() && entry.pkg_id != pkg_id {
            return Err(Status::BAD_REQUEST);
        }
        if entry.phase.is_terminal() {
            return Err(Status::ILLEGAL_STATE);
        }
        entry.cancel.store(true, Ordering::SeqCst);
        self.shared.logger.info(
            "CANCEL",
            format!("{task_id} cancellation requested by `{listener}`"),
        );
        Ok(())
    }

    async fn is_installed(&self, pkg_id: &str, app_id: &str) -> PackagerResult<bool> {
        let key = if pkg_id.is_empty() { app_id } else { pkg_id };
        if key.is_empty() {
            return Err(Status::BAD_REQUEST);
        }
        let state = self.shared.state.lock().await;
        Ok(state.store.contains(key))
    }

    async fn get_install_progress(&self, task: &str) -> PackagerResult<u32> {
        let state = self.shared.state.lock().await;
        let entry = state.tasks.get(task).ok_or(Status::UNKNOWN_KEY)?;
        match entry.phase {
            TaskPhase::Cancelled => Err(Status::ASYNC_ABORTED),
            TaskPhase::Failed(status) => Err(status),
            _ => Ok(entry.progress),
        }
    }

    async fn get_installed(&self) -> PackagerResult<Vec<SharedPackageInfo>> {
        let state = self.shared.state.lock().await;
        Ok(state.store.list())
    }

    async fn get_package_info(&self, pkg_id: &str) -> PackagerResult<SharedPackageInfo> {
        let state = self.shared.state.lock().await;
        let package = state.store.get(pkg_id).ok_or(Status::UNKNOWN_KEY)?;
        self.shared.logger.debug("INFO", package.to_string());
        Ok(package)
    }

    async fn get_available_space(&self) -> PackagerResult<u64> {
        let committed = self.shared.state.lock().await.committed_bytes();
        self.shared.available_space(committed).ok_or(Status::UNAVAILABLE)
    }

    fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.shared.events.subscribe()
    }

    async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock().await;
            state
                .tasks
                .values_mut()
                .filter_map(|entry| {
                    entry.cancel.store(true, Ordering::SeqCst);
                    entry.handle.take()
                })
                .collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                self.shared
                    .logger
                    .warn("SHUTDOWN", format!("Install task ended abnormally: {err}"));
            }
        }
    }
}

impl Shared {
    fn publish(&self, event: InstallerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Remaining bytes under the quota and the filesystem, whichever is lower.
    fn available_space(&self, committed: u64) -> Option<u64> {
        let quota = (self.quota_bytes > 0).then(|| self.quota_bytes.saturating_sub(committed));
        let filesystem = filesystem_free_bytes(&self.apps_dir);
        match (quota, filesystem) {
            (Some(quota), Some(free)) => Some(quota.min(free)),
            (Some(quota), None) => Some(quota),
            (None, free) => free,
        }
    }

    /// Hold `bytes` of the remaining space for `task_id`.
    async fn reserve(&self, task_id: &str, bytes: u64) -> std::result::Result<(), FetchError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(available) = self.available_space(state.committed_bytes()) {
            if bytes > available {
                return Err(FetchError::new(
                    Status::WRITE_ERROR,
                    format!("bundle needs {bytes} more bytes, {available} available"),
                ));
            }
        }
        if let Some(entry) = state.tasks.get_mut(task_id) {
            entry.reserved = entry.reserved.saturating_add(bytes);
            state.reserved_bytes = state.reserved_bytes.saturating_add(bytes);
        }
        Ok(())
    }

    /// Settle a task that did not commit.
    async fn finish(&self, task_id: &str, phase: TaskPhase) {
        let mut state = self.state.lock().await;
        state.release(task_id);
        if let Some(entry) = state.tasks.get_mut(task_id) {
            entry.phase = phase;
        }
    }

    async fn set_phase(&self, task_id: &str, phase: TaskPhase, progress: Option<u32>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(task_id) {
            entry.phase = phase;
            if let Some(progress) = progress {
                entry.progress = progress;
            }
        }
    }
}

struct StagedBundle {
    path: PathBuf,
    size: u64,
}

struct Worker {
    shared: Arc<Shared>,
    task_id: String,
    cancel: Arc<AtomicBool>,
    request: InstallRequest,
    location: BundleLocation,
}

impl Worker {
    async fn run(self) {
        let bundle_dir = self.shared.apps_dir.join(&self.request.pkg_id);
        let outcome = match self.stage(&bundle_dir).await {
            Ok(staged) => self.commit(staged).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(package) => {
                self.shared.logger.info(
                    "INSTALL",
                    format!(
                        "{} installed {} {} [{}] into {} at {}",
                        self.task_id,
                        package.name(),
                        package.version(),
                        package.kind(),
                        package.bundle_path(),
                        package.installed()
                    ),
                );
                self.emit(InstallerEventKind::Progress(100));
                self.emit(InstallerEventKind::Installed);
            }
            Err(err) => {
                if let Err(io_err) = remove_dir_if_present(&bundle_dir).await {
                    self.shared.logger.warn(
                        "CLEANUP",
                        format!("Failed to delete {}: {io_err}", bundle_dir.display()),
                    );
                }
                let (phase, kind) = if err.status == Status::ASYNC_ABORTED {
                    (TaskPhase::Cancelled, InstallerEventKind::Cancelled)
                } else {
                    (
                        TaskPhase::Failed(err.status),
                        InstallerEventKind::Failed(err.status),
                    )
                };
                self.shared.logger.warn(
                    "INSTALL",
                    format!("{} {} ended: {}", self.task_id, self.request.pkg_id, err),
                );
                self.shared.finish(&self.task_id, phase).await;
                self.emit(kind);
            }
        }
    }

    fn emit(&self, kind: InstallerEventKind) {
        self.shared.publish(InstallerEvent {
            listener: self.request.listener.clone(),
            task: Some(self.task_id.clone()),
            pkg_id: self.request.pkg_id.clone(),
            kind,
        });
    }

    fn cancelled(&self) -> std::result::Result<(), FetchError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(FetchError::new(Status::ASYNC_ABORTED, "cancelled"))
        } else {
            Ok(())
        }
    }

    async fn stage(&self, bundle_dir: &Path) -> std::result::Result<StagedBundle, FetchError> {
        self.cancelled()?;
        self.shared
            .set_phase(&self.task_id, TaskPhase::Downloading, Some(0))
            .await;
        self.emit(InstallerEventKind::Progress(0));

        let mut reader = self
            .shared
            .fetcher
            .open(&self.location, &self.request.token)
            .await?;
        let total = reader.total();
        let mut reserved = 0u64;
        if let Some(total) = total {
            self.shared.reserve(&self.task_id, total).await?;
            reserved = total;
        }

        remove_dir_if_present(bundle_dir).await.map_err(write_error)?;
        tokio::fs::create_dir_all(bundle_dir)
            .await
            .map_err(write_error)?;
        let path = bundle_dir.join(&self.location.file_name);
        let mut file = tokio::fs::File::create(&path).await.map_err(write_error)?;

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut reported = 0u32;
        while let Some(chunk) = reader.next_chunk(self.shared.chunk_size).await? {
            self.cancelled()?;
            written = written.saturating_add(chunk.len() as u64);
            if written > reserved {
                // Unknown or understated length: grow the reservation as bytes arrive.
                self.shared.reserve(&self.task_id, written - reserved).await?;
                reserved = written;
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(write_error)?;

            if let Some(total) = total.filter(|total| *total > 0) {
                let percent = ((written.min(total) * 100) / total).min(99) as u32;
                if percent > reported {
                    reported = percent;
                    self.shared
                        .set_phase(&self.task_id, TaskPhase::Downloading, Some(percent))
                        .await;
                    self.emit(InstallerEventKind::Progress(percent));
                }
            }
        }
        file.flush().await.map_err(write_error)?;
        self.cancelled()?;

        let digest = format!("{:x}", hasher.finalize());
        if let Some(expected) = &self.location.expected_sha256 {
            if *expected != digest {
                return Err(FetchError::new(
                    Status::INCORRECT_HASH,
                    format!("sha256 mismatch: expected {expected}, got {digest}"),
                ));
            }
        }
        self.shared.logger.debug(
            "DIGEST",
            format!("{} sha256 {digest}", self.request.pkg_id),
        );

        Ok(StagedBundle {
            path,
            size: written,
        })
    }

    async fn commit(
        &self,
        staged: StagedBundle,
    ) -> std::result::Result<SharedPackageInfo, FetchError> {
        let name = if self.request.name.is_empty() {
            self.request.pkg_id.clone()
        } else {
            self.request.name.clone()
        };
        let kind = if self.request.kind.is_empty() {
            DEFAULT_PACKAGE_TYPE
        } else {
            self.request.kind.as_str()
        };
        let package = Arc::new(
            PackageInfo::new(name, self.request.version.clone(), self.request.pkg_id.clone())
                .with_bundle_path(staged.path.to_string_lossy())
                .with_installed(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
                .with_size_in_bytes(staged.size)
                .with_type(kind),
        );

        let mut state = self.shared.state.lock().await;
        if self.cancel.load(Ordering::SeqCst) {
            return Err(FetchError::new(Status::ASYNC_ABORTED, "cancelled"));
        }
        state.store.insert(package.clone());
        if let Err(err) = state.store.persist() {
            state.store.remove(package.pkg_id());
            return Err(FetchError::new(Status::WRITE_ERROR, err.to_string()));
        }
        // The record now carries the bytes; the phase flips under the same lock.
        state.release(&self.task_id);
        if let Some(entry) = state.tasks.get_mut(&self.task_id) {
            entry.phase = TaskPhase::Installed;
            entry.progress = 100;
        }
        Ok(package)
    }
}

fn write_error(err: std::io::Error) -> FetchError {
    FetchError::new(Status::WRITE_ERROR, format!("staging failed: {err}"))
}

fn active_task(state: &InstallerState, pkg_id: &str) -> Option<String> {
    state
        .tasks
        .iter()
        .find(|(_, entry)| entry.pkg_id == pkg_id && !entry.phase.is_terminal())
        .map(|(task_id, _)| task_id.clone())
}

fn is_safe_pkg_id(pkg_id: &str) -> bool {
    !pkg_id.starts_with('.')
        && !pkg_id.contains(|c| c == '/' || c == '\\')
        && !pkg_id.chars().any(char::is_control)
}

async fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn load_repository(path: &Path) -> Result<Vec<RepositoryEntry>> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        PackagerError::Filesystem(format!(
            "Failed to read repository index {}: {err}",
            path.display()
        ))
    })?;
    let index: RepositoryIndex = serde_json::from_str(&raw).map_err(|err| {
        PackagerError::Serialization(format!(
            "Repository index {} is invalid: {err}",
            path.display()
        ))
    })?;
    Ok(index.packages)
}

#[cfg(unix)]
fn filesystem_free_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let probe = path.ancestors().find(|candidate| candidate.exists())?;
    let c_path = CString::new(probe.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is NUL-terminated and `stats` is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    let free = (stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64);
    Some(free)
}

#[cfg(not(unix))]
fn filesystem_free_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Fixture {
        dir: TempDir,
        installer: BundleInstaller,
    }

    fn fixture_with(toml_extra: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display().to_string();
        let config = PackagerConfig::from_toml_str(&format!(
            "[paths]\napps_dir = \"{root}/apps\"\nstore_path = \"{root}/state/packages.json\"\n{toml_extra}"
        ))
        .unwrap();
        let logger = Arc::new(Logger::new(None, false).unwrap());
        let installer = BundleInstaller::new(&config, logger).unwrap();
        Fixture { dir, installer }
    }

    fn fixture() -> Fixture {
        fixture_with("")
    }

    fn write_bundle(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0xA5u8; len]).unwrap();
        path
    }

    fn request(pkg_id: &str, url: &Path) -> InstallRequest {
        InstallRequest {
            pkg_id: pkg_id.into(),
            url: url.display().to_string(),
            listener: "tests".into(),
            version: "1.0.0".into(),
            ..InstallRequest::default()
        }
    }

    async fn park_task(installer: &BundleInstaller, task_id: &str, pkg_id: &str) {
        let mut state = installer.shared.state.lock().await;
        state.tasks.insert(
            task_id.into(),
            TaskEntry {
                seq: 0,
                pkg_id: pkg_id.into(),
                phase: TaskPhase::Downloading,
                progress: 0,
                reserved: 0,
                cancel: Arc::new(AtomicBool::new(false)),
                handle: None,
            },
        );
    }

    async fn next_event(
        events: &mut broadcast::Receiver<InstallerEvent>,
        task: &str,
        wanted: impl Fn(&InstallerEventKind) -> bool,
    ) {
        timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.task.as_deref() == Some(task) && wanted(&event.kind) => {
                        return
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("installer went away"),
                }
            }
        })
        .await
        .unwrap()
    }

    async fn settle(installer: &BundleInstaller, task: &str) -> TaskPhase {
        timeout(Duration::from_secs(10), async {
            loop {
                match installer.task_phase(task).await {
                    Some(phase) if phase.is_terminal() => return phase,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn install_records_package_and_reports_full_progress() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "weather.tar", 300_000);
        let mut events = fx.installer.subscribe();

        let task = fx
            .installer
            .install_bundle(request("com.example.weather", &bundle))
            .await
            .unwrap();
        assert_eq!(task, "task-1");
        assert_eq!(settle(&fx.installer, &task).await, TaskPhase::Installed);
        assert_eq!(fx.installer.get_install_progress(&task).await, Ok(100));

        assert!(fx.installer.is_installed("com.example.weather", "").await.unwrap());
        let info = fx.installer.get_package_info("com.example.weather").await.unwrap();
        assert_eq!(info.size_in_bytes(), 300_000);
        assert_eq!(info.kind(), DEFAULT_PACKAGE_TYPE);
        assert_eq!(info.name(), "com.example.weather");
        assert_eq!(info.version(), "1.0.0");
        assert!(Path::new(info.bundle_path()).exists());

        let mut saw_installed = false;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.listener, "tests");
            if event.kind == InstallerEventKind::Installed {
                saw_installed = true;
            }
        }
        assert!(saw_installed);

        let reopened = PackageStore::open(fx.dir.path().join("state/packages.json")).unwrap();
        assert!(reopened.contains("com.example.weather"));
    }

    #[tokio::test]
    async fn duplicate_and_concurrent_installs_are_rejected() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "a.tar", 16);
        let task = fx
            .installer
            .install_bundle(request("com.example.a", &bundle))
            .await
            .unwrap();
        let second = fx
            .installer
            .install_bundle(request("com.example.a", &bundle))
            .await;
        // Either still running or already done, never accepted twice.
        assert!(matches!(second, Err(Status::INPROGRESS) | Err(Status::ILLEGAL_STATE)));

        settle(&fx.installer, &task).await;
        assert_eq!(
            fx.installer
                .install_bundle(request("com.example.a", &bundle))
                .await,
            Err(Status::ILLEGAL_STATE)
        );
    }

    #[tokio::test]
    async fn bad_requests_are_rejected_up_front() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "a.tar", 16);
        assert_eq!(
            fx.installer.install_bundle(request("", &bundle)).await,
            Err(Status::BAD_REQUEST)
        );
        assert_eq!(
            fx.installer.install_bundle(request("../escape", &bundle)).await,
            Err(Status::BAD_REQUEST)
        );
        let mut ftp = request("com.example.ftp", &bundle);
        ftp.url = "ftp://mirror/a.tar".into();
        assert_eq!(fx.installer.install_bundle(ftp).await, Err(Status::INCORRECT_URL));
    }

    #[tokio::test]
    async fn quota_rejects_oversized_bundle_and_cleans_up() {
        let fx = fixture_with("[installer]\nquota_bytes = 1000\n");
        let bundle = write_bundle(fx.dir.path(), "big.tar", 5000);
        let task = fx
            .installer
            .install_bundle(request("com.example.big", &bundle))
            .await
            .unwrap();
        assert_eq!(
            settle(&fx.installer, &task).await,
            TaskPhase::Failed(Status::WRITE_ERROR)
        );
        assert_eq!(
            fx.installer.get_install_progress(&task).await,
            Err(Status::WRITE_ERROR)
        );
        assert!(!fx.dir.path().join("apps/com.example.big").exists());
        assert!(!fx.installer.is_installed("com.example.big", "").await.unwrap());
    }

    #[tokio::test]
    async fn available_space_respects_quota() {
        let fx = fixture_with("[installer]\nquota_bytes = 1000\n");
        let bundle = write_bundle(fx.dir.path(), "small.tar", 400);
        let task = fx
            .installer
            .install_bundle(request("com.example.small", &bundle))
            .await
            .unwrap();
        settle(&fx.installer, &task).await;
        let space = fx.installer.get_available_space().await.unwrap();
        assert!(space <= 600);
    }

    #[tokio::test]
    async fn digest_mismatch_fails_the_task() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "signed.tar", 64);
        let mut req = request("com.example.signed", &bundle);
        req.url = format!("{}#sha256={}", bundle.display(), "0".repeat(64));
        let task = fx.installer.install_bundle(req).await.unwrap();
        assert_eq!(
            settle(&fx.installer, &task).await,
            TaskPhase::Failed(Status::INCORRECT_HASH)
        );
    }

    #[tokio::test]
    async fn matching_digest_installs() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "signed.tar", 64);
        let digest = format!("{:x}", Sha256::digest(std::fs::read(&bundle).unwrap()));
        let mut req = request("com.example.signed", &bundle);
        req.url = format!("file://{}#sha256={digest}", bundle.display());
        let task = fx.installer.install_bundle(req).await.unwrap();
        assert_eq!(settle(&fx.installer, &task).await, TaskPhase::Installed);
    }

    #[tokio::test]
    async fn cancelling_a_running_install_removes_the_partial_bundle() {
        let fx = fixture_with("[installer]\nchunk_size = 1\n");
        let bundle = write_bundle(fx.dir.path(), "slow.tar", 200_000);
        let mut events = fx.installer.subscribe();
        let task = fx
            .installer
            .install_bundle(request("com.example.slow", &bundle))
            .await
            .unwrap();

        // Bytes are on disk once the first percent is reported.
        next_event(&mut events, &task, |kind| *kind == InstallerEventKind::Progress(1)).await;
        assert!(fx.dir.path().join("apps/com.example.slow").exists());
        fx.installer.cancel("com.example.slow", "", "tests").await.unwrap();

        next_event(&mut events, &task, |kind| *kind == InstallerEventKind::Cancelled).await;
        assert_eq!(settle(&fx.installer, &task).await, TaskPhase::Cancelled);
        assert_eq!(
            fx.installer.get_install_progress(&task).await,
            Err(Status::ASYNC_ABORTED)
        );
        assert!(!fx.dir.path().join("apps/com.example.slow").exists());
        assert!(!fx.installer.is_installed("com.example.slow", "").await.unwrap());
        assert_eq!(fx.installer.shared.state.lock().await.reserved_bytes, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_installs_share_the_quota() {
        let fx = fixture_with("[installer]\nquota_bytes = 1000\nchunk_size = 16\n");
        let mut tasks = Vec::new();
        for n in 0..3 {
            let bundle = write_bundle(fx.dir.path(), &format!("b{n}.tar"), 600);
            let task = fx
                .installer
                .install_bundle(request(&format!("com.example.b{n}"), &bundle))
                .await
                .unwrap();
            tasks.push(task);
        }

        let mut installed = 0;
        for task in &tasks {
            match settle(&fx.installer, task).await {
                TaskPhase::Installed => installed += 1,
                phase => assert_eq!(phase, TaskPhase::Failed(Status::WRITE_ERROR)),
            }
        }
        assert_eq!(installed, 1);

        let state = fx.installer.shared.state.lock().await;
        assert_eq!(state.store.used_bytes(), 600);
        assert_eq!(state.reserved_bytes, 0);
        drop(state);
        assert!(fx.installer.get_available_space().await.unwrap() <= 400);
    }

    #[tokio::test]
    async fn reservations_count_against_available_space_until_released() {
        let fx = fixture_with("[installer]\nquota_bytes = 1000\n");
        park_task(&fx.installer, "task-7", "com.example.parked").await;

        fx.installer.shared.reserve("task-7", 700).await.unwrap();
        assert!(fx.installer.get_available_space().await.unwrap() <= 300);
        let refused = fx.installer.shared.reserve("task-7", 400).await.unwrap_err();
        assert_eq!(refused.status, Status::WRITE_ERROR);

        fx.installer
            .shared
            .finish("task-7", TaskPhase::Cancelled)
            .await;
        let state = fx.installer.shared.state.lock().await;
        assert_eq!(state.reserved_bytes, 0);
        assert_eq!(state.tasks["task-7"].reserved, 0);
        assert_eq!(state.tasks["task-7"].phase, TaskPhase::Cancelled);
    }

    #[tokio::test]
    async fn commit_settles_the_task_under_the_store_lock() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "c.tar", 32);
        park_task(&fx.installer, "task-5", "com.example.c").await;
        fx.installer.shared.reserve("task-5", 32).await.unwrap();

        let worker = Worker {
            shared: fx.installer.shared.clone(),
            task_id: "task-5".into(),
            cancel: Arc::new(AtomicBool::new(false)),
            request: request("com.example.c", &bundle),
            location: BundleLocation::parse(&bundle.display().to_string()).unwrap(),
        };
        worker
            .commit(StagedBundle {
                path: bundle.clone(),
                size: 32,
            })
            .await
            .unwrap();

        // No window where the record exists but the task still looks cancellable.
        assert_eq!(fx.installer.task_phase("task-5").await, Some(TaskPhase::Installed));
        assert_eq!(fx.installer.get_install_progress("task-5").await, Ok(100));
        assert_eq!(
            fx.installer.cancel("", "task-5", "").await,
            Err(Status::ILLEGAL_STATE)
        );
        assert_eq!(fx.installer.shared.state.lock().await.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn finished_tasks_are_pruned_oldest_first() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "tiny.tar", 4);
        let mut tasks = Vec::new();
        for n in 0..FINISHED_TASK_LIMIT + 3 {
            let task = fx
                .installer
                .install_bundle(request(&format!("com.example.t{n}"), &bundle))
                .await
                .unwrap();
            settle(&fx.installer, &task).await;
            tasks.push(task);
        }

        let retained = fx.installer.shared.state.lock().await.tasks.len();
        assert!(retained <= FINISHED_TASK_LIMIT + 1);
        assert_eq!(
            fx.installer.get_install_progress(&tasks[0]).await,
            Err(Status::UNKNOWN_KEY)
        );
        let newest = tasks.last().unwrap();
        assert_eq!(fx.installer.get_install_progress(newest).await, Ok(100));
    }

    #[tokio::test]
    async fn cancel_of_unknown_or_finished_task_fails() {
        let fx = fixture();
        assert_eq!(fx.installer.cancel("", "task-99", "").await, Err(Status::UNKNOWN_KEY));
        assert_eq!(fx.installer.cancel("", "", "").await, Err(Status::BAD_REQUEST));

        let bundle = write_bundle(fx.dir.path(), "a.tar", 8);
        let task = fx
            .installer
            .install_bundle(request("com.example.a", &bundle))
            .await
            .unwrap();
        settle(&fx.installer, &task).await;
        assert_eq!(fx.installer.cancel("", &task, "").await, Err(Status::ILLEGAL_STATE));
    }

    #[tokio::test]
    async fn remove_deletes_bundle_and_record() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "a.tar", 8);
        let task = fx
            .installer
            .install_bundle(request("com.example.a", &bundle))
            .await
            .unwrap();
        settle(&fx.installer, &task).await;

        let mut events = fx.installer.subscribe();
        fx.installer.remove("com.example.a", "ui").await.unwrap();
        assert!(!fx.dir.path().join("apps/com.example.a").exists());
        assert_eq!(
            fx.installer.get_package_info("com.example.a").await,
            Err(Status::UNKNOWN_KEY)
        );
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, InstallerEventKind::Removed);
        assert_eq!(event.listener, "ui");

        assert_eq!(
            fx.installer.remove("com.example.a", "ui").await,
            Err(Status::UNKNOWN_KEY)
        );
    }

    #[tokio::test]
    async fn queries_on_unknown_keys_fail() {
        let fx = fixture();
        assert_eq!(
            fx.installer.get_install_progress("task-1").await,
            Err(Status::UNKNOWN_KEY)
        );
        assert_eq!(fx.installer.is_installed("", "").await, Err(Status::BAD_REQUEST));
        assert!(!fx.installer.is_installed("", "com.example.app").await.unwrap());
        assert!(fx.installer.get_installed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn classic_install_needs_a_repository_index() {
        let fx = fixture();
        assert_eq!(
            fx.installer.install("weather", "1.0", "arm").await,
            Err(Status::NOT_SUPPORTED)
        );
        assert_eq!(
            fx.installer.synchronize_repository().await,
            Err(Status::NOT_SUPPORTED)
        );
    }

    #[tokio::test]
    async fn repository_install_resolves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), "weather.tar", 32);
        let index = dir.path().join("index.json");
        std::fs::write(
            &index,
            serde_json::json!({
                "packages": [{
                    "name": "weather",
                    "version": "2.0",
                    "architecture": "arm",
                    "id": "com.example.weather",
                    "url": bundle.display().to_string(),
                    "type": "widget"
                }]
            })
            .to_string(),
        )
        .unwrap();

        let fx = fixture_with(&format!("repository_index = \"{}\"\n", index.display()));
        fx.installer.synchronize_repository().await.unwrap();
        assert_eq!(
            fx.installer.install("weather", "3.0", "arm").await,
            Err(Status::UNKNOWN_KEY)
        );
        fx.installer.install("weather", "2.0", "").await.unwrap();
        fx.installer.shutdown().await;

        let state = fx.installer.shared.state.lock().await;
        let entry = state.tasks.values().next().unwrap();
        assert_eq!(entry.pkg_id, "com.example.weather");
        if entry.phase == TaskPhase::Installed {
            let info = state.store.get("com.example.weather").unwrap();
            assert_eq!(info.kind(), "widget");
            assert_eq!(info.name(), "weather");
            assert_eq!(info.version(), "2.0");
        }
    }

    #[tokio::test]
    async fn shutdown_settles_every_task() {
        let fx = fixture();
        let bundle = write_bundle(fx.dir.path(), "a.tar", 4096);
        let task = fx
            .installer
            .install_bundle(request("com.example.a", &bundle))
            .await
            .unwrap();
        fx.installer.shutdown().await;
        let phase = fx.installer.task_phase(&task).await.unwrap();
        assert!(phase.is_terminal());
    }
}
