//! In-memory collaborators for orchestrator tests.

use crate::cancel::CancelToken;
use crate::config::{
    ArchiveSettings, Config, Paths, RestoreSettings, Retention, Selection, ServiceSettings, SpaceSettings,
};
use crate::engine::{ArchiveEngine, CreateRequest, ExtractionPlan};
use crate::model::{ArchiveEntry, ArchiveName, ArchiveStats, VolumeInfo, WorkloadId};
use crate::report::{Notifier, RunSummary};
use crate::runtime::{ContainerRuntime, ServiceState};
use crate::space::CapacityProbe;
use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Config rooted in a scratch directory, with a real data root on disk.
pub fn test_config(dir: &Path) -> Config {
    let data_root = dir.join("docker");
    fs::create_dir_all(data_root.join("volumes")).unwrap();
    Config {
        paths: Paths {
            data_root,
            repository: dir.join("repo").display().to_string(),
            lock: dir.join("run.lock"),
            staging: dir.join("staging"),
            log_file: None,
        },
        archive: ArchiveSettings::default(),
        retention: Retention::default(),
        selection: Selection::default(),
        service: ServiceSettings {
            transition_timeout_secs: 1,
            poll_interval_ms: 1,
            ..ServiceSettings::default()
        },
        space: SpaceSettings::default(),
        restore: RestoreSettings::default(),
        remote: None,
        notify: None,
    }
}

/// How the engine stores an absolute source path.
pub fn stored(path: &Path) -> String {
    path.to_string_lossy().trim_start_matches('/').to_string()
}

type Log = Rc<RefCell<Vec<String>>>;

struct RuntimeState {
    volumes: BTreeMap<String, (PathBuf, Vec<WorkloadId>)>,
    running: BTreeMap<WorkloadId, bool>,
    fail_stop: BTreeSet<WorkloadId>,
    fail_start: BTreeSet<WorkloadId>,
    platform: ServiceState,
    ignores_stop: bool,
    start_failures: u32,
    probe_fails: bool,
    watch: Option<PathBuf>,
    observed: Vec<bool>,
}

pub struct FakeRuntime {
    state: RefCell<RuntimeState>,
    log: Log,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(RuntimeState {
                volumes: BTreeMap::new(),
                running: BTreeMap::new(),
                fail_stop: BTreeSet::new(),
                fail_start: BTreeSet::new(),
                platform: ServiceState::Active,
                ignores_stop: false,
                start_failures: 0,
                probe_fails: false,
                watch: None,
                observed: Vec::new(),
            }),
            log: Rc::default(),
        }
    }

    pub fn volume(self, name: &str, workloads: &[(&str, bool)]) -> Self {
        let mountpoint = PathBuf::from(format!("/var/lib/docker/volumes/{name}/_data"));
        self.volume_at(name, &mountpoint, workloads)
    }

    pub fn volume_at(self, name: &str, mountpoint: &Path, workloads: &[(&str, bool)]) -> Self {
        {
            let mut state = self.state.borrow_mut();
            let ids = workloads.iter().map(|(w, _)| w.to_string()).collect();
            state.volumes.insert(name.to_string(), (mountpoint.to_path_buf(), ids));
            for (workload, running) in workloads {
                state.running.insert(workload.to_string(), *running);
            }
        }
        self
    }

    pub fn fail_stop(self, workload: &str) -> Self {
        self.state.borrow_mut().fail_stop.insert(workload.to_string());
        self
    }

    pub fn fail_start(self, workload: &str) -> Self {
        self.state.borrow_mut().fail_start.insert(workload.to_string());
        self
    }

    pub fn platform_ignores_stop(self) -> Self {
        self.state.borrow_mut().ignores_stop = true;
        self
    }

    pub fn platform_stopped(self) -> Self {
        self.state.borrow_mut().platform = ServiceState::Inactive;
        self
    }

    /// The first `n` start requests leave the platform failed.
    pub fn platform_start_failures(self, n: u32) -> Self {
        self.state.borrow_mut().start_failures = n;
        self
    }

    pub fn probe_fails(self) -> Self {
        self.state.borrow_mut().probe_fails = true;
        self
    }

    /// Record whether `path` exists each time the platform is started.
    pub fn watch(self, path: &Path) -> Self {
        self.state.borrow_mut().watch = Some(path.to_path_buf());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn running(&self, workload: &str) -> bool {
        self.state.borrow().running.get(workload).copied().unwrap_or(false)
    }

    pub fn observed(&self) -> Vec<bool> {
        self.state.borrow().observed.clone()
    }

    fn record(&self, call: String) {
        self.log.borrow_mut().push(call);
    }
}

impl ContainerRuntime for FakeRuntime {
    fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        Ok(self
            .state
            .borrow()
            .volumes
            .iter()
            .map(|(name, (mountpoint, _))| VolumeInfo {
                name: name.clone(),
                mountpoint: mountpoint.clone(),
            })
            .collect())
    }

    fn ensure_volume(&self, name: &str) -> Result<VolumeInfo> {
        let mut state = self.state.borrow_mut();
        let (mountpoint, _) = state
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| (PathBuf::from(format!("/var/lib/docker/volumes/{name}/_data")), Vec::new()));
        Ok(VolumeInfo {
            name: name.to_string(),
            mountpoint: mountpoint.clone(),
        })
    }

    fn workloads_using(&self, volume: &str, running_only: bool) -> Result<Vec<WorkloadId>> {
        let state = self.state.borrow();
        let Some((_, workloads)) = state.volumes.get(volume) else {
            return Ok(Vec::new());
        };
        Ok(workloads
            .iter()
            .filter(|w| !running_only || state.running.get(*w).copied().unwrap_or(false))
            .cloned()
            .collect())
    }

    fn is_running(&self, workload: &str) -> Result<bool> {
        Ok(self.running(workload))
    }

    fn stop_workload(&self, workload: &str) -> Result<()> {
        self.record(format!("stop {workload}"));
        let mut state = self.state.borrow_mut();
        if state.fail_stop.contains(workload) {
            bail!("cannot stop {workload}");
        }
        state.running.insert(workload.to_string(), false);
        Ok(())
    }

    fn start_workload(&self, workload: &str) -> Result<()> {
        self.record(format!("start {workload}"));
        let mut state = self.state.borrow_mut();
        if state.fail_start.contains(workload) {
            bail!("cannot start {workload}");
        }
        state.running.insert(workload.to_string(), true);
        Ok(())
    }

    fn platform_state(&self) -> Result<ServiceState> {
        Ok(self.state.borrow().platform)
    }

    fn request_platform_stop(&self) -> Result<()> {
        self.record("platform stop".to_string());
        let mut state = self.state.borrow_mut();
        if !state.ignores_stop {
            state.platform = ServiceState::Inactive;
        }
        Ok(())
    }

    fn request_platform_start(&self) -> Result<()> {
        self.record("platform start".to_string());
        let mut state = self.state.borrow_mut();
        if let Some(path) = state.watch.clone() {
            state.observed.push(path.exists());
        }
        if state.start_failures > 0 {
            state.start_failures -= 1;
            state.platform = ServiceState::Failed;
        } else {
            state.platform = ServiceState::Active;
        }
        Ok(())
    }

    fn kill_platform(&self) -> Result<()> {
        self.record("platform kill".to_string());
        self.state.borrow_mut().platform = ServiceState::Inactive;
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        let state = self.state.borrow();
        if state.probe_fails || state.platform != ServiceState::Active {
            bail!("platform does not answer");
        }
        Ok(())
    }
}

/// Archive engine over an in-memory file tree. Every archive holds the
/// same tree.
pub struct FakeEngine {
    exists: bool,
    archives: RefCell<Vec<ArchiveEntry>>,
    tree: Vec<(String, String)>,
    fail: BTreeSet<String>,
    fail_targeted_extract: bool,
    cancel_during: Option<(String, CancelToken)>,
    calls: RefCell<Vec<String>>,
    observer: Option<Log>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            exists: true,
            archives: RefCell::new(Vec::new()),
            tree: Vec::new(),
            fail: BTreeSet::new(),
            fail_targeted_extract: false,
            cancel_during: None,
            calls: RefCell::new(Vec::new()),
            observer: None,
        }
    }

    pub fn missing_repository(mut self) -> Self {
        self.exists = false;
        self
    }

    pub fn archive(self, name: &str) -> Self {
        let start = ArchiveName::parse(name)
            .map(|n| n.created_at())
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        self.archives.borrow_mut().push(ArchiveEntry {
            name: name.to_string(),
            start,
        });
        self
    }

    /// Stored files as `(path, content)`, paths as the engine lists them.
    pub fn tree(mut self, files: &[(&str, &str)]) -> Self {
        self.tree = files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect();
        self
    }

    /// Fail every call of `kind` (the first word of the call log entry).
    pub fn fail_on(mut self, kind: &str) -> Self {
        self.fail.insert(kind.to_string());
        self
    }

    pub fn fail_targeted_extract(mut self) -> Self {
        self.fail_targeted_extract = true;
        self
    }

    /// Cancel `token` while a call of `kind` is in flight; the call
    /// itself still completes.
    pub fn cancel_during(mut self, kind: &str, token: CancelToken) -> Self {
        self.cancel_during = Some((kind.to_string(), token));
        self
    }

    /// Also log `create` calls into the runtime's call log, to check
    /// interleaving.
    pub fn observe_runtime(mut self, runtime: &FakeRuntime) -> Self {
        self.observer = Some(Rc::clone(&runtime.log));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn call(&self, entry: String) -> Result<()> {
        let kind = entry.split(' ').next().unwrap_or("").to_string();
        self.calls.borrow_mut().push(entry);
        if let Some((cancel_kind, token)) = &self.cancel_during {
            if *cancel_kind == kind {
                token.cancel();
            }
        }
        if self.fail.contains(&kind) {
            return Err(anyhow!("borg {kind} failed: simulated error"));
        }
        Ok(())
    }
}

fn under(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).map(|r| r.starts_with('/')).unwrap_or(false)
}

impl ArchiveEngine for FakeEngine {
    fn repository_exists(&self) -> Result<bool> {
        self.call("exists".to_string())?;
        Ok(self.exists)
    }

    fn init(&self, encryption: &str) -> Result<()> {
        self.call(format!("init {encryption}"))
    }

    fn create(&self, request: &CreateRequest) -> Result<ArchiveStats> {
        let entry = format!("create {}", request.archive);
        if let Some(log) = &self.observer {
            log.borrow_mut().push(entry.clone());
        }
        self.call(entry)?;
        let name = request.archive.clone();
        self.archives.borrow_mut().push(ArchiveEntry {
            start: ArchiveName::parse(&name)
                .map(|n| n.created_at())
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH),
            name,
        });
        Ok(ArchiveStats {
            original_size: 2048,
            compressed_size: 1024,
            deduplicated_size: 512,
            nfiles: 2,
        })
    }

    fn check(&self, archive: Option<&str>) -> Result<String> {
        self.call(format!("check {}", archive.unwrap_or("<repository>")))?;
        Ok(String::new())
    }

    fn prune(&self, glob: &str, _retention: &Retention, dry_run: bool) -> Result<String> {
        self.call(format!("prune {glob}{}", if dry_run { " dry-run" } else { "" }))?;
        Ok(String::new())
    }

    fn compact(&self) -> Result<()> {
        self.call("compact".to_string())
    }

    fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        self.call("list".to_string())?;
        Ok(self.archives.borrow().clone())
    }

    fn info(&self, archive: &str) -> Result<ArchiveStats> {
        self.call(format!("info {archive}"))?;
        let size = self.tree.iter().map(|(_, c)| c.len() as u64).sum();
        Ok(ArchiveStats {
            original_size: size,
            ..ArchiveStats::default()
        })
    }

    fn list_paths(&self, archive: &str, limit: usize) -> Result<Vec<String>> {
        self.call(format!("paths {archive}"))?;
        Ok(self.tree.iter().take(limit).map(|(p, _)| p.clone()).collect())
    }

    fn extract(&self, archive: &str, target: &Path, plan: &ExtractionPlan, _progress: bool) -> Result<()> {
        self.call(format!(
            "extract {archive} include={} strip={}",
            plan.include.as_deref().unwrap_or("*"),
            plan.strip_components
        ))?;
        if self.fail_targeted_extract && plan.include.is_some() {
            bail!("borg extract failed: simulated error");
        }
        for (path, content) in &self.tree {
            if let Some(include) = &plan.include {
                if !under(path, include) {
                    continue;
                }
            }
            let rest: Vec<&str> = path.split('/').skip(plan.strip_components).collect();
            if rest.is_empty() {
                continue;
            }
            let dest = target.join(rest.join("/"));
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, content)?;
        }
        Ok(())
    }
}

pub struct FakeProbe {
    available: u64,
    estimate: u64,
}

impl FakeProbe {
    pub fn new(available: u64) -> Self {
        Self { available, estimate: 1 }
    }

    pub fn with_estimate(mut self, estimate: u64) -> Self {
        self.estimate = estimate;
        self
    }
}

impl CapacityProbe for FakeProbe {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.available)
    }

    fn estimate_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.estimate)
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    delivered: RefCell<Vec<RunSummary>>,
}

impl FakeNotifier {
    pub fn delivered(&self) -> Vec<RunSummary> {
        self.delivered.borrow().clone()
    }
}

impl Notifier for FakeNotifier {
    fn deliver(&self, summary: &RunSummary) -> Result<()> {
        self.delivered.borrow_mut().push(summary.clone());
        Ok(())
    }
}

/// Remote that copies directories on the local filesystem.
pub struct FakeRemote {
    pub root: PathBuf,
    pub pushes: RefCell<u32>,
}

impl FakeRemote {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            pushes: RefCell::new(0),
        }
    }
}

impl crate::remote::RemoteSync for FakeRemote {
    fn describe(&self) -> String {
        format!("fake:{}", self.root.display())
    }

    fn push(&self, _local: &Path) -> Result<()> {
        *self.pushes.borrow_mut() += 1;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn pull(&self, staging: &Path) -> Result<()> {
        fs::create_dir_all(staging)?;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), staging.join(entry.file_name()))?;
            }
        }
        Ok(())
    }
}
