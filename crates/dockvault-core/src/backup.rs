use crate::config::Mode;
use crate::engine::CreateRequest;
use crate::error::RunError;
use crate::lock::RunLock;
use crate::mapper::{self, Dependents};
use crate::model::{ArchiveName, Scope, Volume};
use crate::orchestrator::{Orchestrator, RunReport};
use crate::record::{CreatedArchive, OperationKind, OperationRecord, Stage};
use crate::sequencer::{self, Sequence};
use anyhow::{Context, Result};
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// What a backup would touch, computed without locking or mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupPlan {
    DataRoot {
        scope: Scope,
        path: PathBuf,
        estimate: u64,
    },
    Volumes(Sequence),
}

impl<'a> Orchestrator<'a> {
    pub fn plan_backup(&self, include: &[String]) -> Result<BackupPlan> {
        match self.config.selection.mode {
            Mode::DataRoot => {
                let path = self.config.paths.data_root.clone();
                let estimate = self
                    .deps
                    .capacity
                    .estimate_bytes(&path)
                    .with_context(|| format!("failed to size {}", path.display()))?;
                Ok(BackupPlan::DataRoot {
                    scope: Scope::DataRoot(self.config.archive.data_root_scope.clone()),
                    path,
                    estimate,
                })
            }
            Mode::Volumes => Ok(BackupPlan::Volumes(self.map_and_sequence(include, None)?)),
        }
    }

    /// Guarded backup run. `include` overrides the configured volume
    /// selection when non-empty.
    pub fn backup(&self, include: &[String]) -> RunReport {
        let target = match self.config.selection.mode {
            Mode::DataRoot => self.config.archive.data_root_scope.clone(),
            Mode::Volumes => "volumes".to_string(),
        };
        let mut record = OperationRecord::new(OperationKind::Backup, target);
        let mut lock = None;
        let result = self.run_backup(&mut record, &mut lock, include);
        self.finish(record, lock, result)
    }

    fn run_backup(
        &self,
        record: &mut OperationRecord,
        lock: &mut Option<RunLock>,
        include: &[String],
    ) -> Result<()> {
        self.checkpoint()?;
        self.acquire(record, lock)?;
        let init = self.repository_missing(true)?;
        match self.config.selection.mode {
            Mode::DataRoot => self.backup_data_root(record, init),
            Mode::Volumes => self.backup_volumes(record, include, init),
        }
    }

    fn map_and_sequence(&self, include: &[String], record: Option<&mut OperationRecord>) -> Result<Sequence> {
        let selection = &self.config.selection;
        let include = if include.is_empty() {
            selection.include.as_slice()
        } else {
            include
        };
        let mapped = mapper::map_volumes(
            self.deps.runtime,
            self.deps.capacity,
            include,
            &selection.exclude,
        )?;
        let seq = sequencer::sequence(mapped.volumes, &selection.priority, selection.skip_in_use);
        if let Some(record) = record {
            record.warnings.extend(mapped.warnings);
            record.skipped.extend(seq.skipped.iter().map(|v| format!("{v} (in use)")));
        }
        Ok(seq)
    }

    /// `init` creates the repository once the space check has passed.
    fn backup_data_root(&self, record: &mut OperationRecord, init: bool) -> Result<()> {
        let data_root = &self.config.paths.data_root;
        if !data_root.is_dir() {
            return Err(RunError::Precondition(format!(
                "data root {} is not a directory",
                data_root.display()
            ))
            .into());
        }
        let scope = Scope::DataRoot(self.config.archive.data_root_scope.clone());
        let deps = mapper::map_data_root(&self.config.archive.data_root_scope);
        debug!(?deps, "dependencies mapped");
        record.enter(Stage::Mapped);

        let estimate = self
            .deps
            .capacity
            .estimate_bytes(data_root)
            .with_context(|| format!("failed to size {}", data_root.display()))?;
        self.preflight_repository(estimate)?;
        record.enter(Stage::SpaceChecked);
        if init {
            self.init_repository()?;
        }

        self.checkpoint()?;
        self.controller().pause_platform(&mut record.stopped)?;
        record.enter(Stage::Paused);

        self.checkpoint()?;
        record.enter(Stage::Snapshotting);
        let created = self.snapshot(&scope, PathBuf::from("/"), vec![data_root.clone()])?;
        record.archives.push(created);

        self.resume_stopped(record);
        Self::interventions_error(record)?;

        self.after_snapshot(record, &[scope])?;
        record.enter(Stage::Done);
        Ok(())
    }

    fn backup_volumes(&self, record: &mut OperationRecord, include: &[String], init: bool) -> Result<()> {
        let seq = self.map_and_sequence(include, Some(record))?;
        let deps = mapper::MappedVolumes {
            volumes: seq.in_order().cloned().collect(),
            warnings: Vec::new(),
        }
        .dependencies();
        for (volume, dependents) in &deps {
            if let Dependents::Workloads { running, .. } = dependents {
                debug!(volume = %volume, running = running.len(), "dependencies mapped");
            }
        }
        info!(
            ordinary = seq.ordinary.len(),
            deferred = seq.deferred.len(),
            skipped = seq.skipped.len(),
            "volumes sequenced"
        );
        record.enter(Stage::Mapped);

        let estimate: u64 = seq.in_order().map(|v| v.size_estimate).sum();
        self.preflight_repository(estimate)?;
        record.enter(Stage::SpaceChecked);
        if init {
            self.init_repository()?;
        }

        let mut scopes = Vec::new();
        let mut unpaused: Vec<String> = Vec::new();
        let mut unpaused_workloads = 0;
        for volume in seq.in_order() {
            self.checkpoint()?;
            match self.backup_one_volume(record, volume)? {
                Some(scope) => scopes.push(scope),
                None => {
                    unpaused_workloads += volume.running.len();
                    unpaused.push(volume.name.clone());
                }
            }
        }

        if !scopes.is_empty() {
            self.after_snapshot(record, &scopes)?;
        }
        Self::interventions_error(record)?;
        if !unpaused.is_empty() {
            return Err(RunError::PartialPause {
                target: unpaused.join(", "),
                failed: unpaused_workloads,
            }
            .into());
        }
        record.enter(Stage::Done);
        Ok(())
    }

    /// Pause, snapshot and resume one volume. `None` when the volume was
    /// skipped because its workloads could not all be stopped.
    fn backup_one_volume(&self, record: &mut OperationRecord, volume: &Volume) -> Result<Option<Scope>> {
        let running: Vec<String> = volume.running.iter().cloned().collect();
        let outcome = self.controller().pause(&running);
        record.stopped.workloads.extend(outcome.stopped.workloads.iter().cloned());
        record.enter(Stage::Paused);

        if !outcome.is_complete() {
            warn!(
                volume = %volume.name,
                failed = outcome.failures.len(),
                "could not stop every workload, skipping volume"
            );
            for (workload, err) in &outcome.failures {
                record.warn(format!("{}: could not stop {workload}: {err}", volume.name));
            }
            record.skipped.push(format!("{} (pause failed)", volume.name));
            self.resume_stopped(record);
            return Ok(None);
        }

        self.checkpoint()?;
        record.enter(Stage::Snapshotting);
        let scope = Scope::Volume(volume.name.clone());
        let created = self.snapshot(&scope, volume.mountpoint.clone(), vec![PathBuf::from(".")])?;
        record.archives.push(created);
        self.resume_stopped(record);
        Ok(Some(scope))
    }

    fn snapshot(&self, scope: &Scope, base_dir: PathBuf, paths: Vec<PathBuf>) -> Result<CreatedArchive> {
        let name = ArchiveName::new(scope, OffsetDateTime::now_utc()).to_string();
        info!(archive = %name, base = %base_dir.display(), "creating archive");
        let stats = self
            .deps
            .engine
            .create(&CreateRequest {
                archive: name.clone(),
                base_dir,
                paths,
                compression: self.config.archive.compression.clone(),
                progress: self.options.progress,
            })
            .with_context(|| format!("failed to create archive {name}"))?;
        info!(
            archive = %name,
            original = stats.original_size,
            compressed = stats.compressed_size,
            deduplicated = stats.deduplicated_size,
            "archive created"
        );
        Ok(CreatedArchive { name, stats })
    }

    /// Verify, prune, compact and sync once every snapshot of the run exists.
    fn after_snapshot(&self, record: &mut OperationRecord, scopes: &[Scope]) -> Result<()> {
        if self.config.archive.verify {
            self.checkpoint()?;
            record.enter(Stage::Verifying);
            for archive in &record.archives {
                let report = self
                    .deps
                    .engine
                    .check(Some(&archive.name))
                    .with_context(|| format!("verification of {} failed", archive.name))?;
                debug!(archive = %archive.name, report = %report.trim(), "archive verified");
            }
        }

        self.checkpoint()?;
        record.enter(Stage::Pruning);
        for scope in scopes {
            self.deps
                .engine
                .prune(&scope.glob(), &self.config.retention, false)
                .with_context(|| format!("failed to prune {scope}"))?;
        }

        if self.config.archive.compact {
            self.checkpoint()?;
            record.enter(Stage::Compacting);
            self.deps.engine.compact().context("failed to compact repository")?;
        }

        self.sync_remote(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::RunError;
    use crate::lock::RunLock;
    use crate::orchestrator::{Collaborators, RunOptions};
    use crate::testing::{test_config, FakeEngine, FakeNotifier, FakeProbe, FakeRuntime};

    const MB: u64 = 1_000_000;

    fn orchestrator<'a>(
        config: &'a Config,
        runtime: &'a FakeRuntime,
        engine: &'a FakeEngine,
        probe: &'a FakeProbe,
        options: RunOptions,
    ) -> Orchestrator<'a> {
        Orchestrator::new(
            config,
            Collaborators {
                runtime,
                engine,
                capacity: probe,
                remote: None,
                notifier: None,
            },
            options,
        )
    }

    fn volumes_config(dir: &std::path::Path) -> Config {
        let mut config = test_config(dir);
        config.selection.mode = Mode::Volumes;
        config.selection.priority = vec!["A".to_string()];
        config
    }

    #[test]
    fn deferred_volume_is_processed_last_and_only_running_workload_is_paused() {
        let dir = tempfile::tempdir().unwrap();
        let config = volumes_config(dir.path());
        let runtime = FakeRuntime::new()
            .volume("v1", &[("A", true)])
            .volume("v2", &[("B", false)])
            .volume("v3", &[]);
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        report.result.as_ref().unwrap();

        let creates: Vec<String> = engine
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create "))
            .collect();
        assert_eq!(creates.len(), 3);
        assert!(creates[0].starts_with("create volume-v2@"));
        assert!(creates[1].starts_with("create volume-v3@"));
        assert!(creates[2].starts_with("create volume-v1@"));
        assert_eq!(runtime.calls(), vec!["stop A", "start A"]);
        assert!(!runtime.running("B"));
        assert!(!config.paths.lock.exists());
        assert!(report.summary.succeeded);
        assert_eq!(report.summary.archives.len(), 3);
    }

    #[test]
    fn pause_happens_around_the_volume_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = volumes_config(dir.path());
        let runtime = FakeRuntime::new().volume("v1", &[("A", true)]);
        let engine = FakeEngine::new().observe_runtime(&runtime);
        let probe = FakeProbe::new(u64::MAX);

        orchestrator(&config, &runtime, &engine, &probe, RunOptions::default())
            .backup(&[])
            .result
            .unwrap();
        let calls = runtime.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], "stop A");
        assert!(calls[1].starts_with("create volume-v1@"));
        assert_eq!(calls[2], "start A");
    }

    #[test]
    fn insufficient_space_aborts_before_any_pause() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.space.overhead_percent = 0;
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(400 * MB).with_estimate(500 * MB);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        assert!(matches!(
            report.run_error(),
            Some(RunError::InsufficientSpace { required, available, .. })
                if *required == 500 * MB && *available == 400 * MB
        ));
        assert!(runtime.calls().is_empty());
        assert!(!engine.calls().iter().any(|c| c.starts_with("create")));
        assert!(!config.paths.lock.exists());
        assert!(!report.summary.succeeded);
    }

    #[test]
    fn force_proceeds_past_space_shortage() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(400 * MB).with_estimate(500 * MB);
        let options = RunOptions {
            force: true,
            ..RunOptions::default()
        };

        let report = orchestrator(&config, &runtime, &engine, &probe, options).backup(&[]);
        report.result.unwrap();
        assert_eq!(runtime.calls(), vec!["platform stop", "platform start"]);
    }

    #[test]
    fn data_root_backup_runs_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        report.result.as_ref().unwrap();

        let calls = engine.calls();
        let kinds: Vec<&str> = calls.iter().map(|c| c.split(' ').next().unwrap()).collect();
        assert_eq!(kinds, vec!["exists", "create", "check", "prune", "compact"]);
        assert!(calls[3].contains("docker-data@*"));
        assert_eq!(runtime.calls(), vec!["platform stop", "platform start"]);
        assert_eq!(report.summary.final_stage, Stage::Done);
        assert!(!config.paths.lock.exists());
    }

    #[test]
    fn missing_repository_is_created_after_the_space_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.archive.auto_init = true;
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new().missing_repository();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        report.result.as_ref().unwrap();
        let calls = engine.calls();
        assert_eq!(calls[0], "exists");
        assert_eq!(calls[1], format!("init {}", config.archive.encryption));
        assert!(calls[2].starts_with("create"));
    }

    #[test]
    fn space_shortage_leaves_a_missing_repository_uncreated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = volumes_config(dir.path());
        config.archive.auto_init = true;
        config.space.overhead_percent = 0;
        let runtime = FakeRuntime::new().volume("v1", &[("A", true)]);
        let engine = FakeEngine::new().missing_repository();
        let probe = FakeProbe::new(400 * MB).with_estimate(500 * MB);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        assert!(matches!(report.run_error(), Some(RunError::InsufficientSpace { .. })));
        assert_eq!(engine.calls(), vec!["exists"]);
        assert!(runtime.calls().iter().all(|c| !c.starts_with("stop")));
    }

    #[test]
    fn failed_snapshot_still_resumes_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new().fail_on("create");
        let probe = FakeProbe::new(u64::MAX);
        let notifier = FakeNotifier::default();
        let orch = Orchestrator::new(
            &config,
            Collaborators {
                runtime: &runtime,
                engine: &engine,
                capacity: &probe,
                remote: None,
                notifier: Some(&notifier),
            },
            RunOptions::default(),
        );

        let report = orch.backup(&[]);
        assert!(report.result.is_err());
        assert_eq!(runtime.calls(), vec!["platform stop", "platform start"]);
        assert!(!engine.calls().iter().any(|c| c.starts_with("prune")));
        assert!(!config.paths.lock.exists());
        assert_eq!(report.summary.failed_at, Some(Stage::Snapshotting));
        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(!delivered[0].succeeded);
    }

    #[test]
    fn cancellation_during_snapshot_stops_before_prune() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = FakeRuntime::new();
        let options = RunOptions::default();
        let engine = FakeEngine::new().cancel_during("create", options.cancel.clone());
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, options).backup(&[]);
        assert_eq!(report.run_error(), Some(&RunError::Cancelled));
        assert_eq!(runtime.calls(), vec!["platform stop", "platform start"]);
        assert!(!engine.calls().iter().any(|c| c.starts_with("check") || c.starts_with("prune")));
        assert!(!config.paths.lock.exists());
    }

    #[test]
    fn busy_lock_fails_fast_and_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let _held = RunLock::acquire(&config.paths.lock).unwrap();
        let runtime = FakeRuntime::new();
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        assert_eq!(
            report.run_error(),
            Some(&RunError::LockBusy {
                pid: std::process::id()
            })
        );
        assert!(runtime.calls().is_empty());
        assert!(engine.calls().is_empty());
        assert!(config.paths.lock.exists());
    }

    #[test]
    fn partial_pause_skips_volume_but_backs_up_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = volumes_config(dir.path());
        config.selection.priority.clear();
        let runtime = FakeRuntime::new()
            .volume("shared", &[("A", true), ("B", true)])
            .volume("solo", &[("C", true)])
            .fail_stop("B");
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        assert!(matches!(report.run_error(), Some(RunError::PartialPause { .. })));
        assert_eq!(runtime.calls(), vec!["stop A", "stop B", "start A", "stop C", "start C"]);
        let creates: Vec<_> = engine.calls().into_iter().filter(|c| c.starts_with("create")).collect();
        assert_eq!(creates.len(), 1);
        assert!(creates[0].starts_with("create volume-solo@"));
        assert!(runtime.running("A") && runtime.running("B") && runtime.running("C"));
    }

    #[test]
    fn skipped_in_use_volumes_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = volumes_config(dir.path());
        config.selection.skip_in_use = true;
        let runtime = FakeRuntime::new().volume("busy", &[("A", true)]).volume("idle", &[]);
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let report = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default()).backup(&[]);
        report.result.as_ref().unwrap();
        assert_eq!(report.summary.skipped, vec!["busy (in use)".to_string()]);
        assert!(runtime.calls().is_empty());
    }

    #[test]
    fn dry_run_plan_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = volumes_config(dir.path());
        let runtime = FakeRuntime::new().volume("v1", &[("A", true)]).volume("v2", &[]);
        let engine = FakeEngine::new();
        let probe = FakeProbe::new(u64::MAX);

        let plan = orchestrator(&config, &runtime, &engine, &probe, RunOptions::default())
            .plan_backup(&[])
            .unwrap();
        let BackupPlan::Volumes(seq) = plan else {
            panic!("expected volume plan")
        };
        assert_eq!(seq.deferred.len(), 1);
        assert!(runtime.calls().is_empty());
        assert!(engine.calls().is_empty());
        assert!(!config.paths.lock.exists());
    }
}
