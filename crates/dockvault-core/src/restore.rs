//! Replace a data root (or one volume's content) with an archive's copy.
//!
//! The current content is renamed aside before anything is extracted, and is
//! renamed back if any later step fails.

use crate::engine::ExtractionPlan;
use crate::error::RunError;
use crate::layout::{self, LayoutDecision, LayoutProfile};
use crate::lock::RunLock;
use crate::model::{self, ArchiveName, Scope, WorkloadId};
use crate::orchestrator::{Orchestrator, RunReport};
use crate::pause::Stopped;
use crate::record::{OperationKind, OperationRecord, Stage};
use crate::space;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{chown, MetadataExt};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Archive name, or `latest` for the newest archive of the target.
    pub archive: String,
    /// Restore one volume instead of the whole data root.
    pub volume: Option<String>,
    pub keep_relocated: bool,
}

/// Where the restored content goes and who must be stopped for it.
struct RestoreTarget {
    scope: Scope,
    dir: PathBuf,
    profile: LayoutProfile,
    /// `None` means the whole platform.
    workloads: Option<Vec<WorkloadId>>,
}

/// What was started again after the swap, so a rollback can stop it again.
struct Resumed {
    set: Stopped,
    interventions_mark: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn restore(&self, request: &RestoreRequest) -> RunReport {
        let target = match &request.volume {
            Some(volume) => format!("volume {volume}"),
            None => self.config.paths.data_root.display().to_string(),
        };
        let mut record = OperationRecord::new(OperationKind::Restore, target);
        let mut lock = None;
        let result = self.run_restore(&mut record, &mut lock, request);
        self.finish(record, lock, result)
    }

    fn run_restore(
        &self,
        record: &mut OperationRecord,
        lock: &mut Option<RunLock>,
        request: &RestoreRequest,
    ) -> Result<()> {
        self.checkpoint()?;
        self.acquire(record, lock)?;
        self.ensure_repository(false)?;

        let target = self.restore_target(request)?;
        let archive = self.resolve(&request.archive, &target.scope)?;
        info!(archive = %archive, target = %target.dir.display(), "restore validated");
        record.enter(Stage::Validated);

        let stats = self
            .deps
            .engine
            .info(&archive)
            .with_context(|| format!("failed to read size of {archive}"))?;
        space::check(
            self.deps.capacity,
            stats.original_size,
            &target.dir,
            self.config.space.overhead_percent,
            self.options.force,
        )?;
        record.enter(Stage::SpaceChecked);

        let staging = sibling(&target.dir, "restore-staging")?;
        let result = self.restore_into(record, &archive, &target, &staging, request.keep_relocated);
        if staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %err, "failed to remove staging area");
                record.warn(format!("remove {} by hand", staging.display()));
            }
        }
        result
    }

    fn restore_target(&self, request: &RestoreRequest) -> Result<RestoreTarget> {
        let target = match &request.volume {
            Some(name) => {
                let info = self
                    .deps
                    .runtime
                    .ensure_volume(name)
                    .with_context(|| format!("failed to prepare volume {name}"))?;
                let workloads = self
                    .deps
                    .runtime
                    .workloads_using(name, true)
                    .with_context(|| format!("failed to list workloads using {name}"))?;
                RestoreTarget {
                    scope: Scope::Volume(name.clone()),
                    profile: LayoutProfile::volume(&info.mountpoint),
                    dir: info.mountpoint,
                    workloads: Some(workloads),
                }
            }
            None => {
                let dir = self.config.paths.data_root.clone();
                RestoreTarget {
                    scope: Scope::DataRoot(self.config.archive.data_root_scope.clone()),
                    profile: LayoutProfile::data_root(&dir),
                    dir,
                    workloads: None,
                }
            }
        };
        if !target.dir.is_dir() {
            return Err(RunError::Precondition(format!(
                "restore target {} is not a directory",
                target.dir.display()
            ))
            .into());
        }
        Ok(target)
    }

    fn resolve(&self, requested: &str, scope: &Scope) -> Result<String> {
        let entries = self
            .deps
            .engine
            .list_archives()
            .context("failed to list archives")?;
        let archive = model::resolve_archive(&entries, requested, scope)
            .map_err(|err| RunError::Precondition(format!("{err:#}")))?;
        if let Some(name) = ArchiveName::parse(&archive) {
            if name.scope != scope.to_string() {
                return Err(RunError::Precondition(format!(
                    "archive {archive} holds {}, not {scope}",
                    name.scope
                ))
                .into());
            }
        }
        Ok(archive)
    }

    fn restore_into(
        &self,
        record: &mut OperationRecord,
        archive: &str,
        target: &RestoreTarget,
        staging: &Path,
        keep_relocated: bool,
    ) -> Result<()> {
        let decision = self.classify(archive, &target.profile)?;

        // An unrecognized layout is resolved before anything is stopped.
        let prepared = match &decision {
            LayoutDecision::Targeted(_) => None,
            LayoutDecision::Ambiguous => {
                warn!(archive, "archive layout not recognized, extracting everything to search it");
                Some(self.extract_and_locate(archive, &target.profile, staging)?)
            }
        };

        self.checkpoint()?;
        self.pause_target(record, target)?;
        record.enter(Stage::Paused);

        let mut resumed = None;
        let result = self.swap(record, archive, target, decision, prepared, staging, keep_relocated, &mut resumed);
        if result.is_err() {
            record.mark_failed();
            if record.relocated.is_some() {
                self.roll_back(record, &target.dir, resumed);
            }
        }
        result
    }

    fn classify(&self, archive: &str, profile: &LayoutProfile) -> Result<LayoutDecision> {
        let sample = self
            .deps
            .engine
            .list_paths(archive, self.config.archive.sample_limit)
            .with_context(|| format!("failed to list contents of {archive}"))?;
        let decision = layout::classify(profile, &sample);
        match &decision {
            LayoutDecision::Targeted(c) => info!(
                archive,
                layout = ?c.kind,
                confidence = ?c.confidence,
                strip = c.plan.strip_components,
                "archive layout recognized"
            ),
            LayoutDecision::Ambiguous => debug!(archive, sampled = sample.len(), "no layout matched"),
        }
        Ok(decision)
    }

    fn pause_target(&self, record: &mut OperationRecord, target: &RestoreTarget) -> Result<()> {
        match &target.workloads {
            None => self.controller().pause_platform(&mut record.stopped),
            Some(workloads) => {
                let outcome = self.controller().pause(workloads);
                record.stopped.workloads.extend(outcome.stopped.workloads.iter().cloned());
                if outcome.is_complete() {
                    return Ok(());
                }
                for (workload, err) in &outcome.failures {
                    record.warn(format!("could not stop {workload}: {err}"));
                }
                Err(RunError::PartialPause {
                    target: target.scope.to_string(),
                    failed: outcome.failures.len(),
                }
                .into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn swap(
        &self,
        record: &mut OperationRecord,
        archive: &str,
        target: &RestoreTarget,
        decision: LayoutDecision,
        prepared: Option<PathBuf>,
        staging: &Path,
        keep_relocated: bool,
        resumed: &mut Option<Resumed>,
    ) -> Result<()> {
        let dir = &target.dir;
        self.checkpoint()?;
        let aside = sibling(dir, "pre-restore")?;
        fs::rename(dir, &aside)
            .with_context(|| format!("failed to move {} aside to {}", dir.display(), aside.display()))?;
        record.relocated = Some(aside.clone());
        info!(from = %dir.display(), to = %aside.display(), "current data moved aside");
        record.enter(Stage::CurrentDataRelocated);

        self.checkpoint()?;
        record.enter(Stage::Extracting);
        match (prepared, decision) {
            (Some(found), _) => install(&found, dir)?,
            (None, LayoutDecision::Targeted(classification)) => {
                if let Err(err) = self.extract_targeted(archive, dir, &classification.plan) {
                    warn!(
                        archive,
                        error = %format!("{err:#}"),
                        "targeted extraction failed, falling back to a full extraction"
                    );
                    remove_if_present(dir)?;
                    let found = self.extract_and_locate(archive, &target.profile, staging)?;
                    install(&found, dir)?;
                }
            }
            (None, LayoutDecision::Ambiguous) => {
                return Err(RunError::LayoutUnrecognized {
                    archive: archive.to_string(),
                }
                .into())
            }
        }

        self.checkpoint()?;
        match_permissions(&aside, dir)?;
        record.enter(Stage::PermissionsFixed);

        self.checkpoint()?;
        let set = record.stopped.clone();
        let mark = record.interventions.len();
        let report = self.resume_stopped(record);
        *resumed = Some(Resumed {
            set: set.clone(),
            interventions_mark: mark,
        });
        if !report.is_clean() {
            let names: Vec<&str> = report.failed.iter().map(|(w, _)| w.as_str()).collect();
            return Err(anyhow!("did not come back after restore: {}", names.join(", ")));
        }

        if self.config.restore.functional_check {
            record.enter(Stage::FunctionalCheck);
            self.functional_check(&set)?;
        }

        if keep_relocated || self.config.restore.keep_relocated {
            info!(path = %aside.display(), "previous data kept");
            record.warn(format!("previous data kept at {}", aside.display()));
        } else if let Err(err) = fs::remove_dir_all(&aside) {
            warn!(path = %aside.display(), error = %err, "failed to remove previous data");
            record.warn(format!("remove {} by hand", aside.display()));
        }
        record.relocated = None;
        record.enter(Stage::Done);
        Ok(())
    }

    fn extract_targeted(&self, archive: &str, dir: &Path, plan: &ExtractionPlan) -> Result<()> {
        fs::create_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        self.deps
            .engine
            .extract(archive, dir, plan, self.options.progress)?;
        let empty = fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .next()
            .is_none();
        if empty {
            return Err(anyhow!("extraction of {archive} produced nothing"));
        }
        Ok(())
    }

    /// Extract all of `archive` into `staging` and search it for content that
    /// matches `profile`.
    pub(crate) fn extract_and_locate(
        &self,
        archive: &str,
        profile: &LayoutProfile,
        staging: &Path,
    ) -> Result<PathBuf> {
        remove_if_present(staging)?;
        fs::create_dir_all(staging)
            .with_context(|| format!("failed to create staging area {}", staging.display()))?;
        self.deps
            .engine
            .extract(archive, staging, &ExtractionPlan::everything(), self.options.progress)
            .with_context(|| format!("full extraction of {archive} failed"))?;
        match layout::find_data_root(profile, staging) {
            Some(found) => {
                info!(found = %found.display(), "located content in full extraction");
                Ok(found)
            }
            None => Err(RunError::LayoutUnrecognized {
                archive: archive.to_string(),
            }
            .into()),
        }
    }

    fn functional_check(&self, resumed: &Stopped) -> Result<()> {
        self.deps
            .runtime
            .probe()
            .context("platform does not answer after restore")?;
        for workload in &resumed.workloads {
            let running = self
                .deps
                .runtime
                .is_running(workload)
                .with_context(|| format!("failed to inspect {workload}"))?;
            if !running {
                return Err(anyhow!("{workload} is not running after restore"));
            }
        }
        info!("functional check passed");
        Ok(())
    }

    /// Put the relocated content back. Everything that was started after the
    /// swap is stopped first and left for [`Orchestrator::finish`] to start.
    fn roll_back(&self, record: &mut OperationRecord, dir: &Path, resumed: Option<Resumed>) {
        let Some(aside) = record.relocated.clone() else {
            return;
        };
        warn!(target = %dir.display(), "rolling back restore");

        if let Some(resumed) = resumed {
            record.interventions.truncate(resumed.interventions_mark);
            let controller = self.controller();
            let outcome = controller.pause(&resumed.set.workloads);
            for (workload, err) in &outcome.failures {
                record.warn(format!("could not stop {workload} for rollback: {err}"));
            }
            if resumed.set.platform {
                let mut platform = Stopped::default();
                if let Err(err) = controller.pause_platform(&mut platform) {
                    record.warn(format!("could not stop platform for rollback: {err:#}"));
                }
            }
            record.stopped = resumed.set;
        }

        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(dir) {
                warn!(path = %dir.display(), error = %err, "failed to remove restored data");
                let moved = sibling(dir, "failed-restore").and_then(|failed| {
                    fs::rename(dir, &failed)
                        .with_context(|| format!("failed to move {} aside", dir.display()))?;
                    Ok(failed)
                });
                match moved {
                    Ok(failed) => record.warn(format!("remove {} by hand", failed.display())),
                    Err(err) => {
                        self.abandon_rollback(record, dir, &aside, &err);
                        return;
                    }
                }
            }
        }

        match fs::rename(&aside, dir) {
            Ok(()) => {
                info!(path = %dir.display(), "previous data moved back");
                record.relocated = None;
                record.enter(Stage::RolledBack);
            }
            Err(err) => self.abandon_rollback(record, dir, &aside, &anyhow!(err)),
        }
    }

    /// The previous data could not be put back. Nothing is started on top of
    /// a half-restored tree.
    fn abandon_rollback(&self, record: &mut OperationRecord, dir: &Path, aside: &Path, err: &anyhow::Error) {
        error!(
            target = %dir.display(),
            previous = %aside.display(),
            error = %format!("{err:#}"),
            "rollback failed, manual intervention required"
        );
        record.interventions.push(format!(
            "previous data is at {}; move it back to {} and start the stopped services by hand",
            aside.display(),
            dir.display()
        ));
        record.stopped = Stopped::default();
    }
}

/// Path next to `dir` named `<name>.<label>-<stamp>`.
fn sibling(dir: &Path, label: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| anyhow!("{} has no final component", dir.display()))?
        .to_string_lossy();
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]-[hour][minute][second]"))
        .context("failed to format timestamp")?;
    Ok(dir.with_file_name(format!("{name}.{label}-{stamp}")))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn install(found: &Path, dir: &Path) -> Result<()> {
    fs::rename(found, dir)
        .with_context(|| format!("failed to move {} into {}", found.display(), dir.display()))
}

/// Copy mode and ownership of the previous root directory onto the new one.
fn match_permissions(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::metadata(from).with_context(|| format!("failed to stat {}", from.display()))?;
    fs::set_permissions(to, meta.permissions())
        .with_context(|| format!("failed to set mode on {}", to.display()))?;
    match chown(to, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            debug!(path = %to.display(), "not permitted to change owner");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("failed to set owner on {}", to.display())),
    }
}
