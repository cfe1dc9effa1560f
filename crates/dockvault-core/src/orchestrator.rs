use crate::cancel::CancelToken;
use crate::config::Config;
use crate::engine::ArchiveEngine;
use crate::error::RunError;
use crate::lock::RunLock;
use crate::pause::{PauseController, ResumeReport, Waits};
use crate::record::{OperationRecord, Stage};
use crate::remote::RemoteSync;
use crate::report::{Notifier, RunSummary};
use crate::runtime::ContainerRuntime;
use crate::space::{self, CapacityProbe};
use anyhow::{anyhow, Result};
use tracing::{error, info, warn};

pub struct Collaborators<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub engine: &'a dyn ArchiveEngine,
    pub capacity: &'a dyn CapacityProbe,
    pub remote: Option<&'a dyn RemoteSync>,
    pub notifier: Option<&'a dyn Notifier>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue past a failed space check and skip confirmations.
    pub force: bool,
    /// Pass the progress flag through to the archive engine.
    pub progress: bool,
    pub cancel: CancelToken,
}

/// Outcome of one guarded run. The summary is produced on every path.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub result: Result<()>,
}

impl RunReport {
    pub fn run_error(&self) -> Option<&RunError> {
        self.result.as_ref().err().and_then(|err| err.downcast_ref::<RunError>())
    }
}

pub struct Orchestrator<'a> {
    pub(crate) config: &'a Config,
    pub(crate) deps: Collaborators<'a>,
    pub(crate) options: RunOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, deps: Collaborators<'a>, options: RunOptions) -> Self {
        Self {
            config,
            deps,
            options,
        }
    }

    pub(crate) fn controller(&self) -> PauseController<'a> {
        PauseController::new(self.deps.runtime, Waits::from(&self.config.service))
    }

    pub(crate) fn checkpoint(&self) -> Result<()> {
        self.options.cancel.check()?;
        Ok(())
    }

    pub(crate) fn acquire(&self, record: &mut OperationRecord, lock: &mut Option<RunLock>) -> Result<()> {
        *lock = Some(RunLock::acquire(&self.config.paths.lock)?);
        record.enter(Stage::LockAcquired);
        Ok(())
    }

    pub(crate) fn ensure_repository(&self, may_init: bool) -> Result<()> {
        if self.repository_missing(may_init)? {
            self.init_repository()?;
        }
        Ok(())
    }

    /// `true` when the repository does not exist yet and this run may create
    /// it. Touches nothing.
    pub(crate) fn repository_missing(&self, may_init: bool) -> Result<bool> {
        if self.deps.engine.repository_exists()? {
            return Ok(false);
        }
        if may_init && self.config.archive.auto_init {
            return Ok(true);
        }
        Err(RunError::Precondition(format!(
            "repository {} does not exist; run `dockvault init` first",
            self.config.paths.repository
        ))
        .into())
    }

    pub(crate) fn init_repository(&self) -> Result<()> {
        info!(repository = %self.config.paths.repository, "initializing repository");
        self.deps.engine.init(&self.config.archive.encryption)
    }

    /// Space check against the repository's filesystem.
    pub(crate) fn preflight_repository(&self, source_estimate: u64) -> Result<()> {
        if !self.config.repository_is_local() {
            info!(
                repository = %self.config.paths.repository,
                "remote repository, skipping destination space check"
            );
            return Ok(());
        }
        space::check(
            self.deps.capacity,
            source_estimate,
            &self.config.repository_path(),
            self.config.space.overhead_percent,
            self.options.force,
        )?;
        Ok(())
    }

    /// Start everything the record still holds stopped.
    ///
    /// Workloads that do not come back are recorded as interventions; the
    /// caller decides whether to keep going.
    pub(crate) fn resume_stopped(&self, record: &mut OperationRecord) -> ResumeReport {
        if record.stopped.is_empty() {
            return ResumeReport::default();
        }
        let report = self.restart_stopped(record);
        record.enter(Stage::Resumed);
        report
    }

    /// Like [`Self::resume_stopped`] but leaves the stage alone, so a failed
    /// run keeps its terminal stage.
    fn restart_stopped(&self, record: &mut OperationRecord) -> ResumeReport {
        let report = self.controller().resume(&mut record.stopped);
        for (workload, err) in &report.failed {
            record
                .interventions
                .push(format!("start {workload} by hand: {err}"));
        }
        report
    }

    pub(crate) fn interventions_error(record: &OperationRecord) -> Result<()> {
        if record.interventions.is_empty() {
            return Ok(());
        }
        Err(RunError::ManualIntervention(record.interventions.join("; ")).into())
    }

    pub(crate) fn sync_remote(&self, record: &mut OperationRecord) -> Result<()> {
        let Some(remote) = self.deps.remote else {
            return Ok(());
        };
        if !self.config.repository_is_local() {
            warn!("repository is not local, skipping remote sync");
            record.warn("remote sync skipped: repository is not local");
            return Ok(());
        }
        self.checkpoint()?;
        record.enter(Stage::Syncing);
        remote
            .push(&self.config.repository_path())
            .map_err(|err| anyhow!("remote sync to {} failed: {err:#}", remote.describe()))
    }

    /// The single exit path of every guarded run: mark failure, resume what
    /// is still stopped, release the lock, notify.
    pub(crate) fn finish(
        &self,
        mut record: OperationRecord,
        lock: Option<RunLock>,
        result: Result<()>,
    ) -> RunReport {
        if result.is_err() {
            record.mark_failed();
        }
        let failed_at = record.failed_at;
        if let Err(err) = &result {
            error!(
                operation = %record.kind,
                target = %record.target,
                stage = %record.stage,
                error = %format!("{err:#}"),
                "run failed"
            );
            if record.stage != Stage::RolledBack {
                record.enter(Stage::Failed);
            }
        }

        if !record.stopped.is_empty() {
            warn!(operation = %record.kind, "resuming workloads stopped by this run");
            if result.is_ok() {
                self.resume_stopped(&mut record);
            } else {
                self.restart_stopped(&mut record);
            }
        }

        if let Some(mut lock) = lock {
            lock.release();
        }

        record.succeeded = result.is_ok() && record.interventions.is_empty();
        let error = match &result {
            Err(err) => Some(format!("{err:#}")),
            Ok(()) if !record.interventions.is_empty() => Some("manual intervention required".to_string()),
            Ok(()) => None,
        };
        let summary = RunSummary::from_record(&record, failed_at, error);
        self.notify(&summary);

        let result = match result {
            Ok(()) if !record.succeeded => Self::interventions_error(&record),
            other => other,
        };
        RunReport { summary, result }
    }

    fn notify(&self, summary: &RunSummary) {
        let Some(notifier) = self.deps.notifier else {
            return;
        };
        let only_on_failure = self
            .config
            .notify
            .as_ref()
            .map(|n| n.only_on_failure)
            .unwrap_or(false);
        if only_on_failure && summary.succeeded {
            return;
        }
        if let Err(err) = notifier.deliver(summary) {
            warn!(error = %format!("{err:#}"), "failed to deliver run summary");
        }
    }
}
