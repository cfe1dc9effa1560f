//! Stops the minimum set of workloads for a consistent snapshot and starts
//! exactly those again.

use crate::config::ServiceSettings;
use crate::error::RunError;
use crate::model::WorkloadId;
use crate::runtime::{ContainerRuntime, ServiceState};
use anyhow::{anyhow, Result};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything one controller stopped and therefore owns restarting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stopped {
    pub workloads: Vec<WorkloadId>,
    pub platform: bool,
}

impl Stopped {
    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty() && !self.platform
    }
}

#[derive(Debug, Default)]
pub struct PauseOutcome {
    pub stopped: Stopped,
    pub failures: Vec<(WorkloadId, String)>,
}

impl PauseOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Workloads that could not be restarted and need an operator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub started: Vec<WorkloadId>,
    pub failed: Vec<(WorkloadId, String)>,
}

impl ResumeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Waits {
    pub timeout: Duration,
    pub poll: Duration,
    pub start_attempts: u32,
}

impl From<&ServiceSettings> for Waits {
    fn from(settings: &ServiceSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.transition_timeout_secs),
            poll: Duration::from_millis(settings.poll_interval_ms),
            start_attempts: settings.start_attempts,
        }
    }
}

pub struct PauseController<'a> {
    runtime: &'a dyn ContainerRuntime,
    waits: Waits,
}

impl<'a> PauseController<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, waits: Waits) -> Self {
        Self { runtime, waits }
    }

    /// Best-effort stop of every running workload in `workloads`.
    ///
    /// Already-stopped workloads are neither touched nor recorded. A failure
    /// to stop one workload is recorded and the rest are still attempted.
    pub fn pause(&self, workloads: &[WorkloadId]) -> PauseOutcome {
        let mut outcome = PauseOutcome::default();
        for workload in workloads {
            match self.runtime.is_running(workload) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => {
                    warn!(workload = %workload, error = %err, "could not inspect workload");
                    outcome.failures.push((workload.clone(), format!("{err:#}")));
                    continue;
                }
            }
            match self.runtime.stop_workload(workload) {
                Ok(()) => {
                    info!(workload = %workload, "workload stopped");
                    outcome.stopped.workloads.push(workload.clone());
                }
                Err(err) => {
                    warn!(workload = %workload, error = %err, "failed to stop workload");
                    outcome.failures.push((workload.clone(), format!("{err:#}")));
                }
            }
        }
        outcome
    }

    /// Start exactly what `stopped` lists, draining it. Not retried.
    pub fn resume(&self, stopped: &mut Stopped) -> ResumeReport {
        let mut report = ResumeReport::default();
        for workload in stopped.workloads.drain(..) {
            match self.runtime.start_workload(&workload) {
                Ok(()) => {
                    info!(workload = %workload, "workload started");
                    report.started.push(workload);
                }
                Err(err) => {
                    error!(
                        workload = %workload,
                        error = %err,
                        "failed to restart workload, manual intervention required"
                    );
                    report.failed.push((workload, format!("{err:#}")));
                }
            }
        }
        if stopped.platform {
            stopped.platform = false;
            match self.resume_platform() {
                Ok(()) => report.started.push(PLATFORM.to_string()),
                Err(err) => {
                    error!(error = %err, "platform did not come back, manual intervention required");
                    report.failed.push((PLATFORM.to_string(), format!("{err:#}")));
                }
            }
        }
        report
    }

    /// Stop the platform service and wait for it to settle.
    ///
    /// `stopped.platform` is set as soon as a stop was requested for an
    /// active platform, so a timeout still leads to a restart attempt.
    pub fn pause_platform(&self, stopped: &mut Stopped) -> Result<()> {
        match self.runtime.platform_state()? {
            ServiceState::Inactive => {
                info!("platform already stopped, leaving it alone");
                return Ok(());
            }
            ServiceState::Failed => {
                return Err(RunError::Precondition("platform service is in a failed state".into()).into())
            }
            ServiceState::Active | ServiceState::Transitioning => {}
        }
        stopped.platform = true;
        self.runtime.request_platform_stop()?;
        if self.wait_for(ServiceState::Inactive)? {
            info!("platform stopped");
            Ok(())
        } else {
            Err(anyhow!(
                "platform did not stop within {}s",
                self.waits.timeout.as_secs()
            ))
        }
    }

    /// Start the platform, escalating to a forceful stop between attempts.
    pub fn resume_platform(&self) -> Result<()> {
        for attempt in 1..=self.waits.start_attempts {
            if let Err(err) = self.runtime.request_platform_start() {
                warn!(attempt, error = %err, "platform start request failed");
            } else if self.wait_for(ServiceState::Active)? {
                info!(attempt, "platform started");
                return Ok(());
            } else {
                warn!(attempt, "platform did not become active in time");
            }
            if attempt < self.waits.start_attempts {
                if let Err(err) = self.runtime.kill_platform() {
                    warn!(attempt, error = %err, "forceful platform stop failed");
                }
            }
        }
        Err(RunError::ManualIntervention(format!(
            "platform not active after {} start attempts",
            self.waits.start_attempts
        ))
        .into())
    }

    fn wait_for(&self, wanted: ServiceState) -> Result<bool> {
        let deadline = Instant::now() + self.waits.timeout;
        loop {
            let state = self.runtime.platform_state()?;
            if state == wanted {
                return Ok(true);
            }
            if state == ServiceState::Failed && wanted == ServiceState::Active {
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.waits.poll);
        }
    }
}

pub const PLATFORM: &str = "<platform>";
