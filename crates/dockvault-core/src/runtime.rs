use crate::model::{VolumeInfo, WorkloadId};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    Inactive,
    Transitioning,
    Failed,
}

/// The container platform as the orchestrator sees it.
///
/// Implementations block until the underlying command returns; waiting for
/// the platform service to settle is the caller's job.
pub trait ContainerRuntime {
    fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Create the volume if it does not exist yet and return where it lives.
    fn ensure_volume(&self, name: &str) -> Result<VolumeInfo>;

    /// Workloads bound to `volume`; only running ones when `running_only`.
    fn workloads_using(&self, volume: &str, running_only: bool) -> Result<Vec<WorkloadId>>;

    fn is_running(&self, workload: &str) -> Result<bool>;

    fn stop_workload(&self, workload: &str) -> Result<()>;

    fn start_workload(&self, workload: &str) -> Result<()>;

    fn platform_state(&self) -> Result<ServiceState>;

    fn request_platform_stop(&self) -> Result<()>;

    fn request_platform_start(&self) -> Result<()>;

    /// Forceful stop used before retrying a start that did not settle.
    fn kill_platform(&self) -> Result<()>;

    /// Cheap end-to-end check that the platform answers requests.
    fn probe(&self) -> Result<()>;
}
