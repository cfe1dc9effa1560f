use thiserror::Error;

/// Conditions the caller has to tell apart from a generic failure.
///
/// These travel inside `anyhow::Error` and are recovered with
/// `downcast_ref::<RunError>()` where an exit code or a rollback decision
/// depends on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("another run holds the lock (pid {pid})")]
    LockBusy { pid: u32 },

    #[error("insufficient space at {destination}: need {required} bytes, {available} available")]
    InsufficientSpace {
        destination: String,
        required: u64,
        available: u64,
    },

    #[error("run cancelled by signal")]
    Cancelled,

    #[error("selection matched no volumes")]
    NothingSelected,

    #[error("archive {archive} does not contain a recognizable data root")]
    LayoutUnrecognized { archive: String },

    #[error("could not pause {failed} of the workloads bound to {target}")]
    PartialPause { target: String, failed: usize },

    #[error("manual intervention required: {0}")]
    ManualIntervention(String),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl RunError {
    /// Whether this error was raised before anything was mutated.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. } | Self::NothingSelected | Self::Precondition(_)
        )
    }
}
