use crate::model::ArchiveStats;
use crate::pause::Stopped;
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Backup,
    Restore,
    Cleanup,
    Download,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Cleanup => "cleanup",
            Self::Download => "download",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    LockAcquired,
    Mapped,
    Validated,
    SpaceChecked,
    Paused,
    Snapshotting,
    CurrentDataRelocated,
    Extracting,
    PermissionsFixed,
    Resumed,
    FunctionalCheck,
    Verifying,
    Pruning,
    Compacting,
    Syncing,
    Downloading,
    Done,
    Failed,
    RolledBack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedArchive {
    pub name: String,
    pub stats: ArchiveStats,
}

/// Working state of one run. Lives for the run only.
#[derive(Debug)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub target: String,
    pub stage: Stage,
    pub history: Vec<Stage>,
    pub stopped: Stopped,
    /// Where the current data root was moved aside to, while it is there.
    pub relocated: Option<PathBuf>,
    /// Stage the run was in when it first failed, kept across rollback.
    pub failed_at: Option<Stage>,
    pub archives: Vec<CreatedArchive>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
    pub interventions: Vec<String>,
    pub succeeded: bool,
    pub started_at: OffsetDateTime,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            stage: Stage::Idle,
            history: vec![Stage::Idle],
            stopped: Stopped::default(),
            relocated: None,
            failed_at: None,
            archives: Vec::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
            interventions: Vec::new(),
            succeeded: false,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        info!(operation = %self.kind, target = %self.target, stage = %stage, "stage");
        self.stage = stage;
        self.history.push(stage);
    }

    /// Remember where the run failed. Only the first call counts.
    pub fn mark_failed(&mut self) {
        self.failed_at.get_or_insert(self.stage);
    }

    pub fn visited(&self, stage: Stage) -> bool {
        self.history.contains(&stage)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}
