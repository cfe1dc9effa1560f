use crate::config::Retention;
use crate::model::{ArchiveEntry, ArchiveStats};
use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub archive: String,
    /// Working directory of the engine; relative `paths` resolve against it.
    pub base_dir: PathBuf,
    pub paths: Vec<PathBuf>,
    pub compression: String,
    pub progress: bool,
}

/// How to pull a data root out of an archive into a target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionPlan {
    /// Archive subtree to extract; everything when `None`.
    pub include: Option<String>,
    /// Leading path components dropped from every extracted path.
    pub strip_components: usize,
}

impl ExtractionPlan {
    pub fn everything() -> Self {
        Self {
            include: None,
            strip_components: 0,
        }
    }
}

/// Typed calls into the content-addressed archive engine. Failures carry the
/// engine's diagnostic output in the error chain.
pub trait ArchiveEngine {
    fn repository_exists(&self) -> Result<bool>;

    fn init(&self, encryption: &str) -> Result<()>;

    fn create(&self, request: &CreateRequest) -> Result<ArchiveStats>;

    /// Consistency check of the repository, or of one archive. Returns the
    /// engine's report text.
    fn check(&self, archive: Option<&str>) -> Result<String>;

    fn prune(&self, glob: &str, retention: &Retention, dry_run: bool) -> Result<String>;

    fn compact(&self) -> Result<()>;

    fn list_archives(&self) -> Result<Vec<ArchiveEntry>>;

    fn info(&self, archive: &str) -> Result<ArchiveStats>;

    /// First `limit` stored paths of `archive`, in archive order.
    fn list_paths(&self, archive: &str, limit: usize) -> Result<Vec<String>>;

    fn extract(&self, archive: &str, target: &Path, plan: &ExtractionPlan, progress: bool) -> Result<()>;
}
