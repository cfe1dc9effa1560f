use anyhow::Result;
use std::path::Path;

/// Off-host copy of the repository.
pub trait RemoteSync {
    /// Human-readable destination, for logs.
    fn describe(&self) -> String;

    /// Mirror `local` to the remote.
    fn push(&self, local: &Path) -> Result<()>;

    /// Entries held remotely, one per line of the remote listing.
    fn list(&self) -> Result<Vec<String>>;

    /// Copy the remote repository into `staging`.
    fn pull(&self, staging: &Path) -> Result<()>;
}
