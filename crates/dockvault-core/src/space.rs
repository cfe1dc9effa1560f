use crate::error::RunError;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

pub trait CapacityProbe {
    /// Free bytes on the filesystem holding `path` (or its nearest existing
    /// ancestor).
    fn available_bytes(&self, path: &Path) -> Result<u64>;

    /// Apparent size of everything under `path`.
    fn estimate_bytes(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by `df` and a directory walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl CapacityProbe for FsProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .ok_or_else(|| anyhow!("no existing ancestor for {}", path.display()))?;
        let output = Command::new("df")
            .args(["--output=avail", "-B1"])
            .arg(existing)
            .output()
            .with_context(|| format!("failed to run df on {}", existing.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "df failed on {}: {}",
                existing.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_df_avail(&String::from_utf8_lossy(&output.stdout))
    }

    fn estimate_bytes(&self, path: &Path) -> Result<u64> {
        let mut total: u64 = 0;
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
            if entry.file_type().is_file() {
                let meta = entry
                    .metadata()
                    .with_context(|| format!("failed to stat {}", entry.path().display()))?;
                total = total.saturating_add(meta.len());
            }
        }
        Ok(total)
    }
}

fn parse_df_avail(stdout: &str) -> Result<u64> {
    stdout
        .lines()
        .skip(1)
        .find_map(|line| line.trim().parse::<u64>().ok())
        .ok_or_else(|| anyhow!("unexpected df output: {stdout:?}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceVerdict {
    Sufficient,
    /// Short on space but the caller forced the run.
    Forced,
}

/// Source size plus the staging overhead.
pub fn required_bytes(source: u64, overhead_percent: u64) -> u64 {
    source.saturating_add(source.saturating_mul(overhead_percent) / 100)
}

/// Single point-in-time comparison; never waits and never retries.
pub fn check(
    probe: &dyn CapacityProbe,
    source_estimate: u64,
    destination: &Path,
    overhead_percent: u64,
    force: bool,
) -> Result<SpaceVerdict> {
    let required = required_bytes(source_estimate, overhead_percent);
    let available = probe.available_bytes(destination)?;
    if available >= required {
        info!(
            destination = %destination.display(),
            required,
            available,
            "space check passed"
        );
        return Ok(SpaceVerdict::Sufficient);
    }
    if force {
        warn!(
            destination = %destination.display(),
            required,
            available,
            "insufficient space, continuing because of --force"
        );
        return Ok(SpaceVerdict::Forced);
    }
    Err(RunError::InsufficientSpace {
        destination: destination.display().to_string(),
        required,
        available,
    }
    .into())
}
