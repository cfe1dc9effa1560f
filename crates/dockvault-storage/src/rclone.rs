use anyhow::{anyhow, Context, Result};
use dockvault_core::remote::RemoteSync;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Mirror through an `rclone` remote such as `b2:backups/borg`.
#[derive(Debug, Clone)]
pub struct RcloneRemote {
    binary: String,
    alias: String,
}

impl RcloneRemote {
    pub fn new(binary: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            alias: alias.into(),
        }
    }

    fn run_rclone(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {} {args:?}", self.binary))?;
        if !output.status.success() {
            return Err(anyhow!(
                "rclone {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub fn push_args<'a>(local: &'a str, alias: &'a str) -> Vec<&'a str> {
    vec!["sync", local, alias, "--checksum"]
}

pub fn pull_args<'a>(alias: &'a str, staging: &'a str) -> Vec<&'a str> {
    vec!["copy", alias, staging]
}

impl RemoteSync for RcloneRemote {
    fn describe(&self) -> String {
        format!("rclone:{}", self.alias)
    }

    fn push(&self, local: &Path) -> Result<()> {
        let local = local.display().to_string();
        self.run_rclone(&push_args(&local, &self.alias))?;
        info!(remote = %self.alias, "repository mirrored");
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let out = self.run_rclone(&["lsf", "-R", "--files-only", &self.alias])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    fn pull(&self, staging: &Path) -> Result<()> {
        let staging = staging.display().to_string();
        self.run_rclone(&pull_args(&self.alias, &staging))?;
        Ok(())
    }
}
