//! [`ArchiveEngine`] backed by the `borg` command line.
//!
//! Every call is one borg invocation. Exit status 1 is borg's "warning"
//! status: the operation completed and the warning is logged. Anything
//! higher is an error carrying borg's stderr.

use anyhow::{anyhow, Context, Result};
use dockvault_core::config::{Config, Retention};
use dockvault_core::engine::{ArchiveEngine, CreateRequest, ExtractionPlan};
use dockvault_core::model::{ArchiveEntry, ArchiveStats};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

const WARNING_STATUS: i32 = 1;

#[derive(Debug, Clone)]
pub struct BorgCli {
    binary: String,
    repository: String,
    passphrase: Option<String>,
    passcommand: Option<String>,
}

impl BorgCli {
    pub fn new(binary: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            repository: repository.into(),
            passphrase: None,
            passcommand: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.archive.binary.clone(),
            repository: config.paths.repository.clone(),
            passphrase: config.archive.passphrase.clone(),
            passcommand: config.archive.passcommand.clone(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Filesystem path of a repository on this host.
    fn local_path(&self) -> Option<PathBuf> {
        let repo = self.repository.as_str();
        if repo.contains("://") {
            return repo.strip_prefix("file://").map(PathBuf::from);
        }
        match repo.split_once(':') {
            Some((host, _)) if !host.contains('/') => None,
            _ => Some(PathBuf::from(repo)),
        }
    }

    fn archive_ref(&self, archive: &str) -> String {
        format!("{}::{archive}", self.repository)
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(passphrase) = &self.passphrase {
            cmd.env("BORG_PASSPHRASE", passphrase);
        }
        if let Some(passcommand) = &self.passcommand {
            cmd.env("BORG_PASSCOMMAND", passcommand);
        }
        cmd
    }

    /// Run borg to completion and return its stdout.
    fn run_borg(&self, args: &[String], cwd: Option<&Path>, progress: bool) -> Result<String> {
        let mut cmd = self.command(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        cmd.stderr(if progress { Stdio::inherit() } else { Stdio::piped() });
        debug!(binary = %self.binary, ?args, "running borg");
        let output = cmd
            .output()
            .with_context(|| format!("failed to run {} {}", self.binary, subcommand(args)))?;
        check_status(args, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like [`BorgCli::run_borg`] but returns borg's human-readable report,
    /// which it writes to stderr.
    fn run_borg_report(&self, args: &[String]) -> Result<String> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {} {}", self.binary, subcommand(args)))?;
        check_status(args, &output)?;
        let mut report = String::from_utf8_lossy(&output.stdout).into_owned();
        report.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(report)
    }
}

fn subcommand(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("")
}

fn check_status(args: &[String], output: &Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    match output.status.code() {
        Some(0) => Ok(()),
        Some(WARNING_STATUS) => {
            warn!(command = subcommand(args), stderr = %stderr.trim(), "borg finished with warnings");
            Ok(())
        }
        Some(code) => Err(anyhow!(
            "borg {} failed with status {code}: {}",
            subcommand(args),
            stderr.trim()
        )),
        None => Err(anyhow!("borg {} was killed by a signal", subcommand(args))),
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// `--keep-*` flags for every non-zero retention count.
pub fn retention_args(retention: &Retention) -> Vec<String> {
    [
        ("--keep-daily", retention.keep_daily),
        ("--keep-weekly", retention.keep_weekly),
        ("--keep-monthly", retention.keep_monthly),
        ("--keep-yearly", retention.keep_yearly),
    ]
    .into_iter()
    .filter(|(_, count)| *count > 0)
    .flat_map(|(flag, count)| [flag.to_string(), count.to_string()])
    .collect()
}

impl ArchiveEngine for BorgCli {
    fn repository_exists(&self) -> Result<bool> {
        if let Some(local) = self.local_path() {
            return Ok(local.join("config").is_file());
        }
        let output = self
            .command(&strings(&["info", "--json", &self.repository]))
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {} info", self.binary))?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("is not a valid repository") {
            return Ok(false);
        }
        Err(anyhow!("borg info failed: {}", stderr.trim()))
    }

    fn init(&self, encryption: &str) -> Result<()> {
        self.run_borg(
            &strings(&["init", "--encryption", encryption, &self.repository]),
            None,
            false,
        )?;
        Ok(())
    }

    fn create(&self, request: &CreateRequest) -> Result<ArchiveStats> {
        let mut args = strings(&["create", "--json", "--compression", &request.compression]);
        if request.progress {
            args.push("--progress".to_string());
        }
        args.push(self.archive_ref(&request.archive));
        args.extend(request.paths.iter().map(|p| p.display().to_string()));
        let stdout = self.run_borg(&args, Some(&request.base_dir), request.progress)?;
        parse_create_stats(&stdout)
    }

    fn check(&self, archive: Option<&str>) -> Result<String> {
        let mut args = strings(&["check"]);
        match archive {
            Some(name) => args.push(self.archive_ref(name)),
            None => args.push(self.repository.clone()),
        }
        self.run_borg_report(&args)
    }

    fn prune(&self, glob: &str, retention: &Retention, dry_run: bool) -> Result<String> {
        let mut args = strings(&["prune", "--list", "--glob-archives", glob]);
        args.extend(retention_args(retention));
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args.push(self.repository.clone());
        self.run_borg_report(&args)
    }

    fn compact(&self) -> Result<()> {
        self.run_borg(&strings(&["compact", &self.repository]), None, false)?;
        Ok(())
    }

    fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        let stdout = self.run_borg(&strings(&["list", "--json", &self.repository]), None, false)?;
        parse_archive_list(&stdout)
    }

    fn info(&self, archive: &str) -> Result<ArchiveStats> {
        let stdout = self.run_borg(&strings(&["info", "--json", &self.archive_ref(archive)]), None, false)?;
        parse_info_stats(&stdout)
    }

    fn list_paths(&self, archive: &str, limit: usize) -> Result<Vec<String>> {
        let args = vec![
            "list".to_string(),
            "--format".to_string(),
            "{type}{TAB}{path}{NL}".to_string(),
            self.archive_ref(archive),
        ];
        let mut child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {} list", self.binary))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("borg list stdout was not captured"))?;
        let (paths, complete) = read_path_listing(stdout, limit)?;

        if !complete {
            // Enough sampled; the rest of the listing is not needed.
            let _ = child.kill();
            let _ = child.wait();
            return Ok(paths);
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = child.wait().context("failed to wait for borg list")?;
        match status.code() {
            Some(0) | Some(WARNING_STATUS) => Ok(paths),
            _ => Err(anyhow!("borg list {archive} failed: {}", stderr.trim())),
        }
    }

    fn extract(&self, archive: &str, target: &Path, plan: &ExtractionPlan, progress: bool) -> Result<()> {
        let mut args = strings(&["extract"]);
        if progress {
            args.push("--progress".to_string());
        }
        if plan.strip_components > 0 {
            args.push("--strip-components".to_string());
            args.push(plan.strip_components.to_string());
        }
        args.push(self.archive_ref(archive));
        if let Some(include) = &plan.include {
            args.push(include.clone());
        }
        self.run_borg(&args, Some(target), progress)?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ListOutput {
    archives: Vec<ListedArchive>,
}

#[derive(Deserialize)]
struct ListedArchive {
    name: String,
    start: String,
}

#[derive(Deserialize)]
struct CreateOutput {
    archive: ArchiveJson,
}

#[derive(Deserialize)]
struct InfoOutput {
    archives: Vec<ArchiveJson>,
}

#[derive(Deserialize)]
struct ArchiveJson {
    stats: StatsJson,
}

#[derive(Deserialize)]
struct StatsJson {
    original_size: u64,
    compressed_size: u64,
    deduplicated_size: u64,
    nfiles: u64,
}

impl From<StatsJson> for ArchiveStats {
    fn from(stats: StatsJson) -> Self {
        Self {
            original_size: stats.original_size,
            compressed_size: stats.compressed_size,
            deduplicated_size: stats.deduplicated_size,
            nfiles: stats.nfiles,
        }
    }
}

pub fn parse_archive_list(json: &str) -> Result<Vec<ArchiveEntry>> {
    let list: ListOutput = serde_json::from_str(json).context("failed to parse borg list output")?;
    list.archives
        .into_iter()
        .map(|archive| {
            let start = parse_start(&archive.start)
                .with_context(|| format!("bad start time for {}: {}", archive.name, archive.start))?;
            Ok(ArchiveEntry {
                name: archive.name,
                start,
            })
        })
        .collect()
}

pub fn parse_create_stats(json: &str) -> Result<ArchiveStats> {
    let output: CreateOutput = serde_json::from_str(json).context("failed to parse borg create output")?;
    Ok(output.archive.stats.into())
}

pub fn parse_info_stats(json: &str) -> Result<ArchiveStats> {
    let output: InfoOutput = serde_json::from_str(json).context("failed to parse borg info output")?;
    output
        .archives
        .into_iter()
        .next()
        .map(|archive| archive.stats.into())
        .ok_or_else(|| anyhow!("borg info returned no archive"))
}

/// Borg timestamps look like `2024-01-01T02:00:00.000000`, no offset.
pub fn parse_start(raw: &str) -> Result<OffsetDateTime> {
    let whole = raw.split('.').next().unwrap_or(raw);
    let parsed = PrimitiveDateTime::parse(whole, format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        .with_context(|| format!("unrecognized timestamp: {raw}"))?;
    Ok(parsed.assume_utc())
}

/// Read at most `limit` paths from a `{type}\t{path}` listing. The flag is
/// false when the listing was cut short.
pub fn read_path_listing(reader: impl Read, limit: usize) -> Result<(Vec<String>, bool)> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .flexible(true)
        .from_reader(reader);
    let mut paths = Vec::new();
    for record in rdr.records() {
        if paths.len() == limit {
            return Ok((paths, false));
        }
        let record = record.context("failed to read borg list output")?;
        if let Some(path) = record.get(1).filter(|p| !p.is_empty()) {
            paths.push(path.to_string());
        }
    }
    Ok((paths, true))
}
