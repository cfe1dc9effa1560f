use crate::record::{CreatedArchive, OperationKind, OperationRecord, Stage};
use anyhow::Result;
use std::fmt::Write as _;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub kind: OperationKind,
    pub target: String,
    pub succeeded: bool,
    pub final_stage: Stage,
    pub failed_at: Option<Stage>,
    pub error: Option<String>,
    pub duration: Duration,
    pub archives: Vec<CreatedArchive>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
    pub interventions: Vec<String>,
}

impl RunSummary {
    pub fn from_record(record: &OperationRecord, failed_at: Option<Stage>, error: Option<String>) -> Self {
        Self {
            kind: record.kind,
            target: record.target.clone(),
            succeeded: record.succeeded,
            final_stage: record.stage,
            failed_at,
            error,
            duration: OffsetDateTime::now_utc() - record.started_at,
            archives: record.archives.clone(),
            skipped: record.skipped.clone(),
            warnings: record.warnings.clone(),
            interventions: record.interventions.clone(),
        }
    }

    pub fn subject(&self, host: &str) -> String {
        let outcome = if self.succeeded { "succeeded" } else { "FAILED" };
        format!("[dockvault] {} of {} on {host} {outcome}", self.kind, self.target)
    }

    pub fn body(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "operation: {}", self.kind);
        let _ = writeln!(out, "target:    {}", self.target);
        let _ = writeln!(
            out,
            "outcome:   {}",
            if self.succeeded { "success" } else { "failure" }
        );
        let _ = writeln!(out, "stage:     {}", self.final_stage);
        let _ = writeln!(out, "duration:  {}s", self.duration.whole_seconds());
        if let Some(stage) = self.failed_at {
            let _ = writeln!(out, "failed at: {stage}");
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "error:     {error}");
        }
        if !self.archives.is_empty() {
            let _ = writeln!(out, "\narchives:");
            for archive in &self.archives {
                let _ = writeln!(
                    out,
                    "  {}  original {}  compressed {}",
                    archive.name,
                    human_bytes(archive.stats.original_size),
                    human_bytes(archive.stats.compressed_size)
                );
            }
        }
        for (title, items) in [
            ("skipped", &self.skipped),
            ("warnings", &self.warnings),
            ("MANUAL INTERVENTION REQUIRED", &self.interventions),
        ] {
            if items.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{title}:");
            for item in items {
                let _ = writeln!(out, "  {item}");
            }
        }
        out
    }
}

/// Delivery of the end-of-run summary. Failures are the caller's to log.
pub trait Notifier {
    fn deliver(&self, summary: &RunSummary) -> Result<()>;
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
