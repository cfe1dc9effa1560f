use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

pub type VolumeId = String;
pub type WorkloadId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Normal,
    Deferred,
}

/// A persistent storage unit as seen at the start of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: VolumeId,
    pub mountpoint: PathBuf,
    pub size_estimate: u64,
    /// Every workload bound to the volume, running or not.
    pub workloads: BTreeSet<WorkloadId>,
    /// The subset of `workloads` running when the volume was mapped.
    pub running: BTreeSet<WorkloadId>,
    pub priority: PriorityClass,
}

impl Volume {
    pub fn new(name: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mountpoint: mountpoint.into(),
            size_estimate: 0,
            workloads: BTreeSet::new(),
            running: BTreeSet::new(),
            priority: PriorityClass::Normal,
        }
    }

    /// Bound to at least one workload, and every bound workload is running.
    pub fn only_running_workloads(&self) -> bool {
        !self.workloads.is_empty() && self.workloads.iter().all(|w| self.running.contains(w))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: VolumeId,
    pub mountpoint: PathBuf,
}

/// What an archive holds: the whole data root or one named volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    DataRoot(String),
    Volume(VolumeId),
}

const VOLUME_SCOPE_PREFIX: &str = "volume-";

impl Scope {
    pub fn parse(raw: &str, data_root_scope: &str) -> Self {
        if raw != data_root_scope {
            if let Some(volume) = raw.strip_prefix(VOLUME_SCOPE_PREFIX) {
                return Self::Volume(volume.to_string());
            }
        }
        Self::DataRoot(raw.to_string())
    }

    /// Archive-name glob matching every archive of this scope.
    pub fn glob(&self) -> String {
        format!("{self}@*")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataRoot(name) => write!(f, "{name}"),
            Self::Volume(name) => write!(f, "{VOLUME_SCOPE_PREFIX}{name}"),
        }
    }
}

/// `<scope>@<YYYY-MM-DDTHH-MM-SS>`; lexical order within a scope is
/// chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub scope: String,
    pub stamp: PrimitiveDateTime,
}

impl ArchiveName {
    pub fn new(scope: &Scope, at: OffsetDateTime) -> Self {
        let utc = at.to_offset(time::UtcOffset::UTC);
        Self {
            scope: scope.to_string(),
            stamp: PrimitiveDateTime::new(utc.date(), utc.time().replace_nanosecond(0).unwrap_or(utc.time())),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let (scope, stamp) = name.rsplit_once('@')?;
        if scope.is_empty() {
            return None;
        }
        let stamp = PrimitiveDateTime::parse(stamp, STAMP_FORMAT).ok()?;
        Some(Self {
            scope: scope.to_string(),
            stamp,
        })
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.stamp.assume_utc()
    }
}

const STAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]");

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.stamp.format(STAMP_FORMAT).map_err(|_| fmt::Error)?;
        write!(f, "{}@{}", self.scope, stamp)
    }
}

/// One archive as listed by the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub start: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub original_size: u64,
    pub compressed_size: u64,
    pub deduplicated_size: u64,
    pub nfiles: u64,
}

/// Newest archive of `scope`, by name.
pub fn latest_in_scope<'a>(entries: &'a [ArchiveEntry], scope: &Scope) -> Option<&'a ArchiveEntry> {
    let wanted = scope.to_string();
    entries
        .iter()
        .filter(|entry| {
            ArchiveName::parse(&entry.name)
                .map(|name| name.scope == wanted)
                .unwrap_or(false)
        })
        .max_by(|a, b| a.name.cmp(&b.name))
}

pub fn resolve_archive(entries: &[ArchiveEntry], requested: &str, scope: &Scope) -> Result<String> {
    if requested == "latest" {
        return latest_in_scope(entries, scope)
            .map(|entry| entry.name.clone())
            .ok_or_else(|| anyhow!("no archive found for {scope}"));
    }
    entries
        .iter()
        .find(|entry| entry.name == requested)
        .map(|entry| entry.name.clone())
        .ok_or_else(|| anyhow!("archive not found in repository: {requested}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn entry(name: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            start: ArchiveName::parse(name).unwrap().created_at(),
        }
    }

    #[test]
    fn archive_name_formats_and_parses() {
        let scope = Scope::Volume("pgdata".to_string());
        let name = ArchiveName::new(&scope, datetime!(2024-03-05 07:08:09.123 UTC));
        let text = name.to_string();
        assert_eq!(text, "volume-pgdata@2024-03-05T07-08-09");
        assert_eq!(ArchiveName::parse(&text), Some(name));
    }

    #[test]
    fn archive_name_rejects_foreign_names() {
        assert!(ArchiveName::parse("docker-2024-01-01").is_none());
        assert!(ArchiveName::parse("@2024-01-01T00-00-00").is_none());
        assert!(ArchiveName::parse("x@yesterday").is_none());
    }

    #[test]
    fn scope_round_trips_through_text() {
        assert_eq!(
            Scope::parse("volume-web_static", "docker-data"),
            Scope::Volume("web_static".to_string())
        );
        assert_eq!(
            Scope::parse("docker-data", "docker-data"),
            Scope::DataRoot("docker-data".to_string())
        );
        assert_eq!(Scope::Volume("a".to_string()).glob(), "volume-a@*");
    }

    #[test]
    fn latest_picks_newest_of_scope_only() {
        let entries = vec![
            entry("docker-data@2024-01-01T00-00-00"),
            entry("docker-data@2024-02-01T00-00-00"),
            entry("volume-db@2024-03-01T00-00-00"),
        ];
        let scope = Scope::DataRoot("docker-data".to_string());
        assert_eq!(
            resolve_archive(&entries, "latest", &scope).unwrap(),
            "docker-data@2024-02-01T00-00-00"
        );
        assert!(resolve_archive(&entries, "docker-data@1999-01-01T00-00-00", &scope).is_err());
    }

    #[test]
    fn only_running_workloads_needs_a_binding() {
        let mut volume = Volume::new("v", "/v");
        assert!(!volume.only_running_workloads());
        volume.workloads.insert("a".to_string());
        volume.running.insert("a".to_string());
        assert!(volume.only_running_workloads());
        volume.workloads.insert("b".to_string());
        assert!(!volume.only_running_workloads());
    }
}
