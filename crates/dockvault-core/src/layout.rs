//! Infers how a data root is laid out inside an archive.
//!
//! Classification is an ordered list of pure strategies over a bounded
//! sample of stored paths. The first strategy that recognizes the sample
//! decides the extraction plan; when none does, the caller falls back to a
//! full extraction into an isolated area followed by [`find_data_root`].

use crate::engine::ExtractionPlan;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// What a valid data root looks like, for one restore target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutProfile {
    /// The data root's absolute path without the leading `/`, as the engine
    /// stores absolute sources.
    pub absolute_root: String,
    /// Short relative prefixes the data root may be stored under.
    pub short_prefixes: Vec<String>,
    /// Subdirectories that identify a data root. Empty when the content is
    /// arbitrary (a single volume).
    pub signatures: Vec<String>,
}

impl LayoutProfile {
    /// Profile for the platform's whole data root.
    pub fn data_root(path: &Path) -> Self {
        Self {
            absolute_root: relative_to_root(path),
            short_prefixes: final_component(path).into_iter().collect(),
            signatures: ["volumes", "containers", "image"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Profile for one volume's content directory.
    pub fn volume(mountpoint: &Path) -> Self {
        Self {
            absolute_root: relative_to_root(mountpoint),
            short_prefixes: final_component(mountpoint).into_iter().collect(),
            signatures: Vec::new(),
        }
    }

    fn root_name(&self) -> Option<&str> {
        self.short_prefixes.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Absolute,
    StripPrefix,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: LayoutKind,
    pub confidence: Confidence,
    pub plan: ExtractionPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutDecision {
    Targeted(Classification),
    /// Nothing in the sample was recognized.
    Ambiguous,
}

pub type Strategy = fn(&LayoutProfile, &[String]) -> Option<Classification>;

/// Cheapest and most specific first.
pub const STRATEGIES: &[Strategy] = &[absolute, strip_prefix, direct];

pub fn classify(profile: &LayoutProfile, sample: &[String]) -> LayoutDecision {
    let sample: Vec<String> = sample.iter().map(|p| normalize(p)).filter(|p| !p.is_empty()).collect();
    if sample.is_empty() {
        return LayoutDecision::Ambiguous;
    }
    STRATEGIES
        .iter()
        .find_map(|strategy| strategy(profile, &sample))
        .map(LayoutDecision::Targeted)
        .unwrap_or(LayoutDecision::Ambiguous)
}

fn absolute(profile: &LayoutProfile, sample: &[String]) -> Option<Classification> {
    let root = profile.absolute_root.as_str();
    if root.is_empty() {
        return None;
    }
    let hit = sample.iter().any(|p| is_under(p, root));
    hit.then(|| Classification {
        kind: LayoutKind::Absolute,
        confidence: Confidence::High,
        plan: ExtractionPlan {
            include: Some(root.to_string()),
            strip_components: root.split('/').count(),
        },
    })
}

fn strip_prefix(profile: &LayoutProfile, sample: &[String]) -> Option<Classification> {
    profile.short_prefixes.iter().find_map(|prefix| {
        let hit = sample.iter().any(|p| is_under(p, prefix));
        hit.then(|| Classification {
            kind: LayoutKind::StripPrefix,
            confidence: Confidence::High,
            plan: ExtractionPlan {
                include: Some(prefix.clone()),
                strip_components: prefix.split('/').count(),
            },
        })
    })
}

fn direct(profile: &LayoutProfile, sample: &[String]) -> Option<Classification> {
    if profile.signatures.is_empty() {
        // Volume content has no signature; any top-level entry that is not a
        // path from the host root is taken as the content itself.
        let foreign_root = sample.iter().all(|p| first_component(p) == first_component(&profile.absolute_root));
        return (!foreign_root).then(|| Classification {
            kind: LayoutKind::Direct,
            confidence: Confidence::Low,
            plan: ExtractionPlan::everything(),
        });
    }
    let hit = sample
        .iter()
        .any(|p| profile.signatures.iter().any(|sig| first_component(p) == sig));
    hit.then(|| Classification {
        kind: LayoutKind::Direct,
        confidence: Confidence::High,
        plan: ExtractionPlan::everything(),
    })
}

/// Search a full extraction for the directory that looks like a data root.
///
/// The shallowest match wins; ties go to the lexically first path.
pub fn find_data_root(profile: &LayoutProfile, area: &Path) -> Option<PathBuf> {
    const MAX_DEPTH: usize = 12;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in WalkDir::new(area)
        .max_depth(MAX_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let dir = entry.path();
        let matched = if profile.signatures.is_empty() {
            entry.depth() > 0
                && profile
                    .root_name()
                    .map(|name| entry.file_name() == name)
                    .unwrap_or(false)
        } else {
            profile.signatures.iter().any(|sig| dir.join(sig).is_dir())
        };
        if matched && best.as_ref().map(|(depth, _)| entry.depth() < *depth).unwrap_or(true) {
            best = Some((entry.depth(), dir.to_path_buf()));
        }
    }
    best.map(|(_, dir)| dir)
}

fn is_under(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).map(|rest| rest.starts_with('/')).unwrap_or(false)
}

fn first_component(path: &str) -> &str {
    path.split('/').next().unwrap_or("")
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_start_matches("./").trim_start_matches('/');
    trimmed.trim_end_matches('/').to_string()
}

fn relative_to_root(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn final_component(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}
