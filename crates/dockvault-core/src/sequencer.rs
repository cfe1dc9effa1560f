//! Orders volumes so that priority workloads are paused last and briefly.
//!
//! Evaluation order is fixed: the skip-in-use rule runs first, so a volume
//! that is both skip-eligible and priority-bound is skipped, never deferred.

use crate::model::{PriorityClass, Volume, VolumeId};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    pub ordinary: Vec<Volume>,
    pub deferred: Vec<Volume>,
    pub skipped: Vec<VolumeId>,
}

impl Sequence {
    /// Processing order: every ordinary volume, then every deferred one.
    pub fn in_order(&self) -> impl Iterator<Item = &Volume> {
        self.ordinary.iter().chain(self.deferred.iter())
    }

    pub fn len(&self) -> usize {
        self.ordinary.len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Match a workload name against a priority pattern; `*` matches any run of
/// characters.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(at) => rest = &rest[at + middle.len()..],
            None => return false,
        }
    }
    true
}

pub fn sequence(mut volumes: Vec<Volume>, priority: &[String], skip_in_use: bool) -> Sequence {
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    let mut out = Sequence::default();
    for mut volume in volumes {
        if skip_in_use && volume.only_running_workloads() {
            info!(volume = %volume.name, "skipping volume in active use");
            out.skipped.push(volume.name);
            continue;
        }
        let prioritized = volume
            .workloads
            .iter()
            .any(|w| priority.iter().any(|p| matches_pattern(p, w)));
        if prioritized {
            volume.priority = PriorityClass::Deferred;
            out.deferred.push(volume);
        } else {
            volume.priority = PriorityClass::Normal;
            out.ordinary.push(volume);
        }
    }
    out
}
