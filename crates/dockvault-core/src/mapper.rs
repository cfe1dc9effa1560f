//! Associates volumes with the workloads that consume them.

use crate::error::RunError;
use crate::model::{Volume, VolumeId, VolumeInfo, WorkloadId};
use crate::runtime::ContainerRuntime;
use crate::space::CapacityProbe;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Who has to be paused before a volume can be snapshotted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependents {
    /// Whole-data-root mode: every workload, via the platform service.
    Platform,
    Workloads {
        all: BTreeSet<WorkloadId>,
        running: BTreeSet<WorkloadId>,
    },
}

pub type DependencyMap = BTreeMap<VolumeId, Dependents>;

#[derive(Debug, Default)]
pub struct MappedVolumes {
    pub volumes: Vec<Volume>,
    pub warnings: Vec<String>,
}

impl MappedVolumes {
    pub fn dependencies(&self) -> DependencyMap {
        self.volumes
            .iter()
            .map(|volume| {
                (
                    volume.name.clone(),
                    Dependents::Workloads {
                        all: volume.workloads.clone(),
                        running: volume.running.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Dependency entry for the whole data root.
pub fn map_data_root(scope: &str) -> DependencyMap {
    BTreeMap::from([(scope.to_string(), Dependents::Platform)])
}

/// Apply include/exclude to the volumes that exist.
///
/// Unknown names are warnings. An empty result is [`RunError::NothingSelected`].
pub fn select(
    available: &[VolumeInfo],
    include: &[String],
    exclude: &[String],
) -> Result<(Vec<VolumeInfo>, Vec<String>)> {
    let known: BTreeSet<&str> = available.iter().map(|v| v.name.as_str()).collect();
    let mut warnings = Vec::new();
    for name in include.iter().chain(exclude) {
        if !known.contains(name.as_str()) {
            warnings.push(format!("volume not found: {name}"));
        }
    }

    let mut selected: Vec<VolumeInfo> = available
        .iter()
        .filter(|v| include.is_empty() || include.contains(&v.name))
        .filter(|v| !exclude.contains(&v.name))
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.name.cmp(&b.name));
    selected.dedup_by(|a, b| a.name == b.name);

    if selected.is_empty() {
        return Err(RunError::NothingSelected.into());
    }
    Ok((selected, warnings))
}

/// Enumerate, filter and bind volumes for one volume-granular run.
pub fn map_volumes(
    runtime: &dyn ContainerRuntime,
    capacity: &dyn CapacityProbe,
    include: &[String],
    exclude: &[String],
) -> Result<MappedVolumes> {
    let available = runtime.list_volumes().context("failed to enumerate volumes")?;
    let (selected, warnings) = select(&available, include, exclude)?;
    for warning in &warnings {
        warn!("{warning}");
    }

    let mut volumes = Vec::with_capacity(selected.len());
    for info in selected {
        let mut volume = Volume::new(info.name.clone(), info.mountpoint.clone());
        volume.workloads = runtime
            .workloads_using(&info.name, false)
            .with_context(|| format!("failed to list workloads using {}", info.name))?
            .into_iter()
            .collect();
        volume.running = runtime
            .workloads_using(&info.name, true)
            .with_context(|| format!("failed to list running workloads using {}", info.name))?
            .into_iter()
            .collect();
        // The runtime may report a running workload it did not list as bound.
        volume.workloads.extend(volume.running.iter().cloned());
        volume.size_estimate = match capacity.estimate_bytes(&info.mountpoint) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(volume = %info.name, error = %err, "could not estimate volume size");
                0
            }
        };
        debug!(
            volume = %volume.name,
            workloads = volume.workloads.len(),
            running = volume.running.len(),
            bytes = volume.size_estimate,
            "volume mapped"
        );
        volumes.push(volume);
    }

    Ok(MappedVolumes { volumes, warnings })
}
