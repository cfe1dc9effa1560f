//! [`ContainerRuntime`] for a Docker host managed by systemd.

use anyhow::{anyhow, Context, Result};
use dockvault_core::config::ServiceSettings;
use dockvault_core::model::{VolumeInfo, WorkloadId};
use dockvault_core::runtime::{ContainerRuntime, ServiceState};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: String,
    systemctl: String,
    units: Vec<String>,
}

impl DockerRuntime {
    pub fn new(settings: &ServiceSettings) -> Self {
        Self {
            docker: settings.docker_binary.clone(),
            systemctl: "systemctl".to_string(),
            units: settings.units.clone(),
        }
    }

    fn run_docker(&self, args: &[&str]) -> Result<String> {
        run(&self.docker, args)
    }

    fn run_systemctl(&self, args: &[&str]) -> Result<String> {
        let mut full: Vec<&str> = args.to_vec();
        full.extend(self.units.iter().map(String::as_str));
        run(&self.systemctl, &full)
    }

    /// The unit that actually serves requests; the socket unit only
    /// activates it.
    fn service_unit(&self) -> &str {
        self.units
            .iter()
            .find(|u| u.ends_with(".service"))
            .or_else(|| self.units.last())
            .map(String::as_str)
            .unwrap_or("docker.service")
    }
}

fn run(binary: &str, args: &[&str]) -> Result<String> {
    debug!(binary, ?args, "running");
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {binary} {args:?}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{binary} {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedVolume {
    name: String,
    mountpoint: PathBuf,
}

pub fn parse_volume_inspect(json: &str) -> Result<Vec<VolumeInfo>> {
    let volumes: Vec<InspectedVolume> =
        serde_json::from_str(json).context("failed to parse docker volume inspect output")?;
    Ok(volumes
        .into_iter()
        .map(|v| VolumeInfo {
            name: v.name,
            mountpoint: v.mountpoint,
        })
        .collect())
}

pub fn parse_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Map `systemctl is-active` output to a service state.
pub fn parse_active_state(stdout: &str) -> ServiceState {
    match stdout.trim() {
        "active" | "reloading" => ServiceState::Active,
        "inactive" => ServiceState::Inactive,
        "failed" => ServiceState::Failed,
        _ => ServiceState::Transitioning,
    }
}

impl ContainerRuntime for DockerRuntime {
    fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let names = parse_names(&self.run_docker(&["volume", "ls", "-q"])?);
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["volume", "inspect"];
        args.extend(names.iter().map(String::as_str));
        parse_volume_inspect(&self.run_docker(&args)?)
    }

    fn ensure_volume(&self, name: &str) -> Result<VolumeInfo> {
        if let Ok(json) = self.run_docker(&["volume", "inspect", name]) {
            if let Some(info) = parse_volume_inspect(&json)?.into_iter().next() {
                return Ok(info);
            }
        }
        self.run_docker(&["volume", "create", name])?;
        parse_volume_inspect(&self.run_docker(&["volume", "inspect", name])?)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("volume {name} missing after create"))
    }

    fn workloads_using(&self, volume: &str, running_only: bool) -> Result<Vec<WorkloadId>> {
        let filter = format!("volume={volume}");
        let mut args = vec!["ps"];
        if !running_only {
            args.push("-a");
        }
        args.extend(["--filter", filter.as_str(), "--format", "{{.Names}}"]);
        let mut names = parse_names(&self.run_docker(&args)?);
        names.sort();
        Ok(names)
    }

    fn is_running(&self, workload: &str) -> Result<bool> {
        let out = self.run_docker(&["inspect", "-f", "{{.State.Running}}", workload])?;
        Ok(out.trim() == "true")
    }

    fn stop_workload(&self, workload: &str) -> Result<()> {
        self.run_docker(&["stop", workload])?;
        Ok(())
    }

    fn start_workload(&self, workload: &str) -> Result<()> {
        self.run_docker(&["start", workload])?;
        Ok(())
    }

    fn platform_state(&self) -> Result<ServiceState> {
        // is-active exits non-zero for anything but active, so the status is
        // not an error here.
        let output = Command::new(&self.systemctl)
            .args(["is-active", self.service_unit()])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {} is-active", self.systemctl))?;
        Ok(parse_active_state(&String::from_utf8_lossy(&output.stdout)))
    }

    fn request_platform_stop(&self) -> Result<()> {
        self.run_systemctl(&["stop"])?;
        Ok(())
    }

    fn request_platform_start(&self) -> Result<()> {
        self.run_systemctl(&["start"])?;
        Ok(())
    }

    fn kill_platform(&self) -> Result<()> {
        self.run_systemctl(&["kill", "--signal=SIGKILL"])?;
        self.run_systemctl(&["reset-failed"])?;
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        let version = self.run_docker(&["info", "--format", "{{.ServerVersion}}"])?;
        if version.trim().is_empty() {
            return Err(anyhow!("docker info returned no server version"));
        }
        debug!(version = version.trim(), "platform answered");
        Ok(())
    }
}
