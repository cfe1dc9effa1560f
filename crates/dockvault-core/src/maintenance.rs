use crate::error::RunError;
use crate::lock::RunLock;
use crate::model::{ArchiveEntry, ArchiveName, Scope};
use crate::orchestrator::{Orchestrator, RunReport};
use crate::record::{OperationKind, OperationRecord, Stage};
use crate::retention::{self, PrunePlan};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

impl<'a> Orchestrator<'a> {
    /// Create the repository if it does not exist. Returns false when there
    /// was nothing to do.
    pub fn initialize(&self) -> Result<bool> {
        if self.deps.engine.repository_exists()? {
            info!(repository = %self.config.paths.repository, "repository already exists");
            return Ok(false);
        }
        self.deps
            .engine
            .init(&self.config.archive.encryption)
            .with_context(|| format!("failed to initialize {}", self.config.paths.repository))?;
        info!(repository = %self.config.paths.repository, "repository initialized");
        Ok(true)
    }

    /// Archives in the repository, oldest first. Read-only, so no lock.
    pub fn archives(&self) -> Result<Vec<ArchiveEntry>> {
        self.ensure_repository(false)?;
        let mut entries = self.deps.engine.list_archives().context("failed to list archives")?;
        entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// What a cleanup would keep and prune, per scope.
    pub fn preview_cleanup(&self) -> Result<BTreeMap<Scope, PrunePlan>> {
        let entries = self.archives()?;
        Ok(group_by_scope(&entries, &self.config.archive.data_root_scope)
            .into_iter()
            .map(|(scope, group)| {
                let plan = retention::plan_prune(&group, &self.config.retention);
                (scope, plan)
            })
            .collect())
    }

    /// Prune every scope found in the repository, then compact and sync.
    pub fn cleanup(&self) -> RunReport {
        let mut record = OperationRecord::new(OperationKind::Cleanup, self.config.paths.repository.clone());
        let mut lock = None;
        let result = self.run_cleanup(&mut record, &mut lock);
        self.finish(record, lock, result)
    }

    fn run_cleanup(&self, record: &mut OperationRecord, lock: &mut Option<RunLock>) -> Result<()> {
        self.checkpoint()?;
        self.acquire(record, lock)?;
        let entries = self.archives()?;
        let scopes: Vec<Scope> = group_by_scope(&entries, &self.config.archive.data_root_scope)
            .into_keys()
            .collect();
        let foreign = entries.iter().filter(|e| ArchiveName::parse(&e.name).is_none()).count();
        if foreign > 0 {
            warn!(count = foreign, "archives with foreign names are never pruned");
            record.warn(format!("{foreign} archive(s) with foreign names left alone"));
        }

        self.checkpoint()?;
        record.enter(Stage::Pruning);
        if scopes.is_empty() {
            info!("no archives to prune");
        }
        for scope in &scopes {
            self.checkpoint()?;
            self.deps
                .engine
                .prune(&scope.glob(), &self.config.retention, false)
                .with_context(|| format!("failed to prune {scope}"))?;
        }

        if self.config.archive.compact {
            self.checkpoint()?;
            record.enter(Stage::Compacting);
            self.deps.engine.compact().context("failed to compact repository")?;
        }
        self.sync_remote(record)?;
        record.enter(Stage::Done);
        Ok(())
    }

    /// Copy the remote repository into the staging directory.
    pub fn download(&self) -> RunReport {
        let target = self
            .deps
            .remote
            .map(|remote| remote.describe())
            .unwrap_or_else(|| "remote".to_string());
        let mut record = OperationRecord::new(OperationKind::Download, target);
        let mut lock = None;
        let result = self.run_download(&mut record, &mut lock);
        self.finish(record, lock, result)
    }

    /// Where [`Orchestrator::download`] puts the repository.
    pub fn download_destination(&self) -> PathBuf {
        self.config.paths.staging.join("repository")
    }

    fn run_download(&self, record: &mut OperationRecord, lock: &mut Option<RunLock>) -> Result<()> {
        self.checkpoint()?;
        let remote = self
            .deps
            .remote
            .ok_or_else(|| RunError::Precondition("no remote is configured".to_string()))?;
        self.acquire(record, lock)?;

        let destination = self.download_destination();
        fs::create_dir_all(&destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        self.checkpoint()?;
        record.enter(Stage::Downloading);
        remote
            .pull(&destination)
            .with_context(|| format!("failed to download from {}", remote.describe()))?;
        info!(destination = %destination.display(), "repository downloaded");
        record.enter(Stage::Done);
        Ok(())
    }
}

fn group_by_scope(entries: &[ArchiveEntry], data_root_scope: &str) -> BTreeMap<Scope, Vec<ArchiveEntry>> {
    let mut groups: BTreeMap<Scope, Vec<ArchiveEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(name) = ArchiveName::parse(&entry.name) {
            groups
                .entry(Scope::parse(&name.scope, data_root_scope))
                .or_default()
                .push(entry.clone());
        }
    }
    groups
}
