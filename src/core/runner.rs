/// Operation runner
///
/// Top-level `backup`, `restore` and `start` flows. Combines the catalog,
/// snapshot engine and sequencer, and owns the decisions about which
/// failures abort a run and which are only reported.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::archive;
use crate::core::catalog::{
    archive_file_name, instance_dir_name, materialize, Catalog, CatalogSnapshot, SourceMode,
};
use crate::core::docker::{ContainerEngine, HealthStatus};
use crate::core::error::{Result, StackError};
use crate::core::lock::BackupLock;
use crate::core::prompt::{decide, Decision, Prompter};
use crate::core::registry::{Registry, Selection, Service};
use crate::core::sequencer::{HealthGate, HealthOutcome, Sequencer, UnhealthyPolicy};
use crate::core::snapshot::{bound_unit, dump_unit, volume_unit, SnapshotEngine, UnitOutcome};
use crate::utils::constants::{
    BACKUP_TIMESTAMP_FORMAT, BACKUP_TIMESTAMP_FORMAT_SECONDS, MANIFEST_FILE, RESTORE_CONFIRMATION,
};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub project_root: PathBuf,
    pub backup_root: PathBuf,
    pub archive_prefix: String,
    pub helper_image: String,
    pub network: String,
    pub health: HealthGate,
    pub on_unhealthy: UnhealthyPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub stop: Decision,
    pub bundle: Decision,
    pub restart: Decision,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            stop: Decision::Ask,
            bundle: Decision::Ask,
            restart: Decision::Ask,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Supplies the destructive confirmation without prompting
    pub assume_yes: bool,
    pub start: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Captured,
    Restored,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit: String,
    #[serde(flatten)]
    pub status: UnitStatus,
}

/// Written as `manifest.json` inside every backup instance
#[derive(Debug, Serialize)]
pub struct InstanceManifest<'a> {
    pub service: &'a str,
    pub created_at: DateTime<Local>,
    pub tool_version: &'static str,
    pub units: &'a [UnitReport],
}

#[derive(Debug, Clone, Default)]
pub struct ServiceReport {
    pub service: String,
    /// Backup instance written to, or restored from
    pub instance: Option<PathBuf>,
    pub units: Vec<UnitReport>,
    /// Failure that prevented any unit from being handled
    pub error: Option<String>,
    /// Units whose source was missing
    missing: usize,
}

impl ServiceReport {
    fn new(service: &str, instance: Option<PathBuf>) -> Self {
        Self {
            service: service.to_string(),
            instance,
            ..Default::default()
        }
    }

    /// Record a unit result. Fatal errors are handed back to abort the run;
    /// a missing source is logged and counted as skipped.
    fn record(&mut self, unit: String, result: Result<UnitOutcome>) -> Result<()> {
        let status = match result {
            Ok(UnitOutcome::Captured) => UnitStatus::Captured,
            Ok(UnitOutcome::Restored) => UnitStatus::Restored,
            Ok(UnitOutcome::Skipped(reason)) => {
                info!(service = %self.service, %unit, %reason, "skipped");
                UnitStatus::Skipped { reason }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e @ StackError::MissingSource { .. }) => {
                warn!("{}", e);
                self.missing += 1;
                UnitStatus::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!("{}", e);
                UnitStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        self.units.push(UnitReport { unit, status });
        Ok(())
    }

    /// A restore where every unit's source was missing restored nothing
    fn fail_if_nothing_restored(&mut self) {
        if self.error.is_none() && !self.units.is_empty() && self.missing == self.units.len() {
            error!(service = %self.service, "backup instance holds none of this service's data");
            self.error = Some("backup instance holds none of this service's data".to_string());
        }
    }

    /// Nothing for this service succeeded
    pub fn failed_entirely(&self) -> bool {
        self.error.is_some()
            || (!self.units.is_empty()
                && self
                    .units
                    .iter()
                    .all(|u| matches!(u.status, UnitStatus::Failed { .. })))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartReport {
    /// Started and healthy, or started without a gate
    pub started: Vec<String>,
    /// Started but not healthy within the gate's timeout
    pub unhealthy: Vec<String>,
    /// Not started because a dependency failed or stayed unhealthy
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub timestamp: String,
    pub services: Vec<ServiceReport>,
    pub bundle: Option<PathBuf>,
    pub stopped: Vec<String>,
    pub restart: Option<StartReport>,
}

impl BackupReport {
    pub fn has_failures(&self) -> bool {
        self.services.iter().any(|s| s.failed_entirely())
            || self.restart.as_ref().map(|r| r.has_failures()).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub mode: SourceMode,
    pub source: PathBuf,
    pub services: Vec<String>,
    pub stop_order: Vec<String>,
}

impl RestorePlan {
    pub fn render(&self) -> String {
        let mut text = String::new();
        let source = match self.mode {
            SourceMode::Archive => "archive",
            SourceMode::Folders => "backup folders",
        };
        let _ = writeln!(text, "Restore from {} {}", source, self.source.display());
        let _ = writeln!(text, "  services to restore: {}", self.services.join(", "));
        let _ = writeln!(text, "  services to stop:    {}", self.stop_order.join(", "));
        let _ = write!(text, "Current data of these services will be overwritten.");
        text
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub plan: RestorePlan,
    pub services: Vec<ServiceReport>,
    pub stopped: Vec<String>,
    pub start: Option<StartReport>,
}

impl RestoreReport {
    pub fn has_failures(&self) -> bool {
        self.services.iter().any(|s| s.failed_entirely())
            || self.start.as_ref().map(|r| r.has_failures()).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// Operator declined; nothing was changed
    Cancelled,
    Completed(RestoreReport),
}

/// Instance directories of a backup in progress. They are written under a
/// `.partial` name and renamed once every unit has been captured; whatever
/// was not committed is removed on drop.
struct PendingInstances {
    dirs: Vec<(PathBuf, PathBuf)>,
}

impl PendingInstances {
    fn new() -> Self {
        Self { dirs: Vec::new() }
    }

    /// Create the `.partial` directory for `dest` and return its path
    fn create(&mut self, dest: PathBuf) -> Result<PathBuf> {
        let partial = archive::partial_path(&dest);
        fs::create_dir_all(&partial)
            .map_err(|e| StackError::io(format!("Failed to create {}", partial.display()), e))?;
        self.dirs.push((partial.clone(), dest));
        Ok(partial)
    }

    /// Rename every partial directory into place and point the reports at it
    fn commit(&mut self, reports: &mut [ServiceReport]) -> Result<()> {
        for report in reports.iter_mut() {
            let Some(index) = self
                .dirs
                .iter()
                .position(|(partial, _)| report.instance.as_ref() == Some(partial))
            else {
                continue;
            };
            let (partial, dest) = self.dirs.remove(index);
            fs::rename(&partial, &dest).map_err(|e| {
                StackError::io(format!("Failed to finalize {}", dest.display()), e)
            })?;
            report.instance = Some(dest);
        }
        Ok(())
    }
}

impl Drop for PendingInstances {
    fn drop(&mut self) {
        for (partial, _) in &self.dirs {
            warn!(path = %partial.display(), "removing incomplete backup instance");
            if let Err(e) = archive::remove_path(partial) {
                warn!(path = %partial.display(), error = %e, "failed to remove incomplete backup instance");
            }
        }
    }
}

pub struct OperationRunner {
    registry: Registry,
    engine: Arc<dyn ContainerEngine>,
    snapshots: SnapshotEngine,
    settings: RunnerSettings,
}

impl OperationRunner {
    pub fn new(registry: Registry, engine: Arc<dyn ContainerEngine>, settings: RunnerSettings) -> Self {
        let snapshots = SnapshotEngine::new(engine.clone(), settings.helper_image.clone());
        Self {
            registry,
            engine,
            snapshots,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn service(&self, name: &str) -> Result<&Service> {
        self.registry
            .get(name)
            .ok_or_else(|| StackError::UnknownService(name.to_string()))
    }

    fn compose_dir(&self, service: &Service) -> PathBuf {
        self.settings.project_root.join(&service.compose.dir)
    }

    async fn is_running(&self, service: &Service) -> bool {
        for container in &service.containers {
            if let Ok(status) = self.engine.inspect_health(container).await {
                if status.is_running() {
                    return true;
                }
            }
        }
        false
    }

    /// Minute resolution unless an instance or bundle with that name exists
    fn backup_timestamp(&self, selection: &Selection) -> String {
        let now = Local::now();
        let stamp = now.format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let taken = selection.names().iter().any(|name| {
            self.settings
                .backup_root
                .join(name)
                .join(instance_dir_name(name, &stamp))
                .exists()
        }) || self
            .settings
            .backup_root
            .join(archive_file_name(&self.settings.archive_prefix, &stamp))
            .exists();

        if taken {
            now.format(BACKUP_TIMESTAMP_FORMAT_SECONDS).to_string()
        } else {
            stamp
        }
    }

    /// Stop in the given order. On failure the services already stopped are
    /// started again and the run aborts.
    async fn stop_services(&self, order: &[String]) -> Result<Vec<String>> {
        let mut stopped: Vec<String> = Vec::new();
        for name in order {
            let service = self.service(name)?;
            info!(service = %name, "stopping");
            if let Err(e) = self.engine.compose_down(&self.compose_dir(service)).await {
                error!(service = %name, error = %e, "stop failed");
                if !stopped.is_empty() {
                    warn!(services = ?stopped, "restarting services stopped so far");
                    let set: BTreeSet<String> = stopped.iter().cloned().collect();
                    self.start_sequence(&set).await;
                }
                return Err(StackError::engine(name, "compose down", e));
            }
            stopped.push(name.clone());
        }
        Ok(stopped)
    }

    /// Start `set` in dependency order, gating on health wherever a later
    /// service in the sequence depends on the one just started.
    async fn start_sequence(&self, set: &BTreeSet<String>) -> StartReport {
        let sequencer = Sequencer::new(&self.registry);
        let order = sequencer.compute_start_order(set);
        let mut report = StartReport::default();
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for (i, name) in order.iter().enumerate() {
            let Some(service) = self.registry.get(name) else {
                continue;
            };

            if let Some(dep) = service.depends_on.iter().find(|d| blocked.contains(*d)) {
                warn!(service = %name, dependency = %dep, "not starting, dependency unavailable");
                report.skipped.push(name.clone());
                blocked.insert(name.clone());
                continue;
            }

            info!(service = %name, "starting");
            if let Err(e) = self
                .engine
                .compose_up(&self.compose_dir(service), &service.compose.services)
                .await
            {
                error!(service = %name, error = %e, "start failed");
                report.failed.push((name.clone(), e.to_string()));
                blocked.insert(name.clone());
                continue;
            }

            let pending = &order[i + 1..];
            let container = match &service.health_container {
                Some(c) if sequencer.has_pending_dependents(name, pending) => c,
                _ => {
                    report.started.push(name.clone());
                    continue;
                }
            };

            let last = match self
                .settings
                .health
                .wait_healthy(self.engine.as_ref(), container)
                .await
            {
                Ok(HealthOutcome::Healthy) => {
                    info!(service = %name, "healthy");
                    report.started.push(name.clone());
                    continue;
                }
                Ok(HealthOutcome::TimedOut(status)) => status,
                Err(e) => {
                    warn!(service = %name, error = %e, "health check failed");
                    HealthStatus::Missing
                }
            };

            warn!(
                service = %name,
                container = %container,
                status = last.as_str(),
                "not healthy after {:?}",
                self.settings.health.timeout
            );
            report.unhealthy.push(name.clone());
            if self.settings.on_unhealthy == UnhealthyPolicy::SkipDependents {
                blocked.insert(name.clone());
            }
        }
        report
    }

    pub async fn backup(
        &self,
        selection: &Selection,
        options: &BackupOptions,
        prompter: &mut dyn Prompter,
    ) -> Result<BackupReport> {
        if selection.is_empty() {
            return Ok(BackupReport::default());
        }
        let _lock = BackupLock::acquire(&self.settings.backup_root)?;
        let sequencer = Sequencer::new(&self.registry);

        let stop_set = sequencer.compute_stop_set(selection);
        let mut was_running = BTreeSet::new();
        for name in &stop_set {
            if self.is_running(self.service(name)?).await {
                was_running.insert(name.clone());
            }
        }

        let timestamp = self.backup_timestamp(selection);
        let mut pending = PendingInstances::new();
        let mut reports = Vec::with_capacity(selection.len());
        for name in selection.names() {
            let dir = pending.create(
                self.settings
                    .backup_root
                    .join(name)
                    .join(instance_dir_name(name, &timestamp)),
            )?;
            reports.push(ServiceReport::new(name, Some(dir)));
        }

        // Dumps need the live database, so they run before anything stops
        for report in &mut reports {
            let service = self.service(&report.service)?;
            let (Some(dump), Some(dir)) = (&service.persistence.dump, &report.instance) else {
                continue;
            };
            let unit = dump_unit(dump);
            let status = self
                .engine
                .inspect_health(&dump.container)
                .await
                .unwrap_or(HealthStatus::Missing);
            let outcome = if !status.is_ready() {
                UnitOutcome::Skipped(format!("{} is {}", dump.container, status.as_str()))
            } else {
                match self
                    .snapshots
                    .capture_logical_dump(&service.name, dump, &self.settings.project_root, &dir.join(&dump.file_name))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("logical dump failed: {}", e);
                        UnitOutcome::Skipped(format!("dump failed: {}", e))
                    }
                }
            };
            report.record(unit, Ok(outcome))?;
        }

        let to_stop: Vec<String> = sequencer
            .compute_stop_order(&stop_set)
            .into_iter()
            .filter(|name| was_running.contains(name))
            .collect();
        let mut stopped = Vec::new();
        if !to_stop.is_empty() {
            let question = format!("Stop {} for a consistent backup?", to_stop.join(", "));
            if decide(options.stop, prompter, &question, true)? {
                stopped = self.stop_services(&to_stop).await?;
            } else {
                warn!("backing up running services; volume data may be inconsistent");
            }
        }

        let captured = match self.capture_all(&mut reports).await {
            Ok(()) => pending.commit(&mut reports),
            Err(e) => Err(e),
        };

        let bundled = match captured {
            Ok(()) => self.bundle(&reports, &timestamp, options.bundle, prompter),
            Err(e) => Err(e),
        };

        let mut restart = None;
        if !stopped.is_empty() {
            let question = format!("Restart {}?", stopped.join(", "));
            if decide(options.restart, prompter, &question, true)? {
                let set: BTreeSet<String> = stopped.iter().cloned().collect();
                restart = Some(self.start_services(&set).await);
            } else {
                warn!(services = ?stopped, "left stopped");
            }
        }

        Ok(BackupReport {
            timestamp,
            services: reports,
            bundle: bundled?,
            stopped,
            restart,
        })
    }

    async fn capture_all(&self, reports: &mut [ServiceReport]) -> Result<()> {
        let root = &self.settings.project_root;
        for report in reports.iter_mut() {
            let service = self.service(&report.service)?;
            let Some(dir) = report.instance.clone() else {
                continue;
            };
            info!(service = %service.name, dest = %dir.display(), "backing up");

            for bound in &service.persistence.bound {
                let unit = bound_unit(bound);
                let result = self.snapshots.capture_directory(
                    &service.name,
                    &unit,
                    &root.join(&bound.source),
                    &dir.join(&bound.name),
                );
                report.record(unit, result)?;
            }

            if let Some(volume) = &service.persistence.volume {
                let result = self.snapshots.capture_volume(&service.name, volume, &dir).await;
                report.record(volume_unit(volume), result)?;
            }

            let manifest = InstanceManifest {
                service: &service.name,
                created_at: Local::now(),
                tool_version: env!("CARGO_PKG_VERSION"),
                units: &report.units,
            };
            let written = serde_json::to_vec_pretty(&manifest)
                .map_err(std::io::Error::from)
                .and_then(|json| fs::write(dir.join(MANIFEST_FILE), json));
            if let Err(e) = written {
                warn!(service = %service.name, error = %e, "failed to write manifest");
            }
        }
        Ok(())
    }

    fn bundle(
        &self,
        reports: &[ServiceReport],
        timestamp: &str,
        decision: Decision,
        prompter: &mut dyn Prompter,
    ) -> Result<Option<PathBuf>> {
        let entries: Vec<(PathBuf, PathBuf)> = reports
            .iter()
            .filter(|r| !r.failed_entirely())
            .filter_map(|r| {
                let dir = r.instance.as_ref()?;
                let name = dir.file_name()?;
                Some((PathBuf::from(&r.service).join(name), dir.clone()))
            })
            .collect();
        if entries.is_empty() || !decide(decision, prompter, "Bundle this backup into a single archive?", false)? {
            return Ok(None);
        }

        let path = self
            .settings
            .backup_root
            .join(archive_file_name(&self.settings.archive_prefix, timestamp));
        archive::pack_bundle(&path, &entries).map_err(|e| StackError::Archive {
            path: path.clone(),
            message: e.to_string(),
        })?;
        info!(archive = %path.display(), services = entries.len(), "bundle written");
        Ok(Some(path))
    }

    /// `requested` of `None` (or empty) offers the available services.
    pub async fn restore(
        &self,
        requested: Option<&[String]>,
        options: &RestoreOptions,
        prompter: &mut dyn Prompter,
    ) -> Result<RestoreOutcome> {
        if !self.settings.backup_root.is_dir() {
            return Err(StackError::NotFound {
                root: self.settings.backup_root.clone(),
            });
        }
        let _lock = BackupLock::acquire(&self.settings.backup_root)?;
        let snapshot = self.list()?;
        let resolved = snapshot.resolve_source();
        let available = resolved.available();

        let selection = match requested {
            Some(names) if !names.is_empty() => {
                let selection = self.registry.validate_selection(names)?;
                if let Some(name) = selection.names().iter().find(|n| !available.contains(*n)) {
                    return Err(StackError::Unavailable(name.clone()));
                }
                selection
            }
            _ => {
                let offered: Vec<String> = self
                    .registry
                    .names()
                    .filter(|n| available.contains(*n))
                    .map(String::from)
                    .collect();
                let picked = prompter.select(&offered)?;
                if picked.is_empty() {
                    info!("nothing selected");
                    return Ok(RestoreOutcome::Cancelled);
                }
                self.registry.validate_selection(&picked)?
            }
        };

        let sequencer = Sequencer::new(&self.registry);
        let stop_set = sequencer.compute_stop_set(&selection);
        let plan = RestorePlan {
            mode: resolved.mode,
            source: resolved
                .archive
                .as_ref()
                .map(|a| a.path.clone())
                .unwrap_or_else(|| self.settings.backup_root.clone()),
            services: selection.names().to_vec(),
            stop_order: sequencer.compute_stop_order(&stop_set),
        };

        if !options.assume_yes && !prompter.confirm_phrase(&plan.render(), RESTORE_CONFIRMATION)? {
            info!("restore cancelled");
            return Ok(RestoreOutcome::Cancelled);
        }

        // Extract before stopping anything so an unreadable archive aborts early
        let source = materialize(&resolved, &selection, &self.settings.backup_root)?;
        let stopped = self.stop_services(&plan.stop_order).await?;

        let root = &self.settings.project_root;
        let mut reports = Vec::with_capacity(selection.len());
        for name in selection.names() {
            let service = self.service(name)?;
            let Some(instance) = source.instances.get(name) else {
                let mut report = ServiceReport::new(name, None);
                report.error = Some("archive holds no backup instance for this service".to_string());
                error!(service = %name, "missing from extracted archive");
                reports.push(report);
                continue;
            };

            info!(service = %name, from = %instance.root_path.display(), "restoring");
            let mut report = ServiceReport::new(name, Some(instance.root_path.clone()));
            for bound in &service.persistence.bound {
                let unit = bound_unit(bound);
                let result = self.snapshots.restore_directory(
                    name,
                    &unit,
                    &instance.root_path.join(&bound.name),
                    &root.join(&bound.source),
                );
                report.record(unit, result)?;
            }
            if let Some(volume) = &service.persistence.volume {
                let result = self
                    .snapshots
                    .restore_volume(name, volume, &instance.root_path)
                    .await;
                report.record(volume_unit(volume), result)?;
            }
            report.fail_if_nothing_restored();
            reports.push(report);
        }
        drop(source);

        let question = format!("Start {} now?", plan.stop_order.join(", "));
        let start = if decide(options.start, prompter, &question, true)? {
            Some(self.start_services(&stop_set).await)
        } else {
            None
        };

        Ok(RestoreOutcome::Completed(RestoreReport {
            plan,
            services: reports,
            stopped,
            start,
        }))
    }

    pub async fn start(&self, selection: &Selection) -> Result<StartReport> {
        Ok(self.start_services(&selection.to_set()).await)
    }

    /// Every start (command, restore, backup restart) needs the shared
    /// network the compose projects attach to. Without it nothing is started.
    async fn start_services(&self, set: &BTreeSet<String>) -> StartReport {
        let network = &self.settings.network;
        if let Err(e) = self.engine.ensure_network(network).await {
            let e = StackError::engine("stack", &format!("network {}", network), e);
            error!("{}", e);
            let order = Sequencer::new(&self.registry).compute_start_order(set);
            return StartReport {
                failed: order.into_iter().map(|name| (name, e.to_string())).collect(),
                ..Default::default()
            };
        }
        self.start_sequence(set).await
    }

    pub fn list(&self) -> Result<CatalogSnapshot> {
        Catalog::new(&self.registry, self.settings.archive_prefix.clone())
            .scan(&self.settings.backup_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::tests::{tree_digest, write};
    use crate::core::catalog::tests::{at, make_folder, set_mtime};
    use crate::core::prompt::{NonInteractive, TerminalPrompter};
    use crate::core::testing::FakeEngine;
    use std::io::Cursor;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        fake: Arc<FakeEngine>,
        runner: OperationRunner,
    }

    fn fixture(policy: UnhealthyPolicy) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("stack");
        let registry = Registry::default_stack().unwrap();
        let fake = Arc::new(FakeEngine::new(tmp.path()));

        for service in registry.list_services() {
            let containers: Vec<&str> = service.containers.iter().map(|c| c.as_str()).collect();
            fake.register_compose(&root.join(&service.compose.dir), &service.name, &containers);
        }

        write(&root.join("supabase/docker/.env"), "POSTGRES_PASSWORD=secret\n");
        write(&root.join("supabase/docker/volumes/api/kong.yml"), "services: []");
        write(&root.join("supabase/docker/volumes/functions/main/index.ts"), "export {}");
        write(&root.join("supabase/docker/volumes/storage/stub/file"), "blob");
        write(&root.join("n8n/.env"), "N8N_HOST=localhost\n");
        write(&root.join("n8n/local-files/workflow.json"), "{\"nodes\":[]}");
        write(&root.join("npm/.env"), "DB=sqlite\n");
        write(&root.join("npm/data/database.sqlite"), "sqlite");
        write(&root.join("npm/letsencrypt/live/cert.pem"), "cert");
        write(&root.join("cloudflared/.env"), "TUNNEL_TOKEN=abc\n");

        let db = fake.add_volume("supabase_db_data");
        write(&db.join("PG_VERSION"), "15");
        let n8n = fake.add_volume("n8n_data");
        write(&n8n.join("config"), "{\"encryptionKey\":\"k\"}");
        // portainer_data intentionally absent

        let runner = OperationRunner::new(
            registry,
            fake.clone(),
            RunnerSettings {
                project_root: root.clone(),
                backup_root: root.join("backups"),
                archive_prefix: "n8n_stack".to_string(),
                helper_image: "alpine:3.20".to_string(),
                network: "stack_net".to_string(),
                health: HealthGate {
                    timeout: Duration::from_millis(30),
                    interval: Duration::from_millis(1),
                },
                on_unhealthy: policy,
            },
        );

        Fixture {
            _tmp: tmp,
            root,
            fake,
            runner,
        }
    }

    fn mark_running(fx: &Fixture, services: &[&str]) {
        for name in services {
            for container in &fx.runner.registry().get(name).unwrap().containers {
                fx.fake.set_status(container, HealthStatus::Healthy);
            }
        }
    }

    fn always() -> BackupOptions {
        BackupOptions {
            stop: Decision::Always,
            bundle: Decision::Never,
            restart: Decision::Always,
        }
    }

    fn yes_no_start() -> RestoreOptions {
        RestoreOptions {
            assume_yes: true,
            start: Decision::Never,
        }
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{} not in {:?}", call, calls))
    }

    #[tokio::test]
    async fn test_backup_all_services() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        mark_running(&fx, &["supabase", "n8n", "cloudflared", "portainer"]);

        let selection = fx.runner.registry().all();
        let report = fx
            .runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();

        assert!(!report.has_failures(), "{:?}", report);
        let supabase = &report.services[0];
        let dir = supabase.instance.as_ref().unwrap();
        assert!(dir.join(".env").is_file());
        assert!(dir.join("functions/main/index.ts").is_file());
        assert!(dir.join("supabase_db_data.tar.gz").is_file());
        assert!(dir.join("supabase_dump.sql").is_file());
        assert!(dir.join(MANIFEST_FILE).is_file());

        // Missing volume is a skip, not a failure
        let portainer = report.services.iter().find(|s| s.service == "portainer").unwrap();
        let portainer_dir = portainer.instance.as_ref().unwrap();
        assert!(portainer_dir.join("portainer_data.skipped").exists());
        assert!(matches!(portainer.units[0].status, UnitStatus::Skipped { .. }));
        assert!(!portainer.failed_entirely());

        // The dump ran before supabase went down
        let calls = fx.fake.calls();
        let dump = calls.iter().position(|c| c.starts_with("exec:supabase-db:pg_dump")).unwrap();
        assert!(dump < position(&calls, "down:supabase"));
        assert!(position(&calls, "down:n8n") < position(&calls, "down:supabase"));

        // Only what was running before is restarted, dependencies first
        assert!(!calls.contains(&"down:npm".to_string()));
        assert!(!calls.contains(&"up:npm".to_string()));
        assert!(position(&calls, "up:supabase") < position(&calls, "up:n8n"));
        assert_eq!(fx.fake.status("n8n"), HealthStatus::Healthy);
        assert!(report.restart.unwrap().failed.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_records_unit_outcomes() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        let selection = fx.runner.registry().validate_selection(&["portainer"]).unwrap();
        let report = fx
            .runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();

        let dir = report.services[0].instance.clone().unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["service"], "portainer");
        assert_eq!(manifest["units"][0]["unit"], "volume portainer_data");
        assert_eq!(manifest["units"][0]["status"], "skipped");
    }

    #[tokio::test]
    async fn test_failed_stop_restarts_and_aborts() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        mark_running(&fx, &["supabase", "n8n"]);
        fx.fake.fail_down("supabase");

        let selection = fx.runner.registry().validate_selection(&["supabase"]).unwrap();
        let err = fx
            .runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap_err();

        assert!(matches!(err, StackError::Engine { ref service, .. } if service == "supabase"));
        let calls = fx.fake.calls();
        assert!(position(&calls, "down:n8n") < position(&calls, "up:n8n"));
        assert_eq!(fx.fake.status("n8n"), HealthStatus::Healthy);
        // Lock released on abort
        assert!(!fx.root.join("backups").join(crate::utils::constants::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_aborted_backup_does_not_shadow_previous_one() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        mark_running(&fx, &["supabase", "n8n"]);
        let selection = fx.runner.registry().validate_selection(&["supabase"]).unwrap();
        let good = fx
            .runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let good_dir = good.services[0].instance.clone().unwrap();

        mark_running(&fx, &["supabase", "n8n"]);
        fx.fake.fail_down("supabase");
        fx.runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap_err();

        // Only the complete instance is left
        let instances: Vec<PathBuf> = fs::read_dir(fx.root.join("backups/supabase"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(instances, vec![good_dir.clone()]);

        fx.fake.allow_down("supabase");
        let db = fx.fake.volume_path("supabase_db_data").unwrap();
        write(&db.join("PG_VERSION"), "DRIFTED");
        write(&fx.root.join("supabase/docker/.env"), "DRIFTED\n");

        let outcome = fx
            .runner
            .restore(Some(&["supabase".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore was cancelled");
        };
        assert!(!report.has_failures(), "{:?}", report.services);
        assert_eq!(report.services[0].instance.as_ref(), Some(&good_dir));
        let db = fx.fake.volume_path("supabase_db_data").unwrap();
        assert_eq!(fs::read_to_string(db.join("PG_VERSION")).unwrap(), "15");
        assert_eq!(
            fs::read_to_string(fx.root.join("supabase/docker/.env")).unwrap(),
            "POSTGRES_PASSWORD=secret\n"
        );
    }

    #[tokio::test]
    async fn test_instance_without_data_fails_restore() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        fs::create_dir_all(fx.root.join("backups/npm/npm_backup_2024-01-01_10-00")).unwrap();

        let outcome = fx
            .runner
            .restore(Some(&["npm".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore was cancelled");
        };
        assert!(report.services[0].failed_entirely());
        assert!(report.has_failures());
        assert_eq!(fs::read_to_string(fx.root.join("npm/data/database.sqlite")).unwrap(), "sqlite");
    }

    #[tokio::test]
    async fn test_restore_without_backup_root_creates_nothing() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        let err = fx
            .runner
            .restore(Some(&["n8n".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: true })
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::NotFound { .. }));
        assert!(!fx.root.join("backups").exists());
    }

    #[tokio::test]
    async fn test_backup_then_restore_round_trip() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        mark_running(&fx, &["supabase", "n8n"]);
        let files = fx.root.join("n8n/local-files");
        let files_before = tree_digest(&files);
        let volume_before = tree_digest(&fx.fake.volume_path("n8n_data").unwrap());

        let selection = fx.runner.registry().validate_selection(&["n8n"]).unwrap();
        fx.runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();

        // Drift after the backup
        write(&files.join("workflow.json"), "{\"nodes\":[\"changed\"]}");
        write(&files.join("scratch.txt"), "new");
        write(&fx.fake.volume_path("n8n_data").unwrap().join("config"), "rotated");

        let outcome = fx
            .runner
            .restore(Some(&["n8n".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore was cancelled");
        };

        assert_eq!(report.plan.mode, SourceMode::Folders);
        assert_eq!(report.stopped, vec!["n8n".to_string()]);
        assert!(!report.has_failures());
        assert!(report.services[0]
            .units
            .iter()
            .all(|u| u.status == UnitStatus::Restored));
        assert_eq!(tree_digest(&files), files_before);
        assert_eq!(tree_digest(&fx.fake.volume_path("n8n_data").unwrap()), volume_before);
        assert!(report.start.is_none());
    }

    #[tokio::test]
    async fn test_restore_database_stops_dependent_workflow_engine() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        mark_running(&fx, &["supabase", "n8n"]);
        let selection = fx.runner.registry().validate_selection(&["supabase"]).unwrap();
        fx.runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();

        let outcome = fx
            .runner
            .restore(
                Some(&["supabase".to_string()]),
                &RestoreOptions {
                    assume_yes: true,
                    start: Decision::Always,
                },
                &mut NonInteractive { assume_yes: false },
            )
            .await
            .unwrap();
        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore was cancelled");
        };

        assert_eq!(report.plan.services, vec!["supabase".to_string()]);
        assert_eq!(report.stopped, vec!["n8n".to_string(), "supabase".to_string()]);
        let start = report.start.unwrap();
        assert_eq!(start.started, vec!["supabase".to_string(), "n8n".to_string()]);

        // A fresh host has no shared network until the start creates it
        let calls = fx.fake.mutations();
        let restored = calls.iter().rposition(|c| c.starts_with("run:tar xzf")).unwrap();
        let network = calls.iter().rposition(|c| c == "network:stack_net").unwrap();
        assert!(restored < network);
        assert!(network < calls.iter().rposition(|c| c == "up:supabase").unwrap());
    }

    #[tokio::test]
    async fn test_declined_confirmation_changes_nothing() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        make_folder(&fx.root.join("backups"), "n8n", "2024-01-01_10-00", at(0));
        let before = tree_digest(&fx.root);

        let mut prompter = TerminalPrompter::new(Cursor::new(b"no\n".to_vec()), Vec::new());
        let outcome = fx
            .runner
            .restore(
                Some(&["n8n".to_string()]),
                &RestoreOptions {
                    assume_yes: false,
                    start: Decision::Ask,
                },
                &mut prompter,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, RestoreOutcome::Cancelled));
        assert!(fx.fake.mutations().is_empty(), "{:?}", fx.fake.mutations());
        assert_eq!(tree_digest(&fx.root), before);
    }

    #[tokio::test]
    async fn test_unavailable_service_rejected_before_mutation() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        make_folder(&fx.root.join("backups"), "n8n", "2024-01-01_10-00", at(0));

        let err = fx
            .runner
            .restore(Some(&["supabase".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: true })
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Unavailable(ref name) if name == "supabase"));
        assert!(fx.fake.mutations().is_empty());

        // Only n8n is offered when nothing was named
        let mut prompter = TerminalPrompter::new(Cursor::new(b"supabase\n\n".to_vec()), Vec::new());
        let outcome = fx.runner.restore(None, &yes_no_start(), &mut prompter).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_restore_from_newer_archive() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        let selection = fx.runner.registry().validate_selection(&["n8n", "npm"]).unwrap();
        let options = BackupOptions {
            bundle: Decision::Always,
            ..always()
        };
        let report = fx
            .runner
            .backup(&selection, &options, &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let bundle = report.bundle.unwrap();
        assert!(bundle.is_file());
        set_mtime(&bundle, SystemTime::now() + Duration::from_secs(60));

        write(&fx.root.join("npm/data/database.sqlite"), "drifted");
        let outcome = fx
            .runner
            .restore(Some(&["npm".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();
        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore was cancelled");
        };

        assert_eq!(report.plan.mode, SourceMode::Archive);
        assert_eq!(report.plan.source, bundle);
        assert_eq!(
            fs::read_to_string(fx.root.join("npm/data/database.sqlite")).unwrap(),
            "sqlite"
        );
        // Scratch extraction is gone
        let leftovers: Vec<_> = fs::read_dir(fx.root.join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".restore-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_volume_in_use_aborts_restore() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        let selection = fx.runner.registry().validate_selection(&["n8n"]).unwrap();
        fx.runner
            .backup(&selection, &always(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap();

        fx.fake.mark_in_use("n8n_data");
        let err = fx
            .runner
            .restore(Some(&["n8n".to_string()]), &yes_no_start(), &mut NonInteractive { assume_yes: false })
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::VolumeInUse { .. }));
    }

    #[tokio::test]
    async fn test_start_orders_and_gates_on_health() {
        let fx = fixture(UnhealthyPolicy::Proceed);
        let report = fx.runner.start(&fx.runner.registry().all()).await.unwrap();

        let calls = fx.fake.mutations();
        assert_eq!(calls[0], "network:stack_net");
        assert!(position(&calls, "up:supabase") < position(&calls, "up:n8n"));
        assert!(position(&calls, "up:npm") < position(&calls, "up:cloudflared"));
        assert_eq!(report.started.len(), 5);
        // supabase-db polled because n8n waits on it
        assert!(fx.fake.calls().contains(&"health:supabase-db".to_string()));
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_policy() {
        let fx = fixture(UnhealthyPolicy::SkipDependents);
        fx.fake.set_up_status("supabase-db", HealthStatus::Unhealthy);
        let report = fx.runner.start(&fx.runner.registry().all()).await.unwrap();
        assert_eq!(report.unhealthy, vec!["supabase".to_string()]);
        assert_eq!(report.skipped, vec!["n8n".to_string()]);
        assert!(!fx.fake.calls().contains(&"up:n8n".to_string()));
        assert!(report.started.contains(&"portainer".to_string()));

        let fx = fixture(UnhealthyPolicy::Proceed);
        fx.fake.set_up_status("supabase-db", HealthStatus::Unhealthy);
        let report = fx.runner.start(&fx.runner.registry().all()).await.unwrap();
        assert_eq!(report.unhealthy, vec!["supabase".to_string()]);
        assert!(report.skipped.is_empty());
        assert!(report.started.contains(&"n8n".to_string()));
    }

    #[test]
    fn test_partial_failure_is_not_total() {
        let mut report = ServiceReport::new("npm", None);
        report
            .record(
                "directory data".into(),
                Err(StackError::HelperFailed {
                    service: "npm".into(),
                    unit: "directory data".into(),
                    status: 1,
                }),
            )
            .unwrap();
        assert!(report.failed_entirely());
        report.record("file .env".into(), Ok(UnitOutcome::Captured)).unwrap();
        assert!(!report.failed_entirely());
    }
}
