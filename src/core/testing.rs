//! In-memory container engine for tests.
//!
//! Volumes are plain directories under `<root>/.fake-volumes`, and helper
//! containers running the `tar czf` / `tar xzf` commands built by the
//! snapshot engine are carried out with the host-side archive module.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::archive;
use crate::core::docker::{
    ContainerEngine, EngineError, EngineResult, EphemeralRun, HealthStatus, MountSource,
};
use crate::core::snapshot::{HELPER_BACKUP_DIR, HELPER_VOLUME_DIR};

struct ComposeProject {
    label: String,
    containers: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    volumes: BTreeSet<String>,
    in_use: BTreeSet<String>,
    containers: BTreeMap<String, HealthStatus>,
    /// Status a container reports right after `compose up`
    up_status: BTreeMap<String, HealthStatus>,
    projects: BTreeMap<PathBuf, ComposeProject>,
    failing_down: BTreeSet<String>,
    calls: Vec<String>,
}

pub struct FakeEngine {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.join(".fake-volumes"),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_volume(&self, id: &str) -> PathBuf {
        let path = self.root.join(id);
        fs::create_dir_all(&path).unwrap();
        self.lock().volumes.insert(id.to_string());
        path
    }

    pub fn drop_volume(&self, id: &str) {
        let _ = fs::remove_dir_all(self.root.join(id));
        self.lock().volumes.remove(id);
    }

    pub fn volume_path(&self, id: &str) -> Option<PathBuf> {
        self.lock()
            .volumes
            .contains(id)
            .then(|| self.root.join(id))
    }

    pub fn mark_in_use(&self, id: &str) {
        self.lock().in_use.insert(id.to_string());
    }

    /// Declare a compose project at `dir`, reported in `calls()` as `label`
    pub fn register_compose(&self, dir: &Path, label: &str, containers: &[&str]) {
        self.lock().projects.insert(
            dir.to_path_buf(),
            ComposeProject {
                label: label.to_string(),
                containers: containers.iter().map(|c| c.to_string()).collect(),
            },
        );
    }

    pub fn set_status(&self, container: &str, status: HealthStatus) {
        self.lock().containers.insert(container.to_string(), status);
    }

    pub fn set_up_status(&self, container: &str, status: HealthStatus) {
        self.lock().up_status.insert(container.to_string(), status);
    }

    pub fn fail_down(&self, label: &str) {
        self.lock().failing_down.insert(label.to_string());
    }

    pub fn allow_down(&self, label: &str) {
        self.lock().failing_down.remove(label);
    }

    pub fn status(&self, container: &str) -> HealthStatus {
        self.lock()
            .containers
            .get(container)
            .copied()
            .unwrap_or(HealthStatus::Missing)
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls that changed something (compose up/down, volume and helper operations)
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("exists:") && !c.starts_with("health:"))
            .collect()
    }

    fn label_of(state: &FakeState, dir: &Path) -> String {
        state
            .projects
            .get(dir)
            .map(|p| p.label.clone())
            .unwrap_or_else(|| dir.display().to_string())
    }

    fn run_tar(&self, run: &EphemeralRun) -> i64 {
        let mut volume_dir = None;
        let mut backup_dir = None;
        for mount in &run.mounts {
            match (&mount.source, mount.target.as_str()) {
                (MountSource::Volume(id), HELPER_VOLUME_DIR) => {
                    volume_dir = Some(self.add_volume(id));
                }
                (MountSource::Host(path), HELPER_BACKUP_DIR) => backup_dir = Some(path.clone()),
                _ => {}
            }
        }
        let (Some(volume_dir), Some(backup_dir)) = (volume_dir, backup_dir) else {
            return 125;
        };

        let args = &run.command;
        if args.len() < 3 || args[0] != "tar" {
            return 127;
        }
        let file = match args[2].strip_prefix(&format!("{}/", HELPER_BACKUP_DIR)) {
            Some(name) => backup_dir.join(name),
            None => return 2,
        };

        match args[1].as_str() {
            "czf" => {
                let excludes: Vec<PathBuf> = args
                    .iter()
                    .filter_map(|a| a.strip_prefix("--exclude="))
                    .map(PathBuf::from)
                    .collect();
                // Write the exact file name requested, as tar would
                let staging = backup_dir.join(".fake-tar");
                match archive::pack_dir(&volume_dir, &staging, &excludes)
                    .and_then(|_| fs::rename(&staging, &file))
                {
                    Ok(()) => 0,
                    Err(_) => 2,
                }
            }
            "xzf" => match archive::unpack(&file, &volume_dir) {
                Ok(()) => 0,
                Err(_) => 2,
            },
            _ => 2,
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn compose_up(&self, dir: &Path, _services: &[String]) -> EngineResult<()> {
        let mut state = self.lock();
        let label = Self::label_of(&state, dir);
        state.calls.push(format!("up:{}", label));
        let containers = state
            .projects
            .get(dir)
            .map(|p| p.containers.clone())
            .unwrap_or_default();
        for container in containers {
            let status = state
                .up_status
                .get(&container)
                .copied()
                .unwrap_or(HealthStatus::Healthy);
            state.containers.insert(container, status);
        }
        Ok(())
    }

    async fn compose_down(&self, dir: &Path) -> EngineResult<()> {
        let mut state = self.lock();
        let label = Self::label_of(&state, dir);
        state.calls.push(format!("down:{}", label));
        if state.failing_down.contains(&label) {
            return Err(EngineError::Compose {
                dir: dir.to_path_buf(),
                stderr: "simulated failure".to_string(),
            });
        }
        let containers = state
            .projects
            .get(dir)
            .map(|p| p.containers.clone())
            .unwrap_or_default();
        for container in containers {
            state.containers.insert(container, HealthStatus::NotRunning);
        }
        Ok(())
    }

    async fn run_ephemeral(&self, run: &EphemeralRun) -> EngineResult<i64> {
        self.lock().calls.push(format!("run:{}", run.command.join(" ")));
        Ok(self.run_tar(run))
    }

    async fn volume_exists(&self, id: &str) -> EngineResult<bool> {
        let mut state = self.lock();
        state.calls.push(format!("exists:{}", id));
        Ok(state.volumes.contains(id))
    }

    async fn volume_remove(&self, id: &str) -> EngineResult<()> {
        {
            let mut state = self.lock();
            state.calls.push(format!("volume-rm:{}", id));
            if state.in_use.contains(id) {
                return Err(EngineError::InUse(id.to_string()));
            }
            if !state.volumes.contains(id) {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
        self.drop_volume(id);
        Ok(())
    }

    async fn volume_create(&self, id: &str) -> EngineResult<()> {
        self.lock().calls.push(format!("volume-create:{}", id));
        self.add_volume(id);
        Ok(())
    }

    async fn inspect_health(&self, container: &str) -> EngineResult<HealthStatus> {
        let mut state = self.lock();
        state.calls.push(format!("health:{}", container));
        Ok(state
            .containers
            .get(container)
            .copied()
            .unwrap_or(HealthStatus::Missing))
    }

    async fn exec_to_file(&self, container: &str, command: &[String], dest: &Path) -> EngineResult<u64> {
        let mut state = self.lock();
        state.calls.push(format!("exec:{}:{}", container, command.join(" ")));
        let running = state
            .containers
            .get(container)
            .map(|s| s.is_running())
            .unwrap_or(false);
        if !running {
            return Err(EngineError::ExecFailed {
                container: container.to_string(),
                code: 1,
                stderr: "container is not running".to_string(),
            });
        }
        let output = b"-- dump\n";
        fs::write(dest, output)?;
        Ok(output.len() as u64)
    }

    async fn ensure_network(&self, name: &str) -> EngineResult<()> {
        self.lock().calls.push(format!("network:{}", name));
        Ok(())
    }
}
