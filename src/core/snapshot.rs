/// Snapshot engine
///
/// Captures and restores single persistence units: bound files/directories,
/// named volumes (through a short-lived helper container) and logical
/// database dumps. Callers are responsible for stopping services first.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::archive;
use crate::core::docker::{ContainerEngine, EngineError, EphemeralRun, Mount};
use crate::core::error::{Result, StackError};
use crate::core::registry::{BoundPath, DumpSpec, PathKind, VolumeSpec};

/// Mount point of the volume inside helper containers
pub const HELPER_VOLUME_DIR: &str = "/volume";
/// Mount point of the host backup directory inside helper containers
pub const HELPER_BACKUP_DIR: &str = "/backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Captured,
    Restored,
    Skipped(String),
}

pub fn bound_unit(bound: &BoundPath) -> String {
    match bound.kind {
        PathKind::File => format!("file {}", bound.name),
        PathKind::Directory => format!("directory {}", bound.name),
    }
}

pub fn volume_unit(volume: &VolumeSpec) -> String {
    format!("volume {}", volume.id)
}

pub fn dump_unit(dump: &DumpSpec) -> String {
    format!("dump {}", dump.file_name)
}

/// `tar czf /backup/<file> -C /volume [--exclude=./x]... .`
pub fn archive_command(file_name: &str, excludes: &[PathBuf]) -> Vec<String> {
    let mut command = vec![
        "tar".to_string(),
        "czf".to_string(),
        format!("{}/{}", HELPER_BACKUP_DIR, file_name),
        "-C".to_string(),
        HELPER_VOLUME_DIR.to_string(),
    ];
    for exclude in excludes {
        let rel = exclude.to_string_lossy();
        let rel = rel.trim_start_matches("./");
        command.push(format!("--exclude=./{}", rel));
    }
    command.push(".".to_string());
    command
}

/// `tar xzf /backup/<file> -C /volume`
pub fn extract_command(file_name: &str) -> Vec<String> {
    vec![
        "tar".to_string(),
        "xzf".to_string(),
        format!("{}/{}", HELPER_BACKUP_DIR, file_name),
        "-C".to_string(),
        HELPER_VOLUME_DIR.to_string(),
    ]
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map_err(|e| StackError::io(format!("Failed to resolve {}", path.display()), e))
}

pub struct SnapshotEngine {
    engine: Arc<dyn ContainerEngine>,
    helper_image: String,
}

impl SnapshotEngine {
    pub fn new(engine: Arc<dyn ContainerEngine>, helper_image: impl Into<String>) -> Self {
        Self {
            engine,
            helper_image: helper_image.into(),
        }
    }

    /// Recursive copy of a bound file or directory into the backup instance.
    pub fn capture_directory(
        &self,
        service: &str,
        unit: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<UnitOutcome> {
        if !source.exists() {
            return Err(StackError::MissingSource {
                service: service.to_string(),
                unit: unit.to_string(),
                path: source.to_path_buf(),
            });
        }

        let files = archive::copy_tree(source, dest)
            .map_err(|e| StackError::io(format!("{}: copying {}", service, unit), e))?;
        debug!(service, unit, files, "captured");
        Ok(UnitOutcome::Captured)
    }

    /// Archive a named volume into `<dest_dir>/<volume>.tar.gz`. A volume that
    /// does not exist leaves a `<volume>.skipped` marker instead.
    pub async fn capture_volume(
        &self,
        service: &str,
        volume: &VolumeSpec,
        dest_dir: &Path,
    ) -> Result<UnitOutcome> {
        let unit = volume_unit(volume);
        let exists = self
            .engine
            .volume_exists(&volume.id)
            .await
            .map_err(|e| StackError::engine(service, &unit, e))?;

        if !exists {
            let marker = dest_dir.join(volume.skip_marker_name());
            let reason = format!("volume {} did not exist at {}", volume.id, Local::now().to_rfc3339());
            fs::write(&marker, format!("{}\n", reason))
                .map_err(|e| StackError::io(format!("{}: writing skip marker", service), e))?;
            return Ok(UnitOutcome::Skipped(reason));
        }

        let dest_dir = absolute(dest_dir)?;
        let final_name = volume.archive_name();
        let partial = archive::partial_path(&dest_dir.join(&final_name));
        let partial_name = partial
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let run = EphemeralRun {
            image: self.helper_image.clone(),
            mounts: vec![
                Mount::volume(&volume.id, HELPER_VOLUME_DIR, true),
                Mount::host(&dest_dir, HELPER_BACKUP_DIR, false),
            ],
            command: archive_command(&partial_name, &volume.exclude),
        };

        let status = self
            .engine
            .run_ephemeral(&run)
            .await
            .map_err(|e| StackError::engine(service, &unit, e));
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };

        if status != 0 {
            let _ = fs::remove_file(&partial);
            return Err(StackError::HelperFailed {
                service: service.to_string(),
                unit,
                status,
            });
        }

        fs::rename(&partial, dest_dir.join(&final_name))
            .map_err(|e| StackError::io(format!("{}: finalizing {}", service, unit), e))?;
        info!(service, volume = %volume.id, "volume archived");
        Ok(UnitOutcome::Captured)
    }

    /// Run pg_dump inside the live database container. The caller only
    /// invokes this while the container reports healthy.
    pub async fn capture_logical_dump(
        &self,
        service: &str,
        spec: &DumpSpec,
        project_root: &Path,
        dest: &Path,
    ) -> Result<UnitOutcome> {
        let unit = dump_unit(spec);
        let (user, database) = dump_credentials(spec, project_root);

        let mut command = vec![
            "pg_dump".to_string(),
            "-U".to_string(),
            user,
            "-d".to_string(),
            database,
            "--clean".to_string(),
            "--if-exists".to_string(),
        ];
        command.extend(spec.schemas.iter().map(|s| format!("--schema={}", s)));

        let partial = archive::partial_path(dest);
        let bytes = match self.engine.exec_to_file(&spec.container, &command, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(StackError::engine(service, &unit, e));
            }
        };
        fs::rename(&partial, dest).map_err(|e| {
            let _ = fs::remove_file(&partial);
            StackError::io(format!("{}: writing {}", service, unit), e)
        })?;
        info!(service, bytes, "logical dump written");
        Ok(UnitOutcome::Captured)
    }

    /// Replace `dest` with a copy of `source`. The copy goes to a staging
    /// sibling first so a failed copy leaves the previous content in place.
    pub fn restore_directory(
        &self,
        service: &str,
        unit: &str,
        source: &Path,
        dest: &Path,
    ) -> Result<UnitOutcome> {
        if !source.exists() {
            return Err(StackError::MissingSource {
                service: service.to_string(),
                unit: unit.to_string(),
                path: source.to_path_buf(),
            });
        }

        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "restore".to_string());
        let staging = dest.with_file_name(format!(".{}.restore-staging", name));
        let io_err = |e: std::io::Error| StackError::io(format!("{}: restoring {}", service, unit), e);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        archive::remove_path(&staging).map_err(io_err)?;

        if let Err(e) = archive::copy_tree(source, &staging) {
            let _ = archive::remove_path(&staging);
            return Err(io_err(e));
        }

        archive::remove_path(dest).map_err(io_err)?;
        fs::rename(&staging, dest).map_err(io_err)?;
        debug!(service, unit, dest = %dest.display(), "restored");
        Ok(UnitOutcome::Restored)
    }

    /// Delete and recreate the volume, then extract `<volume>.tar.gz` from
    /// `instance_dir` into it. A volume still in use is surfaced, never forced.
    pub async fn restore_volume(
        &self,
        service: &str,
        volume: &VolumeSpec,
        instance_dir: &Path,
    ) -> Result<UnitOutcome> {
        let unit = volume_unit(volume);
        let archive_path = instance_dir.join(volume.archive_name());

        if !archive_path.exists() {
            if instance_dir.join(volume.skip_marker_name()).exists() {
                return Ok(UnitOutcome::Skipped(format!(
                    "volume {} was absent when the backup was taken",
                    volume.id
                )));
            }
            return Err(StackError::MissingSource {
                service: service.to_string(),
                unit,
                path: archive_path,
            });
        }

        // Never destroy the live volume for an archive we cannot read
        archive::verify(&archive_path).map_err(|e| StackError::Archive {
            path: archive_path.clone(),
            message: e.to_string(),
        })?;

        let exists = self
            .engine
            .volume_exists(&volume.id)
            .await
            .map_err(|e| StackError::engine(service, &unit, e))?;
        if exists {
            match self.engine.volume_remove(&volume.id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(EngineError::InUse(_)) => {
                    return Err(StackError::VolumeInUse {
                        volume: volume.id.clone(),
                    })
                }
                Err(e) => return Err(StackError::engine(service, &unit, e)),
            }
        }

        self.engine
            .volume_create(&volume.id)
            .await
            .map_err(|e| StackError::engine(service, &unit, e))?;

        let instance_dir = absolute(instance_dir)?;
        let run = EphemeralRun {
            image: self.helper_image.clone(),
            mounts: vec![
                Mount::volume(&volume.id, HELPER_VOLUME_DIR, false),
                Mount::host(&instance_dir, HELPER_BACKUP_DIR, true),
            ],
            command: extract_command(&volume.archive_name()),
        };

        let status = self
            .engine
            .run_ephemeral(&run)
            .await
            .map_err(|e| StackError::engine(service, &unit, e))?;
        if status != 0 {
            return Err(StackError::HelperFailed {
                service: service.to_string(),
                unit,
                status,
            });
        }

        info!(service, volume = %volume.id, "volume restored");
        Ok(UnitOutcome::Restored)
    }
}

/// User and database for pg_dump, overridden by POSTGRES_USER / POSTGRES_DB
/// from the service's .env when present.
fn dump_credentials(spec: &DumpSpec, project_root: &Path) -> (String, String) {
    let mut user = spec.user.clone();
    let mut database = spec.database.clone();

    if let Some(env_file) = &spec.env_file {
        if let Ok(iter) = dotenvy::from_path_iter(project_root.join(env_file)) {
            for (key, value) in iter.flatten() {
                match key.as_str() {
                    "POSTGRES_USER" if !value.is_empty() => user = value,
                    "POSTGRES_DB" if !value.is_empty() => database = value,
                    _ => {}
                }
            }
        }
    }

    (user, database)
}
