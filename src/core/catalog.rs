/// Backup catalog
///
/// Discovers backup instances and archive bundles under a backup root and
/// decides which of them is the authoritative restore source. Everything here
/// is read-only except `materialize`, which extracts a chosen archive into a
/// scratch directory that is removed when the returned value is dropped.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::archive;
use crate::core::error::{Result, StackError};
use crate::core::registry::{Registry, Selection};
use crate::utils::constants::{BACKUP_TIMESTAMP_FORMAT, BACKUP_TIMESTAMP_FORMAT_SECONDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Folder,
    ExtractedFromArchive,
}

/// One timestamped capture of a single service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInstance {
    pub service: String,
    pub created_at: DateTime<Local>,
    /// Timestamp parsed from the directory name
    pub label: Option<NaiveDateTime>,
    pub root_path: PathBuf,
    pub kind: InstanceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBundle {
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub contained_services: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Archive,
    Folders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEntry {
    Folder(BackupInstance),
    /// Contained in the archive; resolved to an instance after extraction
    Pending { archive: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub mode: SourceMode,
    pub per_service: BTreeMap<String, SourceEntry>,
    pub archive: Option<ArchiveBundle>,
}

#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub root: PathBuf,
    /// Latest standalone instance per service
    pub folders: BTreeMap<String, BackupInstance>,
    pub archive: Option<ArchiveBundle>,
}

pub fn instance_dir_name(service: &str, timestamp: &str) -> String {
    format!("{}_backup_{}", service, timestamp)
}

pub fn archive_file_name(prefix: &str, timestamp: &str) -> String {
    format!("{}_backup_{}.tar.gz", prefix, timestamp)
}

fn instance_pattern(service: &str) -> Regex {
    Regex::new(&format!(
        r"^{}_backup_(\d{{4}}-\d{{2}}-\d{{2}}_\d{{2}}-\d{{2}}(?:-\d{{2}})?)$",
        regex::escape(service)
    ))
    .expect("static instance pattern")
}

fn archive_pattern(prefix: &str) -> Regex {
    Regex::new(&format!(r"^{}_backup_(.+)\.tar\.gz$", regex::escape(prefix)))
        .expect("static archive pattern")
}

fn parse_label(stamp: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT_SECONDS)
        .or_else(|_| NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT))
        .ok()
}

fn modified(path: &Path) -> Option<DateTime<Local>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Local>::from)
}

/// Latest `<service>_backup_<ts>` directory directly under `dir`
pub fn latest_instance(dir: &Path, service: &str, kind: InstanceKind) -> Option<BackupInstance> {
    let pattern = instance_pattern(service);
    let entries = fs::read_dir(dir).ok()?;

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let stamp = pattern.captures(&name)?.get(1)?.as_str().to_string();
            let label = parse_label(&stamp);
            let path = e.path();
            let created_at = modified(&path)
                .or_else(|| label.and_then(|l| Local.from_local_datetime(&l).earliest()))?;
            Some((name, BackupInstance {
                service: service.to_string(),
                created_at,
                label,
                root_path: path,
                kind,
            }))
        })
        .max_by(|(a_name, a), (b_name, b)| {
            (a.label, a.created_at, a_name).cmp(&(b.label, b.created_at, b_name))
        })
        .map(|(_, instance)| instance)
}

pub struct Catalog<'a> {
    registry: &'a Registry,
    archive_prefix: String,
}

impl<'a> Catalog<'a> {
    pub fn new(registry: &'a Registry, archive_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            archive_prefix: archive_prefix.into(),
        }
    }

    /// Walk the backup root. Fails only when neither folders nor an archive exist.
    pub fn scan(&self, root: &Path) -> Result<CatalogSnapshot> {
        let mut folders = BTreeMap::new();
        for name in self.registry.names() {
            if let Some(instance) = latest_instance(&root.join(name), name, InstanceKind::Folder) {
                debug!(service = name, path = %instance.root_path.display(), "latest folder backup");
                folders.insert(name.to_string(), instance);
            }
        }

        let archive = self.latest_archive(root);

        if folders.is_empty() && archive.is_none() {
            return Err(StackError::NotFound {
                root: root.to_path_buf(),
            });
        }

        Ok(CatalogSnapshot {
            root: root.to_path_buf(),
            folders,
            archive,
        })
    }

    fn latest_archive(&self, root: &Path) -> Option<ArchiveBundle> {
        let pattern = archive_pattern(&self.archive_prefix);
        let mut candidates: Vec<(DateTime<Local>, String, PathBuf)> = fs::read_dir(root)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if !pattern.is_match(&name) {
                    return None;
                }
                let path = e.path();
                Some((modified(&path)?, name, path))
            })
            .collect();
        candidates.sort();

        // Newest first; an unreadable bundle falls through to the next one
        for (created_at, _, path) in candidates.into_iter().rev() {
            match self.archive_services(&path) {
                Ok(services) if !services.is_empty() => {
                    return Some(ArchiveBundle {
                        path,
                        created_at,
                        contained_services: services,
                    })
                }
                Ok(_) => warn!(archive = %path.display(), "archive holds no known service backups, ignoring"),
                Err(e) => warn!(archive = %path.display(), error = %e, "unreadable archive, ignoring"),
            }
        }
        None
    }

    fn archive_services(&self, path: &Path) -> std::io::Result<BTreeSet<String>> {
        let pairs = archive::top_level_pairs(path)?;
        Ok(self
            .registry
            .names()
            .filter(|name| {
                let pattern = instance_pattern(name);
                pairs
                    .iter()
                    .any(|(first, second)| first == name && pattern.is_match(second))
            })
            .map(|name| name.to_string())
            .collect())
    }
}

impl CatalogSnapshot {
    /// The archive wins only when strictly newer than every standalone folder.
    pub fn resolve_source(&self) -> ResolvedSource {
        let newest_folder = self.folders.values().map(|i| i.created_at).max();

        let archive_wins = match (&self.archive, newest_folder) {
            (Some(_), None) => true,
            (Some(archive), Some(folder)) => archive.created_at > folder,
            (None, _) => false,
        };

        let mut per_service: BTreeMap<String, SourceEntry> = self
            .folders
            .iter()
            .map(|(name, instance)| (name.clone(), SourceEntry::Folder(instance.clone())))
            .collect();

        match &self.archive {
            Some(archive) if archive_wins => {
                // Services the archive lacks keep their standalone folders
                for name in &archive.contained_services {
                    per_service.insert(
                        name.clone(),
                        SourceEntry::Pending {
                            archive: archive.path.clone(),
                        },
                    );
                }
                ResolvedSource {
                    mode: SourceMode::Archive,
                    per_service,
                    archive: Some(archive.clone()),
                }
            }
            _ => ResolvedSource {
                mode: SourceMode::Folders,
                per_service,
                archive: None,
            },
        }
    }

    /// Services that can actually be restored from the resolved source
    pub fn available_services(&self) -> BTreeSet<String> {
        self.resolve_source().per_service.into_keys().collect()
    }
}

impl ResolvedSource {
    pub fn available(&self) -> BTreeSet<String> {
        self.per_service.keys().cloned().collect()
    }
}

/// Instances ready to be copied from. Holds the scratch directory alive.
#[derive(Debug)]
pub struct MaterializedSource {
    pub instances: BTreeMap<String, BackupInstance>,
    /// Selected services the extracted archive did not actually contain
    pub missing: Vec<String>,
    scratch: Option<TempDir>,
}

impl MaterializedSource {
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|s| s.path())
    }
}

/// Resolve every selected service to a concrete instance, extracting the
/// archive into a scratch directory under `scratch_parent` when needed.
pub fn materialize(
    resolved: &ResolvedSource,
    selection: &Selection,
    scratch_parent: &Path,
) -> Result<MaterializedSource> {
    let mut instances = BTreeMap::new();
    let mut missing = Vec::new();
    let mut scratch: Option<TempDir> = None;

    for name in selection.names() {
        match resolved.per_service.get(name) {
            Some(SourceEntry::Folder(instance)) => {
                instances.insert(name.clone(), instance.clone());
            }
            Some(SourceEntry::Pending { archive }) => {
                if scratch.is_none() {
                    let dir = tempfile::Builder::new()
                        .prefix(".restore-")
                        .tempdir_in(scratch_parent)
                        .map_err(|e| StackError::io("Failed to create scratch directory", e))?;
                    archive::unpack(archive, dir.path()).map_err(|e| StackError::Archive {
                        path: archive.clone(),
                        message: e.to_string(),
                    })?;
                    debug!(scratch = %dir.path().display(), "archive extracted");
                    scratch = Some(dir);
                }

                let extracted = scratch.as_ref().and_then(|dir| {
                    latest_instance(&dir.path().join(name), name, InstanceKind::ExtractedFromArchive)
                });
                match extracted {
                    Some(instance) => {
                        instances.insert(name.clone(), instance);
                    }
                    None => missing.push(name.clone()),
                }
            }
            None => return Err(StackError::Unavailable(name.clone())),
        }
    }

    Ok(MaterializedSource {
        instances,
        missing,
        scratch,
    })
}
