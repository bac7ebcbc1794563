/// Helper utilities for stack-cli

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::error::StackError;
use crate::core::registry::Registry;
use crate::utils::constants::DEFAULT_COMPOSE_FILE;
use crate::utils::AppConfig;

/// Environment variable consulted after the config file
pub const PROJECT_ROOT_ENV: &str = "STACK_PROJECT_ROOT";

/// A project root holds at least one registered compose context
pub fn is_project_root(dir: &Path, registry: &Registry) -> bool {
    registry
        .list_services()
        .iter()
        .any(|s| dir.join(&s.compose.dir).join(DEFAULT_COMPOSE_FILE).is_file())
}

/// Walk up from `start` to the first directory that is a project root
pub fn find_project_root(start: &Path, registry: &Registry) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| is_project_root(dir, registry))
        .map(Path::to_path_buf)
}

/// Get the project root directory (the one holding every service's compose directory)
pub fn get_project_root(
    explicit: Option<&Path>,
    config: &mut AppConfig,
    registry: &Registry,
) -> Result<PathBuf> {
    // 1. Command line
    if let Some(path) = explicit {
        if !path.is_dir() {
            return Err(StackError::ProjectRootNotFound(format!(
                "{} is not a directory",
                path.display()
            ))
            .into());
        }
        return Ok(path.to_path_buf());
    }

    // 2. Saved configuration
    if let Some(root) = &config.project_root {
        let path = PathBuf::from(root);
        if is_project_root(&path, registry) {
            return Ok(path);
        }
        debug!(root = %path.display(), "configured project root has no compose files, ignoring");
    }

    // 3. Environment variable
    if let Ok(project_root) = std::env::var(PROJECT_ROOT_ENV) {
        let path = PathBuf::from(project_root);
        if is_project_root(&path, registry) {
            remember(config, &path);
            return Ok(path);
        }
    }

    // 4. Search current and parent directories
    let current_dir = std::env::current_dir().context("Failed to get current directory")?;
    if let Some(path) = find_project_root(&current_dir, registry) {
        info!(root = %path.display(), "found project root");
        remember(config, &path);
        return Ok(path);
    }

    // 5. Not found - show helpful error
    Err(StackError::ProjectRootNotFound(format!(
        "no service compose files found from {}\n\n\
        Please specify the location:\n\n\
        Option 1 - Pass it on the command line:\n\
          stack-cli --project-root /path/to/stack <command>\n\n\
        Option 2 - Set environment variable:\n\
          export {}=/path/to/stack\n\n\
        Option 3 - Run from the project directory:\n\
          cd /path/to/stack && stack-cli <command>",
        current_dir.display(),
        PROJECT_ROOT_ENV
    ))
    .into())
}

/// Save a discovered root so later runs skip discovery
fn remember(config: &mut AppConfig, path: &Path) {
    if let Err(e) = config.set_project_root(path.to_path_buf()) {
        debug!(error = %e, "could not save project root to config");
    }
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// `2024-01-02 10:00 (3h 5m ago)`
pub fn format_age(at: DateTime<Local>, now: DateTime<Local>) -> String {
    let elapsed = (now - at).num_seconds().max(0) as u64;
    format!("{} ({} ago)", at.format("%Y-%m-%d %H:%M"), format_duration(elapsed))
}
