/// Stack service definitions and constants
///
/// Mirrors the layout of the stack's project directory: each service has its
/// own compose directory, `.env` file and persistent data.

use std::path::PathBuf;

use crate::core::registry::{
    BoundPath, ComposeContext, DumpSpec, InvalidationRule, PathKind, Persistence, Service,
    VolumeSpec,
};

/// Default archive bundle prefix (`<prefix>_backup_<timestamp>.tar.gz`)
pub const DEFAULT_ARCHIVE_PREFIX: &str = "n8n_stack";

/// Backup directory, relative to the project root
pub const DEFAULT_BACKUP_DIR: &str = "backups";

/// Image used for short-lived volume archive/extract containers
pub const DEFAULT_HELPER_IMAGE: &str = "alpine:3.20";

/// External network shared by every compose project
pub const DEFAULT_NETWORK: &str = "stack_net";

/// Timestamp format in backup directory and archive names
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// Used when two backups land in the same minute
pub const BACKUP_TIMESTAMP_FORMAT_SECONDS: &str = "%Y-%m-%d_%H-%M-%S";

pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_ENV_FILE: &str = ".env";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCK_FILE: &str = ".stack-cli.lock";

/// Literal the operator must type before a destructive restore
pub const RESTORE_CONFIRMATION: &str = "yes";

pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 2;

fn env_file(dir: &str) -> BoundPath {
    BoundPath {
        source: PathBuf::from(dir).join(DEFAULT_ENV_FILE),
        name: DEFAULT_ENV_FILE.to_string(),
        kind: PathKind::File,
    }
}

fn bound_dir(source: &str, name: &str) -> BoundPath {
    BoundPath {
        source: PathBuf::from(source),
        name: name.to_string(),
        kind: PathKind::Directory,
    }
}

fn compose(dir: &str) -> ComposeContext {
    ComposeContext {
        dir: PathBuf::from(dir),
        services: vec![],
    }
}

/// All stack services, in declaration (and default startup) order
pub fn default_services() -> Vec<Service> {
    vec![
        // Backend-as-a-service; its Postgres is what n8n stores workflows in
        Service {
            name: "supabase".to_string(),
            display_name: "Supabase".to_string(),
            compose: compose("supabase/docker"),
            containers: vec![
                "supabase-db".to_string(),
                "supabase-kong".to_string(),
                "supabase-auth".to_string(),
                "supabase-rest".to_string(),
                "supabase-storage".to_string(),
                "supabase-studio".to_string(),
            ],
            health_container: Some("supabase-db".to_string()),
            persistence: Persistence {
                bound: vec![
                    env_file("supabase/docker"),
                    bound_dir("supabase/docker/volumes/api", "api"),
                    bound_dir("supabase/docker/volumes/functions", "functions"),
                    bound_dir("supabase/docker/volumes/storage", "storage"),
                ],
                volume: Some(VolumeSpec {
                    id: "supabase_db_data".to_string(),
                    exclude: vec![],
                }),
                dump: Some(DumpSpec {
                    container: "supabase-db".to_string(),
                    user: "postgres".to_string(),
                    database: "postgres".to_string(),
                    schemas: vec!["public".to_string(), "auth".to_string(), "storage".to_string()],
                    env_file: Some(PathBuf::from("supabase/docker/.env")),
                    file_name: "supabase_dump.sql".to_string(),
                }),
            },
            depends_on: vec![],
        },
        Service {
            name: "n8n".to_string(),
            display_name: "n8n Workflow Engine".to_string(),
            compose: compose("n8n"),
            containers: vec!["n8n".to_string()],
            health_container: Some("n8n".to_string()),
            persistence: Persistence {
                bound: vec![env_file("n8n"), bound_dir("n8n/local-files", "local-files")],
                volume: Some(VolumeSpec {
                    id: "n8n_data".to_string(),
                    exclude: vec![],
                }),
                dump: None,
            },
            depends_on: vec!["supabase".to_string()],
        },
        Service {
            name: "npm".to_string(),
            display_name: "Nginx Proxy Manager".to_string(),
            compose: compose("npm"),
            containers: vec!["npm".to_string()],
            health_container: Some("npm".to_string()),
            persistence: Persistence {
                bound: vec![
                    env_file("npm"),
                    bound_dir("npm/data", "data"),
                    bound_dir("npm/letsencrypt", "letsencrypt"),
                ],
                volume: None,
                dump: None,
            },
            depends_on: vec![],
        },
        Service {
            name: "cloudflared".to_string(),
            display_name: "Cloudflare Tunnel".to_string(),
            compose: compose("cloudflared"),
            containers: vec!["cloudflared".to_string()],
            health_container: None,
            persistence: Persistence {
                bound: vec![env_file("cloudflared")],
                volume: None,
                dump: None,
            },
            depends_on: vec!["npm".to_string()],
        },
        Service {
            name: "portainer".to_string(),
            display_name: "Portainer".to_string(),
            compose: compose("portainer"),
            containers: vec!["portainer".to_string()],
            health_container: None,
            persistence: Persistence {
                bound: vec![],
                volume: Some(VolumeSpec {
                    id: "portainer_data".to_string(),
                    exclude: vec![],
                }),
                dump: None,
            },
            depends_on: vec![],
        },
    ]
}

/// Restoring the database leaves a running n8n pointed at data it no longer matches
pub fn default_invalidation_rules() -> Vec<InvalidationRule> {
    vec![InvalidationRule {
        service: "supabase".to_string(),
        invalidates: vec!["n8n".to_string()],
    }]
}
