/// Service registry
///
/// Static description of every manageable service: how it persists data,
/// which compose context starts it, and which services it depends on.
/// Built once at startup and validated; nothing here performs I/O.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::core::error::{Result, StackError};

/// Compose project directory (relative to the project root) and the
/// compose services to bring up. An empty list means every service in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeContext {
    pub dir: PathBuf,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    File,
    Directory,
}

/// A host path bound into a container, stored under `name` inside a backup instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPath {
    pub source: PathBuf,
    pub name: String,
    pub kind: PathKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    /// Paths relative to the volume root left out of the archive
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
}

impl VolumeSpec {
    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self.id)
    }

    pub fn skip_marker_name(&self) -> String {
        format!("{}.skipped", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpSpec {
    pub container: String,
    #[serde(default = "default_dump_user")]
    pub user: String,
    #[serde(default = "default_dump_database")]
    pub database: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    /// .env file (relative to project root) whose POSTGRES_USER / POSTGRES_DB override the defaults
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    pub file_name: String,
}

fn default_dump_user() -> String {
    "postgres".to_string()
}

fn default_dump_database() -> String {
    "postgres".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persistence {
    #[serde(default)]
    pub bound: Vec<BoundPath>,
    #[serde(default)]
    pub volume: Option<VolumeSpec>,
    #[serde(default)]
    pub dump: Option<DumpSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub display_name: String,
    pub compose: ComposeContext,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub health_container: Option<String>,
    #[serde(default)]
    pub persistence: Persistence,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Restoring `service` makes live data of `invalidates` incompatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub service: String,
    pub invalidates: Vec<String>,
}

/// Explicit set of service names chosen for one operation, kept in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    names: Vec<String>,
}

impl Selection {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn to_set(&self) -> BTreeSet<String> {
        self.names.iter().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<Service>,
    rules: Vec<InvalidationRule>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Build and validate a registry. Any inconsistency is a startup error.
    pub fn new(services: Vec<Service>, rules: Vec<InvalidationRule>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, service) in services.iter().enumerate() {
            if service.name.trim().is_empty() {
                return Err(StackError::Registry("service with empty name".into()));
            }
            if index.insert(service.name.clone(), i).is_some() {
                return Err(StackError::Registry(format!(
                    "service '{}' declared twice",
                    service.name
                )));
            }
        }

        for service in &services {
            for dep in &service.depends_on {
                if !index.contains_key(dep) {
                    return Err(StackError::Registry(format!(
                        "service '{}' depends on unknown service '{}'",
                        service.name, dep
                    )));
                }
                if dep == &service.name {
                    return Err(StackError::Registry(format!(
                        "service '{}' depends on itself",
                        service.name
                    )));
                }
            }
        }

        for rule in &rules {
            for name in std::iter::once(&rule.service).chain(rule.invalidates.iter()) {
                if !index.contains_key(name) {
                    return Err(StackError::Registry(format!(
                        "invalidation rule references unknown service '{}'",
                        name
                    )));
                }
            }
        }

        let registry = Self {
            services,
            rules,
            index,
        };
        registry.check_acyclic()?;
        Ok(registry)
    }

    /// The built-in n8n / Supabase / proxy / tunnel / Portainer stack
    pub fn default_stack() -> Result<Self> {
        Self::new(
            crate::utils::constants::default_services(),
            crate::utils::constants::default_invalidation_rules(),
        )
    }

    pub fn list_services(&self) -> &[Service] {
        &self.services
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.get(name)
            .map(|s| s.depends_on.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reverse_dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.services
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Services whose live data breaks when `name` is restored
    pub fn invalidated_by(&self, name: &str) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|r| r.service == name)
            .flat_map(|r| r.invalidates.iter().cloned())
            .collect()
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    /// Turn operator-supplied names into a Selection, rejecting unknown names.
    pub fn validate_selection<S: AsRef<str>>(&self, names: &[S]) -> Result<Selection> {
        for name in names {
            if !self.contains(name.as_ref()) {
                return Err(StackError::UnknownService(name.as_ref().to_string()));
            }
        }
        Ok(self.selection_of(names.iter().map(|n| n.as_ref())))
    }

    /// Selection in registry order; unknown names are dropped
    pub fn selection_of<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Selection {
        let wanted: BTreeSet<&str> = names.into_iter().collect();
        Selection {
            names: self
                .services
                .iter()
                .filter(|s| wanted.contains(s.name.as_str()))
                .map(|s| s.name.clone())
                .collect(),
        }
    }

    pub fn all(&self) -> Selection {
        self.selection_of(self.names())
    }

    fn check_acyclic(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state = vec![0u8; self.services.len()];

        fn visit(reg: &Registry, i: usize, state: &mut [u8]) -> Result<()> {
            match state[i] {
                1 => {
                    return Err(StackError::Registry(format!(
                        "dependency cycle through '{}'",
                        reg.services[i].name
                    )))
                }
                2 => return Ok(()),
                _ => {}
            }
            state[i] = 1;
            for dep in &reg.services[i].depends_on {
                visit(reg, reg.index[dep], state)?;
            }
            state[i] = 2;
            Ok(())
        }

        for i in 0..self.services.len() {
            visit(self, i, &mut state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn service(name: &str, deps: &[&str]) -> Service {
        Service {
            name: name.to_string(),
            display_name: name.to_string(),
            compose: ComposeContext {
                dir: PathBuf::from(name),
                services: vec![],
            },
            containers: vec![name.to_string()],
            health_container: Some(name.to_string()),
            persistence: Persistence::default(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_default_stack_is_valid() {
        let registry = Registry::default_stack().unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["supabase", "n8n", "npm", "cloudflared", "portainer"]);
        assert!(registry.dependencies_of("n8n").contains("supabase"));
        assert!(registry.reverse_dependencies_of("supabase").contains("n8n"));
        assert!(registry.invalidated_by("supabase").contains("n8n"));
        assert!(registry.invalidated_by("n8n").is_empty());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let err = Registry::new(vec![service("a", &[]), service("a", &[])], vec![]).unwrap_err();
        assert!(matches!(err, StackError::Registry(_)));
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let err = Registry::new(vec![service("a", &["ghost"])], vec![]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_cycle() {
        let err = Registry::new(
            vec![service("a", &["c"]), service("b", &["a"]), service("c", &["b"])],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_rule_with_unknown_service() {
        let rules = vec![InvalidationRule {
            service: "a".into(),
            invalidates: vec!["zzz".into()],
        }];
        assert!(Registry::new(vec![service("a", &[])], rules).is_err());
    }

    #[test]
    fn test_selection_follows_registry_order() {
        let registry = Registry::default_stack().unwrap();
        let selection = registry.validate_selection(&["portainer", "supabase"]).unwrap();
        assert_eq!(selection.names(), &["supabase".to_string(), "portainer".to_string()]);
        assert!(matches!(
            registry.validate_selection(&["mysql"]),
            Err(StackError::UnknownService(name)) if name == "mysql"
        ));
    }
}
