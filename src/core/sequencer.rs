/// Orchestration sequencing
///
/// Stop sets, start/stop orders and the bounded health gate used between
/// dependent services. Owns no data; everything derives from the registry.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::docker::{ContainerEngine, EngineResult, HealthStatus};
use crate::core::registry::{Registry, Selection};
use crate::utils::constants::{DEFAULT_HEALTH_INTERVAL_SECS, DEFAULT_HEALTH_TIMEOUT_SECS};

pub struct Sequencer<'a> {
    registry: &'a Registry,
}

impl<'a> Sequencer<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Selected services plus everything their restore invalidates, transitively.
    pub fn compute_stop_set(&self, selected: &Selection) -> BTreeSet<String> {
        let mut set = selected.to_set();
        let mut pending: Vec<String> = selected.names().to_vec();
        while let Some(name) = pending.pop() {
            for invalidated in self.registry.invalidated_by(&name) {
                if set.insert(invalidated.clone()) {
                    pending.push(invalidated);
                }
            }
        }
        set
    }

    /// Dependencies before dependents, registry order among peers.
    /// Dependencies outside `set` are assumed to be running already.
    pub fn compute_start_order(&self, set: &BTreeSet<String>) -> Vec<String> {
        let mut remaining: Vec<&str> = self
            .registry
            .names()
            .filter(|n| set.contains(*n))
            .collect();
        let mut order: Vec<String> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let next = remaining.iter().position(|name| {
                self.registry
                    .dependencies_of(name)
                    .iter()
                    .all(|dep| !set.contains(dep) || order.contains(dep))
            });
            // The registry rejects cycles at construction, so a ready service always exists
            let Some(index) = next else { break };
            order.push(remaining.remove(index).to_string());
        }
        order
    }

    /// Dependents first
    pub fn compute_stop_order(&self, set: &BTreeSet<String>) -> Vec<String> {
        let mut order = self.compute_start_order(set);
        order.reverse();
        order
    }

    /// Whether any service still to be started depends on `name`
    pub fn has_pending_dependents(&self, name: &str, pending: &[String]) -> bool {
        self.registry
            .reverse_dependencies_of(name)
            .iter()
            .any(|d| pending.contains(d))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnhealthyPolicy {
    /// Start dependents anyway, with a warning
    #[default]
    Proceed,
    /// Skip every service that depends on the unhealthy one
    SkipDependents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    TimedOut(HealthStatus),
}

#[derive(Debug, Clone, Copy)]
pub struct HealthGate {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for HealthGate {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
            interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
        }
    }
}

impl HealthGate {
    /// Poll until the container is ready or the timeout elapses.
    pub async fn wait_healthy(
        &self,
        engine: &dyn ContainerEngine,
        container: &str,
    ) -> EngineResult<HealthOutcome> {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]") {
            spinner.set_style(style);
        }
        spinner.set_message(format!("Waiting for {} to become healthy", container));

        let started = Instant::now();
        let outcome = loop {
            let status = engine.inspect_health(container).await?;
            if status.is_ready() {
                break HealthOutcome::Healthy;
            }
            if started.elapsed() >= self.timeout {
                break HealthOutcome::TimedOut(status);
            }
            spinner.tick();
            tokio::time::sleep(self.interval).await;
        };

        spinner.finish_and_clear();
        Ok(outcome)
    }
}
