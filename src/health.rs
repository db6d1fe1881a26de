//! Service health registry.
//!
//! Holds one coarse health entry per dependency. Entries are updated by
//! application code and, through [`CircuitHealthListener`], by circuit
//! breaker transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hook::{BreakerListener, StateChange};
use crate::state::State;

/// Coarse health classification of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Working normally.
    Healthy,
    /// Working with reduced capacity or while recovering.
    Degraded,
    /// Not working.
    Down,
}

impl HealthState {
    /// Health implied by a circuit breaker state.
    pub fn from_circuit(state: State) -> Self {
        match state {
            State::Closed => HealthState::Healthy,
            State::HalfOpen => HealthState::Degraded,
            State::Open => HealthState::Down,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        };
        f.write_str(label)
    }
}

/// Health record for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthEntry {
    /// Name the service is registered under.
    pub service_name: String,
    /// Current health.
    pub state: HealthState,
    /// When the entry last changed.
    pub last_updated: DateTime<Utc>,
    /// Updates that reported the service degraded or down.
    pub failure_count: u64,
    /// Updates that reported the service healthy.
    pub success_count: u64,
    /// State of the circuit protecting the service, when known.
    pub circuit_breaker_state: Option<State>,
    /// Most recent error reported for the service.
    pub last_error: Option<String>,
    /// Free-form details from the latest update.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceHealthEntry {
    fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            state: HealthState::Healthy,
            last_updated: Utc::now(),
            failure_count: 0,
            success_count: 0,
            circuit_breaker_state: None,
            last_error: None,
            metadata: HashMap::new(),
        }
    }
}

/// Aggregate counts across all registered services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    /// Registered services.
    pub total: usize,
    /// Services currently healthy.
    pub healthy: usize,
    /// Services currently degraded.
    pub degraded: usize,
    /// Services currently down.
    pub down: usize,
    /// Healthy services as a percentage of all services; 100 when empty.
    pub health_percentage: f64,
}

/// A health update for one service.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
    /// Health to record.
    pub state: HealthState,
    /// Error that caused the update.
    pub error: Option<String>,
    /// Details to merge into the entry.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Circuit state behind the update.
    pub circuit_state: Option<State>,
}

impl HealthUpdate {
    /// Update to `state` with no error or metadata.
    pub fn new(state: HealthState) -> Self {
        Self {
            state,
            error: None,
            metadata: None,
            circuit_state: None,
        }
    }

    /// Attaches the error behind the update.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attaches details to merge into the entry.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Records the circuit state behind the update.
    pub fn with_circuit_state(mut self, state: State) -> Self {
        self.circuit_state = Some(state);
        self
    }
}

/// Map from service name to its current health.
#[derive(Debug, Default)]
pub struct ServiceHealthRegistry {
    entries: RwLock<HashMap<String, ServiceHealthEntry>>,
}

impl ServiceHealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `services` registered as healthy.
    pub fn seeded<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        for service in services {
            registry.register(service.as_ref());
        }
        registry
    }

    /// Registers a service as healthy. No-op if already present.
    pub fn register(&self, service_name: &str) {
        self.entries
            .write()
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceHealthEntry::new(service_name));
    }

    /// Records a health observation, registering unknown services.
    pub fn update_service_health(
        &self,
        service_name: &str,
        state: HealthState,
        error: Option<&str>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) {
        let mut update = HealthUpdate::new(state);
        update.error = error.map(str::to_string);
        update.metadata = metadata;
        self.apply(service_name, update);
    }

    /// Applies a full update.
    pub fn apply(&self, service_name: &str, update: HealthUpdate) {
        let previous = {
            let mut entries = self.entries.write();
            let entry = entries.entry(service_name.to_string()).or_insert_with(|| {
                debug!(service = %service_name, "Auto-registered unknown service");
                ServiceHealthEntry::new(service_name)
            });

            let previous = entry.state;
            entry.state = update.state;
            entry.last_updated = Utc::now();
            match update.state {
                HealthState::Healthy => entry.success_count += 1,
                HealthState::Degraded | HealthState::Down => entry.failure_count += 1,
            }
            if update.error.is_some() {
                entry.last_error = update.error.clone();
            }
            if let Some(metadata) = update.metadata {
                entry.metadata.extend(metadata);
            }
            if update.circuit_state.is_some() {
                entry.circuit_breaker_state = update.circuit_state;
            }
            previous
        };

        if previous == update.state {
            return;
        }

        match update.state {
            HealthState::Healthy => info!(
                service = %service_name,
                from = %previous,
                "Service recovered"
            ),
            HealthState::Degraded | HealthState::Down => warn!(
                service = %service_name,
                from = %previous,
                to = %update.state,
                error = update.error.as_deref().unwrap_or(""),
                "Service health changed"
            ),
        }
    }

    /// Current entry for a service.
    pub fn get(&self, service_name: &str) -> Option<ServiceHealthEntry> {
        self.entries.read().get(service_name).cloned()
    }

    /// All entries, sorted by service name.
    pub fn all(&self) -> Vec<ServiceHealthEntry> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    /// Removes a service. Administrative use only.
    pub fn remove_service(&self, service_name: &str) -> Option<ServiceHealthEntry> {
        let removed = self.entries.write().remove(service_name);
        if removed.is_some() {
            info!(service = %service_name, "Removed service from health registry");
        }
        removed
    }

    /// Counts per state and the healthy percentage.
    pub fn get_health_summary(&self) -> HealthSummary {
        let entries = self.entries.read();
        let total = entries.len();
        let mut healthy = 0;
        let mut degraded = 0;
        let mut down = 0;

        for entry in entries.values() {
            match entry.state {
                HealthState::Healthy => healthy += 1,
                HealthState::Degraded => degraded += 1,
                HealthState::Down => down += 1,
            }
        }

        let health_percentage = if total == 0 {
            100.0
        } else {
            healthy as f64 / total as f64 * 100.0
        };

        HealthSummary {
            total,
            healthy,
            degraded,
            down,
            health_percentage,
        }
    }
}

/// Mirrors circuit breaker transitions into a [`ServiceHealthRegistry`].
///
/// Open maps to down, half-open to degraded, closed to healthy. The breaker
/// name is used as the service name.
pub struct CircuitHealthListener {
    registry: Arc<ServiceHealthRegistry>,
}

impl CircuitHealthListener {
    /// Listener writing into `registry`.
    pub fn new(registry: Arc<ServiceHealthRegistry>) -> Self {
        Self { registry }
    }
}

impl BreakerListener for CircuitHealthListener {
    fn on_state_change(&self, change: &StateChange) {
        let mut update =
            HealthUpdate::new(HealthState::from_circuit(change.to)).with_circuit_state(change.to);
        if change.to == State::Open {
            update = update.with_error(format!(
                "circuit open (failure rate {:.0}%)",
                change.failure_rate * 100.0
            ));
        }
        self.registry.apply(&change.breaker, update);
    }
}
