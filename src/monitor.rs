//! Periodic health snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::factory::CircuitBreakerFactory;
use crate::health::{HealthSummary, ServiceHealthEntry, ServiceHealthRegistry};
use crate::metrics::BreakerStats;
use crate::queue::{effective_poll_interval, stopped, EventQueue, QueueStats};
use crate::state::State;

/// Point-in-time view of every dependency, circuit and the event queue,
/// shaped for a health-check endpoint or dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Every registered service.
    pub services: Vec<ServiceHealthEntry>,
    /// Counts across services.
    pub summary: HealthSummary,
    /// Every registered circuit, sorted by name.
    pub circuits: Vec<BreakerStats>,
    /// Absent when no queue is attached or its stats could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Collects a snapshot now.
    pub async fn collect(
        registry: &ServiceHealthRegistry,
        factory: &CircuitBreakerFactory,
        queue: Option<&EventQueue>,
    ) -> Self {
        let queue = match queue {
            Some(queue) => match queue.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Failed to read queue stats for health snapshot");
                    None
                }
            },
            None => None,
        };

        Self {
            services: registry.all(),
            summary: registry.get_health_summary(),
            circuits: factory.get_stats(),
            queue,
            taken_at: Utc::now(),
        }
    }

    /// Names of circuits not currently closed.
    pub fn open_circuits(&self) -> Vec<&str> {
        self.circuits
            .iter()
            .filter(|c| c.state != State::Closed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// True when every service is healthy and every circuit closed.
    pub fn is_healthy(&self) -> bool {
        self.summary.healthy == self.summary.total
            && self.circuits.iter().all(|c| c.state == State::Closed)
    }
}

/// Background task refreshing a [`HealthSnapshot`] on an interval.
pub struct HealthMonitor {
    snapshots: watch::Receiver<HealthSnapshot>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Takes a first snapshot, then refreshes it every `interval`.
    pub async fn spawn(
        registry: Arc<ServiceHealthRegistry>,
        factory: Arc<CircuitBreakerFactory>,
        queue: Option<Arc<EventQueue>>,
        interval: Duration,
    ) -> Self {
        let initial = HealthSnapshot::collect(&registry, &factory, queue.as_deref()).await;
        let (tx, snapshots) = watch::channel(initial);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(effective_poll_interval(interval));
            // The first tick fires immediately and the initial snapshot is already published.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        let snapshot = HealthSnapshot::collect(&registry, &factory, queue.as_deref()).await;
                        report_change(&tx.borrow(), &snapshot);
                        tx.send_replace(snapshot);
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        Self {
            snapshots,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// The most recent snapshot.
    pub fn latest(&self) -> HealthSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver notified on every refresh.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshots.clone()
    }

    /// Stops the refresh task and waits for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }
}

fn report_change(previous: &HealthSnapshot, current: &HealthSnapshot) {
    let was_healthy = previous.is_healthy();
    let is_healthy = current.is_healthy();

    if was_healthy && !is_healthy {
        warn!(
            healthy = current.summary.healthy,
            degraded = current.summary.degraded,
            down = current.summary.down,
            open_circuits = ?current.open_circuits(),
            "System health degraded"
        );
    } else if !was_healthy && is_healthy {
        info!(total = current.summary.total, "System health recovered");
    } else if current.summary.health_percentage < previous.summary.health_percentage {
        warn!(
            health_percentage = current.summary.health_percentage,
            previous = previous.summary.health_percentage,
            "System health worsened"
        );
    }
}
