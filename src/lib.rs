//! # resilience-rs
//!
//! Dependency protection for application services: per-dependency circuit
//! breakers, an at-least-once event queue with retries and dead-lettering,
//! durable event records, and an aggregated view of service health.
//!
//! ## What is a Circuit Breaker?
//!
//! The Circuit Breaker pattern helps prevent cascading failures by refusing
//! calls to a dependency that is likely to fail. A breaker has three states:
//!
//! - **Closed**: Normal operation. Calls pass through and their outcomes are
//!   recorded in a sliding window.
//! - **Open**: The window's failure rate crossed the threshold. Calls are
//!   rejected immediately until the reset timeout elapses.
//! - **Half-Open**: A limited number of trial calls are admitted. Enough
//!   successes close the circuit; an early failure opens it again.
//!
//! ## Basic Usage
//!
//! ```rust
//! use resilience_rs::{BreakerError, CircuitBreaker};
//! use std::error::Error;
//! use std::fmt;
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct ServiceError(String);
//!
//! impl fmt::Display for ServiceError {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         write!(f, "Service error: {}", self.0)
//!     }
//! }
//!
//! impl Error for ServiceError {}
//!
//! let breaker = CircuitBreaker::builder("payment")
//!     .failure_threshold(50.0) // Trip when half the window fails
//!     .minimum_requests(4)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! match breaker.call(|| Ok::<_, ServiceError>("charged".to_string())) {
//!     Ok(result) => println!("Call succeeded: {}", result),
//!     Err(BreakerError::Open) => println!("Circuit is open, call was prevented"),
//!     Err(BreakerError::Operation(err)) => println!("Call failed: {}", err),
//!     Err(err) => println!("Other error: {}", err),
//! }
//! ```
//!
//! ## The Resilience Context
//!
//! [`Resilience`] wires the pieces together: a breaker factory whose
//! transitions feed the health registry, an event queue backed by the
//! configured adapter, and a monitor publishing health snapshots.
//!
//! ```rust,no_run
//! use resilience_rs::queue::{handler_fn, DomainEvent};
//! use resilience_rs::{ProtectOptions, Resilience, Settings};
//!
//! # #[derive(Debug)] struct GatewayError;
//! # impl std::fmt::Display for GatewayError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("gateway") }
//! # }
//! # impl std::error::Error for GatewayError {}
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resilience = Resilience::start(Settings::load()?).await?;
//!
//!     resilience.queue().subscribe(handler_fn("receipts", |message| async move {
//!         println!("sending receipt for {}", message.event.name);
//!         Ok::<_, anyhow::Error>(())
//!     }));
//!     resilience.recover_pending().await?;
//!
//!     let charged = resilience
//!         .protect(ProtectOptions::new("payment"), || async { Ok::<_, GatewayError>(42) })
//!         .await?;
//!
//!     resilience
//!         .queue()
//!         .emit(DomainEvent::new("payment.completed", serde_json::json!({ "amount": charged })))
//!         .await?;
//!
//!     println!("{}", serde_json::to_string_pretty(&resilience.snapshot().await)?);
//!     resilience.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `std` - Standard library support (default)
//! - `redis` - Redis-backed queue adapter shared between processes
//! - `prometheus` - Prometheus metrics integration
//! - `telemetry` - `tracing-subscriber` setup helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod config;
mod error;
mod factory;
mod health;
mod hook;
mod metrics;
mod monitor;
mod persistence;
mod policy;
pub mod prelude;
pub mod queue;
mod runtime;
mod settings;
mod state;
#[cfg(feature = "telemetry")]
pub mod telemetry;
mod window;

// Re-exports
pub use breaker::CircuitBreaker;
pub use config::{BreakerBuilder, BreakerConfig, ErrorClassifier, ServiceCategory, DEFAULT_MAX_HALF_OPEN_TRIALS};
pub use error::{
    BreakerError, BreakerResult, PersistenceError, QueueError, ResilienceError, SettingsError,
};
pub use factory::CircuitBreakerFactory;
pub use health::{
    CircuitHealthListener, HealthState, HealthSummary, HealthUpdate, ServiceHealthEntry,
    ServiceHealthRegistry,
};
pub use hook::{BreakerListener, BroadcastListener, ListenerRegistry, StateChange};
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{BreakerStats, MetricSink, NullMetricSink};
pub use monitor::{HealthMonitor, HealthSnapshot};
pub use persistence::{EventPersistence, EventStatus, InMemoryEventStore, PersistedEvent};
pub use policy::{BreakerPolicy, FailureRatePolicy, TrialCounts, TrialVerdict};
pub use queue::EventQueue;
pub use runtime::{with_circuit_breaker, Fallback, ProtectOptions, Resilience};
pub use settings::{HealthSettings, QueueSettings, Settings};
pub use state::State;
pub use window::{RequestOutcome, SlidingWindow};
