//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use resilience_rs::prelude::*;
//!
//! let factory = CircuitBreakerFactory::new();
//! let breaker = factory.get_or_create("payment");
//! assert_eq!(breaker.current_state(), State::Closed);
//! ```

pub use crate::breaker::CircuitBreaker;
pub use crate::config::{BreakerBuilder, BreakerConfig};
pub use crate::error::{BreakerError, BreakerResult, QueueError};
pub use crate::factory::CircuitBreakerFactory;
pub use crate::health::{HealthState, ServiceHealthRegistry};
pub use crate::hook::{BreakerListener, StateChange};
pub use crate::persistence::EventPersistence;
pub use crate::queue::{handler_fn, DomainEvent, EventHandler, EventQueue, QueueAdapter, QueueMessage};
pub use crate::runtime::{with_circuit_breaker, ProtectOptions, Resilience};
pub use crate::settings::Settings;
pub use crate::state::State;
