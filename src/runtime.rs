//! The owned resilience context and the call-protection entry point.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::info;

use crate::config::BreakerConfig;
use crate::error::{BreakerResult, ResilienceError};
use crate::factory::CircuitBreakerFactory;
use crate::health::{CircuitHealthListener, HealthState, HealthUpdate, ServiceHealthRegistry};
use crate::monitor::{HealthMonitor, HealthSnapshot};
use crate::persistence::{EventPersistence, InMemoryEventStore};
use crate::queue::EventQueue;
use crate::settings::Settings;

/// Deferred alternative result for a protected call.
pub type Fallback<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// How [`with_circuit_breaker`] protects one call.
pub struct ProtectOptions<T, E> {
    /// Dependency name; also the breaker name.
    pub service_name: String,
    /// Breaker settings used if the breaker does not exist yet. Defaults to
    /// the preset for the service name's category.
    pub config: Option<BreakerConfig>,
    /// Overrides the breaker's request timeout for this call.
    pub timeout: Option<Duration>,
    /// Served when the call is rejected or fails.
    pub fallback: Option<Fallback<T, E>>,
}

impl<T, E> ProtectOptions<T, E> {
    /// Options for `service_name` with every default.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            config: None,
            timeout: None,
            fallback: None,
        }
    }

    /// Sets the breaker settings.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets a per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the fallback.
    pub fn fallback<G, GFut>(mut self, fallback: G) -> Self
    where
        G: FnOnce() -> GFut + Send + 'static,
        GFut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || fallback().boxed()));
        self
    }
}

impl<T, E> fmt::Debug for ProtectOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectOptions")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Runs `operation` behind the breaker for `options.service_name`, creating
/// the breaker on first use.
pub async fn with_circuit_breaker<F, Fut, T, E>(
    factory: &CircuitBreakerFactory,
    options: ProtectOptions<T, E>,
    operation: F,
) -> BreakerResult<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + 'static,
{
    let ProtectOptions {
        service_name,
        config,
        timeout,
        fallback,
    } = options;

    let breaker = match config {
        Some(mut config) => {
            config.name = service_name;
            factory.create(config)
        }
        None => factory.get_or_create(&service_name),
    };

    let timeout = timeout.or(breaker.config().request_timeout);
    let result = breaker.call_async_with_timeout(timeout, operation).await;

    match fallback {
        Some(fallback) => breaker.recover_with(result, fallback).await,
        None => result,
    }
}

/// Owns every resilience component for one process.
///
/// Nothing here is global: tests and embedders build as many independent
/// contexts as they need.
pub struct Resilience {
    settings: Settings,
    registry: Arc<ServiceHealthRegistry>,
    factory: Arc<CircuitBreakerFactory>,
    persistence: Arc<dyn EventPersistence>,
    queue: Arc<EventQueue>,
    monitor: HealthMonitor,
}

impl Resilience {
    /// Starts with an in-memory event store and a default breaker factory.
    pub async fn start(settings: Settings) -> Result<Self, ResilienceError> {
        Self::start_with(
            settings,
            Arc::new(InMemoryEventStore::new()),
            CircuitBreakerFactory::new(),
        )
        .await
    }

    /// Starts with caller-supplied persistence and factory.
    ///
    /// Breaker transitions from `factory`, including breakers it already
    /// holds, are mirrored into the health registry. Pending events are not recovered automatically; call
    /// [`recover_pending`](Self::recover_pending) once subscribers are in place.
    pub async fn start_with(
        settings: Settings,
        persistence: Arc<dyn EventPersistence>,
        factory: CircuitBreakerFactory,
    ) -> Result<Self, ResilienceError> {
        settings.validate()?;

        let registry = Arc::new(ServiceHealthRegistry::seeded(&settings.health.services));
        factory.attach_listener(Arc::new(CircuitHealthListener::new(Arc::clone(&registry))));
        for breaker in factory.get_all() {
            let state = breaker.current_state();
            registry.apply(
                breaker.name(),
                HealthUpdate::new(HealthState::from_circuit(state)).with_circuit_state(state),
            );
        }
        let factory = Arc::new(factory);

        let queue = Arc::new(EventQueue::connect(&settings.queue, Some(Arc::clone(&persistence))).await);

        let monitor = HealthMonitor::spawn(
            Arc::clone(&registry),
            Arc::clone(&factory),
            Some(Arc::clone(&queue)),
            settings.health.snapshot_interval(),
        )
        .await;

        info!(
            backend = %queue.backend_kind(),
            services = settings.health.services.len(),
            "Resilience layer started"
        );

        Ok(Self {
            settings,
            registry,
            factory,
            persistence,
            queue,
            monitor,
        })
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Service health registry.
    pub fn registry(&self) -> &Arc<ServiceHealthRegistry> {
        &self.registry
    }

    /// Circuit breaker factory.
    pub fn factory(&self) -> &Arc<CircuitBreakerFactory> {
        &self.factory
    }

    /// Event store.
    pub fn persistence(&self) -> &Arc<dyn EventPersistence> {
        &self.persistence
    }

    /// Event queue.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// [`with_circuit_breaker`] against this context's factory.
    pub async fn protect<F, Fut, T, E>(
        &self,
        options: ProtectOptions<T, E>,
        operation: F,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        with_circuit_breaker(&self.factory, options, operation).await
    }

    /// Re-queues events persisted but never settled.
    pub async fn recover_pending(&self) -> Result<usize, ResilienceError> {
        Ok(self.queue.recover_pending(self.persistence.as_ref()).await?)
    }

    /// A fresh snapshot.
    pub async fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot::collect(&self.registry, &self.factory, Some(&*self.queue)).await
    }

    /// The monitor's most recent snapshot.
    pub fn latest_snapshot(&self) -> HealthSnapshot {
        self.monitor.latest()
    }

    /// Receiver notified on every monitor refresh.
    pub fn subscribe_health(&self) -> watch::Receiver<HealthSnapshot> {
        self.monitor.subscribe()
    }

    /// Stops the monitor, then closes the queue.
    pub async fn shutdown(&self) -> Result<(), ResilienceError> {
        self.monitor.shutdown().await;
        self.queue.close().await?;
        info!("Resilience layer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerBuilder;
    use crate::error::BreakerError;
    use crate::health::HealthState;
    use crate::state::State;
    use std::fmt;

    #[derive(Debug)]
    struct ProviderError;

    impl fmt::Display for ProviderError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("provider unavailable")
        }
    }

    impl Error for ProviderError {}

    fn strict(name: &str) -> BreakerConfig {
        BreakerBuilder::new(name)
            .sliding_window_size(4)
            .minimum_requests(2)
            .no_request_timeout()
            .config()
            .clone()
    }

    #[tokio::test]
    async fn creates_breaker_from_service_preset() {
        let factory = CircuitBreakerFactory::new();
        let value = with_circuit_breaker(&factory, ProtectOptions::new("payment-gateway"), || async {
            Ok::<_, ProviderError>(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        let breaker = factory.get("payment-gateway").unwrap();
        assert_eq!(breaker.config().failure_threshold, 30.0);
    }

    #[tokio::test]
    async fn fallback_serves_rejected_calls() {
        let factory = CircuitBreakerFactory::new();
        factory.get_or_create("email").open();

        let options = ProtectOptions::new("email").fallback(|| async { Ok("queued".to_string()) });
        let value = with_circuit_breaker(&factory, options, || async {
            Ok::<_, ProviderError>("sent".to_string())
        })
        .await
        .unwrap();
        assert_eq!(value, "queued");
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_overrides_config() {
        let factory = CircuitBreakerFactory::new();
        let options = ProtectOptions::new("search-api")
            .config(strict("ignored-name"))
            .timeout(Duration::from_millis(50));

        let result = with_circuit_breaker(&factory, options, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, ProviderError>(())
        })
        .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert!(factory.get("search-api").is_some());
        assert!(factory.get("ignored-name").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prebuilt_factory_breakers_feed_health() {
        let factory = CircuitBreakerFactory::new();
        let ledger = factory.create(strict("ledger"));
        ledger.open();

        let resilience = Resilience::start_with(
            Settings::default(),
            Arc::new(InMemoryEventStore::new()),
            factory,
        )
        .await
        .unwrap();
        assert_eq!(resilience.registry().get("ledger").unwrap().state, HealthState::Down);

        ledger.close();
        assert_eq!(
            resilience.registry().get("ledger").unwrap().state,
            HealthState::Healthy
        );
        resilience.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn context_mirrors_breakers_into_health() {
        let resilience = Resilience::start(Settings::default()).await.unwrap();
        let config = strict("payment");

        for _ in 0..config.minimum_requests {
            let _ = resilience
                .protect(ProtectOptions::new("payment").config(config.clone()), || async {
                    Err::<(), _>(ProviderError)
                })
                .await;
        }

        let breaker = resilience.factory().get("payment").unwrap();
        assert_eq!(breaker.current_state(), State::Open);
        let entry = resilience.registry().get("payment").unwrap();
        assert_eq!(entry.state, HealthState::Down);

        let snapshot = resilience.snapshot().await;
        assert_eq!(snapshot.summary.down, 1);
        assert_eq!(snapshot.open_circuits(), vec!["payment"]);
        assert!(snapshot.queue.is_some());

        resilience.shutdown().await.unwrap();
    }
}
