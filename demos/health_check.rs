//! Health Check Example
//!
//! This example demonstrates:
//! 1. Starting a resilience context from environment settings
//! 2. Protecting a flaky dependency until its circuit opens
//! 3. Emitting events to a subscriber that fails transiently
//! 4. Printing the health snapshot a monitoring endpoint would serve
//!
//! Run with `RESILIENCE__QUEUE__BACKEND=redis RESILIENCE__QUEUE__REDIS_URL=...`
//! and `--features redis` to use Redis instead of the in-process queue.

use resilience_rs::queue::{handler_fn, DomainEvent};
use resilience_rs::{BreakerError, BreakerBuilder, ProtectOptions, Resilience, Settings};
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct ProviderError(String);

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider error: {}", self.0)
    }
}

impl Error for ProviderError {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "telemetry")]
    resilience_rs::telemetry::init_tracing();

    let resilience = Resilience::start(Settings::load()?).await?;
    println!("Queue backend: {}", resilience.queue().backend_kind());

    // Fails the first delivery of every event, then succeeds.
    let deliveries = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&deliveries);
    resilience.queue().subscribe(handler_fn("notifications", move |message| {
        let seen = Arc::clone(&seen);
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(anyhow::anyhow!("smtp timeout for {}", message.event.name));
            }
            Ok(())
        }
    }));
    resilience.recover_pending().await?;

    let config = BreakerBuilder::new("payment")
        .failure_threshold(50.0)
        .sliding_window_size(4)
        .minimum_requests(4)
        .reset_timeout(Duration::from_secs(2))
        .config()
        .clone();

    for attempt in 1..=6 {
        let options = ProtectOptions::new("payment")
            .config(config.clone())
            .fallback(|| async { Ok("deferred".to_string()) });

        let result = resilience
            .protect(options, || async move {
                if attempt <= 4 {
                    Err(ProviderError(format!("declined #{}", attempt)))
                } else {
                    Ok("charged".to_string())
                }
            })
            .await;

        match result {
            Ok(outcome) => println!("Payment attempt {}: {}", attempt, outcome),
            Err(BreakerError::Open) => println!("Payment attempt {}: circuit open", attempt),
            Err(e) => println!("Payment attempt {}: {}", attempt, e),
        }
    }

    for session in 1..=3 {
        resilience
            .queue()
            .emit(DomainEvent::new("session.booked", json!({ "sessionId": session })))
            .await?;
    }

    // Long enough for one retry round.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let snapshot = resilience.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    resilience.shutdown().await?;
    Ok(())
}
