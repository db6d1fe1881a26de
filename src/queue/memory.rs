//! In-process queue adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{Disposition, Dispatcher};
use super::{
    effective_poll_interval, stopped, BackendKind, DeadLetter, EventHandler, QueueAdapter,
    QueueMessage, QueueStats, Result,
};
use crate::error::QueueError;
use crate::persistence::EventPersistence;

/// Settings for [`InProcessQueue`].
#[derive(Debug, Clone)]
pub struct InProcessConfig {
    /// How often the worker takes the next due message.
    pub poll_interval: Duration,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct Shared {
    ready: Mutex<VecDeque<QueueMessage>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    dispatcher: Dispatcher,
    delayed: AtomicU64,
    in_flight: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl Shared {
    async fn process(self: &Arc<Self>, message: QueueMessage) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let disposition = self.dispatcher.deliver(&message).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        match disposition {
            Disposition::Delivered => {}
            Disposition::Retry { message, delay } => self.schedule(message, delay),
            Disposition::DeadLetter(dead) => self.dead_letters.lock().push(dead),
        }
    }

    /// Holds `message` on a timer, outside the ready queue, until it is due.
    fn schedule(self: &Arc<Self>, message: QueueMessage, delay: Duration) {
        if delay.is_zero() {
            self.ready.lock().push_back(message);
            return;
        }

        self.delayed.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    shared.ready.lock().push_back(message);
                }
                _ = stopped(&mut shutdown) => {
                    warn!(
                        message_id = %message.id,
                        attempt = message.attempt,
                        "Queue closed before delayed message was due; leaving it to persistence recovery"
                    );
                }
            }
            shared.delayed.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Queue held in process memory.
///
/// One worker task takes at most one due message per tick and fans it out to
/// every subscriber. Retries wait on timers and re-enter at the back of the
/// queue, so FIFO order only holds among messages that were never delayed.
/// Nothing survives a restart except what [`EventPersistence`] recorded.
pub struct InProcessQueue {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl InProcessQueue {
    /// Starts the queue and its worker task. Must be called inside a Tokio
    /// runtime.
    pub fn start(config: InProcessConfig, persistence: Option<Arc<dyn EventPersistence>>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            ready: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
            dispatcher: Dispatcher::new(persistence),
            delayed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            shutdown: shutdown_rx.clone(),
        });

        let worker = tokio::spawn(run_worker(
            Arc::clone(&shared),
            shutdown_rx,
            config.poll_interval,
        ));
        debug!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "In-process queue started"
        );

        Self {
            shared,
            shutdown,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        }
    }

    /// Messages due and waiting.
    pub fn backlog(&self) -> usize {
        self.shared.ready.lock().len()
    }
}

async fn run_worker(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(effective_poll_interval(poll_interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                let next = shared.ready.lock().pop_front();
                if let Some(message) = next {
                    shared.process(message).await;
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for InProcessQueue {
    fn backend(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn publish(&self, message: QueueMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        match message.delay_remaining() {
            Some(delay) => self.shared.schedule(message, delay),
            None => self.shared.ready.lock().push_back(message),
        }
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.shared.dispatcher.subscribe(handler);
    }

    /// Stops the worker, then delivers whatever is still ready before
    /// returning. Retries scheduled during the drain are not waited for.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "In-process queue worker ended abnormally");
            }
        }

        let mut drained = 0usize;
        loop {
            let next = self.shared.ready.lock().pop_front();
            match next {
                Some(message) => {
                    self.shared.process(message).await;
                    drained += 1;
                }
                None => break,
            }
        }

        info!(drained, "In-process queue closed");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let counters = &self.shared.dispatcher.counters;
        Ok(QueueStats {
            backend: BackendKind::InProcess,
            backlog: self.shared.ready.lock().len() as u64,
            delayed: self.shared.delayed.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            dead_letters: self.shared.dead_letters.lock().len() as u64,
            delivered: counters.delivered.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
        })
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.shared.dead_letters.lock().clone())
    }

    async fn replay_dead_letter(&self, message_id: Uuid) -> Result<()> {
        let dead = {
            let mut dead_letters = self.shared.dead_letters.lock();
            let position = dead_letters
                .iter()
                .position(|d| d.message.id == message_id)
                .ok_or(QueueError::DeadLetterNotFound(message_id))?;
            dead_letters.remove(position)
        };

        info!(message_id = %message_id, "Replaying dead letter");
        let mut message = dead.message;
        message.attempt = 1;
        message.scheduled_for = None;
        self.publish(message).await
    }
}
