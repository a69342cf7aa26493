//! Change notifier for downstream consumers
//!
//! After every committed transaction the engine hands a [`BalanceUpdate`]
//! to this module, which delivers it to registered subscribers (cache
//! invalidation, leaderboard recompute) on a dedicated task. Delivery is
//! best-effort, at-least-once from the subscriber's point of view:
//!
//! - `notify` never blocks the commit path; a full queue drops the update
//!   and raises an alert counter instead of applying backpressure.
//! - Each subscriber is retried with exponential backoff up to a bounded
//!   attempt budget, then the update is dropped and logged.
//! - Subscriber failures are contained here and never reach the `submit`
//!   caller.

use crate::{
    config::NotifierConfig,
    metrics::Metrics,
    types::BalanceUpdate,
    Result,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Downstream consumer of committed balance changes
///
/// Implemented by the cache-invalidation and leaderboard collaborators;
/// registered at process bootstrap, never through ambient global state.
pub trait BalanceSubscriber: Send + Sync {
    /// Subscriber name, used in logs and alerts
    fn name(&self) -> &str;

    /// Deliver one update; an error triggers a bounded retry
    fn deliver(&self, update: &BalanceUpdate) -> Result<()>;
}

/// Subscriber adapter that forwards updates into a channel
///
/// Gives push-style consumers an mpsc receiver without implementing the
/// trait themselves.
pub struct ChannelSubscriber {
    name: String,
    sender: mpsc::Sender<BalanceUpdate>,
}

impl ChannelSubscriber {
    /// Create the adapter and its receiving end
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<BalanceUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

impl BalanceSubscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, update: &BalanceUpdate) -> Result<()> {
        self.sender
            .try_send(update.clone())
            .map_err(|e| crate::Error::Notify(format!("{}: {}", self.name, e)))
    }
}

/// Fire-and-forget publisher of balance changes
pub struct ChangeNotifier {
    sender: mpsc::Sender<BalanceUpdate>,
    subscribers: Arc<RwLock<Vec<Arc<dyn BalanceSubscriber>>>>,
    metrics: Metrics,
    dispatcher: JoinHandle<()>,
}

impl ChangeNotifier {
    /// Spawn the dispatcher task
    pub fn spawn(config: NotifierConfig, metrics: Metrics) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let subscribers: Arc<RwLock<Vec<Arc<dyn BalanceSubscriber>>>> =
            Arc::new(RwLock::new(Vec::new()));

        let dispatcher = tokio::spawn(run_dispatcher(
            receiver,
            subscribers.clone(),
            config,
        ));

        Self {
            sender,
            subscribers,
            metrics,
            dispatcher,
        }
    }

    /// Register a subscriber (bootstrap-time wiring)
    pub fn subscribe(&self, subscriber: Arc<dyn BalanceSubscriber>) {
        info!(subscriber = subscriber.name(), "Balance subscriber registered");
        self.subscribers.write().push(subscriber);
    }

    /// Enqueue an update without blocking the commit path
    ///
    /// A full or closed queue drops the update; the ledger commit has
    /// already succeeded and must not be unwound.
    pub fn notify(&self, update: BalanceUpdate) {
        match self.sender.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                self.metrics.record_notification_dropped();
                warn!(
                    account_id = %update.account_id,
                    "Notification queue full, balance update dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                self.metrics.record_notification_dropped();
                warn!(
                    account_id = %update.account_id,
                    "Notification dispatcher stopped, balance update dropped"
                );
            }
        }
    }

    /// Drain the queue and stop the dispatcher
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.dispatcher.await {
            error!("Notifier dispatcher panicked: {}", e);
        }
    }
}

/// Dispatcher loop: deliver every queued update to every subscriber
async fn run_dispatcher(
    mut receiver: mpsc::Receiver<BalanceUpdate>,
    subscribers: Arc<RwLock<Vec<Arc<dyn BalanceSubscriber>>>>,
    config: NotifierConfig,
) {
    while let Some(update) = receiver.recv().await {
        let targets: Vec<Arc<dyn BalanceSubscriber>> = subscribers.read().clone();

        for subscriber in targets {
            deliver_with_retry(&*subscriber, &update, &config).await;
        }
    }

    debug!("Notifier dispatcher stopped");
}

/// Deliver one update with exponential backoff, dropping after the budget
async fn deliver_with_retry(
    subscriber: &dyn BalanceSubscriber,
    update: &BalanceUpdate,
    config: &NotifierConfig,
) {
    let mut attempts = 0;
    let mut delay = Duration::from_millis(config.initial_retry_delay_ms);
    let max_delay = Duration::from_millis(config.max_retry_delay_ms);

    loop {
        attempts += 1;

        match subscriber.deliver(update) {
            Ok(()) => {
                if attempts > 1 {
                    debug!(
                        subscriber = subscriber.name(),
                        attempts, "Balance update delivered after retry"
                    );
                }
                return;
            }
            Err(e) => {
                if attempts >= config.max_retry_attempts {
                    error!(
                        subscriber = subscriber.name(),
                        account_id = %update.account_id,
                        attempts,
                        "Dropping balance update after repeated delivery failures: {}",
                        e
                    );
                    return;
                }

                warn!(
                    subscriber = subscriber.name(),
                    attempt = attempts,
                    "Balance update delivery failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;

                // Exponential backoff
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}
