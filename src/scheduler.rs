//! Event scheduler boundary: deferred self-events with acknowledged delivery.
//!
//! A step may emit events for future delivery (`and_emit_at`/`and_emit_after`).
//! The scheduler persists them and calls back into the runtime at trigger
//! time. Delivery is at-least-once: the callback hands over a
//! [`ScheduledEventNotification`] that the listener must
//! [`ack`](ScheduledEventNotification::ack) once the event is durably
//! appended (or deliberately discarded); an unacknowledged notification is
//! redelivered after a timeout.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::error::ScheduleError;
use crate::event::ScheduledEnvelope;

/// A scheduled event being delivered to the runtime.
///
/// Consuming `ack` signals durable handling. Dropping the notification
/// without acking counts as failed delivery and leads to redelivery.
pub struct ScheduledEventNotification {
    /// The scheduled event, including the captured min sequence number.
    pub envelope: ScheduledEnvelope,
    ack: Option<oneshot::Sender<()>>,
}

impl ScheduledEventNotification {
    /// Pair a delivery attempt with its acknowledgement channel.
    pub fn new(envelope: ScheduledEnvelope) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                envelope,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Acknowledge the delivery. The scheduler will not redeliver.
    ///
    /// Discarding a stale event still requires acking it; only then is the
    /// scheduler's obligation discharged.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            // The scheduler side may have timed out and stopped listening;
            // a late ack is then simply lost and the event is redelivered.
            let _ = tx.send(());
        }
    }
}

/// Receives scheduled events at their trigger time.
#[async_trait]
pub trait SchedulerListener: Send + Sync {
    /// Handle one due scheduled event.
    ///
    /// Implementations must append-or-discard and then ack; doing neither
    /// causes redelivery.
    async fn on_event_triggered(&self, notification: ScheduledEventNotification);
}

/// Persists scheduled events and delivers them when due.
///
/// External implementations back this with a durable timer store; the
/// in-process [`InMemoryScheduler`] backs it with `tokio` timers.
#[async_trait]
pub trait EventScheduler: Send + Sync {
    /// Durably record a scheduled event for future delivery.
    async fn schedule(&self, envelope: ScheduledEnvelope) -> Result<(), ScheduleError>;

    /// Register the delivery callback. At most one listener is active;
    /// registering again replaces it.
    fn register_listener(&self, listener: Arc<dyn SchedulerListener>);
}

/// Timer-based scheduler without persistence.
///
/// Scheduled events do not survive a process restart, which makes this
/// suitable for tests and for embeddings where the backlog itself is
/// in-memory anyway.
#[derive(Clone)]
pub struct InMemoryScheduler {
    listener: Arc<RwLock<Option<Arc<dyn SchedulerListener>>>>,
    ack_timeout: Duration,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryScheduler {
    /// A scheduler with a 30 second acknowledgement timeout.
    pub fn new() -> Self {
        Self::with_ack_timeout(Duration::from_secs(30))
    }

    /// A scheduler that redelivers after `ack_timeout` without an ack.
    pub fn with_ack_timeout(ack_timeout: Duration) -> Self {
        Self {
            listener: Arc::new(RwLock::new(None)),
            ack_timeout,
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn SchedulerListener>> {
        self.listener
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventScheduler for InMemoryScheduler {
    async fn schedule(&self, envelope: ScheduledEnvelope) -> Result<(), ScheduleError> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let delay = (envelope.trigger_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;

            loop {
                let listener = match scheduler.current_listener() {
                    Some(listener) => listener,
                    None => {
                        // No runtime attached yet; try again later.
                        tokio::time::sleep(scheduler.ack_timeout).await;
                        continue;
                    }
                };

                let (notification, acked) =
                    ScheduledEventNotification::new(envelope.clone());
                listener.on_event_triggered(notification).await;

                match tokio::time::timeout(scheduler.ack_timeout, acked).await {
                    Ok(Ok(())) => break,
                    // Dropped without ack: pause a full timeout before the
                    // retry, same as an ack that never came.
                    Ok(Err(_)) => {
                        tracing::warn!(
                            correlation_id = %envelope.correlation_id,
                            event_type = %envelope.event.event_type,
                            "scheduled event dropped without ack, redelivering"
                        );
                        tokio::time::sleep(scheduler.ack_timeout).await;
                    }
                    Err(_) => {
                        tracing::warn!(
                            correlation_id = %envelope.correlation_id,
                            event_type = %envelope.event.event_type,
                            "scheduled event not acknowledged, redelivering"
                        );
                    }
                }
            }
        });
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn SchedulerListener>) {
        *self
            .listener
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }
}
