//! Runtime assembly: ingestion, admission control, and the control surface.
//!
//! A [`ProcessManagerRuntime`] wires one process-manager type's blueprint to
//! its collaborators (instance store, command dispatcher, event scheduler,
//! correlation router) and enforces the concurrency discipline: per
//! correlation id, at most one step executor runs at a time (concurrent
//! attempts are rejected, not queued), and a global semaphore bounds how
//! many instances process simultaneously.
//!
//! Triggering is best effort. Ingestion durably appends first, then spawns
//! a processing attempt; a rejected or crashed attempt is recovered by
//! [`sweep`](ProcessManagerRuntime::sweep), which is designed to be driven
//! from a periodic poll.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use crate::blueprint::{Blueprint, ProcessManager};
use crate::command::CommandDispatcher;
use crate::error::{ControlError, StoreError, TriggerError};
use crate::event::{InternalEvent, ScheduledEnvelope};
use crate::executor::{DispatchPolicy, StepExecutor};
use crate::router::{CorrelationRouter, DeliveryMetadata, ExternalEvent};
use crate::scheduler::{EventScheduler, InMemoryScheduler, SchedulerListener, ScheduledEventNotification};
use crate::store::{AppendOutcome, InMemoryInstanceStore, InstanceRecord, InstanceStore, Page};

/// Observer of events persisted through the runtime's surfaces (ingestion
/// and scheduled delivery).
///
/// Invoked after the append is durable and before processing is triggered.
#[async_trait]
pub trait ProcessManagerListener: Send + Sync {
    /// One event was appended to an instance's backlog.
    async fn on_event_persisted(
        &self,
        process_manager: &str,
        correlation_id: &str,
        event: &InternalEvent,
    );
}

/// Outcome of ingesting one external event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was routed and appended.
    Routed {
        /// Correlation id of the instance that received the event.
        correlation_id: String,
        /// Whether the append was deduplicated (redelivery).
        duplicate: bool,
    },
    /// No routing rule applies; the event type is not subscribed to.
    Unrouted,
}

struct Inner<P: ProcessManager> {
    blueprint: Arc<Blueprint<P>>,
    context: Arc<P::Context>,
    store: Arc<dyn InstanceStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
    scheduler: Arc<dyn EventScheduler>,
    router: CorrelationRouter,
    listeners: Vec<Arc<dyn ProcessManagerListener>>,
    policy: DispatchPolicy,
    /// One lock per correlation id; `try_lock` failure means a concurrent
    /// trigger and is rejected immediately. Entries are evicted once no
    /// trigger holds them, so the map stays bounded by active work.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Global bound on concurrently processing instances.
    admission: Semaphore,
}

/// Runtime for one process-manager type. Cheap to clone.
pub struct ProcessManagerRuntime<P: ProcessManager> {
    inner: Arc<Inner<P>>,
}

impl<P: ProcessManager> Clone for ProcessManagerRuntime<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ProcessManager> ProcessManagerRuntime<P> {
    /// Start assembling a runtime around the domain context and command
    /// dispatcher. Everything else has an in-memory default.
    pub fn builder(
        context: P::Context,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> RuntimeBuilder<P> {
        RuntimeBuilder {
            context,
            dispatcher,
            store: None,
            scheduler: None,
            router: CorrelationRouter::new(),
            listeners: Vec::new(),
            policy: DispatchPolicy::default(),
            max_concurrent_triggers: 64,
        }
    }

    fn executor(&self) -> StepExecutor<P> {
        StepExecutor::new(
            Arc::clone(&self.inner.blueprint),
            Arc::clone(&self.inner.context),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.dispatcher),
            Arc::clone(&self.inner.scheduler),
            self.inner.policy.clone(),
        )
    }

    /// Ingest one external event: route, append, notify, then trigger
    /// processing best-effort in the background.
    ///
    /// Returns after the append is durable; the caller can acknowledge its
    /// delivery source at that point regardless of processing progress.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the append fails; the caller should
    /// then *not* acknowledge the event upstream, so it is redelivered.
    pub async fn ingest(
        &self,
        event: &ExternalEvent,
        metadata: &DeliveryMetadata,
    ) -> Result<IngestOutcome, StoreError> {
        let (correlation_id, draft) = match self.inner.router.route(event, metadata) {
            Some(routed) => routed,
            None => return Ok(IngestOutcome::Unrouted),
        };

        let outcome = self.inner.store.append(&correlation_id, draft).await?;
        let duplicate = match outcome {
            AppendOutcome::Appended(internal) => {
                self.notify_persisted(&correlation_id, &internal).await;
                false
            }
            AppendOutcome::Duplicate => true,
        };

        self.spawn_trigger(&correlation_id);
        Ok(IngestOutcome::Routed {
            correlation_id,
            duplicate,
        })
    }

    /// Process an instance's backlog now, subject to admission control.
    ///
    /// Returns the number of events processed.
    ///
    /// # Errors
    ///
    /// [`TriggerError::Busy`] when the global concurrency bound is
    /// exhausted, [`TriggerError::AlreadyRunning`] when this correlation id
    /// is already being processed. Both mean the backlog is untouched and a
    /// later attempt (or sweep) will pick it up.
    pub async fn process(&self, correlation_id: &str) -> Result<usize, TriggerError> {
        let _permit = self
            .inner
            .admission
            .try_acquire()
            .map_err(|_| TriggerError::Busy)?;

        let lock = {
            let mut locks = self.inner.locks.lock().await;
            Arc::clone(locks.entry(correlation_id.to_string()).or_default())
        };
        let result = {
            let _guard = lock.try_lock().map_err(|_| TriggerError::AlreadyRunning)?;
            self.executor().run(correlation_id).await
        };

        // Evict the entry unless a concurrent trigger also holds a handle
        // to it (strong count 2 = the map's Arc plus our own).
        {
            let mut locks = self.inner.locks.lock().await;
            if let Some(entry) = locks.get(correlation_id) {
                if Arc::strong_count(entry) == 2 {
                    locks.remove(correlation_id);
                }
            }
        }

        Ok(result?)
    }

    /// One recovery sweep: process every instance currently awaiting, in
    /// oldest-first order. Instances already being processed are skipped.
    ///
    /// Returns the number of events processed across all instances.
    pub async fn sweep(&self, page_size: usize) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let ids = self
                .inner
                .store
                .awaiting_processing(Page {
                    number: 0,
                    size: page_size,
                })
                .await?;
            if ids.is_empty() {
                return Ok(total);
            }

            let mut progressed = false;
            for correlation_id in ids {
                match self.process(&correlation_id).await {
                    Ok(processed) => {
                        progressed |= processed > 0;
                        total += processed;
                    }
                    Err(TriggerError::Busy) | Err(TriggerError::AlreadyRunning) => {}
                    Err(TriggerError::Store(err)) => return Err(err),
                }
            }
            // Everything awaiting was busy elsewhere; let that work finish
            // rather than spinning here.
            if !progressed {
                return Ok(total);
            }
        }
    }

    /// Manually suspend an instance.
    pub async fn suspend(&self, correlation_id: &str, reason: &str) -> Result<(), ControlError> {
        tracing::info!(
            process_manager = P::NAME,
            correlation_id,
            reason,
            "manually suspending instance"
        );
        self.inner
            .store
            .set_suspended(correlation_id, Some(reason.to_string()))
            .await?;
        Ok(())
    }

    /// Lift an instance's suspension and trigger processing.
    ///
    /// Processing resumes at the event that caused the suspension (it was
    /// never marked processed).
    pub async fn resume(&self, correlation_id: &str) -> Result<(), ControlError> {
        tracing::info!(process_manager = P::NAME, correlation_id, "resuming instance");
        self.inner.store.set_suspended(correlation_id, None).await?;
        self.spawn_trigger(correlation_id);
        Ok(())
    }

    /// Lift an instance's suspension and restart processing at
    /// `sequence_number`, skipping everything before it.
    ///
    /// The skipped events stay in the backlog for audit; they are simply
    /// never evaluated.
    ///
    /// # Errors
    ///
    /// [`ControlError::SequenceBelowWindow`] when `sequence_number` falls
    /// below the instance's current window.
    pub async fn resume_from(
        &self,
        correlation_id: &str,
        sequence_number: u64,
    ) -> Result<(), ControlError> {
        let record = self
            .inner
            .store
            .load(correlation_id)
            .await?
            .ok_or_else(|| StoreError::InstanceNotFound {
                correlation_id: correlation_id.to_string(),
            })?;

        if sequence_number == 0 || sequence_number < record.min_sequence_number {
            return Err(ControlError::SequenceBelowWindow {
                sequence: sequence_number,
                min: record.min_sequence_number,
            });
        }

        tracing::info!(
            process_manager = P::NAME,
            correlation_id,
            sequence_number,
            "resuming instance from explicit sequence number"
        );
        self.inner
            .store
            .set_cursor(correlation_id, sequence_number - 1)
            .await?;
        self.inner.store.set_suspended(correlation_id, None).await?;
        self.spawn_trigger(correlation_id);
        Ok(())
    }

    /// Inspect an instance's record.
    pub async fn instance(
        &self,
        correlation_id: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        self.inner.store.load(correlation_id).await
    }

    /// Correlation ids awaiting processing, oldest first.
    pub async fn awaiting_processing(&self, page: Page) -> Result<Vec<String>, StoreError> {
        self.inner.store.awaiting_processing(page).await
    }

    /// Delete backlog events an eden reset has left behind.
    pub async fn prune_events(&self, correlation_id: &str) -> Result<usize, StoreError> {
        self.inner.store.prune_events(correlation_id).await
    }

    /// Remove a finished instance entirely.
    pub async fn remove_instance(&self, correlation_id: &str) -> Result<(), StoreError> {
        self.inner.store.remove_instance(correlation_id).await
    }

    /// Handle one due scheduled event.
    ///
    /// Applies the staleness rule: the envelope's captured min sequence
    /// number must equal the instance's current one, otherwise the
    /// lifecycle that scheduled the event has ended and the event is
    /// discarded. A discard still counts as successful handling (the
    /// scheduler gets its ack).
    async fn deliver_scheduled(&self, envelope: &ScheduledEnvelope) -> Result<(), StoreError> {
        let current_min = self
            .inner
            .store
            .load(&envelope.correlation_id)
            .await?
            .map(|record| record.min_sequence_number);

        let stale = match current_min {
            Some(min) => min != envelope.captured_min_sequence_number,
            // Instance removed after its lifecycle finished.
            None => true,
        };
        if stale {
            tracing::info!(
                process_manager = P::NAME,
                correlation_id = %envelope.correlation_id,
                event_type = %envelope.event.event_type,
                captured_min = envelope.captured_min_sequence_number,
                "discarding scheduled event from a finished lifecycle"
            );
            return Ok(());
        }

        let outcome = self
            .inner
            .store
            .append(&envelope.correlation_id, envelope.event.clone())
            .await?;
        if let AppendOutcome::Appended(internal) = outcome {
            self.notify_persisted(&envelope.correlation_id, &internal).await;
        }
        self.spawn_trigger(&envelope.correlation_id);
        Ok(())
    }

    async fn notify_persisted(&self, correlation_id: &str, event: &InternalEvent) {
        for listener in &self.inner.listeners {
            listener
                .on_event_persisted(P::NAME, correlation_id, event)
                .await;
        }
    }

    /// Fire-and-forget processing attempt. Rejections are expected (the
    /// instance may already be running, or admission may be exhausted) and
    /// are left for the sweep.
    fn spawn_trigger(&self, correlation_id: &str) {
        let runtime = self.clone();
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            match runtime.process(&correlation_id).await {
                Ok(_) | Err(TriggerError::Busy) | Err(TriggerError::AlreadyRunning) => {}
                Err(TriggerError::Store(err)) => {
                    tracing::error!(
                        process_manager = P::NAME,
                        correlation_id = %correlation_id,
                        error = %err,
                        "background processing failed"
                    );
                }
            }
        });
    }
}

/// Bridges scheduler callbacks into the runtime.
struct SchedulerBridge<P: ProcessManager> {
    runtime: ProcessManagerRuntime<P>,
}

#[async_trait]
impl<P: ProcessManager> SchedulerListener for SchedulerBridge<P> {
    async fn on_event_triggered(&self, notification: ScheduledEventNotification) {
        match self.runtime.deliver_scheduled(&notification.envelope).await {
            Ok(()) => notification.ack(),
            Err(err) => {
                // Dropping the notification unacked makes the scheduler
                // redeliver.
                tracing::warn!(
                    process_manager = P::NAME,
                    correlation_id = %notification.envelope.correlation_id,
                    error = %err,
                    "failed to handle scheduled event"
                );
            }
        }
    }
}

/// Builder for [`ProcessManagerRuntime`].
pub struct RuntimeBuilder<P: ProcessManager> {
    context: P::Context,
    dispatcher: Arc<dyn CommandDispatcher>,
    store: Option<Arc<dyn InstanceStore>>,
    scheduler: Option<Arc<dyn EventScheduler>>,
    router: CorrelationRouter,
    listeners: Vec<Arc<dyn ProcessManagerListener>>,
    policy: DispatchPolicy,
    max_concurrent_triggers: usize,
}

impl<P: ProcessManager> RuntimeBuilder<P> {
    /// Use this instance store instead of the in-memory default.
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this event scheduler instead of the in-memory default.
    pub fn scheduler(mut self, scheduler: Arc<dyn EventScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the correlation router (the subscription surface).
    pub fn router(mut self, router: CorrelationRouter) -> Self {
        self.router = router;
        self
    }

    /// Register an observer of persisted events.
    pub fn listener(mut self, listener: Arc<dyn ProcessManagerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the command dispatch retry policy.
    pub fn dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound on instances processing concurrently (default 64).
    pub fn max_concurrent_triggers(mut self, bound: usize) -> Self {
        self.max_concurrent_triggers = bound;
        self
    }

    /// Assemble the runtime and attach it to the scheduler.
    pub fn build(self) -> ProcessManagerRuntime<P> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryInstanceStore::new()));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(InMemoryScheduler::new()));

        let runtime = ProcessManagerRuntime {
            inner: Arc::new(Inner {
                blueprint: Arc::new(P::blueprint()),
                context: Arc::new(self.context),
                store,
                dispatcher: self.dispatcher,
                scheduler: Arc::clone(&scheduler),
                router: self.router,
                listeners: self.listeners,
                policy: self.policy,
                locks: Mutex::new(HashMap::new()),
                admission: Semaphore::new(self.max_concurrent_triggers),
            }),
        };

        scheduler.register_listener(Arc::new(SchedulerBridge {
            runtime: runtime.clone(),
        }));
        runtime
    }
}
