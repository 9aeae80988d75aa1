//! Instance store: durable per-correlation-id records and backlogs.
//!
//! Each process-manager instance is a record holding its current state
//! variant, its sequence window (`min`/`max`/`last_processed`), a
//! suspension marker, and an ordered, append-only event backlog. The store
//! is the only shared mutable resource per correlation id: sequence
//! numbers are assigned under its lock at append time, appends dedup by
//! event id, and commits apply a step's phase-1 effects atomically.
//!
//! The [`InMemoryInstanceStore`] is the built-in backend used by tests and
//! standalone embedding; durable backends implement [`InstanceStore`]
//! behind the same contract.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::command::CommandEnvelope;
use crate::error::StoreError;
use crate::event::{EventDraft, InternalEvent};

/// A page request for the awaiting-processing query.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Zero-based page number.
    pub number: usize,
    /// Maximum correlation ids per page.
    pub size: usize,
}

/// Durable per-instance bookkeeping, excluding the backlog itself.
///
/// # Invariants
///
/// - `last_processed_sequence_number <= max_sequence_number` after every
///   committed step.
/// - Awaiting processing ⇔ `last_processed < max && max >= min`.
/// - On a terminal transition, `min := last_processed + 1` (eden reset):
///   the correlation id can start a fresh logical lifecycle without
///   inheriting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Correlation id identifying this instance.
    pub correlation_id: String,
    /// Serialized current state variant; `None` means the blueprint's
    /// start state (the instance has not committed a step yet).
    pub state: Option<Value>,
    /// Lower bound of the live sequence window.
    pub min_sequence_number: u64,
    /// Highest sequence number ever appended.
    pub max_sequence_number: u64,
    /// Sequence number of the most recently processed event.
    pub last_processed_sequence_number: u64,
    /// Suspension reason, when the instance is excluded from automatic
    /// triggering.
    pub suspended: Option<String>,
    /// Phase-2 effects of the last committed step that have not been fully
    /// performed yet. Replayed before any further backlog processing.
    pub pending_effects: Option<PendingEffects>,
}

impl InstanceRecord {
    /// Whether the instance has unprocessed events inside its window.
    pub fn awaiting_processing(&self) -> bool {
        self.last_processed_sequence_number < self.max_sequence_number
            && self.max_sequence_number >= self.min_sequence_number
    }

    /// Whether the instance should be picked up by automatic triggering:
    /// awaiting processing and not suspended.
    pub fn eligible(&self) -> bool {
        self.awaiting_processing() && self.suspended.is_none()
    }

    /// Whether the instance finished a lifecycle and has seen nothing
    /// since its eden reset, making it a candidate for full cleanup.
    pub fn removable(&self) -> bool {
        self.last_processed_sequence_number < self.min_sequence_number
    }
}

/// Result of appending an event draft to an instance's backlog.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// The event was new; the store assigned it a sequence number.
    Appended(InternalEvent),
    /// An event with this id was appended before; redelivery is a no-op.
    Duplicate,
}

/// Phase-1 effects of one step, applied atomically by
/// [`InstanceStore::commit`].
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// Serialized new state variant.
    pub new_state: Value,
    /// The sequence number of the event this step consumed.
    pub last_processed_sequence_number: u64,
    /// When `true`, the new state is terminal: set
    /// `min := last_processed + 1`.
    pub eden_reset: bool,
    /// The step's phase-2 effects, persisted alongside the transition so a
    /// crash or suspension between the phases loses nothing.
    pub effects: Option<PendingEffects>,
}

/// A committed step's side effects, persisted until fully performed.
///
/// Commands carry their final deterministic envelopes; emits carry the
/// encoded event and, for deferred ones, the absolute trigger time resolved
/// at commit. Replaying the record regenerates identical ids, so downstream
/// receivers and the backlog dedup repeated attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEffects {
    /// Id of the backlog event whose step produced these effects.
    pub triggering_event_id: Uuid,
    /// Commands to dispatch, in step order, ids already stamped.
    pub commands: Vec<CommandEnvelope>,
    /// Events to append or schedule after the commands.
    pub emits: Vec<PendingEmit>,
    /// The `min_sequence_number` to capture on scheduled envelopes
    /// (the post-reset value when the committed step was terminal).
    pub captured_min_sequence_number: u64,
}

/// One emit of a committed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PendingEmit {
    /// Append to the instance's own backlog.
    Append {
        /// Internal event type tag.
        event_type: String,
        /// JSON payload.
        payload: Value,
    },
    /// Hand to the event scheduler for delivery at `trigger_at`.
    Schedule {
        /// Internal event type tag.
        event_type: String,
        /// JSON payload.
        payload: Value,
        /// Absolute delivery time.
        trigger_at: DateTime<Utc>,
    },
}

/// Storage contract for process-manager instances.
///
/// # Contract
///
/// - `append` creates the instance implicitly on the first event for an
///   unseen correlation id (window `[0, 0]`, start state).
/// - `append` deduplicates by event id within the retention window and
///   must be safe to interleave with an in-flight step: it only ever
///   appends, never rewrites committed entries.
/// - `commit` applies all phase-1 effects atomically.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Append an event draft, assigning the next sequence number.
    async fn append(
        &self,
        correlation_id: &str,
        draft: EventDraft,
    ) -> Result<AppendOutcome, StoreError>;

    /// Load an instance's record, or `None` for an unseen correlation id.
    async fn load(&self, correlation_id: &str) -> Result<Option<InstanceRecord>, StoreError>;

    /// The oldest unprocessed event inside the instance's window, if any.
    async fn next_unprocessed(
        &self,
        correlation_id: &str,
    ) -> Result<Option<InternalEvent>, StoreError>;

    /// Atomically commit a step's state transition and cursor advance,
    /// persisting its pending phase-2 effects.
    async fn commit(&self, correlation_id: &str, commit: StepCommit) -> Result<(), StoreError>;

    /// Mark the last committed step's effects as fully performed.
    async fn clear_pending_effects(&self, correlation_id: &str) -> Result<(), StoreError>;

    /// Set or clear the suspension marker.
    async fn set_suspended(
        &self,
        correlation_id: &str,
        reason: Option<String>,
    ) -> Result<(), StoreError>;

    /// Overwrite the processing cursor (operator override for
    /// `resume_from`).
    async fn set_cursor(
        &self,
        correlation_id: &str,
        last_processed_sequence_number: u64,
    ) -> Result<(), StoreError>;

    /// Correlation ids awaiting processing, ordered by the append time of
    /// their oldest unprocessed event (ties broken by correlation id).
    /// Suspended instances are excluded.
    async fn awaiting_processing(&self, page: Page) -> Result<Vec<String>, StoreError>;

    /// Physically delete backlog events below `min_sequence_number`.
    /// Returns the number of deleted events. Caller-driven cleanup.
    async fn prune_events(&self, correlation_id: &str) -> Result<usize, StoreError>;

    /// Remove an instance entirely. Fails with
    /// [`StoreError::InstanceActive`] unless the instance is
    /// [`removable`](InstanceRecord::removable).
    async fn remove_instance(&self, correlation_id: &str) -> Result<(), StoreError>;
}

/// One instance's record, backlog, and dedup memory.
struct InstanceSlot {
    record: InstanceRecord,
    /// Backlog keyed by sequence number; append-only until pruned.
    backlog: BTreeMap<u64, InternalEvent>,
    /// Event ids seen so far, in append order, for redelivery dedup.
    seen_order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl InstanceSlot {
    fn new(correlation_id: &str) -> Self {
        Self {
            record: InstanceRecord {
                correlation_id: correlation_id.to_string(),
                state: None,
                min_sequence_number: 0,
                max_sequence_number: 0,
                last_processed_sequence_number: 0,
                suspended: None,
                pending_effects: None,
            },
            backlog: BTreeMap::new(),
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Lower bound for the next event to process.
    fn cursor_floor(&self) -> u64 {
        (self.record.last_processed_sequence_number + 1).max(self.record.min_sequence_number)
    }

    fn next_unprocessed(&self) -> Option<&InternalEvent> {
        self.backlog.range(self.cursor_floor()..).next().map(|(_, e)| e)
    }
}

/// In-memory [`InstanceStore`] backend.
///
/// All mutation happens under a single `RwLock`, which provides the
/// append/commit atomicity the contract requires. `Clone` is cheap — the
/// map is `Arc`-wrapped.
#[derive(Clone)]
pub struct InMemoryInstanceStore {
    slots: Arc<RwLock<HashMap<String, InstanceSlot>>>,
    /// Maximum number of event ids remembered per instance for dedup;
    /// `None` retains all ids (the right choice without snapshotting).
    dedup_retention: Option<usize>,
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInstanceStore {
    /// Create a store that retains all event ids for dedup.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            dedup_retention: None,
        }
    }

    /// Create a store that remembers at most `retention` event ids per
    /// instance for dedup purposes.
    pub fn with_dedup_retention(retention: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            dedup_retention: Some(retention),
        }
    }

    fn with_slot<'a>(
        slots: &'a mut HashMap<String, InstanceSlot>,
        correlation_id: &str,
    ) -> Result<&'a mut InstanceSlot, StoreError> {
        slots
            .get_mut(correlation_id)
            .ok_or_else(|| StoreError::InstanceNotFound {
                correlation_id: correlation_id.to_string(),
            })
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn append(
        &self,
        correlation_id: &str,
        draft: EventDraft,
    ) -> Result<AppendOutcome, StoreError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(correlation_id.to_string())
            .or_insert_with(|| InstanceSlot::new(correlation_id));

        if slot.seen.contains(&draft.id) {
            tracing::debug!(
                correlation_id,
                event_id = %draft.id,
                event_type = %draft.event_type,
                "duplicate event append ignored"
            );
            return Ok(AppendOutcome::Duplicate);
        }

        let sequence_number = slot.record.max_sequence_number + 1;
        let event = InternalEvent {
            id: draft.id,
            event_type: draft.event_type,
            payload: draft.payload,
            sequence_number,
            source_event_id: draft.source_event_id,
            appended_at: Utc::now(),
        };

        slot.record.max_sequence_number = sequence_number;
        slot.backlog.insert(sequence_number, event.clone());
        slot.seen.insert(draft.id);
        slot.seen_order.push_back(draft.id);
        if let Some(retention) = self.dedup_retention {
            while slot.seen_order.len() > retention {
                if let Some(evicted) = slot.seen_order.pop_front() {
                    slot.seen.remove(&evicted);
                }
            }
        }

        Ok(AppendOutcome::Appended(event))
    }

    async fn load(&self, correlation_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let slots = self.slots.read().await;
        Ok(slots.get(correlation_id).map(|slot| slot.record.clone()))
    }

    async fn next_unprocessed(
        &self,
        correlation_id: &str,
    ) -> Result<Option<InternalEvent>, StoreError> {
        let slots = self.slots.read().await;
        Ok(slots
            .get(correlation_id)
            .and_then(|slot| slot.next_unprocessed().cloned()))
    }

    async fn commit(&self, correlation_id: &str, commit: StepCommit) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;

        slot.record.state = Some(commit.new_state);
        slot.record.last_processed_sequence_number = commit.last_processed_sequence_number;
        slot.record.pending_effects = commit.effects;
        if commit.eden_reset {
            slot.record.min_sequence_number = commit.last_processed_sequence_number + 1;
        }

        debug_assert!(
            slot.record.last_processed_sequence_number <= slot.record.max_sequence_number,
            "commit must not advance the cursor past max_sequence_number"
        );
        Ok(())
    }

    async fn clear_pending_effects(&self, correlation_id: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;
        slot.record.pending_effects = None;
        Ok(())
    }

    async fn set_suspended(
        &self,
        correlation_id: &str,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;
        slot.record.suspended = reason;
        Ok(())
    }

    async fn set_cursor(
        &self,
        correlation_id: &str,
        last_processed_sequence_number: u64,
    ) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;
        slot.record.last_processed_sequence_number = last_processed_sequence_number;
        Ok(())
    }

    async fn awaiting_processing(&self, page: Page) -> Result<Vec<String>, StoreError> {
        let slots = self.slots.read().await;

        // Collect (oldest unprocessed append time, correlation id) for
        // every eligible instance, then sort and page.
        let mut awaiting: Vec<(DateTime<Utc>, String)> = slots
            .values()
            .filter(|slot| slot.record.eligible())
            .filter_map(|slot| {
                slot.next_unprocessed()
                    .map(|event| (event.appended_at, slot.record.correlation_id.clone()))
            })
            .collect();

        awaiting.sort();

        Ok(awaiting
            .into_iter()
            .skip(page.number * page.size)
            .take(page.size)
            .map(|(_, id)| id)
            .collect())
    }

    async fn prune_events(&self, correlation_id: &str) -> Result<usize, StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;
        let min = slot.record.min_sequence_number;
        let before = slot.backlog.len();
        slot.backlog.retain(|&seq, _| seq >= min);
        let pruned = before - slot.backlog.len();
        if pruned > 0 {
            tracing::debug!(correlation_id, pruned, "pruned events below min sequence number");
        }
        Ok(pruned)
    }

    async fn remove_instance(&self, correlation_id: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        let slot = Self::with_slot(&mut slots, correlation_id)?;
        if !slot.record.removable() {
            return Err(StoreError::InstanceActive {
                correlation_id: correlation_id.to_string(),
            });
        }
        slots.remove(correlation_id);
        Ok(())
    }
}
