//! Internal event types and the deterministic identity scheme.
//!
//! Everything that makes at-least-once delivery safe lives here: the same
//! source event mapped to the same internal event type always derives the
//! same event id, and the same triggering event always derives the same
//! command ids, so redelivered work is deduplicated by id rather than by
//! guesswork. No I/O occurs in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Fixed namespace UUID for deterministic internal event id derivation.
///
/// Every internal event id is a UUID v5 derived from this namespace and the
/// `"{source_event_id}/{event_type}"` string. The same source event mapped
/// to the same internal type always yields the same id, regardless of which
/// process performs the mapping, so replays dedup automatically.
const EVENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5d, 0x2b, 0x91, 0x4e, 0x8a, 0x37, 0x4c, 0x1f, 0x9e, 0x02, 0x6b, 0xd4, 0x13, 0xc8, 0x7a, 0x55,
]);

/// Fixed namespace UUID for deterministic command id derivation.
const COMMAND_NAMESPACE: Uuid = Uuid::from_bytes([
    0xc7, 0x4f, 0x0d, 0xa2, 0x1e, 0x69, 0x45, 0xb3, 0x8c, 0x5a, 0x2f, 0x81, 0x69, 0x0e, 0x3d, 0x97,
]);

/// Derive a deterministic internal event id from its source event and
/// target internal event type.
///
/// Uses UUID v5 (SHA-1 based) with [`EVENT_NAMESPACE`]. Because the target
/// type participates in the derivation, a single source event may fan out
/// to internal events of *different* types with distinct ids — but mapping
/// one source event to two internal events of the same type would collide,
/// and is therefore not allowed.
///
/// # Arguments
///
/// * `source_event_id` - Id of the external or triggering internal event.
/// * `event_type` - The internal event type being produced (e.g.
///   `"ParkingSessionQueued"`).
pub fn derive_event_id(source_event_id: Uuid, event_type: &str) -> Uuid {
    let name = format!("{source_event_id}/{event_type}");
    Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes())
}

/// Derive a deterministic command id from the triggering event, the command
/// type, and the command's ordinal within its step.
///
/// The ordinal is required because a single step may legitimately send
/// multiple commands of the same type; replaying the step (e.g. after a
/// crash between commit and dispatch) regenerates identical ids, so the
/// receiving aggregate can treat the duplicates idempotently.
///
/// # Arguments
///
/// * `triggering_event_id` - Id of the internal event whose step produced
///   the command.
/// * `command_type` - The command type name.
/// * `ordinal` - Zero-based position of the command within the step.
pub fn derive_command_id(triggering_event_id: Uuid, command_type: &str, ordinal: usize) -> Uuid {
    let name = format!("{triggering_event_id}/{command_type}/{ordinal}");
    Uuid::new_v5(&COMMAND_NAMESPACE, name.as_bytes())
}

/// An internal event before the store has assigned its sequence number.
///
/// Produced by the correlation router (mapping an external event) and by
/// step execution (self-emitted events). The id is always derived via
/// [`derive_event_id`]; sequence assignment happens at append time inside
/// the instance store, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    /// Deterministic event id.
    pub id: Uuid,
    /// Internal event type tag (e.g. `"BufferingPeriodEnded"`).
    pub event_type: String,
    /// JSON payload of the internal event.
    pub payload: Value,
    /// Id of the source event this draft was derived from.
    pub source_event_id: Uuid,
}

impl EventDraft {
    /// Build a draft whose id is derived from `source_event_id` and
    /// `event_type`.
    pub fn derived(source_event_id: Uuid, event_type: impl Into<String>, payload: Value) -> Self {
        let event_type = event_type.into();
        Self {
            id: derive_event_id(source_event_id, &event_type),
            event_type,
            payload,
            source_event_id,
        }
    }
}

/// An event as it sits in an instance's backlog.
///
/// The sequence number is assigned by the instance store at append time and
/// is strictly increasing within one instance. `appended_at` supports the
/// awaiting-processing ordering (oldest unprocessed event first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalEvent {
    /// Deterministic event id (see [`derive_event_id`]).
    pub id: Uuid,
    /// Internal event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// Position within the instance's backlog, starting at 1.
    pub sequence_number: u64,
    /// Id of the source event this one was derived from.
    pub source_event_id: Uuid,
    /// When the event was appended to the backlog.
    pub appended_at: DateTime<Utc>,
}

/// A self-scheduled event awaiting future delivery.
///
/// `captured_min_sequence_number` is recorded at schedule time and compared
/// against the instance's *current* `min_sequence_number` at delivery time:
/// a mismatch means the instance has undergone an eden reset since
/// scheduling and the event must be discarded (and still acknowledged).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEnvelope {
    /// Correlation id of the target instance.
    pub correlation_id: String,
    /// The event to append on delivery.
    pub event: EventDraft,
    /// The instance's `min_sequence_number` at schedule time.
    pub captured_min_sequence_number: u64,
    /// When the scheduler should deliver the event.
    pub trigger_at: DateTime<Utc>,
}
