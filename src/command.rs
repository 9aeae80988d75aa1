//! Command envelopes and the command dispatcher boundary.
//!
//! Process-manager steps describe commands as pure values ([`CommandDraft`]);
//! the instance executor stamps deterministic ids onto them at dispatch time
//! ([`CommandEnvelope`]) and hands them to a [`CommandDispatcher`]. The
//! dispatcher is an external collaborator — this crate only specifies the
//! classified [`DispatchOutcome`] it must report back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::derive_command_id;

/// A command as described by a step, before id assignment.
///
/// The payload is a `serde_json::Value` because the process manager does not
/// know the concrete command type of the target aggregate at compile time;
/// the dispatcher deserializes it on its side of the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDraft {
    /// Command type name (e.g. `"CreateSessionBatch"`).
    pub command_type: String,
    /// JSON-serialized command payload.
    pub payload: Value,
    /// Target aggregate type name.
    pub aggregate_type: String,
    /// Target aggregate instance identifier.
    pub aggregate_id: String,
}

impl CommandDraft {
    /// Build a draft addressed to `aggregate_type`/`aggregate_id`.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }

    /// Stamp a deterministic id derived from the triggering event and this
    /// command's ordinal within its step.
    pub(crate) fn into_envelope(self, triggering_event_id: Uuid, ordinal: usize) -> CommandEnvelope {
        CommandEnvelope {
            id: derive_command_id(triggering_event_id, &self.command_type, ordinal),
            command_type: self.command_type,
            payload: self.payload,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
        }
    }
}

/// A fully-identified command ready for dispatch.
///
/// The id is deterministic (see [`derive_command_id`]): replaying the step
/// that produced this envelope regenerates the identical id, so target
/// aggregates deduplicate redelivered commands by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Deterministic command id.
    pub id: Uuid,
    /// Command type name.
    pub command_type: String,
    /// JSON-serialized command payload.
    pub payload: Value,
    /// Target aggregate type name.
    pub aggregate_type: String,
    /// Target aggregate instance identifier.
    pub aggregate_id: String,
}

/// Classified result of dispatching one command.
///
/// The instance executor applies a fixed policy per variant: rejections are
/// routed to the blueprint's command-error handlers, conflicts and transient
/// failures are retried up to a bound, and exhausted retries escalate to
/// instance suspension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The target aggregate accepted the command (or deduplicated it).
    Success,
    /// The target aggregate refused the command for domain reasons.
    Rejected {
        /// Domain error classification (e.g. `"AggregateInstanceAlreadyExists"`),
        /// matched against the blueprint's registered error handlers.
        error_kind: String,
    },
    /// Optimistic-concurrency clash on the target aggregate.
    ConcurrencyConflict,
    /// Network or storage hiccup; worth retrying with backoff.
    TransientFailure,
}

/// Sends commands to target aggregates.
///
/// # Contract
///
/// - Must classify every failure into one of the [`DispatchOutcome`]
///   variants; it must not panic or return through any other channel.
/// - Must tolerate duplicate delivery of the same command id without double
///   effect (idempotent receiver): the executor retries conflicts and
///   transient failures with the *same* deterministic id, and redelivers
///   entire steps after a crash.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Dispatch a single command and report the classified outcome.
    async fn dispatch(&self, command: &CommandEnvelope) -> DispatchOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn draft_into_envelope_derives_id_from_trigger_and_ordinal() {
        let trigger = Uuid::new_v4();
        let draft = CommandDraft::new("billing", "b-1", "CreateSessionBatch", json!({"n": 3}));

        let envelope = draft.clone().into_envelope(trigger, 0);
        assert_eq!(
            envelope.id,
            derive_command_id(trigger, "CreateSessionBatch", 0)
        );

        // Replaying the same step position regenerates the identical id.
        let replay = draft.into_envelope(trigger, 0);
        assert_eq!(envelope.id, replay.id);
    }

    #[test]
    fn same_command_type_distinct_ordinals_get_distinct_ids() {
        let trigger = Uuid::new_v4();
        let a = CommandDraft::new("billing", "b-1", "CreateSessionBatch", Value::Null)
            .into_envelope(trigger, 0);
        let b = CommandDraft::new("billing", "b-1", "CreateSessionBatch", Value::Null)
            .into_envelope(trigger, 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn envelope_serde_roundtrip() {
        let envelope = CommandDraft::new("billing", "b-1", "CreateSessionBatch", json!({"n": 3}))
            .into_envelope(Uuid::new_v4(), 2);

        let json = serde_json::to_string(&envelope).expect("serialization should succeed");
        let back: CommandEnvelope =
            serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(back.id, envelope.id);
        assert_eq!(back.command_type, envelope.command_type);
        assert_eq!(back.aggregate_type, envelope.aggregate_type);
        assert_eq!(back.aggregate_id, envelope.aggregate_id);
        assert_eq!(back.payload, envelope.payload);
    }
}
