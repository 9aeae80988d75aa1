//! Crate-level error types for ingestion, triggering, and instance control.

/// Error returned by instance-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No instance exists for the given correlation id.
    #[error("no process manager instance for correlation id {correlation_id:?}")]
    InstanceNotFound {
        /// The correlation id that was looked up.
        correlation_id: String,
    },

    /// A state payload or event could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The instance is still within its active window and cannot be removed.
    ///
    /// Full cleanup is only legal once `last_processed_sequence_number <
    /// min_sequence_number` (the instance finished a lifecycle and has seen
    /// nothing since the eden reset).
    #[error("instance {correlation_id:?} is still active and cannot be removed")]
    InstanceActive {
        /// The correlation id of the still-active instance.
        correlation_id: String,
    },

    /// Backend failure in an external store implementation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Error returned when a trigger attempt is not admitted or fails.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The configured bound on concurrent trigger executions is exhausted.
    ///
    /// This is backpressure, not failure: the triggering event is already
    /// durably appended and a later poll sweep will pick the instance up.
    #[error("concurrent trigger bound exhausted, trigger rejected")]
    Busy,

    /// Another trigger is already executing for this correlation id.
    ///
    /// Per-instance execution is strictly serialized; concurrent callers
    /// are rejected immediately rather than queued.
    #[error("instance is already being processed")]
    AlreadyRunning,

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by the manual control surface
/// (`suspend`/`resume`/`resume_from`).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `resume_from` was given a sequence number below the instance's
    /// current `min_sequence_number`.
    #[error("cannot resume from sequence {sequence}: below min sequence number {min}")]
    SequenceBelowWindow {
        /// The requested resume sequence number.
        sequence: u64,
        /// The instance's current `min_sequence_number`.
        min: u64,
    },
}

/// Error returned by an [`EventScheduler`](crate::scheduler::EventScheduler)
/// when persisting a scheduled event fails.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Backend failure in an external scheduler implementation.
    #[error("scheduler backend error: {0}")]
    Backend(String),
}
