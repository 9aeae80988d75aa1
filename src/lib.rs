//! Process-manager runtime: correlation-keyed sagas over event backlogs.

mod blueprint;
pub use blueprint::{
    Blueprint, BlueprintBuilder, CommandRecovery, Emit, Evaluation, ProcessManager, Step, Suspend,
};
mod command;
pub use command::{CommandDispatcher, CommandDraft, CommandEnvelope, DispatchOutcome};
mod error;
pub use error::{ControlError, ScheduleError, StoreError, TriggerError};
mod event;
pub use event::{
    derive_command_id, derive_event_id, EventDraft, InternalEvent, ScheduledEnvelope,
};
mod executor;
pub use executor::DispatchPolicy;
mod router;
pub use router::{CorrelationRouter, DeliveryMetadata, ExternalEvent, Routed};
mod runtime;
pub use runtime::{IngestOutcome, ProcessManagerListener, ProcessManagerRuntime, RuntimeBuilder};
mod scheduler;
pub use scheduler::{
    EventScheduler, InMemoryScheduler, ScheduledEventNotification, SchedulerListener,
};
mod store;
pub use store::{
    AppendOutcome, InMemoryInstanceStore, InstanceRecord, InstanceStore, Page, PendingEffects,
    PendingEmit, StepCommit,
};
