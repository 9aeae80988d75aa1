//! Step execution: drains one instance's backlog through the blueprint.
//!
//! Each step is two-phase. Phase 1 commits the state transition, cursor
//! advance, and the step's pending effects record atomically in the
//! instance store (with the eden reset when the new state is terminal).
//! Phase 2 performs the side effects: commands go to the dispatcher with
//! deterministic ids, immediate emits re-enter the backlog, deferred emits
//! go to the scheduler with the instance's current min sequence number
//! captured. A crash or suspension between the phases leaves the effects
//! record persisted; the next run replays it with identical ids, so
//! downstream receivers dedup and nothing a committed step described is
//! lost.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;

use crate::blueprint::{
    encode_event, state_tag, Blueprint, CommandRecovery, Emit, Evaluation, ProcessManager, Step,
};
use crate::command::{CommandDispatcher, CommandEnvelope, DispatchOutcome};
use crate::error::StoreError;
use crate::event::{EventDraft, InternalEvent, ScheduledEnvelope};
use crate::scheduler::EventScheduler;
use crate::store::{InstanceRecord, InstanceStore, PendingEffects, PendingEmit, StepCommit};

/// Retry policy for phase-2 command dispatch.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Immediate retries allowed per command on optimistic-concurrency
    /// conflicts before the instance suspends.
    pub max_conflict_retries: usize,
    /// Backoff schedule for transient dispatch failures; when the schedule
    /// is exhausted the instance suspends.
    pub transient_backoff: ExponentialBuilder,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            transient_backoff: ExponentialBuilder::default()
                .with_min_delay(std::time::Duration::from_millis(100))
                .with_max_times(5),
        }
    }
}

/// Resolution of one command's dispatch under the retry policy.
enum CommandResolution {
    /// Dispatched (or rejection recovered); proceed to the next command.
    Continue,
    /// Escalate: suspend the instance with this reason.
    Suspend(String),
}

/// Drives one instance's backlog through the blueprint, step by step.
///
/// Holds no per-instance state itself; per-instance serialization is the
/// runtime's job (it never runs two executors for the same correlation id
/// concurrently).
pub(crate) struct StepExecutor<P: ProcessManager> {
    blueprint: Arc<Blueprint<P>>,
    context: Arc<P::Context>,
    store: Arc<dyn InstanceStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
    scheduler: Arc<dyn EventScheduler>,
    policy: DispatchPolicy,
}

impl<P: ProcessManager> StepExecutor<P> {
    pub(crate) fn new(
        blueprint: Arc<Blueprint<P>>,
        context: Arc<P::Context>,
        store: Arc<dyn InstanceStore>,
        dispatcher: Arc<dyn CommandDispatcher>,
        scheduler: Arc<dyn EventScheduler>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            blueprint,
            context,
            store,
            dispatcher,
            scheduler,
            policy,
        }
    }

    /// Process unhandled backlog events until the instance is drained,
    /// suspends, or leaves its window. Returns the number of events
    /// processed.
    pub(crate) async fn run(&self, correlation_id: &str) -> Result<usize, StoreError> {
        let mut processed = 0;

        loop {
            let record = match self.store.load(correlation_id).await? {
                Some(record) => record,
                None => return Ok(processed),
            };
            if record.suspended.is_some() {
                return Ok(processed);
            }

            // A crash or suspension interrupted phase 2 of the last step;
            // replay it with the same deterministic ids before touching
            // the backlog again.
            if let Some(effects) = &record.pending_effects {
                if !self.perform_effects(correlation_id, effects).await? {
                    return Ok(processed);
                }
                self.store.clear_pending_effects(correlation_id).await?;
                continue;
            }

            if !record.awaiting_processing() {
                return Ok(processed);
            }

            let event = match self.store.next_unprocessed(correlation_id).await? {
                Some(event) => event,
                None => return Ok(processed),
            };

            // `last_processed < min` means nothing of the current lifecycle
            // has been processed yet (fresh instance, or one reborn by an
            // eden reset): evaluation begins from the start state.
            let in_eden =
                record.last_processed_sequence_number < record.min_sequence_number;
            let state: P::State = match &record.state {
                Some(value) if !in_eden => serde_json::from_value(value.clone())?,
                _ => self.blueprint.start_state().clone(),
            };

            match self.blueprint.evaluate(&self.context, &state, &event)? {
                Evaluation::Suspended(suspend) => {
                    // The event stays unprocessed; it is re-evaluated on
                    // resume.
                    tracing::info!(
                        process_manager = P::NAME,
                        correlation_id,
                        sequence_number = event.sequence_number,
                        reason = %suspend.reason,
                        "handler suspended instance"
                    );
                    self.store
                        .set_suspended(correlation_id, Some(suspend.reason))
                        .await?;
                    return Ok(processed);
                }
                Evaluation::Unhandled => {
                    let tag = state_tag::<P>(&state)?;
                    tracing::debug!(
                        process_manager = P::NAME,
                        correlation_id,
                        sequence_number = event.sequence_number,
                        event_type = %event.event_type,
                        state = %tag,
                        "no handler for event in current state, skipping"
                    );
                    self.store
                        .commit(
                            correlation_id,
                            StepCommit {
                                new_state: serde_json::to_value(&state)?,
                                last_processed_sequence_number: event.sequence_number,
                                eden_reset: false,
                                effects: None,
                            },
                        )
                        .await?;
                }
                Evaluation::Step(step) => {
                    let terminal = self.blueprint.is_terminal(step.new_state());
                    let from = state_tag::<P>(&state)?;
                    let to = state_tag::<P>(step.new_state())?;
                    tracing::debug!(
                        process_manager = P::NAME,
                        correlation_id,
                        sequence_number = event.sequence_number,
                        event_type = %event.event_type,
                        from = %from,
                        to = %to,
                        terminal,
                        commands = step.commands().len(),
                        emits = step.emits().len(),
                        "committing step"
                    );

                    // Phase 1: state transition, cursor advance, and the
                    // effects record, atomically.
                    let effects = self.build_effects(&record, &event, &step, terminal)?;
                    self.store
                        .commit(
                            correlation_id,
                            StepCommit {
                                new_state: serde_json::to_value(step.new_state())?,
                                last_processed_sequence_number: event.sequence_number,
                                eden_reset: terminal,
                                effects: Some(effects.clone()),
                            },
                        )
                        .await?;

                    // Phase 2: side effects, deterministic ids throughout.
                    // On suspension the effects stay persisted for replay.
                    if !self.perform_effects(correlation_id, &effects).await? {
                        return Ok(processed + 1);
                    }
                    self.store.clear_pending_effects(correlation_id).await?;
                }
            }

            processed += 1;
        }
    }

    /// Freeze a step's side effects into their persistable form: command
    /// envelopes with final ids, encoded emits, absolute trigger times, and
    /// the captured min sequence number for scheduled envelopes.
    fn build_effects(
        &self,
        record: &InstanceRecord,
        event: &InternalEvent,
        step: &Step<P>,
        terminal: bool,
    ) -> Result<PendingEffects, StoreError> {
        let captured_min = if terminal {
            event.sequence_number + 1
        } else {
            record.min_sequence_number
        };

        let commands = step
            .commands()
            .iter()
            .enumerate()
            .map(|(ordinal, draft)| draft.clone().into_envelope(event.id, ordinal))
            .collect();

        let mut emits = Vec::with_capacity(step.emits().len());
        for emit in step.emits() {
            emits.push(match emit {
                Emit::Now(event) => {
                    let (event_type, payload) = encode_event::<P>(event)?;
                    PendingEmit::Append {
                        event_type,
                        payload,
                    }
                }
                Emit::At(event, at) => {
                    let (event_type, payload) = encode_event::<P>(event)?;
                    PendingEmit::Schedule {
                        event_type,
                        payload,
                        trigger_at: *at,
                    }
                }
                Emit::After(event, delay) => {
                    let (event_type, payload) = encode_event::<P>(event)?;
                    PendingEmit::Schedule {
                        event_type,
                        payload,
                        trigger_at: Utc::now() + *delay,
                    }
                }
            });
        }

        Ok(PendingEffects {
            triggering_event_id: event.id,
            commands,
            emits,
            captured_min_sequence_number: captured_min,
        })
    }

    /// Phase 2: dispatch the committed step's commands, then append or
    /// schedule its emits.
    ///
    /// Returns `false` when a command escalated to suspension; the effects
    /// record stays persisted so a later resume replays it, and every id is
    /// deterministic, so repeated attempts dedup downstream.
    async fn perform_effects(
        &self,
        correlation_id: &str,
        effects: &PendingEffects,
    ) -> Result<bool, StoreError> {
        for envelope in &effects.commands {
            match self.dispatch_command(correlation_id, envelope.clone()).await? {
                CommandResolution::Continue => {}
                CommandResolution::Suspend(reason) => {
                    tracing::warn!(
                        process_manager = P::NAME,
                        correlation_id,
                        reason = %reason,
                        "command dispatch escalated to suspension"
                    );
                    self.store
                        .set_suspended(correlation_id, Some(reason))
                        .await?;
                    return Ok(false);
                }
            }
        }

        for emit in &effects.emits {
            match emit {
                PendingEmit::Append {
                    event_type,
                    payload,
                } => {
                    let draft = EventDraft::derived(
                        effects.triggering_event_id,
                        event_type.clone(),
                        payload.clone(),
                    );
                    self.store.append(correlation_id, draft).await?;
                }
                PendingEmit::Schedule {
                    event_type,
                    payload,
                    trigger_at,
                } => {
                    let envelope = ScheduledEnvelope {
                        correlation_id: correlation_id.to_string(),
                        event: EventDraft::derived(
                            effects.triggering_event_id,
                            event_type.clone(),
                            payload.clone(),
                        ),
                        captured_min_sequence_number: effects.captured_min_sequence_number,
                        trigger_at: *trigger_at,
                    };
                    self.scheduler
                        .schedule(envelope)
                        .await
                        .map_err(|err| StoreError::Backend(err.to_string()))?;
                }
            }
        }
        Ok(true)
    }

    /// Dispatch one command under the retry policy.
    ///
    /// Business rejections consult the blueprint's command-error handlers;
    /// compensating events derive their ids from the rejected command's id,
    /// so recovery replays dedup like everything else.
    async fn dispatch_command(
        &self,
        correlation_id: &str,
        envelope: CommandEnvelope,
    ) -> Result<CommandResolution, StoreError> {
        let mut conflict_retries = 0;
        let mut delays = self.policy.transient_backoff.clone().build();

        loop {
            match self.dispatcher.dispatch(&envelope).await {
                DispatchOutcome::Success => return Ok(CommandResolution::Continue),
                DispatchOutcome::Rejected { error_kind } => {
                    return match self.blueprint.recover(&error_kind, &envelope) {
                        Some(CommandRecovery::Ignore) => {
                            tracing::debug!(
                                process_manager = P::NAME,
                                correlation_id,
                                command_type = %envelope.command_type,
                                error_kind = %error_kind,
                                "command rejection ignored by error handler"
                            );
                            Ok(CommandResolution::Continue)
                        }
                        Some(CommandRecovery::Emit(events)) => {
                            for event in &events {
                                let (event_type, payload) = encode_event::<P>(event)?;
                                let draft =
                                    EventDraft::derived(envelope.id, event_type, payload);
                                self.store.append(correlation_id, draft).await?;
                            }
                            Ok(CommandResolution::Continue)
                        }
                        None => Ok(CommandResolution::Suspend(format!(
                            "unhandled rejection of command {} ({})",
                            envelope.command_type, error_kind
                        ))),
                    };
                }
                DispatchOutcome::ConcurrencyConflict => {
                    conflict_retries += 1;
                    if conflict_retries > self.policy.max_conflict_retries {
                        return Ok(CommandResolution::Suspend(format!(
                            "command {} exhausted {} concurrency retries",
                            envelope.command_type, self.policy.max_conflict_retries
                        )));
                    }
                    tracing::debug!(
                        process_manager = P::NAME,
                        correlation_id,
                        command_type = %envelope.command_type,
                        attempt = conflict_retries,
                        "concurrency conflict, retrying dispatch"
                    );
                }
                DispatchOutcome::TransientFailure => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            process_manager = P::NAME,
                            correlation_id,
                            command_type = %envelope.command_type,
                            delay_ms = delay.as_millis() as u64,
                            "transient dispatch failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Ok(CommandResolution::Suspend(format!(
                            "command {} exhausted transient-failure retries",
                            envelope.command_type
                        )))
                    }
                },
            }
        }
    }
}
