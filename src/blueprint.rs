//! Process-manager blueprints and pure step evaluation.
//!
//! A [`Blueprint`] is the declarative state-machine definition shared by all
//! instances of a process-manager type: a start state, a terminal-state
//! predicate, a handler table keyed by `(state tag, event type)`, and
//! command-error handlers keyed by `(command type, error kind)`. Evaluating
//! a step is pure: handlers describe a transition as a [`Step`] value
//! (new state + commands + emitted events) and never perform I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::command::{CommandDraft, CommandEnvelope};
use crate::event::InternalEvent;

/// A process-manager type: correlation-keyed state machine blueprint plus
/// the domain context its handlers run against.
///
/// The implementing type is a marker; per-instance state lives in
/// [`Self::State`] and is persisted by the instance store.
///
/// # Contract
///
/// - `State` and `Event` must be adjacently tagged serde enums
///   (`#[serde(tag = "type", content = "data")]`), the convention for all
///   domain enums in this crate. The variant name is the state tag /
///   event type used for handler lookup.
/// - [`blueprint`](ProcessManager::blueprint) must be deterministic; it is
///   called once per runtime and shared by all instances.
pub trait ProcessManager: Sized + Send + Sync + 'static {
    /// Identifies this process-manager type (e.g. `"batch-parking-sessions"`).
    const NAME: &'static str;

    /// The set of state variants an instance can be in.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The internal event protocol of this process manager.
    type Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Domain services and configuration available to handlers.
    type Context: Send + Sync + 'static;

    /// Build the blueprint for this process-manager type.
    fn blueprint() -> Blueprint<Self>;
}

/// Control signal raised by a handler instead of a transition.
///
/// Moves the instance to a suspended sub-state, halting automatic
/// processing until an operator resumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspend {
    /// Operator-facing reason, persisted on the instance record.
    pub reason: String,
}

impl Suspend {
    /// Build a suspension signal with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An event emission described by a step.
///
/// `Now` re-enters the instance's own backlog immediately (future sequence
/// number, not necessarily the next event handled); `At`/`After` go through
/// the event scheduler for future delivery.
#[derive(Debug, Clone)]
pub enum Emit<E> {
    /// Append to the instance's backlog as part of this step's effects.
    Now(E),
    /// Schedule delivery at an absolute wall-clock time.
    At(E, DateTime<Utc>),
    /// Schedule delivery after a delay, measured from step execution.
    After(E, Duration),
}

/// A transition description: new state, commands to send, events to emit.
///
/// A pure value assembled by the `goto(..).and_send(..).and_emit(..)` chain.
/// Nothing is executed while building it; the instance executor commits the
/// state change and performs the side effects afterwards.
pub struct Step<P: ProcessManager> {
    pub(crate) new_state: P::State,
    pub(crate) commands: Vec<CommandDraft>,
    pub(crate) emits: Vec<Emit<P::Event>>,
}

impl<P: ProcessManager> Step<P> {
    /// Begin a transition to `new_state`.
    ///
    /// Transitioning to the current state is legal and is the explicit
    /// no-op transition (distinct from an unhandled event).
    pub fn goto(new_state: P::State) -> Self {
        Self {
            new_state,
            commands: Vec::new(),
            emits: Vec::new(),
        }
    }

    /// Describe a command to send. Order is preserved; ordinals for
    /// deterministic command ids follow this order.
    pub fn and_send(mut self, command: CommandDraft) -> Self {
        self.commands.push(command);
        self
    }

    /// Describe an event to append to the instance's own backlog.
    pub fn and_emit(mut self, event: P::Event) -> Self {
        self.emits.push(Emit::Now(event));
        self
    }

    /// Describe a self-event scheduled for an absolute time.
    pub fn and_emit_at(mut self, event: P::Event, at: DateTime<Utc>) -> Self {
        self.emits.push(Emit::At(event, at));
        self
    }

    /// Describe a self-event scheduled after a delay.
    pub fn and_emit_after(mut self, event: P::Event, after: Duration) -> Self {
        self.emits.push(Emit::After(event, after));
        self
    }

    /// The state this step transitions to.
    pub fn new_state(&self) -> &P::State {
        &self.new_state
    }

    /// The commands this step describes, in send order.
    pub fn commands(&self) -> &[CommandDraft] {
        &self.commands
    }

    /// The event emissions this step describes, in emit order.
    pub fn emits(&self) -> &[Emit<P::Event>] {
        &self.emits
    }
}

/// Outcome of evaluating one backlog event against the blueprint.
pub enum Evaluation<P: ProcessManager> {
    /// A handler produced a transition description.
    Step(Step<P>),
    /// No handler is registered for `(state tag, event type)`; the event is
    /// ignorable for this state and the cursor advances without a state
    /// change.
    Unhandled,
    /// The handler raised [`Suspend`]; the event stays unprocessed and the
    /// instance halts until an operator resumes it.
    Suspended(Suspend),
}

/// Decision returned by a command-error handler.
pub enum CommandRecovery<E> {
    /// The rejection is acceptable; no compensating action.
    Ignore,
    /// Emit compensating events to the instance's own backlog.
    Emit(Vec<E>),
}

type Handler<P> = Arc<
    dyn Fn(
            &<P as ProcessManager>::Context,
            &<P as ProcessManager>::State,
            &<P as ProcessManager>::Event,
        ) -> Result<Step<P>, Suspend>
        + Send
        + Sync,
>;

type ErrorHandler<P> =
    Arc<dyn Fn(&CommandEnvelope) -> CommandRecovery<<P as ProcessManager>::Event> + Send + Sync>;

type TerminalPredicate<P> = Box<dyn Fn(&<P as ProcessManager>::State) -> bool + Send + Sync>;

/// Declarative state-machine definition for a process-manager type.
///
/// Stateless and shared (`Arc`) by all instances. Built via
/// [`Blueprint::builder`].
pub struct Blueprint<P: ProcessManager> {
    start: P::State,
    terminal: TerminalPredicate<P>,
    handlers: HashMap<(String, String), Handler<P>>,
    error_handlers: HashMap<(String, String), ErrorHandler<P>>,
}

impl<P: ProcessManager> Blueprint<P> {
    /// Start building a blueprint whose instances begin in `start`.
    pub fn builder(start: P::State) -> BlueprintBuilder<P> {
        BlueprintBuilder {
            start,
            terminal: Box::new(|_| false),
            handlers: HashMap::new(),
            error_handlers: HashMap::new(),
        }
    }

    /// The state a fresh instance starts in.
    pub fn start_state(&self) -> &P::State {
        &self.start
    }

    /// Whether `state` satisfies the terminal-state predicate.
    ///
    /// Committing a transition into a terminal state performs the eden
    /// reset (`min_sequence_number := last_processed + 1`).
    pub fn is_terminal(&self, state: &P::State) -> bool {
        (self.terminal)(state)
    }

    /// Evaluate one backlog event against the current state.
    ///
    /// Pure: resolves the handler by `(state tag, event type)` and invokes
    /// it, returning the transition description without executing any side
    /// effects. An event whose type decodes to no known variant, or for
    /// which no handler is registered in this state, is
    /// [`Evaluation::Unhandled`]; a handler raising [`Suspend`] yields
    /// [`Evaluation::Suspended`].
    ///
    /// # Errors
    ///
    /// Returns a serialization error when `P::State` does not follow the
    /// adjacently tagged convention.
    pub fn evaluate(
        &self,
        ctx: &P::Context,
        state: &P::State,
        event: &InternalEvent,
    ) -> serde_json::Result<Evaluation<P>> {
        let tag = state_tag::<P>(state)?;
        let key = (tag, event.event_type.clone());
        let handler = match self.handlers.get(&key) {
            Some(h) => h,
            None => return Ok(Evaluation::Unhandled),
        };

        // Unknown or malformed event payloads are skipped for forward
        // compatibility, same as an unregistered handler.
        let domain_event = match decode_event::<P>(&event.event_type, &event.payload) {
            Some(e) => e,
            None => return Ok(Evaluation::Unhandled),
        };

        Ok(match handler(ctx, state, &domain_event) {
            Ok(step) => Evaluation::Step(step),
            Err(suspend) => Evaluation::Suspended(suspend),
        })
    }

    /// Look up and invoke the command-error handler for
    /// `(command type, error kind)`.
    ///
    /// Returns `None` when no handler is registered — the executor then
    /// suspends the instance with an "unhandled command rejection" reason.
    pub fn recover(
        &self,
        error_kind: &str,
        command: &CommandEnvelope,
    ) -> Option<CommandRecovery<P::Event>> {
        self.error_handlers
            .get(&(command.command_type.clone(), error_kind.to_string()))
            .map(|handler| handler(command))
    }
}

/// Builder for [`Blueprint`], mirroring the declaration order of the
/// state-machine DSL: start state, terminal predicate, per-state event
/// handlers, command-error handlers.
pub struct BlueprintBuilder<P: ProcessManager> {
    start: P::State,
    terminal: TerminalPredicate<P>,
    handlers: HashMap<(String, String), Handler<P>>,
    error_handlers: HashMap<(String, String), ErrorHandler<P>>,
}

impl<P: ProcessManager> BlueprintBuilder<P> {
    /// Set the terminal-state predicate.
    pub fn ends_when(mut self, predicate: impl Fn(&P::State) -> bool + Send + Sync + 'static) -> Self {
        self.terminal = Box::new(predicate);
        self
    }

    /// Register the handler for `(state_tag, event_type)`.
    ///
    /// The tags are the serde variant names of `P::State` and `P::Event`.
    /// Registering the same pair twice replaces the earlier handler.
    pub fn on(
        mut self,
        state_tag: &str,
        event_type: &str,
        handler: impl Fn(&P::Context, &P::State, &P::Event) -> Result<Step<P>, Suspend>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.handlers.insert(
            (state_tag.to_string(), event_type.to_string()),
            Arc::new(handler),
        );
        self
    }

    /// Register the command-error handler for `(command_type, error_kind)`.
    ///
    /// Consulted when the command dispatcher reports a business rejection
    /// for a command of that type.
    pub fn on_command_error(
        mut self,
        command_type: &str,
        error_kind: &str,
        handler: impl Fn(&CommandEnvelope) -> CommandRecovery<P::Event> + Send + Sync + 'static,
    ) -> Self {
        self.error_handlers.insert(
            (command_type.to_string(), error_kind.to_string()),
            Arc::new(handler),
        );
        self
    }

    /// Finalize the blueprint.
    pub fn build(self) -> Blueprint<P> {
        Blueprint {
            start: self.start,
            terminal: self.terminal,
            handlers: self.handlers,
            error_handlers: self.error_handlers,
        }
    }
}

/// Extract the serde variant name of a state value.
///
/// Because of the adjacently tagged convention, serializing a state yields
/// `{"type": "VariantName", ...}`; the `"type"` field is the state tag used
/// for handler lookup. A state enum that does not follow the convention
/// (e.g. the serde attribute was forgotten) is reported as a serialization
/// error rather than a panic.
pub(crate) fn state_tag<P: ProcessManager>(state: &P::State) -> serde_json::Result<String> {
    use serde::ser::Error;

    let value = serde_json::to_value(state)?;
    value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            serde_json::Error::custom(
                "state enum must use adjacently tagged serialization \
                 (tag = \"type\", content = \"data\")",
            )
        })
}

/// Serialize a domain event into its `(event_type, payload)` parts.
///
/// The `"type"` field of the adjacently tagged serialization becomes the
/// internal event type; `"data"` (absent for fieldless variants, then
/// `null`) becomes the payload.
pub(crate) fn encode_event<P: ProcessManager>(event: &P::Event) -> serde_json::Result<(String, Value)> {
    use serde::ser::Error;

    let value = serde_json::to_value(event)?;
    let event_type = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            serde_json::Error::custom(
                "event enum must use adjacently tagged serialization \
                 (tag = \"type\", content = \"data\")",
            )
        })?;

    let payload = value
        .as_object()
        .and_then(|obj| obj.get("data"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Reconstruct a typed domain event from its type tag and payload.
///
/// Returns `None` for unknown or malformed events so callers can skip them
/// for forward compatibility.
pub(crate) fn decode_event<P: ProcessManager>(event_type: &str, payload: &Value) -> Option<P::Event> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged).ok()
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    /// States of the `Tally` fixture process manager.
    ///
    /// Uses adjacently tagged serialization (`"type"` + `"data"`), the
    /// convention for all `State` and `Event` types in this crate.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum TallyState {
        Idle,
        Counting { total: u64 },
        Done,
    }

    /// Internal event protocol of the `Tally` fixture.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum TallyEvent {
        Opened,
        Added { amount: u64 },
        Closed,
        LedgerUnavailable,
    }

    /// Handler context for the `Tally` fixture.
    pub(crate) struct TallyContext {
        /// Totals above this limit suspend the instance.
        pub limit: u64,
    }

    /// A small process manager used as a test fixture across modules:
    /// opens a ledger, accumulates amounts, closes on `Closed`.
    pub(crate) struct Tally;

    impl ProcessManager for Tally {
        const NAME: &'static str = "tally";

        type State = TallyState;
        type Event = TallyEvent;
        type Context = TallyContext;

        fn blueprint() -> Blueprint<Self> {
            Blueprint::<Self>::builder(TallyState::Idle)
                .ends_when(|s| matches!(s, TallyState::Done))
                .on("Idle", "Opened", |_ctx, _state, _event| {
                    Ok(Step::goto(TallyState::Counting { total: 0 }).and_send(
                        CommandDraft::new("ledger", "l-1", "OpenLedger", Value::Null),
                    ))
                })
                .on("Counting", "Added", |ctx, state, event| {
                    let current = match state {
                        TallyState::Counting { total } => *total,
                        _ => unreachable!("handler only registered for Counting"),
                    };
                    let amount = match event {
                        TallyEvent::Added { amount } => *amount,
                        _ => unreachable!("handler only registered for Added"),
                    };
                    if current + amount > ctx.limit {
                        return Err(Suspend::new("tally over limit"));
                    }
                    Ok(Step::goto(TallyState::Counting {
                        total: current + amount,
                    }))
                })
                .on("Counting", "Closed", |_ctx, state, _event| {
                    let total = match state {
                        TallyState::Counting { total } => *total,
                        _ => unreachable!("handler only registered for Counting"),
                    };
                    Ok(Step::goto(TallyState::Done).and_send(CommandDraft::new(
                        "ledger",
                        "l-1",
                        "CloseLedger",
                        json!({ "total": total }),
                    )))
                })
                .on_command_error("OpenLedger", "AlreadyOpen", |_cmd| CommandRecovery::Ignore)
                .on_command_error("CloseLedger", "LedgerGone", |_cmd| {
                    CommandRecovery::Emit(vec![TallyEvent::LedgerUnavailable])
                })
                .build()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{Tally, TallyContext, TallyEvent, TallyState};
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn internal(event_type: &str, payload: Value) -> InternalEvent {
        InternalEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload,
            sequence_number: 1,
            source_event_id: Uuid::new_v4(),
            appended_at: Utc::now(),
        }
    }

    fn ctx() -> TallyContext {
        TallyContext { limit: 100 }
    }

    #[test]
    fn state_tag_extracts_variant_name() {
        assert_eq!(state_tag::<Tally>(&TallyState::Idle).unwrap(), "Idle");
        assert_eq!(
            state_tag::<Tally>(&TallyState::Counting { total: 3 }).unwrap(),
            "Counting"
        );
    }

    #[test]
    fn encode_event_fieldless_variant_has_null_payload() {
        let (event_type, payload) =
            encode_event::<Tally>(&TallyEvent::Opened).expect("encode should succeed");
        assert_eq!(event_type, "Opened");
        assert!(payload.is_null());
    }

    #[test]
    fn encode_decode_event_roundtrip() {
        let (event_type, payload) =
            encode_event::<Tally>(&TallyEvent::Added { amount: 7 }).expect("encode should succeed");
        let back = decode_event::<Tally>(&event_type, &payload).expect("decode should succeed");
        assert_eq!(back, TallyEvent::Added { amount: 7 });
    }

    #[test]
    fn decode_unknown_event_type_returns_none() {
        assert!(decode_event::<Tally>("NoSuchEvent", &Value::Null).is_none());
    }

    #[test]
    fn evaluate_invokes_registered_handler() {
        let blueprint = Tally::blueprint();
        let result = blueprint
            .evaluate(&ctx(), &TallyState::Idle, &internal("Opened", Value::Null))
            .expect("evaluate should succeed");

        match result {
            Evaluation::Step(step) => {
                assert_eq!(step.new_state(), &TallyState::Counting { total: 0 });
                assert_eq!(step.commands().len(), 1);
                assert_eq!(step.commands()[0].command_type, "OpenLedger");
            }
            _ => panic!("expected a step"),
        }
    }

    #[test]
    fn evaluate_unregistered_pair_is_unhandled() {
        let blueprint = Tally::blueprint();
        // `Closed` has no handler in `Idle`.
        let result = blueprint
            .evaluate(&ctx(), &TallyState::Idle, &internal("Closed", Value::Null))
            .expect("evaluate should succeed");
        assert!(matches!(result, Evaluation::Unhandled));
    }

    #[test]
    fn evaluate_unknown_event_type_is_unhandled() {
        let blueprint = Tally::blueprint();
        let result = blueprint
            .evaluate(
                &ctx(),
                &TallyState::Idle,
                &internal("SomethingNew", json!({"x": 1})),
            )
            .expect("evaluate should succeed");
        assert!(matches!(result, Evaluation::Unhandled));
    }

    #[test]
    fn handler_can_raise_suspend() {
        let blueprint = Tally::blueprint();
        let result = blueprint
            .evaluate(
                &ctx(),
                &TallyState::Counting { total: 90 },
                &internal("Added", json!({"amount": 20})),
            )
            .expect("evaluate should succeed");
        match result {
            Evaluation::Suspended(suspend) => {
                assert_eq!(suspend, Suspend::new("tally over limit"));
            }
            _ => panic!("expected suspension"),
        }
    }

    #[test]
    fn terminal_predicate_matches_done_only() {
        let blueprint = Tally::blueprint();
        assert!(blueprint.is_terminal(&TallyState::Done));
        assert!(!blueprint.is_terminal(&TallyState::Idle));
        assert!(!blueprint.is_terminal(&TallyState::Counting { total: 1 }));
    }

    #[test]
    fn recover_invokes_registered_error_handler() {
        let blueprint = Tally::blueprint();
        let command = CommandDraft::new("ledger", "l-1", "OpenLedger", Value::Null)
            .into_envelope(Uuid::new_v4(), 0);

        match blueprint.recover("AlreadyOpen", &command) {
            Some(CommandRecovery::Ignore) => {}
            _ => panic!("expected Ignore recovery"),
        }
    }

    #[test]
    fn recover_emits_compensating_events() {
        let blueprint = Tally::blueprint();
        let command = CommandDraft::new("ledger", "l-1", "CloseLedger", Value::Null)
            .into_envelope(Uuid::new_v4(), 0);

        match blueprint.recover("LedgerGone", &command) {
            Some(CommandRecovery::Emit(events)) => {
                assert_eq!(events, vec![TallyEvent::LedgerUnavailable]);
            }
            _ => panic!("expected Emit recovery"),
        }
    }

    #[test]
    fn recover_unregistered_kind_returns_none() {
        let blueprint = Tally::blueprint();
        let command = CommandDraft::new("ledger", "l-1", "OpenLedger", Value::Null)
            .into_envelope(Uuid::new_v4(), 0);
        assert!(blueprint.recover("SomethingElse", &command).is_none());
    }

    #[test]
    fn step_chain_preserves_order() {
        let step: Step<Tally> = Step::goto(TallyState::Done)
            .and_send(CommandDraft::new("ledger", "l-1", "A", Value::Null))
            .and_send(CommandDraft::new("ledger", "l-1", "B", Value::Null))
            .and_emit(TallyEvent::Closed)
            .and_emit_after(TallyEvent::Opened, Duration::minutes(2));

        assert_eq!(step.commands()[0].command_type, "A");
        assert_eq!(step.commands()[1].command_type, "B");
        assert!(matches!(step.emits()[0], Emit::Now(TallyEvent::Closed)));
        assert!(matches!(step.emits()[1], Emit::After(TallyEvent::Opened, _)));
    }

    // Fixture whose enums forget the adjacently tagged attribute; unit
    // variants then serialize as bare strings.
    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    enum PlainState {
        Solo,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    enum PlainEvent {
        Ping,
    }

    struct Plain;

    impl ProcessManager for Plain {
        const NAME: &'static str = "plain";

        type State = PlainState;
        type Event = PlainEvent;
        type Context = ();

        fn blueprint() -> Blueprint<Self> {
            Blueprint::builder(PlainState::Solo).build()
        }
    }

    #[test]
    fn state_tag_rejects_untagged_state_enum() {
        let err = state_tag::<Plain>(&PlainState::Solo).unwrap_err();
        assert!(err.to_string().contains("adjacently tagged"));
    }

    #[test]
    fn encode_event_rejects_untagged_event_enum() {
        let err = encode_event::<Plain>(&PlainEvent::Ping).unwrap_err();
        assert!(err.to_string().contains("adjacently tagged"));
    }

    #[test]
    fn evaluate_surfaces_tagging_error_instead_of_panicking() {
        let blueprint = Plain::blueprint();
        let result = blueprint.evaluate(&(), &PlainState::Solo, &internal("Ping", Value::Null));
        assert!(result.is_err());
    }
}
