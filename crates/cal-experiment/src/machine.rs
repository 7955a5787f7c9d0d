//! Generic asynchronous state machine.
//!
//! A machine is a set of named [`State`]s, each carrying async actions (run
//! concurrently on a [`JoinSet`]), sync actions (run in order once the async
//! ones finish) and an ordered list of guarded transitions. Exactly one state
//! is initial and at most one is idle.
//!
//! While a state runs, the machine also listens on a control channel:
//!
//! - `Abort` / `Pause` in a non-idle state cancel the state's token, abort
//!   its outstanding tasks, call [`MachineContext::interrupted`] and move to
//!   the idle state.
//! - In the idle state `Abort` is forwarded to the hook without interrupting
//!   anything and `Pause` is ignored.
//!
//! Messages are only read while actions are outstanding, so a state whose
//! actions have all finished (or that has none) always completes first.
//!
//! An action that returns `Err` (or panics) raises the error flag. Once the
//! state finishes the machine enters the built-in error state, calls the
//! error handler and parks there until shut down.

use crate::args::SharedArgs;
use crate::error::MachineError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Name reported by [`StateMachine::current_state`] once parked after a failure.
pub const ERROR_STATE: &str = "Error";

/// Default depth of the control channel.
pub const DEFAULT_CONTROL_CAPACITY: usize = 16;

/// Result of one action.
pub type ActionResult = anyhow::Result<()>;

type AsyncAction<C> = dyn Fn(Arc<C>, CancellationToken) -> BoxFuture<'static, ActionResult> + Send + Sync;
type SyncAction<C> = dyn Fn(&C) -> ActionResult + Send + Sync;
type ErrorHandler<C> = dyn Fn(&C, &MachineFault) + Send + Sync;

/// Context shared by every action of a machine.
#[async_trait]
pub trait MachineContext: Send + Sync + 'static {
    /// Dictionary consulted by conditional transitions.
    fn args(&self) -> &SharedArgs;

    /// Called before a state's actions start.
    fn state_entered(&self, _state: &str) {}

    /// Called after a control message interrupted `state` (or, for `Abort`,
    /// arrived while idle). Outstanding actions have already stopped.
    async fn interrupted(&self, _state: &str, _message: ControlMessage) {}
}

/// Out-of-band control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Stop and discard progress.
    Abort,
    /// Stop and keep progress.
    Pause,
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Pause => write!(f, "pause"),
        }
    }
}

impl FromStr for ControlMessage {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "pause" => Ok(Self::Pause),
            other => Err(MachineError::UnknownControlToken(other.to_string())),
        }
    }
}

/// Condition attached to a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Always taken.
    Always,
    /// Taken when the shared argument `key` equals `value`.
    Equals {
        /// Argument name
        key: String,
        /// Required value
        value: Value,
    },
}

impl Guard {
    /// `key == value` guard.
    pub fn when(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the guard holds for `args`.
    pub fn matches(&self, args: &SharedArgs) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { key, value } => args.matches(key, value),
        }
    }
}

/// Named, guarded edge to another state.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Transition name, used in logs.
    pub name: String,
    /// Target state.
    pub target: String,
    /// Condition.
    pub guard: Guard,
}

/// What went wrong when the machine entered its error state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineFault {
    /// State whose action failed.
    pub state: String,
    /// Failing action, when known.
    pub action: Option<String>,
    /// Error chain.
    pub message: String,
}

impl fmt::Display for MachineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Some(action) => write!(f, "{}/{}: {}", self.state, action, self.message),
            None => write!(f, "{}: {}", self.state, self.message),
        }
    }
}

/// One state: actions plus outgoing transitions.
pub struct State<C> {
    name: String,
    initial: bool,
    idle: bool,
    async_actions: Vec<(String, Arc<AsyncAction<C>>)>,
    sync_actions: Vec<(String, Arc<SyncAction<C>>)>,
    transitions: Vec<Transition>,
}

impl<C: MachineContext> State<C> {
    /// State with no actions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: false,
            idle: false,
            async_actions: Vec::new(),
            sync_actions: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Mark as the initial state.
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Mark as the idle state.
    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    /// Add an action that runs concurrently with the state's other async
    /// actions. It should return promptly once `token` is cancelled.
    pub fn with_async_action<F, Fut>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Arc<C>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let action: Arc<AsyncAction<C>> =
            Arc::new(move |ctx: Arc<C>, token: CancellationToken| -> BoxFuture<'static, ActionResult> {
                Box::pin(action(ctx, token))
            });
        self.async_actions.push((name.into(), action));
        self
    }

    /// Add an action that runs after every async action has finished.
    pub fn with_action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&C) -> ActionResult + Send + Sync + 'static,
    {
        self.sync_actions.push((name.into(), Arc::new(action)));
        self
    }

    /// State name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outgoing transitions, in evaluation order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }
}

/// Assembles a [`StateMachine`], validating its configuration.
pub struct StateMachineBuilder<C> {
    states: HashMap<String, State<C>>,
    initial: Option<String>,
    idle: Option<String>,
    error_handler: Option<Arc<ErrorHandler<C>>>,
    control_capacity: usize,
}

impl<C: MachineContext> Default for StateMachineBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MachineContext> StateMachineBuilder<C> {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            initial: None,
            idle: None,
            error_handler: None,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
        }
    }

    /// Depth of the control channel.
    pub fn control_capacity(mut self, capacity: usize) -> Self {
        self.control_capacity = capacity.max(1);
        self
    }

    /// Register a state.
    pub fn add_state(&mut self, state: State<C>) -> Result<&mut Self, MachineError> {
        if self.states.contains_key(&state.name) {
            return Err(MachineError::DuplicateState(state.name));
        }
        if state.idle {
            if let Some(existing) = &self.idle {
                return Err(MachineError::DuplicateIdle {
                    existing: existing.clone(),
                    new: state.name,
                });
            }
        }
        if state.initial {
            if let Some(existing) = &self.initial {
                return Err(MachineError::DuplicateInitial {
                    existing: existing.clone(),
                    new: state.name,
                });
            }
        }
        if state.idle {
            self.idle = Some(state.name.clone());
        }
        if state.initial {
            self.initial = Some(state.name.clone());
        }
        self.states.insert(state.name.clone(), state);
        Ok(self)
    }

    /// Add a transition; both states must already be registered.
    ///
    /// Transitions out of one state are evaluated in registration order and
    /// the first whose guard holds is taken.
    pub fn add_transition(
        &mut self,
        name: impl Into<String>,
        from: &str,
        to: &str,
        guard: Guard,
    ) -> Result<&mut Self, MachineError> {
        if !self.states.contains_key(to) {
            return Err(MachineError::UnknownState(to.to_string()));
        }
        let state = self
            .states
            .get_mut(from)
            .ok_or_else(|| MachineError::UnknownState(from.to_string()))?;
        state.transitions.push(Transition {
            name: name.into(),
            target: to.to_string(),
            guard,
        });
        Ok(self)
    }

    /// Handler called on entering the error state.
    pub fn error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&C, &MachineFault) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Finish the machine around `ctx`.
    pub fn build(self, ctx: Arc<C>) -> Result<(StateMachine<C>, MachineHandle), MachineError> {
        let initial = self.initial.ok_or(MachineError::NoInitialState)?;
        let (control_tx, control_rx) = mpsc::channel(self.control_capacity);
        let shutdown = CancellationToken::new();

        let machine = StateMachine {
            ctx,
            states: self
                .states
                .into_iter()
                .map(|(name, state)| (name, Arc::new(state)))
                .collect(),
            idle: self.idle,
            current: Position::State(initial),
            control_rx,
            shutdown: shutdown.clone(),
            error_handler: self.error_handler,
        };
        let handle = MachineHandle {
            control: control_tx,
            shutdown,
        };
        Ok((machine, handle))
    }
}

/// Cloneable handle for controlling a running machine.
#[derive(Clone, Debug)]
pub struct MachineHandle {
    control: mpsc::Sender<ControlMessage>,
    shutdown: CancellationToken,
}

impl MachineHandle {
    /// Send a control message.
    pub async fn send(&self, message: ControlMessage) -> Result<(), MachineError> {
        self.control
            .send(message)
            .await
            .map_err(|_| MachineError::Stopped)
    }

    /// Send `Abort`.
    pub async fn abort(&self) -> Result<(), MachineError> {
        self.send(ControlMessage::Abort).await
    }

    /// Send `Pause`.
    pub async fn pause(&self) -> Result<(), MachineError> {
        self.send(ControlMessage::Pause).await
    }

    /// Parse and send a textual control token (`"abort"` / `"pause"`).
    pub async fn send_token(&self, token: &str) -> Result<(), MachineError> {
        self.send(token.parse()?).await
    }

    /// Ask the machine to stop after cancelling the current state.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// What one [`StateMachine::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The state finished and a transition was taken.
    Transitioned {
        /// Finished state
        from: String,
        /// Next state
        to: String,
        /// Transition taken
        transition: String,
    },
    /// A control message interrupted the state.
    Interrupted {
        /// Interrupted state
        from: String,
        /// Idle state
        to: String,
        /// The message
        message: ControlMessage,
    },
    /// An action failed; the machine is now in the error state.
    Failed(MachineFault),
    /// Already in the error state; nothing ran.
    Parked(MachineFault),
    /// Shut down.
    Shutdown,
}

enum Position {
    State(String),
    Error(MachineFault),
}

enum Execution {
    Completed,
    Interrupted(ControlMessage),
    Shutdown,
}

/// A configured machine bound to its context.
pub struct StateMachine<C> {
    ctx: Arc<C>,
    states: HashMap<String, Arc<State<C>>>,
    idle: Option<String>,
    current: Position,
    control_rx: mpsc::Receiver<ControlMessage>,
    shutdown: CancellationToken,
    error_handler: Option<Arc<ErrorHandler<C>>>,
}

impl<C: MachineContext> StateMachine<C> {
    /// Start assembling a machine.
    pub fn builder() -> StateMachineBuilder<C> {
        StateMachineBuilder::new()
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<C> {
        &self.ctx
    }

    /// Name of the state that runs next, or [`ERROR_STATE`] once parked.
    pub fn current_state(&self) -> &str {
        match &self.current {
            Position::State(name) => name,
            Position::Error(_) => ERROR_STATE,
        }
    }

    /// The fault that parked the machine, if any.
    pub fn fault(&self) -> Option<&MachineFault> {
        match &self.current {
            Position::Error(fault) => Some(fault),
            Position::State(_) => None,
        }
    }

    /// Execute the current state and move to the next one.
    pub async fn step(&mut self) -> Result<StepOutcome, MachineError> {
        let name = match &self.current {
            Position::Error(fault) => return Ok(StepOutcome::Parked(fault.clone())),
            Position::State(name) => name.clone(),
        };
        let state = self
            .states
            .get(&name)
            .cloned()
            .ok_or_else(|| MachineError::UnknownState(name.clone()))?;
        let is_idle = self.idle.as_deref() == Some(name.as_str());

        debug!(state = %name, "Entering state");
        self.ctx.state_entered(&name);

        let token = self.shutdown.child_token();
        let mut tasks = JoinSet::new();
        for (action_name, action) in &state.async_actions {
            let action_name = action_name.clone();
            let future = action(Arc::clone(&self.ctx), token.clone());
            tasks.spawn(async move { (action_name, future.await) });
        }

        let mut failure: Option<MachineFault> = None;
        let execution = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Execution::Shutdown,
                joined = tasks.join_next() => match joined {
                    None => break Execution::Completed,
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((action, Err(e)))) => {
                        if failure.is_none() {
                            failure = Some(MachineFault {
                                state: name.clone(),
                                action: Some(action),
                                message: format!("{e:#}"),
                            });
                            token.cancel();
                        }
                    }
                    Some(Err(join_error)) => {
                        if failure.is_none() {
                            failure = Some(MachineFault {
                                state: name.clone(),
                                action: None,
                                message: format!("action task failed: {join_error}"),
                            });
                            token.cancel();
                        }
                    }
                },
                Some(message) = self.control_rx.recv() => {
                    if !is_idle {
                        break Execution::Interrupted(message);
                    }
                    self.idle_control(&name, message).await;
                }
            }
        };

        match execution {
            Execution::Shutdown => {
                token.cancel();
                tasks.shutdown().await;
                info!(state = %name, "State machine shutting down");
                return Ok(StepOutcome::Shutdown);
            }
            Execution::Interrupted(message) => {
                token.cancel();
                tasks.shutdown().await;
                let idle = self
                    .idle
                    .clone()
                    .ok_or(MachineError::NoIdleState(message))?;
                warn!(state = %name, %message, "State interrupted");
                self.ctx.interrupted(&name, message).await;
                self.current = Position::State(idle.clone());
                return Ok(StepOutcome::Interrupted {
                    from: name,
                    to: idle,
                    message,
                });
            }
            Execution::Completed => {}
        }

        if failure.is_none() {
            for (action_name, action) in &state.sync_actions {
                let message = match catch_unwind(AssertUnwindSafe(|| action(self.ctx.as_ref()))) {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(payload) => format!("action panicked: {}", panic_message(payload.as_ref())),
                };
                failure = Some(MachineFault {
                    state: name.clone(),
                    action: Some(action_name.clone()),
                    message,
                });
                break;
            }
        }

        if let Some(fault) = failure {
            error!(state = %name, action = ?fault.action, error = %fault.message, "Action failed");
            self.enter_error(fault.clone());
            return Ok(StepOutcome::Failed(fault));
        }

        let args = self.ctx.args();
        match state.transitions.iter().find(|t| t.guard.matches(args)) {
            Some(transition) => {
                debug!(
                    transition = %transition.name,
                    from = %name,
                    to = %transition.target,
                    "Transition"
                );
                self.current = Position::State(transition.target.clone());
                Ok(StepOutcome::Transitioned {
                    from: name,
                    to: transition.target.clone(),
                    transition: transition.name.clone(),
                })
            }
            None => {
                error!(state = %name, args = ?args.snapshot(), "No transition matched");
                Err(MachineError::Stuck { state: name })
            }
        }
    }

    /// Step until shut down. After a failure the machine stays parked in the
    /// error state until shutdown.
    #[instrument(skip(self), err)]
    pub async fn run(&mut self) -> Result<(), MachineError> {
        loop {
            match self.step().await? {
                StepOutcome::Shutdown => return Ok(()),
                StepOutcome::Parked(_) => {
                    self.shutdown.cancelled().await;
                    info!("State machine shut down from error state");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn idle_control(&self, state: &str, message: ControlMessage) {
        match message {
            ControlMessage::Abort => {
                info!(state, "Abort while idle");
                self.ctx.interrupted(state, message).await;
            }
            ControlMessage::Pause => debug!(state, "Pause ignored while idle"),
        }
    }

    fn enter_error(&mut self, fault: MachineFault) {
        self.ctx.state_entered(ERROR_STATE);
        match &self.error_handler {
            Some(handler) => handler(self.ctx.as_ref(), &fault),
            None => error!(fault = %fault, "State machine parked in error state"),
        }
        self.current = Position::Error(fault);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct TestContext {
        args: SharedArgs,
        log: Mutex<Vec<String>>,
        interruptions: Mutex<Vec<(String, ControlMessage)>>,
        errors: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl TestContext {
        fn record(&self, entry: &str) {
            self.log.lock().push(entry.to_string());
        }
    }

    #[async_trait]
    impl MachineContext for TestContext {
        fn args(&self) -> &SharedArgs {
            &self.args
        }

        async fn interrupted(&self, state: &str, message: ControlMessage) {
            self.interruptions.lock().push((state.to_string(), message));
        }
    }

    fn two_state_builder() -> StateMachineBuilder<TestContext> {
        let mut builder = StateMachine::builder();
        builder
            .add_state(State::new("Start").initial())
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap();
        builder
    }

    #[test]
    fn control_tokens_parse() {
        assert_eq!("abort".parse::<ControlMessage>().unwrap(), ControlMessage::Abort);
        assert_eq!(" Pause ".parse::<ControlMessage>().unwrap(), ControlMessage::Pause);
        assert_eq!(
            "stop".parse::<ControlMessage>(),
            Err(MachineError::UnknownControlToken("stop".into()))
        );
    }

    #[test]
    fn second_idle_state_is_rejected() {
        let mut builder = two_state_builder();
        let err = builder.add_state(State::new("Other").idle()).err().unwrap();
        assert_eq!(
            err,
            MachineError::DuplicateIdle {
                existing: "Idle".into(),
                new: "Other".into()
            }
        );
    }

    #[test]
    fn second_initial_state_is_rejected() {
        let mut builder = two_state_builder();
        let err = builder.add_state(State::new("Again").initial()).err().unwrap();
        assert!(matches!(err, MachineError::DuplicateInitial { .. }));
    }

    #[test]
    fn transition_to_unknown_state_is_rejected() {
        let mut builder = two_state_builder();
        let err = builder
            .add_transition("bad", "Start", "Nowhere", Guard::Always)
            .err()
            .unwrap();
        assert_eq!(err, MachineError::UnknownState("Nowhere".into()));
    }

    #[test]
    fn build_requires_initial_state() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder.add_state(State::new("Idle").idle()).unwrap();
        let err = builder.build(Arc::new(TestContext::default())).err().unwrap();
        assert_eq!(err, MachineError::NoInitialState);
    }

    #[tokio::test]
    async fn first_matching_transition_wins() {
        let mut builder = two_state_builder();
        builder
            .add_state(State::new("A"))
            .unwrap()
            .add_state(State::new("B"))
            .unwrap()
            .add_transition("to_a", "Start", "A", Guard::when("go", true))
            .unwrap()
            .add_transition("to_b", "Start", "B", Guard::Always)
            .unwrap();
        let ctx = Arc::new(TestContext::default());
        ctx.args.set("go", true);
        let (mut machine, _handle) = builder.build(ctx).unwrap();

        let outcome = machine.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Transitioned {
                from: "Start".into(),
                to: "A".into(),
                transition: "to_a".into()
            }
        );
        assert_eq!(machine.current_state(), "A");
    }

    #[tokio::test]
    async fn no_matching_transition_is_stuck() {
        let mut builder = two_state_builder();
        builder
            .add_transition("guarded", "Start", "Idle", Guard::when("ready", true))
            .unwrap();
        let (mut machine, _handle) = builder.build(Arc::new(TestContext::default())).unwrap();
        let err = machine.step().await.unwrap_err();
        assert_eq!(err, MachineError::Stuck { state: "Start".into() });
    }

    #[tokio::test]
    async fn async_actions_run_concurrently_then_sync_actions_in_order() {
        let barrier = Arc::new(Barrier::new(2));
        let (b1, b2) = (barrier.clone(), barrier);
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Start")
                    .initial()
                    .with_async_action("left", move |ctx: Arc<TestContext>, _| {
                        let barrier = b1.clone();
                        async move {
                            barrier.wait().await;
                            ctx.record("left");
                            Ok(())
                        }
                    })
                    .with_async_action("right", move |ctx: Arc<TestContext>, _| {
                        let barrier = b2.clone();
                        async move {
                            barrier.wait().await;
                            ctx.record("right");
                            Ok(())
                        }
                    })
                    .with_action("first", |ctx: &TestContext| {
                        ctx.record("first");
                        Ok(())
                    })
                    .with_action("second", |ctx: &TestContext| {
                        ctx.record("second");
                        Ok(())
                    }),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap()
            .add_transition("done", "Start", "Idle", Guard::Always)
            .unwrap();
        let ctx = Arc::new(TestContext::default());
        let (mut machine, _handle) = builder.build(ctx.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), machine.step())
            .await
            .expect("async actions deadlocked")
            .unwrap();

        let log = ctx.log.lock().clone();
        assert_eq!(log.len(), 4);
        assert_eq!(&log[2..], ["first", "second"]);
    }

    #[tokio::test]
    async fn failing_action_parks_machine_in_error_state() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Start")
                    .initial()
                    .with_async_action("explode", |_ctx: Arc<TestContext>, _| async {
                        anyhow::bail!("instrument unplugged")
                    })
                    .with_action("never", |ctx: &TestContext| {
                        ctx.record("never");
                        Ok(())
                    }),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap()
            .add_transition("done", "Start", "Idle", Guard::Always)
            .unwrap()
            .error_handler(|ctx: &TestContext, fault: &MachineFault| {
                assert_eq!(fault.action.as_deref(), Some("explode"));
                ctx.errors.fetch_add(1, Ordering::SeqCst);
            });
        let ctx = Arc::new(TestContext::default());
        let (mut machine, handle) = builder.build(ctx.clone()).unwrap();

        let outcome = machine.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed(ref f) if f.message.contains("unplugged")));
        assert_eq!(machine.current_state(), ERROR_STATE);
        assert_eq!(ctx.errors.load(Ordering::SeqCst), 1);
        assert!(ctx.log.lock().is_empty());

        assert!(matches!(machine.step().await.unwrap(), StepOutcome::Parked(_)));
        assert_eq!(ctx.errors.load(Ordering::SeqCst), 1);

        handle.shutdown();
        machine.run().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn fault_without_handler_is_logged() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Start")
                    .initial()
                    .with_action("check", |_ctx: &TestContext| anyhow::bail!("reading out of range")),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap();
        let (mut machine, _handle) = builder.build(Arc::new(TestContext::default())).unwrap();

        assert!(matches!(machine.step().await.unwrap(), StepOutcome::Failed(_)));
        assert!(logs_contain("State machine parked in error state"));
        assert!(logs_contain("reading out of range"));
    }

    #[tokio::test]
    async fn panicking_sync_action_parks_machine_in_error_state() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Start")
                    .initial()
                    .with_action("divide", |_ctx: &TestContext| -> ActionResult {
                        panic!("index out of bounds")
                    })
                    .with_action("never", |ctx: &TestContext| {
                        ctx.record("never");
                        Ok(())
                    }),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap()
            .add_transition("done", "Start", "Idle", Guard::Always)
            .unwrap()
            .error_handler(|ctx: &TestContext, _fault: &MachineFault| {
                ctx.errors.fetch_add(1, Ordering::SeqCst);
            });
        let ctx = Arc::new(TestContext::default());
        let (mut machine, _handle) = builder.build(ctx.clone()).unwrap();

        let outcome = machine.step().await.unwrap();
        match outcome {
            StepOutcome::Failed(fault) => {
                assert_eq!(fault.action.as_deref(), Some("divide"));
                assert!(fault.message.contains("index out of bounds"), "{}", fault.message);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(machine.current_state(), ERROR_STATE);
        assert_eq!(ctx.errors.load(Ordering::SeqCst), 1);
        assert!(ctx.log.lock().is_empty());
    }

    #[tokio::test]
    async fn queued_control_message_waits_for_finished_state() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Advance")
                    .initial()
                    .with_action("advance", |ctx: &TestContext| {
                        ctx.record("advanced");
                        Ok(())
                    }),
            )
            .unwrap()
            .add_state(
                State::new("Busy").with_async_action("forever", |_ctx: Arc<TestContext>, _| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap()
            .add_transition("next", "Advance", "Busy", Guard::Always)
            .unwrap();
        let ctx = Arc::new(TestContext::default());
        let (mut machine, handle) = builder.build(ctx.clone()).unwrap();

        handle.pause().await.unwrap();
        let outcome = machine.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Transitioned { ref to, .. } if to == "Busy"));
        assert_eq!(ctx.log.lock().clone(), vec!["advanced".to_string()]);

        let outcome = machine.step().await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Interrupted { ref from, message: ControlMessage::Pause, .. } if from == "Busy"
        ));
    }

    #[tokio::test]
    async fn abort_cancels_running_state_and_returns_to_idle() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Busy")
                    .initial()
                    .with_async_action("wait", |ctx: Arc<TestContext>, token: CancellationToken| async move {
                        token.cancelled().await;
                        ctx.cancelled.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                    .with_async_action("forever", |_ctx: Arc<TestContext>, _| async {
                        std::future::pending::<()>().await;
                        Ok(())
                    }),
            )
            .unwrap()
            .add_state(State::new("Idle").idle())
            .unwrap()
            .add_transition("done", "Busy", "Idle", Guard::Always)
            .unwrap();
        let ctx = Arc::new(TestContext::default());
        let (mut machine, handle) = builder.build(ctx.clone()).unwrap();

        handle.abort().await.unwrap();
        let outcome = machine.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Interrupted {
                from: "Busy".into(),
                to: "Idle".into(),
                message: ControlMessage::Abort
            }
        );
        assert_eq!(machine.current_state(), "Idle");
        assert_eq!(
            ctx.interruptions.lock().clone(),
            vec![("Busy".to_string(), ControlMessage::Abort)]
        );
    }

    #[tokio::test]
    async fn idle_state_forwards_abort_and_ignores_pause() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Idle")
                    .initial()
                    .idle()
                    .with_async_action("wait", |_ctx: Arc<TestContext>, _| async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    }),
            )
            .unwrap()
            .add_transition("again", "Idle", "Idle", Guard::Always)
            .unwrap();
        let ctx = Arc::new(TestContext::default());
        let (mut machine, handle) = builder.build(ctx.clone()).unwrap();

        handle.pause().await.unwrap();
        handle.send_token("abort").await.unwrap();
        let outcome = machine.step().await.unwrap();

        assert!(matches!(outcome, StepOutcome::Transitioned { .. }));
        assert_eq!(
            ctx.interruptions.lock().clone(),
            vec![("Idle".to_string(), ControlMessage::Abort)]
        );
    }

    #[tokio::test]
    async fn shutdown_stops_run() {
        let mut builder: StateMachineBuilder<TestContext> = StateMachine::builder();
        builder
            .add_state(
                State::new("Idle")
                    .initial()
                    .idle()
                    .with_async_action("wait", |_ctx: Arc<TestContext>, token: CancellationToken| async move {
                        token.cancelled().await;
                        Ok(())
                    }),
            )
            .unwrap();
        let (mut machine, handle) = builder.build(Arc::new(TestContext::default())).unwrap();
        let task = tokio::spawn(async move { machine.run().await });
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
