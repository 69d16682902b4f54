//! Session engine: runs the turn loop across model, tools and client

use futures::StreamExt;
use std::sync::{Arc, atomic::Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use volley_ai::{
    CallError, ExecutionDomain, FinishReason, FrameStream, InvocationState, Message,
    ModelService, Role, StreamDecoder, StreamEvent, ToolResult, Usage,
};

use crate::config::EngineConfig;
use crate::context::ContextAssembler;
use crate::controller::{
    Continuation, RoundtripController, RoundtripState, SessionOutcome, TerminalState,
};
use crate::conversation::{Conversation, SessionCheckpoint};
use crate::dispatch::DispatchCoordinator;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::handle::SessionHandle;
use crate::ledger::{InvocationLedger, LedgerCheckpoint, LedgerError};
use crate::tool::{ToolDefinition, ToolRegistry};

/// Reason recorded for calls left open by an interrupted turn
const INTERRUPTED: &str = "interrupted before completion";

/// State of the turn whose ledger is live
struct LiveTurn {
    /// Model turn number within the run; 0 for a turn restored by `resume`
    number: u32,
    message_id: String,
    ledger: Arc<InvocationLedger>,
    dispatcher: DispatchCoordinator,
    finish: Option<FinishReason>,
    usage: Usage,
}

/// The engine that orchestrates a session
pub struct Engine {
    config: EngineConfig,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelService>,
    conversation: Conversation,
    event_tx: broadcast::Sender<SessionEvent>,
    handle: SessionHandle,
    state: Option<RoundtripState>,
}

impl Engine {
    /// Create a new engine
    pub fn new(config: EngineConfig, model: Arc<dyn ModelService>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            handle: SessionHandle::new(event_tx.clone()),
            config,
            tools: Arc::new(ToolRegistry::new()),
            model,
            conversation: Conversation::default(),
            event_tx,
            state: None,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Get a cloneable handle for supplying client results and aborting
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Get the engine config
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the conversation state
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    /// Current roundtrip state (None before the first run)
    pub fn state(&self) -> Option<RoundtripState> {
        self.state
    }

    /// Register a tool. Names must be unique.
    pub fn add_tool(&mut self, definition: ToolDefinition) -> Result<()> {
        tracing::debug!("Registering tool '{}' ({:?})", definition.spec.name, definition.domain());
        Arc::make_mut(&mut self.tools).register(definition)?;
        Ok(())
    }

    /// Get registered tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.names()
    }

    /// Serialize the message history as JSON
    pub fn checkpoint(&self) -> Result<String> {
        let checkpoint = SessionCheckpoint {
            messages: self.conversation.messages.clone(),
            total_usage: self.conversation.total_usage,
        };
        Ok(serde_json::to_string(&checkpoint)?)
    }

    /// Replace the message history with a checkpoint
    pub fn restore(&mut self, json: &str) -> Result<()> {
        let checkpoint: SessionCheckpoint = serde_json::from_str(json)?;
        self.conversation = Conversation {
            messages: checkpoint.messages,
            total_usage: checkpoint.total_usage,
            ..Default::default()
        };
        self.state = None;
        Ok(())
    }

    /// Send a user message and run until a terminal state
    pub async fn run(&mut self, input: &str) -> Result<SessionOutcome> {
        self.run_with_message(Message::user(input)).await
    }

    /// Append a message and run until a terminal state.
    ///
    /// Calls still open in an interrupted trailing turn are failed first so
    /// the history stays valid prompt context.
    pub async fn run_with_message(&mut self, message: Message) -> Result<SessionOutcome> {
        self.abandon_open_calls(false);
        self.push_message(message);
        let controller = RoundtripController::new(self.config.max_automatic_roundtrips);
        self.drive(controller, None).await
    }

    /// Continue from the existing history without a new user message.
    ///
    /// A trailing assistant turn with tool calls is picked up where it
    /// stopped: client calls without a result wait again, server calls and
    /// argument streams cut off by the interruption are failed.
    pub async fn resume(&mut self) -> Result<SessionOutcome> {
        let max = self.config.max_automatic_roundtrips;
        let Some((role, has_calls)) = self
            .conversation
            .messages
            .last()
            .map(|m| (m.role, !m.tool_invocations.is_empty()))
        else {
            return Err(Error::NothingToResume("conversation is empty".into()));
        };

        match role {
            Role::User | Role::Tool => self.drive(RoundtripController::new(max), None).await,
            Role::Assistant if has_calls => {
                let turn = self.restore_turn()?;
                let controller = RoundtripController::resumed(max, turn.ledger.all_resolved());
                self.drive(controller, Some(turn)).await
            }
            role => Err(Error::NothingToResume(format!(
                "last message is from {} and requested no tools",
                role.as_str()
            ))),
        }
    }

    fn restore_turn(&mut self) -> Result<LiveTurn> {
        self.abandon_open_calls(true);
        let Some(message) = self.conversation.trailing_assistant_mut() else {
            return Err(Error::NothingToResume("no assistant turn".into()));
        };

        let message_id = message.id.clone();
        let checkpoint = LedgerCheckpoint {
            invocations: message.tool_invocations.clone(),
        };
        let ledger = InvocationLedger::restore(self.tools.schemas(), checkpoint)
            .map_err(|e| ledger_error("", e))?;
        Ok(self.live_turn(0, message_id, Arc::new(ledger), Some(FinishReason::ToolCalls)))
    }

    /// Fail the open calls of the trailing assistant turn. Client calls with
    /// arguments keep waiting when `keep_client` is set.
    fn abandon_open_calls(&mut self, keep_client: bool) -> usize {
        let interrupted = CallError::Abandoned {
            reason: INTERRUPTED.into(),
        };
        let Some(message) = self.conversation.trailing_assistant_mut() else {
            return 0;
        };

        let mut abandoned = 0;
        for inv in &mut message.tool_invocations {
            match (inv.state, inv.domain) {
                (InvocationState::Result, _) => {}
                (InvocationState::Call, ExecutionDomain::Client) if keep_client => {
                    inv.awaiting_client = true;
                }
                _ => {
                    tracing::warn!("Tool call '{}' was interrupted", inv.call_id);
                    inv.state = InvocationState::Result;
                    inv.result = Some(ToolResult::failed(&interrupted));
                    inv.awaiting_client = false;
                    abandoned += 1;
                }
            }
        }

        if abandoned > 0 {
            let _ = self.event_tx.send(SessionEvent::MessageUpdate {
                message: message.clone(),
            });
        }
        abandoned
    }

    fn live_turn(
        &self,
        number: u32,
        message_id: String,
        ledger: Arc<InvocationLedger>,
        finish: Option<FinishReason>,
    ) -> LiveTurn {
        LiveTurn {
            number,
            message_id,
            dispatcher: DispatchCoordinator::new(
                Arc::clone(&self.tools),
                Arc::clone(&ledger),
                self.event_tx.clone(),
            ),
            ledger,
            finish,
            usage: Usage::default(),
        }
    }

    fn push_message(&mut self, message: Message) {
        self.conversation.messages.push(message.clone());
        let _ = self.event_tx.send(SessionEvent::MessageAppended { message });
    }

    /// Core session loop shared by `run` and `resume`.
    async fn drive(
        &mut self,
        mut controller: RoundtripController,
        mut live: Option<LiveTurn>,
    ) -> Result<SessionOutcome> {
        // Reset cancellation token
        *self.handle.cancel.lock() = CancellationToken::new();
        let cancel = self.handle.cancel.lock().clone();
        self.handle.is_running.store(true, Ordering::Release);
        self.conversation.error = None;
        let _ = self.event_tx.send(SessionEvent::SessionStart);

        if let Some(turn) = &live {
            self.handle.attach(Arc::clone(&turn.ledger));
            for call in turn.ledger.pending_client_calls() {
                let _ = self.event_tx.send(SessionEvent::ClientToolCall { call });
            }
        }

        let mut turns = 0u32;
        let mut usage = Usage::default();

        let result = loop {
            let state = controller.state();
            self.publish_state(state);

            let step = match state {
                RoundtripState::AwaitingModel => {
                    turns += 1;
                    self.model_turn(&mut controller, &mut live, turns, &cancel)
                        .await
                }
                RoundtripState::AwaitingTools => match &live {
                    Some(turn) => self.await_tools(&mut controller, turn, &cancel).await,
                    None => Err(Error::InvalidTransition {
                        from: state,
                        event: "await tools without a live turn",
                    }),
                },
                RoundtripState::ReadyToContinue => {
                    if let Some(turn) = live.take() {
                        usage.accumulate(&self.finalize_turn(turn));
                    }
                    controller.advance().map(|next| match next {
                        Continuation::Continue { roundtrip } => tracing::debug!(
                            "Automatic roundtrip {}/{}",
                            roundtrip,
                            controller.max_roundtrips()
                        ),
                        Continuation::BudgetExhausted => tracing::debug!(
                            "Roundtrip budget of {} exhausted",
                            controller.max_roundtrips()
                        ),
                    })
                }
                RoundtripState::TerminalStop => match live.as_mut() {
                    Some(turn) if !turn.ledger.all_resolved() => {
                        self.settle_turn(turn, &cancel).await
                    }
                    _ => break Ok(()),
                },
                RoundtripState::TerminalBudgetExhausted
                | RoundtripState::TerminalError
                | RoundtripState::TerminalCancelled => break Ok(()),
            };

            if let Err(e) = step {
                if e.is_cancelled() {
                    controller.cancel();
                } else {
                    controller.fail();
                }
                self.publish_state(controller.state());
                break Err(e);
            }
        };

        if let Some(turn) = live.take() {
            usage.accumulate(&self.finalize_turn(turn));
        }
        self.conversation.is_streaming = false;

        let error = result.as_ref().err().filter(|e| !e.is_cancelled());
        if let Some(e) = error {
            tracing::debug!("Session ended with error: {}", e);
            self.conversation.error = Some(e.to_string());
            let _ = self.event_tx.send(SessionEvent::Error {
                message: e.to_string(),
            });
        }

        let outcome = SessionOutcome {
            state: TerminalState::from_state(controller.state()).unwrap_or(TerminalState::Error),
            roundtrips: controller.roundtrips(),
            turns,
            finish_reason: controller.last_finish(),
            usage,
            error: error.map(|e| e.to_string()),
        };
        let _ = self.event_tx.send(SessionEvent::SessionEnd {
            outcome: outcome.clone(),
        });

        self.handle.is_running.store(false, Ordering::Release);
        self.handle.idle_notify.notify_waiters();

        match result {
            Ok(()) | Err(Error::Cancelled) => Ok(outcome),
            Err(e) => Err(e),
        }
    }

    fn publish_state(&mut self, state: RoundtripState) {
        if self.state != Some(state) {
            self.state = Some(state);
            let _ = self.event_tx.send(SessionEvent::StateChanged { state });
        }
    }

    /// Invoke the model and consume its stream into a new live turn.
    async fn model_turn(
        &mut self,
        controller: &mut RoundtripController,
        live: &mut Option<LiveTurn>,
        number: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = ContextAssembler::new(&self.config, self.tools.schemas())
            .assemble(&self.conversation.messages)?;
        tracing::debug!(
            "Turn {}: invoking model with {} prompt messages",
            number,
            request.messages.len()
        );
        let _ = self.event_tx.send(SessionEvent::TurnStart {
            turn_number: number,
        });

        let model = Arc::clone(&self.model);
        let frames = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            frames = model.invoke(request) => frames?,
        };

        let message = Message::assistant_empty();
        let ledger = Arc::new(InvocationLedger::new(self.tools.schemas()));
        let turn = live.insert(self.live_turn(number, message.id.clone(), ledger, None));
        self.push_message(message);
        self.handle.attach(Arc::clone(&turn.ledger));

        self.conversation.is_streaming = true;
        let result = self.consume_stream(controller, turn, frames, cancel).await;
        self.conversation.is_streaming = false;
        result
    }

    async fn consume_stream(
        &mut self,
        controller: &mut RoundtripController,
        turn: &mut LiveTurn,
        frames: FrameStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut events = StreamDecoder::new(self.tools.schemas()).decode(frames);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = events.next() => next,
            };
            let Some(event) = next else {
                return Err(volley_ai::DecodeError::MissingFinish.into());
            };

            match event? {
                StreamEvent::TextDelta { delta } => {
                    if let Some(message) = self.conversation.trailing_assistant_mut() {
                        message.content.push_str(&delta);
                    }
                    let _ = self.event_tx.send(SessionEvent::TextDelta {
                        message_id: turn.message_id.clone(),
                        delta,
                    });
                }
                StreamEvent::ToolCallStart { call_id, tool_name } => {
                    let domain = self.tools.schemas().domain(&tool_name);
                    turn.ledger
                        .register(&call_id, &tool_name, domain.unwrap_or(ExecutionDomain::Server))
                        .map_err(|e| ledger_error(&call_id, e))?;
                    let _ = self.event_tx.send(SessionEvent::ToolCallStart {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                    });
                    if domain.is_none() {
                        let error = CallError::UnknownTool { name: tool_name };
                        turn.ledger
                            .fail(&call_id, &error)
                            .map_err(|e| ledger_error(&call_id, e))?;
                        self.tolerate(&call_id, error)?;
                    }
                    self.sync_message(turn);
                }
                StreamEvent::ToolCallArgDelta { call_id, fragment } => {
                    let _ = self
                        .event_tx
                        .send(SessionEvent::ToolCallDelta { call_id, fragment });
                }
                StreamEvent::ToolCallEnd {
                    call_id, arguments, ..
                } => {
                    match arguments {
                        Ok(arguments) => match turn.ledger.set_arguments(&call_id, arguments) {
                            Ok(()) => {
                                let dispatch = turn
                                    .dispatcher
                                    .dispatch(&call_id)
                                    .map_err(|e| ledger_error(&call_id, e))?;
                                tracing::debug!("Dispatched '{}': {:?}", call_id, dispatch);
                            }
                            Err(LedgerError::Call(error)) => self.tolerate(&call_id, error)?,
                            Err(LedgerError::Protocol(violation)) => return Err(violation.into()),
                        },
                        // Unknown tools were already failed at start
                        Err(_) if turn.ledger.is_resolved(&call_id) => {}
                        Err(error) => {
                            turn.ledger
                                .fail(&call_id, &error)
                                .map_err(|e| ledger_error(&call_id, e))?;
                            self.tolerate(&call_id, error)?;
                        }
                    }
                    self.sync_message(turn);
                }
                StreamEvent::Error { message } => return Err(Error::Model(message)),
                StreamEvent::Finish { reason, usage } => {
                    tracing::debug!("Turn {} finished: {:?}", turn.number, reason);
                    let grace = Duration::from_millis(self.config.finish_grace_ms);
                    let trailing = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        next = tokio::time::timeout(grace, events.next()) => next,
                    };
                    match trailing {
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(_) => {}
                        Err(_) => tracing::debug!(
                            "Model stream still open {}ms after finish, dropping it",
                            self.config.finish_grace_ms
                        ),
                    }

                    turn.finish = Some(reason);
                    turn.usage = usage;
                    self.conversation.total_usage.accumulate(&usage);

                    let state = controller.on_finish(reason, turn.ledger.all_resolved())?;
                    if state == RoundtripState::TerminalError {
                        return Err(Error::Model("turn finished with reason 'error'".into()));
                    }
                    return self.check_failures(turn);
                }
            }
        }
    }

    /// Wait for tool results until every invocation of the turn is resolved.
    async fn await_tools(
        &mut self,
        controller: &mut RoundtripController,
        turn: &LiveTurn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut changes = turn.ledger.subscribe();
        loop {
            self.sync_message(turn);
            self.check_failures(turn)?;
            if controller.on_tools_changed(turn.ledger.all_resolved())?
                != RoundtripState::AwaitingTools
            {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(Error::Protocol(crate::error::ProtocolViolation::TurnNotLive));
                    }
                }
            }
        }
    }

    /// Bring a turn the model ended with calls still open to rest. Running
    /// executions complete; calls nobody will answer any more are failed.
    async fn settle_turn(&mut self, turn: &mut LiveTurn, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(
            "Turn {} ended with {} open tool calls",
            turn.number,
            turn.ledger.pending_count()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = turn.dispatcher.join() => {}
        }

        let abandoned = CallError::Abandoned {
            reason: "the model ended the turn".into(),
        };
        for invocation in turn.ledger.snapshot() {
            if invocation.is_resolved() {
                continue;
            }
            // A client result may land between snapshot and fail
            if let Err(e) = turn.ledger.fail(&invocation.call_id, &abandoned) {
                if !turn.ledger.is_resolved(&invocation.call_id) {
                    return Err(ledger_error(&invocation.call_id, e));
                }
            }
        }
        self.sync_message(turn);
        Ok(())
    }

    /// Per-call failures are fatal when error tolerance is off.
    fn check_failures(&self, turn: &LiveTurn) -> Result<()> {
        match turn.ledger.first_failure() {
            Some((call_id, error)) if !self.config.error_tolerant => {
                Err(Error::ToolFailure { call_id, error })
            }
            _ => Ok(()),
        }
    }

    fn tolerate(&self, call_id: &str, error: CallError) -> Result<()> {
        tracing::warn!("Tool call '{}' failed: {}", call_id, error);
        if self.config.error_tolerant {
            Ok(())
        } else {
            Err(Error::ToolFailure {
                call_id: call_id.to_string(),
                error,
            })
        }
    }

    /// Copy the ledger into the turn's assistant message
    fn sync_message(&mut self, turn: &LiveTurn) {
        let invocations = turn.ledger.snapshot();
        let Some(message) = self
            .conversation
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id == turn.message_id)
        else {
            return;
        };
        if message.tool_invocations != invocations {
            message.tool_invocations = invocations;
            let _ = self.event_tx.send(SessionEvent::MessageUpdate {
                message: message.clone(),
            });
        }
    }

    /// Close the turn's ledger and archive its final state. Results arriving
    /// later are discarded.
    fn finalize_turn(&mut self, turn: LiveTurn) -> Usage {
        turn.ledger.close();
        self.sync_message(&turn);
        self.handle.detach();
        if turn.dispatcher.in_flight() > 0 {
            tracing::debug!(
                "Turn {} closed with {} executions still running",
                turn.number,
                turn.dispatcher.in_flight()
            );
        }
        let _ = self.event_tx.send(SessionEvent::TurnEnd {
            turn_number: turn.number,
            finish_reason: turn.finish,
            usage: turn.usage,
        });
        turn.usage
    }
}

fn ledger_error(call_id: &str, error: LedgerError) -> Error {
    match error {
        LedgerError::Protocol(violation) => Error::Protocol(violation),
        LedgerError::Call(error) => Error::ToolFailure {
            call_id: call_id.to_string(),
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolViolation;
    use crate::tool::Tool;
    use async_trait::async_trait;
    use std::time::Duration;
    use volley_ai::providers::ScriptedModel;
    use volley_ai::{Frame, PromptMessage};

    struct WeatherTool;

    #[async_trait]
    impl Tool for WeatherTool {
        fn name(&self) -> &str {
            "weather"
        }
        fn description(&self) -> &str {
            "Current weather for a city"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        }
        async fn execute(&self, _call_id: &str, _arguments: serde_json::Value) -> ToolResult {
            ToolResult::text("sunny")
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _call_id: &str, _arguments: serde_json::Value) -> ToolResult {
            ToolResult::error("disk on fire")
        }
    }

    struct SlowWeatherTool;

    #[async_trait]
    impl Tool for SlowWeatherTool {
        fn name(&self) -> &str {
            "slow_weather"
        }
        fn description(&self) -> &str {
            "Weather from a slow upstream"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _call_id: &str, _arguments: serde_json::Value) -> ToolResult {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ToolResult::text("slow sunny")
        }
    }

    /// Serves one complete turn, then keeps the stream open
    struct HeldOpenModel;

    #[async_trait]
    impl ModelService for HeldOpenModel {
        async fn invoke(&self, _request: volley_ai::ModelRequest) -> volley_ai::Result<FrameStream> {
            let frames: Vec<volley_ai::Result<String>> =
                stop("Hi").iter().map(|f| Ok(f.encode())).collect();
            Ok(Box::pin(
                futures::stream::iter(frames).chain(futures::stream::pending()),
            ))
        }
    }

    fn usage() -> Usage {
        Usage {
            input: 10,
            output: 5,
        }
    }

    fn stop(text: &str) -> Vec<Frame> {
        vec![Frame::text(text), Frame::finish(FinishReason::Stop, usage())]
    }

    fn weather_call(id: &str) -> Frame {
        Frame::tool_call(id, "weather", serde_json::json!({"city": "Oslo"}))
    }

    fn engine(config: EngineConfig, turns: Vec<Vec<Frame>>) -> (Engine, Arc<ScriptedModel>) {
        engine_with_model(config, ScriptedModel::from_frames(turns))
    }

    fn engine_with_model(config: EngineConfig, model: ScriptedModel) -> (Engine, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let mut engine = Engine::new(config, model.clone());
        engine
            .add_tool(ToolDefinition::server(Arc::new(WeatherTool)))
            .unwrap();
        engine
            .add_tool(ToolDefinition::server(Arc::new(BrokenTool)))
            .unwrap();
        engine
            .add_tool(ToolDefinition::client(
                "confirm",
                "Ask the user to confirm",
                serde_json::json!({"type": "object"}),
            ))
            .unwrap();
        (engine, model)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SessionEvent]) -> Vec<RoundtripState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn tool_entries(request: &volley_ai::ModelRequest) -> Vec<(String, serde_json::Value, bool)> {
        request
            .messages
            .iter()
            .filter_map(|m| match m {
                PromptMessage::Tool {
                    tool_call_id,
                    content,
                    is_error,
                    ..
                } => Some((tool_call_id.clone(), content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    /// Receive events until `done` returns true for the accumulated set
    async fn wait_until(
        rx: &mut broadcast::Receiver<SessionEvent>,
        mut done: impl FnMut(&SessionEvent) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if done(&event) {
                    return;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_no_tools_stops_without_reinvocation() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(5),
            vec![stop("Hello!")],
        );
        let mut rx = engine.subscribe();

        let outcome = engine.run("Hi").await.unwrap();

        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.roundtrips, 0);
        assert_eq!(outcome.usage, usage());
        assert_eq!(model.invocations(), 1);
        assert_eq!(engine.messages().len(), 2);
        assert_eq!(engine.messages()[1].content, "Hello!");
        assert_eq!(engine.state(), Some(RoundtripState::TerminalStop));

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(SessionEvent::MessageAppended { .. })));
        assert!(matches!(events[1], SessionEvent::SessionStart));
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(
            states(&events),
            vec![RoundtripState::AwaitingModel, RoundtripState::TerminalStop]
        );
    }

    #[tokio::test]
    async fn test_server_and_client_tools() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            vec![
                vec![
                    Frame::text("Checking."),
                    weather_call("c1"),
                    Frame::tool_call("k1", "confirm", serde_json::json!({"q": "go?"})),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("It is sunny."),
            ],
        );
        let handle = engine.handle();
        let mut rx = engine.subscribe();

        let task = tokio::spawn(async move {
            let outcome = engine.run("Weather in Oslo?").await;
            (engine, outcome)
        });

        let mut awaiting = false;
        let mut server_done = false;
        wait_until(&mut rx, |event| {
            match event {
                SessionEvent::StateChanged {
                    state: RoundtripState::AwaitingTools,
                } => awaiting = true,
                SessionEvent::ToolExecutionEnd { call_id, result, .. } if call_id == "c1" => {
                    assert_eq!(result.text_content(), "sunny");
                    server_done = true;
                }
                _ => {}
            }
            awaiting && server_done
        })
        .await;

        let pending = handle.pending_client_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "k1");
        assert_eq!(pending[0].arguments["q"], "go?");

        assert_eq!(
            handle.supply_client_result("c1", serde_json::json!("forged")),
            Err(ProtocolViolation::NotClientSide("c1".into()))
        );
        assert_eq!(
            handle.supply_client_result("zz", serde_json::json!(1)),
            Err(ProtocolViolation::UnknownCallId("zz".into()))
        );
        handle
            .supply_client_result("k1", serde_json::json!("yes"))
            .unwrap();

        let (engine, outcome) = task.await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(outcome.roundtrips, 1);
        assert_eq!(model.invocations(), 2);

        let events = drain(&mut rx);
        let seen = states(&events);
        assert_eq!(
            seen,
            vec![
                RoundtripState::ReadyToContinue,
                RoundtripState::AwaitingModel,
                RoundtripState::TerminalStop
            ]
        );

        let second = &model.requests()[1];
        assert_eq!(
            tool_entries(second),
            vec![
                ("c1".to_string(), serde_json::json!("sunny"), false),
                ("k1".to_string(), serde_json::json!("yes"), false),
            ]
        );

        let turn = &engine.messages()[1];
        assert_eq!(turn.content, "Checking.");
        assert!(turn.all_resolved());
        assert_eq!(
            handle.supply_client_result("k1", serde_json::json!("again")),
            Err(ProtocolViolation::TurnNotLive)
        );
    }

    #[tokio::test]
    async fn test_zero_budget_exhausts_after_tools() {
        let (mut engine, model) = engine(
            EngineConfig::default(),
            vec![
                vec![weather_call("c1"), Frame::finish(FinishReason::ToolCalls, usage())],
                stop("never sent"),
            ],
        );
        let mut rx = engine.subscribe();

        let outcome = engine.run("Weather?").await.unwrap();

        assert_eq!(outcome.state, TerminalState::BudgetExhausted);
        assert_eq!(model.invocations(), 1);
        assert_eq!(model.remaining(), 1);
        assert!(engine.messages()[1].all_resolved());

        let seen = states(&drain(&mut rx));
        let ready = seen
            .iter()
            .position(|s| *s == RoundtripState::ReadyToContinue)
            .unwrap();
        assert_eq!(seen[ready + 1], RoundtripState::TerminalBudgetExhausted);
    }

    #[tokio::test]
    async fn test_budget_bounds_reinvocations() {
        let tool_turn = || vec![weather_call("c1"), Frame::finish(FinishReason::ToolCalls, usage())];
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(2),
            vec![tool_turn(), tool_turn(), tool_turn(), tool_turn()],
        );

        let outcome = engine.run("Loop").await.unwrap();

        assert_eq!(outcome.state, TerminalState::BudgetExhausted);
        assert_eq!(outcome.roundtrips, 2);
        assert_eq!(outcome.turns, 3);
        assert_eq!(model.invocations(), 3);
        assert_eq!(
            outcome.usage,
            Usage {
                input: 30,
                output: 15
            }
        );
    }

    #[tokio::test]
    async fn test_failing_tool_does_not_abort_sibling() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            vec![
                vec![
                    Frame::tool_call("b1", "broken", serde_json::json!({})),
                    weather_call("c1"),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("Partially done."),
            ],
        );

        let outcome = engine.run("Do both").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);

        let turn = &engine.messages()[1];
        assert!(turn.invocation("b1").unwrap().is_failed());
        assert!(!turn.invocation("c1").unwrap().is_failed());

        let entries = tool_entries(&model.requests()[1]);
        assert_eq!(entries[0].0, "b1");
        assert!(entries[0].2);
        assert_eq!(entries[0].1["error"]["kind"], "tool-execution");
        assert_eq!(entries[1], ("c1".to_string(), serde_json::json!("sunny"), false));
    }

    #[tokio::test]
    async fn test_strict_mode_escalates_failures() {
        let (mut engine, model) = engine(
            EngineConfig::default()
                .with_max_automatic_roundtrips(1)
                .with_error_tolerant(false),
            vec![
                vec![
                    Frame::tool_call("b1", "broken", serde_json::json!({})),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("unreachable"),
            ],
        );

        let err = engine.run("Break it").await.unwrap_err();
        assert!(matches!(err, Error::ToolFailure { ref call_id, .. } if call_id == "b1"));
        assert_eq!(engine.state(), Some(RoundtripState::TerminalError));
        assert_eq!(model.invocations(), 1);
        assert!(engine.conversation().error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_are_per_call() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            vec![
                vec![
                    Frame::tool_call("t1", "teleport", serde_json::json!({})),
                    Frame::tool_call_start("c1", "weather"),
                    Frame::tool_call_delta("c1", "{\"city\":"),
                    Frame::tool_call_delta("c1", "42}"),
                    Frame::tool_call("c1", "weather", serde_json::Value::Null),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("Sorry."),
            ],
        );

        let outcome = engine.run("Go").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);

        let entries = tool_entries(&model.requests()[1]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1["error"]["kind"], "unknown-tool");
        assert_eq!(entries[1].1["error"]["kind"], "argument-validation");
    }

    #[tokio::test]
    async fn test_decode_error_is_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            "0:\"partial\"".to_string(),
            "x:nonsense".to_string(),
        ]]));
        let mut engine = Engine::new(EngineConfig::default(), model);

        let err = engine.run("Hi").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(engine.state(), Some(RoundtripState::TerminalError));
        assert_eq!(engine.messages()[1].content, "partial");
    }

    #[tokio::test]
    async fn test_model_error_frame_is_terminal() {
        let model = Arc::new(ScriptedModel::new(vec![vec!["3:\"overloaded\"".to_string()]]));
        let mut engine = Engine::new(EngineConfig::default(), model);

        let err = engine.run("Hi").await.unwrap_err();
        assert!(matches!(err, Error::Model(ref m) if m == "overloaded"));
        assert_eq!(engine.state(), Some(RoundtripState::TerminalError));
    }

    #[tokio::test]
    async fn test_frame_after_finish_is_fatal() {
        let mut turn = stop("Hi");
        turn.push(Frame::text("late"));
        let (mut engine, _model) = engine(EngineConfig::default(), vec![turn]);

        let err = engine.run("Hi").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(volley_ai::DecodeError::TrailingFrame)
        ));
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            vec![
                vec![
                    Frame::tool_call("k1", "confirm", serde_json::json!({})),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("Confirmed."),
            ],
        );
        let handle = engine.handle();
        let mut rx = engine.subscribe();

        let task = tokio::spawn(async move {
            let outcome = engine.run("Confirm please").await;
            (engine, outcome)
        });
        wait_until(&mut rx, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    state: RoundtripState::AwaitingTools
                }
            )
        })
        .await;
        handle.abort();

        let (mut engine, outcome) = task.await.unwrap();
        assert_eq!(outcome.unwrap().state, TerminalState::Cancelled);
        assert!(!handle.is_running());
        assert!(handle.pending_client_calls().is_empty());

        // Simulate a reconnect from a saved session
        let saved = engine.checkpoint().unwrap();
        engine.restore(&saved).unwrap();
        assert!(!engine.messages()[1].all_resolved());

        let task = tokio::spawn(async move {
            let outcome = engine.resume().await;
            (engine, outcome)
        });
        wait_until(&mut rx, |e| {
            matches!(e, SessionEvent::ClientToolCall { call } if call.call_id == "k1")
        })
        .await;
        handle
            .supply_client_result("k1", serde_json::json!(true))
            .unwrap();

        let (engine, outcome) = task.await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(model.invocations(), 2);
        assert_eq!(engine.messages().last().unwrap().content, "Confirmed.");
    }

    #[tokio::test]
    async fn test_resume_fails_interrupted_server_calls() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            vec![stop("Recovered.")],
        );
        let mut assistant = Message::assistant_empty();
        let mut call = volley_ai::ToolInvocation::partial("c1", "weather", ExecutionDomain::Server);
        call.state = InvocationState::Call;
        call.arguments = Some(serde_json::json!({"city": "Oslo"}));
        assistant.tool_invocations.push(call);
        engine.conversation.messages = vec![Message::user("Weather?"), assistant];

        let outcome = engine.resume().await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(model.invocations(), 1);
        let entries = tool_entries(&model.requests()[0]);
        assert!(entries[0].2);
        assert_eq!(entries[0].1["error"]["kind"], "abandoned");
    }

    #[tokio::test]
    async fn test_resume_with_nothing_pending() {
        let (mut engine, _model) = engine(EngineConfig::default(), vec![stop("Hi")]);
        assert!(matches!(
            engine.resume().await,
            Err(Error::NothingToResume(_))
        ));
        engine.run("Hello").await.unwrap();
        assert!(matches!(
            engine.resume().await,
            Err(Error::NothingToResume(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let (mut engine, _model) = engine(EngineConfig::default(), vec![stop("Hello!")]);
        engine.run("Hi").await.unwrap();
        let saved = engine.checkpoint().unwrap();

        let (mut other, _) = engine_with_no_turns();
        other.restore(&saved).unwrap();
        assert_eq!(other.messages(), engine.messages());
        assert_eq!(other.conversation().total_usage, usage());
    }

    fn engine_with_no_turns() -> (Engine, Arc<ScriptedModel>) {
        engine(EngineConfig::default(), vec![])
    }

    #[tokio::test]
    async fn test_script_exhausted_surfaces_model_error() {
        let (mut engine, _model) = engine_with_no_turns();
        let err = engine.run("Hi").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Ai(volley_ai::Error::ScriptExhausted(0))
        ));
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_server_call() {
        let (mut engine, model) = engine(
            EngineConfig::default(),
            vec![
                vec![
                    Frame::tool_call("s1", "slow_weather", serde_json::json!({})),
                    Frame::finish(FinishReason::Stop, usage()),
                ],
                stop("Anything else?"),
            ],
        );
        engine
            .add_tool(ToolDefinition::server(Arc::new(SlowWeatherTool)))
            .unwrap();

        let outcome = engine.run("Weather?").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        let call = engine.messages()[1].invocation("s1").unwrap();
        assert_eq!(call.state, InvocationState::Result);
        assert!(!call.is_failed());
        assert_eq!(call.result.as_ref().unwrap().text_content(), "slow sunny");

        let outcome = engine.run("Thanks").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(model.invocations(), 2);
        assert_eq!(
            tool_entries(&model.requests()[1]),
            vec![("s1".to_string(), serde_json::json!("slow sunny"), false)]
        );
    }

    #[tokio::test]
    async fn test_stop_fails_unanswered_client_call() {
        let (mut engine, model) = engine(
            EngineConfig::default(),
            vec![
                vec![
                    Frame::tool_call("k1", "confirm", serde_json::json!({})),
                    Frame::finish(FinishReason::Stop, usage()),
                ],
                stop("Moving on."),
            ],
        );
        let handle = engine.handle();

        let outcome = engine.run("Confirm?").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert!(handle.pending_client_calls().is_empty());
        let call = engine.messages()[1].invocation("k1").unwrap();
        assert!(call.is_failed());
        assert_eq!(call.result.as_ref().unwrap().value["error"]["kind"], "abandoned");

        let outcome = engine.run("Skip it").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(model.invocations(), 2);
        let entries = tool_entries(&model.requests()[1]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "k1");
        assert!(entries[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_stream_then_run() {
        let (mut engine, model) = engine_with_model(
            EngineConfig::default(),
            ScriptedModel::from_frames(vec![
                vec![
                    Frame::text("Let me check"),
                    Frame::tool_call_start("c1", "weather"),
                    Frame::tool_call_delta("c1", "{\"city\":"),
                    Frame::tool_call_delta("c1", "\"Oslo\"}"),
                    Frame::tool_call("c1", "weather", serde_json::Value::Null),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("Sure."),
            ])
            .with_frame_delay(Duration::from_millis(20)),
        );
        let handle = engine.handle();
        let mut rx = engine.subscribe();

        let task = tokio::spawn(async move {
            let outcome = engine.run("Weather?").await;
            (engine, outcome)
        });
        wait_until(&mut rx, |e| {
            matches!(e, SessionEvent::ToolCallStart { call_id, .. } if call_id == "c1")
        })
        .await;
        handle.abort();

        let (mut engine, outcome) = task.await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.state, TerminalState::Cancelled);
        assert!(outcome.error.is_none());
        assert_eq!(engine.state(), Some(RoundtripState::TerminalCancelled));
        assert_eq!(engine.messages()[1].content, "Let me check");
        assert_eq!(
            engine.messages()[1].invocation("c1").unwrap().state,
            InvocationState::PartialCall
        );

        let outcome = engine.run("Never mind").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(model.invocations(), 2);
        let entries = tool_entries(&model.requests()[1]);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].2);
        assert_eq!(entries[0].1["error"]["kind"], "abandoned");
    }

    #[tokio::test]
    async fn test_length_finish_stops() {
        let (mut engine, model) = engine(
            EngineConfig::default().with_max_automatic_roundtrips(3),
            vec![
                vec![
                    Frame::text("The answer is"),
                    Frame::finish(FinishReason::Length, usage()),
                ],
                stop("never sent"),
            ],
        );

        let outcome = engine.run("Explain").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(outcome.finish_reason, Some(FinishReason::Length));
        assert_eq!(outcome.roundtrips, 0);
        assert_eq!(model.invocations(), 1);
        assert_eq!(engine.messages()[1].content, "The answer is");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_result_before_finish_skips_waiting() {
        let (mut engine, model) = engine_with_model(
            EngineConfig::default().with_max_automatic_roundtrips(1),
            ScriptedModel::from_frames(vec![
                vec![
                    Frame::tool_call("k1", "confirm", serde_json::json!({})),
                    Frame::finish(FinishReason::ToolCalls, usage()),
                ],
                stop("Done."),
            ])
            .with_frame_delay(Duration::from_millis(20)),
        );
        let handle = engine.handle();
        let mut rx = engine.subscribe();
        let mut all = engine.subscribe();

        let task = tokio::spawn(async move {
            let outcome = engine.run("Go").await;
            (engine, outcome)
        });
        wait_until(&mut rx, |e| {
            matches!(e, SessionEvent::ClientToolCall { call } if call.call_id == "k1")
        })
        .await;
        handle
            .supply_client_result("k1", serde_json::json!(true))
            .unwrap();

        let (_engine, outcome) = task.await.unwrap();
        assert_eq!(outcome.unwrap().state, TerminalState::Stop);
        assert_eq!(model.invocations(), 2);
        assert_eq!(
            states(&drain(&mut all)),
            vec![
                RoundtripState::AwaitingModel,
                RoundtripState::ReadyToContinue,
                RoundtripState::AwaitingModel,
                RoundtripState::TerminalStop
            ]
        );
        assert_eq!(
            tool_entries(&model.requests()[1]),
            vec![("k1".to_string(), serde_json::json!(true), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_held_open_after_finish() {
        let mut engine = Engine::new(EngineConfig::default(), Arc::new(HeldOpenModel));
        let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run("Hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state, TerminalState::Stop);
        assert_eq!(engine.messages()[1].content, "Hi");
    }
}
