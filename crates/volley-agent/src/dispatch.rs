//! Routes validated tool calls to server executors or the client boundary

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use volley_ai::{CallError, ExecutionDomain, InvocationState, ToolResult};

use crate::error::ProtocolViolation;
use crate::events::SessionEvent;
use crate::ledger::{InvocationLedger, LedgerError, PendingClientCall};
use crate::tool::{ProgressSender, ToolRegistry};

/// What happened to a dispatched call
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A server-side execution was started
    Spawned,
    /// The call was handed to the client
    AwaitingClient(PendingClientCall),
    /// The call already had a result; nothing was started
    AlreadyResolved,
}

/// Starts tool executions for one turn.
///
/// Server-side executions run as independent tasks. Completion order is
/// not controlled and one failing execution never affects its siblings; each
/// writes its own result into the ledger.
pub struct DispatchCoordinator {
    tools: Arc<ToolRegistry>,
    ledger: Arc<InvocationLedger>,
    event_tx: broadcast::Sender<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatchCoordinator {
    pub fn new(
        tools: Arc<ToolRegistry>,
        ledger: Arc<InvocationLedger>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            tools,
            ledger,
            event_tx,
            tasks: vec![],
        }
    }

    /// Dispatch a call whose arguments are set
    pub fn dispatch(&mut self, call_id: &str) -> Result<Dispatch, LedgerError> {
        let invocation = self
            .ledger
            .get(call_id)
            .ok_or_else(|| ProtocolViolation::UnknownCallId(call_id.to_string()))?;

        match invocation.state {
            InvocationState::Result => return Ok(Dispatch::AlreadyResolved),
            InvocationState::PartialCall => {
                return Err(ProtocolViolation::ArgumentsNotSet(call_id.to_string()).into());
            }
            InvocationState::Call => {}
        }

        if invocation.domain == ExecutionDomain::Client {
            let pending = self.ledger.defer_to_client(call_id)?;
            tracing::debug!("Tool call '{}' handed to client", call_id);
            let _ = self.event_tx.send(SessionEvent::ClientToolCall {
                call: pending.clone(),
            });
            return Ok(Dispatch::AwaitingClient(pending));
        }

        let Some(tool) = self.tools.executor(&invocation.tool_name) else {
            self.ledger.fail(
                call_id,
                &CallError::UnknownTool {
                    name: invocation.tool_name.clone(),
                },
            )?;
            return Ok(Dispatch::AlreadyResolved);
        };

        let arguments = invocation.arguments.unwrap_or(serde_json::Value::Null);
        let call_id = invocation.call_id;
        let tool_name = invocation.tool_name;
        let ledger = Arc::clone(&self.ledger);
        let event_tx = self.event_tx.clone();

        let _ = event_tx.send(SessionEvent::ToolExecutionStart {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        });

        let handle = tokio::spawn(async move {
            let progress = ProgressSender::new(event_tx.clone(), call_id.clone(), tool_name.clone());
            let result = AssertUnwindSafe(tool.execute_with_progress(&call_id, arguments, progress))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!("Tool '{}' panicked during call '{}'", tool_name, call_id);
                    ToolResult::error("tool panicked")
                });

            match ledger.set_result(&call_id, result.clone()) {
                Ok(()) => {}
                Err(LedgerError::Protocol(ProtocolViolation::TurnClosed(_))) => {
                    tracing::debug!("Discarding late result for tool call '{}'", call_id);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Could not record result for '{}': {}", call_id, e);
                    return;
                }
            }

            let _ = event_tx.send(SessionEvent::ToolExecutionEnd {
                call_id,
                tool_name,
                result,
            });
        });
        self.tasks.push(handle);
        Ok(Dispatch::Spawned)
    }

    /// Number of server executions that have not completed
    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Wait for every started execution to complete
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolDefinition};
    use async_trait::async_trait;
    use std::time::Duration;

    struct SleepTool {
        name: &'static str,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Sleeps then answers"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _call_id: &str, _arguments: serde_json::Value) -> ToolResult {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                ToolResult::error("broken")
            } else {
                ToolResult::text(format!("{} done", self.name))
            }
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn description(&self) -> &str {
            "Panics"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _call_id: &str, _arguments: serde_json::Value) -> ToolResult {
            panic!("boom")
        }
    }

    fn setup() -> (DispatchCoordinator, Arc<InvocationLedger>, broadcast::Receiver<SessionEvent>) {
        let mut tools = ToolRegistry::new();
        tools
            .register(ToolDefinition::server(Arc::new(SleepTool {
                name: "slow",
                delay_ms: 50,
                fail: false,
            })))
            .unwrap();
        tools
            .register(ToolDefinition::server(Arc::new(SleepTool {
                name: "broken",
                delay_ms: 1,
                fail: true,
            })))
            .unwrap();
        tools
            .register(ToolDefinition::server(Arc::new(PanicTool)))
            .unwrap();
        tools
            .register(ToolDefinition::client(
                "confirm",
                "Ask the user",
                serde_json::json!({"type": "object"}),
            ))
            .unwrap();
        let ledger = Arc::new(InvocationLedger::new(tools.schemas()));
        let (tx, rx) = broadcast::channel(64);
        (
            DispatchCoordinator::new(Arc::new(tools), Arc::clone(&ledger), tx),
            ledger,
            rx,
        )
    }

    fn call(ledger: &InvocationLedger, id: &str, name: &str, domain: ExecutionDomain) {
        ledger.register(id, name, domain).unwrap();
        ledger.set_arguments(id, serde_json::json!({})).unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_sibling() {
        let (mut dispatch, ledger, _rx) = setup();
        call(&ledger, "a", "slow", ExecutionDomain::Server);
        call(&ledger, "b", "broken", ExecutionDomain::Server);

        assert_eq!(dispatch.dispatch("a").unwrap(), Dispatch::Spawned);
        assert_eq!(dispatch.dispatch("b").unwrap(), Dispatch::Spawned);
        dispatch.join().await;

        let a = ledger.get("a").unwrap();
        assert!(!a.is_failed());
        assert_eq!(a.result.unwrap().text_content(), "slow done");
        assert!(ledger.get("b").unwrap().is_failed());
        assert!(ledger.all_resolved());
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let (mut dispatch, ledger, _rx) = setup();
        call(&ledger, "p", "panic", ExecutionDomain::Server);
        dispatch.dispatch("p").unwrap();
        dispatch.join().await;
        assert!(ledger.get("p").unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_client_call_is_deferred() {
        let (mut dispatch, ledger, mut rx) = setup();
        call(&ledger, "k", "confirm", ExecutionDomain::Client);

        match dispatch.dispatch("k").unwrap() {
            Dispatch::AwaitingClient(pending) => assert_eq!(pending.call_id, "k"),
            other => panic!("expected AwaitingClient, got {:?}", other),
        }
        assert_eq!(dispatch.in_flight(), 0);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ClientToolCall { call } if call.tool_name == "confirm"
        ));
        assert!(!ledger.all_resolved());
    }

    #[tokio::test]
    async fn test_resolved_call_is_not_executed() {
        let (mut dispatch, ledger, _rx) = setup();
        call(&ledger, "a", "slow", ExecutionDomain::Server);
        ledger.set_result("a", ToolResult::text("cached")).unwrap();
        assert_eq!(dispatch.dispatch("a").unwrap(), Dispatch::AlreadyResolved);
    }

    #[tokio::test]
    async fn test_late_result_discarded_after_close() {
        let (mut dispatch, ledger, _rx) = setup();
        call(&ledger, "a", "slow", ExecutionDomain::Server);
        dispatch.dispatch("a").unwrap();
        ledger.close();
        dispatch.join().await;
        assert!(!ledger.is_resolved("a"));
    }

    #[tokio::test]
    async fn test_execution_events() {
        let (mut dispatch, ledger, mut rx) = setup();
        call(&ledger, "a", "slow", ExecutionDomain::Server);
        dispatch.dispatch("a").unwrap();
        dispatch.join().await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ToolExecutionStart { call_id, .. } if call_id == "a"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ToolExecutionEnd { call_id, result, .. }
                if call_id == "a" && !result.is_error
        ));
    }
}
