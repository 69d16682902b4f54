//! Invocation ledger: the single source of truth for a turn's tool calls

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use volley_ai::{
    CallError, ExecutionDomain, InvocationState, SchemaRegistry, ToolInvocation, ToolResult,
};

use crate::error::ProtocolViolation;

/// Failure of a ledger write
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    /// Structural misuse; fatal for the session
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    /// Per-call failure; the invocation was marked failed
    #[error(transparent)]
    Call(#[from] CallError),
}

/// A client-side call waiting for an externally supplied result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClientCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Serializable ledger contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerCheckpoint {
    pub invocations: Vec<ToolInvocation>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<ToolInvocation>,
    index: HashMap<String, usize>,
    failures: Vec<(String, CallError)>,
    closed: bool,
    revision: u64,
}

impl LedgerInner {
    fn entry_mut(&mut self, call_id: &str) -> Result<&mut ToolInvocation, ProtocolViolation> {
        if self.closed {
            return Err(ProtocolViolation::TurnClosed(call_id.to_string()));
        }
        let idx = *self
            .index
            .get(call_id)
            .ok_or_else(|| ProtocolViolation::UnknownCallId(call_id.to_string()))?;
        Ok(&mut self.entries[idx])
    }
}

/// Ledger of every tool invocation in the current turn.
///
/// Writes are serialized by a mutex and each call id accepts exactly one
/// result: a second write is an error, never an overwrite. Every write bumps
/// a revision published on a watch channel so waiters can recompute
/// `all_resolved()` without relying on write order.
pub struct InvocationLedger {
    inner: Mutex<LedgerInner>,
    registry: Arc<SchemaRegistry>,
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for InvocationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationLedger")
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl InvocationLedger {
    /// Create an empty ledger validating against `registry`
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LedgerInner::default()),
            registry,
            changes,
        }
    }

    /// Rebuild a ledger from a checkpoint
    pub fn restore(
        registry: Arc<SchemaRegistry>,
        checkpoint: LedgerCheckpoint,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::new(registry);
        {
            let mut inner = ledger.inner.lock();
            for invocation in checkpoint.invocations {
                if inner.index.contains_key(&invocation.call_id) {
                    return Err(ProtocolViolation::DuplicateCallId(invocation.call_id).into());
                }
                let idx = inner.entries.len();
                inner.index.insert(invocation.call_id.clone(), idx);
                inner.entries.push(invocation);
            }
        }
        Ok(ledger)
    }

    /// Serializable copy of the current contents
    pub fn checkpoint(&self) -> LedgerCheckpoint {
        LedgerCheckpoint {
            invocations: self.snapshot(),
        }
    }

    /// Register a new call in state `partial-call`
    pub fn register(
        &self,
        call_id: &str,
        tool_name: &str,
        domain: ExecutionDomain,
    ) -> Result<(), LedgerError> {
        self.write(|inner| {
            if inner.closed {
                return Err(ProtocolViolation::TurnClosed(call_id.to_string()).into());
            }
            if inner.index.contains_key(call_id) {
                return Err(ProtocolViolation::DuplicateCallId(call_id.to_string()).into());
            }
            let idx = inner.entries.len();
            inner.index.insert(call_id.to_string(), idx);
            inner
                .entries
                .push(ToolInvocation::partial(call_id, tool_name, domain));
            Ok(())
        })
    }

    /// Move a call from `partial-call` to `call`.
    ///
    /// Arguments failing shape validation mark the invocation failed and
    /// return `LedgerError::Call`.
    pub fn set_arguments(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
    ) -> Result<(), LedgerError> {
        let registry = Arc::clone(&self.registry);
        self.write(|inner| {
            let entry = inner.entry_mut(call_id)?;
            match entry.state {
                InvocationState::PartialCall => {}
                InvocationState::Call => {
                    return Err(ProtocolViolation::ArgumentsAlreadySet(call_id.to_string()).into());
                }
                InvocationState::Result => {
                    return Err(ProtocolViolation::ResultAlreadySet(call_id.to_string()).into());
                }
            }

            match registry.validate(&entry.tool_name, &arguments) {
                Ok(()) => {
                    entry.arguments = Some(arguments);
                    entry.state = InvocationState::Call;
                    Ok(())
                }
                Err(error) => {
                    entry.arguments = Some(arguments);
                    entry.state = InvocationState::Result;
                    entry.result = Some(ToolResult::failed(&error));
                    inner.failures.push((call_id.to_string(), error.clone()));
                    Err(error.into())
                }
            }
        })
    }

    /// Move a call from `call` to `result`. Fails if the result was already
    /// set (whatever the value), the id is unknown or arguments are missing.
    pub fn set_result(&self, call_id: &str, result: ToolResult) -> Result<(), LedgerError> {
        self.write(|inner| {
            let entry = inner.entry_mut(call_id)?;
            match entry.state {
                InvocationState::PartialCall => {
                    return Err(ProtocolViolation::ArgumentsNotSet(call_id.to_string()).into());
                }
                InvocationState::Result => {
                    return Err(ProtocolViolation::ResultAlreadySet(call_id.to_string()).into());
                }
                InvocationState::Call => {}
            }

            let failure = result.is_error.then(|| CallError::ToolExecution {
                message: error_message(&result),
            });
            entry.state = InvocationState::Result;
            entry.result = Some(result);
            entry.awaiting_client = false;
            if let Some(error) = failure {
                inner.failures.push((call_id.to_string(), error));
            }
            Ok(())
        })
    }

    /// Resolve a call as failed from any unresolved state
    pub fn fail(&self, call_id: &str, error: &CallError) -> Result<(), LedgerError> {
        self.write(|inner| {
            let entry = inner.entry_mut(call_id)?;
            if entry.state == InvocationState::Result {
                return Err(ProtocolViolation::ResultAlreadySet(call_id.to_string()).into());
            }
            entry.state = InvocationState::Result;
            entry.result = Some(ToolResult::failed(error));
            entry.awaiting_client = false;
            inner.failures.push((call_id.to_string(), error.clone()));
            Ok(())
        })
    }

    /// Mark a client-side call as handed off and waiting for a result
    pub fn defer_to_client(&self, call_id: &str) -> Result<PendingClientCall, LedgerError> {
        self.write(|inner| {
            let entry = inner.entry_mut(call_id)?;
            if entry.domain != ExecutionDomain::Client {
                return Err(ProtocolViolation::NotClientSide(call_id.to_string()).into());
            }
            match entry.state {
                InvocationState::PartialCall => {
                    Err(ProtocolViolation::ArgumentsNotSet(call_id.to_string()).into())
                }
                InvocationState::Result => {
                    Err(ProtocolViolation::ResultAlreadySet(call_id.to_string()).into())
                }
                InvocationState::Call => {
                    entry.awaiting_client = true;
                    Ok(pending_call(entry))
                }
            }
        })
    }

    /// Store an externally supplied result for a client-side call
    pub fn supply_client_result(&self, call_id: &str, result: ToolResult) -> Result<(), LedgerError> {
        {
            let inner = self.inner.lock();
            if !inner.closed {
                let idx = inner
                    .index
                    .get(call_id)
                    .ok_or_else(|| ProtocolViolation::UnknownCallId(call_id.to_string()))?;
                if inner.entries[*idx].domain != ExecutionDomain::Client {
                    return Err(ProtocolViolation::NotClientSide(call_id.to_string()).into());
                }
            }
        }
        self.set_result(call_id, result)
    }

    /// Copy of one invocation
    pub fn get(&self, call_id: &str) -> Option<ToolInvocation> {
        let inner = self.inner.lock();
        inner.index.get(call_id).map(|&i| inner.entries[i].clone())
    }

    /// Whether the call has a result
    pub fn is_resolved(&self, call_id: &str) -> bool {
        self.get(call_id).is_some_and(|i| i.is_resolved())
    }

    /// Copy of all invocations in registration order
    pub fn snapshot(&self) -> Vec<ToolInvocation> {
        self.inner.lock().entries.clone()
    }

    /// Number of invocations not yet in state `result`
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| !e.is_resolved())
            .count()
    }

    /// True iff every registered invocation is in state `result`.
    /// Vacuously true for a turn without tool calls.
    pub fn all_resolved(&self) -> bool {
        self.pending_count() == 0
    }

    /// Client-side calls handed off and still waiting for a result
    pub fn pending_client_calls(&self) -> Vec<PendingClientCall> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.awaiting_client && !e.is_resolved())
            .map(pending_call)
            .collect()
    }

    /// First per-call failure recorded in this turn
    pub fn first_failure(&self) -> Option<(String, CallError)> {
        self.inner.lock().failures.first().cloned()
    }

    /// Number of invocations
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no invocation was registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to write notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Mark the turn as no longer live. Later writes are rejected.
    pub fn close(&self) {
        self.write(|inner| {
            inner.closed = true;
        });
    }

    /// Whether the turn was closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn write<T>(&self, f: impl FnOnce(&mut LedgerInner) -> T) -> T {
        let (out, revision) = {
            let mut inner = self.inner.lock();
            let out = f(&mut inner);
            inner.revision += 1;
            (out, inner.revision)
        };
        self.changes.send_replace(revision);
        out
    }
}

fn pending_call(entry: &ToolInvocation) -> PendingClientCall {
    PendingClientCall {
        call_id: entry.call_id.clone(),
        tool_name: entry.tool_name.clone(),
        arguments: entry.arguments.clone().unwrap_or(serde_json::Value::Null),
    }
}

fn error_message(result: &ToolResult) -> String {
    result
        .value
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| result.text_content())
}
