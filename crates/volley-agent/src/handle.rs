//! A cloneable handle for poking a session from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use volley_ai::{CallError, ToolResult};

use crate::error::ProtocolViolation;
use crate::events::SessionEvent;
use crate::ledger::{InvocationLedger, LedgerError, PendingClientCall};

/// A cloneable handle for poking a session from external code.
///
/// This is the client result boundary: results for client-side calls enter
/// the engine here, from any task. All fields are `Arc`-wrapped, so cloning
/// is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) live_ledger: Arc<Mutex<Option<Arc<InvocationLedger>>>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
    pub(crate) event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn new(event_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            live_ledger: Arc::new(Mutex::new(None)),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            event_tx,
        }
    }

    pub(crate) fn attach(&self, ledger: Arc<InvocationLedger>) {
        *self.live_ledger.lock() = Some(ledger);
    }

    pub(crate) fn detach(&self) {
        self.live_ledger.lock().take();
    }

    fn ledger(&self) -> Result<Arc<InvocationLedger>, ProtocolViolation> {
        self.live_ledger
            .lock()
            .clone()
            .ok_or(ProtocolViolation::TurnNotLive)
    }

    /// Supply the result of a client-side call.
    ///
    /// Fails with a protocol violation for unknown ids, server-side calls,
    /// calls that already have a result and calls of a closed turn.
    pub fn supply_client_result(
        &self,
        call_id: &str,
        value: serde_json::Value,
    ) -> Result<(), ProtocolViolation> {
        self.supply(call_id, ToolResult::value(value))
    }

    /// Report that a client-side call failed
    pub fn supply_client_error(
        &self,
        call_id: &str,
        message: impl Into<String>,
    ) -> Result<(), ProtocolViolation> {
        self.supply(
            call_id,
            ToolResult::failed(&CallError::ToolExecution {
                message: message.into(),
            }),
        )
    }

    fn supply(&self, call_id: &str, result: ToolResult) -> Result<(), ProtocolViolation> {
        let ledger = self.ledger()?;
        match ledger.supply_client_result(call_id, result) {
            Ok(()) => {
                tracing::debug!("Client result accepted for '{}'", call_id);
                let _ = self.event_tx.send(SessionEvent::ClientResultReceived {
                    call_id: call_id.to_string(),
                });
                Ok(())
            }
            Err(LedgerError::Protocol(violation)) => {
                tracing::warn!("Rejected client result: {}", violation);
                Err(violation)
            }
            // Client results are never shape-validated, so no per-call error arises here
            Err(LedgerError::Call(error)) => {
                tracing::warn!("Client result for '{}' failed: {}", call_id, error);
                Ok(())
            }
        }
    }

    /// Client-side calls of the live turn that still wait for a result
    pub fn pending_client_calls(&self) -> Vec<PendingClientCall> {
        self.live_ledger
            .lock()
            .as_ref()
            .map(|l| l.pending_client_calls())
            .unwrap_or_default()
    }

    /// Abort the current run.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Wait until the session loop becomes idle (finishes running).
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until the session loop becomes idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether the session loop is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}
