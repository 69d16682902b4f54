//! Roundtrip controller: decides whether to re-invoke the model

use serde::{Deserialize, Serialize};
use volley_ai::{FinishReason, Usage};

use crate::error::{Error, Result};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundtripState {
    /// Waiting for the model stream of the current turn
    AwaitingModel,
    /// The turn requested tool calls that are not all resolved
    AwaitingTools,
    /// Every tool call is resolved; the next step is a re-invocation
    ReadyToContinue,
    /// The model finished without requesting tools
    TerminalStop,
    /// Tools resolved but the automatic roundtrip budget is spent
    TerminalBudgetExhausted,
    /// The session ended on a structural error
    TerminalError,
    /// The caller aborted the session
    TerminalCancelled,
}

impl RoundtripState {
    /// Check whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundtripState::TerminalStop
                | RoundtripState::TerminalBudgetExhausted
                | RoundtripState::TerminalError
                | RoundtripState::TerminalCancelled
        )
    }
}

/// Decision taken in `ReadyToContinue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Re-invoke the model; `roundtrip` is the 1-based automatic roundtrip number
    Continue { roundtrip: u32 },
    /// The budget is spent
    BudgetExhausted,
}

/// State machine deciding when a session re-invokes the model.
///
/// The automatic roundtrip counter is compared against the budget in
/// exactly one place, `advance`, so no arrival order of tool results can
/// push it past the limit.
#[derive(Debug, Clone)]
pub struct RoundtripController {
    state: RoundtripState,
    max_roundtrips: u32,
    roundtrips: u32,
    last_finish: Option<FinishReason>,
}

impl RoundtripController {
    /// Start a session waiting for the first model turn
    pub fn new(max_roundtrips: u32) -> Self {
        Self {
            state: RoundtripState::AwaitingModel,
            max_roundtrips,
            roundtrips: 0,
            last_finish: None,
        }
    }

    /// Start a resumed session from a turn that requested tools
    pub fn resumed(max_roundtrips: u32, all_resolved: bool) -> Self {
        let state = if all_resolved {
            RoundtripState::ReadyToContinue
        } else {
            RoundtripState::AwaitingTools
        };
        Self {
            state,
            last_finish: Some(FinishReason::ToolCalls),
            ..Self::new(max_roundtrips)
        }
    }

    pub fn state(&self) -> RoundtripState {
        self.state
    }

    /// Automatic roundtrips performed so far
    pub fn roundtrips(&self) -> u32 {
        self.roundtrips
    }

    pub fn max_roundtrips(&self) -> u32 {
        self.max_roundtrips
    }

    /// Finish reason of the most recent turn
    pub fn last_finish(&self) -> Option<FinishReason> {
        self.last_finish
    }

    /// The model stream ended with `reason`.
    ///
    /// `Stop` and `Length` end the session; `Error` is terminal; a
    /// `ToolCalls` finish waits for tools unless they already resolved.
    pub fn on_finish(&mut self, reason: FinishReason, all_resolved: bool) -> Result<RoundtripState> {
        self.ensure(RoundtripState::AwaitingModel, "finish")?;
        self.last_finish = Some(reason);
        self.state = match reason {
            FinishReason::Stop | FinishReason::Length => RoundtripState::TerminalStop,
            FinishReason::Error => RoundtripState::TerminalError,
            FinishReason::ToolCalls if all_resolved => RoundtripState::ReadyToContinue,
            FinishReason::ToolCalls => RoundtripState::AwaitingTools,
        };
        Ok(self.state)
    }

    /// A tool result arrived. Idempotent while tools are still pending.
    pub fn on_tools_changed(&mut self, all_resolved: bool) -> Result<RoundtripState> {
        self.ensure(RoundtripState::AwaitingTools, "tool result")?;
        if all_resolved {
            self.state = RoundtripState::ReadyToContinue;
        }
        Ok(self.state)
    }

    /// Take the re-invocation decision
    pub fn advance(&mut self) -> Result<Continuation> {
        self.ensure(RoundtripState::ReadyToContinue, "advance")?;
        if self.roundtrips >= self.max_roundtrips {
            self.state = RoundtripState::TerminalBudgetExhausted;
            return Ok(Continuation::BudgetExhausted);
        }
        self.roundtrips += 1;
        self.state = RoundtripState::AwaitingModel;
        Ok(Continuation::Continue {
            roundtrip: self.roundtrips,
        })
    }

    /// End the session on a structural error
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RoundtripState::TerminalError;
        }
    }

    /// End the session on caller request
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = RoundtripState::TerminalCancelled;
        }
    }

    fn ensure(&self, state: RoundtripState, event: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state,
                event,
            })
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalState {
    Stop,
    BudgetExhausted,
    Error,
    Cancelled,
}

impl TerminalState {
    /// Map a terminal roundtrip state
    pub fn from_state(state: RoundtripState) -> Option<Self> {
        match state {
            RoundtripState::TerminalStop => Some(TerminalState::Stop),
            RoundtripState::TerminalBudgetExhausted => Some(TerminalState::BudgetExhausted),
            RoundtripState::TerminalError => Some(TerminalState::Error),
            RoundtripState::TerminalCancelled => Some(TerminalState::Cancelled),
            _ => None,
        }
    }
}

/// Summary of a finished session run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// Final state
    pub state: TerminalState,
    /// Automatic roundtrips performed
    pub roundtrips: u32,
    /// Model turns consumed
    pub turns: u32,
    /// Finish reason of the last turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Accumulated usage for the run
    pub usage: Usage,
    /// Error message for `TerminalState::Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
