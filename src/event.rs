use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Agent that emitted an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTag {
    pub ordinal: usize,
    pub client_id: String,
}

/// How an agent ended. Connecting and running are visible through the
/// `Connected` and `ActionCompleted` events rather than as states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Completed,
    Failed,
    Cancelled,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scenario action types, used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Subscribe => "subscribe",
            ActionType::Unsubscribe => "unsubscribe",
            ActionType::Publish => "publish",
        }
    }
}

/// How a broker operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// The broker refused the operation
    Rejected(String),
    TimedOut,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Rejected(_) => "rejected",
            Outcome::TimedOut => "timeout",
        }
    }
}

/// Result of waiting for reference data after a subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletenessReport {
    pub filter: String,
    pub expected: usize,
    /// Distinct expected topics observed
    pub received: usize,
    /// Observed topics whose payload differs from the reference
    pub mismatched: usize,
    /// Time from subscribe until the last expected topic arrived, or until
    /// the check was closed when incomplete
    pub elapsed: Duration,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.received)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected {
        latency: Duration,
    },
    ConnectFailed {
        error: String,
    },
    ActionCompleted {
        action: ActionType,
        topic: String,
        outcome: Outcome,
        latency: Duration,
        /// How far behind its scheduled offset the action started
        lag: Duration,
    },
    MessageReceived {
        topic: String,
        bytes: usize,
    },
    ReferenceChecked(CompletenessReport),
    ConnectionLost {
        error: String,
    },
    Finished {
        state: AgentState,
    },
}

/// Telemetry record produced by one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub agent: AgentTag,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(agent: AgentTag, kind: EventKind) -> Self {
        Self {
            agent,
            at: Utc::now(),
            kind,
        }
    }
}
