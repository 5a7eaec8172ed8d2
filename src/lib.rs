//! MQTT broker load testing.
//!
//! Many agents replay a timed scenario against a broker while their events
//! flow through a single funnel into metrics sinks.

pub mod agent;
pub mod config;
pub mod connection;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod event;
pub mod funnel;
pub mod logging;
pub mod metrics;
pub mod mqtt;
pub mod reference;
pub mod scenario;

pub use agent::{Agent, AgentContext};
pub use config::{AgentLogs, BrokerAddr, RunConfig, TlsMode};
pub use connection::{ConnectError, Connection, Connector, Inbound, Session, SessionError};
pub use controller::{AgentController, RunSummary};
pub use credentials::{Credential, CredentialPool, CredentialProvider, FixedCredentials, Identity};
pub use error::{Error, Result};
pub use event::{AgentState, AgentTag, CompletenessReport, Event, EventKind, Outcome};
pub use funnel::{EventFunnel, EventSender, MetricsSink};
pub use reference::ReferenceSet;
pub use scenario::{Action, ActionKind, Scenario};
