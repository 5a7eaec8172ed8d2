//! The seam between agents and a broker.
//!
//! A [`Connector`] opens one [`Session`] per agent. Each session method
//! resolves when the broker has acknowledged the operation (or, for QoS 0
//! publishes, when the packet has been written). Publications the broker
//! delivers arrive separately on the connection's `inbound` channel, which
//! also reports when the connection breaks.

use crate::credentials::Credential;
use bytes::Bytes;
use rumqttc::QoS;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection refused by broker: {0}")]
    Refused(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The broker answered, but refused the operation
    #[error("rejected by broker: {0}")]
    Rejected(String),
    /// The connection is gone; no further operation can succeed
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Traffic the broker pushes to a connected agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message { topic: String, payload: Bytes },
    Closed { reason: String },
}

/// A live broker connection
pub struct Connection<S> {
    pub session: S,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens broker connections; shared by all agents of a run
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Connection<Self::Session>, ConnectError>> + Send;
}

/// Request side of one agent's connection. Operations are issued one at a time.
pub trait Session: Send + 'static {
    fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn unsubscribe(&mut self, filter: &str) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn disconnect(self) -> impl Future<Output = ()> + Send;
}
