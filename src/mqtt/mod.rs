//! rumqttc-backed broker connections.
//!
//! Every session owns an event loop task. The task forwards incoming
//! publications to the agent and turns outgoing packet ids and broker
//! acknowledgements into [`Notice`]s, which the session uses to match a
//! request with its ack.

pub mod tls;

use crate::config::{BrokerAddr, RunConfig};
use crate::connection::{ConnectError, Connection, Connector, Inbound, Session, SessionError};
use crate::credentials::Credential;
use crate::error::Result;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Request queue depth between client handle and event loop
const REQUEST_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 256 * 1024;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Subscribe,
    Unsubscribe,
    Publish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    SubAck,
    UnsubAck,
    PubAck,
    PubComp,
}

#[derive(Debug)]
enum Notice {
    Sent { op: Op, pkid: u16 },
    Acked { ack: Ack, pkid: u16, refused: bool },
}

/// Connects agents to an MQTT broker over TCP or TLS
pub struct MqttConnector {
    broker: BrokerAddr,
    keep_alive: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl MqttConnector {
    pub fn new(broker: BrokerAddr, keep_alive: Duration, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            broker,
            keep_alive,
            tls,
        }
    }

    /// Build the connector for a run, including the shared TLS config.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let tls = tls::client_config(&config.tls, config.nss_key_log.as_deref())?;
        Ok(Self::new(config.broker.clone(), config.keep_alive, tls))
    }

    fn options(&self, credential: &Credential) -> MqttOptions {
        let mut options =
            MqttOptions::new(&credential.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if !credential.username.is_empty() {
            options.set_credentials(&credential.username, &credential.password);
        }
        if let Some(tls) = &self.tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::clone(tls))));
        }
        options
    }

    /// Poll until the broker answers the CONNECT
    async fn await_connack(eventloop: &mut EventLoop) -> std::result::Result<(), ConnectError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(ConnectError::Refused(format!("{:?}", ack.code)));
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectError::Refused(format!("{:?}", code)));
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("Too many open files") {
                        warn!("Connection failed: Too many open files. Try: ulimit -n 65535");
                    }
                    return Err(ConnectError::Transport(err_str));
                }
            }
        }
    }
}

impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(
        &self,
        credential: &Credential,
    ) -> std::result::Result<Connection<MqttSession>, ConnectError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(credential), REQUEST_CAPACITY);

        Self::await_connack(&mut eventloop).await?;
        debug!(client_id = %credential.client_id, broker = %self.broker, "connected");

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client_id = credential.client_id.clone();
        let driver = tokio::spawn(async move {
            drive(&mut eventloop, notice_tx, inbound_tx, client_id).await
        });

        Ok(Connection {
            session: MqttSession {
                client,
                notices: notice_rx,
                driver,
            },
            inbound: inbound_rx,
        })
    }
}

/// Event loop task for one connection
async fn drive(
    eventloop: &mut EventLoop,
    notices: mpsc::UnboundedSender<Notice>,
    inbound: mpsc::UnboundedSender<Inbound>,
    client_id: String,
) {
    loop {
        let notice = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(client_id = %client_id, topic = %publish.topic, "received message");
                let _ = inbound.send(Inbound::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                });
                continue;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => Notice::Acked {
                ack: Ack::SubAck,
                pkid: ack.pkid,
                refused: ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure)),
            },
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => Notice::Acked {
                ack: Ack::UnsubAck,
                pkid: ack.pkid,
                refused: false,
            },
            Ok(Event::Incoming(Packet::PubAck(ack))) => Notice::Acked {
                ack: Ack::PubAck,
                pkid: ack.pkid,
                refused: false,
            },
            Ok(Event::Incoming(Packet::PubComp(ack))) => Notice::Acked {
                ack: Ack::PubComp,
                pkid: ack.pkid,
                refused: false,
            },
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => Notice::Sent {
                op: Op::Subscribe,
                pkid,
            },
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => Notice::Sent {
                op: Op::Unsubscribe,
                pkid,
            },
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => Notice::Sent {
                op: Op::Publish,
                pkid,
            },
            Ok(_) => continue,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "connection closed");
                let _ = inbound.send(Inbound::Closed {
                    reason: e.to_string(),
                });
                break;
            }
        };

        if notices.send(notice).is_err() {
            // session dropped without disconnecting
            break;
        }
    }
}

/// One agent's rumqttc connection
pub struct MqttSession {
    client: AsyncClient,
    notices: mpsc::UnboundedReceiver<Notice>,
    driver: JoinHandle<()>,
}

impl MqttSession {
    /// Forget notices left over from an earlier request that timed out.
    fn discard_stale(&mut self) {
        while self.notices.try_recv().is_ok() {}
    }

    async fn next_notice(&mut self) -> std::result::Result<Notice, SessionError> {
        self.notices
            .recv()
            .await
            .ok_or_else(|| SessionError::ConnectionLost("event loop stopped".to_string()))
    }

    async fn await_sent(&mut self, op: Op) -> std::result::Result<u16, SessionError> {
        loop {
            if let Notice::Sent { op: sent, pkid } = self.next_notice().await? {
                if sent == op {
                    return Ok(pkid);
                }
            }
        }
    }

    async fn await_ack(&mut self, ack: Ack, pkid: u16) -> std::result::Result<bool, SessionError> {
        loop {
            if let Notice::Acked {
                ack: got,
                pkid: got_pkid,
                refused,
            } = self.next_notice().await?
            {
                if got == ack && got_pkid == pkid {
                    return Ok(refused);
                }
            }
        }
    }
}

fn client_error(e: rumqttc::ClientError) -> SessionError {
    SessionError::ConnectionLost(e.to_string())
}

impl Session for MqttSession {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> std::result::Result<(), SessionError> {
        self.discard_stale();
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(client_error)?;

        let pkid = self.await_sent(Op::Subscribe).await?;
        if self.await_ack(Ack::SubAck, pkid).await? {
            return Err(SessionError::Rejected(format!(
                "subscription to {} refused",
                filter
            )));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> std::result::Result<(), SessionError> {
        self.discard_stale();
        self.client.unsubscribe(filter).await.map_err(client_error)?;

        let pkid = self.await_sent(Op::Unsubscribe).await?;
        self.await_ack(Ack::UnsubAck, pkid).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> std::result::Result<(), SessionError> {
        self.discard_stale();
        self.client
            .publish_bytes(topic, qos, retain, payload)
            .await
            .map_err(client_error)?;

        let pkid = self.await_sent(Op::Publish).await?;
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.await_ack(Ack::PubAck, pkid).await?;
            }
            QoS::ExactlyOnce => {
                self.await_ack(Ack::PubComp, pkid).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(mut self) {
        let _ = self.client.disconnect().await;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut self.driver)
            .await
            .is_err()
        {
            self.driver.abort();
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
