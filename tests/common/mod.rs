#![allow(dead_code)]

use bytes::Bytes;
use mq_hammer::config::{BrokerAddr, RunConfig, TlsMode};
use mq_hammer::connection::{ConnectError, Connection, Connector, Inbound, Session, SessionError};
use mq_hammer::credentials::Credential;
use mq_hammer::event::{ActionType, Event, EventKind, Outcome};
use mq_hammer::funnel::{EventFunnel, EventSender, MetricsSink};
use mq_hammer::reference::topic_matches;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Client {
    client_id: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct BrokerState {
    retained: HashMap<String, Bytes>,
    clients: HashMap<u64, Client>,
    next_id: u64,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &Bytes) {
        for client in self.clients.values() {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = client.tx.send(Inbound::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// In-memory broker with injectable failures
#[derive(Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
    refused_users: HashSet<String>,
    rejected_filters: HashSet<String>,
    unacked_filters: HashSet<String>,
    fatal_topics: HashSet<String>,
    connect_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(self, topic: &str, payload: &str) -> Self {
        self.state
            .lock()
            .retained
            .insert(topic.to_string(), Bytes::from(payload.to_string()));
        self
    }

    /// CONNECT from this username is refused
    pub fn refuse_user(mut self, username: &str) -> Self {
        self.refused_users.insert(username.to_string());
        self
    }

    /// SUBACK for this filter carries a failure code
    pub fn reject_filter(mut self, filter: &str) -> Self {
        self.rejected_filters.insert(filter.to_string());
        self
    }

    /// SUBACK for this filter never arrives
    pub fn never_ack(mut self, filter: &str) -> Self {
        self.unacked_filters.insert(filter.to_string());
        self
    }

    /// Publishing to this topic breaks the connection
    pub fn fatal_topic(mut self, topic: &str) -> Self {
        self.fatal_topics.insert(topic.to_string());
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn connected_clients(&self) -> usize {
        self.state.lock().clients.len()
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, credential: &Credential) -> Result<Connection<MockSession>, ConnectError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.refused_users.contains(&credential.username) {
            return Err(ConnectError::Refused("BadUserNamePassword".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.clients.insert(
                id,
                Client {
                    client_id: credential.client_id.clone(),
                    filters: Vec::new(),
                    tx,
                },
            );
            id
        };

        Ok(Connection {
            session: MockSession {
                id,
                state: Arc::clone(&self.state),
                rejected_filters: self.rejected_filters.clone(),
                unacked_filters: self.unacked_filters.clone(),
                fatal_topics: self.fatal_topics.clone(),
            },
            inbound: rx,
        })
    }
}

pub struct MockSession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    rejected_filters: HashSet<String>,
    unacked_filters: HashSet<String>,
    fatal_topics: HashSet<String>,
}

impl Session for MockSession {
    async fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), SessionError> {
        if self.unacked_filters.contains(filter) {
            std::future::pending::<()>().await;
        }
        if self.rejected_filters.contains(filter) {
            return Err(SessionError::Rejected(format!("subscription to {} refused", filter)));
        }

        let mut state = self.state.lock();
        let retained: Vec<(String, Bytes)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        let client = state
            .clients
            .get_mut(&self.id)
            .ok_or_else(|| SessionError::ConnectionLost("not connected".to_string()))?;
        client.filters.push(filter.to_string());
        for (topic, payload) in retained {
            let _ = client.tx.send(Inbound::Message { topic, payload });
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.filters.retain(|f| f != filter);
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        _qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if self.fatal_topics.contains(topic) {
            if let Some(client) = state.clients.remove(&self.id) {
                let _ = client.tx.send(Inbound::Closed {
                    reason: "connection reset by peer".to_string(),
                });
            }
            return Err(SessionError::ConnectionLost("connection reset by peer".to_string()));
        }
        if retain {
            state.retained.insert(topic.to_string(), payload.clone());
        }
        state.route(topic, &payload);
        Ok(())
    }

    async fn disconnect(self) {
        self.state.lock().clients.remove(&self.id);
    }
}

/// Sink that keeps every event it sees
#[derive(Clone, Default)]
pub struct Collector {
    pub events: Arc<Mutex<Vec<Event>>>,
    pub finished: Arc<Mutex<bool>>,
}

impl Collector {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl MetricsSink for Collector {
    fn consume(&mut self, event: &Event) {
        self.events.lock().push(event.clone());
    }

    fn finish(&mut self) {
        *self.finished.lock() = true;
    }
}

/// Funnel with one collector, running on its own task
pub fn collecting_funnel() -> (Collector, EventSender, JoinHandle<Vec<Box<dyn MetricsSink>>>) {
    let collector = Collector::default();
    let (funnel, sender) = EventFunnel::new(vec![Box::new(collector.clone())], 16);
    (collector, sender, tokio::spawn(funnel.process()))
}

pub fn config(agents: usize) -> RunConfig {
    let broker = BrokerAddr {
        host: "broker.test".to_string(),
        port: 1883,
    };
    let mut config = RunConfig::new(broker, TlsMode::Disabled, agents);
    config.spawn_delay = Duration::from_millis(10);
    config
}

pub fn credential(client_id: &str) -> Credential {
    Credential {
        client_id: client_id.to_string(),
        username: "user".to_string(),
        password: "secret".to_string(),
    }
}

/// `(action, outcome)` of every completed action, in emission order
pub fn actions(events: &[Event]) -> Vec<(ActionType, Outcome)> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ActionCompleted {
                action, outcome, ..
            } => Some((*action, outcome.clone())),
            _ => None,
        })
        .collect()
}

pub fn count<F: Fn(&EventKind) -> bool>(events: &[Event], pred: F) -> usize {
    events.iter().filter(|event| pred(&event.kind)).count()
}
