//! One simulated client.
//!
//! An agent connects with its own credential, renders the shared scenario
//! for its identity and replays it against a clock anchored at the moment
//! its connection was accepted. Reference completeness checks run next to
//! the timeline: every successful subscribe opens a check that is fed by
//! incoming publications until all expected topics were seen, the check's
//! deadline passes, or the filter is unsubscribed.

use crate::config::RunConfig;
use crate::connection::{ConnectError, Connection, Connector, Inbound, Session, SessionError};
use crate::credentials::{Credential, Identity};
use crate::event::{ActionType, AgentState, AgentTag, CompletenessReport, Event, EventKind, Outcome};
use crate::funnel::EventSender;
use crate::reference::{Messages, ReferenceSet};
use crate::scenario::{Action, ActionKind, Scenario};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Everything agents of one run share
pub struct AgentContext<C> {
    pub config: Arc<RunConfig>,
    pub connector: Arc<C>,
    pub scenario: Arc<Scenario>,
    pub reference: Option<Arc<ReferenceSet>>,
    pub events: EventSender,
}

impl<C> Clone for AgentContext<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            scenario: Arc::clone(&self.scenario),
            reference: self.reference.clone(),
            events: self.events.clone(),
        }
    }
}

/// Reference data still expected for one subscription
struct PendingCheck {
    filter: String,
    expected: Arc<Messages>,
    seen: HashSet<String>,
    mismatched: usize,
    opened: Instant,
    deadline: Instant,
}

impl PendingCheck {
    /// Record a publication, returns true once every expected topic was seen.
    fn observe(&mut self, topic: &str, payload: &Bytes) -> bool {
        if let Some(expected) = self.expected.get(topic) {
            if self.seen.insert(topic.to_string()) && expected != payload {
                self.mismatched += 1;
            }
        }
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        self.seen.len() >= self.expected.len()
    }

    fn report(&self, now: Instant) -> CompletenessReport {
        CompletenessReport {
            filter: self.filter.clone(),
            expected: self.expected.len(),
            received: self.seen.len(),
            mismatched: self.mismatched,
            elapsed: now.saturating_duration_since(self.opened),
        }
    }
}

/// Timers further out than this never fire during a run
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn instant_after(base: Instant, offset: Duration) -> Instant {
    base.checked_add(offset.min(FAR_FUTURE)).unwrap_or(base)
}

/// Why the timeline stopped early
enum Abort {
    Cancelled,
    ConnectionLost(String),
}

pub struct Agent<C: Connector> {
    identity: Identity,
    credential: Credential,
    ctx: AgentContext<C>,
    cancel: CancellationToken,
    checks: Vec<PendingCheck>,
}

impl<C: Connector> Agent<C> {
    pub fn new(
        ordinal: usize,
        credential: Credential,
        ctx: AgentContext<C>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity: Identity::new(ordinal, &credential),
            credential,
            ctx,
            cancel,
            checks: Vec::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Run to a terminal state; the last event emitted is `Finished`.
    pub async fn run(mut self) -> AgentState {
        let state = self.execute().await;
        info!(client_id = %self.identity.client_id, state = %state, "agent finished");
        self.emit(EventKind::Finished { state }).await;
        state
    }

    fn tag(&self) -> AgentTag {
        AgentTag {
            ordinal: self.identity.ordinal,
            client_id: self.identity.client_id.clone(),
        }
    }

    async fn emit(&self, kind: EventKind) {
        self.ctx.events.emit(Event::new(self.tag(), kind)).await;
    }

    async fn execute(&mut self) -> AgentState {
        let Some(Connection {
            mut session,
            mut inbound,
        }) = self.connect().await
        else {
            return if self.cancel.is_cancelled() {
                AgentState::Cancelled
            } else {
                AgentState::Failed
            };
        };

        let state = match self.run_timeline(&mut session, &mut inbound).await {
            Ok(()) => AgentState::Completed,
            Err(Abort::Cancelled) => {
                debug!(client_id = %self.identity.client_id, "cancelled");
                AgentState::Cancelled
            }
            Err(Abort::ConnectionLost(error)) => {
                warn!(client_id = %self.identity.client_id, error = %error, "connection lost");
                self.emit(EventKind::ConnectionLost { error }).await;
                AgentState::Failed
            }
        };

        self.close_all_checks().await;
        session.disconnect().await;
        state
    }

    async fn connect(&self) -> Option<Connection<C::Session>> {
        debug!(client_id = %self.identity.client_id, broker = %self.ctx.config.broker, "connecting");
        let started = Instant::now();
        let attempt = timeout(
            self.ctx.config.connect_timeout,
            self.ctx.connector.connect(&self.credential),
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = attempt => result.unwrap_or(Err(ConnectError::TimedOut)),
        };

        match result {
            Ok(connection) => {
                let latency = started.elapsed();
                debug!(client_id = %self.identity.client_id, latency_ms = latency.as_millis() as u64, "connected");
                self.emit(EventKind::Connected { latency }).await;
                Some(connection)
            }
            Err(e) => {
                warn!(client_id = %self.identity.client_id, error = %e, "connect failed");
                self.emit(EventKind::ConnectFailed {
                    error: e.to_string(),
                })
                .await;
                None
            }
        }
    }

    async fn run_timeline(
        &mut self,
        session: &mut C::Session,
        inbound: &mut mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<(), Abort> {
        let actions = self.ctx.scenario.render(&self.identity);
        let start = Instant::now();
        let mut next = 0;

        loop {
            let due = actions.get(next).map(|action| instant_after(start, action.offset));
            let deadline = self.checks.iter().map(|check| check.deadline).min();
            if due.is_none() && deadline.is_none() {
                return self.drain(inbound).await;
            }

            // expired timers go first, a steady stream must not hold them off
            let now = Instant::now();
            if deadline.is_some_and(|at| at <= now) {
                self.close_expired_checks().await;
                continue;
            }
            if let Some(at) = due.filter(|at| *at <= now) {
                let action = &actions[next];
                next += 1;

                let cancel = self.cancel.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Abort::Cancelled),
                    result = self.perform(session, action, now.saturating_duration_since(at)) => result?,
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Abort::Cancelled),
                _ = sleep_until(deadline.unwrap_or(now)), if deadline.is_some() => {}
                _ = sleep_until(due.unwrap_or(now)), if due.is_some() => {}
                message = inbound.recv() => self.on_inbound(message).await?,
            }
        }
    }

    async fn on_inbound(&mut self, message: Option<Inbound>) -> Result<(), Abort> {
        match message {
            Some(Inbound::Message { topic, payload }) => {
                self.on_message(topic, payload).await;
                Ok(())
            }
            Some(Inbound::Closed { reason }) => Err(Abort::ConnectionLost(reason)),
            None => Err(Abort::ConnectionLost("connection closed".to_string())),
        }
    }

    /// Account for publications that arrived before the last action finished.
    async fn drain(&mut self, inbound: &mut mpsc::UnboundedReceiver<Inbound>) -> Result<(), Abort> {
        for _ in 0..inbound.len() {
            match inbound.try_recv() {
                Ok(message) => self.on_inbound(Some(message)).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Execute one action and report it. Only a lost connection is an error.
    async fn perform(
        &mut self,
        session: &mut C::Session,
        action: &Action,
        lag: Duration,
    ) -> Result<(), Abort> {
        let ack_timeout = self.ctx.config.ack_timeout;
        let started = Instant::now();
        trace!(client_id = %self.identity.client_id, action = action.kind.name(), topic = action.kind.topic(), "executing");

        let (action_type, result) = match &action.kind {
            ActionKind::Subscribe { filter, qos } => (
                ActionType::Subscribe,
                timeout(ack_timeout, session.subscribe(filter, *qos)).await,
            ),
            ActionKind::Unsubscribe { filter } => (
                ActionType::Unsubscribe,
                timeout(ack_timeout, session.unsubscribe(filter)).await,
            ),
            ActionKind::Publish {
                topic,
                payload,
                qos,
                retain,
            } => (
                ActionType::Publish,
                timeout(
                    ack_timeout,
                    session.publish(topic, Bytes::from(payload.clone()), *qos, *retain),
                )
                .await,
            ),
        };
        let latency = started.elapsed();

        let outcome = match result {
            Ok(Ok(())) => Outcome::Ok,
            Ok(Err(SessionError::Rejected(reason))) => Outcome::Rejected(reason),
            Ok(Err(SessionError::ConnectionLost(error))) => return Err(Abort::ConnectionLost(error)),
            Err(_) => Outcome::TimedOut,
        };
        if !outcome.is_ok() {
            debug!(
                client_id = %self.identity.client_id,
                action = action_type.as_str(),
                topic = action.kind.topic(),
                outcome = outcome.label(),
                "action failed"
            );
        }

        let succeeded = outcome.is_ok();
        self.emit(EventKind::ActionCompleted {
            action: action_type,
            topic: action.kind.topic().to_string(),
            outcome,
            latency,
            lag,
        })
        .await;

        match &action.kind {
            ActionKind::Subscribe { filter, .. } if succeeded => self.open_check(filter).await,
            ActionKind::Unsubscribe { filter } => self.close_checks_for(filter).await,
            _ => {}
        }
        Ok(())
    }

    async fn open_check(&mut self, filter: &str) {
        let Some(reference) = &self.ctx.reference else {
            return;
        };
        let expected = reference.get_messages(filter);
        let now = Instant::now();
        let check = PendingCheck {
            filter: filter.to_string(),
            expected,
            seen: HashSet::new(),
            mismatched: 0,
            opened: now,
            deadline: instant_after(now, self.ctx.config.reference_timeout),
        };

        if check.is_complete() {
            self.emit(EventKind::ReferenceChecked(check.report(now))).await;
        } else {
            trace!(client_id = %self.identity.client_id, filter, expected = check.expected.len(), "waiting for reference data");
            self.checks.push(check);
        }
    }

    async fn on_message(&mut self, topic: String, payload: Bytes) {
        let now = Instant::now();
        let mut done = Vec::new();
        let mut i = 0;
        while i < self.checks.len() {
            if self.checks[i].observe(&topic, &payload) {
                done.push(self.checks.swap_remove(i).report(now));
            } else {
                i += 1;
            }
        }

        self.emit(EventKind::MessageReceived {
            topic,
            bytes: payload.len(),
        })
        .await;
        for report in done {
            self.emit(EventKind::ReferenceChecked(report)).await;
        }
    }

    async fn close_expired_checks(&mut self) {
        let now = Instant::now();
        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.checks)
            .into_iter()
            .partition(|check| check.deadline <= now);
        self.checks = pending;
        for check in expired {
            let report = check.report(now);
            debug!(
                client_id = %self.identity.client_id,
                filter = %report.filter,
                missing = report.missing(),
                "reference data incomplete"
            );
            self.emit(EventKind::ReferenceChecked(report)).await;
        }
    }

    async fn close_checks_for(&mut self, filter: &str) {
        let now = Instant::now();
        let (closed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.checks)
            .into_iter()
            .partition(|check| check.filter == filter);
        self.checks = pending;
        for check in closed {
            self.emit(EventKind::ReferenceChecked(check.report(now))).await;
        }
    }

    /// Report whatever is still pending when the agent stops early
    async fn close_all_checks(&mut self) {
        let now = Instant::now();
        for check in std::mem::take(&mut self.checks) {
            self.emit(EventKind::ReferenceChecked(check.report(now))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(expected: &[(&str, &str)]) -> PendingCheck {
        let expected: Messages = expected
            .iter()
            .map(|(t, p)| (t.to_string(), Bytes::from(p.to_string())))
            .collect();
        let now = Instant::now();
        PendingCheck {
            filter: "/a/#".to_string(),
            expected: Arc::new(expected),
            seen: HashSet::new(),
            mismatched: 0,
            opened: now,
            deadline: now + Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn check_completes_when_all_topics_seen() {
        let mut check = check(&[("/a/1", "one"), ("/a/2", "two")]);

        assert!(!check.observe("/a/1", &Bytes::from_static(b"one")));
        // duplicates and unrelated topics change nothing
        assert!(!check.observe("/a/1", &Bytes::from_static(b"one")));
        assert!(!check.observe("/b", &Bytes::from_static(b"x")));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(check.observe("/a/2", &Bytes::from_static(b"two")));

        let report = check.report(Instant::now());
        assert_eq!(report.expected, 2);
        assert_eq!(report.received, 2);
        assert_eq!(report.mismatched, 0);
        assert_eq!(report.elapsed, Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_payload_counts_as_received() {
        let mut check = check(&[("/a/1", "one")]);
        assert!(check.observe("/a/1", &Bytes::from_static(b"changed")));

        let report = check.report(Instant::now());
        assert!(report.is_complete());
        assert_eq!(report.mismatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_expectation_is_complete() {
        let check = check(&[]);
        assert!(check.is_complete());
        assert_eq!(check.report(Instant::now()).expected, 0);
    }
}
