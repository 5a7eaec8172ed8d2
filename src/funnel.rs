//! Event funnel: many agents in, one consumer loop out.
//!
//! Agents hold cheap [`EventSender`] clones and push events into a bounded
//! queue; a full queue blocks the sending agent. [`EventFunnel::process`]
//! drains the queue on a single task and hands every event to every sink in
//! registration order before looking at the next one, so sinks are never
//! called concurrently and need no internal locking.

use crate::event::Event;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Consumer of agent events, e.g. console output or a metrics exporter
pub trait MetricsSink: Send {
    /// Update internal state with one event
    fn consume(&mut self, event: &Event);

    /// Periodic hook, driven by the funnel loop
    fn tick(&mut self) {}

    /// Called once after the last event
    fn finish(&mut self) {}
}

/// Handle agents use to emit events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Queue an event, waiting while the funnel is full.
    pub async fn emit(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            debug!("event funnel closed, dropping event");
        }
    }
}

/// Single-consumer event pipeline
pub struct EventFunnel {
    rx: mpsc::Receiver<Event>,
    sinks: Vec<Box<dyn MetricsSink>>,
    tick_interval: Duration,
}

impl EventFunnel {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>, capacity: usize) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let funnel = Self {
            rx,
            sinks,
            tick_interval: Duration::from_secs(1),
        };
        (funnel, EventSender { tx })
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Deliver events until every sender is dropped, then finish the sinks
    /// and hand them back.
    pub async fn process(mut self) -> Vec<Box<dyn MetricsSink>> {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick fires immediately
        ticker.tick().await;

        let mut delivered = 0u64;
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(event) => {
                        for sink in self.sinks.iter_mut() {
                            sink.consume(&event);
                        }
                        delivered += 1;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    for sink in self.sinks.iter_mut() {
                        sink.tick();
                    }
                }
            }
        }

        for sink in self.sinks.iter_mut() {
            sink.finish();
        }
        debug!(delivered, "event funnel drained");
        self.sinks
    }
}
