use super::{format_bytes, format_count, format_latency_ns, LatencyHistogram};
use crate::event::{ActionType, AgentState, Event, EventKind, Outcome};
use crate::funnel::MetricsSink;
use std::collections::HashSet;
use std::io::{self, Write};
use std::time::Instant;

/// Counts for one reporting window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub publishes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub messages: u64,
    pub bytes: u64,
    pub checks_complete: u64,
    pub checks_incomplete: u64,
}

impl Tally {
    fn merge(&mut self, other: &Tally) {
        self.subscribes += other.subscribes;
        self.unsubscribes += other.unsubscribes;
        self.publishes += other.publishes;
        self.errors += other.errors;
        self.timeouts += other.timeouts;
        self.messages += other.messages;
        self.bytes += other.bytes;
        self.checks_complete += other.checks_complete;
        self.checks_incomplete += other.checks_incomplete;
    }
}

/// Agent lifecycle counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentCounts {
    pub connected: u64,
    pub connect_failures: u64,
    pub connections_lost: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Human-readable status line once per second plus a final summary
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
    started: Instant,
    window: Tally,
    totals: Tally,
    agents: AgentCounts,
    // ordinals of agents with a live connection
    up: HashSet<usize>,
    window_latency: LatencyHistogram,
    action_latency: LatencyHistogram,
    completion: LatencyHistogram,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            started: Instant::now(),
            window: Tally::default(),
            totals: Tally::default(),
            agents: AgentCounts::default(),
            up: HashSet::new(),
            window_latency: LatencyHistogram::new(),
            action_latency: LatencyHistogram::new(),
            completion: LatencyHistogram::new(),
        }
    }

    /// Totals over the whole run, including the current window
    pub fn totals(&self) -> Tally {
        let mut totals = self.totals.clone();
        totals.merge(&self.window);
        totals
    }

    pub fn agents(&self) -> &AgentCounts {
        &self.agents
    }

    /// Agents connected right now
    pub fn running(&self) -> usize {
        self.up.len()
    }

    fn status_line(&self) -> String {
        let w = &self.window;
        let p99 = if self.window_latency.count() > 0 {
            format_latency_ns(self.window_latency.percentile_ns(99.0))
        } else {
            "-".to_string()
        };
        format!(
            "[{:>6}s] agents {} up {} failed | sub {} unsub {} pub {} | rx {} ({}) | err {} timeout {} | ref {}/{} | p99 {}",
            self.started.elapsed().as_secs(),
            self.running(),
            self.agents.connect_failures + self.agents.connections_lost,
            w.subscribes,
            w.unsubscribes,
            w.publishes,
            format_count(w.messages),
            format_bytes(w.bytes),
            w.errors,
            w.timeouts,
            w.checks_complete,
            w.checks_complete + w.checks_incomplete,
            p99,
        )
    }

    fn write_summary(&mut self) -> io::Result<()> {
        let totals = self.totals();
        let agents = self.agents.clone();
        let latency = self.action_latency.exact_percentiles();
        let completion = self.completion.exact_percentiles();
        let out = &mut self.out;

        writeln!(out)?;
        writeln!(out, "═══════════════════════════════════════════════════════════════")?;
        writeln!(out, "                        RUN SUMMARY                             ")?;
        writeln!(out, "═══════════════════════════════════════════════════════════════")?;
        writeln!(out)?;
        writeln!(out, "  Duration:        {:.1}s", self.started.elapsed().as_secs_f64())?;
        writeln!(
            out,
            "  Agents:          {} connected, {} completed, {} failed, {} cancelled",
            agents.connected, agents.completed, agents.failed, agents.cancelled
        )?;
        writeln!(
            out,
            "  Actions:         {} subscribe / {} unsubscribe / {} publish",
            totals.subscribes, totals.unsubscribes, totals.publishes
        )?;
        writeln!(
            out,
            "  Errors:          {} rejected, {} timed out",
            totals.errors, totals.timeouts
        )?;
        writeln!(
            out,
            "  Received:        {} messages ({})",
            format_count(totals.messages),
            format_bytes(totals.bytes)
        )?;
        if totals.checks_complete + totals.checks_incomplete > 0 {
            writeln!(
                out,
                "  Reference:       {} complete, {} incomplete",
                totals.checks_complete, totals.checks_incomplete
            )?;
            if completion.count > 0 {
                writeln!(
                    out,
                    "  Completion:      P50 {}  P99 {}  max {}",
                    format_latency_ns(completion.p50_ns),
                    format_latency_ns(completion.p99_ns),
                    format_latency_ns(completion.max_ns)
                )?;
            }
        }
        if latency.count > 0 {
            writeln!(out)?;
            writeln!(out, "  Action latency:")?;
            writeln!(out, "    P50:           {}", format_latency_ns(latency.p50_ns))?;
            writeln!(out, "    P95:           {}", format_latency_ns(latency.p95_ns))?;
            writeln!(out, "    P99:           {}", format_latency_ns(latency.p99_ns))?;
            writeln!(out, "    P99.9:         {}", format_latency_ns(latency.p999_ns))?;
        }
        writeln!(out)?;
        out.flush()
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for ConsoleSink {
    fn consume(&mut self, event: &Event) {
        match &event.kind {
            EventKind::Connected { .. } => {
                self.agents.connected += 1;
                self.up.insert(event.agent.ordinal);
            }
            EventKind::ConnectFailed { .. } => self.agents.connect_failures += 1,
            EventKind::ConnectionLost { .. } => {
                self.agents.connections_lost += 1;
                self.up.remove(&event.agent.ordinal);
            }
            EventKind::ActionCompleted {
                action,
                outcome,
                latency,
                ..
            } => {
                match action {
                    ActionType::Subscribe => self.window.subscribes += 1,
                    ActionType::Unsubscribe => self.window.unsubscribes += 1,
                    ActionType::Publish => self.window.publishes += 1,
                }
                match outcome {
                    Outcome::Ok => {
                        self.window_latency.record(*latency);
                        self.action_latency.record(*latency);
                    }
                    Outcome::Rejected(_) => self.window.errors += 1,
                    Outcome::TimedOut => self.window.timeouts += 1,
                }
            }
            EventKind::MessageReceived { bytes, .. } => {
                self.window.messages += 1;
                self.window.bytes += *bytes as u64;
            }
            EventKind::ReferenceChecked(report) => {
                if report.is_complete() {
                    self.window.checks_complete += 1;
                    self.completion.record(report.elapsed);
                } else {
                    self.window.checks_incomplete += 1;
                }
            }
            EventKind::Finished { state } => {
                self.up.remove(&event.agent.ordinal);
                match state {
                    AgentState::Completed => self.agents.completed += 1,
                    AgentState::Failed => self.agents.failed += 1,
                    AgentState::Cancelled => self.agents.cancelled += 1,
                }
            }
        }
    }

    fn tick(&mut self) {
        let line = self.status_line();
        let _ = writeln!(self.out, "{}", line);

        let window = std::mem::take(&mut self.window);
        self.totals.merge(&window);
        self.window_latency.reset();
    }

    fn finish(&mut self) {
        let _ = self.write_summary();
    }
}
