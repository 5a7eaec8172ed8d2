use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_PLAIN_PORT: u16 = 1883;

/// The public eclipse test broker is shared; runs against it are capped.
const PUBLIC_TEST_BROKER: &str = "iot.eclipse.org";
const PUBLIC_TEST_BROKER_MAX_AGENTS: usize = 4;

/// Broker target resolved from `host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    /// Parse `host[:port]`, defaulting the port by transport.
    ///
    /// Bracketed IPv6 literals (`[::1]:1883`) are accepted; the brackets are
    /// stripped from the host.
    pub fn parse(addr: &str, tls: bool) -> Result<Self> {
        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };
        let invalid = || Error::BrokerAddress(addr.to_string());

        if addr.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match addr.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (addr, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn is_public_test_broker(&self) -> bool {
        self.host.contains(PUBLIC_TEST_BROKER)
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Transport security shared by every agent
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Plain TCP
    Disabled,
    /// TLS with native roots
    #[default]
    Verified,
    /// TLS without certificate or hostname validation
    Insecure,
}

impl TlsMode {
    pub fn from_flags(disable_tls: bool, insecure: bool) -> Self {
        match (disable_tls, insecure) {
            (true, _) => TlsMode::Disabled,
            (false, true) => TlsMode::Insecure,
            (false, false) => TlsMode::Verified,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }
}

/// Where agent logs go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentLogs {
    /// Agents emit nothing
    #[default]
    Silent,
    /// Agents log through the process logger
    Inherit,
    /// One file per agent, rendered from a template
    File(String),
}

impl AgentLogs {
    pub fn from_flag(flag: &str) -> Self {
        match flag {
            "" => AgentLogs::Silent,
            "-" => AgentLogs::Inherit,
            template => AgentLogs::File(template.to_string()),
        }
    }
}

/// Immutable run configuration, built once at startup
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub broker: BrokerAddr,
    pub tls: TlsMode,
    pub nss_key_log: Option<PathBuf>,
    pub agents: usize,
    /// Delay between consecutive agent creations
    pub spawn_delay: Duration,
    pub agent_logs: AgentLogs,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Bound on each broker acknowledgement wait
    pub ack_timeout: Duration,
    /// Bound on waiting for reference data after a subscribe
    pub reference_timeout: Duration,
    /// Capacity of the event funnel queue
    pub event_buffer: usize,
}

impl RunConfig {
    pub fn new(broker: BrokerAddr, tls: TlsMode, agents: usize) -> Self {
        Self {
            broker,
            tls,
            nss_key_log: None,
            agents,
            spawn_delay: Duration::from_millis(250),
            agent_logs: AgentLogs::Silent,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reference_timeout: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }

    /// Apply the public test broker cap, returning the previous count when it changed.
    pub fn apply_public_broker_cap(&mut self) -> Option<usize> {
        if self.broker.is_public_test_broker() && self.agents > PUBLIC_TEST_BROKER_MAX_AGENTS {
            let requested = self.agents;
            self.agents = PUBLIC_TEST_BROKER_MAX_AGENTS;
            return Some(requested);
        }
        None
    }
}
