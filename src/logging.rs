use crate::config::AgentLogs;
use crate::credentials::Identity;
use std::fs::File;
use std::sync::Mutex;
use tracing::{warn, Dispatch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter for a `-v` count; `RUST_LOG` overrides it.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "mq_hammer=info",
        1 => "mq_hammer=debug,rumqttc=warn",
        _ => "mq_hammer=trace,rumqttc=debug",
    }
}

/// Install the process-wide subscriber
pub fn init(verbosity: u8) {
    let filter = default_filter(verbosity);
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Dispatcher for one agent's logs.
///
/// `None` means the agent keeps the process subscriber. A log file that
/// cannot be created is reported and the agent runs silent.
pub fn agent_dispatch(logs: &AgentLogs, identity: &Identity) -> Option<Dispatch> {
    match logs {
        AgentLogs::Inherit => None,
        AgentLogs::Silent => Some(Dispatch::none()),
        AgentLogs::File(template) => {
            let path = identity.expand(template);
            match File::create(&path) {
                Ok(file) => {
                    let subscriber = tracing_subscriber::fmt()
                        .with_ansi(false)
                        .with_max_level(tracing::Level::TRACE)
                        .with_writer(Mutex::new(file))
                        .finish();
                    Some(Dispatch::new(subscriber))
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "cannot create agent log file, agent runs silent");
                    Some(Dispatch::none())
                }
            }
        }
    }
}
