use anyhow::{Context, Result};
use clap::Parser;
use mq_hammer::config::{AgentLogs, BrokerAddr, RunConfig, TlsMode};
use mq_hammer::credentials::{check_capacity, CredentialPool, CredentialProvider, FixedCredentials};
use mq_hammer::funnel::{EventFunnel, MetricsSink};
use mq_hammer::metrics::{ConsoleSink, Exporter, PrometheusSink};
use mq_hammer::mqtt::MqttConnector;
use mq_hammer::{logging, AgentController, ReferenceSet, Scenario};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LONG_ABOUT: &str = "\
MQ Hammer is an MQTT load testing tool

MQ Hammer creates --num-agents agents, each subscribing, unsubscribing and
publishing to topics at given offsets according to the instructions in the
--scenario file.

A reference data set can be provided for validation of static (retained)
data. With it, MQ Hammer knows when the complete contents arrived after a
subscription, how long that took and which messages are missing.

By default agents do not log, to keep the output clean. For diagnostics,
--agent-logs writes one log file per agent; --agent-logs=- makes the agents
log to the default logger.

All arguments can be given through identically named environment variables
as well.";

#[derive(Parser)]
#[command(name = "mq-hammer", version)]
#[command(about = "MQTT load testing tool", long_about = LONG_ABOUT)]
struct Cli {
    /// Broker address, host[:port]; port defaults to 8883 for TLS or 1883 for plain text
    #[arg(short, long, env = "BROKER")]
    broker: String,

    /// Filename containing the scenario as JSON
    #[arg(short, long, env = "SCENARIO")]
    scenario: PathBuf,

    /// Filename with the expected reference data as JSON
    #[arg(short, long = "ref", env = "REF")]
    reference: Option<PathBuf>,

    /// Number of agents to spin up
    #[arg(short, long, env = "NUM_AGENTS", default_value = "1")]
    num_agents: usize,

    /// Duration to wait between spinning up each agent
    #[arg(long, env = "SLEEP", default_value = "250ms")]
    sleep: humantime::Duration,

    /// Client ID prefix; a UUID is appended to it per agent
    #[arg(long, env = "CLIENT_ID", default_value = concat!("mq-hammer:", env!("CARGO_PKG_VERSION"), ":"))]
    client_id: String,

    /// Filename template for per-agent logs, e.g. 'agent-{client_id}.log', or - for the default logger
    #[arg(long, env = "AGENT_LOGS", default_value = "")]
    agent_logs: String,

    /// Username for connecting
    #[arg(short, long, env = "USERNAME", default_value = "")]
    username: String,

    /// Password for connecting
    #[arg(short, long, env = "PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Filename with client id, username and password per line in CSV
    #[arg(long, env = "CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Don't validate TLS hostnames / cert chains
    #[arg(short = 'k', long, env = "INSECURE")]
    insecure: bool,

    /// Disable TLS for MQTT, use plain TCP sockets to the broker
    #[arg(long, env = "DISABLE_MQTT_TLS")]
    disable_mqtt_tls: bool,

    /// Filename to append TLS master secrets in NSS key log format to
    #[arg(long, env = "NSS_KEY_LOG")]
    nss_key_log: Option<PathBuf>,

    /// Export Prometheus metrics at this address; empty disables the exporter
    #[arg(long, env = "PROMETHEUS", default_value = ":8080")]
    prometheus: String,

    /// MQTT keep-alive interval
    #[arg(long, env = "KEEP_ALIVE", default_value = "30s")]
    keep_alive: humantime::Duration,

    /// Time allowed for the broker to accept a connection
    #[arg(long, env = "CONNECT_TIMEOUT", default_value = "30s")]
    connect_timeout: humantime::Duration,

    /// Time allowed for the broker to acknowledge an action
    #[arg(long, env = "ACK_TIMEOUT", default_value = "10s")]
    ack_timeout: humantime::Duration,

    /// Time to wait for all reference data after a subscribe
    #[arg(long, env = "REFERENCE_TIMEOUT", default_value = "30s")]
    reference_timeout: humantime::Duration,

    /// Enable verbose logging (-v for debug, -vv for trace and client internals)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let tls = TlsMode::from_flags(self.disable_mqtt_tls, self.insecure);
        let broker = BrokerAddr::parse(&self.broker, tls.enabled())?;

        let mut config = RunConfig::new(broker, tls, self.num_agents);
        config.spawn_delay = self.sleep.into();
        config.agent_logs = AgentLogs::from_flag(&self.agent_logs);
        config.nss_key_log = self.nss_key_log.clone();
        config.keep_alive = self.keep_alive.into();
        config.connect_timeout = self.connect_timeout.into();
        config.ack_timeout = self.ack_timeout.into();
        config.reference_timeout = self.reference_timeout.into();
        Ok(config)
    }

    fn credentials(&self, agents: usize) -> Result<Arc<dyn CredentialProvider>> {
        let Some(path) = &self.credentials else {
            return Ok(Arc::new(FixedCredentials::new(
                self.client_id.as_str(),
                self.username.as_str(),
                self.password.as_str(),
            )));
        };

        info!(credentials_file = %path.display(), "load credentials from file");
        let pool = CredentialPool::from_path(path)
            .with_context(|| format!("failed to load credentials from {}", path.display()))?;
        check_capacity(&pool, agents)?;
        info!(credentials_file = %path.display(), credentials = pool.size(), "loaded credentials from file");
        Ok(Arc::new(pool))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "this is MQ Hammer");

    let mut config = cli.run_config()?;
    if let Some(requested) = config.apply_public_broker_cap() {
        warn!(
            requested,
            agents = config.agents,
            "limiting agents against the public test broker"
        );
    }

    info!(scenario = %cli.scenario.display(), "load scenario");
    let scenario = Scenario::from_path(&cli.scenario).context("failed to load scenario")?;

    let reference = match &cli.reference {
        Some(path) => {
            info!(reference_file = %path.display(), "load reference data");
            let set = ReferenceSet::from_path(path).context("failed to load reference data")?;
            info!(topics = set.len(), "loaded reference data");
            Some(Arc::new(set))
        }
        None => None,
    };

    let credentials = cli.credentials(config.agents)?;
    let connector = MqttConnector::from_config(&config).context("failed to set up TLS")?;

    let cancel = CancellationToken::new();
    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(ConsoleSink::new())];

    // stopped once the run is over, or earlier on interrupt
    let exporter_stop = cancel.child_token();
    let exporter_task = if cli.prometheus.is_empty() {
        None
    } else {
        info!(address = %cli.prometheus, "export Prometheus metrics");
        let exporter = Exporter::bind(&cli.prometheus).await?;
        sinks.push(Box::new(PrometheusSink::new(exporter.registry())?));
        Some(exporter.serve(exporter_stop.clone()))
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping agents");
            interrupt.cancel();
        }
    });

    let (funnel, events) = EventFunnel::new(sinks, config.event_buffer);
    let funnel_task = tokio::spawn(funnel.process());

    let controller = AgentController::new(
        Arc::new(config),
        Arc::new(connector),
        credentials,
        Arc::new(scenario),
        reference,
        events,
    );
    let summary = controller.control(cancel.clone()).await?;

    // the controller dropped the last sender, so the funnel drains and stops
    funnel_task.await.context("event funnel task failed")?;

    exporter_stop.cancel();
    if let Some(task) = exporter_task {
        let _ = task.await;
    }

    info!(
        spawned = summary.spawned,
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "run finished"
    );
    Ok(())
}
