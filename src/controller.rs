use crate::agent::{Agent, AgentContext};
use crate::config::RunConfig;
use crate::connection::Connector;
use crate::credentials::{check_capacity, CredentialProvider, Identity};
use crate::error::Result;
use crate::event::AgentState;
use crate::funnel::EventSender;
use crate::logging;
use crate::reference::ReferenceSet;
use crate::scenario::Scenario;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

/// How the agents of a run ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub spawned: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    fn record(&mut self, state: AgentState) {
        match state {
            AgentState::Completed => self.completed += 1,
            AgentState::Failed => self.failed += 1,
            AgentState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Creates and supervises the agents of one run
pub struct AgentController<C: Connector> {
    ctx: AgentContext<C>,
    credentials: Arc<dyn CredentialProvider>,
}

impl<C: Connector> AgentController<C> {
    pub fn new(
        config: Arc<RunConfig>,
        connector: Arc<C>,
        credentials: Arc<dyn CredentialProvider>,
        scenario: Arc<Scenario>,
        reference: Option<Arc<ReferenceSet>>,
        events: EventSender,
    ) -> Self {
        Self {
            ctx: AgentContext {
                config,
                connector,
                scenario,
                reference,
                events,
            },
            credentials,
        }
    }

    /// Spawn the configured number of agents one `spawn_delay` apart and
    /// wait until every one of them reached a terminal state.
    ///
    /// Consumes the controller so its event sender is released on return.
    pub async fn control(self, cancel: CancellationToken) -> Result<RunSummary> {
        let total = self.ctx.config.agents;
        check_capacity(self.credentials.as_ref(), total)?;

        let mut summary = RunSummary::default();
        let mut agents = JoinSet::new();

        info!(agents = total, sleep = ?self.ctx.config.spawn_delay, "starting agents");
        for ordinal in 0..total {
            if ordinal > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.ctx.config.spawn_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let Some(credential) = self.credentials.credential_for(ordinal) else {
                warn!(ordinal, "no credential available, not starting further agents");
                break;
            };

            let identity = Identity::new(ordinal, &credential);
            debug!(ordinal, client_id = %identity.client_id, "spawning agent");
            let agent = Agent::new(ordinal, credential, self.ctx.clone(), cancel.clone());

            match logging::agent_dispatch(&self.ctx.config.agent_logs, &identity) {
                Some(dispatch) => agents.spawn(agent.run().with_subscriber(dispatch)),
                None => agents.spawn(agent.run()),
            };
            summary.spawned += 1;
        }

        if cancel.is_cancelled() && summary.spawned < total {
            info!(
                spawned = summary.spawned,
                requested = total,
                "run cancelled, not starting remaining agents"
            );
        }
        drop(self.ctx);

        while let Some(joined) = agents.join_next().await {
            match joined {
                Ok(state) => summary.record(state),
                Err(e) => {
                    error!(error = %e, "agent task failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "all agents finished"
        );
        Ok(summary)
    }
}
