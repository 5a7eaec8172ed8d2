//! Scenario model: a timeline of subscribe, unsubscribe and publish actions.
//!
//! A scenario is loaded once and shared between all agents. Topics and
//! payloads may carry `{client_id}`, `{ordinal}` and `{username}`
//! placeholders; each agent renders its own concrete action list from the
//! shared template with [`Scenario::render`].

use crate::credentials::Identity;
use crate::error::{Error, Result};
use rumqttc::QoS;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// Latest offset a scenario step may have
pub const MAX_OFFSET: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What an action does
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retain: bool,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Subscribe { .. } => "subscribe",
            ActionKind::Unsubscribe { .. } => "unsubscribe",
            ActionKind::Publish { .. } => "publish",
        }
    }

    /// Topic or filter the action targets
    pub fn topic(&self) -> &str {
        match self {
            ActionKind::Subscribe { filter, .. } | ActionKind::Unsubscribe { filter } => filter,
            ActionKind::Publish { topic, .. } => topic,
        }
    }

    fn render(&self, identity: &Identity) -> Self {
        match self {
            ActionKind::Subscribe { filter, qos } => ActionKind::Subscribe {
                filter: identity.expand(filter),
                qos: *qos,
            },
            ActionKind::Unsubscribe { filter } => ActionKind::Unsubscribe {
                filter: identity.expand(filter),
            },
            ActionKind::Publish {
                topic,
                payload,
                qos,
                retain,
            } => ActionKind::Publish {
                topic: identity.expand(topic),
                payload: identity.expand(payload),
                qos: *qos,
                retain: *retain,
            },
        }
    }
}

/// One timed action, offset from the agent's logical start
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub offset: Duration,
    pub kind: ActionKind,
}

/// Parsed, immutable action timeline in non-decreasing offset order
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    steps: Vec<Action>,
}

impl Scenario {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: Vec<RawStep> = serde_json::from_reader(reader)?;
        Self::from_raw(raw)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Vec<RawStep> = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    pub fn from_actions(mut steps: Vec<Action>) -> Self {
        steps.sort_by_key(|a| a.offset);
        Self { steps }
    }

    fn from_raw(raw: Vec<RawStep>) -> Result<Self> {
        let steps = raw
            .into_iter()
            .enumerate()
            .map(|(index, step)| {
                step.into_action()
                    .map_err(|reason| Error::InvalidStep { index, reason })
            })
            .collect::<Result<Vec<_>>>()?;

        // Stable sort: equal offsets keep file order
        Ok(Self::from_actions(steps))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Offset of the last action
    pub fn duration(&self) -> Duration {
        self.steps.last().map(|a| a.offset).unwrap_or_default()
    }

    /// Concrete action list for one agent. Pure in `(self, identity)`.
    pub fn render(&self, identity: &Identity) -> Vec<Action> {
        self.steps
            .iter()
            .map(|step| Action {
                offset: step.offset,
                kind: step.kind.render(identity),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Seconds(f64),
    Human(String),
}

impl RawOffset {
    fn to_duration(&self) -> std::result::Result<Duration, String> {
        match self {
            RawOffset::Seconds(secs) if !secs.is_finite() => {
                Err(format!("offset {} is not a finite number", secs))
            }
            RawOffset::Seconds(secs) if *secs < 0.0 => {
                Err(format!("offset {}s is negative", secs))
            }
            RawOffset::Seconds(secs) => Duration::try_from_secs_f64(*secs)
                .map_err(|e| format!("offset {}s: {}", secs, e))
                .and_then(within_limit),
            RawOffset::Human(text) => humantime::parse_duration(text)
                .map_err(|e| format!("offset {:?}: {}", text, e))
                .and_then(within_limit),
        }
    }
}

fn within_limit(offset: Duration) -> std::result::Result<Duration, String> {
    if offset > MAX_OFFSET {
        Err(format!(
            "offset {} exceeds {}",
            humantime::format_duration(offset),
            humantime::format_duration(MAX_OFFSET)
        ))
    } else {
        Ok(offset)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum RawStep {
    Subscribe {
        t: RawOffset,
        topic: String,
        #[serde(default)]
        qos: u8,
    },
    Unsubscribe {
        t: RawOffset,
        topic: String,
    },
    Publish {
        t: RawOffset,
        topic: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
}

impl RawStep {
    fn into_action(self) -> std::result::Result<Action, String> {
        let (t, kind) = match self {
            RawStep::Subscribe { t, topic, qos } => (
                t,
                ActionKind::Subscribe {
                    filter: non_empty(topic)?,
                    qos: qos_from_u8(qos)?,
                },
            ),
            RawStep::Unsubscribe { t, topic } => (
                t,
                ActionKind::Unsubscribe {
                    filter: non_empty(topic)?,
                },
            ),
            RawStep::Publish {
                t,
                topic,
                payload,
                qos,
                retain,
            } => {
                let topic = non_empty(topic)?;
                if topic.contains(&['+', '#'][..]) {
                    return Err(format!("cannot publish to wildcard topic {:?}", topic));
                }
                (
                    t,
                    ActionKind::Publish {
                        topic,
                        payload,
                        qos: qos_from_u8(qos)?,
                        retain,
                    },
                )
            }
        };

        Ok(Action {
            offset: t.to_duration()?,
            kind,
        })
    }
}

fn non_empty(topic: String) -> std::result::Result<String, String> {
    if topic.is_empty() {
        Err("empty topic".to_string())
    } else {
        Ok(topic)
    }
}

/// Convert a wire QoS level, rejecting anything above 2
pub fn qos_from_u8(qos: u8) -> std::result::Result<QoS, String> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(format!("invalid qos {}", other)),
    }
}
