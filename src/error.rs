use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a run before any agent is created.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed scenario: {0}")]
    Scenario(#[from] serde_json::Error),

    #[error("scenario step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("malformed reference data: {0}")]
    Reference(String),

    #[error("reference payload for topic {topic} is not valid base64: {source}")]
    ReferencePayload {
        topic: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("malformed credentials: {0}")]
    Credentials(#[from] csv::Error),

    #[error("cannot create {requested} agents with only {available} credentials provided")]
    NotEnoughCredentials { requested: usize, available: usize },

    #[error("invalid broker address {0:?}")]
    BrokerAddress(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("cannot bind metrics exporter on {addr}: {source}")]
    ExporterBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
