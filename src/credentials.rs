use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

/// MQTT connect credentials bound to one agent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Source of per-agent credentials
pub trait CredentialProvider: Send + Sync {
    /// Credential for the agent created at `ordinal`.
    fn credential_for(&self, ordinal: usize) -> Option<Credential>;

    /// Number of distinct credentials available, `None` when unbounded.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Verify a provider can serve `requested` agents before any is created.
pub fn check_capacity(provider: &dyn CredentialProvider, requested: usize) -> Result<()> {
    match provider.capacity() {
        Some(available) if requested > available => Err(Error::NotEnoughCredentials {
            requested,
            available,
        }),
        _ => Ok(()),
    }
}

/// One username/password for every agent; client ids are the prefix plus a UUID.
#[derive(Debug, Clone)]
pub struct FixedCredentials {
    client_id_prefix: String,
    username: String,
    password: String,
}

impl FixedCredentials {
    pub fn new(
        client_id_prefix: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client_id_prefix: client_id_prefix.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl CredentialProvider for FixedCredentials {
    fn credential_for(&self, _ordinal: usize) -> Option<Credential> {
        Some(Credential {
            client_id: format!("{}{}", self.client_id_prefix, Uuid::new_v4()),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

/// Credentials loaded from CSV rows of `client_id,username,password`
#[derive(Debug, Clone)]
pub struct CredentialPool {
    entries: Vec<Credential>,
}

impl CredentialPool {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let entries = reader
            .deserialize::<Credential>()
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}

impl CredentialProvider for CredentialPool {
    fn credential_for(&self, ordinal: usize) -> Option<Credential> {
        self.entries.get(ordinal).cloned()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.size())
    }
}

/// An agent's identity, used to render scenario and log templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub ordinal: usize,
    pub client_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(ordinal: usize, credential: &Credential) -> Self {
        Self {
            ordinal,
            client_id: credential.client_id.clone(),
            username: credential.username.clone(),
        }
    }

    /// Substitute `{client_id}`, `{ordinal}` and `{username}` in `template`.
    /// Substituted values are copied as they are.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let tail = &rest[open..];
            let Some(close) = tail.find('}') else {
                break;
            };
            out.push_str(&rest[..open]);
            match &tail[1..close] {
                "client_id" => out.push_str(&self.client_id),
                "ordinal" => out.push_str(&self.ordinal.to_string()),
                "username" => out.push_str(&self.username),
                _ => {
                    // not a placeholder, keep the brace and look past it
                    out.push('{');
                    rest = &tail[1..];
                    continue;
                }
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }
}
