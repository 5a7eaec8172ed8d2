//! Reference data: the retained-message snapshot an agent expects to see.
//!
//! Lookups by topic filter are memoized per literal filter string. Many
//! agents subscribe to the same filters at roughly the same time, and a
//! wildcard lookup scans the whole snapshot, so the cache is shared and
//! guarded by a read-mostly lock. Two agents racing on the same uncached
//! filter may both compute it; the first insert wins.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Topic to payload mapping
pub type Messages = HashMap<String, Bytes>;

/// Retained-topic snapshot with a memoizing filter index
#[derive(Debug, Default)]
pub struct ReferenceSet {
    messages: Messages,
    cache: RwLock<HashMap<String, Arc<Messages>>>,
    resolutions: AtomicUsize,
}

impl ReferenceSet {
    pub fn new(messages: Messages) -> Self {
        Self {
            messages,
            cache: RwLock::new(HashMap::new()),
            resolutions: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse a JSON object of `topic -> base64 payload`
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_reader(reader).map_err(|e| Error::Reference(e.to_string()))?;

        let messages = raw
            .into_iter()
            .map(|(topic, encoded)| match STANDARD.decode(encoded.as_bytes()) {
                Ok(payload) => Ok((topic, Bytes::from(payload))),
                Err(source) => Err(Error::ReferencePayload { topic, source }),
            })
            .collect::<Result<Messages>>()?;

        Ok(Self::new(messages))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All reference messages matched by `filter`. Never fails; a filter
    /// matching nothing yields an empty mapping.
    pub fn get_messages(&self, filter: &str) -> Arc<Messages> {
        if let Some(hit) = self.cache.read().get(filter) {
            return Arc::clone(hit);
        }

        let resolved = Arc::new(self.resolve(filter));
        let mut cache = self.cache.write();
        Arc::clone(cache.entry(filter.to_string()).or_insert(resolved))
    }

    /// Number of uncached lookups performed so far
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::Relaxed)
    }

    fn resolve(&self, filter: &str) -> Messages {
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let result: Messages = if is_wildcard(filter) {
            self.messages
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        } else {
            self.messages
                .get_key_value(filter)
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .into_iter()
                .collect()
        };

        trace!(filter = %filter, matched = result.len(), "resolved reference filter");
        result
    }
}

/// Whether `filter` carries MQTT wildcard characters
pub fn is_wildcard(filter: &str) -> bool {
    filter.contains(&['+', '#'][..])
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level (possibly empty), `#` must be the last
/// level and matches its parent and everything below it. Filters starting
/// with a wildcard do not match `$`-prefixed topics. A malformed filter
/// matches nothing.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if !is_wildcard(filter) {
        return filter == topic;
    }
    if topic.starts_with('$') && filter.starts_with(&['+', '#'][..]) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if is_wildcard(f) || f != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
