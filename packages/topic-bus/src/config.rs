//! Bus configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default time to wait for pending `did` replies.
pub const DEFAULT_PENDING_REPLY_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Settings of one [`EventBus`](crate::EventBus).
///
/// Deserializes from `{ "pending_reply_timeout_ms": 5000 }`; missing fields
/// take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long `publish_and_gather_replies` waits for collaborators that
    /// announced work with `will` to send `did`.
    #[serde(
        rename = "pending_reply_timeout_ms",
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub pending_reply_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pending_reply_timeout: DEFAULT_PENDING_REPLY_TIMEOUT,
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default pending reply timeout.
    pub fn with_pending_reply_timeout(mut self, timeout: Duration) -> Self {
        self.pending_reply_timeout = timeout;
        self
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
