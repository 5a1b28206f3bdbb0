use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_ROUTE: &str = "/ask/";

const MIN_POLL_INTERVAL_MS: u64 = 10;
const MAX_POLL_INTERVAL_MS: u64 = 1000;
const MIN_IMAGE_BYTES: usize = 1024;
const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;
const MAX_GENERATION_TIMEOUT_SECS: u64 = 3600;
const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;

/// What to do with a question that arrives while a generation is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PendingPolicy {
    /// Answer the new question with an "already in progress" error.
    #[default]
    Reject,
    /// Cancel the in-flight generation (it is reported as failed) and start
    /// the new one.
    Replace,
}

impl PendingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Replace => "replace",
        }
    }
}

impl fmt::Display for PendingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" | "cancel-and-replace" => Ok(Self::Replace),
            other => Err(format!(
                "unknown pending policy '{other}' (expected 'reject' or 'replace')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub pending_policy: PendingPolicy,
    pub poll_interval: Duration,
    pub max_image_bytes: usize,
    pub generation_timeout: Duration,
    /// How long a new connection may take to finish the WebSocket upgrade.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_policy: PendingPolicy::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            generation_timeout: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            pending_policy: pending_policy_from_env(),
            poll_interval: poll_interval_from_env(),
            max_image_bytes: max_image_bytes_from_env(),
            generation_timeout: generation_timeout_from_env(),
            handshake_timeout: handshake_timeout_from_env(),
        }
    }
}

pub fn pending_policy_from_env() -> PendingPolicy {
    non_empty_env("TUTOR_PENDING_POLICY")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

pub fn poll_interval_from_env() -> Duration {
    let millis = non_empty_env("TUTOR_POLL_INTERVAL_MS")
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(|value| value.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS))
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    Duration::from_millis(millis)
}

pub fn max_image_bytes_from_env() -> usize {
    non_empty_env("TUTOR_MAX_IMAGE_BYTES")
        .and_then(|raw| raw.parse::<usize>().ok())
        .map(|value| value.clamp(MIN_IMAGE_BYTES, MAX_IMAGE_BYTES))
        .unwrap_or(DEFAULT_MAX_IMAGE_BYTES)
}

pub fn generation_timeout_from_env() -> Duration {
    let secs = non_empty_env("TUTOR_GENERATION_TIMEOUT_SECS")
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(|value| value.clamp(1, MAX_GENERATION_TIMEOUT_SECS))
        .unwrap_or(DEFAULT_GENERATION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

pub fn handshake_timeout_from_env() -> Duration {
    let secs = non_empty_env("TUTOR_HANDSHAKE_TIMEOUT_SECS")
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(|value| value.clamp(1, MAX_HANDSHAKE_TIMEOUT_SECS))
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| non_empty_env(key))
}
