//! Connection configuration.

use std::time::Duration;

use crate::{
    credential::Credential,
    error::LinkError,
    retry::{BackoffPolicy, ReconnectLimit, RetryPolicy},
};

/// Default live channel path on the server.
pub const DEFAULT_CHANNEL_PATH: &str = "/api/v1/stream";

/// Timeouts applied by the request client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP + TLS connect timeout.
    pub connect: Duration,
    /// Deadline applied to requests that do not carry their own.
    pub request: Duration,
    /// Period of the correlation table sweep.
    pub sweep_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

/// Live channel policy.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPolicy {
    /// Path of the websocket endpoint, appended to the base address.
    pub path: String,
    /// How often a heartbeat frame is sent.
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated past the interval before reconnecting.
    pub heartbeat_grace: Duration,
    /// Delay curve between reconnect attempts.
    pub reconnect_backoff: BackoffPolicy,
    /// Consecutive failed attempts before `ConnectionLost`.
    pub reconnect_limit: ReconnectLimit,
    /// Capacity of the queue between the socket reader and the dispatcher.
    pub dispatch_capacity: usize,
}

impl ChannelPolicy {
    /// Policy with defaults for everything except the reconnect limit.
    #[must_use]
    pub fn new(reconnect_limit: ReconnectLimit) -> Self {
        Self {
            path: DEFAULT_CHANNEL_PATH.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_grace: Duration::from_secs(15),
            reconnect_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.3,
            },
            reconnect_limit,
            dispatch_capacity: 1024,
        }
    }

    /// Silence after which the connection is considered dead.
    #[must_use]
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_grace
    }
}

/// Immutable connection configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    base_address: String,
    credential: Credential,
    timeouts: Timeouts,
    retry: RetryPolicy,
    channel: ChannelPolicy,
    max_in_flight: usize,
}

impl ConnectionConfig {
    /// Start a builder.
    #[must_use]
    pub fn builder(base_address: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(base_address)
    }

    /// Base address, without trailing slash.
    #[must_use]
    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    /// Credential presented to the server.
    #[must_use]
    pub const fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Request timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Request retry policy.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Live channel policy.
    #[must_use]
    pub const fn channel(&self) -> &ChannelPolicy {
        &self.channel
    }

    /// Maximum concurrently executing requests.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    base_address: String,
    credential: Option<Credential>,
    timeouts: Timeouts,
    retry: RetryPolicy,
    channel: Option<ChannelPolicy>,
    reconnect_limit: Option<ReconnectLimit>,
    max_in_flight: usize,
}

impl ConnectionConfigBuilder {
    fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            credential: None,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            channel: None,
            reconnect_limit: None,
            max_in_flight: 16,
        }
    }

    /// Set the credential.
    #[must_use]
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Override timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the default request deadline.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the whole channel policy, including its reconnect limit.
    #[must_use]
    pub fn channel(mut self, channel: ChannelPolicy) -> Self {
        self.reconnect_limit = Some(channel.reconnect_limit);
        self.channel = Some(channel);
        self
    }

    /// Set the reconnect limit. Required unless `channel` was given.
    #[must_use]
    pub fn reconnect_limit(mut self, limit: ReconnectLimit) -> Self {
        self.reconnect_limit = Some(limit);
        self
    }

    /// Bound the number of concurrently executing requests.
    #[must_use]
    pub const fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if any field is invalid or missing.
    pub fn build(self) -> Result<ConnectionConfig, LinkError> {
        let base_address = validate_address(&self.base_address)?;

        let credential = self
            .credential
            .ok_or_else(|| LinkError::Configuration("credential is required".into()))?;
        credential.validate()?;

        let reconnect_limit = self.reconnect_limit.ok_or_else(|| {
            LinkError::Configuration("channel reconnect limit must be set explicitly".into())
        })?;
        let mut channel = self
            .channel
            .unwrap_or_else(|| ChannelPolicy::new(reconnect_limit));
        channel.reconnect_limit = reconnect_limit;

        if !channel.path.starts_with('/') {
            return Err(LinkError::Configuration(format!(
                "channel path must start with '/': {}",
                channel.path
            )));
        }
        if channel.heartbeat_interval.is_zero() {
            return Err(LinkError::Configuration(
                "heartbeat interval must be positive".into(),
            ));
        }
        if matches!(channel.reconnect_limit, ReconnectLimit::MaxAttempts(0)) {
            return Err(LinkError::Configuration(
                "reconnect limit must allow at least one attempt".into(),
            ));
        }
        if self.timeouts.request.is_zero() || self.timeouts.connect.is_zero() {
            return Err(LinkError::Configuration("timeouts must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(LinkError::Configuration(
                "max_in_flight must be at least 1".into(),
            ));
        }

        let mut retry = self.retry;
        retry.max_attempts = retry.max_attempts.max(1);

        Ok(ConnectionConfig {
            base_address,
            credential,
            timeouts: self.timeouts,
            retry,
            channel,
            max_in_flight: self.max_in_flight,
        })
    }
}

fn validate_address(raw: &str) -> Result<String, LinkError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .ok_or_else(|| {
            LinkError::Configuration(format!("base address must be http(s)://: {raw:?}"))
        })?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(LinkError::Configuration(format!(
            "base address has no host: {raw:?}"
        )));
    }
    Ok(trimmed.to_string())
}
