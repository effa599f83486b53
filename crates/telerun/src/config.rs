//! # Configuration
//!
//! Knobs for the engine, the reachability facade and the resilience wrapper.
//! Every struct has a `Default` matching the protocol's fixed constants, and
//! builder-style `with_*` setters for tests and embedders.

use std::time::Duration;

use telerpc::RouteId;
use tracing::warn;

use crate::context::PrefetchStrategy;

/// Upper bound on a single call, including any wait for route reachability.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between retries of an unresolved service, before backoff kicks in.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fixed-delay retries allowed before switching to exponential backoff (about 60s).
pub const RETRY_BEFORE_BACKOFF: u32 = 600;

/// Ceiling for the exponential backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default capacity of a consumer-side stream delivery buffer.
pub const STREAM_BUFFER: usize = 128;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The route replies should come back to.
    pub local_route: RouteId,
    pub call_timeout: Duration,
    /// Treat a failure while processing an inbound message or command as fatal to the engine.
    pub strict: bool,
    /// Capacity of each consumer-side stream delivery buffer.
    pub stream_buffer: usize,
    /// Prefetch used when the call context does not override it.
    pub default_prefetch: PrefetchStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_route: RouteId::new("client"),
            call_timeout: CALL_TIMEOUT,
            strict: false,
            stream_buffer: STREAM_BUFFER,
            default_prefetch: PrefetchStrategy::DEFAULT,
        }
    }
}

impl EngineConfig {
    pub fn new(local_route: RouteId) -> Self {
        Self { local_route, ..Self::default() }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn with_default_prefetch(mut self, prefetch: PrefetchStrategy) -> Self {
        self.default_prefetch = prefetch;
        self
    }

    /// Overrides the defaults from `TELERUN_CALL_TIMEOUT_MS`, `TELERUN_STRICT`
    /// and `TELERUN_STREAM_BUFFER`. Unparseable values are logged and ignored.
    pub fn from_env(local_route: RouteId) -> Self {
        let mut config = Self::new(local_route);
        if let Some(ms) = env_parse::<u64>("TELERUN_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(strict) = env_parse::<bool>("TELERUN_STRICT") {
            config.strict = strict;
        }
        if let Some(capacity) = env_parse::<usize>("TELERUN_STREAM_BUFFER") {
            config = config.with_stream_buffer(capacity);
        }
        config
    }

    /// The prefetch actually granted: at least one, never more than the buffer can hold.
    pub fn effective_prefetch(&self, requested: PrefetchStrategy) -> u32 {
        let cap = u32::try_from(self.stream_buffer).unwrap_or(u32::MAX).max(1);
        requested.prefetch.clamp(1, cap)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Settings for the reachability facade.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on waiting for a usable connection plus the call itself.
    pub reachability_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { reachability_timeout: CALL_TIMEOUT }
    }
}

impl ClientConfig {
    pub fn with_reachability_timeout(mut self, timeout: Duration) -> Self {
        self.reachability_timeout = timeout;
        self
    }
}

/// Retry schedule for unresolved services in `durable`.
#[derive(Debug, Clone)]
pub struct DurablePolicy {
    pub fixed_delay: Duration,
    pub retries_before_backoff: u32,
    pub max_delay: Duration,
}

impl Default for DurablePolicy {
    fn default() -> Self {
        Self {
            fixed_delay: RETRY_DELAY,
            retries_before_backoff: RETRY_BEFORE_BACKOFF,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl DurablePolicy {
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.fixed_delay = delay;
        self
    }

    pub fn with_retries_before_backoff(mut self, retries: u32) -> Self {
        self.retries_before_backoff = retries;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}
