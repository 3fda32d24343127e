use std::time::Duration;

use nmxp_rs_protocol::ChannelPattern;
use nmxp_rs_protocol::request::{NATIVE_RATE, USERNAME_LEN};

use crate::error::{ClientError, Result};

/// Network code given to `STA.CHAN` patterns that name no network.
pub const DEFAULT_NETWORK: &str = "XX";

/// Longest short-term-completion wait a NaqsServer accepts, in seconds.
pub const MAX_COMPLETION_WAIT: u16 = 300;

/// Socket timeouts and connect backoff shared by the PDS and DAP clients.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Timeout for each TCP connect attempt. Default: 10 seconds.
    pub connect_timeout: Duration,
    /// Timeout for individual reads (headers, bodies, tokens). Default: 60 seconds.
    pub read_timeout: Duration,
    /// Delay schedule between failed connect attempts.
    pub backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

/// Exponential backoff between connect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay after the first failure. Default: 1 second.
    pub initial: Duration,
    /// Upper bound on the delay. Default: 10 seconds.
    pub max: Duration,
    /// Factor applied after each failure. Default: 2.0.
    pub multiplier: f64,
    /// Attempts before giving up. 0 = unlimited. Default: 0.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl Backoff {
    /// Delay to use after `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max)
    }

    /// Whether `attempt` (1-based) is the last one allowed.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// How the NaqsServer should deliver a PDS subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Compressed packets as they arrive, possibly out of order.
    Raw,
    /// Decompressed packets, no waiting for missing data.
    NoWait,
    /// Decompressed packets, waiting up to this many seconds (1..=300) for
    /// missing packets.
    Wait(u16),
}

impl Completion {
    /// Wire value of the short-term-completion field.
    pub fn to_i32(self) -> i32 {
        match self {
            Self::Raw => -1,
            Self::NoWait => 0,
            Self::Wait(secs) => i32::from(secs),
        }
    }
}

/// What a PDS client subscribes to.
#[derive(Clone, Debug)]
pub struct PdsRequest {
    /// Comma-separated `NET.STA.CHAN` / `STA.CHAN` patterns.
    pub patterns: String,
    pub default_network: String,
    pub completion: Completion,
    /// Output sample rate; [`NATIVE_RATE`] keeps the native rate.
    pub out_format: i32,
    /// Ask the server to start from its buffered data.
    pub buffered: bool,
    /// Send REQUESTPENDING when this much time has passed since the last one.
    pub request_pending_interval: Option<Duration>,
    /// Per-channel reorder capacity for raw streams. `None` passes packets
    /// through in arrival order.
    pub raw_reorder_capacity: Option<usize>,
}

impl PdsRequest {
    pub fn new(patterns: impl Into<String>) -> Self {
        Self {
            patterns: patterns.into(),
            default_network: DEFAULT_NETWORK.to_owned(),
            completion: Completion::Raw,
            out_format: NATIVE_RATE,
            buffered: false,
            request_pending_interval: None,
            raw_reorder_capacity: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_patterns(&self.patterns, &self.default_network)?;
        if let Completion::Wait(secs) = self.completion
            && !(1..=MAX_COMPLETION_WAIT).contains(&secs)
        {
            return Err(ClientError::Config(format!(
                "completion wait must be 1..={MAX_COMPLETION_WAIT} seconds, got {secs}"
            )));
        }
        if self.out_format != NATIVE_RATE && self.out_format <= 0 {
            return Err(ClientError::Config(format!(
                "output rate must be positive or {NATIVE_RATE}, got {}",
                self.out_format
            )));
        }
        if self.request_pending_interval == Some(Duration::ZERO) {
            return Err(ClientError::Config("request pending interval must be non-zero".into()));
        }
        if self.raw_reorder_capacity == Some(0) {
            return Err(ClientError::Config("raw reorder capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Reorder capacity that applies to this subscription, if any.
    pub(crate) fn reorder_capacity(&self) -> Option<usize> {
        match self.completion {
            Completion::Raw => self.raw_reorder_capacity,
            _ => None,
        }
    }
}

/// DataServer login. Empty username and password log in anonymously.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.len() >= USERNAME_LEN {
            return Err(ClientError::Config(format!(
                "username must be at most {} bytes, got {}",
                USERNAME_LEN - 1,
                self.username.len()
            )));
        }
        Ok(())
    }
}

/// Half-open time range `[start, end)` in epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i32,
    pub end: i32,
}

impl TimeWindow {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> i32 {
        self.end - self.start
    }

    /// The window of the same span that starts where this one ends.
    pub fn next(&self) -> Self {
        Self {
            start: self.end,
            end: self.end.saturating_add(self.span()),
        }
    }
}

/// Whether a DAP run stops after one window or keeps following real time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DapMode {
    OnePass,
    /// Slide the window forever, waiting until the wall clock is `delay`
    /// past the end of the next window before requesting it.
    Delay { delay: Duration },
}

/// What a DAP client retrieves.
#[derive(Clone, Debug)]
pub struct DapRequest {
    pub patterns: String,
    pub default_network: String,
    pub credentials: Credentials,
    pub window: TimeWindow,
    pub mode: DapMode,
}

impl DapRequest {
    pub fn new(patterns: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            patterns: patterns.into(),
            default_network: DEFAULT_NETWORK.to_owned(),
            credentials: Credentials::default(),
            window,
            mode: DapMode::OnePass,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_patterns(&self.patterns, &self.default_network)?;
        self.credentials.validate()?;
        if self.window.end <= self.window.start {
            return Err(ClientError::Config(format!(
                "time window end {} is not after start {}",
                self.window.end, self.window.start
            )));
        }
        Ok(())
    }
}

fn validate_patterns(patterns: &str, default_network: &str) -> Result<()> {
    if default_network.is_empty() {
        return Err(ClientError::Config("default network is empty".into()));
    }
    ChannelPattern::parse_list(patterns, default_network)
        .map(|_| ())
        .map_err(|e| ClientError::Config(e.to_string()))
}
