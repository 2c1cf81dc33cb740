//! Load failure classification
//!
//! Every failed manifest or media load is turned into a `Decision`:
//! - `Retry(delay_ms)`: resubmit the same load after the delay
//! - `ExcludeTrack(duration_ms)`: drop the representation for a cooldown
//! - `Fatal`: stop playback of the current source
//!
//! Policies are pure functions of the `LoadAttempt` they are given. Callers
//! own the attempt counter and elapsed time. Specialized policies wrap
//! a base policy and delegate to it after handling their own cases.

use crate::{
    config::ResilienceConfig,
    transport::TransportError,
    types::{AdapterKind, TrackType},
    Error, Result,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Exclusion statuses used for DASH and everything that is not HLS: not-found and gone
pub const DASH_EXCLUSION_STATUSES: &[u16] = &[404, 410];

/// HLS additionally falls back on forbidden, range-not-satisfiable and 5xx outages
pub const HLS_EXCLUSION_STATUSES: &[u16] = &[403, 404, 410, 416, 500, 503];

/// Non-retriable parse/format error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// Manifest/playlist could not be parsed
    MalformedManifest,
    /// Container ended before a complete unit was read
    UnexpectedEndOfStream,
    /// Media data is corrupted beyond recovery
    CorruptedData,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErrorKind::MalformedManifest => write!(f, "malformed manifest"),
            ParseErrorKind::UnexpectedEndOfStream => write!(f, "unexpected end of stream"),
            ParseErrorKind::CorruptedData => write!(f, "corrupted data"),
        }
    }
}

/// What went wrong with one load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// Server answered with a non-success status
    HttpStatus { status: u16, message: String },
    /// Response was received but could not be parsed
    Parse(ParseErrorKind),
    /// Transport-level failure
    Io(TransportError),
}

impl LoadFailure {
    /// Human-readable message that may carry server hints
    pub fn message(&self) -> String {
        match self {
            LoadFailure::HttpStatus { status, message } => format!("HTTP {}: {}", status, message),
            LoadFailure::Parse(kind) => kind.to_string(),
            LoadFailure::Io(err) => err.to_string(),
        }
    }
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// One failed load, as seen by a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadAttempt {
    pub url: Url,
    /// `None` for manifest loads
    pub track_type: Option<TrackType>,
    pub failure: LoadFailure,
    /// 1-based count of failures for this load
    pub attempt_count: u32,
    /// Time since the first attempt of this load
    pub elapsed_ms: u64,
}

impl LoadAttempt {
    pub fn new(url: Url, track_type: Option<TrackType>, failure: LoadFailure) -> Self {
        Self {
            url,
            track_type,
            failure,
            attempt_count: 1,
            elapsed_ms: 0,
        }
    }

    pub fn with_attempt(mut self, attempt_count: u32, elapsed_ms: u64) -> Self {
        self.attempt_count = attempt_count;
        self.elapsed_ms = elapsed_ms;
        self
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Retry(u64),
    ExcludeTrack(u64),
    Fatal,
}

/// Load failure policy
pub trait LoadErrorPolicy: Send + Sync + std::fmt::Debug {
    fn on_load_failure(&self, attempt: &LoadAttempt) -> Decision;

    /// Policy name for logs
    fn name(&self) -> &'static str;
}

/// Base policy: exclusion on permanent unavailability, linear backoff otherwise
#[derive(Debug, Clone)]
pub struct DefaultLoadPolicy {
    config: ResilienceConfig,
    exclusion_statuses: Vec<u16>,
}

impl DefaultLoadPolicy {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::dash(config)
    }

    pub fn dash(config: ResilienceConfig) -> Self {
        Self {
            config,
            exclusion_statuses: DASH_EXCLUSION_STATUSES.to_vec(),
        }
    }

    pub fn hls(config: ResilienceConfig) -> Self {
        Self {
            config,
            exclusion_statuses: HLS_EXCLUSION_STATUSES.to_vec(),
        }
    }

    pub fn with_exclusion_statuses(mut self, statuses: &[u16]) -> Self {
        self.exclusion_statuses = statuses.to_vec();
        self
    }

    /// Linear backoff: 0ms for the first failure, +step per failure, capped
    pub fn backoff_ms(&self, attempt_count: u32) -> u64 {
        let steps = u64::from(attempt_count.saturating_sub(1));
        steps
            .saturating_mul(self.config.backoff_step_ms)
            .min(self.config.max_backoff_ms)
    }

    fn is_exclusion_candidate(&self, failure: &LoadFailure) -> bool {
        match failure {
            LoadFailure::Parse(ParseErrorKind::MalformedManifest)
            | LoadFailure::Parse(ParseErrorKind::UnexpectedEndOfStream) => true,
            LoadFailure::HttpStatus { status, .. } => self.exclusion_statuses.contains(status),
            _ => false,
        }
    }
}

impl LoadErrorPolicy for DefaultLoadPolicy {
    fn on_load_failure(&self, attempt: &LoadAttempt) -> Decision {
        if self.is_exclusion_candidate(&attempt.failure) {
            return Decision::ExcludeTrack(self.config.exclusion_ms);
        }

        if let LoadFailure::Parse(ParseErrorKind::CorruptedData) = attempt.failure {
            return Decision::Fatal;
        }

        if attempt.attempt_count > self.config.max_retry_attempts {
            return Decision::ExcludeTrack(self.config.exclusion_ms);
        }

        Decision::Retry(self.backoff_ms(attempt.attempt_count))
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Honors a server "wait N seconds" hint before delegating to the wrapped policy
#[derive(Debug, Clone)]
pub struct ThrottleAwarePolicy {
    inner: Arc<dyn LoadErrorPolicy>,
    pattern: Regex,
}

impl ThrottleAwarePolicy {
    pub fn new(inner: Arc<dyn LoadErrorPolicy>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::InvalidConfig(format!("throttle pattern: {}", e)))?;
        Ok(Self { inner, pattern })
    }

    /// Seconds requested by the server, if the failure carries a hint
    pub fn hinted_wait_secs(&self, failure: &LoadFailure) -> Option<u64> {
        let message = match failure {
            LoadFailure::HttpStatus { message, .. } => message.as_str(),
            LoadFailure::Io(TransportError::Other(message)) => message.as_str(),
            _ => return None,
        };
        self.pattern
            .captures(message)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl LoadErrorPolicy for ThrottleAwarePolicy {
    fn on_load_failure(&self, attempt: &LoadAttempt) -> Decision {
        match self.hinted_wait_secs(&attempt.failure) {
            Some(secs) => Decision::Retry(secs.saturating_mul(1000)),
            None => self.inner.on_load_failure(attempt),
        }
    }

    fn name(&self) -> &'static str {
        "throttle_aware"
    }
}

/// Policies handed to the `SourceFactory`: one shared default plus optional
/// per-adapter specializations
#[derive(Debug, Clone)]
pub struct PolicySet {
    default: Arc<dyn LoadErrorPolicy>,
    overrides: HashMap<AdapterKind, Arc<dyn LoadErrorPolicy>>,
}

impl PolicySet {
    /// Every adapter uses the same policy instance
    pub fn shared(policy: Arc<dyn LoadErrorPolicy>) -> Self {
        Self {
            default: policy,
            overrides: HashMap::new(),
        }
    }

    /// DASH-style defaults everywhere, HLS-specific statuses for HLS, both throttle-aware
    pub fn protocol_defaults(config: &ResilienceConfig) -> Result<Self> {
        let dash: Arc<dyn LoadErrorPolicy> = Arc::new(ThrottleAwarePolicy::new(
            Arc::new(DefaultLoadPolicy::dash(config.clone())),
            &config.throttle_pattern,
        )?);
        let hls: Arc<dyn LoadErrorPolicy> = Arc::new(ThrottleAwarePolicy::new(
            Arc::new(DefaultLoadPolicy::hls(config.clone())),
            &config.throttle_pattern,
        )?);
        Ok(Self::shared(dash).with_override(AdapterKind::Hls, hls))
    }

    pub fn with_override(mut self, kind: AdapterKind, policy: Arc<dyn LoadErrorPolicy>) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn for_adapter(&self, kind: AdapterKind) -> Arc<dyn LoadErrorPolicy> {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
