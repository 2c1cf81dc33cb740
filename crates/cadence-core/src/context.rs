//! Engine context
//!
//! Created once at host startup and passed explicitly to every session and
//! source factory. Owns the configuration, the HTTP transport, the shared
//! bandwidth meter and the root cancellation token.

use crate::{
    config::EngineConfig,
    resilience::PolicySet,
    transport::{HttpTransport, ReqwestTransport},
    Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bandwidth estimate shared by all loaders of one engine
#[derive(Debug)]
pub struct BandwidthMeter {
    /// Current estimate in bps
    estimate: AtomicU64,
    samples: AtomicU64,
}

impl BandwidthMeter {
    /// Create a meter seeded with an initial estimate
    pub fn new(initial_estimate: u64) -> Self {
        Self {
            estimate: AtomicU64::new(initial_estimate),
            samples: AtomicU64::new(0),
        }
    }

    /// Record a completed transfer
    pub fn record(&self, bytes: usize, duration: Duration) {
        let seconds = duration.as_secs_f64();
        if bytes == 0 || seconds <= 0.0 {
            return;
        }
        let sample = ((bytes as f64 * 8.0) / seconds) as u64;

        // EWMA with alpha = 0.2
        let previous = self
            .estimate
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(((current as f64 * 0.8) + (sample as f64 * 0.2)) as u64)
            })
            .unwrap_or_else(|current| current);
        self.samples.fetch_add(1, Ordering::Relaxed);

        debug!(
            bytes,
            duration_ms = duration.as_millis() as u64,
            throughput_mbps = sample as f64 / 1_000_000.0,
            previous_mbps = previous as f64 / 1_000_000.0,
            "Bandwidth sample recorded"
        );
    }

    /// Current estimate in bps
    pub fn estimate(&self) -> u64 {
        self.estimate.load(Ordering::Acquire)
    }

    /// Number of samples recorded so far
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Process-wide engine state with an explicit lifecycle
pub struct EngineContext {
    config: EngineConfig,
    transport: Arc<dyn HttpTransport>,
    bandwidth: Arc<BandwidthMeter>,
    root: CancellationToken,
}

impl EngineContext {
    /// Create a context around a caller-supplied transport
    pub fn new(config: EngineConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let bandwidth = Arc::new(BandwidthMeter::new(config.initial_bitrate_estimate));

        info!(
            buffer_profile = ?config.buffer_profile,
            initial_estimate = config.initial_bitrate_estimate,
            "Engine context created"
        );

        Ok(Self {
            config,
            transport,
            bandwidth,
            root: CancellationToken::new(),
        })
    }

    /// Create a context backed by the reqwest transport
    pub fn with_reqwest(config: EngineConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Self::new(config, transport)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        self.transport.clone()
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthMeter> {
        &self.bandwidth
    }

    /// Prefetch ceiling of the configured buffer profile
    pub fn max_buffer(&self) -> Duration {
        self.config.buffer_profile.max_buffer()
    }

    /// Protocol-specific default policies built from the configured thresholds
    pub fn default_policies(&self) -> Result<PolicySet> {
        PolicySet::protocol_defaults(&self.config.resilience)
    }

    /// Token for one source handle; cancelled with the context
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancel every handle built from this context
    pub fn shutdown(&self) {
        if !self.root.is_cancelled() {
            info!("Engine context shutting down");
            self.root.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("bandwidth", &self.bandwidth)
            .field("shut_down", &self.root.is_cancelled())
            .finish()
    }
}
