//! Cadence Core - Adaptive Playback Core
//!
//! This crate provides the control plane of an adaptive media player:
//! - Protocol resolution for DASH, HLS, Smooth Streaming and progressive media
//! - Load error policies with retry, exclusion and fatal escalation
//! - Track selection that survives source swaps
//! - Source construction, including DASH/SS merged with an HLS fallback
//! - The playback session state machine and its listener notifications
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Cadence Core                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Protocol   │  │    Source    │  │    Load      │           │
//! │  │   Resolver   │──│   Factory    │──│  Resilience  │           │
//! │  └──────────────┘  └──────┬───────┘  └──────────────┘           │
//! │                           │ loader events                       │
//! │                    ┌──────┴──────┐                              │
//! │                    │  Playback   │                              │
//! │                    │   Session   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │    Track     │  │  Listener   │  │    Engine    │            │
//! │  │  Selection   │  │ + Quality   │  │   Context    │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod transport;
pub mod manifest;
pub mod resolver;
pub mod resilience;
pub mod context;
pub mod selection;
pub mod source;
pub mod listener;
pub mod session;

pub use error::{Error, Result};
pub use types::*;
pub use config::{BufferProfile, EngineConfig, ResilienceConfig, SelectionPreferences};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use manifest::ParsedManifest;
pub use resolver::ProtocolResolver;
pub use resilience::{
    Decision, DefaultLoadPolicy, LoadAttempt, LoadErrorPolicy, LoadFailure, ParseErrorKind, PolicySet,
    ThrottleAwarePolicy,
};
pub use context::{BandwidthMeter, EngineContext};
pub use selection::{Fingerprint, SelectionChange, TrackSelectionListener, TrackSelectionManager, TrackTable};
pub use source::{AdapterRegistry, AdapterRole, LoaderEvent, LoaderEventKind, ManifestSource, SourceFactory, SourceHandle};
pub use listener::{ChannelListener, PlayerEvent, PlayerEventListener, QualityInfoSink, QualityLabel};
pub use session::{PlaybackSession, SessionBuilder, SessionSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the playback core
pub fn init() {
    tracing::info!(version = VERSION, "Cadence core initialized");
}
