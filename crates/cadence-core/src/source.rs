//! Source construction and the loader pipeline
//!
//! `SourceFactory` maps a resolved `ProtocolKind` to one adapter per entry of
//! `ProtocolKind::adapters()` through an `AdapterRegistry`, and binds each
//! adapter to its load failure policy. The resulting `SourceHandle` owns the
//! workers of one open source:
//! - one manifest worker per adapter, publishing the adapter's track table
//! - one loader per active (adapter, track type) selection
//!
//! Every worker observes the handle's cancellation token, including while it
//! sleeps on a retry timer. Events are tagged with the handle generation so
//! the session can drop anything a replaced handle still had in flight.

use crate::{
    context::{BandwidthMeter, EngineContext},
    manifest::{self, ParsedManifest},
    resilience::{Decision, LoadAttempt, LoadErrorPolicy, LoadFailure, ParseErrorKind, PolicySet},
    selection::TrackTable,
    transport::{HttpRequest, HttpResponse, HttpTransport},
    types::{
        AdapterKind, ErrorKind, ProtocolKind, Representation, RepresentationId, StreamCatalog,
        Timeline, TrackType, INLINE_MANIFEST_BASE,
    },
    Error, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Bytes requested by the initial load of a non-HLS representation
pub const INITIAL_LOAD_BYTES: u64 = 256 * 1024;

/// Longest server message kept for policy hints
const STATUS_MESSAGE_LIMIT: usize = 256;

/// Monotonic identifier of a source handle within one factory
pub type Generation = u64;

/// Where an adapter gets its track table from
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource {
    /// Inline manifest, parsed at build time
    Parsed(ParsedManifest),
    /// Manifest fetched by the adapter's manifest worker
    Remote(Url),
    /// Representations known up front (progressive media, structured catalogs)
    Static(Vec<Representation>),
}

impl ManifestSource {
    /// URL used for representations without their own URI
    pub fn entry_url(&self) -> Option<&Url> {
        match self {
            ManifestSource::Remote(url) => Some(url),
            _ => None,
        }
    }

    /// Known up front to carry no representations
    pub fn is_empty(&self) -> bool {
        match self {
            ManifestSource::Parsed(parsed) => parsed.representations.is_empty(),
            ManifestSource::Static(reps) => reps.is_empty(),
            ManifestSource::Remote(_) => false,
        }
    }
}

/// Position of an adapter inside its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRole {
    Primary,
    /// Second adapter of a merged source, fed by the catalog's playlist URL
    Fallback,
}

/// Adapter construction function
pub type AdapterConstructor = fn(&StreamCatalog, AdapterRole) -> Result<ManifestSource>;

/// Maps adapter kinds to their construction functions
#[derive(Clone)]
pub struct AdapterRegistry {
    constructors: HashMap<AdapterKind, AdapterConstructor>,
}

impl AdapterRegistry {
    /// Registry without any adapter
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: AdapterKind, constructor: AdapterConstructor) -> &mut Self {
        self.constructors.insert(kind, constructor);
        self
    }

    pub fn unregister(&mut self, kind: AdapterKind) -> &mut Self {
        self.constructors.remove(&kind);
        self
    }

    pub fn get(&self, kind: AdapterKind) -> Option<AdapterConstructor> {
        self.constructors.get(&kind).copied()
    }

    pub fn kinds(&self) -> Vec<AdapterKind> {
        let mut kinds: Vec<_> = self.constructors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "dash")]
        registry.register(AdapterKind::Dash, dash_adapter);
        #[cfg(feature = "hls")]
        registry.register(AdapterKind::Hls, hls_adapter);
        #[cfg(feature = "smooth")]
        registry.register(AdapterKind::SmoothStreaming, smooth_adapter);
        registry.register(AdapterKind::Progressive, progressive_adapter);
        registry
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(feature = "dash")]
fn dash_adapter(catalog: &StreamCatalog, role: AdapterRole) -> Result<ManifestSource> {
    manifest_adapter(AdapterKind::Dash, catalog, role)
}

#[cfg(feature = "hls")]
fn hls_adapter(catalog: &StreamCatalog, role: AdapterRole) -> Result<ManifestSource> {
    manifest_adapter(AdapterKind::Hls, catalog, role)
}

#[cfg(feature = "smooth")]
fn smooth_adapter(catalog: &StreamCatalog, role: AdapterRole) -> Result<ManifestSource> {
    manifest_adapter(AdapterKind::SmoothStreaming, catalog, role)
}

fn manifest_adapter(kind: AdapterKind, catalog: &StreamCatalog, role: AdapterRole) -> Result<ManifestSource> {
    if role == AdapterRole::Fallback {
        return catalog
            .playlist_url
            .clone()
            .map(ManifestSource::Remote)
            .ok_or_else(|| Error::UnsupportedProtocol(format!("{} fallback needs a playlist URL", kind)));
    }

    if let Some(bytes) = &catalog.manifest_bytes {
        let base = match &catalog.manifest_url {
            Some(url) => url.clone(),
            None => Url::parse(INLINE_MANIFEST_BASE).map_err(|e| Error::Internal(e.to_string()))?,
        };
        return Ok(ManifestSource::Parsed(manifest::parse_manifest(kind, bytes, &base)?));
    }

    if let Some(url) = catalog.primary_url() {
        return Ok(ManifestSource::Remote(url.clone()));
    }

    if kind == AdapterKind::Hls {
        if let Some(url) = &catalog.playlist_url {
            return Ok(ManifestSource::Remote(url.clone()));
        }
    }

    if !catalog.representations.is_empty() {
        return Ok(ManifestSource::Static(catalog.representations.clone()));
    }

    Err(Error::UnsupportedProtocol(format!("catalog has no {} manifest", kind)))
}

fn progressive_adapter(catalog: &StreamCatalog, _role: AdapterRole) -> Result<ManifestSource> {
    let url = catalog.primary_url().cloned();

    if !catalog.representations.is_empty() {
        let reps: Vec<Representation> = catalog
            .representations
            .iter()
            .cloned()
            .map(|mut rep| {
                if rep.uri.is_none() {
                    rep.uri = url.clone();
                }
                rep
            })
            .collect();
        if let Some(rep) = reps.iter().find(|r| r.uri.is_none()) {
            return Err(Error::UnsupportedProtocol(format!(
                "representation {} has no URI",
                rep.id
            )));
        }
        return Ok(ManifestSource::Static(reps));
    }

    let url = url.ok_or_else(|| Error::UnsupportedProtocol("progressive source needs a URL".to_string()))?;
    let mut rep = Representation::new("progressive", TrackType::Video, 0);
    rep.uri = Some(url);
    Ok(ManifestSource::Static(vec![rep]))
}

/// What a worker reports to the control path
#[derive(Debug, Clone)]
pub enum LoaderEventKind {
    /// An adapter published its track table
    TracksResolved {
        adapter: AdapterKind,
        table: TrackTable,
        timeline: Timeline,
    },
    /// A media playlist refined the adapter's timeline
    TimelineUpdated { adapter: AdapterKind, timeline: Timeline },
    /// The initial load of a representation completed
    Loaded {
        adapter: AdapterKind,
        track_type: TrackType,
        id: RepresentationId,
        bytes: usize,
    },
    /// A load failed and is backing off
    Retrying {
        adapter: AdapterKind,
        /// `None` for manifest loads
        track_type: Option<TrackType>,
        attempt: u32,
        delay_ms: u64,
    },
    /// The policy excluded a representation
    Excluded {
        adapter: AdapterKind,
        track_type: TrackType,
        id: RepresentationId,
        duration_ms: u64,
    },
    /// A loader hit a fatal failure
    LoadFailed {
        adapter: AdapterKind,
        track_type: TrackType,
        id: RepresentationId,
        error: Error,
    },
    /// The adapter's manifest could not be obtained
    AdapterFailed { adapter: AdapterKind, error: Error },
}

/// Generation-tagged worker event
#[derive(Debug, Clone)]
pub struct LoaderEvent {
    pub generation: Generation,
    pub kind: LoaderEventKind,
}

/// Builds `SourceHandle`s
pub struct SourceFactory {
    ctx: Arc<EngineContext>,
    registry: AdapterRegistry,
    generations: AtomicU64,
}

impl SourceFactory {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self::with_registry(ctx, AdapterRegistry::default())
    }

    pub fn with_registry(ctx: Arc<EngineContext>, registry: AdapterRegistry) -> Self {
        Self {
            ctx,
            registry,
            generations: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Build an unstarted handle for `protocol`
    #[instrument(skip(self, protocol, catalog, policies), fields(protocol = %protocol))]
    pub fn build(
        &self,
        protocol: &ProtocolKind,
        catalog: Arc<StreamCatalog>,
        policies: &PolicySet,
    ) -> Result<SourceHandle> {
        let kinds = protocol.adapters();
        let mut adapters = Vec::with_capacity(kinds.len());

        for (idx, kind) in kinds.into_iter().enumerate() {
            let constructor = self.registry.get(kind).ok_or_else(|| {
                Error::UnsupportedProtocol(format!("no adapter registered for {}", kind))
            })?;
            let role = if idx == 0 {
                AdapterRole::Primary
            } else {
                AdapterRole::Fallback
            };
            let source = constructor(&catalog, role)?;
            if source.is_empty() {
                return Err(Error::MalformedManifest(format!("{} source has no representations", kind)));
            }
            let policy = policies.for_adapter(kind);
            debug!(adapter = %kind, policy = policy.name(), ?role, "Adapter built");
            adapters.push(AdapterSlot {
                kind,
                entry: source
                    .entry_url()
                    .or_else(|| catalog.primary_url())
                    .cloned(),
                source: Some(source),
                policy,
                retired: false,
            });
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, adapters = adapters.len(), "Source handle built");

        Ok(SourceHandle {
            generation,
            protocol: *protocol,
            catalog,
            adapters,
            token: self.ctx.child_token(),
            workers: JoinSet::new(),
            loaders: HashMap::new(),
            events: None,
            transport: self.ctx.transport(),
            bandwidth: self.ctx.bandwidth().clone(),
            max_segments: self.ctx.config().max_segments_per_load,
            max_buffer: self.ctx.max_buffer(),
            closed: false,
        })
    }
}

struct AdapterSlot {
    kind: AdapterKind,
    /// Taken by the manifest worker on start
    source: Option<ManifestSource>,
    entry: Option<Url>,
    policy: Arc<dyn LoadErrorPolicy>,
    retired: bool,
}

struct LoaderSlot {
    id: RepresentationId,
    token: CancellationToken,
}

/// One open source: its adapters and their workers
pub struct SourceHandle {
    generation: Generation,
    protocol: ProtocolKind,
    catalog: Arc<StreamCatalog>,
    adapters: Vec<AdapterSlot>,
    token: CancellationToken,
    workers: JoinSet<()>,
    loaders: HashMap<(AdapterKind, TrackType), LoaderSlot>,
    events: Option<mpsc::UnboundedSender<LoaderEvent>>,
    transport: Arc<dyn HttpTransport>,
    bandwidth: Arc<BandwidthMeter>,
    max_segments: usize,
    max_buffer: Duration,
    closed: bool,
}

impl SourceHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn catalog(&self) -> &Arc<StreamCatalog> {
        &self.catalog
    }

    /// Adapters still in use, primary first
    pub fn adapter_kinds(&self) -> Vec<AdapterKind> {
        self.adapters
            .iter()
            .filter(|a| !a.retired)
            .map(|a| a.kind)
            .collect()
    }

    pub fn policy_for(&self, kind: AdapterKind) -> Option<Arc<dyn LoadErrorPolicy>> {
        self.adapters
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.policy.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Spawn one manifest worker per adapter
    pub fn start(&mut self, events: mpsc::UnboundedSender<LoaderEvent>) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.events = Some(events);

        for idx in 0..self.adapters.len() {
            let Some(source) = self.adapters[idx].source.take() else {
                continue;
            };
            let worker = self.worker(self.adapters[idx].kind, self.token.clone())?;
            self.workers.spawn(worker.run_manifest(source));
        }
        debug!(generation = self.generation, "Source handle started");
        Ok(())
    }

    /// Representation currently loading for (adapter, track type)
    pub fn loading(&self, adapter: AdapterKind, track_type: TrackType) -> Option<&RepresentationId> {
        self.loaders.get(&(adapter, track_type)).map(|slot| &slot.id)
    }

    /// Start loading `rep` on `adapter`, replacing any other representation
    /// of the same track type. Returns false when it is already loading.
    pub fn load(&mut self, adapter: AdapterKind, rep: &Representation) -> Result<bool> {
        let key = (adapter, rep.track_type);
        if self.loading(adapter, rep.track_type) == Some(&rep.id) {
            return Ok(false);
        }
        self.stop_loader(adapter, rep.track_type);
        self.reap();

        let slot = self
            .adapters
            .iter()
            .find(|a| a.kind == adapter && !a.retired)
            .ok_or_else(|| Error::Internal(format!("adapter {} is not part of this source", adapter)))?;
        let url = rep
            .uri
            .clone()
            .or_else(|| slot.entry.clone())
            .ok_or_else(|| Error::SelectionUnavailable(format!("representation {} has no URI", rep.id)))?;

        let token = self.token.child_token();
        let worker = self.worker(adapter, token.clone())?;
        self.workers.spawn(worker.run_media(rep.clone(), url));
        self.loaders.insert(
            key,
            LoaderSlot {
                id: rep.id.clone(),
                token,
            },
        );
        debug!(generation = self.generation, adapter = %adapter, id = %rep.id, "Loader started");
        Ok(true)
    }

    /// Cancel the loader of (adapter, track type), if any
    pub fn stop_loader(&mut self, adapter: AdapterKind, track_type: TrackType) -> bool {
        match self.loaders.remove(&(adapter, track_type)) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop using an adapter of a merged source
    pub fn retire_adapter(&mut self, adapter: AdapterKind) {
        for track_type in TrackType::ALL {
            self.stop_loader(adapter, track_type);
        }
        if let Some(slot) = self.adapters.iter_mut().find(|a| a.kind == adapter) {
            slot.retired = true;
        }
        warn!(generation = self.generation, adapter = %adapter, "Adapter retired");
    }

    /// Cancel all pending loads and timers without waiting for them
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.loaders.clear();
    }

    /// Cancel everything and wait for every worker to observe it.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel();
        self.events = None;

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(generation = self.generation, "Worker panicked: {}", e);
                }
            }
        }
        debug!(generation = self.generation, "Source handle closed");
    }

    fn reap(&mut self) {
        while self.workers.try_join_next().is_some() {}
    }

    fn worker(&self, adapter: AdapterKind, token: CancellationToken) -> Result<Worker> {
        let events = self.events.clone().ok_or_else(|| {
            Error::Internal("source handle has not been started".to_string())
        })?;
        let policy = self
            .policy_for(adapter)
            .ok_or_else(|| Error::Internal(format!("no policy for {}", adapter)))?;
        Ok(Worker {
            generation: self.generation,
            adapter,
            transport: self.transport.clone(),
            bandwidth: self.bandwidth.clone(),
            policy,
            events,
            token,
            max_segments: self.max_segments,
            max_buffer: self.max_buffer,
        })
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("generation", &self.generation)
            .field("protocol", &self.protocol)
            .field("adapters", &self.adapter_kinds())
            .field("loaders", &self.loaders.len())
            .field("closed", &self.closed)
            .finish()
    }
}

enum Fetched<T> {
    Done(T),
    Excluded(u64, LoadFailure),
    Fatal(LoadFailure),
    Cancelled,
}

/// State shared by one worker task
struct Worker {
    generation: Generation,
    adapter: AdapterKind,
    transport: Arc<dyn HttpTransport>,
    bandwidth: Arc<BandwidthMeter>,
    policy: Arc<dyn LoadErrorPolicy>,
    events: mpsc::UnboundedSender<LoaderEvent>,
    token: CancellationToken,
    max_segments: usize,
    max_buffer: Duration,
}

impl Worker {
    fn emit(&self, kind: LoaderEventKind) {
        // Nothing leaves a cancelled worker
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.events.send(LoaderEvent {
            generation: self.generation,
            kind,
        });
    }

    async fn run_manifest(self, source: ManifestSource) {
        let (representations, timeline) = match source {
            ManifestSource::Parsed(parsed) => (parsed.representations, parsed.timeline),
            ManifestSource::Static(reps) => (reps, Timeline::default()),
            ManifestSource::Remote(url) => {
                let kind = self.adapter;
                let base = url.clone();
                let outcome = self
                    .fetch(&url, None, None, |response| {
                        manifest::parse_manifest(kind, &response.body, &base).map_err(|e| {
                            debug!(error = %e, "Manifest parse failed");
                            LoadFailure::Parse(ParseErrorKind::MalformedManifest)
                        })
                    })
                    .await;
                match outcome {
                    Fetched::Done(parsed) => (parsed.representations, parsed.timeline),
                    Fetched::Excluded(_, failure) | Fetched::Fatal(failure) => {
                        warn!(adapter = %kind, url = %url, failure = %failure, "Manifest unavailable");
                        self.emit(LoaderEventKind::AdapterFailed {
                            adapter: kind,
                            error: Error::fatal(
                                ErrorKind::Source,
                                format!("{} manifest {} unavailable: {}", kind, url, failure),
                            ),
                        });
                        return;
                    }
                    Fetched::Cancelled => return,
                }
            }
        };

        if representations.is_empty() {
            warn!(adapter = %self.adapter, "Manifest lists no representations");
            self.emit(LoaderEventKind::AdapterFailed {
                adapter: self.adapter,
                error: Error::MalformedManifest(format!("{} manifest has no representations", self.adapter)),
            });
            return;
        }

        self.emit(LoaderEventKind::TracksResolved {
            adapter: self.adapter,
            table: TrackTable::new(self.adapter, representations),
            timeline,
        });
    }

    async fn run_media(self, rep: Representation, url: Url) {
        let track_type = rep.track_type;
        let outcome = match self.adapter {
            #[cfg(feature = "hls")]
            AdapterKind::Hls => self.load_hls_media(track_type, &url).await,
            _ => {
                self.fetch(&url, Some(track_type), Some((0, INITIAL_LOAD_BYTES - 1)), |response| {
                    Ok(response.body.len())
                })
                .await
            }
        };

        match outcome {
            Fetched::Done(bytes) => self.emit(LoaderEventKind::Loaded {
                adapter: self.adapter,
                track_type,
                id: rep.id,
                bytes,
            }),
            Fetched::Excluded(duration_ms, failure) => {
                debug!(adapter = %self.adapter, id = %rep.id, failure = %failure, duration_ms, "Representation load excluded");
                self.emit(LoaderEventKind::Excluded {
                    adapter: self.adapter,
                    track_type,
                    id: rep.id,
                    duration_ms,
                });
            }
            Fetched::Fatal(failure) => {
                warn!(adapter = %self.adapter, id = %rep.id, failure = %failure, "Representation load failed");
                self.emit(LoaderEventKind::LoadFailed {
                    adapter: self.adapter,
                    track_type,
                    error: Error::fatal(
                        ErrorKind::Source,
                        format!("loading {} failed: {}", rep.id, failure),
                    ),
                    id: rep.id,
                });
            }
            Fetched::Cancelled => {
                debug!(adapter = %self.adapter, id = %rep.id, "Loader cancelled");
            }
        }
    }

    /// Media playlist, then its first segments up to the prefetch limits
    #[cfg(feature = "hls")]
    async fn load_hls_media(&self, track_type: TrackType, url: &Url) -> Fetched<usize> {
        let base = url.clone();
        let outcome = self
            .fetch(url, Some(track_type), None, |response| {
                manifest::parse_media_segments(&response.body, &base)
                    .map_err(|_| LoadFailure::Parse(ParseErrorKind::MalformedManifest))
            })
            .await;
        let (segments, timeline) = match outcome {
            Fetched::Done(parsed) => parsed,
            Fetched::Excluded(ms, failure) => return Fetched::Excluded(ms, failure),
            Fetched::Fatal(failure) => return Fetched::Fatal(failure),
            Fetched::Cancelled => return Fetched::Cancelled,
        };
        self.emit(LoaderEventKind::TimelineUpdated {
            adapter: self.adapter,
            timeline,
        });

        let mut total = 0;
        let mut buffered = Duration::ZERO;
        for segment in segments.iter().take(self.max_segments) {
            if buffered >= self.max_buffer {
                break;
            }
            match self
                .fetch(&segment.uri, Some(track_type), None, |response| Ok(response.body.len()))
                .await
            {
                Fetched::Done(bytes) => {
                    total += bytes;
                    buffered += segment.duration;
                }
                other => return other,
            }
        }
        debug!(adapter = %self.adapter, segments = segments.len().min(self.max_segments), bytes = total, "Segments prefetched");
        Fetched::Done(total)
    }

    /// Fetch `url` until `accept` takes the response or the policy gives up
    async fn fetch<T>(
        &self,
        url: &Url,
        track_type: Option<TrackType>,
        range: Option<(u64, u64)>,
        mut accept: impl FnMut(&HttpResponse) -> std::result::Result<T, LoadFailure>,
    ) -> Fetched<T> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut request = HttpRequest::get(url.clone());
            if let Some((start, end)) = range {
                request = request.with_range(start, end);
            }

            let fetch_started = Instant::now();
            let result = tokio::select! {
                _ = self.token.cancelled() => return Fetched::Cancelled,
                result = self.transport.fetch(&request) => result,
            };

            let failure = match result {
                Ok(response) if response.is_success() => {
                    self.bandwidth.record(response.body.len(), fetch_started.elapsed());
                    match accept(&response) {
                        Ok(value) => return Fetched::Done(value),
                        Err(failure) => failure,
                    }
                }
                Ok(response) => LoadFailure::HttpStatus {
                    status: response.status,
                    message: status_message(&response),
                },
                Err(e) => LoadFailure::Io(e),
            };

            let load_attempt = LoadAttempt::new(url.clone(), track_type, failure.clone())
                .with_attempt(attempt, started.elapsed().as_millis() as u64);

            match self.policy.on_load_failure(&load_attempt) {
                Decision::Retry(delay_ms) => {
                    debug!(
                        adapter = %self.adapter,
                        url = %url,
                        attempt,
                        delay_ms,
                        failure = %failure,
                        "Retrying load"
                    );
                    self.emit(LoaderEventKind::Retrying {
                        adapter: self.adapter,
                        track_type,
                        attempt,
                        delay_ms,
                    });
                    tokio::select! {
                        _ = self.token.cancelled() => return Fetched::Cancelled,
                        _ = sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                Decision::ExcludeTrack(duration_ms) => return Fetched::Excluded(duration_ms, failure),
                Decision::Fatal => return Fetched::Fatal(failure),
            }
        }
    }
}

fn status_message(response: &HttpResponse) -> String {
    response.text().chars().take(STATUS_MESSAGE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::resilience::DefaultLoadPolicy;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const MPD: &str = r#"<MPD type="static" mediaPresentationDuration="PT10S"><Period>
<AdaptationSet contentType="video"><Representation id="v1" bandwidth="1000000" width="1280" height="720"><BaseURL>v1.mp4</BaseURL></Representation></AdaptationSet>
</Period></MPD>"#;

    /// Serves scripted statuses per path; everything else is 200
    #[derive(Default)]
    struct ScriptedTransport {
        statuses: HashMap<String, u16>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn fetch(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            let path = request.url.path().to_string();
            self.requests.lock().unwrap().push(path.clone());
            match self.statuses.get(&path) {
                Some(status) => Ok(HttpResponse::status(*status, "")),
                None => Ok(HttpResponse::ok(vec![0u8; 64])),
            }
        }
    }

    fn factory(transport: Arc<ScriptedTransport>) -> SourceFactory {
        let ctx = EngineContext::new(EngineConfig::default(), transport).unwrap();
        SourceFactory::new(Arc::new(ctx))
    }

    fn policies() -> PolicySet {
        PolicySet::protocol_defaults(&Default::default()).unwrap()
    }

    #[test]
    fn test_build_inline_dash() {
        let factory = factory(Arc::default());
        let catalog = Arc::new(StreamCatalog::from_manifest_bytes(MPD));
        let handle = factory.build(&ProtocolKind::Dash, catalog, &policies()).unwrap();
        assert_eq!(handle.adapter_kinds(), vec![AdapterKind::Dash]);
        assert_eq!(handle.generation(), 1);
    }

    #[test]
    fn test_build_malformed_inline_manifest() {
        let factory = factory(Arc::default());
        let catalog = Arc::new(StreamCatalog::from_manifest_bytes("<MPD><Period>"));
        assert!(matches!(
            factory.build(&ProtocolKind::Dash, catalog, &policies()),
            Err(Error::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_build_unregistered_adapter() {
        let ctx = EngineContext::new(EngineConfig::default(), Arc::new(ScriptedTransport::default())).unwrap();
        let mut registry = AdapterRegistry::default();
        registry.unregister(AdapterKind::SmoothStreaming);
        let factory = SourceFactory::with_registry(Arc::new(ctx), registry);
        let catalog = Arc::new(StreamCatalog::from_manifest_url(
            Url::parse("https://cdn.example.com/a.ism/Manifest").unwrap(),
        ));
        assert!(matches!(
            factory.build(&ProtocolKind::SmoothStreaming, catalog, &policies()),
            Err(Error::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_build_rejects_source_without_representations() {
        fn nothing(_: &StreamCatalog, _: AdapterRole) -> Result<ManifestSource> {
            Ok(ManifestSource::Static(Vec::new()))
        }

        let ctx = EngineContext::new(EngineConfig::default(), Arc::new(ScriptedTransport::default())).unwrap();
        let mut registry = AdapterRegistry::default();
        registry.register(AdapterKind::Progressive, nothing);
        let factory = SourceFactory::with_registry(Arc::new(ctx), registry);
        let catalog = Arc::new(StreamCatalog::from_manifest_url(
            Url::parse("https://cdn.example.com/movie.mp4").unwrap(),
        ));
        assert!(matches!(
            factory.build(&ProtocolKind::Progressive, catalog, &policies()),
            Err(Error::MalformedManifest(_))
        ));
        assert!(ManifestSource::Static(Vec::new()).is_empty());
        assert!(!ManifestSource::Remote(Url::parse("https://cdn.example.com/a.mpd").unwrap()).is_empty());
    }

    #[test]
    fn test_merged_shares_policy_unless_specialized() {
        let factory = factory(Arc::default());
        let catalog = Arc::new(
            StreamCatalog::from_manifest_bytes(MPD)
                .with_playlist_url(Url::parse("https://cdn.example.com/hls/master.m3u8").unwrap()),
        );
        let merged = ProtocolKind::Merged(AdapterKind::Dash, AdapterKind::Hls);

        let shared: Arc<dyn LoadErrorPolicy> = Arc::new(DefaultLoadPolicy::new(Default::default()));
        let handle = factory
            .build(&merged, catalog.clone(), &PolicySet::shared(shared))
            .unwrap();
        assert_eq!(handle.adapter_kinds(), vec![AdapterKind::Dash, AdapterKind::Hls]);
        assert!(Arc::ptr_eq(
            &handle.policy_for(AdapterKind::Dash).unwrap(),
            &handle.policy_for(AdapterKind::Hls).unwrap()
        ));

        let handle = factory.build(&merged, catalog, &policies()).unwrap();
        assert!(!Arc::ptr_eq(
            &handle.policy_for(AdapterKind::Dash).unwrap(),
            &handle.policy_for(AdapterKind::Hls).unwrap()
        ));
        assert_eq!(handle.generation(), 2);
    }

    #[tokio::test]
    async fn test_manifest_and_media_workers() {
        let transport = Arc::new(ScriptedTransport::default());
        let factory = factory(transport.clone());
        let catalog = Arc::new(StreamCatalog::from_manifest_bytes(MPD));
        let mut handle = factory.build(&ProtocolKind::Dash, catalog, &policies()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.start(tx).unwrap();

        let event = rx.recv().await.unwrap();
        let table = match event.kind {
            LoaderEventKind::TracksResolved { table, timeline, .. } => {
                assert_eq!(timeline.duration, Some(Duration::from_secs(10)));
                table
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(event.generation, handle.generation());

        let rep = table.representations[0].clone();
        assert!(handle.load(AdapterKind::Dash, &rep).unwrap());
        assert!(!handle.load(AdapterKind::Dash, &rep).unwrap());

        match rx.recv().await.unwrap().kind {
            LoaderEventKind::Loaded { id, bytes, .. } => {
                assert_eq!(id.as_str(), "v1");
                assert_eq!(bytes, 64);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transport.requests.lock().unwrap().as_slice(), ["/v1.mp4"]);

        handle.close().await;
        handle.close().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_not_found_is_excluded() {
        let transport = Arc::new(ScriptedTransport {
            statuses: HashMap::from([("/v1.mp4".to_string(), 404)]),
            ..Default::default()
        });
        let factory = factory(transport);
        let catalog = Arc::new(StreamCatalog::from_manifest_bytes(MPD));
        let mut handle = factory.build(&ProtocolKind::Dash, catalog, &policies()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.start(tx).unwrap();
        let _tracks = rx.recv().await.unwrap();

        let rep = Representation::video("v1", 1_000_000, crate::types::Resolution::new(1280, 720))
            .with_uri(Url::parse("https://localhost/v1.mp4").unwrap());
        handle.load(AdapterKind::Dash, &rep).unwrap();
        match rx.recv().await.unwrap().kind {
            LoaderEventKind::Excluded { id, duration_ms, .. } => {
                assert_eq!(id.as_str(), "v1");
                assert_eq!(duration_ms, 60_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_retry_timer() {
        let transport = Arc::new(ScriptedTransport {
            statuses: HashMap::from([("/v1.mp4".to_string(), 500)]),
            ..Default::default()
        });
        let factory = factory(transport.clone());
        let catalog = Arc::new(StreamCatalog::from_manifest_bytes(MPD));
        let mut handle = factory.build(&ProtocolKind::Dash, catalog, &policies()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.start(tx).unwrap();
        let _tracks = rx.recv().await.unwrap();

        let rep = Representation::video("v1", 1_000_000, crate::types::Resolution::new(1280, 720))
            .with_uri(Url::parse("https://localhost/v1.mp4").unwrap());
        handle.load(AdapterKind::Dash, &rep).unwrap();

        // First failure retries immediately, the second waits 1s
        let mut retries = 0;
        while retries < 2 {
            if let LoaderEventKind::Retrying { .. } = rx.recv().await.unwrap().kind {
                retries += 1;
            }
        }
        handle.close().await;
        let requests = transport.requests.lock().unwrap().len();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(transport.requests.lock().unwrap().len(), requests);
        assert!(rx.try_recv().is_err());
    }
}
