//! Playback Session - state machine and control path
//!
//! A `PlaybackSession` is a cheap, cloneable handle to one control task.
//! The task owns everything that must change in order:
//! - the current `SourceHandle` and its loader events
//! - the `TrackSelectionManager`
//! - the playback state and the listener notifications
//!
//! Commands from the host and generation-tagged loader events are both
//! processed on that task, one at a time. Events from a handle that is no
//! longer current are dropped. Opening a source whose protocol needs a
//! network round trip resolves it on a separate task, so commands keep
//! flowing while that request is in flight.

use crate::{
    config::SelectionPreferences,
    context::EngineContext,
    listener::{NoopListener, NoopQualitySink, PlayerEventListener, QualityInfoSink, QualityLabel},
    resilience::PolicySet,
    resolver::ProtocolResolver,
    selection::{Fingerprint, TrackSelectionListener, TrackSelectionManager},
    source::{AdapterRegistry, Generation, LoaderEvent, LoaderEventKind, SourceFactory, SourceHandle},
    types::{
        AdapterKind, DiscontinuityReason, ErrorKind, PlaybackParameters, PlaybackState,
        ProtocolKind, Representation, RepresentationId, SessionId, StreamCatalog, Timeline,
        TrackType,
    },
    Error, Result,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: PlaybackState,
    pub play_when_ready: bool,
    pub position_ms: u64,
    /// Unknown until a manifest reports it
    pub duration_ms: Option<u64>,
    pub is_live: bool,
    pub parameters: PlaybackParameters,
    pub protocol: Option<ProtocolKind>,
    pub quality_label: String,
    pub generation: Option<Generation>,
    pub selected: BTreeMap<TrackType, RepresentationId>,
    pub excluded: Vec<(AdapterKind, RepresentationId)>,
    /// Engine-wide bandwidth estimate in bps
    pub bandwidth_estimate: u64,
}

enum Command {
    Open {
        catalog: StreamCatalog,
        reply: oneshot::Sender<Result<ProtocolKind>>,
    },
    Stop(oneshot::Sender<()>),
    SetPlayWhenReady(bool),
    SeekTo(u64),
    SetSpeed(f32),
    SetPitch(f32),
    SetVolume(f32),
    SelectTrack {
        track_type: TrackType,
        id: RepresentationId,
        reply: oneshot::Sender<Result<()>>,
    },
    DisableTrack {
        track_type: TrackType,
        reply: oneshot::Sender<Result<()>>,
    },
    RestoreTrack {
        track_type: TrackType,
        fingerprint: Fingerprint,
        reply: oneshot::Sender<Result<()>>,
    },
    Selection {
        track_type: TrackType,
        reply: oneshot::Sender<Option<Representation>>,
    },
    AvailableTracks {
        track_type: TrackType,
        reply: oneshot::Sender<Vec<Representation>>,
    },
    Position(u64),
    Buffering(bool),
    PlaybackEnded,
    Discontinuity(DiscontinuityReason),
    SeekProcessed,
    RendererError {
        renderer_index: Option<usize>,
        cause: String,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    CurrentItem(oneshot::Sender<Option<Arc<StreamCatalog>>>),
    Shutdown(oneshot::Sender<()>),
}

/// Configures and spawns a `PlaybackSession`
pub struct SessionBuilder {
    ctx: Arc<EngineContext>,
    listener: Arc<dyn PlayerEventListener>,
    quality_sink: Arc<dyn QualityInfoSink>,
    selection_listener: Option<Arc<dyn TrackSelectionListener>>,
    policies: Option<PolicySet>,
    preferences: Option<SelectionPreferences>,
    registry: Option<AdapterRegistry>,
    show_bitrate: bool,
}

impl SessionBuilder {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            listener: Arc::new(NoopListener),
            quality_sink: Arc::new(NoopQualitySink),
            selection_listener: None,
            policies: None,
            preferences: None,
            registry: None,
            show_bitrate: true,
        }
    }

    pub fn listener(mut self, listener: Arc<dyn PlayerEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn quality_sink(mut self, sink: Arc<dyn QualityInfoSink>) -> Self {
        self.quality_sink = sink;
        self
    }

    pub fn selection_listener(mut self, listener: Arc<dyn TrackSelectionListener>) -> Self {
        self.selection_listener = Some(listener);
        self
    }

    /// Policies for this session; protocol defaults from the context otherwise
    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn preferences(mut self, preferences: SelectionPreferences) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Include the bitrate in the quality label
    pub fn show_bitrate(mut self, show: bool) -> Self {
        self.show_bitrate = show;
        self
    }

    /// Spawn the control task on the current Tokio runtime
    pub fn spawn(self) -> Result<PlaybackSession> {
        let (controller, session, channels) = self.build()?;
        tokio::spawn(controller.run(channels));
        info!(session_id = %session.id, "Playback session created");
        Ok(session)
    }

    fn build(self) -> Result<(Controller, PlaybackSession, ControlChannels)> {
        if self.ctx.is_shut_down() {
            return Err(Error::SessionClosed);
        }

        let policies = match self.policies {
            Some(policies) => policies,
            None => self.ctx.default_policies()?,
        };
        let preferences = self
            .preferences
            .unwrap_or_else(|| self.ctx.config().selection.clone());
        let mut selection = TrackSelectionManager::new(preferences);
        if let Some(listener) = self.selection_listener {
            selection.set_listener(listener);
        }
        let factory = match self.registry {
            Some(registry) => SourceFactory::with_registry(self.ctx.clone(), registry),
            None => SourceFactory::new(self.ctx.clone()),
        };

        let id = SessionId::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lookups_tx, lookups_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);

        let controller = Controller {
            id,
            shutdown: self.ctx.child_token(),
            ctx: self.ctx,
            factory,
            resolver: ProtocolResolver::new(),
            policies,
            selection,
            listener: self.listener,
            quality_sink: self.quality_sink,
            quality: QualityLabel::new().with_bitrate(self.show_bitrate),
            state: PlaybackState::Idle,
            state_tx,
            events_tx,
            lookups_tx,
            pending_open: None,
            lookups: 0,
            handle: None,
            item: None,
            protocol: None,
            source_changed: false,
            play_when_ready: false,
            parameters: PlaybackParameters::default(),
            position_ms: 0,
            ended: false,
            rebuffering: false,
            timelines: HashMap::new(),
            resolved_adapters: HashSet::new(),
            loaded: HashSet::new(),
            stalled: HashSet::new(),
            announced: HashMap::new(),
        };
        let session = PlaybackSession {
            id,
            commands: command_tx,
            state: state_rx,
        };
        let channels = ControlChannels {
            commands: command_rx,
            events: events_rx,
            lookups: lookups_rx,
        };
        Ok((controller, session, channels))
    }
}

/// Handle to a playback session
#[derive(Clone)]
pub struct PlaybackSession {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<PlaybackState>,
}

impl PlaybackSession {
    pub fn builder(ctx: Arc<EngineContext>) -> SessionBuilder {
        SessionBuilder::new(ctx)
    }

    /// Session with default listener, policies and preferences
    pub fn new(ctx: Arc<EngineContext>) -> Result<Self> {
        SessionBuilder::new(ctx).spawn()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Last published state
    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `accept`
    pub async fn wait_for(&self, accept: impl FnMut(&PlaybackState) -> bool) -> Result<PlaybackState> {
        let mut rx = self.state.clone();
        let state = rx.wait_for(accept).await.map_err(|_| Error::SessionClosed)?;
        Ok(*state)
    }

    /// Replace the current item. Resolves the protocol, builds a new source
    /// and enters Preparing; the previous source is closed first.
    #[instrument(skip(self, catalog), fields(session_id = %self.id, item = ?catalog.item_id))]
    pub async fn open(&self, catalog: StreamCatalog) -> Result<ProtocolKind> {
        self.request(|reply| Command::Open { catalog, reply }).await?
    }

    /// Close the current source and return to Idle
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    pub fn set_play_when_ready(&self, play: bool) -> Result<()> {
        self.send(Command::SetPlayWhenReady(play))
    }

    pub fn play(&self) -> Result<()> {
        self.set_play_when_ready(true)
    }

    pub fn pause(&self) -> Result<()> {
        self.set_play_when_ready(false)
    }

    /// Ignored without a source or outside [0, duration]
    pub fn seek_to(&self, position_ms: u64) -> Result<()> {
        self.send(Command::SeekTo(position_ms))
    }

    pub fn set_speed(&self, speed: f32) -> Result<()> {
        self.send(Command::SetSpeed(speed))
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        self.send(Command::SetPitch(pitch))
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.send(Command::SetVolume(volume))
    }

    /// Select a representation; rejected with `SelectionUnavailable`
    pub async fn select_track(&self, track_type: TrackType, id: impl Into<RepresentationId>) -> Result<()> {
        let id = id.into();
        self.request(|reply| Command::SelectTrack { track_type, id, reply })
            .await?
    }

    /// Select "none" for a track type
    pub async fn disable_track(&self, track_type: TrackType) -> Result<()> {
        self.request(|reply| Command::DisableTrack { track_type, reply })
            .await?
    }

    /// Seed a selection intent from persisted preferences
    pub async fn restore_track(&self, track_type: TrackType, fingerprint: Fingerprint) -> Result<()> {
        self.request(|reply| Command::RestoreTrack {
            track_type,
            fingerprint,
            reply,
        })
        .await?
    }

    pub async fn selection(&self, track_type: TrackType) -> Result<Option<Representation>> {
        self.request(|reply| Command::Selection { track_type, reply }).await
    }

    /// Selectable representations of a track type
    pub async fn available_tracks(&self, track_type: TrackType) -> Result<Vec<Representation>> {
        self.request(|reply| Command::AvailableTracks { track_type, reply })
            .await
    }

    /// Renderer input: current playback position
    pub fn report_position(&self, position_ms: u64) -> Result<()> {
        self.send(Command::Position(position_ms))
    }

    /// Renderer input: rebuffering started or stopped
    pub fn report_buffering(&self, buffering: bool) -> Result<()> {
        self.send(Command::Buffering(buffering))
    }

    /// Renderer input: end of stream reached
    pub fn report_playback_ended(&self) -> Result<()> {
        self.send(Command::PlaybackEnded)
    }

    /// Renderer input: the position jumped
    pub fn report_discontinuity(&self, reason: DiscontinuityReason) -> Result<()> {
        self.send(Command::Discontinuity(reason))
    }

    /// Renderer input: a seek completed
    pub fn report_seek_processed(&self) -> Result<()> {
        self.send(Command::SeekProcessed)
    }

    /// Renderer input: decoding failed
    pub fn report_renderer_error(&self, renderer_index: Option<usize>, cause: impl Into<String>) -> Result<()> {
        self.send(Command::RendererError {
            renderer_index,
            cause: cause.into(),
        })
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Catalog of the open source
    pub async fn current_item(&self) -> Result<Option<Arc<StreamCatalog>>> {
        self.request(Command::CurrentItem).await
    }

    /// Close the source and end the control task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving ends drained by the control task
struct ControlChannels {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<LoaderEvent>,
    lookups: mpsc::UnboundedReceiver<LookupOutcome>,
}

struct PendingOpen {
    lookup: u64,
    catalog: Arc<StreamCatalog>,
    reply: oneshot::Sender<Result<ProtocolKind>>,
    token: CancellationToken,
}

struct LookupOutcome {
    lookup: u64,
    result: Result<ProtocolKind>,
}

/// State owned by the control task
struct Controller {
    id: SessionId,
    ctx: Arc<EngineContext>,
    shutdown: CancellationToken,
    factory: SourceFactory,
    resolver: ProtocolResolver,
    policies: PolicySet,
    selection: TrackSelectionManager,
    listener: Arc<dyn PlayerEventListener>,
    quality_sink: Arc<dyn QualityInfoSink>,
    quality: QualityLabel,
    state: PlaybackState,
    state_tx: watch::Sender<PlaybackState>,
    events_tx: mpsc::UnboundedSender<LoaderEvent>,
    lookups_tx: mpsc::UnboundedSender<LookupOutcome>,
    /// Open waiting on a remote protocol lookup
    pending_open: Option<PendingOpen>,
    lookups: u64,
    handle: Option<SourceHandle>,
    item: Option<Arc<StreamCatalog>>,
    protocol: Option<ProtocolKind>,
    /// Set by `open`, cleared when the first track set makes the source Ready
    source_changed: bool,
    play_when_ready: bool,
    parameters: PlaybackParameters,
    position_ms: u64,
    /// End-of-stream edge guard
    ended: bool,
    /// Renderer-reported rebuffering
    rebuffering: bool,
    timelines: HashMap<AdapterKind, Timeline>,
    /// Adapters that published a non-empty track table
    resolved_adapters: HashSet<AdapterKind>,
    loaded: HashSet<(AdapterKind, TrackType)>,
    /// Loads backing off; `None` is the adapter's manifest
    stalled: HashSet<(AdapterKind, Option<TrackType>)>,
    /// Representations last reported through `on_track_changed`
    announced: HashMap<TrackType, RepresentationId>,
}

impl Controller {
    async fn run(mut self, mut channels: ControlChannels) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(session_id = %self.id, "Engine shut down");
                    break;
                }
                command = channels.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.close_source().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    // Every session handle is gone
                    None => break,
                },
                Some(outcome) = channels.lookups.recv() => self.finish_lookup(outcome),
                Some(event) = channels.events.recv() => self.handle_event(event).await,
            }
        }

        self.close_source().await;
        info!(session_id = %self.id, "Playback session ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { catalog, reply } => self.open(catalog, reply).await,
            Command::Stop(reply) => {
                self.close_source().await;
                let _ = reply.send(());
            }
            Command::SetPlayWhenReady(play) => {
                self.play_when_ready = play;
                self.reconcile();
            }
            Command::SeekTo(position_ms) => self.seek_to(position_ms),
            Command::SetSpeed(speed) => self.set_speed(speed),
            Command::SetPitch(pitch) => self.set_pitch(pitch),
            Command::SetVolume(volume) => self.set_volume(volume),
            Command::SelectTrack { track_type, id, reply } => {
                let _ = reply.send(self.select_track(track_type, &id));
            }
            Command::DisableTrack { track_type, reply } => {
                let _ = reply.send(self.disable_track(track_type));
            }
            Command::RestoreTrack {
                track_type,
                fingerprint,
                reply,
            } => {
                let result = self.selection.restore(track_type, fingerprint).map(|_| ());
                if result.is_ok() {
                    self.sync_loaders();
                }
                let _ = reply.send(result);
            }
            Command::Selection { track_type, reply } => {
                let _ = reply.send(self.selection.selected(track_type).cloned());
            }
            Command::AvailableTracks { track_type, reply } => {
                let available = self
                    .selection
                    .available(track_type)
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(available);
            }
            Command::Position(position_ms) => {
                self.position_ms = position_ms;
                if self.before_end(position_ms) {
                    self.ended = false;
                }
            }
            Command::Buffering(buffering) => {
                self.rebuffering = buffering;
                self.reconcile();
            }
            Command::PlaybackEnded => self.on_playback_ended(),
            Command::Discontinuity(reason) => self.on_discontinuity(reason).await,
            Command::SeekProcessed => self.listener.on_seek_end(),
            Command::RendererError {
                renderer_index,
                cause,
            } => {
                // A failed source already reported its error
                if self.handle.is_some() && !matches!(self.state, PlaybackState::Error(_)) {
                    self.fail(Error::fatal(ErrorKind::Renderer, cause), renderer_index);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::CurrentItem(reply) => {
                let _ = reply.send(self.item.clone());
            }
            // Handled by the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn open(&mut self, catalog: StreamCatalog, reply: oneshot::Sender<Result<ProtocolKind>>) {
        self.close_source().await;
        self.quality.clear_tracks();
        self.quality_sink.on_quality_info("");

        let catalog = Arc::new(catalog);
        match self.resolver.remote_target(&catalog) {
            Ok(Some(url)) => self.start_lookup(catalog, url, reply),
            Ok(None) => {
                let result = self
                    .resolver
                    .resolve(&catalog)
                    .and_then(|protocol| self.start_source(catalog, protocol));
                let _ = reply.send(result);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Resolve by sniffing the entry URL on its own task; the control path
    /// keeps serving commands until the outcome arrives
    fn start_lookup(&mut self, catalog: Arc<StreamCatalog>, url: Url, reply: oneshot::Sender<Result<ProtocolKind>>) {
        self.lookups += 1;
        let lookup = self.lookups;
        let token = self.shutdown.child_token();
        debug!(session_id = %self.id, lookup, url = %url, "Sniffing source protocol");

        let resolver = self.resolver;
        let transport = self.ctx.transport();
        let outcomes = self.lookups_tx.clone();
        let task_catalog = catalog.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = task_token.cancelled() => return,
                result = resolver.resolve_remote(&task_catalog, transport.as_ref()) => result,
            };
            let _ = outcomes.send(LookupOutcome { lookup, result });
        });

        self.pending_open = Some(PendingOpen {
            lookup,
            catalog,
            reply,
            token,
        });
        self.transition(PlaybackState::Preparing);
    }

    fn finish_lookup(&mut self, outcome: LookupOutcome) {
        if self.pending_open.as_ref().map(|p| p.lookup) != Some(outcome.lookup) {
            debug!(session_id = %self.id, lookup = outcome.lookup, "Dropping stale lookup outcome");
            return;
        }
        let Some(pending) = self.pending_open.take() else {
            return;
        };

        let result = outcome
            .result
            .and_then(|protocol| self.start_source(pending.catalog, protocol));
        if result.is_err() {
            self.transition(PlaybackState::Idle);
        }
        let _ = pending.reply.send(result);
    }

    /// Build and start the handle for a resolved catalog
    fn start_source(&mut self, catalog: Arc<StreamCatalog>, protocol: ProtocolKind) -> Result<ProtocolKind> {
        let mut handle = self.factory.build(&protocol, catalog.clone(), &self.policies)?;

        self.selection.on_catalog_changed(&catalog)?;
        self.selection.bind_adapters(handle.adapter_kinds());
        handle.start(self.events_tx.clone())?;

        info!(
            session_id = %self.id,
            protocol = %protocol,
            generation = handle.generation(),
            "Source opened"
        );

        self.handle = Some(handle);
        self.item = Some(catalog.clone());
        self.protocol = Some(protocol);
        self.source_changed = true;
        self.transition(PlaybackState::Preparing);
        self.listener.on_source_changed(&catalog);
        Ok(protocol)
    }

    /// Close the current handle, if any, and reset per-source state
    async fn close_source(&mut self) {
        if let Some(pending) = self.pending_open.take() {
            pending.token.cancel();
            debug!(session_id = %self.id, lookup = pending.lookup, "Pending open cancelled");
            let _ = pending
                .reply
                .send(Err(Error::Cancelled("source closed while its protocol was resolved".into())));
        }
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
        }
        self.item = None;
        self.protocol = None;
        self.source_changed = false;
        self.position_ms = 0;
        self.ended = false;
        self.rebuffering = false;
        self.timelines.clear();
        self.resolved_adapters.clear();
        self.loaded.clear();
        self.stalled.clear();
        self.announced.clear();
        self.transition(PlaybackState::Idle);
    }

    async fn handle_event(&mut self, event: LoaderEvent) {
        let current = self.handle.as_ref().map(|h| h.generation());
        if current != Some(event.generation) {
            debug!(
                session_id = %self.id,
                generation = event.generation,
                current = ?current,
                "Dropping stale loader event"
            );
            return;
        }
        if matches!(self.state, PlaybackState::Error(_)) {
            return;
        }

        match event.kind {
            LoaderEventKind::TracksResolved {
                adapter,
                table,
                timeline,
            } => {
                self.stalled.remove(&(adapter, None));
                if table.representations.is_empty() {
                    debug!(adapter = %adapter, "Ignoring empty track set");
                    return;
                }
                debug!(adapter = %adapter, representations = table.representations.len(), "Track set resolved");
                self.timelines.insert(adapter, timeline);
                self.resolved_adapters.insert(adapter);
                if let Err(e) = self.selection.update_track_table(table) {
                    self.fail(exhausted(e), None);
                    return;
                }
                self.sync_loaders();
            }
            LoaderEventKind::TimelineUpdated { adapter, timeline } => {
                let merged = self
                    .timelines
                    .get(&adapter)
                    .map_or(timeline, |known| known.merge(timeline));
                self.timelines.insert(adapter, merged);
            }
            LoaderEventKind::Loaded {
                adapter,
                track_type,
                id,
                bytes,
            } => {
                if !self.is_current_load(adapter, track_type, &id) {
                    return;
                }
                debug!(adapter = %adapter, track = %track_type, id = %id, bytes, "Representation loaded");
                self.loaded.insert((adapter, track_type));
                self.stalled.remove(&(adapter, Some(track_type)));
                self.announce_tracks();
            }
            LoaderEventKind::Retrying {
                adapter,
                track_type,
                attempt,
                delay_ms,
            } => {
                debug!(adapter = %adapter, track = ?track_type, attempt, delay_ms, "Load backing off");
                self.stalled.insert((adapter, track_type));
            }
            LoaderEventKind::Excluded {
                adapter,
                track_type,
                id,
                duration_ms,
            } => {
                if !self.is_current_load(adapter, track_type, &id) {
                    return;
                }
                self.selection
                    .exclude(adapter, &id, Duration::from_millis(duration_ms));
                self.stop_loader(adapter, track_type);
                match self.selection.revalidate() {
                    Ok(_) => self.sync_loaders(),
                    Err(e) => {
                        self.fail(exhausted(e), None);
                        return;
                    }
                }
            }
            LoaderEventKind::LoadFailed {
                adapter,
                track_type,
                id,
                error,
            } => {
                if !self.is_current_load(adapter, track_type, &id) {
                    return;
                }
                self.fail(error, None);
                return;
            }
            LoaderEventKind::AdapterFailed { adapter, error } => {
                if !self.retire_adapter(adapter, &error) {
                    self.fail(error, None);
                    return;
                }
            }
        }

        self.maybe_ready();
        self.reconcile();
    }

    /// Drop one adapter of a merged source when another one can carry it
    fn retire_adapter(&mut self, adapter: AdapterKind, error: &Error) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if handle.adapter_kinds().len() < 2 {
            return false;
        }

        warn!(session_id = %self.id, adapter = %adapter, error = %error, "Adapter failed, continuing without it");
        handle.retire_adapter(adapter);
        self.timelines.remove(&adapter);
        self.resolved_adapters.remove(&adapter);
        self.loaded.retain(|(a, _)| *a != adapter);
        self.stalled.retain(|(a, _)| *a != adapter);

        match self.selection.remove_track_table(adapter) {
            Ok(_) => {
                self.sync_loaders();
                true
            }
            Err(e) => {
                self.fail(exhausted(e), None);
                true
            }
        }
    }

    fn is_current_load(&self, adapter: AdapterKind, track_type: TrackType, id: &RepresentationId) -> bool {
        self.handle
            .as_ref()
            .and_then(|h| h.loading(adapter, track_type))
            == Some(id)
    }

    fn stop_loader(&mut self, adapter: AdapterKind, track_type: TrackType) {
        if let Some(handle) = self.handle.as_mut() {
            handle.stop_loader(adapter, track_type);
        }
        self.loaded.remove(&(adapter, track_type));
        self.stalled.remove(&(adapter, Some(track_type)));
    }

    /// Start, replace or stop loaders so they match the resolved selection
    fn sync_loaders(&mut self) {
        if matches!(self.state, PlaybackState::Error(_)) {
            return;
        }
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        let mut failure = None;
        for adapter in handle.adapter_kinds() {
            if !self.resolved_adapters.contains(&adapter) {
                continue;
            }
            for track_type in TrackType::ALL {
                match self.selection.selection_for(adapter, track_type) {
                    Some(rep) => {
                        if handle.loading(adapter, track_type) == Some(&rep.id) {
                            continue;
                        }
                        self.loaded.remove(&(adapter, track_type));
                        self.stalled.remove(&(adapter, Some(track_type)));
                        if let Err(e) = handle.load(adapter, rep) {
                            failure = Some(e);
                        }
                    }
                    None => {
                        if handle.stop_loader(adapter, track_type) {
                            self.loaded.remove(&(adapter, track_type));
                            self.stalled.remove(&(adapter, Some(track_type)));
                        }
                    }
                }
            }
        }

        match failure {
            Some(e) => self.fail(e, None),
            None => self.announce_tracks(),
        }
    }

    /// Preparing -> Ready once every adapter published its tracks and every
    /// active loader finished its initial load
    fn maybe_ready(&mut self) {
        if self.state != PlaybackState::Preparing {
            return;
        }
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        let adapters = handle.adapter_kinds();
        if adapters.is_empty() || !adapters.iter().all(|a| self.resolved_adapters.contains(a)) {
            return;
        }

        let mut active = 0;
        for adapter in &adapters {
            for track_type in TrackType::ALL {
                if handle.loading(*adapter, track_type).is_some() {
                    if !self.loaded.contains(&(*adapter, track_type)) {
                        return;
                    }
                    active += 1;
                }
            }
        }
        if active == 0 {
            return;
        }

        self.transition(PlaybackState::Ready);
        if self.source_changed {
            self.source_changed = false;
            if let Some(item) = &self.item {
                self.listener.on_video_loaded(item);
            }
        }
        self.announce_tracks();
    }

    /// Report active tracks whose representation changed since the last report
    fn announce_tracks(&mut self) {
        if !self.state.is_prepared() {
            return;
        }

        let mut changed = false;
        for track_type in TrackType::ALL {
            let selected = self.selection.selected(track_type).cloned();
            let active = selected
                .as_ref()
                .filter(|rep| self.is_active(track_type, &rep.id))
                .cloned();
            // A replacement that is still loading keeps the previous report
            if active.is_none() && selected.is_some() {
                continue;
            }
            if active.as_ref().map(|r| &r.id) == self.announced.get(&track_type) {
                continue;
            }

            match &active {
                Some(rep) => self.announced.insert(track_type, rep.id.clone()),
                None => self.announced.remove(&track_type),
            };
            self.quality.set_track(track_type, active.as_ref());
            self.listener.on_track_changed(track_type, active.as_ref());
            changed = true;
        }

        if changed {
            self.push_quality();
        }
    }

    fn is_active(&self, track_type: TrackType, id: &RepresentationId) -> bool {
        self.resolved_adapters
            .iter()
            .any(|adapter| self.loaded.contains(&(*adapter, track_type)) && self.is_current_load(*adapter, track_type, id))
    }

    /// Derive the observed state from play-when-ready and stalls
    fn reconcile(&mut self) {
        let resumable = self.state.is_prepared() || (self.state == PlaybackState::Ended && !self.ended);
        if !resumable {
            return;
        }

        let target = if self.rebuffering || !self.stalled.is_empty() {
            PlaybackState::Buffering
        } else if self.play_when_ready {
            PlaybackState::Playing
        } else {
            PlaybackState::Paused
        };

        if self.transition(target) {
            match target {
                PlaybackState::Playing => self.listener.on_play(),
                PlaybackState::Paused => self.listener.on_pause(),
                PlaybackState::Buffering if self.play_when_ready => self.listener.on_buffering(),
                _ => {}
            }
        }
    }

    fn on_playback_ended(&mut self) {
        let reachable = self.state.is_prepared() || self.state == PlaybackState::Ended;
        if !reachable || !self.play_when_ready {
            return;
        }
        // Repeated end signals until the position moves back before the end
        if self.ended {
            debug!(session_id = %self.id, "Ignoring repeated end of stream");
            return;
        }
        self.ended = true;
        self.transition(PlaybackState::Ended);
        self.listener.on_play_end();
    }

    async fn on_discontinuity(&mut self, reason: DiscontinuityReason) {
        debug!(session_id = %self.id, ?reason, "Position discontinuity");
        if reason == DiscontinuityReason::AutoTransition && self.handle.is_some() {
            self.close_source().await;
            self.listener.on_play_end();
        }
    }

    fn seek_to(&mut self, position_ms: u64) {
        if self.handle.is_none() {
            return;
        }
        if let Some(duration) = self.duration_ms() {
            if position_ms > duration {
                debug!(position_ms, duration, "Seek beyond duration ignored");
                return;
            }
        }

        debug!(session_id = %self.id, from = self.position_ms, to = position_ms, "Seeking");
        self.position_ms = position_ms;
        if self.before_end(position_ms) {
            self.ended = false;
        }
        self.reconcile();
    }

    fn set_speed(&mut self, speed: f32) {
        if self.handle.is_none() || !speed.is_finite() || speed <= 0.0 {
            return;
        }
        if (speed - self.parameters.speed).abs() < f32::EPSILON {
            return;
        }
        self.parameters.speed = speed;
        self.quality.set_speed(speed);
        self.push_quality();
        self.listener.on_speed_changed(speed);
    }

    fn set_pitch(&mut self, pitch: f32) {
        if self.handle.is_none() || !pitch.is_finite() || pitch <= 0.0 {
            return;
        }
        if (pitch - self.parameters.pitch).abs() < f32::EPSILON {
            return;
        }
        self.parameters.pitch = pitch;
        self.listener.on_speed_changed(self.parameters.speed);
    }

    fn set_volume(&mut self, volume: f32) {
        if self.handle.is_none() || !volume.is_finite() || volume < 0.0 {
            return;
        }
        self.parameters.volume = volume.min(1.0);
    }

    fn select_track(&mut self, track_type: TrackType, id: &RepresentationId) -> Result<()> {
        self.selection.select_track(track_type, id)?;
        let selected = self.selection.selected(track_type).cloned();
        self.listener.on_track_selected(track_type, selected.as_ref());
        self.sync_loaders();
        self.maybe_ready();
        Ok(())
    }

    fn disable_track(&mut self, track_type: TrackType) -> Result<()> {
        self.selection.disable(track_type)?;
        self.listener.on_track_selected(track_type, None);
        self.sync_loaders();
        self.maybe_ready();
        Ok(())
    }

    /// Stop playback of the current source on an unrecoverable failure
    fn fail(&mut self, error: Error, renderer_index: Option<usize>) {
        let kind = error.kind();
        warn!(
            session_id = %self.id,
            code = error.error_code(),
            error = %error,
            "Playback failed"
        );
        if let Some(handle) = self.handle.as_mut() {
            handle.cancel();
        }
        self.stalled.clear();
        self.transition(PlaybackState::Error(kind));
        self.listener.on_engine_error(kind, renderer_index, &error);
    }

    fn transition(&mut self, next: PlaybackState) -> bool {
        let current = self.state;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            debug!(from = %current, to = %next, "Ignoring invalid state transition");
            return false;
        }

        self.state = next;
        self.state_tx.send_replace(next);
        info!(session_id = %self.id, from = %current, to = %next, "State transition");
        true
    }

    fn push_quality(&self) {
        self.quality_sink.on_quality_info(&self.quality.label());
    }

    fn timeline(&self) -> Timeline {
        self.timelines
            .values()
            .fold(Timeline::default(), |acc, t| acc.merge(*t))
    }

    fn duration_ms(&self) -> Option<u64> {
        self.timeline().duration.map(|d| d.as_millis() as u64)
    }

    /// Unknown duration never counts as before the end
    fn before_end(&self, position_ms: u64) -> bool {
        self.duration_ms().is_some_and(|duration| position_ms < duration)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let timeline = self.timeline();
        SessionSnapshot {
            id: self.id,
            state: self.state,
            play_when_ready: self.play_when_ready,
            position_ms: self.position_ms,
            duration_ms: timeline.duration.map(|d| d.as_millis() as u64),
            is_live: timeline.is_live,
            parameters: self.parameters,
            protocol: self.protocol,
            quality_label: self.quality.label(),
            generation: self.handle.as_ref().map(|h| h.generation()),
            selected: TrackType::ALL
                .into_iter()
                .filter_map(|t| self.selection.get_selection(t).map(|id| (t, id)))
                .collect(),
            excluded: self.selection.excluded(),
            bandwidth_estimate: self.ctx.bandwidth().estimate(),
        }
    }
}

/// Exhausted required tracks end playback as a fatal source error
fn exhausted(error: Error) -> Error {
    match error {
        Error::AllRepresentationsExcluded { .. } => Error::fatal(ErrorKind::Source, error.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::listener::{ChannelListener, PlayerEvent};
    use crate::selection::TrackTable;
    use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
    use crate::types::Resolution;
    use async_trait::async_trait;
    use url::Url;

    /// Every request succeeds with a small body
    struct OkTransport;

    #[async_trait]
    impl HttpTransport for OkTransport {
        async fn fetch(&self, _request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            Ok(HttpResponse::ok(vec![0u8; 32]))
        }
    }

    fn context() -> Arc<EngineContext> {
        Arc::new(EngineContext::new(EngineConfig::default(), Arc::new(OkTransport)).unwrap())
    }

    fn catalog() -> StreamCatalog {
        StreamCatalog::from_representations(vec![
            Representation::video("v-720", 2_500_000, Resolution::new(1280, 720))
                .with_uri(Url::parse("https://cdn.example.com/720.mp4").unwrap()),
            Representation::video("v-360", 800_000, Resolution::new(640, 360))
                .with_uri(Url::parse("https://cdn.example.com/360.mp4").unwrap()),
        ])
        .with_item_id("item-1")
    }

    fn session() -> (PlaybackSession, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (listener, rx) = ChannelListener::new();
        let listener = Arc::new(listener);
        let session = PlaybackSession::builder(context())
            .listener(listener.clone())
            .quality_sink(listener)
            .spawn()
            .unwrap();
        (session, rx)
    }

    /// Controller driven by the test instead of its own task
    fn controller() -> (Controller, ControlChannels, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (listener, rx) = ChannelListener::new();
        let listener = Arc::new(listener);
        let (controller, _session, channels) = PlaybackSession::builder(context())
            .listener(listener.clone())
            .quality_sink(listener)
            .build()
            .unwrap();
        (controller, channels, rx)
    }

    async fn open_directly(controller: &mut Controller) -> Generation {
        let (reply, opened) = oneshot::channel();
        controller.open(catalog(), reply).await;
        assert_eq!(opened.await.unwrap().unwrap(), ProtocolKind::Progressive);
        controller.handle.as_ref().unwrap().generation()
    }

    fn tracks(generation: Generation, representations: Vec<Representation>) -> LoaderEvent {
        LoaderEvent {
            generation,
            kind: LoaderEventKind::TracksResolved {
                adapter: AdapterKind::Progressive,
                table: TrackTable::new(AdapterKind::Progressive, representations),
                timeline: Timeline::default(),
            },
        }
    }

    fn loaded(generation: Generation, id: &str) -> LoaderEvent {
        LoaderEvent {
            generation,
            kind: LoaderEventKind::Loaded {
                adapter: AdapterKind::Progressive,
                track_type: TrackType::Video,
                id: RepresentationId::from(id),
                bytes: 32,
            },
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_session_starts_idle() {
        let (session, _rx) = session();
        assert_eq!(session.state(), PlaybackState::Idle);
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.generation, None);
        assert_eq!(snapshot.parameters, PlaybackParameters::default());
        assert_eq!(snapshot.bandwidth_estimate, EngineConfig::default().initial_bitrate_estimate);
        assert!(session.current_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_reaches_paused_then_plays() {
        let (session, mut rx) = session();
        let protocol = session.open(catalog()).await.unwrap();
        assert_eq!(protocol, ProtocolKind::Progressive);

        let state = session.wait_for(|s| s.is_prepared()).await.unwrap();
        assert_eq!(state, PlaybackState::Paused);

        session.play().unwrap();
        session.wait_for(|s| *s == PlaybackState::Playing).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&PlayerEvent::SourceChanged { item_id: Some("item-1".into()) }));
        assert!(events.contains(&PlayerEvent::VideoLoaded { item_id: Some("item-1".into()) }));
        assert!(events.contains(&PlayerEvent::Pause));
        assert!(events.contains(&PlayerEvent::Play));

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.selected.get(&TrackType::Video), Some(&RepresentationId::from("v-720")));
        assert_eq!(snapshot.quality_label, "720p \u{2022} 2.50 Mbps");
    }

    #[tokio::test]
    async fn test_side_channel_without_source_is_noop() {
        let (session, mut rx) = session();
        session.set_speed(2.0).unwrap();
        session.set_volume(0.5).unwrap();
        session.seek_to(1000).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.parameters, PlaybackParameters::default());
        assert_eq!(snapshot.position_ms, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_speed_pitch_volume_rules() {
        let (session, mut rx) = session();
        session.open(catalog()).await.unwrap();

        session.set_speed(0.0).unwrap();
        session.set_speed(1.0).unwrap();
        session.set_speed(1.25).unwrap();
        session.set_pitch(-1.0).unwrap();
        session.set_volume(-0.1).unwrap();
        session.set_volume(3.0).unwrap();

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.parameters.speed, 1.25);
        assert_eq!(snapshot.parameters.pitch, 1.0);
        assert_eq!(snapshot.parameters.volume, 1.0);

        let speed_events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::SpeedChanged { .. }))
            .collect();
        assert_eq!(speed_events, vec![PlayerEvent::SpeedChanged { speed: 1.25 }]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (session, _rx) = session();
        session.stop().await.unwrap();
        session.open(catalog()).await.unwrap();
        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert_eq!(session.state(), PlaybackState::Idle);
        assert_eq!(session.snapshot().await.unwrap().generation, None);
    }

    #[tokio::test]
    async fn test_unsupported_catalog_returns_to_idle() {
        let (session, _rx) = session();
        let err = session.open(StreamCatalog::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(_)));
        assert_eq!(session.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let (session, _rx) = session();
        session.open(catalog()).await.unwrap();
        session.shutdown().await.unwrap();
        assert!(matches!(session.snapshot().await, Err(Error::SessionClosed)));
        assert!(matches!(session.play(), Err(Error::SessionClosed)));
    }

    // ========================================================================
    // Controller-level event handling
    // ========================================================================

    #[tokio::test]
    async fn test_empty_track_set_waits_for_real_one() {
        let (mut controller, _channels, mut rx) = controller();
        let generation = open_directly(&mut controller).await;

        controller.handle_event(tracks(generation, Vec::new())).await;
        assert_eq!(controller.state, PlaybackState::Preparing);
        assert!(controller.resolved_adapters.is_empty());

        controller.handle_event(tracks(generation, catalog().representations)).await;
        controller.handle_event(loaded(generation, "v-720")).await;
        assert!(controller.state.is_prepared());

        // A refreshed table for the same source does not announce it again
        controller.handle_event(tracks(generation, catalog().representations)).await;
        controller.handle_event(loaded(generation, "v-720")).await;

        let video_loaded = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::VideoLoaded { .. }))
            .count();
        assert_eq!(video_loaded, 1);
        controller.close_source().await;
    }

    #[tokio::test]
    async fn test_renderer_error_reported_once() {
        let (mut controller, _channels, mut rx) = controller();
        let generation = open_directly(&mut controller).await;
        controller.handle_event(tracks(generation, catalog().representations)).await;
        controller.handle_event(loaded(generation, "v-720")).await;

        for cause in ["decoder stalled", "decoder stalled again"] {
            controller
                .handle_command(Command::RendererError {
                    renderer_index: Some(0),
                    cause: cause.into(),
                })
                .await;
        }

        assert!(matches!(controller.state, PlaybackState::Error(_)));
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::EngineError { .. }))
            .count();
        assert_eq!(errors, 1);
        controller.close_source().await;
    }

    #[tokio::test]
    async fn test_stale_lookup_outcome_is_dropped() {
        let (mut controller, _channels, _rx) = controller();
        controller.finish_lookup(LookupOutcome {
            lookup: 7,
            result: Ok(ProtocolKind::Dash),
        });
        assert_eq!(controller.state, PlaybackState::Idle);
        assert!(controller.handle.is_none());
    }
}
