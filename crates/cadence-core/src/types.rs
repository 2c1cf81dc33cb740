//! Core types for Cadence

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Base URL used to resolve relative URIs of a manifest supplied as raw bytes
pub const INLINE_MANIFEST_BASE: &str = "https://localhost/inline.mpd";

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

impl TrackType {
    pub const ALL: [TrackType; 3] = [TrackType::Video, TrackType::Audio, TrackType::Subtitle];

    /// Video and audio must always hold a selection when the catalog offers them
    pub fn is_required(&self) -> bool {
        !matches!(self, TrackType::Subtitle)
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
            TrackType::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Catalog-local representation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepresentationId(pub String);

impl RepresentationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RepresentationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RepresentationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RepresentationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns quality tier name
    pub fn quality_name(&self) -> &'static str {
        match self.height {
            0..=144 => "144p",
            145..=240 => "240p",
            241..=360 => "360p",
            361..=480 => "480p",
            481..=720 => "720p",
            721..=1080 => "1080p",
            1081..=1440 => "1440p",
            1441..=2160 => "2160p",
            _ => "4320p",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One concrete encoded variant of a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    /// Catalog-local identifier
    pub id: RepresentationId,
    /// Track classification
    pub track_type: TrackType,
    /// RFC 6381 codec string (e.g. "avc1.640028")
    pub codec: Option<String>,
    /// Bitrate in bits per second
    pub bitrate: u64,
    /// BCP-47 language code
    pub language: Option<String>,
    /// Video resolution
    pub resolution: Option<Resolution>,
    /// Frame rate
    pub frame_rate: Option<f32>,
    /// Media resource (segment base, media playlist, or progressive file)
    pub uri: Option<Url>,
    /// Human-readable name
    pub label: Option<String>,
}

impl Representation {
    pub fn new(id: impl Into<String>, track_type: TrackType, bitrate: u64) -> Self {
        Self {
            id: RepresentationId(id.into()),
            track_type,
            codec: None,
            bitrate,
            language: None,
            resolution: None,
            frame_rate: None,
            uri: None,
            label: None,
        }
    }

    pub fn video(id: impl Into<String>, bitrate: u64, resolution: Resolution) -> Self {
        let mut rep = Self::new(id, TrackType::Video, bitrate);
        rep.resolution = Some(resolution);
        rep
    }

    pub fn audio(id: impl Into<String>, bitrate: u64, language: impl Into<String>) -> Self {
        let mut rep = Self::new(id, TrackType::Audio, bitrate);
        rep.language = Some(language.into());
        rep
    }

    pub fn subtitle(id: impl Into<String>, language: impl Into<String>) -> Self {
        let mut rep = Self::new(id, TrackType::Subtitle, 0);
        rep.language = Some(language.into());
        rep
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_uri(mut self, uri: Url) -> Self {
        self.uri = Some(uri);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Codec family without profile/level suffix ("avc1.640028" -> "avc1")
    pub fn codec_family(&self) -> Option<String> {
        self.codec
            .as_deref()
            .and_then(|c| c.split(['.', ',']).next())
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
    }
}

/// Concrete protocol adapter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Dash,
    Hls,
    SmoothStreaming,
    Progressive,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Dash => write!(f, "dash"),
            AdapterKind::Hls => write!(f, "hls"),
            AdapterKind::SmoothStreaming => write!(f, "smooth_streaming"),
            AdapterKind::Progressive => write!(f, "progressive"),
        }
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dash" | "mpd" => Ok(AdapterKind::Dash),
            "hls" | "m3u8" => Ok(AdapterKind::Hls),
            "ss" | "smooth" | "smooth_streaming" => Ok(AdapterKind::SmoothStreaming),
            "progressive" | "other" => Ok(AdapterKind::Progressive),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Resolved protocol for one catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Dash,
    Hls,
    SmoothStreaming,
    Progressive,
    /// Two adapters whose timelines are exposed as one logical source
    Merged(AdapterKind, AdapterKind),
}

impl ProtocolKind {
    /// Adapters this protocol needs, primary first
    pub fn adapters(&self) -> Vec<AdapterKind> {
        match self {
            ProtocolKind::Dash => vec![AdapterKind::Dash],
            ProtocolKind::Hls => vec![AdapterKind::Hls],
            ProtocolKind::SmoothStreaming => vec![AdapterKind::SmoothStreaming],
            ProtocolKind::Progressive => vec![AdapterKind::Progressive],
            ProtocolKind::Merged(primary, secondary) => vec![*primary, *secondary],
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, ProtocolKind::Merged(..))
    }
}

impl From<AdapterKind> for ProtocolKind {
    fn from(kind: AdapterKind) -> Self {
        match kind {
            AdapterKind::Dash => ProtocolKind::Dash,
            AdapterKind::Hls => ProtocolKind::Hls,
            AdapterKind::SmoothStreaming => ProtocolKind::SmoothStreaming,
            AdapterKind::Progressive => ProtocolKind::Progressive,
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Dash => write!(f, "dash"),
            ProtocolKind::Hls => write!(f, "hls"),
            ProtocolKind::SmoothStreaming => write!(f, "smooth_streaming"),
            ProtocolKind::Progressive => write!(f, "progressive"),
            ProtocolKind::Merged(a, b) => write!(f, "merged({}, {})", a, b),
        }
    }
}

/// Description of the available representations of one media item.
///
/// Immutable once received. Any combination of structured representations,
/// raw manifest bytes and URLs may be present; see `ProtocolResolver`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamCatalog {
    /// Caller-side item identifier
    pub item_id: Option<String>,
    /// Caller-side title
    pub title: Option<String>,
    /// Structured representation list
    pub representations: Vec<Representation>,
    /// Raw manifest bytes
    #[serde(skip)]
    pub manifest_bytes: Option<Bytes>,
    /// Manifest URL (DASH/SS manifest, HLS playlist, or progressive file)
    pub manifest_url: Option<Url>,
    /// Fallback HLS playlist for the same content
    pub playlist_url: Option<Url>,
    /// Plain media URLs, best first
    pub url_list: Vec<Url>,
    /// Explicit protocol hint
    pub protocol_hint: Option<AdapterKind>,
    /// Content type reported by the catalog provider
    pub content_type: Option<String>,
}

impl StreamCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_representations(representations: Vec<Representation>) -> Self {
        Self {
            representations,
            ..Default::default()
        }
    }

    pub fn from_manifest_url(url: Url) -> Self {
        Self {
            manifest_url: Some(url),
            ..Default::default()
        }
    }

    pub fn from_manifest_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            manifest_bytes: Some(bytes.into()),
            ..Default::default()
        }
    }

    pub fn with_item_id(mut self, id: impl Into<String>) -> Self {
        self.item_id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_hint(mut self, hint: AdapterKind) -> Self {
        self.protocol_hint = Some(hint);
        self
    }

    pub fn with_manifest_url(mut self, url: Url) -> Self {
        self.manifest_url = Some(url);
        self
    }

    pub fn with_manifest_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.manifest_bytes = Some(bytes.into());
        self
    }

    pub fn with_playlist_url(mut self, url: Url) -> Self {
        self.playlist_url = Some(url);
        self
    }

    pub fn with_url_list(mut self, urls: Vec<Url>) -> Self {
        self.url_list = urls;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.representations.is_empty()
            && self.manifest_bytes.is_none()
            && self.manifest_url.is_none()
            && self.playlist_url.is_none()
            && self.url_list.is_empty()
    }

    /// Primary URL: manifest URL, else the first (best) entry of the URL list
    pub fn primary_url(&self) -> Option<&Url> {
        self.manifest_url.as_ref().or_else(|| self.url_list.first())
    }

    /// Representations of one track type
    pub fn representations_of(&self, track_type: TrackType) -> impl Iterator<Item = &Representation> {
        self.representations
            .iter()
            .filter(move |r| r.track_type == track_type)
    }
}

/// Externally reported failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Loading or parsing the source
    Source,
    /// Decoder/renderer failure
    Renderer,
    /// Unexpected internal failure
    Unexpected,
    /// Remote component failure
    Remote,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Source => write!(f, "source"),
            ErrorKind::Renderer => write!(f, "renderer"),
            ErrorKind::Unexpected => write!(f, "unexpected"),
            ErrorKind::Remote => write!(f, "remote"),
        }
    }
}

/// Playback state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    /// No source open
    Idle,
    /// Source open, waiting for the first track set
    Preparing,
    /// Track set resolved
    Ready,
    /// Content is playing
    Playing,
    /// Playback paused
    Paused,
    /// Stalled on rebuffering or load backoff
    Buffering,
    /// End of stream reached
    Ended,
    /// Terminal for the current source
    Error(ErrorKind),
}

impl PlaybackState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlaybackState) -> bool {
        use PlaybackState::*;
        match (self, target) {
            // Stop is always allowed
            (_, Idle) => true,
            // Error is terminal for the current source
            (Error(_), Preparing) => true,
            (Error(_), _) => false,
            (_, Error(_)) => true,
            (Idle, Preparing) | (Ended, Preparing) => true,
            (Preparing, Ready) => true,
            (Ready, Playing) | (Ready, Paused) | (Ready, Buffering) => true,
            (Playing, Paused) | (Playing, Buffering) | (Playing, Ended) => true,
            (Paused, Playing) | (Paused, Buffering) | (Paused, Ended) => true,
            (Buffering, Playing) | (Buffering, Paused) | (Buffering, Ended) => true,
            // Seeking back after the end
            (Ended, Playing) | (Ended, Paused) | (Ended, Buffering) => true,
            _ => false,
        }
    }

    /// True once the first track set has been resolved
    pub fn is_prepared(&self) -> bool {
        matches!(
            self,
            PlaybackState::Ready
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Buffering
        )
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Preparing => write!(f, "preparing"),
            PlaybackState::Ready => write!(f, "ready"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Buffering => write!(f, "buffering"),
            PlaybackState::Ended => write!(f, "ended"),
            PlaybackState::Error(kind) => write!(f, "error({})", kind),
        }
    }
}

/// Why the playback position jumped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscontinuityReason {
    /// Automatic transition to the next period/item
    AutoTransition,
    /// User seek
    Seek,
    /// Seek adjusted by the source
    SeekAdjustment,
    /// Ad or chapter skip
    Skip,
    /// Current item removed
    Remove,
    /// Internal renderer reason
    Internal,
}

/// Speed, pitch and volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackParameters {
    pub speed: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for PlaybackParameters {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

/// Timeline exposed by a source handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    /// Total duration (for VOD)
    pub duration: Option<Duration>,
    /// Is this a live stream
    pub is_live: bool,
}

impl Timeline {
    /// Align two adapter timelines into one logical timeline
    pub fn merge(self, other: Timeline) -> Timeline {
        let duration = match (self.duration, other.duration) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Timeline {
            duration,
            is_live: self.is_live || other.is_live,
        }
    }
}
