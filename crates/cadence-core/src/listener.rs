//! Outbound notifications
//!
//! `PlayerEventListener` receives lifecycle notifications from the session
//! control task. Every method has a no-op default, so hosts implement only
//! what they display. `ChannelListener` forwards them as `PlayerEvent`
//! values for hosts that prefer a stream.
//!
//! `QualityLabel` derives the human-readable quality string pushed to a
//! `QualityInfoSink`.

use crate::{
    types::{ErrorKind, Representation, StreamCatalog, TrackType},
    Error,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lifecycle notifications of a playback session.
///
/// Called from the session control task; implementations must not block.
pub trait PlayerEventListener: Send + Sync {
    /// A new item was opened
    fn on_source_changed(&self, _item: &StreamCatalog) {}

    /// First track set of the item resolved; once per open
    fn on_video_loaded(&self, _item: &StreamCatalog) {}

    /// The representation played for a track type changed
    fn on_track_changed(&self, _track_type: TrackType, _representation: Option<&Representation>) {}

    /// The user picked a representation (`None` disables the track type)
    fn on_track_selected(&self, _track_type: TrackType, _representation: Option<&Representation>) {}

    fn on_play(&self) {}

    fn on_pause(&self) {}

    fn on_buffering(&self) {}

    fn on_play_end(&self) {}

    fn on_speed_changed(&self, _speed: f32) {}

    fn on_seek_end(&self) {}

    /// Playback of the current source stopped on an unrecoverable failure
    fn on_engine_error(&self, _kind: ErrorKind, _renderer_index: Option<usize>, _cause: &Error) {}
}

/// Listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl PlayerEventListener for NoopListener {}

/// Receives the current quality label
pub trait QualityInfoSink: Send + Sync {
    fn on_quality_info(&self, label: &str);
}

/// Sink that ignores labels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQualitySink;

impl QualityInfoSink for NoopQualitySink {
    fn on_quality_info(&self, _label: &str) {}
}

/// Listener notification as a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    SourceChanged {
        item_id: Option<String>,
    },
    VideoLoaded {
        item_id: Option<String>,
    },
    TrackChanged {
        track_type: TrackType,
        representation: Option<Representation>,
    },
    TrackSelected {
        track_type: TrackType,
        representation: Option<Representation>,
    },
    Play,
    Pause,
    Buffering,
    PlayEnd,
    SpeedChanged {
        speed: f32,
    },
    SeekEnd,
    EngineError {
        kind: ErrorKind,
        renderer_index: Option<usize>,
        code: String,
        message: String,
    },
    QualityInfo {
        label: String,
    },
}

/// Forwards notifications and quality labels over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<PlayerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PlayerEvent) {
        // The receiver going away only means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

impl PlayerEventListener for ChannelListener {
    fn on_source_changed(&self, item: &StreamCatalog) {
        self.send(PlayerEvent::SourceChanged {
            item_id: item.item_id.clone(),
        });
    }

    fn on_video_loaded(&self, item: &StreamCatalog) {
        self.send(PlayerEvent::VideoLoaded {
            item_id: item.item_id.clone(),
        });
    }

    fn on_track_changed(&self, track_type: TrackType, representation: Option<&Representation>) {
        self.send(PlayerEvent::TrackChanged {
            track_type,
            representation: representation.cloned(),
        });
    }

    fn on_track_selected(&self, track_type: TrackType, representation: Option<&Representation>) {
        self.send(PlayerEvent::TrackSelected {
            track_type,
            representation: representation.cloned(),
        });
    }

    fn on_play(&self) {
        self.send(PlayerEvent::Play);
    }

    fn on_pause(&self) {
        self.send(PlayerEvent::Pause);
    }

    fn on_buffering(&self) {
        self.send(PlayerEvent::Buffering);
    }

    fn on_play_end(&self) {
        self.send(PlayerEvent::PlayEnd);
    }

    fn on_speed_changed(&self, speed: f32) {
        self.send(PlayerEvent::SpeedChanged { speed });
    }

    fn on_seek_end(&self) {
        self.send(PlayerEvent::SeekEnd);
    }

    fn on_engine_error(&self, kind: ErrorKind, renderer_index: Option<usize>, cause: &Error) {
        self.send(PlayerEvent::EngineError {
            kind,
            renderer_index,
            code: cause.error_code().to_string(),
            message: cause.to_string(),
        });
    }
}

impl QualityInfoSink for ChannelListener {
    fn on_quality_info(&self, label: &str) {
        self.send(PlayerEvent::QualityInfo {
            label: label.to_string(),
        });
    }
}

/// Frame rates from this value on are shown next to the resolution
const HIGH_FRAME_RATE: f32 = 49.0;

const SEPARATOR: &str = " \u{2022} ";

/// Quality label built from the active tracks and the playback speed,
/// e.g. `1080p60 • 4.50 Mbps • 1.25x`
#[derive(Debug, Clone, PartialEq)]
pub struct QualityLabel {
    video: Option<Representation>,
    audio: Option<Representation>,
    speed: f32,
    show_bitrate: bool,
}

impl Default for QualityLabel {
    fn default() -> Self {
        Self {
            video: None,
            audio: None,
            speed: 1.0,
            show_bitrate: true,
        }
    }
}

impl QualityLabel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bitrate(mut self, show: bool) -> Self {
        self.show_bitrate = show;
        self
    }

    pub fn enable_bitrate(&mut self, show: bool) {
        self.show_bitrate = show;
    }

    /// Record the active representation of its track type
    pub fn set_track(&mut self, track_type: TrackType, representation: Option<&Representation>) {
        match track_type {
            TrackType::Video => self.video = representation.cloned(),
            TrackType::Audio => self.audio = representation.cloned(),
            TrackType::Subtitle => {}
        }
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
    }

    /// Forget the tracks; speed and bitrate display survive
    pub fn clear_tracks(&mut self) {
        self.video = None;
        self.audio = None;
    }

    pub fn label(&self) -> String {
        let mut parts = Vec::with_capacity(3);

        if let Some(resolution) = self.video.as_ref().and_then(|v| v.resolution) {
            let mut quality = resolution.quality_name().to_string();
            if let Some(fps) = self.video.as_ref().and_then(|v| v.frame_rate) {
                if fps >= HIGH_FRAME_RATE {
                    quality.push_str(&format!("{}", fps.round() as u32));
                }
            }
            parts.push(quality);
        }

        if self.show_bitrate {
            match (&self.video, &self.audio) {
                (Some(video), _) if video.bitrate > 0 => {
                    parts.push(format!("{:.2} Mbps", video.bitrate as f64 / 1_000_000.0));
                }
                (_, Some(audio)) if audio.bitrate > 0 => {
                    parts.push(format!("{} kbps", audio.bitrate / 1000));
                }
                _ => {}
            }
        }

        if (self.speed - 1.0).abs() > f32::EPSILON {
            parts.push(format!("{:.2}x", self.speed));
        }

        parts.join(SEPARATOR)
    }
}

impl std::fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}
