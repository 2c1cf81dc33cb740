//! Output formatting for CLI

use cadence_core::{Fingerprint, PlayerEvent, Representation};
use chrono::Local;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Pretty JSON, or an empty object if the value cannot be serialized
pub fn to_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}

/// One row of a representation listing
#[derive(Tabled)]
pub struct RepresentationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    track_type: String,
    #[tabled(rename = "Bitrate")]
    bitrate: String,
    #[tabled(rename = "Resolution")]
    resolution: String,
    #[tabled(rename = "Codec")]
    codec: String,
    #[tabled(rename = "Language")]
    language: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
}

impl From<&Representation> for RepresentationRow {
    fn from(rep: &Representation) -> Self {
        Self {
            id: rep.id.to_string(),
            track_type: rep.track_type.to_string(),
            bitrate: if rep.bitrate > 0 {
                format!("{} kbps", rep.bitrate / 1000)
            } else {
                "-".to_string()
            },
            resolution: rep
                .resolution
                .map(|r| format!("{} ({})", r, r.quality_name()))
                .unwrap_or_else(|| "-".to_string()),
            codec: rep.codec.clone().unwrap_or_else(|| "-".to_string()),
            language: rep.language.clone().unwrap_or_else(|| "-".to_string()),
            fingerprint: Fingerprint::of(rep).to_string(),
        }
    }
}

pub fn representation_table(reps: &[Representation]) -> String {
    Table::new(reps.iter().map(RepresentationRow::from))
        .with(Style::rounded())
        .to_string()
}

/// Timestamped event line
pub fn event_line(event: &PlayerEvent, format: &str) -> String {
    let now = Local::now();
    match OutputFormat::from(format) {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(event).unwrap_or_default();
            if let Some(map) = value.as_object_mut() {
                map.insert("timestamp".into(), now.to_rfc3339().into());
            }
            value.to_string()
        }
        OutputFormat::Table | OutputFormat::Text => {
            format!("{} {}", now.format("%H:%M:%S%.3f"), describe(event))
        }
    }
}

fn describe(event: &PlayerEvent) -> String {
    match event {
        PlayerEvent::SourceChanged { item_id } => format!("source changed {}", item_id.as_deref().unwrap_or("")),
        PlayerEvent::VideoLoaded { .. } => "video loaded".to_string(),
        PlayerEvent::TrackChanged {
            track_type,
            representation,
        } => format!(
            "{} track -> {}",
            track_type,
            representation.as_ref().map(|r| r.id.to_string()).unwrap_or_else(|| "none".into())
        ),
        PlayerEvent::TrackSelected {
            track_type,
            representation,
        } => format!(
            "{} track selected: {}",
            track_type,
            representation.as_ref().map(|r| r.id.to_string()).unwrap_or_else(|| "none".into())
        ),
        PlayerEvent::Play => "play".to_string(),
        PlayerEvent::Pause => "pause".to_string(),
        PlayerEvent::Buffering => "buffering".to_string(),
        PlayerEvent::PlayEnd => "ended".to_string(),
        PlayerEvent::SpeedChanged { speed } => format!("speed {:.2}x", speed),
        PlayerEvent::SeekEnd => "seek done".to_string(),
        PlayerEvent::EngineError {
            kind, code, message, ..
        } => format!("{} error [{}]: {}", kind, code, message),
        PlayerEvent::QualityInfo { label } => format!("quality: {}", label),
    }
}
