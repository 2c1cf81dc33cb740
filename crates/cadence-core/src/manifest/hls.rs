//! HLS (HTTP Live Streaming) playlist parser
//!
//! Implements parsing for:
//! - Master playlists (variants and EXT-X-MEDIA renditions)
//! - Media playlists (segments, end list)

use super::{resolve_uri, ParsedManifest};
use crate::{
    types::{AdapterKind, Representation, RepresentationId, Resolution, Timeline, TrackType},
    Error, Result,
};
use m3u8_rs::{AlternativeMediaType, MasterPlaylist, MediaPlaylist, Playlist};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// One media segment of a media playlist
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegmentRef {
    /// Media sequence number
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
}

/// Parse a master or media playlist into representations
pub fn parse_hls(bytes: &[u8], base_url: &Url) -> Result<ParsedManifest> {
    let playlist = m3u8_rs::parse_playlist_res(bytes)
        .map_err(|e| Error::MalformedManifest(format!("Failed to parse HLS playlist: {:?}", e)))?;

    match playlist {
        Playlist::MasterPlaylist(master) => parse_master(&master, base_url),
        Playlist::MediaPlaylist(media) => {
            // Single rendition: the media playlist itself is the entry point
            let timeline = media_timeline(&media);
            let mut rep = Representation::new("default", TrackType::Video, 0);
            rep.uri = Some(base_url.clone());
            Ok(ParsedManifest {
                kind: AdapterKind::Hls,
                representations: vec![rep],
                timeline,
            })
        }
    }
}

/// Parse the segments of a media playlist
pub fn parse_media_segments(bytes: &[u8], base_url: &Url) -> Result<(Vec<MediaSegmentRef>, Timeline)> {
    let media = m3u8_rs::parse_media_playlist_res(bytes)
        .map_err(|e| Error::MalformedManifest(format!("Failed to parse HLS media: {:?}", e)))?;

    let segments = media
        .segments
        .iter()
        .enumerate()
        .map(|(idx, seg)| {
            Ok(MediaSegmentRef {
                sequence: media.media_sequence + idx as u64,
                uri: resolve_uri(base_url, &seg.uri)?,
                duration: Duration::from_secs_f32(seg.duration.max(0.0)),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((segments, media_timeline(&media)))
}

fn media_timeline(media: &MediaPlaylist) -> Timeline {
    let is_live = !media.end_list;
    let duration = if media.end_list {
        Some(Duration::from_secs_f32(
            media.segments.iter().map(|s| s.duration.max(0.0)).sum(),
        ))
    } else {
        None
    };
    Timeline { duration, is_live }
}

fn parse_master(master: &MasterPlaylist, base_url: &Url) -> Result<ParsedManifest> {
    let mut representations = Vec::new();

    for (idx, variant) in master.variants.iter().enumerate() {
        if variant.is_i_frame {
            continue;
        }
        let uri = resolve_uri(base_url, &variant.uri)?;

        let resolution = variant
            .resolution
            .map(|r| Resolution::new(r.width as u32, r.height as u32));

        let track_type = match (&resolution, variant.codecs.as_deref()) {
            (None, Some(codecs)) if is_audio_only(codecs) => TrackType::Audio,
            _ => TrackType::Video,
        };

        representations.push(Representation {
            id: RepresentationId(format!("variant_{}", idx)),
            track_type,
            codec: variant.codecs.clone(),
            bitrate: variant.bandwidth,
            language: None,
            resolution,
            frame_rate: variant.frame_rate.map(|f| f as f32),
            uri: Some(uri),
            label: variant.video.clone(),
        });
    }

    for alternative in &master.alternatives {
        let track_type = match alternative.media_type {
            AlternativeMediaType::Audio => TrackType::Audio,
            AlternativeMediaType::Subtitles => TrackType::Subtitle,
            _ => continue,
        };
        // Renditions without a URI are muxed into the variant stream
        let Some(relative) = alternative.uri.as_deref() else {
            continue;
        };

        representations.push(Representation {
            id: RepresentationId(format!("{}_{}_{}", track_type, alternative.group_id, alternative.name)),
            track_type,
            codec: None,
            bitrate: 0,
            language: alternative.language.clone(),
            resolution: None,
            frame_rate: None,
            uri: Some(resolve_uri(base_url, relative)?),
            label: Some(alternative.name.clone()),
        });
    }

    if representations.is_empty() {
        return Err(Error::MalformedManifest(
            "HLS master playlist has no playable variants".to_string(),
        ));
    }

    // Sort by bandwidth within each track type
    representations.sort_by_key(|r| (r.track_type, r.bitrate));

    debug!(representations = representations.len(), "HLS master parsed");

    Ok(ParsedManifest {
        kind: AdapterKind::Hls,
        representations,
        // Live/duration are known once a media playlist is loaded
        timeline: Timeline::default(),
    })
}

fn is_audio_only(codecs: &str) -> bool {
    codecs.split(',').all(|c| {
        let c = c.trim().to_lowercase();
        c.starts_with("mp4a") || c.starts_with("ac-3") || c.starts_with("ec-3") || c.starts_with("opus") || c.starts_with("flac")
    })
}
