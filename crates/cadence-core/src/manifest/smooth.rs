//! Smooth Streaming client manifest parser
//!
//! Reads StreamIndex elements (Type, Language, Url template) and their
//! QualityLevel children. Durations are expressed in TimeScale units,
//! 10 MHz when absent.

use super::{resolve_uri, xml_error, ParsedManifest, XmlAttrs};
use crate::{
    types::{AdapterKind, Representation, RepresentationId, Resolution, Timeline, TrackType},
    Error, Result,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_TIMESCALE: u64 = 10_000_000;

/// Parse a Smooth Streaming manifest
pub fn parse_smooth(content: &str, base_url: &Url) -> Result<ParsedManifest> {
    let mut reader = Reader::from_str(content);
    let mut manifest = SmoothReader::new(base_url);

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(tag) => manifest.open(&tag, false)?,
            Event::Empty(tag) => manifest.open(&tag, true)?,
            Event::End(tag) => manifest.close(tag.local_name().as_ref()),
            Event::Eof => break,
            _ => {}
        }
    }

    manifest.finish()
}

struct StreamContext {
    track_type: TrackType,
    name: Option<String>,
    language: Option<String>,
    template: Option<String>,
    levels: usize,
}

struct SmoothReader<'a> {
    base_url: &'a Url,
    seen_root: bool,
    root_closed: bool,
    timescale: u64,
    is_live: bool,
    duration: Option<Duration>,
    /// `None` inside a StreamIndex of an unsupported type
    stream: Option<StreamContext>,
    representations: Vec<Representation>,
}

impl<'a> SmoothReader<'a> {
    fn new(base_url: &'a Url) -> Self {
        Self {
            base_url,
            seen_root: false,
            root_closed: false,
            timescale: DEFAULT_TIMESCALE,
            is_live: false,
            duration: None,
            stream: None,
            representations: Vec::new(),
        }
    }

    fn open(&mut self, tag: &BytesStart<'_>, empty: bool) -> Result<()> {
        let name = tag.local_name();
        if !self.seen_root {
            if name.as_ref() != b"SmoothStreamingMedia" {
                return Err(Error::MalformedManifest("missing <SmoothStreamingMedia> root".into()));
            }
            self.seen_root = true;
            self.root(&XmlAttrs::of(tag)?);
            if empty {
                self.root_closed = true;
            }
            return Ok(());
        }

        match name.as_ref() {
            b"StreamIndex" => {
                let attrs = XmlAttrs::of(tag)?;
                let track_type = match attrs.get("Type") {
                    Some("video") => Some(TrackType::Video),
                    Some("audio") => Some(TrackType::Audio),
                    Some("text") => Some(TrackType::Subtitle),
                    _ => None,
                };
                self.stream = track_type.map(|track_type| StreamContext {
                    track_type,
                    name: attrs.owned("Name"),
                    language: attrs.owned("Language"),
                    template: attrs.owned("Url"),
                    levels: 0,
                });
                if empty {
                    self.stream = None;
                }
            }
            b"QualityLevel" => {
                let attrs = XmlAttrs::of(tag)?;
                if let Some(rep) = self.quality_level(&attrs)? {
                    self.representations.push(rep);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"StreamIndex" => self.stream = None,
            b"SmoothStreamingMedia" => self.root_closed = true,
            _ => {}
        }
    }

    fn root(&mut self, attrs: &XmlAttrs) {
        self.timescale = attrs
            .parse::<u64>("TimeScale")
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMESCALE);
        self.is_live = attrs
            .get("IsLive")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        self.duration = attrs
            .parse::<u64>("Duration")
            .filter(|d| *d > 0 && !self.is_live)
            .map(|d| Duration::from_secs_f64(d as f64 / self.timescale as f64));
    }

    fn quality_level(&mut self, attrs: &XmlAttrs) -> Result<Option<Representation>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let idx = stream.levels;
        stream.levels += 1;

        let bitrate = attrs.parse::<u64>("Bitrate").unwrap_or(0);
        let resolution = match (attrs.parse::<u32>("MaxWidth"), attrs.parse::<u32>("MaxHeight")) {
            (Some(w), Some(h)) => Some(Resolution::new(w, h)),
            _ => None,
        };

        // Fragment URL template with the bitrate bound; fragment start time stays open
        let uri = match &stream.template {
            Some(t) => Some(resolve_uri(self.base_url, &t.replace("{bitrate}", &bitrate.to_string()))?),
            None => None,
        };

        let index = attrs.owned("Index").unwrap_or_else(|| idx.to_string());
        let prefix = stream
            .name
            .clone()
            .unwrap_or_else(|| stream.track_type.to_string());
        Ok(Some(Representation {
            id: RepresentationId(format!("{}_{}", prefix, index)),
            track_type: stream.track_type,
            codec: attrs.get("FourCC").map(|c| c.to_lowercase()),
            bitrate,
            language: stream.language.clone(),
            resolution,
            frame_rate: None,
            uri,
            label: stream.name.clone(),
        }))
    }

    fn finish(mut self) -> Result<ParsedManifest> {
        if !self.seen_root {
            return Err(Error::MalformedManifest("missing <SmoothStreamingMedia> root".into()));
        }
        if !self.root_closed {
            return Err(Error::MalformedManifest(
                "unterminated <SmoothStreamingMedia> element".into(),
            ));
        }
        if self.representations.is_empty() {
            return Err(Error::MalformedManifest(
                "No quality levels found in Smooth Streaming manifest".to_string(),
            ));
        }

        self.representations.sort_by_key(|r| (r.track_type, r.bitrate));

        debug!(
            representations = self.representations.len(),
            is_live = self.is_live,
            "Smooth Streaming manifest parsed"
        );

        Ok(ParsedManifest {
            kind: AdapterKind::SmoothStreaming,
            representations: self.representations,
            timeline: Timeline {
                duration: self.duration,
                is_live: self.is_live,
            },
        })
    }
}
