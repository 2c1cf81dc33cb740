//! DASH (Dynamic Adaptive Streaming over HTTP) manifest parser
//!
//! Extracts:
//! - AdaptationSets (content type, language)
//! - Representations (bandwidth, codecs, resolution, frame rate, BaseURL)
//! - Presentation duration and static/dynamic type

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

/// Parse MPD content
pub fn parse_mpd(content: &str, base_url: &Url) -> Result<ParsedManifest> {
    let mut reader = Reader::from_str(content);
    let mut mpd = MpdReader::new(base_url);

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(tag) => mpd.open(&tag, false)?,
            Event::Empty(tag) => mpd.open(&tag, true)?,
            Event::End(_) => mpd.close()?,
            Event::Text(text) => mpd.text(&text.unescape().map_err(xml_error)?),
            Event::Eof => break,
            _ => {}
        }
    }

    mpd.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Mpd,
    Period,
    AdaptationSet,
    Representation,
    BaseUrl,
    Other,
}

impl Element {
    fn of(tag: &BytesStart<'_>) -> Self {
        match tag.local_name().as_ref() {
            b"MPD" => Element::Mpd,
            b"Period" => Element::Period,
            b"AdaptationSet" => Element::AdaptationSet,
            b"Representation" => Element::Representation,
            b"BaseURL" => Element::BaseUrl,
            _ => Element::Other,
        }
    }
}

#[derive(Default)]
struct SetContext {
    index: usize,
    track_type: Option<TrackType>,
    language: Option<String>,
    base: Option<String>,
    representations: usize,
}

struct PendingRepresentation {
    attrs: XmlAttrs,
    index: usize,
    base: Option<String>,
}

/// Element-by-element MPD state; BaseURLs nest MPD > Period > AdaptationSet > Representation
struct MpdReader<'a> {
    manifest_url: &'a Url,
    stack: Vec<Element>,
    seen_root: bool,
    root_closed: bool,
    is_live: bool,
    duration: Option<Duration>,
    mpd_base: Option<String>,
    period_base: Option<String>,
    sets: usize,
    set: SetContext,
    pending: Option<PendingRepresentation>,
    representations: Vec<Representation>,
}

impl<'a> MpdReader<'a> {
    fn new(manifest_url: &'a Url) -> Self {
        Self {
            manifest_url,
            stack: Vec::new(),
            seen_root: false,
            root_closed: false,
            is_live: false,
            duration: None,
            mpd_base: None,
            period_base: None,
            sets: 0,
            set: SetContext::default(),
            pending: None,
            representations: Vec::new(),
        }
    }

    fn open(&mut self, tag: &BytesStart<'_>, empty: bool) -> Result<()> {
        let element = Element::of(tag);
        if !self.seen_root {
            if element != Element::Mpd {
                return Err(Error::MalformedManifest("missing <MPD> root element".into()));
            }
            self.seen_root = true;
        }

        match element {
            Element::Mpd => {
                let attrs = XmlAttrs::of(tag)?;
                self.is_live = attrs.get("type") == Some("dynamic");
                self.duration = attrs
                    .get("mediaPresentationDuration")
                    .and_then(parse_iso8601_duration);
            }
            Element::Period => self.period_base = None,
            Element::AdaptationSet => {
                let attrs = XmlAttrs::of(tag)?;
                self.set = SetContext {
                    index: self.sets,
                    track_type: attrs
                        .get("contentType")
                        .and_then(track_type_from_content_type)
                        .or_else(|| attrs.get("mimeType").and_then(track_type_from_mime)),
                    language: attrs.owned("lang"),
                    ..SetContext::default()
                };
                self.sets += 1;
            }
            Element::Representation => {
                let index = self.set.representations;
                self.set.representations += 1;
                self.pending = Some(PendingRepresentation {
                    attrs: XmlAttrs::of(tag)?,
                    index,
                    base: None,
                });
            }
            Element::Other if self.stack.last() == Some(&Element::AdaptationSet) => {
                // ContentComponent may carry the set's content type
                if tag.local_name().as_ref() == b"ContentComponent" && self.set.track_type.is_none() {
                    self.set.track_type = XmlAttrs::of(tag)?
                        .get("contentType")
                        .and_then(track_type_from_content_type);
                }
            }
            Element::BaseUrl | Element::Other => {}
        }

        if empty {
            self.finish_element(element)
        } else {
            self.stack.push(element);
            Ok(())
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(element) => self.finish_element(element),
            None => Err(Error::MalformedManifest("unexpected closing tag".into())),
        }
    }

    fn finish_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Mpd => self.root_closed = true,
            Element::Representation => {
                if let Some(pending) = self.pending.take() {
                    let rep = self.representation(pending)?;
                    self.representations.push(rep);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() || self.stack.last() != Some(&Element::BaseUrl) {
            return;
        }
        let parent = self.stack.len().checked_sub(2).map(|i| self.stack[i]);
        let value = Some(text.to_string());
        match parent {
            Some(Element::Mpd) => self.mpd_base = value,
            Some(Element::Period) => self.period_base = value,
            Some(Element::AdaptationSet) => self.set.base = value,
            Some(Element::Representation) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.base = value;
                }
            }
            _ => {}
        }
    }

    fn representation(&self, pending: PendingRepresentation) -> Result<Representation> {
        let attrs = &pending.attrs;
        let resolution = match (attrs.parse::<u32>("width"), attrs.parse::<u32>("height")) {
            (Some(w), Some(h)) => Some(Resolution::new(w, h)),
            _ => None,
        };
        let codec = attrs.owned("codecs");
        let track_type = attrs
            .get("mimeType")
            .and_then(track_type_from_mime)
            .or(self.set.track_type)
            .unwrap_or_else(|| infer_track_type(resolution, codec.as_deref()));
        let id = attrs
            .owned("id")
            .unwrap_or_else(|| format!("rep_{}_{}", self.set.index, pending.index));

        Ok(Representation {
            id: RepresentationId(id),
            track_type,
            codec,
            bitrate: attrs.parse("bandwidth").unwrap_or(0),
            language: self.set.language.clone(),
            resolution,
            frame_rate: attrs.get("frameRate").and_then(parse_frame_rate),
            // No BaseURL anywhere means the manifest URL itself
            uri: Some(self.resolve_base(pending.base.as_deref())?),
            label: attrs.owned("label"),
        })
    }

    fn resolve_base(&self, representation: Option<&str>) -> Result<Url> {
        let levels = [
            self.mpd_base.as_deref(),
            self.period_base.as_deref(),
            self.set.base.as_deref(),
            representation,
        ];
        let mut base = self.manifest_url.clone();
        for relative in levels.into_iter().flatten() {
            base = resolve_uri(&base, relative)?;
        }
        Ok(base)
    }

    fn finish(mut self) -> Result<ParsedManifest> {
        if !self.seen_root {
            return Err(Error::MalformedManifest("missing <MPD> root element".into()));
        }
        if !self.root_closed {
            return Err(Error::MalformedManifest("unterminated <MPD> element".into()));
        }
        if self.representations.is_empty() {
            return Err(Error::MalformedManifest(
                "No representations found in MPD".to_string(),
            ));
        }

        // Sort by bandwidth within each track type
        self.representations.sort_by_key(|r| (r.track_type, r.bitrate));

        debug!(
            representations = self.representations.len(),
            is_live = self.is_live,
            duration_s = self.duration.map(|d| d.as_secs_f64()),
            "MPD parsed"
        );

        Ok(ParsedManifest {
            kind: AdapterKind::Dash,
            representations: self.representations,
            timeline: Timeline {
                duration: self.duration,
                is_live: self.is_live,
            },
        })
    }
}

fn track_type_from_content_type(content_type: &str) -> Option<TrackType> {
    match content_type {
        "video" => Some(TrackType::Video),
        "audio" => Some(TrackType::Audio),
        "text" => Some(TrackType::Subtitle),
        _ => None,
    }
}

fn track_type_from_mime(mime: &str) -> Option<TrackType> {
    if mime.starts_with("video/") {
        Some(TrackType::Video)
    } else if mime.starts_with("audio/") {
        Some(TrackType::Audio)
    } else if mime.starts_with("text/") || mime.contains("ttml") || mime.contains("vtt") {
        Some(TrackType::Subtitle)
    } else {
        None
    }
}

fn infer_track_type(resolution: Option<Resolution>, codec: Option<&str>) -> TrackType {
    if resolution.is_some() {
        return TrackType::Video;
    }
    let codec = codec.unwrap_or_default().to_lowercase();
    if ["mp4a", "opus", "ac-3", "ec-3", "flac", "vorbis"]
        .iter()
        .any(|c| codec.starts_with(c))
    {
        TrackType::Audio
    } else if codec.starts_with("wvtt") || codec.starts_with("stpp") {
        TrackType::Subtitle
    } else {
        TrackType::Video
    }
}

fn parse_frame_rate(s: &str) -> Option<f32> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f32 = num.parse().ok()?;
            let den: f32 = den.parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => s.parse().ok(),
    }
}

/// Parse ISO 8601 duration (PT1H2M3.4S format)
fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let s = s.trim_start_matches('P');
    let (days, time) = match s.split_once('T') {
        Some((days, time)) => (days, time),
        None => (s, ""),
    };

    let mut total_seconds = days
        .strip_suffix('D')
        .and_then(|d| d.parse::<f64>().ok())
        .map_or(0.0, |d| d * 86_400.0);
    let mut current = String::new();

    for c in time.chars() {
        match c {
            'H' => {
                total_seconds += current.parse::<f64>().unwrap_or(0.0) * 3600.0;
                current.clear();
            }
            'M' => {
                total_seconds += current.parse::<f64>().unwrap_or(0.0) * 60.0;
                current.clear();
            }
            'S' => {
                total_seconds += current.parse::<f64>().unwrap_or(0.0);
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if total_seconds > 0.0 {
        Some(Duration::from_secs_f64(total_seconds))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT2M5.5S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v720" bandwidth="2800000" width="1280" height="720" codecs="avc1.64001f" frameRate="30000/1001">
        <BaseURL>video/720.mp4</BaseURL>
      </Representation>
      <Representation id="v1080" bandwidth="5000000" width="1920" height="1080" codecs="avc1.640028" frameRate="60">
        <BaseURL>video/1080.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4" lang="en">
      <Representation id="a128" bandwidth="128000" codecs="mp4a.40.2">
        <BaseURL>audio/en-128.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet contentType="text" mimeType="text/vtt" lang="de">
      <Representation id="sub-de" bandwidth="256">
        <BaseURL>subs/de.vtt</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn base() -> Url {
        Url::parse("https://cdn.example.com/content/manifest.mpd").unwrap()
    }

    #[test]
    fn test_parse_mpd_representations() {
        let parsed = parse_mpd(MPD, &base()).unwrap();
        assert_eq!(parsed.kind, AdapterKind::Dash);
        assert_eq!(parsed.representations.len(), 4);

        let video: Vec<_> = parsed
            .representations
            .iter()
            .filter(|r| r.track_type == TrackType::Video)
            .collect();
        assert_eq!(video.len(), 2);
        assert_eq!(video[0].id.as_str(), "v720");
        assert_eq!(video[1].resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(video[1].frame_rate, Some(60.0));
        assert_eq!(
            video[0].uri.as_ref().unwrap().as_str(),
            "https://cdn.example.com/content/video/720.mp4"
        );

        let audio = parsed
            .representations
            .iter()
            .find(|r| r.track_type == TrackType::Audio)
            .unwrap();
        assert_eq!(audio.language.as_deref(), Some("en"));
        assert_eq!(audio.bitrate, 128_000);

        let sub = parsed
            .representations
            .iter()
            .find(|r| r.track_type == TrackType::Subtitle)
            .unwrap();
        assert_eq!(sub.language.as_deref(), Some("de"));
    }

    #[test]
    fn test_parse_mpd_timeline() {
        let parsed = parse_mpd(MPD, &base()).unwrap();
        assert!(!parsed.timeline.is_live);
        assert_eq!(parsed.timeline.duration, Some(Duration::from_secs_f64(125.5)));
    }

    #[test]
    fn test_malformed_mpd() {
        assert!(matches!(
            parse_mpd("<html>not a manifest</html>", &base()),
            Err(Error::MalformedManifest(_))
        ));
        let truncated = &MPD[..MPD.len() / 2];
        assert!(matches!(parse_mpd(truncated, &base()), Err(Error::MalformedManifest(_))));
        assert!(matches!(
            parse_mpd("<MPD><Period></Period></MPD>", &base()),
            Err(Error::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_segment_base_children_are_not_representations() {
        let mpd = r#"<MPD type="static"><Period><AdaptationSet contentType="video">
<Representation id="v1" bandwidth="1000000" width="1280" height="720">
  <BaseURL>v1.mp4</BaseURL>
  <SegmentBase indexRange="0-819"><RepresentationIndex sourceURL="idx.sidx"/></SegmentBase>
</Representation>
</AdaptationSet></Period></MPD>"#;
        let parsed = parse_mpd(mpd, &base()).unwrap();
        assert_eq!(parsed.representations.len(), 1);
        assert_eq!(parsed.representations[0].id.as_str(), "v1");
        assert_eq!(parsed.representations[0].bitrate, 1_000_000);
    }

    #[test]
    fn test_single_quoted_attributes() {
        let mpd = "<MPD type='dynamic'><Period><AdaptationSet contentType='audio' lang='en'>\
<Representation id='a1' bandwidth='128000' codecs='mp4a.40.2'/>\
</AdaptationSet></Period></MPD>";
        let parsed = parse_mpd(mpd, &base()).unwrap();
        assert!(parsed.timeline.is_live);
        let audio = &parsed.representations[0];
        assert_eq!(audio.id.as_str(), "a1");
        assert_eq!(audio.track_type, TrackType::Audio);
        assert_eq!(audio.bitrate, 128_000);
        assert_eq!(audio.language.as_deref(), Some("en"));
        // Self-closing representation without BaseURL plays from the manifest URL
        assert_eq!(audio.uri.as_ref(), Some(&base()));
    }

    #[test]
    fn test_base_urls_nest() {
        let mpd = r#"<MPD><BaseURL>https://origin.example.com/root/</BaseURL><Period>
<BaseURL>p1/</BaseURL>
<AdaptationSet mimeType="video/mp4"><BaseURL>video/</BaseURL>
<Representation id="v" bandwidth="1"><BaseURL>hd.mp4</BaseURL></Representation>
</AdaptationSet></Period></MPD>"#;
        let parsed = parse_mpd(mpd, &base()).unwrap();
        assert_eq!(
            parsed.representations[0].uri.as_ref().unwrap().as_str(),
            "https://origin.example.com/root/p1/video/hd.mp4"
        );
    }

    #[test]
    fn test_parse_iso8601_duration() {
        assert_eq!(parse_iso8601_duration("PT1H30M"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_iso8601_duration("PT45.5S"), Some(Duration::from_secs_f64(45.5)));
        assert_eq!(parse_iso8601_duration("PT2H5M10S"), Some(Duration::from_secs(7510)));
        assert_eq!(parse_iso8601_duration("P1DT1S"), Some(Duration::from_secs(86_401)));
        assert_eq!(parse_iso8601_duration("PT0S"), None);
    }

    #[test]
    fn test_frame_rate() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("30/0"), None);
    }
}
