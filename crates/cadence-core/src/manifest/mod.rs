//! Manifest parsing for DASH, HLS and Smooth Streaming
//!
//! Parsers turn manifest bytes into a flat representation list plus the
//! timeline they describe. They never fetch anything; loading belongs to
//! the source handle.

#[cfg(feature = "dash")]
mod dash;
#[cfg(feature = "hls")]
mod hls;
#[cfg(feature = "smooth")]
mod smooth;

#[cfg(feature = "dash")]
pub use dash::parse_mpd;
#[cfg(feature = "hls")]
pub use hls::{parse_hls, parse_media_segments, MediaSegmentRef};
#[cfg(feature = "smooth")]
pub use smooth::parse_smooth;

use crate::{
    types::{AdapterKind, Representation, Timeline},
    Error, Result,
};
use url::Url;

/// Bytes inspected by the content sniffer
pub const SNIFF_WINDOW: usize = 1024;

/// Parsed manifest data
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    /// Adapter the manifest belongs to
    pub kind: AdapterKind,
    /// Available representations, all track types
    pub representations: Vec<Representation>,
    /// Timeline described by the manifest
    pub timeline: Timeline,
}

/// Detect manifest type from the URL path
pub fn detect_from_extension(url: &Url) -> Option<AdapterKind> {
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Some(AdapterKind::Hls);
    }
    if path.ends_with(".mpd") {
        return Some(AdapterKind::Dash);
    }
    if path.ends_with(".ism")
        || path.ends_with(".isml")
        || path.ends_with(".ism/manifest")
        || path.ends_with(".isml/manifest")
    {
        return Some(AdapterKind::SmoothStreaming);
    }
    None
}

/// Detect manifest type from a content-type header value
pub fn detect_from_content_type(content_type: &str) -> Option<AdapterKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "application/dash+xml" => Some(AdapterKind::Dash),
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" | "audio/mpegurl" => {
            Some(AdapterKind::Hls)
        }
        "application/vnd.ms-sstr+xml" => Some(AdapterKind::SmoothStreaming),
        _ => None,
    }
}

/// Detect manifest type from the first bytes of the content
pub fn sniff_content(bytes: &[u8]) -> Option<AdapterKind> {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let text = String::from_utf8_lossy(window);
    let text = text.trim_start_matches('\u{feff}').trim_start();

    if text.starts_with("#EXTM3U") {
        return Some(AdapterKind::Hls);
    }
    if text.contains("<MPD") || text.contains("urn:mpeg:dash") {
        return Some(AdapterKind::Dash);
    }
    if text.contains("<SmoothStreamingMedia") {
        return Some(AdapterKind::SmoothStreaming);
    }
    None
}

/// Parse manifest bytes for the given adapter
pub fn parse_manifest(kind: AdapterKind, bytes: &[u8], base_url: &Url) -> Result<ParsedManifest> {
    match kind {
        #[cfg(feature = "dash")]
        AdapterKind::Dash => parse_mpd(&utf8(bytes)?, base_url),
        #[cfg(feature = "hls")]
        AdapterKind::Hls => parse_hls(bytes, base_url),
        #[cfg(feature = "smooth")]
        AdapterKind::SmoothStreaming => parse_smooth(&utf8(bytes)?, base_url),
        other => Err(Error::UnsupportedProtocol(format!(
            "no manifest parser for {}",
            other
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::MalformedManifest(format!("manifest is not UTF-8: {}", e)))
}

/// Attributes of one XML start tag, keyed by local name
#[cfg(any(feature = "dash", feature = "smooth"))]
#[derive(Debug, Default)]
pub(crate) struct XmlAttrs(std::collections::HashMap<String, String>);

#[cfg(any(feature = "dash", feature = "smooth"))]
impl XmlAttrs {
    pub(crate) fn of(tag: &quick_xml::events::BytesStart<'_>) -> Result<Self> {
        let mut attrs = std::collections::HashMap::new();
        for attr in tag.attributes() {
            let attr = attr.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_error)?;
            attrs.insert(key, value.into_owned());
        }
        Ok(Self(attrs))
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim())
    }

    pub(crate) fn owned(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    /// Attribute parsed as `T`; unparseable values count as absent
    pub(crate) fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }
}

#[cfg(any(feature = "dash", feature = "smooth"))]
pub(crate) fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::MalformedManifest(format!("invalid XML: {}", e))
}

/// Resolve relative URI against base URL
pub(crate) fn resolve_uri(base: &Url, relative: &str) -> Result<Url> {
    base.join(relative.trim())
        .map_err(|e| Error::MalformedManifest(format!("Invalid URI '{}': {}", relative, e)))
}
