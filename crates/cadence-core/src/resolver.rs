//! Protocol resolution
//!
//! Maps a `StreamCatalog` to the `ProtocolKind` that can play it.
//! Resolution order: explicit hint, URL extension, content type (catalog
//! metadata, then the first bytes of the manifest), Progressive fallback.
//! A manifest-based catalog that also names an HLS playlist resolves to
//! `Merged(primary, Hls)`.

use crate::{
    manifest::{self, SNIFF_WINDOW},
    transport::{HttpRequest, HttpTransport},
    types::{AdapterKind, ProtocolKind, StreamCatalog},
    Error, Result,
};
use tracing::{debug, instrument, warn};
use url::Url;

/// Outcome of resolving the primary (non-playlist) part of a catalog
enum Primary {
    Resolved(AdapterKind),
    /// Nothing matched locally; a remote sniff of this URL may still
    Unmatched(Url),
}

/// Stateless catalog-to-protocol resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolResolver;

impl ProtocolResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve without network access
    #[instrument(skip(self, catalog), fields(item = ?catalog.item_id))]
    pub fn resolve(&self, catalog: &StreamCatalog) -> Result<ProtocolKind> {
        let primary = match self.resolve_primary(catalog)? {
            Some(Primary::Resolved(kind)) => Some(kind),
            Some(Primary::Unmatched(_)) => Some(AdapterKind::Progressive),
            None => None,
        };
        let kind = self.combine(primary, catalog)?;
        debug!(protocol = %kind, "Protocol resolved");
        Ok(kind)
    }

    /// Resolve, sniffing the first bytes of the primary URL over the transport
    /// when neither hint nor extension matched
    #[instrument(skip(self, catalog, transport), fields(item = ?catalog.item_id))]
    pub async fn resolve_remote(
        &self,
        catalog: &StreamCatalog,
        transport: &dyn HttpTransport,
    ) -> Result<ProtocolKind> {
        let primary = match self.resolve_primary(catalog)? {
            Some(Primary::Resolved(kind)) => Some(kind),
            Some(Primary::Unmatched(url)) => {
                Some(sniff_remote(&url, transport).await.unwrap_or(AdapterKind::Progressive))
            }
            None => None,
        };
        let kind = self.combine(primary, catalog)?;
        debug!(protocol = %kind, "Protocol resolved with remote sniff");
        Ok(kind)
    }

    /// URL that `resolve_remote` would sniff, when nothing matches offline
    pub fn remote_target(&self, catalog: &StreamCatalog) -> Result<Option<Url>> {
        Ok(match self.resolve_primary(catalog)? {
            Some(Primary::Unmatched(url)) => Some(url),
            _ => None,
        })
    }

    /// Resolve a bare URL
    pub fn resolve_url(&self, url: &Url) -> Result<ProtocolKind> {
        self.resolve(&StreamCatalog::from_manifest_url(url.clone()))
    }

    fn resolve_primary(&self, catalog: &StreamCatalog) -> Result<Option<Primary>> {
        if catalog.is_empty() {
            return Err(Error::UnsupportedProtocol("catalog is empty".to_string()));
        }

        let url = catalog.primary_url();
        if let Some(url) = url {
            check_scheme(url)?;
        }
        if let Some(playlist) = &catalog.playlist_url {
            check_scheme(playlist)?;
        }

        if let Some(hint) = catalog.protocol_hint {
            return Ok(Some(Primary::Resolved(hint)));
        }

        if let Some(kind) = url.and_then(manifest::detect_from_extension) {
            return Ok(Some(Primary::Resolved(kind)));
        }

        if let Some(kind) = catalog
            .content_type
            .as_deref()
            .and_then(manifest::detect_from_content_type)
        {
            return Ok(Some(Primary::Resolved(kind)));
        }

        if let Some(bytes) = &catalog.manifest_bytes {
            if let Some(kind) = manifest::sniff_content(bytes) {
                return Ok(Some(Primary::Resolved(kind)));
            }
            if url.is_none() {
                return Err(Error::UnsupportedProtocol(
                    "manifest bytes match no known format".to_string(),
                ));
            }
        }

        match url {
            Some(url) => Ok(Some(Primary::Unmatched(url.clone()))),
            // Structured representations carry their own media URIs
            None if !catalog.representations.is_empty() => {
                Ok(Some(Primary::Resolved(AdapterKind::Progressive)))
            }
            None => Ok(None),
        }
    }

    fn combine(&self, primary: Option<AdapterKind>, catalog: &StreamCatalog) -> Result<ProtocolKind> {
        match (primary, catalog.playlist_url.is_some()) {
            (Some(kind @ (AdapterKind::Dash | AdapterKind::SmoothStreaming)), true) => {
                Ok(ProtocolKind::Merged(kind, AdapterKind::Hls))
            }
            (Some(AdapterKind::Progressive) | None, true) => Ok(ProtocolKind::Hls),
            (Some(kind), _) => Ok(kind.into()),
            (None, false) => Err(Error::UnsupportedProtocol(
                "catalog has no playable source".to_string(),
            )),
        }
    }
}

fn check_scheme(url: &Url) -> Result<()> {
    match url.scheme() {
        "http" | "https" | "file" => Ok(()),
        other => Err(Error::UnsupportedProtocol(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// Ranged GET of the first bytes; content-type header first, then the body
async fn sniff_remote(url: &Url, transport: &dyn HttpTransport) -> Option<AdapterKind> {
    let request = HttpRequest::get(url.clone()).with_range(0, SNIFF_WINDOW as u64 - 1);
    match transport.fetch(&request).await {
        Ok(response) if response.is_success() => response
            .content_type
            .as_deref()
            .and_then(manifest::detect_from_content_type)
            .or_else(|| manifest::sniff_content(&response.body)),
        Ok(response) => {
            warn!(status = response.status, url = %url, "Sniff request rejected");
            None
        }
        Err(e) => {
            warn!(error = %e, url = %url, "Sniff request failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, TransportError};
    use crate::types::{Representation, Resolution};
    use async_trait::async_trait;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_extension_resolution() {
        let resolver = ProtocolResolver::new();
        assert_eq!(
            resolver.resolve_url(&url("https://cdn.example.com/a/manifest.mpd")).unwrap(),
            ProtocolKind::Dash
        );
        assert_eq!(
            resolver.resolve_url(&url("https://cdn.example.com/a/master.m3u8?sig=1")).unwrap(),
            ProtocolKind::Hls
        );
        assert_eq!(
            resolver.resolve_url(&url("https://cdn.example.com/a.ism/Manifest")).unwrap(),
            ProtocolKind::SmoothStreaming
        );
        assert_eq!(
            resolver.resolve_url(&url("https://cdn.example.com/videoplayback?id=42")).unwrap(),
            ProtocolKind::Progressive
        );
    }

    #[test]
    fn test_remote_target_only_when_unmatched() {
        let resolver = ProtocolResolver::new();
        let opaque = StreamCatalog::from_manifest_url(url("https://cdn.example.com/play?id=7"));
        assert_eq!(
            resolver.remote_target(&opaque).unwrap(),
            Some(url("https://cdn.example.com/play?id=7"))
        );
        let dash = StreamCatalog::from_manifest_url(url("https://cdn.example.com/a.mpd"));
        assert_eq!(resolver.remote_target(&dash).unwrap(), None);
        assert!(resolver.remote_target(&StreamCatalog::new()).is_err());
    }

    #[test]
    fn test_hint_wins_over_extension() {
        let catalog = StreamCatalog::from_manifest_url(url("https://cdn.example.com/x.mpd"))
            .with_hint(AdapterKind::Hls);
        assert_eq!(ProtocolResolver::new().resolve(&catalog).unwrap(), ProtocolKind::Hls);
    }

    #[test]
    fn test_content_type_and_byte_sniff() {
        let resolver = ProtocolResolver::new();
        let catalog = StreamCatalog::from_manifest_url(url("https://cdn.example.com/play"))
            .with_content_type("application/dash+xml");
        assert_eq!(resolver.resolve(&catalog).unwrap(), ProtocolKind::Dash);

        let catalog = StreamCatalog::from_manifest_bytes("#EXTM3U\n#EXT-X-VERSION:3\n");
        assert_eq!(resolver.resolve(&catalog).unwrap(), ProtocolKind::Hls);

        let catalog = StreamCatalog::from_manifest_bytes("not a manifest");
        assert!(matches!(resolver.resolve(&catalog), Err(Error::UnsupportedProtocol(_))));
    }

    #[test]
    fn test_merged_resolution() {
        let catalog = StreamCatalog::from_manifest_bytes("<MPD></MPD>")
            .with_playlist_url(url("https://cdn.example.com/hls/master.m3u8"));
        assert_eq!(
            ProtocolResolver::new().resolve(&catalog).unwrap(),
            ProtocolKind::Merged(AdapterKind::Dash, AdapterKind::Hls)
        );

        // A playlist URL alone is plain HLS
        let catalog = StreamCatalog::new().with_playlist_url(url("https://cdn.example.com/live"));
        assert_eq!(ProtocolResolver::new().resolve(&catalog).unwrap(), ProtocolKind::Hls);
    }

    #[test]
    fn test_url_list_and_structured_catalogs() {
        let resolver = ProtocolResolver::new();
        let catalog = StreamCatalog::new().with_url_list(vec![
            url("https://cdn.example.com/best.m3u8"),
            url("https://cdn.example.com/worse.mpd"),
        ]);
        assert_eq!(resolver.resolve(&catalog).unwrap(), ProtocolKind::Hls);

        let catalog = StreamCatalog::from_representations(vec![Representation::video(
            "v1",
            1_000_000,
            Resolution::new(1280, 720),
        )]);
        assert_eq!(resolver.resolve(&catalog).unwrap(), ProtocolKind::Progressive);
    }

    #[test]
    fn test_unsupported_catalogs() {
        let resolver = ProtocolResolver::new();
        assert!(matches!(
            resolver.resolve(&StreamCatalog::new()),
            Err(Error::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            resolver.resolve_url(&url("rtmp://live.example.com/app/stream")),
            Err(Error::UnsupportedProtocol(_))
        ));
    }

    struct StaticTransport(std::result::Result<HttpResponse, TransportError>);

    #[async_trait]
    impl HttpTransport for StaticTransport {
        async fn fetch(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            assert_eq!(request.range, Some((0, SNIFF_WINDOW as u64 - 1)));
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_remote_sniff() {
        let resolver = ProtocolResolver::new();
        let catalog = StreamCatalog::from_manifest_url(url("https://cdn.example.com/play?id=7"));

        let transport = StaticTransport(Ok(HttpResponse::ok("<?xml version=\"1.0\"?><MPD>")));
        assert_eq!(
            resolver.resolve_remote(&catalog, &transport).await.unwrap(),
            ProtocolKind::Dash
        );

        let mut response = HttpResponse::ok(vec![0u8; 16]);
        response.content_type = Some("application/vnd.apple.mpegurl".into());
        let transport = StaticTransport(Ok(response));
        assert_eq!(
            resolver.resolve_remote(&catalog, &transport).await.unwrap(),
            ProtocolKind::Hls
        );

        let transport = StaticTransport(Ok(HttpResponse::ok(vec![0u8, 0, 0, 0x18])));
        assert_eq!(
            resolver.resolve_remote(&catalog, &transport).await.unwrap(),
            ProtocolKind::Progressive
        );

        let transport = StaticTransport(Err(TransportError::Timeout));
        assert_eq!(
            resolver.resolve_remote(&catalog, &transport).await.unwrap(),
            ProtocolKind::Progressive
        );
    }
}
