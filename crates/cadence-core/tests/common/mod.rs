//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cadence_core::{
    ChannelListener, EngineConfig, EngineContext, HttpRequest, HttpResponse, HttpTransport,
    PlaybackSession, PlayerEvent, Representation, Resolution, StreamCatalog, TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const MPD: &str = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT30S">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v1" bandwidth="1000000" width="1280" height="720" codecs="avc1.4d401f">
        <BaseURL>v1.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

pub const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:6
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f\"
v720.m3u8
";

pub const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
seg1.ts
#EXT-X-ENDLIST
";

/// Scripted response for one path
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Path-routed transport; unknown paths answer 200 with a small body
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, route: Route) -> &Self {
        self.routes.lock().unwrap().insert(path.to_string(), route);
        self
    }

    /// Paths requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn was_requested(&self, path: &str) -> bool {
        self.requests().iter().any(|p| p == path)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.url.path().to_string();
        self.requests.lock().unwrap().push(path.clone());
        let route = self.routes.lock().unwrap().get(&path).cloned();

        match route {
            Some(route) => {
                if !route.delay.is_zero() {
                    tokio::time::sleep(route.delay).await;
                }
                Ok(HttpResponse::status(route.status, route.body))
            }
            None => Ok(HttpResponse::ok(vec![0u8; 64])),
        }
    }
}

pub fn url(path: &str) -> Url {
    Url::parse("https://cdn.example.com").unwrap().join(path).unwrap()
}

pub fn video(id: &str, bitrate: u64, height: u32) -> Representation {
    Representation::video(id, bitrate, Resolution::new(height * 16 / 9, height))
        .with_codec("avc1.64001f")
        .with_uri(url(&format!("/media/{}.mp4", id)))
}

/// Two progressive video representations
pub fn progressive_catalog(item: &str) -> StreamCatalog {
    StreamCatalog::from_representations(vec![
        video(&format!("{}-720", item), 2_500_000, 720),
        video(&format!("{}-360", item), 800_000, 360),
    ])
    .with_item_id(item)
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub ctx: Arc<EngineContext>,
    pub session: PlaybackSession,
    pub events: mpsc::UnboundedReceiver<PlayerEvent>,
}

impl Harness {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), transport.clone()).unwrap());
        let (listener, events) = ChannelListener::new();
        let listener = Arc::new(listener);
        let session = PlaybackSession::builder(ctx.clone())
            .listener(listener.clone())
            .quality_sink(listener)
            .spawn()
            .unwrap();
        Self {
            transport,
            ctx,
            session,
            events,
        }
    }

    /// Wait for the next event accepted by `accept`, skipping the others
    pub async fn expect_event(&mut self, mut accept: impl FnMut(&PlayerEvent) -> bool) -> PlayerEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(event) if accept(&event) => return event,
                    Some(_) => continue,
                    None => panic!("listener channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Everything delivered so far
    pub fn drain(&mut self) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait until the source is prepared or failed
    pub async fn settle(&self) -> cadence_core::PlaybackState {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.session
                .wait_for(|s| s.is_prepared() || matches!(s, cadence_core::PlaybackState::Error(_))),
        )
        .await
        .expect("timed out waiting for the source")
        .unwrap()
    }
}
