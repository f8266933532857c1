//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kino_stream::{EngineOptions, Error, Result, StreamEngine, Transport, TransportResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

pub const ORIGIN: &str = "https://cdn.example.com";
pub const SEGMENT_BYTES: usize = 512;

static TRACING: Once = Once::new();

/// Route engine logs through the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kino_stream=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// In-memory origin keyed by absolute URL
#[derive(Default)]
pub struct Origin {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    requests: Mutex<Vec<String>>,
}

impl Origin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .insert(format!("{}/{}", ORIGIN, path), (200, body.into()));
    }

    pub fn fail(&self, path: &str, status: u16) {
        self.routes
            .lock()
            .insert(format!("{}/{}", ORIGIN, path), (status, Vec::new()));
    }

    /// Serve a media playlist of `count` segments of `duration` seconds
    /// under `dir`, plus its init and segment bodies
    pub fn serve_rendition(&self, dir: &str, count: usize, duration: f64) {
        let mut playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MAP:URI=\"init.mp4\"\n",
            duration.ceil()
        );
        for i in 0..count {
            playlist.push_str(&format!("#EXTINF:{:.3},\nseg{}.m4s\n", duration, i));
            self.serve(&format!("{}/seg{}.m4s", dir, i), vec![1u8; SEGMENT_BYTES]);
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        self.serve(&format!("{}/index.m3u8", dir), playlist);
        self.serve(&format!("{}/init.mp4", dir), vec![0u8; 64]);
    }

    /// Hold the body of `path` until the returned handle is notified
    pub fn gate(&self, path: &str) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        self.gates
            .lock()
            .insert(format!("{}/{}", ORIGIN, path), release.clone());
        release
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requested(&self, path: &str) -> bool {
        let url = format!("{}/{}", ORIGIN, path);
        self.requests.lock().iter().any(|r| *r == url)
    }
}

#[async_trait]
impl Transport for Origin {
    async fn get(&self, url: &Url) -> Result<TransportResponse> {
        self.requests.lock().push(url.to_string());
        let route = self.routes.lock().get(url.as_str()).cloned();
        let gate = self.gates.lock().get(url.as_str()).cloned();
        if let (Some((status, body)), Some(release)) = (route.clone(), gate) {
            let body = futures::stream::once(async move {
                release.notified().await;
                Ok::<_, Error>(Bytes::from(body))
            });
            return Ok(TransportResponse::new(url.clone(), status, Box::pin(body)));
        }
        Ok(match route {
            Some((status, body)) => TransportResponse::from_bytes(url.clone(), status, body),
            None => TransportResponse::from_bytes(url.clone(), 404, Vec::new()),
        })
    }
}

/// Options tuned for fast tests: short ticks, no retries
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        tick_interval_ms: 20,
        max_retries: 0,
        retry_base_delay_ms: 1,
        min_chunk_size: 256,
        ..EngineOptions::default()
    }
}

pub fn engine(origin: &Arc<Origin>) -> StreamEngine {
    init_tracing();
    StreamEngine::with_transport(fast_options(), origin.clone()).unwrap()
}

pub fn url(path: &str) -> String {
    format!("{}/{}", ORIGIN, path)
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
