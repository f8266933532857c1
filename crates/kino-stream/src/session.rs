//! Stream engine - host-facing entry point
//!
//! Coordinates:
//! - Sink attachment
//! - Source loading (playlist fetch, rendition selection, track creation)
//! - The per-session scheduler task
//! - Unloading and session cancellation

use crate::{
    error::Error,
    fetcher::SegmentFetcher,
    manifest::{MediaPlaylist, PlaylistLoader},
    net::{HttpTransport, Transport},
    scheduler::{BufferScheduler, SchedulerSettings, TrackState},
    selector::{RenditionSelector, SelectionConstraints},
    sink::MediaSink,
    types::{EngineOptions, SessionId, StreamConfig},
    Result,
};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// A loaded (or loading) source
struct ActiveSession {
    id: SessionId,
    cancel: CancellationToken,
    scheduler: Option<Arc<BufferScheduler>>,
    task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn stop(self) {
        self.cancel.cancel();
        if let Some(task) = self.task {
            task.abort();
        }
        debug!(session = %self.id, "Session stopped");
    }
}

/// Streaming engine driving one sink from one source at a time
pub struct StreamEngine {
    options: EngineOptions,
    transport: Arc<dyn Transport>,
    loader: PlaylistLoader,
    selector: RenditionSelector,
    sink: RwLock<Option<Arc<dyn MediaSink>>>,
    session: RwLock<Option<ActiveSession>>,
}

impl StreamEngine {
    /// Create an engine fetching over HTTP
    pub fn new(options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let transport = Arc::new(HttpTransport::new(options.connect_timeout())?);
        Self::with_transport(options, transport)
    }

    /// Create an engine on a custom transport
    pub fn with_transport(options: EngineOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        options.validate()?;
        let loader = PlaylistLoader::new(transport.clone(), options.retry_policy());
        Ok(Self {
            options,
            transport,
            loader,
            selector: RenditionSelector::new(),
            sink: RwLock::new(None),
            session: RwLock::new(None),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Attach the sink that receives media. Any loaded source is unloaded.
    pub async fn attach_sink(&self, sink: Arc<dyn MediaSink>) {
        if let Some(session) = self.session.write().await.take() {
            session.stop();
        }
        *self.sink.write().await = Some(sink);
        debug!("Sink attached");
    }

    /// Load a source and start scheduling.
    ///
    /// Any previous session is cancelled first. Fails if no sink is attached,
    /// the playlists cannot be fetched, or no rendition satisfies `config`.
    #[instrument(skip(self, config), fields(session))]
    pub async fn load_source(&self, uri: &str, config: StreamConfig) -> Result<SessionId> {
        config.validate()?;
        let url = Url::parse(uri).map_err(|e| Error::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        let sink = self.sink.read().await.clone().ok_or(Error::NoSinkAttached)?;

        let id = SessionId::new();
        let cancel = CancellationToken::new();
        tracing::Span::current().record("session", tracing::field::display(id));
        {
            let mut current = self.session.write().await;
            if let Some(previous) = current.take() {
                previous.stop();
            }
            *current = Some(ActiveSession {
                id,
                cancel: cancel.clone(),
                scheduler: None,
                task: None,
            });
        }

        match self.start_session(id, &url, &config, sink, &cancel).await {
            Ok(scheduler) => {
                let mut current = self.session.write().await;
                match current.as_mut() {
                    Some(session) if session.id == id && !cancel.is_cancelled() => {
                        session.task = Some(tokio::spawn(Arc::clone(&scheduler).run()));
                        session.scheduler = Some(scheduler);
                        info!(source = %url, "Source loaded");
                        Ok(id)
                    }
                    _ => {
                        debug!("Session superseded before start");
                        Err(Error::Aborted)
                    }
                }
            }
            Err(e) => {
                let mut current = self.session.write().await;
                if current.as_ref().is_some_and(|s| s.id == id) {
                    if let Some(session) = current.take() {
                        session.stop();
                    }
                }
                if !e.is_aborted() {
                    warn!(code = e.error_code(), error = %e, "Source load failed");
                }
                Err(e)
            }
        }
    }

    async fn start_session(
        &self,
        id: SessionId,
        url: &Url,
        config: &StreamConfig,
        sink: Arc<dyn MediaSink>,
        cancel: &CancellationToken,
    ) -> Result<Arc<BufferScheduler>> {
        let source = self.loader.load_multivariant(url, cancel).await?;
        let selection = self
            .selector
            .select(&source.renditions, &SelectionConstraints::from(config))?;
        info!(
            video = %selection.video.id,
            audio = ?selection.audio.as_ref().map(|a| a.id.as_str()),
            "Renditions selected"
        );

        let playlists: Vec<MediaPlaylist> = try_join_all(
            selection
                .renditions()
                .map(|rendition| self.loader.load_media(rendition, cancel)),
        )
        .await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            opened = sink.opened() => opened?,
        }

        let mut tracks = Vec::with_capacity(playlists.len());
        let mut duration: f64 = 0.0;
        for playlist in playlists {
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }
            let content_type = playlist.rendition.content_type();
            let track = sink.create_track(&content_type)?;
            debug!(track = %track, content_type = %content_type, "Track created");
            duration = duration.max(playlist.duration());
            tracks.push(TrackState::new(track, playlist));
        }

        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        sink.set_duration(duration)?;

        let fetcher = SegmentFetcher::new(self.transport.clone(), self.options.retry_policy())
            .with_min_chunk_size(self.options.min_chunk_size);
        Ok(Arc::new(BufferScheduler::new(
            id,
            sink,
            fetcher,
            tracks,
            Some(duration),
            SchedulerSettings::new(&self.options, config),
            cancel.clone(),
        )))
    }

    /// Cancel the current session, stop scheduling and release the sink
    pub async fn unload(&self) {
        if let Some(session) = self.session.write().await.take() {
            info!(session = %session.id, "Source unloaded");
            session.stop();
        }
        *self.sink.write().await = None;
    }

    /// A source is loaded and its scheduler is running
    pub async fn is_loaded(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.scheduler.is_some())
    }

    /// Id of the current session, including one still loading
    pub async fn session_id(&self) -> Option<SessionId> {
        self.session.read().await.as_ref().map(|s| s.id)
    }

    /// Scheduler of the loaded session
    pub async fn scheduler(&self) -> Option<Arc<BufferScheduler>> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.scheduler.clone())
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}
