//! The engine actor.
//!
//! One event loop owns every store. Visit events, status queries, timer
//! firings, and I/O completions all arrive as messages and are processed
//! one at a time in arrival order; remote calls and favicon fetches run as
//! spawned tasks whose results re-enter the loop, so nothing ever blocks
//! event processing.

use crate::remote::{image_data_uri, BytesFetcher, ClientFactory, PublisherResolver, SyncResponse};
use crate::scheduler::Scheduler;
use crate::status::{self, Projections, StatusSnapshot};
use crate::synopsis::Synopsis;
use crate::tracker::VisitTracker;
use crate::writer::{DurableWriter, WriteMode};
use crate::{DwellError, EngineConfig};
use chrono::Utc;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Messages processed by the engine loop.
pub enum EngineEvent {
    /// A navigation event from the caller.
    Visit(String),
    /// Snapshot query; the reply goes straight back to the caller.
    Status(oneshot::Sender<StatusSnapshot>),
    /// A favicon fetch finished with a usable image.
    FaviconFetched { publisher: String, favicon: String },
    /// A sync or reconcile call completed.
    SyncDone(crate::Result<SyncResponse>),
    /// The sync delay timer fired.
    SyncDue,
    /// Scheduling continuation after a persisted client state.
    ScheduleRun(u64),
    /// The recurring payment notice timer fired.
    PaymentNotice,
    Shutdown,
}

/// Caller-side handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Fire-and-forget navigation event. May be called at any rate,
    /// including back-to-back with zero elapsed time.
    pub async fn visit(&self, location: impl Into<String>) {
        let _ = self.tx.send(EngineEvent::Visit(location.into())).await;
    }

    /// Snapshot of the engine state.
    pub async fn status(&self) -> crate::Result<StatusSnapshot> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(EngineEvent::Status(reply))
            .await
            .map_err(|_| DwellError::Engine("event loop closed".to_string()))?;
        response
            .await
            .map_err(|_| DwellError::Engine("status reply dropped".to_string()))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineEvent::Shutdown).await;
    }
}

/// The attention engine. Construct with [`Engine::new`], then call
/// [`Engine::start`] to spawn the event loop.
pub struct Engine {
    config: EngineConfig,
    synopsis: Synopsis,
    tracker: VisitTracker,
    scheduler: Scheduler,
    projections: Projections,
    writer: DurableWriter,
    resolver: Arc<dyn PublisherResolver>,
    fetcher: Arc<dyn BytesFetcher>,
}

impl Engine {
    /// Load persisted state and prepare the engine. Without a client
    /// factory the engine runs tracking-only: visits are attributed and
    /// persisted but nothing syncs or reconciles.
    pub async fn new(
        config: EngineConfig,
        resolver: Arc<dyn PublisherResolver>,
        fetcher: Arc<dyn BytesFetcher>,
        factory: Option<Arc<dyn ClientFactory>>,
    ) -> crate::Result<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        let synopsis = load_synopsis(&config).await;
        let mut scheduler = Scheduler::new(&config, factory);
        scheduler.init().await;
        Ok(Self {
            config,
            synopsis,
            tracker: VisitTracker::new(),
            scheduler,
            projections: Projections::default(),
            writer: DurableWriter::new(),
            resolver,
            fetcher,
        })
    }

    /// Spawn the event loop and kick the initial sync when a client was
    /// restored.
    pub fn start(self) -> EngineHandle {
        let (tx, rx) = mpsc::channel(64);
        if self.scheduler.has_client() {
            self.scheduler.start_sync(&tx);
        }
        tokio::spawn(self.run(tx.clone(), rx));
        EngineHandle { tx }
    }

    async fn run(mut self, tx: mpsc::Sender<EngineEvent>, mut rx: mpsc::Receiver<EngineEvent>) {
        info!(data_dir = %self.config.data_dir.display(), "engine started");
        while let Some(event) = rx.recv().await {
            let now = Utc::now().timestamp_millis();
            match event {
                EngineEvent::Visit(location) => self.on_visit(&location, now, &tx),
                EngineEvent::Status(reply) => {
                    let snapshot = status::project(
                        &mut self.projections,
                        &self.synopsis,
                        self.tracker.index(),
                        &mut self.scheduler,
                        self.config.top_publishers,
                        now,
                    );
                    let _ = reply.send(snapshot);
                }
                EngineEvent::FaviconFetched { publisher, favicon } => {
                    if self.synopsis.resolve_favicon(&publisher, favicon) {
                        self.writer.write(
                            &self.config.synopsis_path(),
                            &self.synopsis,
                            WriteMode::Replace,
                        );
                    }
                }
                EngineEvent::SyncDone(outcome) => {
                    self.scheduler
                        .on_sync_done(outcome, &self.synopsis, &self.writer, &tx, now);
                }
                EngineEvent::SyncDue => self.scheduler.start_sync(&tx),
                EngineEvent::ScheduleRun(delay_ms) => {
                    self.scheduler.run(delay_ms, &self.synopsis, &tx)
                }
                EngineEvent::PaymentNotice => self.scheduler.raise_payment_notice(),
                EngineEvent::Shutdown => break,
            }
        }
        info!("engine stopped");
    }

    fn on_visit(&mut self, location: &str, now_ms: i64, tx: &mpsc::Sender<EngineEvent>) {
        if location.is_empty() {
            return;
        }

        if self.tracker.note_location(location, &*self.resolver, now_ms) {
            self.projections.invalidate_publishers();
            self.writer.write(
                &self.config.publishers_path(),
                self.tracker.index(),
                WriteMode::Replace,
            );
        }

        if let Some(attribution) = self.tracker.pending_attribution(location, now_ms) {
            debug!(
                location = %attribution.location,
                elapsed_ms = attribution.elapsed_ms,
                "attributing dwell"
            );
            if let Some(publisher) = self.synopsis.add_visit(
                &attribution.location,
                attribution.elapsed_ms,
                &*self.resolver,
                now_ms,
            ) {
                if let Some(method) = scheme_of(&attribution.location) {
                    self.synopsis.set_method(&publisher, method);
                }
                self.maybe_fetch_favicon(&publisher, tx);
                self.writer.write(
                    &self.config.synopsis_path(),
                    &self.synopsis,
                    WriteMode::Replace,
                );
                self.projections.invalidate_synopsis();
            }
        }

        self.tracker.advance(location, now_ms);
    }

    /// Kick a one-time favicon fetch for a publisher whose method is known.
    /// The pending marker guarantees at most one fetch per publisher; only
    /// a 200 with an image body ever comes back as an event.
    fn maybe_fetch_favicon(&mut self, publisher: &str, tx: &mpsc::Sender<EngineEvent>) {
        if publisher.contains('/') {
            return;
        }
        let Some(record) = self.synopsis.record(publisher) else {
            return;
        };
        let Some(method) = record.method.clone() else {
            return;
        };
        if !self.synopsis.mark_favicon_pending(publisher) {
            return;
        }

        let url = format!("{}://{}/favicon.ico", method, publisher);
        debug!(%url, "requesting favicon");
        let fetcher = self.fetcher.clone();
        let tx = tx.clone();
        let publisher = publisher.to_string();
        tokio::spawn(async move {
            match fetcher.fetch(&url).await {
                Ok(body) => {
                    if let Some(favicon) = image_data_uri(&body) {
                        let _ = tx
                            .send(EngineEvent::FaviconFetched { publisher, favicon })
                            .await;
                    }
                }
                Err(e) => warn!(%url, error = %e, "favicon fetch failed"),
            }
        });
    }
}

async fn load_synopsis(config: &EngineConfig) -> Synopsis {
    let path = config.synopsis_path();
    match fs::read(&path).await {
        Ok(bytes) => match Synopsis::from_slice(&bytes) {
            Ok(synopsis) => {
                info!(publishers = synopsis.publishers().len(), "loaded synopsis");
                synopsis
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "synopsis parse error, starting empty");
                Synopsis::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Synopsis::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "synopsis read error, starting empty");
            Synopsis::default()
        }
    }
}

/// Scheme of a location, the way it reads before the `:/` separator.
fn scheme_of(location: &str) -> Option<&str> {
    match location.find(":/") {
        Some(i) if i > 0 => Some(&location[..i]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("http://a.com/x"), Some("http"));
        assert_eq!(scheme_of("https://a.com"), Some("https"));
        assert_eq!(scheme_of("no scheme here"), None);
        assert_eq!(scheme_of(":/leading"), None);
    }
}
