//! Owns the single loaded engine and its session.
//!
//! `initialize`, `dispose` and the scheduling step of `generate` are
//! serialized against each other, so at most one engine is ever alive and a
//! session is never driven after it was closed. Every loaded pair gets an
//! epoch; generation output is only published while its epoch is still
//! current, which keeps a superseded session from leaking tokens into the
//! stream after a re-init.

pub mod engine;
pub mod metrics;
pub mod params;

pub use engine::{
    Backend, EngineLoader, EngineOptions, InferenceEngine, InferenceSession, PartialResult,
    PartialStream, SessionOptions,
};
pub use metrics::TokenMeter;
pub use params::InferenceParams;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ModelDescriptor;
use crate::error::{Error, Precondition, Result};
use crate::events::Events;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationEvent {
    pub partial_result: String,
    pub is_done: bool,
    pub tokens_per_second: f64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationEvent {
    fn finished(meter: &TokenMeter, error: Option<String>) -> Self {
        Self {
            partial_result: String::new(),
            is_done: true,
            tokens_per_second: meter.tokens_per_second(),
            total_tokens: meter.total(),
            error,
        }
    }
}

struct Loaded {
    epoch: u64,
    model_id: String,
    model_path: PathBuf,
    engine: Arc<dyn InferenceEngine>,
    session: Arc<dyn InferenceSession>,
    generating: Arc<AtomicBool>,
    /// Cancelled once the pair leaves the slot.
    retired: CancellationToken,
}

impl Loaded {
    fn retire(self) -> Self {
        self.retired.cancel();
        self
    }
}

#[derive(Default)]
struct Slot {
    last_epoch: u64,
    loaded: Option<Loaded>,
}

impl Slot {
    fn current_epoch(&self) -> Option<u64> {
        self.loaded.as_ref().map(|l| l.epoch)
    }
}

pub struct InferenceSessionManager {
    loader: Arc<dyn EngineLoader>,
    events: Arc<Events>,
    slot: Arc<Mutex<Slot>>,
    lifecycle: Mutex<()>,
    last_release_error: parking_lot::Mutex<Option<String>>,
}

impl InferenceSessionManager {
    pub fn new(loader: Arc<dyn EngineLoader>, events: Arc<Events>) -> Self {
        Self {
            loader,
            events,
            slot: Arc::new(Mutex::new(Slot::default())),
            lifecycle: Mutex::new(()),
            last_release_error: parking_lot::Mutex::new(None),
        }
    }

    /// Release whatever is loaded, then build a fresh engine and session.
    ///
    /// On failure nothing stays loaded and later `generate` calls fail with
    /// `NO_MODEL`.
    pub async fn initialize(
        &self,
        descriptor: &ModelDescriptor,
        model_path: impl AsRef<Path>,
        params: InferenceParams,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let model_path = model_path.as_ref().to_path_buf();

        let previous = self.slot.lock().await.loaded.take().map(Loaded::retire);
        if let Some(previous) = &previous {
            info!("replacing loaded model {}", previous.model_id);
        }

        let engine_options = params.engine_options(&model_path);
        let session_options = params.session_options();
        let loader = Arc::clone(&self.loader);

        info!(
            model = %descriptor.id,
            backend = %params.backend,
            max_tokens = params.max_tokens,
            "loading engine from {:?}",
            model_path
        );

        let (release_error, created) = tokio::task::spawn_blocking(move || {
            let release_error = previous.and_then(release);
            let created = construct(loader.as_ref(), &engine_options, &session_options);
            (release_error, created)
        })
        .await
        .map_err(|e| Error::InitializationFailed(format!("engine task failed: {}", e)))?;

        self.record_release(release_error);
        let (engine, session) = created?;

        let mut slot = self.slot.lock().await;
        slot.last_epoch += 1;
        slot.loaded = Some(Loaded {
            epoch: slot.last_epoch,
            model_id: descriptor.id.clone(),
            model_path,
            engine,
            session,
            generating: Arc::new(AtomicBool::new(false)),
            retired: CancellationToken::new(),
        });
        info!(model = %descriptor.id, epoch = slot.last_epoch, "model ready");
        Ok(())
    }

    /// Queue `prompt` and start streaming output on the token channel.
    ///
    /// Returns once generation has started. A second call while the first is
    /// still streaming is rejected with `BUSY`. Replacing or disposing the
    /// session waits until the prompt has been handed to the engine.
    pub async fn generate(&self, prompt: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (session, epoch, busy, retired) = {
            let slot = self.slot.lock().await;
            let loaded = slot.loaded.as_ref().ok_or(Precondition::NoModel)?;
            if loaded.generating.swap(true, Ordering::SeqCst) {
                return Err(Precondition::GenerationInProgress.into());
            }
            (
                Arc::clone(&loaded.session),
                loaded.epoch,
                BusyGuard(Arc::clone(&loaded.generating)),
                loaded.retired.clone(),
            )
        };

        let prompt = prompt.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            session.add_query_chunk(&prompt)?;
            session.generate()
        })
        .await
        .map_err(|e| Error::Inference(format!("generation task failed: {}", e)))?
        .map_err(|e| Error::Inference(e.to_string()))?;

        debug!(epoch, "generation started");
        tokio::spawn(pump(
            stream,
            epoch,
            Arc::clone(&self.slot),
            Arc::clone(&self.events),
            busy,
            retired,
        ));
        Ok(())
    }

    /// Release the session and engine. Never fails; a release error is
    /// logged and kept for `last_release_error`.
    pub async fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(previous) = self.slot.lock().await.loaded.take().map(Loaded::retire) else {
            debug!("dispose with nothing loaded");
            return;
        };

        let model_id = previous.model_id.clone();
        let release_error = match tokio::task::spawn_blocking(move || release(previous)).await {
            Ok(err) => err,
            Err(e) => Some(format!("release task failed: {}", e)),
        };
        self.record_release(release_error);
        info!("disposed model {}", model_id);
    }

    pub async fn is_initialized(&self) -> bool {
        self.slot.lock().await.loaded.is_some()
    }

    pub async fn current_model(&self) -> Option<String> {
        self.slot.lock().await.loaded.as_ref().map(|l| l.model_id.clone())
    }

    pub async fn current_model_path(&self) -> Option<PathBuf> {
        self.slot.lock().await.loaded.as_ref().map(|l| l.model_path.clone())
    }

    pub async fn is_generating(&self) -> bool {
        self.slot
            .lock()
            .await
            .loaded
            .as_ref()
            .map(|l| l.generating.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Outcome of the most recent release; `None` when it was clean.
    pub fn last_release_error(&self) -> Option<Error> {
        self.last_release_error.lock().clone().map(Error::DisposeFailed)
    }

    fn record_release(&self, error: Option<String>) {
        *self.last_release_error.lock() = error;
    }
}

/// Clears the session's busy flag when generation ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump(
    mut stream: PartialStream,
    epoch: u64,
    slot: Arc<Mutex<Slot>>,
    events: Arc<Events>,
    busy: BusyGuard,
    retired: CancellationToken,
) {
    let mut meter = TokenMeter::start();

    loop {
        let next = tokio::select! {
            _ = retired.cancelled() => None,
            next = stream.next() => Some(next),
        };
        let Some(next) = next else {
            debug!(epoch, "session retired while generating");
            return;
        };

        let event = match next {
            Some(Ok(partial)) => {
                let total = meter.record(&partial.text);
                GenerationEvent {
                    partial_result: partial.text,
                    is_done: partial.done,
                    tokens_per_second: meter.tokens_per_second(),
                    total_tokens: total,
                    error: None,
                }
            }
            Some(Err(e)) => {
                warn!(epoch, "generation failed: {}", e);
                GenerationEvent::finished(&meter, Some(e.to_string()))
            }
            None => {
                debug!(epoch, "engine stream ended without a final partial");
                GenerationEvent::finished(&meter, None)
            }
        };
        let done = event.is_done;

        // Room in the subscriber's queue is claimed before the slot lock, so
        // a slow consumer never holds up initialize or dispose.
        let reservation = tokio::select! {
            _ = retired.cancelled() => {
                debug!(epoch, "session retired while waiting for the consumer");
                return;
            }
            reservation = events.tokens.reserve() => reservation,
        };

        let guard = slot.lock().await;
        if guard.current_epoch() != Some(epoch) {
            debug!(epoch, "discarding output from a superseded session");
            return;
        }
        if done {
            busy.release();
        }
        if let Some(reservation) = reservation {
            reservation.send(event);
        }
        drop(guard);

        if done {
            debug!(epoch, tokens = meter.total(), "generation finished");
            return;
        }
    }
}

fn construct(
    loader: &dyn EngineLoader,
    engine_options: &EngineOptions,
    session_options: &SessionOptions,
) -> Result<(Arc<dyn InferenceEngine>, Arc<dyn InferenceSession>)> {
    let engine = loader
        .load(engine_options)
        .map_err(|e| Error::InitializationFailed(e.to_string()))?;

    match engine.create_session(session_options) {
        Ok(session) => Ok((engine, session)),
        Err(e) => {
            if let Err(close_err) = engine.close() {
                warn!("closing engine after session failure: {}", close_err);
            }
            Err(Error::InitializationFailed(e.to_string()))
        }
    }
}

/// Session first, then engine. Both are attempted even if the first fails.
fn release(loaded: Loaded) -> Option<String> {
    let mut errors = Vec::new();
    if let Err(e) = loaded.session.close() {
        warn!(model = %loaded.model_id, "session close failed: {}", e);
        errors.push(format!("session: {}", e));
    }
    if let Err(e) = loaded.engine.close() {
        warn!(model = %loaded.model_id, "engine close failed: {}", e);
        errors.push(format!("engine: {}", e));
    }
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}
