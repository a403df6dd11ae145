#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use edge_gallery::download::{DownloadExecutor, TransferJob, TransferUpdate};
use edge_gallery::inference::{
    EngineLoader, EngineOptions, InferenceEngine, InferenceSession, PartialResult, PartialStream,
    SessionOptions,
};
use edge_gallery::{Catalog, CatalogEntry, StaticCatalog};

pub fn catalog() -> Arc<dyn Catalog> {
    let entries: Vec<CatalogEntry> = serde_json::from_str(
        r#"[
            {"modelId": "google/gemma-3n-E2B-it-litert-preview",
             "modelFile": "gemma-3n-E2B-it-int4.task",
             "sizeInBytes": 64, "version": "20250520",
             "defaultConfig": {"topK": 64, "topP": 0.95, "temperature": 1.0,
                               "maxTokens": 4096, "accelerators": "cpu,gpu"}},
            {"modelId": "m1", "modelFile": "m1.bin", "sizeInBytes": 16}
        ]"#,
    )
    .unwrap();
    Arc::new(StaticCatalog::new(entries))
}

/// Writes `job.total_bytes` bytes in a few steps, reporting after each.
pub struct WritingExecutor;

#[async_trait]
impl DownloadExecutor for WritingExecutor {
    async fn transfer(
        &self,
        job: TransferJob,
        updates: mpsc::Sender<TransferUpdate>,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&job.destination_dir).await?;
        let half = job.total_bytes / 2;
        updates.send(TransferUpdate::received(half)).await?;
        tokio::fs::write(job.destination(), vec![7u8; job.total_bytes as usize]).await?;
        updates.send(TransferUpdate::received(job.total_bytes)).await?;
        Ok(())
    }
}

/// Waits for cancellation.
pub struct StallingExecutor;

#[async_trait]
impl DownloadExecutor for StallingExecutor {
    async fn transfer(
        &self,
        job: TransferJob,
        updates: mpsc::Sender<TransferUpdate>,
    ) -> anyhow::Result<()> {
        updates.send(TransferUpdate::received(1)).await?;
        job.cancel.cancelled().await;
        Err(anyhow!("cancelled"))
    }
}

pub enum Script {
    Fixed(Vec<anyhow::Result<PartialResult>>),
    Manual(mpsc::UnboundedReceiver<anyhow::Result<PartialResult>>),
}

impl Script {
    pub fn tokens(parts: &[(&str, bool)]) -> Self {
        Script::Fixed(
            parts
                .iter()
                .map(|(text, done)| Ok(PartialResult::new(*text, *done)))
                .collect(),
        )
    }

    pub fn manual() -> (mpsc::UnboundedSender<anyhow::Result<PartialResult>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Manual(rx))
    }
}

/// Shared state of the fake engine family: what happened, and what to do.
#[derive(Default)]
pub struct EngineLab {
    pub journal: Mutex<Vec<String>>,
    pub scripts: Mutex<VecDeque<Script>>,
    pub prompts: Mutex<Vec<String>>,
    pub loaded: Mutex<Vec<EngineOptions>>,
    pub sessions: Mutex<Vec<SessionOptions>>,
    pub fail_load: AtomicBool,
    pub fail_session: AtomicBool,
    pub fail_close: AtomicBool,
    pub live_engines: AtomicUsize,
    pub peak_engines: AtomicUsize,
    pub load_delay: Mutex<Option<Duration>>,
    pub chunk_delay: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

impl EngineLab {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn log(&self, entry: String) {
        self.journal.lock().push(entry);
    }
}

pub struct FakeLoader(pub Arc<EngineLab>);

impl EngineLoader for FakeLoader {
    fn load(&self, options: &EngineOptions) -> anyhow::Result<Arc<dyn InferenceEngine>> {
        let lab = &self.0;
        if let Some(delay) = *lab.load_delay.lock() {
            std::thread::sleep(delay);
        }
        if lab.fail_load.load(Ordering::SeqCst) {
            lab.log("load-failed".into());
            return Err(anyhow!("model file is corrupt"));
        }
        let id = lab.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let live = lab.live_engines.fetch_add(1, Ordering::SeqCst) + 1;
        lab.peak_engines.fetch_max(live, Ordering::SeqCst);
        lab.loaded.lock().push(options.clone());
        lab.log(format!("load:{}", id));
        Ok(Arc::new(FakeEngine {
            id,
            lab: Arc::clone(lab),
        }))
    }
}

struct FakeEngine {
    id: usize,
    lab: Arc<EngineLab>,
}

impl InferenceEngine for FakeEngine {
    fn create_session(
        &self,
        options: &SessionOptions,
    ) -> anyhow::Result<Arc<dyn InferenceSession>> {
        if self.lab.fail_session.load(Ordering::SeqCst) {
            self.lab.log(format!("session-failed:{}", self.id));
            return Err(anyhow!("out of memory"));
        }
        self.lab.sessions.lock().push(options.clone());
        self.lab.log(format!("session:{}", self.id));
        Ok(Arc::new(FakeSession {
            id: self.id,
            lab: Arc::clone(&self.lab),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> anyhow::Result<()> {
        self.lab.live_engines.fetch_sub(1, Ordering::SeqCst);
        self.lab.log(format!("close-engine:{}", self.id));
        if self.lab.fail_close.load(Ordering::SeqCst) {
            return Err(anyhow!("native handle leaked"));
        }
        Ok(())
    }
}

struct FakeSession {
    id: usize,
    lab: Arc<EngineLab>,
    closed: AtomicBool,
}

impl FakeSession {
    fn ensure_open(&self, call: &str) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.lab.log(format!("{}-on-closed:{}", call, self.id));
            return Err(anyhow!("session {} is closed", self.id));
        }
        Ok(())
    }
}

impl InferenceSession for FakeSession {
    fn add_query_chunk(&self, text: &str) -> anyhow::Result<()> {
        self.ensure_open("add-query")?;
        if let Some(delay) = *self.lab.chunk_delay.lock() {
            std::thread::sleep(delay);
        }
        self.lab.prompts.lock().push(text.to_string());
        Ok(())
    }

    fn generate(&self) -> anyhow::Result<PartialStream> {
        self.ensure_open("generate")?;
        self.lab.log(format!("generate:{}", self.id));
        let script = self
            .lab
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::tokens(&[("", true)]));
        Ok(match script {
            Script::Fixed(items) => futures::stream::iter(items).boxed(),
            Script::Manual(rx) => UnboundedReceiverStream::new(rx).boxed(),
        })
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.lab.log(format!("close-session:{}", self.id));
        Ok(())
    }
}
