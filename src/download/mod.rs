//! Download orchestration.
//!
//! One spawned driver task per download. The driver owns the task record,
//! consumes [`TransferUpdate`]s from the executor and is the only place that
//! publishes progress for its task, so a subscriber sees that task's events
//! in order and exactly one terminal event.

pub mod executor;
pub mod http;
pub mod rate;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ModelDescriptor;
use crate::envconfig::DEFAULT_DOWNLOAD_TAG;
use crate::error::{Error, Precondition, Result};
use crate::events::Events;

pub use executor::{DownloadExecutor, ExtraFile, TransferJob, TransferUpdate};
pub use http::HttpExecutor;
pub use rate::RateTracker;

const UPDATE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// `state` field of a published progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Downloading)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub task_id: Uuid,
    pub model_id: String,
    pub state: ProgressState,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub download_rate: u64,
    pub remaining_ms: u64,
    pub is_unzipping: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub id: Uuid,
    pub tag: String,
    pub descriptor: ModelDescriptor,
    pub local_path: PathBuf,
    pub state: DownloadState,
    pub received_bytes: u64,
    pub rate: u64,
    pub remaining_ms: u64,
    pub is_unzipping: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl DownloadTask {
    fn event(&self, state: ProgressState) -> DownloadEvent {
        DownloadEvent {
            task_id: self.id,
            model_id: self.descriptor.id.clone(),
            state,
            received_bytes: self.received_bytes,
            total_bytes: self.descriptor.expected_size,
            download_rate: self.rate,
            remaining_ms: self.remaining_ms,
            is_unzipping: self.is_unzipping,
            error_message: self.error_message.clone(),
        }
    }

    fn apply(&mut self, tracker: &mut RateTracker, update: TransferUpdate) {
        let received = update.received_bytes.max(self.received_bytes);
        tracker.record(Instant::now(), received);

        self.received_bytes = received;
        self.rate = update.rate.unwrap_or_else(|| tracker.rate());
        self.remaining_ms = update
            .remaining_ms
            .unwrap_or_else(|| tracker.remaining_ms(received, self.descriptor.expected_size));
        self.is_unzipping = update.unzipping;
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub descriptor: ModelDescriptor,
    pub source_url: String,
    pub extras: Vec<ExtraFile>,
    pub auth_token: Option<String>,
    pub archive: bool,
    /// Extraction target for archives; defaults to the model's download dir.
    pub unzip_dir: Option<PathBuf>,
    pub requires_network: bool,
    pub tag: Option<String>,
}

impl DownloadRequest {
    pub fn new(descriptor: ModelDescriptor, source_url: impl Into<String>) -> Self {
        Self {
            descriptor,
            source_url: source_url.into(),
            extras: Vec::new(),
            auth_token: None,
            archive: false,
            unzip_dir: None,
            requires_network: true,
            tag: None,
        }
    }

    pub fn extras(mut self, extras: Vec<ExtraFile>) -> Self {
        self.extras = extras;
        self
    }

    pub fn auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn archive(mut self, unzip_dir: Option<PathBuf>) -> Self {
        self.archive = true;
        self.unzip_dir = unzip_dir;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Caller's view of a started download.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: Uuid,
    tag: String,
    state_rx: watch::Receiver<DownloadTask>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn snapshot(&self) -> DownloadTask {
        self.state_rx.borrow().clone()
    }

    /// Resolves with the task record once it reaches a terminal state.
    pub async fn wait(&self) -> DownloadTask {
        let mut rx = self.state_rx.clone();
        if let Ok(task) = rx.wait_for(|task| task.state.is_terminal()).await {
            return task.clone();
        }
        let task = rx.borrow().clone();
        task
    }

    /// Like [`wait`](Self::wait), but a failed transfer becomes
    /// `Error::DownloadFailed`. Cancellation is not an error.
    pub async fn finish(&self) -> Result<DownloadTask> {
        let task = self.wait().await;
        match task.state {
            DownloadState::Failed => Err(Error::DownloadFailed(
                task.error_message
                    .unwrap_or_else(|| "transfer failed".to_string()),
            )),
            _ => Ok(task),
        }
    }
}

struct ActiveTask {
    tag: String,
    cancel: CancellationToken,
    state_rx: watch::Receiver<DownloadTask>,
}

type ActiveTasks = Arc<Mutex<HashMap<Uuid, ActiveTask>>>;

pub struct DownloadOrchestrator {
    root: PathBuf,
    default_tag: String,
    executor: Arc<dyn DownloadExecutor>,
    events: Arc<Events>,
    active: ActiveTasks,
}

impl DownloadOrchestrator {
    pub fn new<P: AsRef<Path>>(
        root: P,
        executor: Arc<dyn DownloadExecutor>,
        events: Arc<Events>,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            default_tag: DEFAULT_DOWNLOAD_TAG.to_string(),
            executor,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = tag.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn download_tag(&self) -> &str {
        &self.default_tag
    }

    /// Enqueue one transfer and return immediately. Running downloads for
    /// other models are left alone. Must be called inside a Tokio runtime.
    pub fn start(&self, request: DownloadRequest) -> Result<TaskHandle> {
        url::Url::parse(&request.source_url).map_err(|e| {
            Precondition::InvalidArgument(format!("source url {:?}: {}", request.source_url, e))
        })?;

        let id = Uuid::new_v4();
        let tag = request.tag.clone().unwrap_or_else(|| self.default_tag.clone());
        let descriptor = request.descriptor;
        let destination_dir = descriptor.download_dir(&self.root);
        let unzip_dir = request
            .archive
            .then(|| request.unzip_dir.clone().unwrap_or_else(|| destination_dir.clone()));
        let cancel = CancellationToken::new();

        let task = DownloadTask {
            id,
            tag: tag.clone(),
            local_path: descriptor.local_path(&self.root),
            descriptor: descriptor.clone(),
            state: DownloadState::Pending,
            received_bytes: 0,
            rate: 0,
            remaining_ms: 0,
            is_unzipping: false,
            error_message: None,
            started_at: Utc::now(),
        };

        let job = TransferJob {
            task_id: id,
            model_id: descriptor.id.clone(),
            source_url: request.source_url,
            destination_dir,
            file_name: descriptor.file_name.clone(),
            total_bytes: descriptor.expected_size,
            extras: request.extras,
            auth_token: request.auth_token,
            unzip_dir,
            requires_network: request.requires_network,
            requested_at: task.started_at,
            cancel: cancel.clone(),
        };

        let (state_tx, state_rx) = watch::channel(task.clone());
        self.active.lock().insert(
            id,
            ActiveTask {
                tag: tag.clone(),
                cancel: cancel.clone(),
                state_rx: state_rx.clone(),
            },
        );

        info!("download {} queued for {} (tag {})", id, descriptor.id, tag);

        tokio::spawn(drive(
            Arc::clone(&self.executor),
            Arc::clone(&self.events),
            Arc::clone(&self.active),
            job,
            task,
            state_tx,
            cancel,
        ));

        Ok(TaskHandle { id, tag, state_rx })
    }

    /// Cancel every outstanding download carrying `tag`. Returns how many
    /// were signalled.
    pub fn cancel(&self, tag: &str) -> usize {
        let active = self.active.lock();
        let mut count = 0;
        for (id, task) in active.iter().filter(|(_, t)| t.tag == tag) {
            debug!("cancelling download {}", id);
            task.cancel.cancel();
            count += 1;
        }
        info!("cancelled {} download(s) tagged {}", count, tag);
        count
    }

    pub fn active_tasks(&self) -> Vec<DownloadTask> {
        self.active
            .lock()
            .values()
            .map(|t| t.state_rx.borrow().clone())
            .collect()
    }

    pub fn query_presence(&self, descriptor: &ModelDescriptor) -> bool {
        is_present(&self.root, descriptor)
    }
}

/// Recomputed from disk every time: file at the derived path whose size is
/// exactly the catalog size. A partial file that happens to have the full
/// length is indistinguishable from a complete one.
pub fn is_present(root: &Path, descriptor: &ModelDescriptor) -> bool {
    let path = descriptor.local_path(root);
    match std::fs::metadata(&path) {
        Ok(meta) => {
            let present = meta.is_file() && meta.len() == descriptor.expected_size;
            debug!(
                "presence {:?}: size {} expected {} -> {}",
                path,
                meta.len(),
                descriptor.expected_size,
                present
            );
            present
        }
        Err(_) => false,
    }
}

enum Outcome {
    Finished,
    Failed(String),
    Cancelled,
}

async fn drive(
    executor: Arc<dyn DownloadExecutor>,
    events: Arc<Events>,
    active: ActiveTasks,
    job: TransferJob,
    mut task: DownloadTask,
    state_tx: watch::Sender<DownloadTask>,
    cancel: CancellationToken,
) {
    let is_archive = job.is_archive();
    let mut tracker = RateTracker::default();

    task.state = DownloadState::Running;
    state_tx.send_replace(task.clone());
    info!("download {} running: {} -> {:?}", task.id, job.source_url, task.local_path);

    let outcome = {
        let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
        let transfer = executor.transfer(job, tx);
        tokio::pin!(transfer);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                Some(update) = rx.recv() => {
                    task.apply(&mut tracker, update);
                    state_tx.send_replace(task.clone());
                    events.progress.try_publish(task.event(ProgressState::Downloading));
                }
                result = &mut transfer => {
                    while let Ok(update) = rx.try_recv() {
                        task.apply(&mut tracker, update);
                        state_tx.send_replace(task.clone());
                        events.progress.try_publish(task.event(ProgressState::Downloading));
                    }
                    break match result {
                        Ok(()) => Outcome::Finished,
                        Err(e) => Outcome::Failed(e.to_string()),
                    };
                }
            }
        }
    };

    let outcome = match outcome {
        Outcome::Finished if !is_archive => verify_size(&task).await,
        other => other,
    };

    let terminal = match outcome {
        Outcome::Finished => {
            task.state = DownloadState::Succeeded;
            task.received_bytes = task.descriptor.expected_size;
            task.rate = 0;
            task.remaining_ms = 0;
            task.is_unzipping = false;
            info!("download {} completed", task.id);
            ProgressState::Completed
        }
        Outcome::Failed(message) => {
            warn!("download {} failed: {}", task.id, message);
            task.state = DownloadState::Failed;
            task.error_message = Some(message);
            ProgressState::Failed
        }
        Outcome::Cancelled => {
            info!("download {} cancelled", task.id);
            task.state = DownloadState::Cancelled;
            task.rate = 0;
            task.remaining_ms = 0;
            ProgressState::Cancelled
        }
    };

    // Waiters are released before the terminal event, which may wait for
    // room in the subscriber's queue.
    active.lock().remove(&task.id);
    state_tx.send_replace(task.clone());
    events.progress.publish(task.event(terminal)).await;
}

async fn verify_size(task: &DownloadTask) -> Outcome {
    let expected = task.descriptor.expected_size;
    match tokio::fs::metadata(&task.local_path).await {
        Ok(meta) if meta.len() == expected => Outcome::Finished,
        Ok(meta) => Outcome::Failed(format!(
            "downloaded size {} does not match expected {}",
            meta.len(),
            expected
        )),
        Err(e) => Outcome::Failed(format!("{}: {}", task.local_path.display(), e)),
    }
}
