use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Side file fetched next to the main artifact (tokenizers, adapters...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFile {
    pub url: String,
    pub file_name: String,
}

/// Everything a transport needs to move one model onto disk.
#[derive(Clone)]
pub struct TransferJob {
    pub task_id: Uuid,
    pub model_id: String,
    pub source_url: String,
    pub destination_dir: PathBuf,
    pub file_name: String,
    pub total_bytes: u64,
    pub extras: Vec<ExtraFile>,
    pub auth_token: Option<String>,
    /// Set when the artifact is a zip archive to be extracted here.
    pub unzip_dir: Option<PathBuf>,
    /// Constraint for executors that schedule work. The HTTP executor starts
    /// at once and only records it.
    pub requires_network: bool,
    pub requested_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl TransferJob {
    pub fn destination(&self) -> PathBuf {
        self.destination_dir.join(&self.file_name)
    }

    pub fn is_archive(&self) -> bool {
        self.unzip_dir.is_some()
    }
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferJob")
            .field("task_id", &self.task_id)
            .field("model_id", &self.model_id)
            .field("source_url", &self.source_url)
            .field("destination_dir", &self.destination_dir)
            .field("file_name", &self.file_name)
            .field("total_bytes", &self.total_bytes)
            .field("extras", &self.extras.len())
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("unzip_dir", &self.unzip_dir)
            .field("requires_network", &self.requires_network)
            .field("requested_at", &self.requested_at)
            .finish()
    }
}

/// Periodic report from a running transfer. Rate and remaining time are
/// optional; the orchestrator estimates them when the transport does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferUpdate {
    pub received_bytes: u64,
    pub rate: Option<u64>,
    pub remaining_ms: Option<u64>,
    pub unzipping: bool,
}

impl TransferUpdate {
    pub fn received(received_bytes: u64) -> Self {
        Self {
            received_bytes,
            ..Self::default()
        }
    }
}

/// Transport that performs the byte copy. Retries, resume and HTTP details
/// live behind this trait. Returning `Ok` means the artifact is in place.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    async fn transfer(
        &self,
        job: TransferJob,
        updates: mpsc::Sender<TransferUpdate>,
    ) -> anyhow::Result<()>;
}
