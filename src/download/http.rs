use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::executor::{DownloadExecutor, TransferJob, TransferUpdate};
use super::rate::RateTracker;

const TMP_SUFFIX: &str = "gallerytmp";

/// Streams artifacts over HTTP, resuming partial temp files with `Range`.
pub struct HttpExecutor {
    client: Client,
    progress_interval: Duration,
}

impl HttpExecutor {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("edge-gallery/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            progress_interval: Duration::from_millis(200),
        })
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    async fn fetch(
        &self,
        job: &TransferJob,
        url: &str,
        tmp: &Path,
        updates: Option<&mpsc::Sender<TransferUpdate>>,
    ) -> Result<u64> {
        let existing = tokio::fs::metadata(tmp).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if let Some(token) = &job.auth_token {
            request = request.bearer_auth(token);
        }
        if existing > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", existing));
        }

        let res = request.send().await?;
        let status = res.status();

        if existing > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("{} already fully present in {:?}", url, tmp);
            return Ok(existing);
        }
        if !status.is_success() {
            bail!("HTTP {} for {}", status, url);
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resumed {
            warn!("server ignored range request for {}, restarting from zero", url);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(tmp)
            .await?;

        let mut received = if resumed { existing } else { 0 };
        let mut tracker = RateTracker::default();
        tracker.record(Instant::now(), received);
        let mut last_emit = Instant::now();

        let mut body = res.bytes_stream();
        while let Some(item) = body.next().await {
            if job.cancel.is_cancelled() {
                bail!("transfer cancelled");
            }

            let chunk = item?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if let Some(tx) = updates {
                let now = Instant::now();
                if now.duration_since(last_emit) >= self.progress_interval {
                    last_emit = now;
                    tracker.record(now, received);
                    let update = TransferUpdate {
                        received_bytes: received,
                        rate: Some(tracker.rate()),
                        remaining_ms: Some(tracker.remaining_ms(received, job.total_bytes)),
                        unzipping: false,
                    };
                    tx.send(update).await.map_err(|_| abandoned())?;
                }
            }
        }

        file.flush().await?;
        Ok(received)
    }
}

#[async_trait]
impl DownloadExecutor for HttpExecutor {
    async fn transfer(
        &self,
        job: TransferJob,
        updates: mpsc::Sender<TransferUpdate>,
    ) -> Result<()> {
        // Runs immediately; deferring until a network is available is left to
        // schedulers that wrap this executor.
        debug!(?job, requires_network = job.requires_network, "starting http transfer");
        tokio::fs::create_dir_all(&job.destination_dir).await?;

        let dest = job.destination();
        let tmp = tmp_path(&dest);
        let received = self.fetch(&job, &job.source_url, &tmp, Some(&updates)).await?;
        updates
            .send(TransferUpdate::received(received))
            .await
            .map_err(|_| abandoned())?;

        for extra in &job.extras {
            let path = job.destination_dir.join(&extra.file_name);
            let extra_tmp = tmp_path(&path);
            self.fetch(&job, &extra.url, &extra_tmp, None).await?;
            tokio::fs::rename(&extra_tmp, &path).await?;
            debug!("fetched side file {:?}", path);
        }

        tokio::fs::rename(&tmp, &dest).await?;

        if let Some(target) = job.unzip_dir.clone() {
            updates
                .send(TransferUpdate {
                    received_bytes: received,
                    rate: Some(0),
                    remaining_ms: Some(0),
                    unzipping: true,
                })
                .await
                .map_err(|_| abandoned())?;

            let archive = dest.clone();
            tokio::task::spawn_blocking(move || extract_zip(&archive, &target))
                .await
                .map_err(|e| anyhow!("unzip task failed: {}", e))??;
            tokio::fs::remove_file(&dest).await?;
        }

        info!("transfer of {} finished ({} bytes)", job.model_id, received);
        Ok(())
    }
}

/// The driver dropped its end of the progress channel.
fn abandoned() -> anyhow::Error {
    anyhow!("transfer abandoned")
}

pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TMP_SUFFIX);
    dest.with_file_name(name)
}

fn extract_zip(archive: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(target)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let out = target.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut file)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use zip::write::SimpleFileOptions;

    /// Answers a single request with `body`.
    async fn serve_once(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{}/model.bin", addr)
    }

    fn job(dir: &Path, url: String, total_bytes: u64) -> TransferJob {
        TransferJob {
            task_id: uuid::Uuid::new_v4(),
            model_id: "m1".into(),
            source_url: url,
            destination_dir: dir.to_path_buf(),
            file_name: "model.bin".into(),
            total_bytes,
            extras: Vec::new(),
            auth_token: None,
            unzip_dir: None,
            requires_network: true,
            requested_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/m/gemma/main/model.task")),
            PathBuf::from("/m/gemma/main/model.task.gallerytmp")
        );
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        {
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            writer.add_directory("weights/", options).unwrap();
            writer.start_file("weights/model.bin", options).unwrap();
            writer.write_all(b"0123456789").unwrap();
            writer.start_file("config.json", options).unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }

        let target = dir.path().join("out");
        extract_zip(&archive, &target).unwrap();

        assert_eq!(std::fs::read(target.join("weights/model.bin")).unwrap(), b"0123456789");
        assert_eq!(std::fs::read(target.join("config.json")).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_transfer_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), serve_once(b"abcd").await, 4);
        let (tx, mut rx) = mpsc::channel(8);

        HttpExecutor::new().unwrap().transfer(job.clone(), tx).await.unwrap();

        assert_eq!(std::fs::read(job.destination()).unwrap(), b"abcd");
        assert!(!tmp_path(&job.destination()).exists());
        assert_eq!(rx.recv().await.unwrap().received_bytes, 4);
    }

    #[tokio::test]
    async fn test_transfer_stops_when_progress_is_not_wanted() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), serve_once(b"abcd").await, 4);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let err = HttpExecutor::new()
            .unwrap()
            .transfer(job.clone(), tx)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "transfer abandoned");
        assert!(!job.destination().exists());
    }
}
