//! Local table channel
//!
//! A durable [`IngestChannel`] backed by a JSON-lines file under
//! `<data_dir>/<database>/<schema>/<table>.jsonl`. Submitted rows are buffered
//! in memory and appended by a background flusher every flush interval; only
//! after the append is synced to disk does the flusher publish the token of
//! the last row as the committed offset. Each line keeps its offset token, so
//! the committed offset survives restarts.

use crate::channel::{IngestChannel, InsertValidationResponse};
use crate::config::SinkConfig;
use crate::error::{RelayError, RelayResult};
use crate::record::Row;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Row waiting for the next flush
#[derive(Debug)]
struct PendingRow {
    row: Row,
    offset_token: String,
}

/// What the flusher has made durable so far
#[derive(Debug, Clone, Default)]
struct CommitStatus {
    token: Option<String>,
    error: Option<String>,
}

pub struct LocalTableChannel {
    name: String,
    path: PathBuf,
    content_column: String,
    max_content_bytes: usize,
    pending: Arc<Mutex<Vec<PendingRow>>>,
    status: watch::Receiver<CommitStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl LocalTableChannel {
    /// Open the channel described by the sink configuration
    pub async fn open(config: &SinkConfig) -> RelayResult<Self> {
        let path = config
            .data_dir
            .join(&config.database)
            .join(&config.schema)
            .join(format!("{}.jsonl", config.table));

        info!(
            endpoint = %config.endpoint(),
            channel = %config.channel_name,
            table = %path.display(),
            key_loaded = config.private_key.is_some(),
            "Opening ingest channel"
        );

        Self::open_at(
            &config.channel_name,
            path,
            &config.content_column,
            config.max_content_bytes,
            config.flush_interval(),
        )
        .await
    }

    /// Open a channel writing to `path`
    pub async fn open_at(
        name: &str,
        path: PathBuf,
        content_column: &str,
        max_content_bytes: usize,
        flush_interval: Duration,
    ) -> RelayResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RelayError::channel_with_source(
                    format!("Failed to create table directory {}", parent.display()),
                    e,
                )
            })?;
        }

        let recovered = recover_committed_offset(&path).await?;
        if let Some(token) = &recovered {
            info!(offset = %token, "Recovered committed offset for channel {}", name);
        }

        let pending = Arc::new(Mutex::new(Vec::new()));
        let (status_tx, status_rx) = watch::channel(CommitStatus {
            token: recovered,
            error: None,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let flusher = tokio::spawn(run_flusher(
            path.clone(),
            pending.clone(),
            status_tx,
            shutdown_rx,
            flush_interval,
        ));

        Ok(Self {
            name: name.to_string(),
            path,
            content_column: content_column.to_string(),
            max_content_bytes,
            pending,
            status: status_rx,
            shutdown: Some(shutdown_tx),
            flusher: Some(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(&self, row: &Row) -> Result<(), String> {
        match row.get(&self.content_column) {
            None | Some(Value::Null) => Err(format!(
                "column {} is required but missing",
                self.content_column
            )),
            Some(Value::String(content)) if content.len() > self.max_content_bytes => Err(format!(
                "value of {} bytes exceeds the {} byte limit of column {}",
                content.len(),
                self.max_content_bytes,
                self.content_column
            )),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl IngestChannel for LocalTableChannel {
    async fn submit(
        &mut self,
        row: Row,
        offset_token: &str,
    ) -> RelayResult<InsertValidationResponse> {
        if self.shutdown.is_none() {
            return Err(RelayError::channel(format!(
                "Channel {} is closed",
                self.name
            )));
        }

        if let Err(reason) = self.validate(&row) {
            return Ok(InsertValidationResponse::rejected(offset_token, reason));
        }

        self.pending.lock().await.push(PendingRow {
            row,
            offset_token: offset_token.to_string(),
        });
        Ok(InsertValidationResponse::ok())
    }

    async fn latest_committed_offset(&mut self) -> RelayResult<Option<String>> {
        let status = self.status.borrow().clone();
        if let Some(reason) = status.error {
            return Err(RelayError::channel(format!(
                "Channel {} stopped committing: {}",
                self.name, reason
            )));
        }
        Ok(status.token)
    }

    async fn close(&mut self) -> RelayResult<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };

        // The flusher performs a final flush before exiting
        let _ = shutdown.send(());
        if let Some(flusher) = self.flusher.take() {
            flusher.await.map_err(|e| {
                RelayError::channel_with_source(format!("Flusher of {} failed", self.name), e)
            })?;
        }

        let status = self.status.borrow().clone();
        if let Some(reason) = status.error {
            return Err(RelayError::channel(format!(
                "Final flush of {} failed: {}",
                self.name, reason
            )));
        }

        info!(
            "Channel {} closed at offset {}",
            self.name,
            status.token.as_deref().unwrap_or("none")
        );
        Ok(())
    }
}

impl Drop for LocalTableChannel {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            warn!("Channel {} dropped without close; unflushed rows are lost", self.name);
            if let Some(flusher) = self.flusher.take() {
                flusher.abort();
            }
        }
    }
}

/// Background task appending buffered rows until told to stop
async fn run_flusher(
    path: PathBuf,
    pending: Arc<Mutex<Vec<PendingRow>>>,
    status: watch::Sender<CommitStatus>,
    mut shutdown: oneshot::Receiver<()>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = &mut shutdown => true,
        };

        let rows = std::mem::take(&mut *pending.lock().await);
        if !rows.is_empty() {
            match append_rows(&path, &rows).await {
                Ok(()) => {
                    let token = rows.last().map(|r| r.offset_token.clone());
                    debug!(
                        rows = rows.len(),
                        offset = token.as_deref().unwrap_or("none"),
                        "Flushed rows to {}",
                        path.display()
                    );
                    status.send_modify(|s| s.token = token);
                }
                Err(e) => {
                    error!("Failed to append rows to {}: {}", path.display(), e);
                    status.send_modify(|s| s.error = Some(e.to_string()));
                    return;
                }
            }
        }

        if stopping {
            return;
        }
    }
}

async fn append_rows(path: &Path, rows: &[PendingRow]) -> std::io::Result<()> {
    let ingested_at = Utc::now().to_rfc3339();
    let mut buf = Vec::new();
    for pending in rows {
        let line = json!({
            "offset_token": pending.offset_token,
            "ingested_at": ingested_at,
            "row": pending.row,
        });
        serde_json::to_writer(&mut buf, &line)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Bytes read per step when scanning a table file backwards
const TAIL_CHUNK: usize = 8 * 1024;

/// Offset token of the last complete line in an existing table file
///
/// A trailing line that is unterminated or does not parse was cut short by a
/// crash during an append. Its rows were never reported as committed, so it
/// is truncated away before new rows are appended behind it.
async fn recover_committed_offset(path: &Path) -> RelayResult<Option<String>> {
    let read_err = |e: std::io::Error| {
        RelayError::channel_with_source(
            format!("Failed to read table file {}", path.display()),
            e,
        )
    };

    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(read_err(e)),
    };
    let len = file.metadata().await.map_err(read_err)?.len();

    // Everything past `end` has been ruled out
    let mut end = len;
    let mut token = None;
    while end > 0 {
        let last = read_range(&mut file, end - 1, end).await.map_err(read_err)?;
        let terminated = last == b"\n";
        let content_end = if terminated { end - 1 } else { end };
        let start = line_start(&mut file, content_end).await.map_err(read_err)?;
        let line = read_range(&mut file, start, content_end)
            .await
            .map_err(read_err)?;

        if terminated {
            if let Ok(entry) = serde_json::from_slice::<Value>(&line) {
                token = entry
                    .get("offset_token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                break;
            }
        }

        warn!(
            "Discarding incomplete line at byte {} of table file {}",
            start,
            path.display()
        );
        end = start;
    }

    if end < len {
        file.set_len(end).await.map_err(|e| {
            RelayError::channel_with_source(
                format!("Failed to truncate table file {}", path.display()),
                e,
            )
        })?;
        file.sync_data().await.map_err(read_err)?;
    }

    Ok(token)
}

/// Offset just past the last newline before `end`, or 0
async fn line_start(file: &mut File, end: u64) -> std::io::Result<u64> {
    let mut buf = vec![0u8; TAIL_CHUNK];
    let mut pos = end;
    while pos > 0 {
        let step = pos.min(TAIL_CHUNK as u64);
        let from = pos - step;
        let chunk = &mut buf[..step as usize];
        file.seek(SeekFrom::Start(from)).await?;
        file.read_exact(chunk).await?;
        if let Some(i) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(from + i as u64 + 1);
        }
        pos = from;
    }
    Ok(0)
}

async fn read_range(file: &mut File, from: u64, to: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; (to - from) as usize];
    file.seek(SeekFrom::Start(from)).await?;
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
