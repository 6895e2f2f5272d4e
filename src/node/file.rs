//! Rotating file sink
//!
//! Appends formatted records to `<path>/<file_name>`. Before a write, the
//! active file is rotated when the record would push it past `max_bytes`
//! or when it has been open longer than `max_duration`. Rotated files are
//! renamed `<stem>-<unix nanos, 19 digits><ext>` and pruned to `max_files`.
//!
//! Writes, rotation and reopen all run under one lock. A write that fails
//! part way is truncated back to the last complete record.

use super::{Node, NodeKind};
use crate::error::{EventError, Result};
use crate::types::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Digits in a rotated file's timestamp suffix
const NANOS_WIDTH: usize = 19;

/// Sink that appends records to a rotating file
#[derive(Debug)]
pub struct FileSink {
    format: String,
    dir: PathBuf,
    file_name: String,

    /// Rotate before exceeding this many bytes (0 = no limit)
    max_bytes: u64,

    /// Rotate once the active file is older than this
    max_duration: Option<Duration>,

    /// Rotated files to keep (0 = keep all)
    max_files: usize,

    state: Mutex<ActiveFile>,
}

#[derive(Debug, Default)]
struct ActiveFile {
    file: Option<fs::File>,
    bytes_written: u64,
    opened_at: Option<DateTime<Utc>>,
}

impl FileSink {
    pub fn new(format: impl Into<String>, dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            dir: dir.into(),
            file_name: file_name.into(),
            max_bytes: 0,
            max_duration: None,
            max_files: 0,
            state: Mutex::new(ActiveFile::default()),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Path of the active file
    pub fn active_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Append one record, rotating first if a limit would be exceeded
    pub async fn write_record(&self, data: &[u8], now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.file.is_none() {
            self.open(state, now).await?;
        }
        if self.should_rotate(state, data.len() as u64, now) {
            self.rotate(state, now).await?;
        }

        let file = match state.file.as_mut() {
            Some(f) => f,
            None => return Err(self.sink_error("active file missing after open")),
        };
        if let Err(e) = append(file, data).await {
            discard_partial(file, state.bytes_written).await;
            return Err(e.into());
        }
        state.bytes_written += data.len() as u64;
        Ok(())
    }

    fn should_rotate(&self, state: &ActiveFile, incoming: u64, now: DateTime<Utc>) -> bool {
        if self.max_bytes > 0 && state.bytes_written > 0 && state.bytes_written + incoming > self.max_bytes {
            return true;
        }
        match (self.max_duration, state.opened_at) {
            (Some(max), Some(opened)) => match chrono::Duration::from_std(max) {
                Ok(max) => now - opened >= max,
                Err(_) => false,
            },
            _ => false,
        }
    }

    async fn open(&self, state: &mut ActiveFile, now: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            self.sink_error(format!("failed to create directory {}: {}", self.dir.display(), e))
        })?;
        let path = self.active_path();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| self.sink_error(format!("failed to open {}: {}", path.display(), e)))?;
        state.bytes_written = file.metadata().await?.len();
        state.file = Some(file);
        if state.opened_at.is_none() {
            state.opened_at = Some(now);
        }
        Ok(())
    }

    async fn rotate(&self, state: &mut ActiveFile, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
        }

        let (stem, ext) = split_name(&self.file_name);
        let mut nanos = now.timestamp_nanos_opt().unwrap_or_default().max(0);
        let mut rotated = self.dir.join(rotated_name(&stem, nanos, &ext));
        while fs::try_exists(&rotated).await.unwrap_or(false) {
            nanos += 1;
            rotated = self.dir.join(rotated_name(&stem, nanos, &ext));
        }

        let active = self.active_path();
        if fs::try_exists(&active).await.unwrap_or(false) {
            fs::rename(&active, &rotated).await.map_err(|e| {
                self.sink_error(format!("failed to rotate {}: {}", active.display(), e))
            })?;
            tracing::debug!(from = %active.display(), to = %rotated.display(), "Rotated event file");
        }

        self.prune_rotated().await?;

        state.opened_at = Some(now);
        self.open(state, now).await
    }

    /// Delete the oldest rotated files beyond `max_files`
    async fn prune_rotated(&self) -> Result<()> {
        if self.max_files == 0 {
            return Ok(());
        }
        let mut rotated = self.rotated_files().await?;
        while rotated.len() > self.max_files {
            let oldest = rotated.remove(0);
            if let Err(e) = fs::remove_file(&oldest).await {
                tracing::warn!(path = %oldest.display(), error = %e, "Failed to prune rotated event file");
            }
        }
        Ok(())
    }

    /// Rotated files, oldest first
    pub async fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let (stem, ext) = split_name(&self.file_name);
        let prefix = format!("{}-", stem);
        let mut rotated: Vec<(i64, PathBuf)> = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(ext.as_str())) else {
                continue;
            };
            // other sinks may use names like `events-2024.log` in the same directory
            if rest.len() != NANOS_WIDTH || !rest.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(nanos) = rest.parse::<i64>() {
                rotated.push((nanos, entry.path()));
            }
        }
        rotated.sort();
        Ok(rotated.into_iter().map(|(_, p)| p).collect())
    }

    fn sink_error(&self, reason: impl Into<String>) -> EventError {
        EventError::Sink {
            node: self.active_path().display().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Node for FileSink {
    async fn process(&self, event: Event) -> Result<Vec<Event>> {
        let data = event
            .formatted(&self.format)
            .ok_or_else(|| self.sink_error(format!("event has no '{}' formatted record", self.format)))?;
        self.write_record(data, event.created_at).await?;
        Ok(Vec::new())
    }

    /// Close and reopen the active file, picking up a file moved away by an
    /// external rotator
    async fn reopen(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
        }
        self.open(&mut state, Utc::now()).await
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }
}

fn rotated_name(stem: &str, nanos: i64, ext: &str) -> String {
    format!("{}-{:0width$}{}", stem, nanos, ext, width = NANOS_WIDTH)
}

async fn append(file: &mut fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

/// Truncate a torn record so the next append starts on a record boundary
async fn discard_partial(file: &mut fs::File, committed: u64) {
    if let Err(e) = file.set_len(committed).await {
        tracing::warn!(error = %e, committed, "Failed to truncate partially written event record");
    }
}

/// Split `audit.log` into (`audit`, `.log`); names without an extension get `""`
fn split_name(file_name: &str) -> (String, String) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}
