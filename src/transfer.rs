//! Transfer engine
//!
//! Chunked upload and download over a [`RemoteFs`], with progress reporting
//! after every chunk and recursive directory mirroring.
//!
//! Every transfer is registered in an active-task table for its duration.
//! Cancelling removes the entry; an in-flight chunk loop keeps going but its
//! remaining progress is no longer reported.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::transport::{remote_join, remote_parent, sort_entries, RemoteFs, TransportError};

/// Default chunk size (8 KiB)
pub const CHUNK_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Local path not found: {0}")]
    LocalNotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Remote error on {path}: {source}")]
    Remote { path: String, source: TransportError },

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),
}

impl TransferError {
    fn io(path: &Path, source: io::Error) -> Self {
        TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn remote(path: &str, source: impl Into<TransportError>) -> Self {
        TransferError::Remote {
            path: path.to_string(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// An in-flight transfer
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: String,
    pub direction: Direction,
    pub local: PathBuf,
    pub remote: String,
    pub total: u64,
    pub transferred: u64,
    pub started: Instant,
}

/// One progress report, sent after every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub task_id: String,
    /// 0.0 ..= 100.0
    pub percent: f64,
    /// Average rate since the task started, KiB/s
    pub rate_kbps: f64,
    pub bytes: u64,
    pub total: u64,
}

/// Engine-wide progress observer, called in addition to the per-call callback
pub type ProgressSink = Arc<dyn Fn(&Progress) + Send + Sync>;

pub struct TransferEngine {
    fs: Arc<dyn RemoteFs>,
    chunk_size: usize,
    tasks: Mutex<HashMap<String, TransferTask>>,
    next_id: AtomicU64,
    observer: Mutex<Option<ProgressSink>>,
}

impl TransferEngine {
    pub fn new(fs: Arc<dyn RemoteFs>) -> Self {
        Self {
            fs,
            chunk_size: CHUNK_SIZE,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            observer: Mutex::new(None),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn set_observer(&self, observer: Option<ProgressSink>) {
        *self.observer.lock().unwrap_or_else(|p| p.into_inner()) = observer;
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TransferTask>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of one active task
    pub fn status(&self, task_id: &str) -> Option<TransferTask> {
        self.tasks().get(task_id).cloned()
    }

    /// Snapshot of all active tasks, oldest first
    pub fn active(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<_> = self.tasks().values().cloned().collect();
        tasks.sort_by_key(|t| t.started);
        tasks
    }

    /// Drop a task from the table. Does not interrupt its chunk loop.
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.tasks().remove(task_id).is_some();
        if removed {
            info!("Cancelled transfer {}", task_id);
        }
        removed
    }

    fn register(&self, direction: Direction, local: &Path, remote: &str, total: u64) -> String {
        let id = format!("{}-{}", direction, self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = TransferTask {
            id: id.clone(),
            direction,
            local: local.to_path_buf(),
            remote: remote.to_string(),
            total,
            transferred: 0,
            started: Instant::now(),
        };
        self.tasks().insert(id.clone(), task);
        id
    }

    /// Record progress and notify. Returns quietly if the task was cancelled.
    fn report(&self, task_id: &str, bytes: u64, on_progress: &mut dyn FnMut(&Progress)) {
        let progress = {
            let mut tasks = self.tasks();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            task.transferred = bytes;
            let elapsed = task.started.elapsed().as_secs_f64();
            Progress {
                task_id: task_id.to_string(),
                percent: if task.total == 0 {
                    100.0
                } else {
                    bytes as f64 / task.total as f64 * 100.0
                },
                rate_kbps: if elapsed > 0.0 {
                    bytes as f64 / 1024.0 / elapsed
                } else {
                    0.0
                },
                bytes,
                total: task.total,
            }
        };

        on_progress(&progress);
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(observer) = observer {
            observer(&progress);
        }
    }

    /// Copy `reader` into `writer` chunk by chunk.
    fn pump(
        &self,
        task_id: &str,
        reader: &mut dyn Read,
        writer: &mut dyn Write,
        read_err: &dyn Fn(io::Error) -> TransferError,
        write_err: &dyn Fn(io::Error) -> TransferError,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<u64> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut transferred = 0u64;
        let mut reported = false;
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_err(e)),
            };
            writer.write_all(&buffer[..n]).map_err(write_err)?;
            transferred += n as u64;
            self.report(task_id, transferred, on_progress);
            reported = true;
        }
        writer.flush().map_err(write_err)?;
        if !reported {
            // Empty file: one report at 100%
            self.report(task_id, 0, on_progress);
        }
        Ok(transferred)
    }

    /// Create `dir` and any missing parents on the remote side.
    ///
    /// A failed mkdir is only an error if the directory still does not exist
    /// afterwards; someone else may have created it first.
    pub fn ensure_remote_dir(&self, dir: &str) -> Result<()> {
        if dir.is_empty() || dir == "/" || dir == "." {
            return Ok(());
        }
        match self.fs.stat(dir) {
            Ok(stat) if stat.is_dir => return Ok(()),
            Ok(_) => return Err(TransferError::NotADirectory(dir.to_string())),
            Err(_) => {}
        }
        if let Some(parent) = remote_parent(dir) {
            self.ensure_remote_dir(parent)?;
        }
        if let Err(e) = self.fs.mkdir(dir) {
            match self.fs.stat(dir) {
                Ok(stat) if stat.is_dir => debug!("{} was created concurrently", dir),
                _ => return Err(TransferError::remote(dir, e)),
            }
        }
        Ok(())
    }

    /// Upload one file, creating missing remote parent directories.
    pub fn upload(
        &self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        let metadata = fs::metadata(local).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::LocalNotFound(local.to_path_buf()),
            _ => TransferError::io(local, e),
        })?;
        if metadata.is_dir() {
            return Err(TransferError::IsADirectory(local.display().to_string()));
        }

        let task_id = self.register(Direction::Upload, local, remote, metadata.len());
        info!("{}: {} -> {}", task_id, local.display(), remote);
        let result = self.upload_task(&task_id, local, remote, on_progress);
        self.finish(&task_id, &result);
        result
    }

    fn upload_task(
        &self,
        task_id: &str,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        if let Some(parent) = remote_parent(remote) {
            self.ensure_remote_dir(parent)?;
        }
        let mut reader = File::open(local).map_err(|e| TransferError::io(local, e))?;
        let mut writer = self
            .fs
            .open_write(remote)
            .map_err(|e| TransferError::remote(remote, e))?;
        self.pump(
            task_id,
            &mut reader,
            &mut writer,
            &|e| TransferError::io(local, e),
            &|e| TransferError::remote(remote, e),
            on_progress,
        )?;
        Ok(())
    }

    /// Download one file, creating missing local parent directories.
    pub fn download(
        &self,
        remote: &str,
        local: &Path,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        let stat = self
            .fs
            .stat(remote)
            .map_err(|e| TransferError::remote(remote, e))?;
        if stat.is_dir {
            return Err(TransferError::IsADirectory(remote.to_string()));
        }

        let task_id = self.register(Direction::Download, local, remote, stat.size);
        info!("{}: {} -> {}", task_id, remote, local.display());
        let result = self.download_task(&task_id, remote, local, on_progress);
        self.finish(&task_id, &result);
        result
    }

    fn download_task(
        &self,
        task_id: &str,
        remote: &str,
        local: &Path,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
        let mut reader = self
            .fs
            .open_read(remote)
            .map_err(|e| TransferError::remote(remote, e))?;
        let mut writer = File::create(local).map_err(|e| TransferError::io(local, e))?;
        self.pump(
            task_id,
            &mut reader,
            &mut writer,
            &|e| TransferError::remote(remote, e),
            &|e| TransferError::io(local, e),
            on_progress,
        )?;
        Ok(())
    }

    fn finish(&self, task_id: &str, result: &Result<()>) {
        self.tasks().remove(task_id);
        match result {
            Ok(()) => info!("{} finished", task_id),
            Err(e) => warn!("{} failed: {}", task_id, e),
        }
    }

    /// Mirror a local tree under `remote_dir`. Stops at the first failure.
    ///
    /// Returns the number of files uploaded.
    pub fn upload_directory(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<usize> {
        if !local_dir.exists() {
            return Err(TransferError::LocalNotFound(local_dir.to_path_buf()));
        }
        if !local_dir.is_dir() {
            return Err(TransferError::NotADirectory(local_dir.display().to_string()));
        }
        self.ensure_remote_dir(remote_dir)?;

        let mut count = 0;
        for entry in WalkDir::new(local_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(local_dir).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
                TransferError::Io { path, source }
            })?;
            let relative = match entry.path().strip_prefix(local_dir) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let remote = relative
                .components()
                .fold(remote_dir.to_string(), |acc, c| {
                    remote_join(&acc, &c.as_os_str().to_string_lossy())
                });

            if entry.file_type().is_dir() {
                self.ensure_remote_dir(&remote)?;
            } else if entry.path_is_symlink() && entry.path().is_dir() {
                // Linked directories are not descended into
                debug!("Skipping linked directory {}", entry.path().display());
            } else {
                self.upload(entry.path(), &remote, on_progress)?;
                count += 1;
            }
        }
        info!(
            "Uploaded {} files from {} to {}",
            count,
            local_dir.display(),
            remote_dir
        );
        Ok(count)
    }

    /// Mirror a remote tree into `local_dir`. Stops at the first failure.
    ///
    /// Returns the number of files downloaded.
    pub fn download_directory(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<usize> {
        let stat = self
            .fs
            .stat(remote_dir)
            .map_err(|e| TransferError::remote(remote_dir, e))?;
        if !stat.is_dir {
            return Err(TransferError::NotADirectory(remote_dir.to_string()));
        }
        fs::create_dir_all(local_dir).map_err(|e| TransferError::io(local_dir, e))?;

        let mut entries = self
            .fs
            .list(remote_dir)
            .map_err(|e| TransferError::remote(remote_dir, e))?;
        sort_entries(&mut entries);

        let mut count = 0;
        for entry in entries {
            let remote = remote_join(remote_dir, &entry.name);
            let local = local_dir.join(&entry.name);
            if entry.is_dir() {
                count += self.download_directory(&remote, &local, on_progress)?;
            } else {
                self.download(&remote, &local, on_progress)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Read a remote file as UTF-8 text.
    pub fn read_text(&self, remote: &str) -> Result<String> {
        let mut reader = self
            .fs
            .open_read(remote)
            .map_err(|e| TransferError::remote(remote, e))?;
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| TransferError::remote(remote, e))?;
        Ok(text)
    }

    /// Replace a remote file's contents with `content`.
    pub fn write_text(&self, remote: &str, content: &str) -> Result<()> {
        let mut writer = self
            .fs
            .open_write(remote)
            .map_err(|e| TransferError::remote(remote, e))?;
        writer
            .write_all(content.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| TransferError::remote(remote, e))
    }
}
