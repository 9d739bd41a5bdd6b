//! Size-bounded rotating log files.
//!
//! Console output from hypervisor processes can be unbounded, so every write goes through a
//! background task that rotates the file once it would exceed the configured size:
//! `console.log` becomes `console.log.1`, `console.log.1` becomes `console.log.2`, and so on up to
//! the configured number of backups. The oldest backup is discarded.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use tokio::{
    fs::{remove_file, rename, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};

use crate::path::backup_log_path;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default maximum size of a log file before it is rotated (4 MiB).
pub const DEFAULT_LOG_MAX_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of rotated backups kept next to the live log file.
pub const DEFAULT_LOG_BACKUPS: usize = 2;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A log file that rotates itself when it reaches a maximum size.
///
/// ## Example
///
/// ```no_run
/// use std::io::Write;
/// use fleetutils::log::RotatingLog;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let log = RotatingLog::new("console.log").await?;
///     let mut writer = log.get_sync_writer();
///     writer.write_all(b"booting\n")?;
///     log.flush().await
/// }
/// ```
pub struct RotatingLog {
    /// Path to the live log file
    path: PathBuf,

    /// Channel feeding the background writer
    tx: UnboundedSender<LogCommand>,

    /// Background task handle
    _background_task: JoinHandle<()>,
}

/// A sync writer that forwards everything written to it to a [`RotatingLog`].
#[derive(Clone)]
pub struct SyncChannelWriter {
    tx: UnboundedSender<LogCommand>,
}

enum LogCommand {
    Data(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
}

struct LogFile {
    file: File,
    path: PathBuf,
    size: u64,
    max_size: u64,
    max_backups: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Opens (or creates) a rotating log with the default size limit and backup count.
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_limits(path, DEFAULT_LOG_MAX_SIZE, DEFAULT_LOG_BACKUPS).await
    }

    /// Opens (or creates) a rotating log with explicit limits.
    ///
    /// Existing content is kept and counts towards the size limit.
    pub async fn with_limits(
        path: impl AsRef<Path>,
        max_size: u64,
        max_backups: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path).await?;
        let size = file.metadata().await?.len();
        let (tx, rx) = mpsc::unbounded_channel();

        let log_file = LogFile {
            file,
            path: path.clone(),
            size,
            max_size,
            max_backups,
        };

        let background_task = tokio::spawn(run_writer(rx, log_file));

        Ok(Self {
            path,
            tx,
            _background_task: background_task,
        })
    }

    /// Returns the path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a sync writer that implements [`std::io::Write`].
    pub fn get_sync_writer(&self) -> SyncChannelWriter {
        SyncChannelWriter {
            tx: self.tx.clone(),
        }
    }

    /// Waits until everything written so far has reached the file.
    pub async fn flush(&self) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Flush(done_tx))
            .map_err(|_| io::Error::other("log writer has stopped"))?;

        done_rx
            .await
            .map_err(|_| io::Error::other("log writer has stopped"))?
    }
}

impl LogFile {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let len = data.len() as u64;
        if self.size > 0 && self.size + len > self.max_size {
            self.rotate().await?;
        }

        self.file.write_all(data).await?;
        self.size += len;
        Ok(())
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;

        if self.max_backups == 0 {
            remove_file(&self.path).await?;
        } else {
            let oldest = backup_log_path(&self.path, self.max_backups);
            if oldest.exists() {
                remove_file(&oldest).await?;
            }

            for index in (1..self.max_backups).rev() {
                let from = backup_log_path(&self.path, index);
                if from.exists() {
                    rename(&from, backup_log_path(&self.path, index + 1)).await?;
                }
            }

            rename(&self.path, backup_log_path(&self.path, 1)).await?;
        }

        self.file = open_append(&self.path).await?;
        self.size = 0;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn run_writer(mut rx: UnboundedReceiver<LogCommand>, mut log_file: LogFile) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Data(data) => {
                if let Err(e) = log_file.append(&data).await {
                    tracing::error!(path = %log_file.path.display(), error = %e, "failed to write log data");
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(log_file.file.flush().await);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Write for SyncChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(LogCommand::Data(buf.to_vec()))
            .map_err(|_| io::Error::other("failed to send log data to channel"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
