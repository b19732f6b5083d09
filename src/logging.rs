use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_LOG_BYTES: u64 = 5_000_000;
const LOG_BACKUPS: usize = 5;

/// Logs to stderr and appends to `log_path`, rotating it as it grows.
pub fn init(log_path: &Path) -> Result<()> {
    let file = RotatingFile::open(log_path, MAX_LOG_BYTES, LOG_BACKUPS)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "homelab=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()?;

    Ok(())
}

/// An append-only log file that shifts itself to `<name>.1` once a write
/// would take it past `max_bytes`, keeping at most `backups` old files.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    len: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        rotate(path, max_bytes, backups)?;
        let (file, len) = append_to(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            file,
            len,
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        rotate(&self.path, 0, self.backups).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let (file, len) = append_to(&self.path)?;
        self.file = file;
        self.len = len;
        Ok(())
    }
}

fn append_to(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // a single oversized record still goes into a fresh file whole
        if self.len > 0 && self.len + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Shifts `app.log` to `app.log.1` (and so on, dropping the oldest) once it
/// has grown past `max_bytes`.
fn rotate(path: &Path, max_bytes: u64, backups: usize) -> Result<()> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if size <= max_bytes {
        return Ok(());
    }
    if backups == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }

    let backup = |n: usize| -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let oldest = backup(backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backups).rev() {
        let from = backup(n);
        if from.exists() {
            fs::rename(&from, backup(n + 1))?;
        }
    }
    fs::rename(path, backup(1))?;

    Ok(())
}

/// Collects formatted log output in memory so tests can assert on it.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl CapturedLogs {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let logs = self.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || logs.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where user-facing console lines go. Constructed at startup, handed to the
/// coordinator, and detached on shutdown; lines written after that are dropped.
#[derive(Clone)]
pub struct LogSink {
    tx: Arc<Mutex<Option<UnboundedSender<String>>>>,
}

impl LogSink {
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (sink, rx)
    }

    pub fn line(&self, text: impl Into<String>) {
        let Ok(mut guard) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            if tx.send(text.into()).is_err() {
                // reader is gone, stop trying
                *guard = None;
            }
        }
    }

    pub fn detach(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}
