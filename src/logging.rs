//! Logging setup for the daemons.
//!
//! Console output plus a size-rotated log file (10 MB, 5 backups) under
//! the logs directory, both through tracing-subscriber with an env filter.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const BACKUP_COUNT: usize = 5;

/// A `Write` target that rotates `name.log` -> `name.log.1` .. `.5` when
/// the active file exceeds 10 MB.
struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, written })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        // Shift name.log.4 -> name.log.5, ... , name.log -> name.log.1
        let backup = |n: usize| PathBuf::from(format!("{}.{}", self.path.display(), n));
        let last = backup(BACKUP_COUNT);
        if last.exists() {
            std::fs::remove_file(&last)?;
        }
        for n in (1..BACKUP_COUNT).rev() {
            let from = backup(n);
            if from.exists() {
                std::fs::rename(&from, backup(n + 1))?;
            }
        }
        std::fs::rename(&self.path, backup(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingWriter {
    pub fn new(path: PathBuf) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile::open(path)?)),
        })
    }
}

pub struct RotatingWriterGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl Write for RotatingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard {
            inner: self.inner.clone(),
        }
    }
}

/// Initialize tracing for a daemon: console + `logs/{name}.log`.
///
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init(name: &str, logs_dir: &Path) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_writer = RotatingWriter::new(logs_dir.join(format!("{name}.log")))?;
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotation_shifts_backups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.log");
        let mut file = RotatingFile::open(path.clone()).unwrap();

        // Force a rotation by pretending the cap is reached
        file.written = MAX_LOG_BYTES;
        file.write_all(b"after rotate\n").unwrap();
        file.flush().unwrap();

        assert!(path.exists());
        assert!(dir.path().join("test.log.1").exists());
    }

    #[test]
    fn writes_land_in_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.log");
        let writer = RotatingWriter::new(path.clone()).unwrap();
        let mut w = writer.make_writer();
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));
    }
}
