//! Logging initialization with SIGHUP-driven file reopening.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use roost_config::RoostConfig;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Handle kept by the daemon so SIGHUP can rotate the log file.
#[derive(Clone)]
pub struct LogHandle {
    file: Arc<Mutex<Option<File>>>,
    path: Option<PathBuf>,
}

impl LogHandle {
    /// Reopens the log file (after an external rotation moved it away).
    pub fn rotate(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let reopened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("reopening log file {}", path.display()))?;
            *self.file.lock().unwrap() = Some(reopened);
        }
        Ok(())
    }
}

struct TeeWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = file.write_all(buf);
        }
        io::stdout().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = file.flush();
        }
        io::stdout().flush()
    }
}

#[derive(Clone)]
struct TeeMaker {
    file: Arc<Mutex<Option<File>>>,
}

impl<'a> MakeWriter<'a> for TeeMaker {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Installs the global subscriber. `ROOST_LOG` overrides the configured
/// level.
pub fn init(config: &RoostConfig, debug: bool) -> Result<LogHandle> {
    let directive = if debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_env("ROOST_LOG")
        .unwrap_or_else(|_| EnvFilter::new(directive));

    let file = match &config.logging.file {
        Some(path) => {
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(opened)
        }
        None => None,
    };
    let file = Arc::new(Mutex::new(file));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(TeeMaker {
            file: Arc::clone(&file),
        })
        .init();

    Ok(LogHandle {
        file,
        path: config.logging.file.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rotate_reopens_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("roostd.log");
        std::fs::write(&path, "old\n").unwrap();

        let handle = LogHandle {
            file: Arc::new(Mutex::new(Some(File::open(&path).unwrap()))),
            path: Some(path.clone()),
        };

        // Simulate logrotate moving the file aside.
        std::fs::rename(&path, temp.path().join("roostd.log.1")).unwrap();
        handle.rotate().unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_rotate_without_file_is_noop() {
        let handle = LogHandle {
            file: Arc::new(Mutex::new(None)),
            path: None,
        };
        handle.rotate().unwrap();
    }
}
