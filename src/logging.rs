// src/logging.rs
//
// Process-wide tracing setup: console output plus an optional timestamped
// log file with a stable `grip.log` symlink pointing at the newest one.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};
use uuid::Uuid;

use crate::config::LoggingConfig;
use crate::error::{BackendError, Result};

const SYMLINK_NAME: &str = "grip.log";

/// Keeps the file writer alive; logs are flushed when this is dropped.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    run_id: String,
    log_path: Option<PathBuf>,
}

impl LoggingGuard {
    /// Short random id stamped on this run's header line
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Path of this run's log file, if file logging is enabled
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

/// 8 hex chars, enough to tell runs apart in a shared log directory
pub fn new_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Create `dir` and pick this run's log file name. Also repoints the
/// `grip.log` symlink at it (Unix only; Windows symlinks need elevation).
pub fn prepare_log_file(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BackendError::Config(format!("Failed to create log dir {}: {}", dir.display(), e)))?;

    let filename = chrono::Local::now().format("%Y%m%d-%H%M%S-grip.log").to_string();

    #[cfg(unix)]
    {
        let symlink_path = dir.join(SYMLINK_NAME);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("[logging] Failed to create {} symlink: {}", SYMLINK_NAME, e);
        }
    }

    Ok(dir.join(filename))
}

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BackendError::Config(format!("Invalid log level {:?}: {}", config.level, e)))?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(false);

    let mut file_guard = None;
    let mut log_path = None;
    let file_layer = match &config.log_dir {
        Some(dir) => {
            let path = prepare_log_file(dir)?;
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .ok_or_else(|| BackendError::Config("Log file has no name".to_string()))?;
            let appender = rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            log_path = Some(path);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BackendError::Config(format!("Logging already initialised: {}", e)))?;

    let run_id = new_run_id();
    tracing::info!(
        "[logging] Run {} started ({} {})",
        run_id,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    if let Some(path) = &log_path {
        tracing::info!("[logging] Writing to {}", path.display());
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
        run_id,
        log_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_run_id(), id);
    }

    #[test]
    fn test_prepare_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let path = prepare_log_file(&dir).unwrap();

        assert!(dir.is_dir());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-grip.log"));
        assert_eq!(name.len(), "20260101-120000-grip.log".len());

        #[cfg(unix)]
        {
            let target = std::fs::read_link(dir.join(SYMLINK_NAME)).unwrap();
            assert_eq!(target, PathBuf::from(&name));
        }
    }
}
