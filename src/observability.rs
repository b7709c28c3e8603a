//! Logging and observability helpers.

pub mod sensitive;

pub use sensitive::Sensitive;

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, Settings};

const LOG_FILE_PREFIX: &str = "sqlwarden.log";
const LOG_RETENTION_DAYS: u64 = 14;

/// Installs the global JSON subscriber.
///
/// `RUST_LOG` wins over the configured level. Logs go to stderr unless a
/// log directory is configured, in which case a daily rolling file is used.
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init_tracing(settings: &Settings) {
    let writer = match &settings.log_dir {
        Some(log_dir) => {
            if let Err(e) = fs::create_dir_all(log_dir) {
                eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
            }
            if let Err(e) = cleanup_old_logs(log_dir, LOG_RETENTION_DAYS) {
                eprintln!("Failed to clean up old logs: {}", e);
            }
            let file_appender: RollingFileAppender =
                tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            BoxMakeWriter::new(file_appender)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(settings.log_level))
        .with_writer(writer)
        .json()
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    install_panic_hook();

    tracing::info!(
        database = %settings.connection_string_safe(),
        log_level = %settings.log_level,
        "Tracing initialized"
    );
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

fn install_panic_hook() {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("PANIC: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("PANIC: {}", s)
        } else {
            "PANIC: unknown cause".to_string()
        };

        tracing::error!(target: "panic", location = %location, message = %msg, "Panic caught");

        previous_hook(panic_info);
    }));
}

/// Removes rolled log files older than `retention_days`. Returns how many
/// files were deleted.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();

        let is_ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_ours {
            continue;
        }

        let expired = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > retention)
            .unwrap_or(false);
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to remove old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_logs_survive_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sqlwarden.log.2026-10-15"), "{}").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let removed = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).unwrap();

        assert_eq!(removed, 0);
        assert!(dir.path().join("sqlwarden.log.2026-10-15").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn zero_retention_only_touches_our_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sqlwarden.log.2026-10-01"), "{}").unwrap();
        fs::write(dir.path().join("other.log"), "keep").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let removed = cleanup_old_logs(dir.path(), 0).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("sqlwarden.log.2026-10-01").exists());
        assert!(dir.path().join("other.log").exists());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cleanup_old_logs(&dir.path().join("absent"), 1).is_err());
    }
}
