//! Console and file logging for the BASS client.
//!
//! `log::` macros used throughout the crate are bridged into `tracing`, which
//! writes to stdout and, when a log directory is given, to a daily rotated
//! file. Files older than the retention window are removed at startup.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "bass-client.log";

/// Initialize logging.
///
/// # Arguments
/// * `log_dir` - Directory for rotated log files, `None` for console only
/// * `retention_days` - Number of days to keep log files
/// * `verbose` - Use debug level unless `RUST_LOG` or `level` says otherwise
/// * `level` - Filter directive from the config file
pub fn init_logging(
    log_dir: Option<&Path>,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = match level {
        Some(level) => level,
        None if verbose => "debug",
        None => "info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_timer(LocalTimeTimer);

    let file = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            clean_old_logs(dir, retention_days)?;

            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // The guard flushes on drop; keep it for the program lifetime.
            let _ = Box::leak(Box::new(Arc::new(guard)));

            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_timer(LocalTimeTimer),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Remove log files older than `retention_days`.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(LOG_FILE_NAME))
            .unwrap_or(false);
        if !path.is_file() || !is_ours {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => chrono::DateTime::<Local>::from(modified),
            Err(_) => continue,
        };
        if modified < cutoff {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("Failed to remove old log file {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Local time with microseconds.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_old_logs_keeps_recent_files() {
        let dir = std::env::temp_dir().join(format!("bass-client-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let ours = dir.join(format!("{}.2026-01-01", LOG_FILE_NAME));
        let other = dir.join("unrelated.txt");
        fs::write(&ours, b"x").unwrap();
        fs::write(&other, b"x").unwrap();

        clean_old_logs(&dir, 7).unwrap();
        assert!(ours.exists());
        assert!(other.exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_clean_old_logs_missing_dir() {
        let dir = std::env::temp_dir().join("bass-client-logs-does-not-exist");
        assert!(clean_old_logs(&dir, 7).is_ok());
    }
}
