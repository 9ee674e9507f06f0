//! Log setup. Stdout carries command output, so logs go to stderr, or to a
//! file under `--log-dir` when one is given.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "viewsync-tap.log";

/// Keep the returned guard alive until exit so buffered file logs flush.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = filter();
    match log_dir {
        Some(dir) => {
            if let Err(err) = fs_err::create_dir_all(dir) {
                eprintln!("viewsync-tap: cannot create log dir: {err}");
                init_stderr(filter);
                return None;
            }
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            init_stderr(filter);
            None
        }
    }
}

fn init_stderr(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var("VIEWSYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
