//! Process-wide tracing setup.

use crate::options::LogOptions;
use cohost_shared::errors::{CohostError, CohostResult};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "cohost.log";

/// Set once the subscriber is installed. Holds the file writer's guard so
/// buffered lines are flushed for the life of the process.
static LOGGING: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `options.filter`. Output goes to stderr,
/// or to a daily-rolled file under `options.dir`. Calls after the first
/// are no-ops.
pub fn init_logging(options: &LogOptions) -> CohostResult<()> {
    if LOGGING.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => configured_filter(&options.filter)?,
    };

    let guard = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Another subscriber may already be installed (tests, embedders).
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    };

    let _ = LOGGING.set(guard);
    Ok(())
}

fn configured_filter(directives: &str) -> CohostResult<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| CohostError::Config(format!("invalid log filter {:?}: {}", directives, e)))
}
