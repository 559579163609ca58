//! Tracing setup for hosts embedding the engine.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: env-filter (`RUST_LOG` overrides
/// `level`), console fmt layer, and an optional daily-rolling file layer.
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing(level: &str, log_dir: Option<PathBuf>) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

        let console = fmt::layer().with_target(true);

        let file_layer = log_dir.map(|dir| {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "aura-flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            fmt::layer().json().with_writer(writer)
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file_layer)
            .init();

        info!("tracing initialised");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("debug", None);
        init_tracing("info", None);
    }
}
