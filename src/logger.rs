//! Logging bootstrap for binaries, examples and tests.
//!
//! The engine itself only emits `tracing` events: per-update statistics
//! (variables re-eliminated, cliques created, factors recalculated) and
//! dogleg trust-region iterations at DEBUG, error chains at ERROR. Nothing
//! in the library requires a subscriber; this module is a convenience for
//! executables that want those events on stderr without wiring up
//! `tracing_subscriber` themselves. Applications embedding the engine should
//! install their own subscriber and skip this module.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the default subscriber: compact single-line output on stderr,
/// INFO level unless overridden via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use trellis_isam::init_logger;
///
/// init_logger();
/// tracing::info!("engine ready");
/// ```
///
/// Watching an incremental run is mostly a matter of the DEBUG events:
/// ```bash
/// RUST_LOG=trellis_isam=debug cargo test slamlike
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the default subscriber with a custom fallback level.
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
