//! Development-time tracing for debugging loops.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the transcript.
//!
//! - **Transcript**: agent replies, progress lines, loop banners and batch
//!   status lines. Delivered through event callbacks and printed to stdout by
//!   the CLI, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// Reads `RUST_LOG`, falling back to `warn`. Targets follow the module paths,
/// so one driver can be traced without the rest:
///
/// ```bash
/// # Per-item progress from the batch workers plus codex exec start lines,
/// # the rest of the crate stays at warn.
/// RUST_LOG=codexloop::batch=debug,codexloop::io::agent=info,codexloop=warn \
///     codexloop foreach modules.txt port.toml -n 4
///
/// # Metrics extraction and iteration ends during a science run.
/// RUST_LOG=codexloop::metrics=debug,codexloop::repeat=info codexloop science "speed up the lexer"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
