//! Telemetry initialization.
//!
//! Controlled by `RUST_LOG` (via `tracing-subscriber`'s `EnvFilter`):
//! unset defaults to `info`. Logs go to stderr so stdout stays free for
//! command output (`status`, `export`, etc).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Opaque guard returned by [`init`]. Held in `main()` for the lifetime of
/// the process; dropping it has no effect beyond scope, but keeping the
/// guard type means a future exporter can be added here without changing
/// every caller.
pub struct TelemetryGuard(());

/// Initialize the global `tracing` subscriber.
///
/// Reads `RUST_LOG` for filter directives (e.g. `RUST_LOG=drover=debug`),
/// falling back to `info` when unset or unparseable. `verbose` (the CLI's
/// `--verbose` flag) forces the `debug` level regardless of `RUST_LOG`.
pub fn init(verbose: bool) -> TelemetryGuard {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    TelemetryGuard(())
}
