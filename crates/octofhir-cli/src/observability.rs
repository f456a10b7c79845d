// Tracing initialization for the CLI. Logs go to stderr so command output stays clean.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug logging for
/// the CLI and the SMART client, and the default is `warn`.
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        "warn,octofhir=debug,octofhir_smart_client=debug"
    } else {
        "warn"
    };

    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbose))
        .try_init();
}
