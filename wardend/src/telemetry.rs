use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Installs a JSON-formatted stdout layer; `verbose` lifts the default
/// level from info to debug. `RUST_LOG` wins when set.
pub fn init_telemetry(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let json_layer = tracing_subscriber::fmt::layer().json().flatten_event(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .init();
}
