use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the stderr subscriber. `RUST_LOG` overrides the default filter.
///
/// `verbose` raises the crate's own level to `debug`. Calling this twice
/// is harmless; the second call is ignored.
pub fn init(verbose: bool) {
    let default = if verbose {
        "warn,docchat=debug"
    } else {
        "warn,docchat=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
