use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ServerConfig;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `log_filter`. Returns `false` when a subscriber was
/// already installed, by an earlier call or by the host; that one stays.
pub fn init_tracing(config: &ServerConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
    {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "keeping the installed subscriber");
            false
        }
    }
}
