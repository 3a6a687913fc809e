//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::AgentConfig;

/// Install a `fmt` subscriber according to `config`.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` for debug
/// configurations and `info` elsewhere. Does nothing when logging is
/// disabled or a global subscriber is already installed.
pub fn init(config: &AgentConfig) {
    if !config.features.enable_logging {
        return;
    }

    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    if tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
