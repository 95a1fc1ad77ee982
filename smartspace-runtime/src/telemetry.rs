//! Tracing subscriber setup.

use once_cell::sync::OnceCell;
use smartspace_core::TelemetryConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.default_filter`. Returns whether
/// this process now has a subscriber installed by this function; calling it
/// again, or after another subscriber was installed, changes nothing.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

        let registry = tracing_subscriber::registry().with(env_filter);
        let installed = if config.json {
            registry.with(fmt::layer().json()).try_init()
        } else {
            registry.with(fmt::layer()).try_init()
        };
        installed.is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinit_is_noop() {
        let config = TelemetryConfig::default();
        let first = init_tracing(&config);
        let second = init_tracing(&TelemetryConfig {
            json: true,
            ..config
        });
        assert_eq!(first, second);
    }
}
