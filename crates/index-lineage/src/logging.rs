use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the process-wide subscriber once. `RUST_LOG` wins over the
/// configured filter. Returns whether this call installed it.
pub fn init(cfg: &LoggingConfig) -> bool {
    let mut installed_now = false;
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(cfg.filter.trim()))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let res = match cfg.format {
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .try_init(),
            LogFormat::Text => registry
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init(),
        };
        installed_now = res.is_ok();
        true
    });
    installed_now
}
