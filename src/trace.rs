use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the tracing subscriber once. Respects `RUST_LOG`; defaults to
/// `info`. The `log_format` parameter selects human-readable text or
/// structured JSON output.
pub fn init(log_format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        match log_format {
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_level(true)
                .compact()
                .init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_level(true)
                .json()
                .init(),
        }
    });
}
