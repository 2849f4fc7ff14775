use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Longest request target copied into a span field.
const MAX_SPAN_TARGET: usize = 256;

/// Initialize tracing from the `[logging]` section. `RUST_LOG` takes
/// precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .wrap_err_with(|| format!("Invalid log level: {}", config.level))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if config.json {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(config.include_spans)
                    .with_span_list(config.include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        json = config.json,
        spans = config.include_spans,
        "Gatehouse logging initialized"
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, target: &str) -> tracing::Span {
    let path = target.split('?').next().unwrap_or(target);
    let path = match path.char_indices().nth(MAX_SPAN_TARGET) {
        Some((end, _)) => &path[..end],
        None => path,
    };
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
