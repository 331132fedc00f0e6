//! Logs and metrics bootstrap.
//!
//! Logs go to stdout through `tracing-subscriber`, filtered by `RUST_LOG` when set.
//! Debug logging for our own crates can be switched on after the config has been
//! read, which is why the filter sits behind a reload handle.

use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Layer, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "warn,gateway=info,pixelforge_internal=info";
const DEBUG_LOG_FILTER: &str = "warn,gateway=debug,pixelforge_internal=debug,tower_http=debug";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `ValueEnum` gives us the same lowercase names clap accepts
        match self.to_possible_value() {
            Some(value) => write!(f, "{}", value.get_name()),
            None => Ok(()),
        }
    }
}

/// Handle for raising the log level once the config file is loaded
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl DelayedDebugLogs {
    /// No-op when `RUST_LOG` is set: an explicit filter always wins
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.from_env {
            tracing::info!("`gateway.debug` is set, but `RUST_LOG` takes precedence");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })?;
        tracing::debug!("Debug logs enabled");
        Ok(())
    }
}

fn build_filter() -> (EnvFilter, bool) {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            (EnvFilter::new(directives), true)
        }
        _ => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    }
}

pub fn setup_logs(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let (filter, from_env) = build_filter();
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    Ok(DelayedDebugLogs { handle, from_env })
}

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "generation_requests_total",
        "Image generation requests by model and outcome"
    );
    metrics::describe_counter!(
        "points_deducted_total",
        "Points deducted from user balances"
    );
    metrics::describe_counter!(
        "points_credited_total",
        "Points credited to user balances"
    );
    metrics::describe_counter!(
        "free_generations_consumed_total",
        "Free quota units consumed by settled generations"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
        assert_eq!(LogFormat::Json.to_string(), "json");
        assert_eq!(
            LogFormat::from_str("pretty", true).unwrap(),
            LogFormat::Pretty
        );
        assert!(LogFormat::from_str("logfmt", true).is_err());
    }
}
