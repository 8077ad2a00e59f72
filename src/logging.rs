//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "jobstr=info";

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()));
    let registry = tracing_subscriber::registry().with(env_filter);
    // A subscriber may already be installed (tests); keep the first one.
    let _ = if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}
