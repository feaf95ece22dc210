//! Logger (C1): a thin `tracing_subscriber` initializer offering both
//! human-readable and JSON structured output, matching the grounding
//! crate's CLI split between `cli/output/human.rs` and `cli/output/json.rs`
//! for the proxy's own logs rather than its human-facing CLI output.

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the proxy's own structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Initializes the global `tracing` subscriber. `level` is an `EnvFilter`
/// directive (e.g. `"info"`, `"armour=debug,tower_http=warn"`); the
/// `ARMOUR_LOG`/`RUST_LOG` environment variables override it if set.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_env("ARMOUR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    let result = match format {
        LogFormat::Human => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_human() {
        assert_eq!(LogFormat::default(), LogFormat::Human);
    }
}
