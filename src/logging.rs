#![forbid(unsafe_code)]

use anyhow::Result;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "info,commentvault_tools=debug";

/// Installs the global subscriber. `RUST_LOG` picks the filter, and
/// `LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if wants_json(std::env::var("LOG_FORMAT").ok().as_deref()) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }
    Ok(())
}

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|value| matches!(value.trim().to_lowercase().as_str(), "json" | "structured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_opt_in() {
        assert!(wants_json(Some("json")));
        assert!(wants_json(Some(" JSON ")));
        assert!(wants_json(Some("structured")));
        assert!(!wants_json(Some("pretty")));
        assert!(!wants_json(None));
    }
}
