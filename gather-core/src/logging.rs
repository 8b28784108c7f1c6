use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize tracing output for the server.
///
/// `RUST_LOG` wins when set; otherwise the configured level (which may be a
/// full filter directive such as `gather_core=debug,info`) applies.
/// `logging.format = "json"` selects structured output, anything else the
/// human-readable form.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }

    Ok(())
}

fn parse_filter(level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| anyhow::anyhow!("invalid log filter {level:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("gather_core=debug,info").is_ok());
        assert!(parse_filter("gather_core=notalevel").is_err());
    }
}
