//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::core::{Error, Result};
use std::str::FromStr;
use tracing::Level;

/// Install a global fmt subscriber according to `config`.
///
/// Returns an error if the level is unknown. A subscriber that is already
/// installed is left in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let level = Level::from_str(&config.level)
        .map_err(|_| Error::Config(format!("unknown log level: {}", config.level)))?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(config.with_target);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
