use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use sstemplate::expr::Expr;
use sstemplate::parser::expression::parse_cache_arguments;

pub const DEFAULT_TTL_SECS: u64 = 600;
pub const DEFAULT_GLOBAL_KEY: &str = "$CurrentReadingMode, $CurrentUser.ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid global_key '{value}': {message}")]
    InvalidGlobalKey { value: String, message: String },
}

/// What a render pass does when the cache store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// A failed read is a miss and a failed write is a warning; the page
    /// still renders, just without caching.
    #[default]
    Degrade,
    /// Any store failure fails the render.
    Fail,
}

/// Partial caching settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// When false every cached region is rendered directly.
    pub enabled: bool,
    /// Lifetime of stored region output, in seconds.
    pub default_ttl_secs: u64,
    /// Comma-separated expressions mixed into every key, evaluated per render.
    pub global_key: String,
    pub store_failure: StoreFailurePolicy,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            enabled: true,
            default_ttl_secs: DEFAULT_TTL_SECS,
            global_key: DEFAULT_GLOBAL_KEY.to_string(),
            store_failure: StoreFailurePolicy::default(),
        }
    }
}

impl RenderConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Parse `global_key` into its expression list.
    pub fn global_key_exprs(&self) -> Result<Vec<Expr>, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidGlobalKey {
            value: self.global_key.clone(),
            message,
        };
        let arguments = parse_cache_arguments(&self.global_key, 0, 0).map_err(|e| invalid(e.message))?;
        if arguments.condition.is_some() {
            return Err(invalid("conditions are not allowed in the global key".into()));
        }
        Ok(arguments.key_exprs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RenderConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ttl(), Duration::from_secs(600));
        assert_eq!(config.store_failure, StoreFailurePolicy::Degrade);
        let exprs = config.global_key_exprs().unwrap();
        assert_eq!(exprs.len(), 2);
        assert_eq!(exprs[1].to_string(), "$CurrentUser.ID");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RenderConfig = toml::from_str("default_ttl_secs = 30\nstore_failure = \"fail\"").unwrap();
        assert_eq!(config.default_ttl_secs, 30);
        assert_eq!(config.store_failure, StoreFailurePolicy::Fail);
        assert_eq!(config.global_key, DEFAULT_GLOBAL_KEY);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<RenderConfig>("ttl = 5").is_err());
    }

    #[test]
    fn global_key_rejects_condition() {
        let config = RenderConfig {
            global_key: "$Locale if $A".into(),
            ..RenderConfig::default()
        };
        assert!(matches!(config.global_key_exprs(), Err(ConfigError::InvalidGlobalKey { .. })));
    }
}
