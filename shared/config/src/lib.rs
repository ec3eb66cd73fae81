//! Environment-driven configuration for the unisearch service shell.
//!
//! The orchestrator library (`unisearch-core`) takes its settings as plain
//! function arguments (a timezone string, a results cap) and has no dependency on
//! this crate; `AppConfig` is what the service binary builds once at startup and
//! threads down into the orchestrator and the HTTP layer.

mod feature_toggles;

pub use feature_toggles::FeatureToggles;

use reqwest::Client;

/// Process-wide configuration for the demo service shell.
#[derive(Clone)]
pub struct AppConfig {
    pub http_client: Client,
    pub bind_host: String,
    pub bind_port: u16,
    /// Default timezone used when a request doesn't specify one.
    pub user_timezone: String,
    /// "json" or "pretty", passed straight to `search_observability::TracingConfig`.
    pub log_format: String,
    /// Overrides the orchestrator's per-search refinement round cap when set.
    pub max_refinement_rounds: Option<u32>,
    pub feature_toggles: FeatureToggles,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            http_client: Client::new(),
            bind_host: std::env::var("UNISEARCH_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            bind_port: std::env::var("UNISEARCH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8087),
            user_timezone: std::env::var("UNISEARCH_TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            max_refinement_rounds: std::env::var("UNISEARCH_MAX_REFINEMENT_ROUNDS").ok().and_then(|v| v.parse().ok()),
            feature_toggles: FeatureToggles::from_env_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("UNISEARCH_HOST");
        std::env::remove_var("UNISEARCH_PORT");
        std::env::remove_var("UNISEARCH_TIMEZONE");
        let config = AppConfig::from_env();
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.bind_port, 8087);
        assert_eq!(config.user_timezone, "UTC");
    }
}
