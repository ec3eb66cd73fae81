//! Tracing initialization for the unisearch service.

use std::env;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for tracing initialization.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub environment: String,
    /// "json" or "pretty"
    pub format: String,
    pub level: String,
    pub log_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "unisearch".to_string(),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_spans: env::var("LOG_SPANS").map(|v| v == "true").unwrap_or(false),
        }
    }
}

impl TracingConfig {
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn json(mut self) -> Self {
        self.format = "json".to_string();
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = "pretty".to_string();
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Installs a global `tracing` subscriber: JSON layer in prod, pretty layer in dev.
pub fn init_tracing(config: TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if config.log_spans { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    if config.format == "json" {
        let layer = fmt::layer().json().with_span_events(span_events).with_current_span(true).with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    } else {
        let layer = fmt::layer().pretty().with_span_events(span_events).with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    }

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        format = %config.format,
        "tracing initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_applies_overrides() {
        let config = TracingConfig::for_service("test").with_level("debug").json().with_spans();
        assert_eq!(config.service_name, "test");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, "json");
        assert!(config.log_spans);
    }
}
