//! Direct backends (C3): in-process search adapters exposing the same shape as an MCP
//! source, without going through the dispatcher's call-function indirection.
//!
//! Direct backends never support `count`/`aggregate` modes; the orchestrator coerces
//! their mode to `search` at dispatch time (§4.3).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SearchCoreError;
use crate::model::{FilterClause, FilterSpec, RetrievalMethod, SearchResult, SourceClass};

/// Shape every in-process search adapter implements.
#[async_trait]
pub trait DirectBackend: Send + Sync {
    async fn search(
        &self,
        query: &str,
        methods: Option<&[RetrievalMethod]>,
        filters: Option<&[FilterClause]>,
        top_k: u32,
    ) -> Result<Vec<SearchResult>, SearchCoreError>;

    fn source_name(&self) -> &str;
    fn source_class(&self) -> SourceClass;
    fn supported_methods(&self) -> Vec<RetrievalMethod>;
    fn supported_filters(&self) -> Vec<FilterSpec> {
        Vec::new()
    }
}

/// Reference direct backend: a SearXNG-compatible metasearch endpoint. Demonstrates
/// the `reqwest`-based client shape direct adapters typically use to reach an external
/// service without going through the MCP dispatcher.
pub struct WebSearchBackend {
    base_url: String,
    client: reqwest::Client,
}

impl WebSearchBackend {
    /// `base_url` should point at a SearXNG instance; `/search` is appended if absent.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.is_empty() && !base_url.ends_with("/search") {
            base_url.push_str("/search");
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[async_trait]
impl DirectBackend for WebSearchBackend {
    async fn search(
        &self,
        query: &str,
        _methods: Option<&[RetrievalMethod]>,
        _filters: Option<&[FilterClause]>,
        top_k: u32,
    ) -> Result<Vec<SearchResult>, SearchCoreError> {
        if self.base_url.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("language", "en-US")])
            .send()
            .await
            .map_err(|e| SearchCoreError::Dispatch {
                source: self.source_name().to_string(),
                message: format!("web search request failed: {e}"),
            })?;

        let data: SearxResponse = response.json().await.map_err(|e| SearchCoreError::Dispatch {
            source: self.source_name().to_string(),
            message: format!("web search response decode failed: {e}"),
        })?;

        let mut results = Vec::new();
        for (i, item) in data.results.iter().take(top_k as usize).enumerate() {
            let url = item.url.clone().unwrap_or_else(|| "#".to_string());
            let score = (1.0_f32 - (i as f32) * 0.05).max(0.3);
            let mut scores = HashMap::new();
            scores.insert("fulltext".to_string(), score);
            let mut metadata = HashMap::new();
            metadata.insert("url".to_string(), serde_json::Value::String(url.clone()));
            let host = url.split('/').nth(2).unwrap_or(&url).to_string();

            results.push(SearchResult {
                id: format!("web_{i}"),
                source: self.source_name().to_string(),
                source_class: SourceClass::Web,
                title: item.title.clone().unwrap_or_else(|| "No Title".to_string()),
                snippet: item.content.clone().or_else(|| item.snippet.clone()).unwrap_or_default(),
                timestamp: None,
                scores,
                methods_used: vec!["fulltext".to_string()],
                metadata,
                provenance: Some(format!("web result from {host}")),
            });
        }
        Ok(results)
    }

    fn source_name(&self) -> &str {
        "web"
    }

    fn source_class(&self) -> SourceClass {
        SourceClass::Web
    }

    fn supported_methods(&self) -> Vec<RetrievalMethod> {
        vec![RetrievalMethod::Fulltext]
    }
}
