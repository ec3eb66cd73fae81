//! MCP search dispatcher (C2): routes `unified_search` calls to registered MCP
//! connections and normalizes their responses into [`DispatcherResult`].
//!
//! One dispatcher instance handles every MCP server; each server is reached through a
//! single async call function keyed by source name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{SearchCoreError, SearchCoreResult};
use crate::model::{AggregateGroup, DispatcherResult, FilterClause, RetrievalMethod, SearchMode, SearchResult, SortOrder};

/// Future returned by a registered MCP call function.
pub type McpCallFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// `(method_name, arguments) -> response` — the only shape the dispatcher depends on.
pub type McpCallFn = Arc<dyn Fn(&str, Value) -> McpCallFuture + Send + Sync>;

struct Connection {
    call_fn: McpCallFn,
    /// Capability-declared request_routing_args for this source, merged verbatim into
    /// the outgoing `unified_search` arguments (the generalized form of hardcoding a
    /// shared browser endpoint's history/bookmarks routing flags).
    request_routing_args: HashMap<String, Value>,
}

/// Routes `unified_search` calls to MCP servers and normalizes results.
#[derive(Default)]
pub struct McpDispatcher {
    connections: HashMap<String, Connection>,
}

impl McpDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an MCP connection that handles one or more sources. Later
    /// registrations for the same source name override earlier ones.
    pub fn register_mcp(
        &mut self,
        connection_key: &str,
        source_names: &[String],
        call_fn: McpCallFn,
        request_routing_args: Option<HashMap<String, Value>>,
    ) {
        let routing_args = request_routing_args.unwrap_or_default();
        for name in source_names {
            self.connections.insert(
                name.clone(),
                Connection {
                    call_fn: call_fn.clone(),
                    request_routing_args: routing_args.clone(),
                },
            );
        }
        tracing::info!(
            connection = connection_key,
            sources = ?source_names,
            "registered MCP connection"
        );
    }

    pub fn has_source(&self, source_name: &str) -> bool {
        self.connections.contains_key(source_name)
    }

    /// Calls `unified_search` on the connection bound to `source` and parses the
    /// response. Never returns `Err` for backend failures: those are folded into an
    /// empty [`DispatcherResult`] and the caller attaches the error string to
    /// `meta.errors` (per §7).
    #[allow(clippy::too_many_arguments)]
    pub async fn search(
        &self,
        source: &str,
        query: &str,
        methods: Option<&[RetrievalMethod]>,
        filters: Option<&[FilterClause]>,
        top_k: u32,
        mode: SearchMode,
        sort_field: Option<&str>,
        sort_order: Option<SortOrder>,
        group_by: Option<&str>,
        aggregate_top_n: Option<u32>,
        capability_routing_args: Option<&HashMap<String, Value>>,
    ) -> Result<DispatcherResult, SearchCoreError> {
        let Some(conn) = self.connections.get(source) else {
            tracing::warn!(source, "dispatcher: no MCP connection registered");
            return Err(SearchCoreError::Dispatch {
                source: source.to_string(),
                message: "no MCP connection for source".to_string(),
            });
        };

        let mut args = json!({
            "query": query,
            "top_k": top_k,
            "include_scores": true,
            "mode": mode_str(mode),
        });
        let obj = args.as_object_mut().expect("object literal");
        if let Some(methods) = methods {
            if !methods.is_empty() {
                obj.insert(
                    "methods".into(),
                    Value::Array(methods.iter().map(|m| Value::String(m.as_str().to_string())).collect()),
                );
            }
        }
        if let Some(filters) = filters {
            if !filters.is_empty() {
                obj.insert("filters".into(), serde_json::to_value(filters).unwrap_or(Value::Null));
            }
        }
        if let Some(field) = sort_field {
            obj.insert("sort_field".into(), Value::String(field.to_string()));
            obj.insert(
                "sort_order".into(),
                Value::String(match sort_order.unwrap_or(SortOrder::Desc) {
                    SortOrder::Asc => "asc".to_string(),
                    SortOrder::Desc => "desc".to_string(),
                }),
            );
        }
        if mode == SearchMode::Aggregate {
            if let Some(field) = group_by {
                obj.insert("group_by".into(), Value::String(field.to_string()));
            }
            if let Some(n) = aggregate_top_n {
                obj.insert("aggregate_top_n".into(), Value::Number(n.into()));
            }
        }
        for (key, value) in &conn.request_routing_args {
            obj.insert(key.clone(), value.clone());
        }
        // Capability-declared args are per-search-registration metadata (SPEC_FULL §4.2) and
        // take precedence over the connection's fixed transport-level flags on key collision.
        if let Some(capability_args) = capability_routing_args {
            for (key, value) in capability_args {
                obj.insert(key.clone(), value.clone());
            }
        }

        let t0 = std::time::Instant::now();
        let result = match (conn.call_fn)("unified_search", args).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(source, error = %e, "dispatcher: MCP call failed");
                return Err(SearchCoreError::Dispatch {
                    source: source.to_string(),
                    message: e.to_string(),
                });
            }
        };
        tracing::info!(source, elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0, "unified_search returned");

        parse_response(&result, source, mode)
    }

    /// Calls the well-known `search_capabilities` method and normalizes its response.
    pub async fn fetch_capabilities(&self, connection_key: &str, call_fn: &McpCallFn) -> Value {
        let result = match call_fn("search_capabilities", json!({})).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(connection_key, error = %e, "failed to fetch capabilities");
                return json!({});
            }
        };
        if result.get("success").and_then(Value::as_bool) == Some(false) {
            tracing::warn!(connection_key, error = ?result.get("error"), "search_capabilities failed");
            return json!({});
        }
        match result.get("output") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
            Some(Value::Object(_)) => result.get("output").cloned().unwrap_or(json!({})),
            _ => {
                if result.get("schema_version").is_some() || result.get("sources").is_some() {
                    result
                } else {
                    json!({})
                }
            }
        }
    }
}

fn mode_str(mode: SearchMode) -> &'static str {
    match mode {
        SearchMode::Search => "search",
        SearchMode::Count => "count",
        SearchMode::Aggregate => "aggregate",
    }
}

/// Parses an MCP `unified_search` response into a [`DispatcherResult`]. Per-item
/// parse errors are logged and skipped rather than failing the whole batch.
fn parse_response(result: &Value, source: &str, requested_mode: SearchMode) -> SearchCoreResult<DispatcherResult> {
    let success = result.get("success").and_then(Value::as_bool).unwrap_or(true);
    if !success && result.get("results").is_none() {
        let error = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        tracing::warn!(source, error, "dispatcher: search failed");
        return Err(SearchCoreError::Dispatch {
            source: source.to_string(),
            message: error,
        });
    }

    let data: &Value = match result.get("output") {
        Some(Value::String(s)) => {
            return match serde_json::from_str::<Value>(s) {
                Ok(parsed) => Ok(build_result(&parsed, source, requested_mode)),
                Err(_) => {
                    tracing::warn!(source, "dispatcher: invalid JSON output");
                    Err(SearchCoreError::Dispatch {
                        source: source.to_string(),
                        message: "invalid JSON output".to_string(),
                    })
                }
            };
        }
        Some(obj @ Value::Object(_)) => obj,
        _ => result,
    };
    Ok(build_result(data, source, requested_mode))
}

fn build_result(data: &Value, source: &str, requested_mode: SearchMode) -> DispatcherResult {
    let mut out = DispatcherResult {
        mode: Some(requested_mode),
        ..Default::default()
    };

    if let Some(count) = data.get("count").and_then(Value::as_u64) {
        out.count = Some(count);
    }

    if let Some(mode) = data.get("mode").and_then(Value::as_str) {
        out.mode = match mode {
            "count" => Some(SearchMode::Count),
            "aggregate" => Some(SearchMode::Aggregate),
            _ => Some(SearchMode::Search),
        };
    }

    if let Some(aggregates) = data.get("aggregates").and_then(Value::as_array) {
        for item in aggregates {
            match serde_json::from_value::<AggregateGroup>(item.clone()) {
                Ok(group) => out.aggregates.push(group),
                Err(e) => tracing::debug!(source, error = %e, "dispatcher: failed to parse aggregate"),
            }
        }
    }

    let Some(raw_results) = data.get("results").and_then(Value::as_array) else {
        return out;
    };
    for item in raw_results {
        if !item.is_object() {
            continue;
        }
        match parse_one_result(item, source) {
            Ok(result) => out.results.push(result),
            Err(e) => tracing::debug!(source, error = %e, "dispatcher: failed to parse result"),
        }
    }
    out
}

fn parse_one_result(item: &Value, source: &str) -> Result<SearchResult, serde_json::Error> {
    let mut with_defaults = item.clone();
    if let Some(obj) = with_defaults.as_object_mut() {
        obj.entry("source").or_insert_with(|| Value::String(source.to_string()));
        if let Some(id) = obj.get("id").cloned() {
            obj.insert("id".into(), Value::String(value_as_string(&id)));
        }
    }
    serde_json::from_value(with_defaults)
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_future(value: Value) -> McpCallFuture {
        Box::pin(async move { Ok(value) })
    }

    #[tokio::test]
    async fn search_merges_request_routing_args() {
        let seen_args: Arc<std::sync::Mutex<Option<Value>>> = Arc::new(std::sync::Mutex::new(None));
        let seen_args_cloned = seen_args.clone();
        let call_fn: McpCallFn = Arc::new(move |_method, args| {
            *seen_args_cloned.lock().unwrap() = Some(args);
            ok_future(json!({"success": true, "results": []}))
        });

        let mut dispatcher = McpDispatcher::new();
        let mut routing_args = HashMap::new();
        routing_args.insert("search_history".to_string(), Value::Bool(true));
        routing_args.insert("search_bookmarks".to_string(), Value::Bool(false));
        dispatcher.register_mcp(
            "browser",
            &["browser_history".to_string()],
            call_fn,
            Some(routing_args),
        );

        dispatcher
            .search(
                "browser_history",
                "visited rust docs",
                None,
                None,
                10,
                SearchMode::Search,
                None,
                None,
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let args = seen_args.lock().unwrap().clone().unwrap();
        assert_eq!(args.get("search_history"), Some(&Value::Bool(true)));
        assert_eq!(args.get("search_bookmarks"), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn capability_routing_args_are_forwarded_and_override_connection_args() {
        let seen_args: Arc<std::sync::Mutex<Option<Value>>> = Arc::new(std::sync::Mutex::new(None));
        let seen_args_cloned = seen_args.clone();
        let call_fn: McpCallFn = Arc::new(move |_method, args| {
            *seen_args_cloned.lock().unwrap() = Some(args);
            ok_future(json!({"success": true, "results": []}))
        });

        let mut dispatcher = McpDispatcher::new();
        let mut connection_args = HashMap::new();
        connection_args.insert("search_history".to_string(), Value::Bool(true));
        dispatcher.register_mcp("browser", &["browser_history".to_string()], call_fn, Some(connection_args));

        let mut capability_args = HashMap::new();
        capability_args.insert("search_history".to_string(), Value::Bool(false));
        capability_args.insert("locale".to_string(), Value::String("en-US".to_string()));

        dispatcher
            .search(
                "browser_history",
                "visited rust docs",
                None,
                None,
                10,
                SearchMode::Search,
                None,
                None,
                None,
                None,
                Some(&capability_args),
            )
            .await
            .unwrap();

        let args = seen_args.lock().unwrap().clone().unwrap();
        assert_eq!(args.get("search_history"), Some(&Value::Bool(false)));
        assert_eq!(args.get("locale"), Some(&Value::String("en-US".to_string())));
    }

    #[tokio::test]
    async fn has_source_is_accurate() {
        let call_fn: McpCallFn = Arc::new(|_, _| ok_future(json!({})));
        let mut dispatcher = McpDispatcher::new();
        dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);
        assert!(dispatcher.has_source("email"));
        assert!(!dispatcher.has_source("calendar"));
    }

    #[tokio::test]
    async fn unregistered_source_is_dispatch_error() {
        let dispatcher = McpDispatcher::new();
        let err = dispatcher
            .search("email", "q", None, None, 10, SearchMode::Search, None, None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchCoreError::Dispatch { .. }));
    }

    #[tokio::test]
    async fn call_exception_becomes_dispatch_error() {
        let call_fn: McpCallFn = Arc::new(|_, _| Box::pin(async { anyhow::bail!("boom") }));
        let mut dispatcher = McpDispatcher::new();
        dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);
        let err = dispatcher
            .search("email", "q", None, None, 10, SearchMode::Search, None, None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchCoreError::Dispatch { .. }));
    }

    #[tokio::test]
    async fn success_false_becomes_dispatch_error() {
        let call_fn: McpCallFn = Arc::new(|_, _| ok_future(json!({"success": false, "error": "down"})));
        let mut dispatcher = McpDispatcher::new();
        dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);
        let err = dispatcher
            .search("email", "q", None, None, 10, SearchMode::Search, None, None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchCoreError::Dispatch { .. }));
    }

    #[tokio::test]
    async fn per_item_parse_errors_are_skipped_not_fatal() {
        let call_fn: McpCallFn = Arc::new(|_, _| {
            ok_future(json!({
                "success": true,
                "results": [
                    {"id": "1", "title": "ok"},
                    "not an object",
                    {"id": "2", "title": "also ok"},
                ]
            }))
        });
        let mut dispatcher = McpDispatcher::new();
        dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);
        let result = dispatcher
            .search("email", "q", None, None, 10, SearchMode::Search, None, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn output_wrapped_in_json_string_is_unwrapped() {
        let output = json!({"results": [{"id": "1", "title": "t"}]}).to_string();
        let call_fn: McpCallFn = Arc::new(move |_, _| {
            let output = output.clone();
            ok_future(json!({"success": true, "output": output}))
        });
        let mut dispatcher = McpDispatcher::new();
        dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);
        let result = dispatcher
            .search("email", "q", None, None, 10, SearchMode::Search, None, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(result.results.len(), 1);
    }
}
