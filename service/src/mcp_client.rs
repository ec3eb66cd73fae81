//! Builds the HTTP-backed `McpCallFn` the core dispatcher uses to reach a sibling MCP
//! retrieval service, and the env-var wiring that turns configured source URLs into
//! registered connections + discovered capabilities.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use unisearch_core::dispatcher::{McpCallFn, McpCallFuture, McpDispatcher};
use unisearch_core::CapabilityRegistry;

/// One personal-data source an MCP connection can be wired up for, and the env var
/// that points at its retrieval service.
const MCP_SOURCES: &[(&str, &str)] = &[
    ("email", "UNISEARCH_EMAIL_MCP_URL"),
    ("chat", "UNISEARCH_CHAT_MCP_URL"),
    ("calendar", "UNISEARCH_CALENDAR_MCP_URL"),
    ("tasks", "UNISEARCH_TASKS_MCP_URL"),
    ("browser_history", "UNISEARCH_BROWSER_MCP_URL"),
];

/// Builds a call function that POSTs `{method, arguments}` to `{base_url}/mcp` and
/// returns the decoded JSON body, the only shape the dispatcher depends on (§6).
fn build_call_fn(client: reqwest::Client, base_url: String) -> McpCallFn {
    Arc::new(move |method: &str, arguments: Value| -> McpCallFuture {
        let client = client.clone();
        let url = format!("{}/mcp", base_url.trim_end_matches('/'));
        let method = method.to_string();
        Box::pin(async move {
            let response = client
                .post(&url)
                .json(&json!({ "method": method, "arguments": arguments }))
                .send()
                .await?
                .error_for_status()?;
            let body: Value = response.json().await?;
            Ok(body)
        })
    })
}

/// Registers every configured MCP source with the dispatcher and discovers its
/// capability via `search_capabilities`, normalizing the single-source/multi-source
/// payload shapes real backends disagree on (§10).
pub async fn wire_configured_sources(dispatcher: &mut McpDispatcher, capabilities: &mut CapabilityRegistry, client: &reqwest::Client) {
    for (source_name, env_var) in MCP_SOURCES.iter().copied() {
        let Ok(base_url) = std::env::var(env_var) else { continue };
        if base_url.trim().is_empty() {
            continue;
        }

        let call_fn = build_call_fn(client.clone(), base_url.clone());
        let capability_payload = dispatcher.fetch_capabilities(source_name, &call_fn).await;
        dispatcher.register_mcp(source_name, &[source_name.to_string()], call_fn, request_routing_args_for(source_name));

        if capability_payload == json!({}) {
            tracing::warn!(source = source_name, url = %base_url, "no capability payload discovered; source will not be routed to");
            continue;
        }
        if let Err(e) = capabilities.register_from_payload(capability_payload) {
            tracing::error!(source = source_name, error = %e, "failed to register discovered capability");
        }
    }
}

/// Browser history and bookmarks share one MCP connection upstream; this is the
/// generalized form of that source's routing flags (§4.2).
fn request_routing_args_for(source_name: &str) -> Option<HashMap<String, Value>> {
    if source_name == "browser_history" {
        let mut args = HashMap::new();
        args.insert("search_history".to_string(), Value::Bool(true));
        args.insert("search_bookmarks".to_string(), Value::Bool(true));
        Some(args)
    } else {
        None
    }
}
