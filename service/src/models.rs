use std::sync::Arc;

use serde::{Deserialize, Serialize};
use unisearch_core::Orchestrator;

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

/// Inbound `/search` payload. Exactly one of `conversation_context`/`user_message`
/// should carry the query (§6); the orchestrator validates this itself.
#[derive(Debug, Deserialize)]
pub struct SearchApiRequest {
    pub conversation_context: Option<String>,
    pub user_message: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_true")]
    pub do_refinement: bool,
}

fn default_max_results() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}
