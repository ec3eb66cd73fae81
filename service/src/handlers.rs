use axum::extract::State;
use axum::Json;

use unisearch_core::orchestrator::SearchRequest;

use crate::models::{HealthResponse, SearchApiRequest, SharedState};

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "unisearch-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn search(State(state): State<SharedState>, Json(request): Json<SearchApiRequest>) -> Json<unisearch_core::model::Response> {
    let response = state
        .orchestrator
        .search(SearchRequest {
            conversation_context: request.conversation_context,
            user_message: request.user_message,
            max_results: request.max_results,
            do_refinement: request.do_refinement,
        })
        .await;
    Json(response)
}
