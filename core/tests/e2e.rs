//! End-to-end coverage of the full `Orchestrator::search` pipeline: capability
//! registration, deterministic routing, MCP dispatch, multi-hop chaining, the
//! refinement loop, and fusion — exercised through the public API only, the way a
//! caller embedding this crate would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use unisearch_core::dispatcher::McpCallFn;
use unisearch_core::model::{
    Capability, EntityExtractionRule, EntityParser, FilterSpec, FilterOperator, RetrievalMethod, RoutingComplexity,
    SearchMode, SourceClass, Tier,
};
use unisearch_core::{CapabilityRegistry, McpDispatcher, Orchestrator, SearchRequest};

fn capability(name: &str, methods: &[RetrievalMethod], modes: &[SearchMode]) -> Capability {
    Capability {
        source_name: name.to_string(),
        source_class: SourceClass::Personal,
        supported_methods: methods.to_vec(),
        supported_filters: Vec::new(),
        supported_modes: modes.to_vec(),
        supported_group_by_fields: Vec::new(),
        max_limit: 50,
        default_limit: 10,
        sort_fields: Vec::new(),
        default_ranking: "vector".into(),
        display_label: None,
        alias_hints: vec![name.to_string()],
        freshness_window_days: None,
        latency_tier: Tier::Low,
        quality_tier: Tier::Medium,
        cost_tier: Tier::Low,
        request_routing_args: None,
        entity_extraction_rules: None,
    }
}

fn with_filters(mut cap: Capability, fields: &[&str]) -> Capability {
    cap.supported_filters = fields
        .iter()
        .map(|f| FilterSpec {
            name: f.to_string(),
            value_type: "string".into(),
            operators: vec![FilterOperator::Contains, FilterOperator::Gte, FilterOperator::Lte],
            description: String::new(),
        })
        .collect();
    cap
}

fn with_aliases(mut cap: Capability, aliases: &[&str]) -> Capability {
    cap.alias_hints = aliases.iter().map(|a| a.to_string()).collect();
    cap
}

fn with_group_by(mut cap: Capability, fields: &[&str]) -> Capability {
    cap.supported_group_by_fields = fields.iter().map(|f| f.to_string()).collect();
    cap
}

fn with_entity_rules(mut cap: Capability, rules: Vec<EntityExtractionRule>) -> Capability {
    cap.entity_extraction_rules = Some(rules);
    cap
}

fn with_class(mut cap: Capability, class: SourceClass) -> Capability {
    cap.source_class = class;
    cap
}

fn mock_call_fn(response: Value) -> McpCallFn {
    Arc::new(move |_method: &str, _args: Value| {
        let response = response.clone();
        Box::pin(async move { Ok(response) })
    })
}

#[tokio::test]
async fn email_today_routes_to_email_with_no_fallback() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_aliases(
            with_filters(
                capability("email", &[RetrievalMethod::Structured, RetrievalMethod::Vector], &[SearchMode::Search]),
                &["from_name", "from_email", "date_after", "date_before"],
            ),
            &["email", "emails", "inbox", "mail"],
        ))
        .unwrap();

    let mut dispatcher = McpDispatcher::new();
    dispatcher.register_mcp(
        "email",
        &["email".to_string()],
        mock_call_fn(json!({
            "success": true,
            "results": [{"id": "1", "title": "Trip plans", "scores": {"structured": 0.9}}],
        })),
        None,
    );

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC");
    let response = orchestrator
        .search(SearchRequest { user_message: Some("Emails from Alice today".to_string()), do_refinement: false, ..Default::default() })
        .await;

    assert!(response.errors.is_empty());
    assert_eq!(response.meta.sources_queried, vec!["email".to_string()]);
    assert_eq!(response.meta.complexity, RoutingComplexity::Simple);
    assert_eq!(response.results.len(), 1);
}

#[tokio::test]
async fn pure_count_query_skips_refinement_and_reports_count() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_aliases(
            capability("email", &[RetrievalMethod::Structured], &[SearchMode::Search, SearchMode::Count]),
            &["email", "emails"],
        ))
        .unwrap();

    let mut dispatcher = McpDispatcher::new();
    dispatcher.register_mcp(
        "email",
        &["email".to_string()],
        mock_call_fn(json!({"success": true, "mode": "count", "count": 42})),
        None,
    );

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC");
    let response = orchestrator
        .search(SearchRequest { user_message: Some("how many emails did I get today".to_string()), ..Default::default() })
        .await;

    assert_eq!(response.meta.count, Some(42));
    assert_eq!(response.meta.count_source.as_deref(), Some("email"));
    assert!(response.meta.refinement_trace.is_empty());
}

#[tokio::test]
async fn aggregate_query_resolves_group_by_from_capability() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_group_by(
            with_aliases(
                capability("email", &[RetrievalMethod::Structured], &[SearchMode::Search, SearchMode::Aggregate]),
                &["email", "emails"],
            ),
            &["from_email"],
        ))
        .unwrap();

    let mut dispatcher = McpDispatcher::new();
    dispatcher.register_mcp(
        "email",
        &["email".to_string()],
        mock_call_fn(json!({
            "success": true,
            "mode": "aggregate",
            "aggregates": [
                {"group_value": "alice@example.com", "count": 5},
                {"group_value": "bob@example.com", "count": 2},
            ],
        })),
        None,
    );

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC");
    let response = orchestrator
        .search(SearchRequest { user_message: Some("breakdown of emails by sender".to_string()), ..Default::default() })
        .await;

    let aggregates = response.meta.aggregates.expect("aggregates should be present");
    assert_eq!(aggregates.len(), 2);
    assert_eq!(response.meta.aggregates_source.as_deref(), Some("email"));
    assert!(response.meta.refinement_trace.is_empty());
}

#[tokio::test]
async fn multi_hop_plan_chains_entity_from_previous_step() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_entity_rules(
            with_filters(
                capability("email", &[RetrievalMethod::Structured, RetrievalMethod::Vector], &[SearchMode::Search]),
                &["from_name", "from_email"],
            ),
            vec![EntityExtractionRule {
                target_field: "from_name".to_string(),
                metadata_key: "from_name".to_string(),
                parser: EntityParser::String,
            }],
        ))
        .unwrap();
    capabilities
        .register(with_filters(
            capability("calendar", &[RetrievalMethod::Structured, RetrievalMethod::Vector], &[SearchMode::Search]),
            &["from_name", "from_email"],
        ))
        .unwrap();

    let mut dispatcher = McpDispatcher::new();
    dispatcher.register_mcp(
        "email",
        &["email".to_string()],
        mock_call_fn(json!({
            "success": true,
            "results": [{
                "id": "e1",
                "title": "Trip email",
                "scores": {"vector": 0.8},
                "metadata": {"from_email": "alice@example.com", "from_name": "Alice"},
            }],
        })),
        None,
    );

    let calendar_args: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let calendar_args_clone = calendar_args.clone();
    let calendar_call_fn: McpCallFn = Arc::new(move |_method, args| {
        *calendar_args_clone.lock().unwrap() = Some(args);
        Box::pin(async move {
            Ok(json!({
                "success": true,
                "results": [{"id": "c1", "title": "Trip planning meeting", "scores": {"vector": 0.75}}],
            }))
        })
    });
    dispatcher.register_mcp("calendar", &["calendar".to_string()], calendar_call_fn, None);

    let lm_callback: unisearch_core::orchestrator::LmCallFn = Arc::new(|_prompt, _max_tokens| {
        Box::pin(async move {
            Ok(json!({
                "retrieval_plan": [
                    {"sources": ["email"]},
                    {"sources": ["calendar"], "entity_from_previous": true},
                ],
            })
            .to_string())
        })
    });

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC").with_lm_callback(lm_callback);
    let response = orchestrator
        .search(SearchRequest {
            user_message: Some("can you look into that for me".to_string()),
            do_refinement: false,
            ..Default::default()
        })
        .await;

    assert_eq!(response.meta.complexity, RoutingComplexity::Complex);
    assert_eq!(response.meta.sources_queried, vec!["calendar".to_string(), "email".to_string()]);
    assert_eq!(response.results.len(), 2);

    let args = calendar_args.lock().unwrap().clone().expect("calendar should have been called");
    let filters = args.get("filters").expect("carried entity filter should be forwarded").as_array().expect("filters array");
    assert!(filters.iter().any(|f| f.get("field").and_then(Value::as_str) == Some("from_name")
        && f.get("value").and_then(Value::as_str) == Some("Alice")));
}

#[tokio::test]
async fn no_results_triggers_broaden_retry_refinement() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_aliases(
            capability("email", &[RetrievalMethod::Structured, RetrievalMethod::Vector], &[SearchMode::Search]),
            &["email", "emails"],
        ))
        .unwrap();

    let calls = Arc::new(Mutex::new(0_u32));
    let calls_clone = calls.clone();
    let call_fn: McpCallFn = Arc::new(move |_method, _args| {
        *calls_clone.lock().unwrap() += 1;
        Box::pin(async move { Ok(json!({"success": true, "results": []})) })
    });

    let mut dispatcher = McpDispatcher::new();
    dispatcher.register_mcp("email", &["email".to_string()], call_fn, None);

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC");
    let response = orchestrator
        .search(SearchRequest { user_message: Some("emails about the rocket launch".to_string()), ..Default::default() })
        .await;

    assert!(response.results.is_empty());
    assert!(!response.meta.refinement_trace.is_empty());
    let first = &response.meta.refinement_trace[0];
    assert_eq!(first.reason.as_str(), "no_results");
    assert_eq!(first.action, "broaden_retry_all");
    assert!(*calls.lock().unwrap() >= 2);
}

#[tokio::test]
async fn broad_fallback_caps_fanout_at_three_sources() {
    let names = ["browser_history", "calendar", "chat", "contacts", "documents", "email", "notes", "tasks"];
    let mut capabilities = CapabilityRegistry::new();
    let mut dispatcher = McpDispatcher::new();
    for name in names {
        capabilities.register(capability(name, &[RetrievalMethod::Structured], &[SearchMode::Search])).unwrap();
        dispatcher.register_mcp(
            name,
            &[name.to_string()],
            mock_call_fn(json!({"success": true, "results": [{"id": "1", "title": "t", "scores": {"structured": 0.8}}]})),
            None,
        );
    }

    let orchestrator = Orchestrator::new(capabilities, dispatcher, "UTC");
    let response = orchestrator
        .search(SearchRequest { user_message: Some("xyzzy quux zorp".to_string()), do_refinement: false, ..Default::default() })
        .await;

    assert!(response.meta.sources_queried.len() <= 3);
    assert!(response.notes.iter().any(|n| n.contains("capped broad search")));
    assert_eq!(response.meta.routing_policy.unwrap().fanout_limit, 3);
}

#[tokio::test]
async fn empty_query_short_circuits_before_any_dispatch() {
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register(capability("email", &[RetrievalMethod::Structured], &[SearchMode::Search])).unwrap();
    let orchestrator = Orchestrator::new(capabilities, McpDispatcher::new(), "UTC");
    let response = orchestrator.search(SearchRequest::default()).await;
    assert_eq!(response.errors.len(), 1);
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn direct_backend_results_are_fused_alongside_mcp_results() {
    struct StubBackend;

    #[async_trait::async_trait]
    impl unisearch_core::backends::DirectBackend for StubBackend {
        fn source_name(&self) -> &str {
            "web"
        }

        fn source_class(&self) -> SourceClass {
            SourceClass::Web
        }

        fn supported_methods(&self) -> Vec<RetrievalMethod> {
            vec![RetrievalMethod::Fulltext]
        }

        async fn search(
            &self,
            _query: &str,
            _methods: Option<&[RetrievalMethod]>,
            _filters: Option<&[unisearch_core::model::FilterClause]>,
            _top_k: u32,
        ) -> Result<Vec<unisearch_core::model::SearchResult>, unisearch_core::SearchCoreError> {
            Ok(vec![unisearch_core::model::SearchResult {
                id: "w1".to_string(),
                source: "web".to_string(),
                source_class: SourceClass::Web,
                title: "Rust release notes".to_string(),
                snippet: String::new(),
                timestamp: None,
                scores: HashMap::from([("fulltext".to_string(), 0.6)]),
                methods_used: vec!["fulltext".to_string()],
                metadata: HashMap::new(),
                provenance: None,
            }])
        }
    }

    let mut capabilities = CapabilityRegistry::new();
    capabilities
        .register(with_class(
            with_aliases(capability("web", &[RetrievalMethod::Fulltext], &[SearchMode::Search]), &["web", "internet"]),
            SourceClass::Web,
        ))
        .unwrap();
    let orchestrator = Orchestrator::new(capabilities, McpDispatcher::new(), "UTC").with_direct_backend(Arc::new(StubBackend));

    let response = orchestrator
        .search(SearchRequest { user_message: Some("latest rust release notes on the web".to_string()), do_refinement: false, ..Default::default() })
        .await;

    assert_eq!(response.meta.sources_queried, vec!["web".to_string()]);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].source, "web");
}
