//! Canonical data model shared across the capability registry, router, dispatcher,
//! intent analyzer, fusion ranker, and orchestrator.
//!
//! Every wire object is modeled as an explicit, tagged Rust type. Only two fields stay
//! deliberately opaque because backends own their own schemas: [`FilterClause::value`]
//! and [`SearchResult::metadata`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Retrieval style a source can declare support for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Structured,
    Fulltext,
    Vector,
    /// Reserved for Phase 2 graph-backed retrieval.
    Graph,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Fulltext => "fulltext",
            Self::Vector => "vector",
            Self::Graph => "graph",
        }
    }
}

/// Whether a source holds data belonging to the user (personal) or the open web.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    Personal,
    Web,
}

impl Default for SourceClass {
    fn default() -> Self {
        Self::Personal
    }
}

/// Coarse capability tier used by the policy-plan builder (§4.5); not yet consumed by
/// a cost-aware planner (see DESIGN.md open questions).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Low,
    Medium,
    High,
}

/// Shape of the answer a routing decision asks a source for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Search,
    Count,
    Aggregate,
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Search
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Comparator a [`FilterClause`] applies to a declared field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Contains,
    Gte,
    Lte,
    In,
}

/// Role an extracted entity plays in the query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Sender,
    Recipient,
}

/// Complexity produced by intent analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentComplexity {
    Simple,
    MultiHop,
}

impl Default for IntentComplexity {
    fn default() -> Self {
        Self::Simple
    }
}

/// Complexity used by routing plans (distinct enum from [`IntentComplexity`] since a
/// multi-hop intent can still resolve to a structurally simple single-step plan).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutingComplexity {
    Simple,
    Complex,
}

impl Default for RoutingComplexity {
    fn default() -> Self {
        Self::Simple
    }
}

/// How an [`EntityExtractionRule`] turns a raw metadata value into filter-ready strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityParser {
    String,
    EmailFromHeader,
}

/// Deterministic refinement triggers, each firing at most once per search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefinementReason {
    NoResults,
    LowSourceCoverage,
    LowConfidence,
    SingleSource,
}

impl RefinementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResults => "no_results",
            Self::LowSourceCoverage => "low_source_coverage",
            Self::LowConfidence => "low_confidence",
            Self::SingleSource => "single_source",
        }
    }
}

/// Polymorphic filter value: backends own what "eq"/"contains"/... mean for their field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A single filter a source is asked to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterClause {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<FilterValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Declared shape of one filter a source supports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub operators: Vec<FilterOperator>,
    #[serde(default)]
    pub description: String,
}

/// Rule a capability declares for turning prior-step result metadata into a filter
/// value for the next hop of a multi-hop plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityExtractionRule {
    pub target_field: String,
    pub metadata_key: String,
    pub parser: EntityParser,
}

/// Per-source metadata driving every routing decision. The unique key across the
/// registry is [`Capability::source_name`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub source_name: String,
    #[serde(default)]
    pub source_class: SourceClass,
    pub supported_methods: Vec<RetrievalMethod>,
    #[serde(default)]
    pub supported_filters: Vec<FilterSpec>,
    #[serde(default)]
    pub supported_modes: Vec<SearchMode>,
    #[serde(default)]
    pub supported_group_by_fields: Vec<String>,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_default_limit")]
    pub default_limit: u32,
    #[serde(default)]
    pub sort_fields: Vec<String>,
    #[serde(default = "default_ranking")]
    pub default_ranking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_label: Option<String>,
    #[serde(default)]
    pub alias_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness_window_days: Option<u32>,
    pub latency_tier: Tier,
    pub quality_tier: Tier,
    pub cost_tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_routing_args: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_extraction_rules: Option<Vec<EntityExtractionRule>>,
}

fn default_max_limit() -> u32 {
    50
}

fn default_default_limit() -> u32 {
    10
}

fn default_ranking() -> String {
    "vector".to_string()
}

/// A decision to search one source with a specific set of methods and filters,
/// owned by a single orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub source: String,
    pub methods: Vec<RetrievalMethod>,
    pub query: String,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_top_n: Option<u32>,
}

/// Per-source alias/overlap score produced by the router, with the reasons retained
/// for the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMatch {
    pub source: String,
    pub confidence: f32,
    pub reasons: Vec<String>,
}

/// Budget tiers and fan-out cap derived from intent + capability tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyControls {
    pub latency_budget: Tier,
    pub quality_budget: Tier,
    pub cost_budget: Tier,
    pub fanout_limit: usize,
}

/// Per-source score + reasons kept for observability, independent of whether the
/// source was ultimately chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePolicyTraceEntry {
    pub source: String,
    pub score: f32,
    pub reasons: Vec<String>,
}

/// Complete routing plan for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub decisions: Vec<RoutingDecision>,
    pub complexity: RoutingComplexity,
    pub source_matches: Vec<SourceMatch>,
    pub policy_controls: PolicyControls,
    pub source_policy_trace: Vec<SourcePolicyTraceEntry>,
    pub used_default_sources: bool,
    #[serde(default)]
    pub reasoning: String,
}

/// One entity hint surfaced by the intent analyzer or the LM fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityHint {
    pub role: EntityRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// One step of a multi-hop retrieval plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalPlanStep {
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_focus: Option<String>,
    #[serde(default)]
    pub entity_from_previous: bool,
}

/// Structured intent, produced either deterministically (C5) or via the LM fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default = "default_intent_label")]
    pub label: String,
    #[serde(default)]
    pub entities: Vec<EntityHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<String>,
    #[serde(default)]
    pub source_hints: Vec<String>,
    #[serde(default)]
    pub complexity: IntentComplexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_plan: Option<Vec<RetrievalPlanStep>>,
    #[serde(default)]
    pub search_mode: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_group_by: Option<String>,
    #[serde(default = "default_aggregate_top_n")]
    pub aggregate_top_n: u32,
}

fn default_intent_label() -> String {
    "find_information".to_string()
}

fn default_aggregate_top_n() -> u32 {
    10
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            label: default_intent_label(),
            entities: Vec::new(),
            temporal: None,
            source_hints: Vec::new(),
            complexity: IntentComplexity::default(),
            retrieval_plan: None,
            search_mode: SearchMode::default(),
            aggregate_group_by: None,
            aggregate_top_n: default_aggregate_top_n(),
        }
    }
}

/// Canonical search result shape, identical whether it came from an MCP backend or a
/// direct in-process adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Unique within `source`, not globally.
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub source_class: SourceClass,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub scores: HashMap<String, f32>,
    #[serde(default)]
    pub methods_used: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl SearchResult {
    /// Highest single per-method score, used by the `low_confidence` refinement trigger.
    pub fn max_score(&self) -> f32 {
        self.scores.values().copied().fold(0.0_f32, f32::max)
    }
}

/// One group produced by an `aggregate`-mode decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub group_value: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Normalized return shape of one backend call, whatever its transport.
#[derive(Debug, Clone, Default)]
pub struct DispatcherResult {
    pub results: Vec<SearchResult>,
    pub count: Option<u64>,
    pub aggregates: Vec<AggregateGroup>,
    pub mode: Option<SearchMode>,
}

/// One round of the refinement loop, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementTraceEntry {
    pub reason: RefinementReason,
    pub action: String,
    pub fired: bool,
    pub circuit_breaker_open: bool,
}

/// Rich, append-only metadata attached to every [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub query: String,
    pub sources_queried: Vec<String>,
    pub methods_used: Vec<String>,
    pub iterations: u32,
    pub complexity: RoutingComplexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_trace: Option<serde_json::Value>,
    pub source_match_trace: Vec<SourceMatch>,
    pub timing_ms: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<Vec<AggregateGroup>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregates_source: Option<String>,
    pub refinement_trace: Vec<RefinementTraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_policy: Option<PolicyControls>,
    #[serde(default)]
    pub source_policy_trace: Vec<SourcePolicyTraceEntry>,
}

impl ResponseMeta {
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            sources_queried: Vec::new(),
            methods_used: Vec::new(),
            iterations: 0,
            complexity: RoutingComplexity::Simple,
            intent_trace: None,
            source_match_trace: Vec::new(),
            timing_ms: HashMap::new(),
            count: None,
            count_source: None,
            aggregates: None,
            aggregates_source: None,
            refinement_trace: Vec::new(),
            routing_policy: None,
            source_policy_trace: Vec::new(),
        }
    }
}

/// Final response from the search orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub meta: ResponseMeta,
}

impl Response {
    pub fn empty_with_error(query: impl Into<String>, error: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            results: Vec::new(),
            errors: vec![error.into()],
            notes: Vec::new(),
            meta: ResponseMeta::empty(query),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_value_serializes_untagged() {
        let v = FilterValue::String("alice".into());
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn max_score_of_empty_scores_is_zero() {
        let r = SearchResult {
            id: "1".into(),
            source: "email".into(),
            source_class: SourceClass::Personal,
            title: String::new(),
            snippet: String::new(),
            timestamp: None,
            scores: HashMap::new(),
            methods_used: Vec::new(),
            metadata: HashMap::new(),
            provenance: None,
        };
        assert_eq!(r.max_score(), 0.0);
    }

    #[test]
    fn capability_deserializes_with_defaults() {
        let raw = serde_json::json!({
            "source_name": "email",
            "supported_methods": ["structured", "vector"],
            "latency_tier": "low",
            "quality_tier": "high",
            "cost_tier": "low",
        });
        let cap: Capability = serde_json::from_value(raw).unwrap();
        assert_eq!(cap.max_limit, 50);
        assert_eq!(cap.default_limit, 10);
        assert_eq!(cap.default_ranking, "vector");
        assert!(cap.alias_hints.is_empty());
        assert_eq!(cap.source_class, SourceClass::Personal);
    }
}
