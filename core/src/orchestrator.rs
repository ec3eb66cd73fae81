//! Search orchestrator (C8): coordinates intent → route → execute → refine → fuse,
//! enforcing the policy plan and the per-search refinement circuit breaker.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::backends::DirectBackend;
use crate::capabilities::CapabilityRegistry;
use crate::dispatcher::McpDispatcher;
use crate::entity::EntityExtractor;
use crate::fusion::FusionRanker;
use crate::intent::DeterministicIntentAnalyzer;
use crate::model::{
    AggregateGroup, DispatcherResult, FilterClause, FilterOperator, Intent, IntentComplexity, RefinementReason,
    RefinementTraceEntry, Response, ResponseMeta, RetrievalMethod, RoutingComplexity, RoutingDecision,
    SearchMode, SearchResult, SourceClass,
};
use crate::router::RetrievalRouter;

/// Future returned by the optional language-model callback.
pub type LmCallFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
/// `(prompt, max_tokens) -> completion` — the only shape the orchestrator depends on.
pub type LmCallFn = Arc<dyn Fn(String, u32) -> LmCallFuture + Send + Sync>;

const BROAD_FALLBACK_CAP: usize = 3;
const MAX_REFINEMENT_DECISIONS: usize = 4;
const LOW_CONFIDENCE_THRESHOLD: f32 = 0.7;

static ROLE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(user|assistant|system)\s*:").unwrap());

/// Inbound search request; exactly one of `conversation_context`/`user_message` is
/// expected to carry the query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub conversation_context: Option<String>,
    pub user_message: Option<String>,
    pub max_results: u32,
    pub do_refinement: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            conversation_context: None,
            user_message: None,
            max_results: 20,
            do_refinement: true,
        }
    }
}

/// Coordinates the full search pipeline across the capability registry, dispatcher,
/// direct backends, router, intent analyzer, entity extractor, and fusion ranker.
pub struct Orchestrator {
    capabilities: CapabilityRegistry,
    dispatcher: McpDispatcher,
    direct_backends: HashMap<String, Arc<dyn DirectBackend>>,
    user_timezone: String,
    lm_callback: Option<LmCallFn>,
}

impl Orchestrator {
    pub fn new(capabilities: CapabilityRegistry, dispatcher: McpDispatcher, user_timezone: impl Into<String>) -> Self {
        Self {
            capabilities,
            dispatcher,
            direct_backends: HashMap::new(),
            user_timezone: user_timezone.into(),
            lm_callback: None,
        }
    }

    pub fn with_direct_backend(mut self, backend: Arc<dyn DirectBackend>) -> Self {
        self.direct_backends.insert(backend.source_name().to_string(), backend);
        self
    }

    pub fn with_lm_callback(mut self, callback: LmCallFn) -> Self {
        self.lm_callback = Some(callback);
        self
    }

    pub async fn search(&self, request: SearchRequest) -> Response {
        let mut timing_ms: HashMap<String, f64> = HashMap::new();
        let overall_start = Instant::now();

        let t0 = Instant::now();
        let query = match assemble_context(&request) {
            Some(q) => q,
            None => return Response::empty_with_error("", "empty query: no user_message or conversation_context supplied"),
        };
        timing_ms.insert("context_assembly".to_string(), elapsed_ms(t0));

        if self.capabilities.all_sources().is_empty() && self.direct_backends.is_empty() {
            return Response::empty_with_error(query, "No search backends available for this query");
        }

        let max_results = request.max_results.clamp(1, 50);

        let router = RetrievalRouter::new(&self.capabilities);

        let t0 = Instant::now();
        let source_matches = router.match_sources(&query, 0.55, 10);
        let analyzer = DeterministicIntentAnalyzer::new();
        let deterministic = analyzer.analyze(&query, &source_matches, None);

        let (intent, decision_label) = if deterministic.should_use_deterministic {
            (deterministic.intent.clone(), "deterministic")
        } else if let Some(lm) = &self.lm_callback {
            match self.call_lm_for_intent(lm, &query).await {
                Some(parsed) => (parsed, "llm"),
                None => (deterministic.intent.clone(), "deterministic_fallback"),
            }
        } else {
            (deterministic.intent.clone(), "deterministic_fallback")
        };
        let mut intent_trace = deterministic.trace();
        if let serde_json::Value::Object(obj) = &mut intent_trace {
            obj.insert("decision".to_string(), serde_json::Value::String(decision_label.to_string()));
        }
        timing_ms.insert("intent".to_string(), elapsed_ms(t0));

        let t0 = Instant::now();
        let mut notes = Vec::new();
        let mut errors = Vec::new();

        let (mut results, count, count_source, aggregates, aggregates_source, complexity, policy_controls, source_policy_trace, sources_queried, mut methods_used, had_explicit_filters) =
            if let Some(steps) = intent.retrieval_plan.as_ref().filter(|s| s.len() >= 2) {
                if steps.iter().all(|s| s.sources.iter().all(|src| self.has_backend(src))) {
                    self.run_multi_hop(steps, &query, max_results, &mut errors).await
                } else {
                    self.run_single_step(&router, &intent, &query, max_results, &mut notes, &mut errors).await
                }
            } else {
                self.run_single_step(&router, &intent, &query, max_results, &mut notes, &mut errors).await
            };
        timing_ms.insert("routing_and_execution".to_string(), elapsed_ms(t0));

        let t0 = Instant::now();
        let mut refinement_trace = Vec::new();
        let mut iterations = 1_u32;
        let skip_refinement = matches!(intent.search_mode, SearchMode::Count | SearchMode::Aggregate);
        if request.do_refinement && !skip_refinement {
            self.refine(
                &intent,
                &query,
                max_results,
                &sources_queried,
                had_explicit_filters,
                &mut results,
                &mut errors,
                &mut refinement_trace,
                &mut iterations,
            )
            .await;
        }
        timing_ms.insert("refinement".to_string(), elapsed_ms(t0));

        let t0 = Instant::now();
        let is_personal_query = sources_queried
            .iter()
            .any(|s| self.capabilities.get(s).map(|c| c.source_class == SourceClass::Personal).unwrap_or(true));
        let ranker = FusionRanker::new();
        let fused = ranker.fuse_and_rank(results, is_personal_query, max_results as usize);
        timing_ms.insert("fusion".to_string(), elapsed_ms(t0));
        timing_ms.insert("total".to_string(), elapsed_ms(overall_start));

        methods_used.sort();
        methods_used.dedup();

        let mut sources_queried_sorted = sources_queried.clone();
        sources_queried_sorted.sort();
        sources_queried_sorted.dedup();

        Response {
            results: fused,
            errors,
            notes,
            meta: ResponseMeta {
                query,
                sources_queried: sources_queried_sorted,
                methods_used,
                iterations,
                complexity,
                intent_trace: Some(intent_trace),
                source_match_trace: source_matches,
                timing_ms,
                count,
                count_source,
                aggregates,
                aggregates_source,
                refinement_trace,
                routing_policy: Some(policy_controls),
                source_policy_trace,
            },
        }
    }

    async fn call_lm_for_intent(&self, lm: &LmCallFn, query: &str) -> Option<Intent> {
        let prompt = format!(
            "Extract structured search intent as JSON (label, entities, temporal, source_hints, complexity, search_mode) for the query: {query}"
        );
        let raw = (lm)(prompt, 512).await.ok()?;
        parse_lenient_intent_json(&raw)
    }

    fn has_backend(&self, source: &str) -> bool {
        self.dispatcher.has_source(source) || self.direct_backends.contains_key(source)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single_step(
        &self,
        router: &RetrievalRouter<'_>,
        intent: &Intent,
        query: &str,
        max_results: u32,
        notes: &mut Vec<String>,
        errors: &mut Vec<String>,
    ) -> (
        Vec<SearchResult>,
        Option<u64>,
        Option<String>,
        Option<Vec<AggregateGroup>>,
        Option<String>,
        RoutingComplexity,
        crate::model::PolicyControls,
        Vec<crate::model::SourcePolicyTraceEntry>,
        Vec<String>,
        Vec<String>,
        bool,
    ) {
        let mut plan = router.route(intent, query, &self.user_timezone);

        if plan.used_default_sources && plan.decisions.len() > BROAD_FALLBACK_CAP {
            plan.decisions.truncate(BROAD_FALLBACK_CAP);
            plan.policy_controls.fanout_limit = BROAD_FALLBACK_CAP;
        }
        if plan.used_default_sources {
            notes.push("no explicit source hint; ran capped broad search".to_string());
        }

        let had_explicit_filters = plan.decisions.iter().any(|d| !d.filters.is_empty());

        if plan.decisions.is_empty() {
            return (
                Vec::new(),
                None,
                None,
                None,
                None,
                plan.complexity,
                plan.policy_controls,
                plan.source_policy_trace,
                Vec::new(),
                Vec::new(),
                had_explicit_filters,
            );
        }

        let (results, count, count_source, aggregates, aggregates_source, sources_queried, methods_used) =
            self.execute_decisions(&plan.decisions, max_results, errors).await;

        (
            results,
            count,
            count_source,
            aggregates,
            aggregates_source,
            plan.complexity,
            plan.policy_controls,
            plan.source_policy_trace,
            sources_queried,
            methods_used,
            had_explicit_filters,
        )
    }

    async fn run_multi_hop(
        &self,
        steps: &[crate::model::RetrievalPlanStep],
        query: &str,
        max_results: u32,
        errors: &mut Vec<String>,
    ) -> (
        Vec<SearchResult>,
        Option<u64>,
        Option<String>,
        Option<Vec<AggregateGroup>>,
        Option<String>,
        RoutingComplexity,
        crate::model::PolicyControls,
        Vec<crate::model::SourcePolicyTraceEntry>,
        Vec<String>,
        Vec<String>,
        bool,
    ) {
        let extractor = EntityExtractor::new();
        let mut all_results = Vec::new();
        let mut count = None;
        let mut count_source = None;
        let mut aggregates: Option<Vec<AggregateGroup>> = None;
        let mut aggregates_source = None;
        let mut sources_queried = Vec::new();
        let mut methods_used = Vec::new();
        let mut carried_filters: Vec<FilterClause> = Vec::new();
        let mut previous_step_results: Vec<SearchResult> = Vec::new();
        let mut previous_step_aggregates: Vec<AggregateGroup> = Vec::new();
        let mut had_explicit_filters = false;

        for step in steps.iter() {
            let mut step_sources = step.sources.clone();
            if step.entity_from_previous {
                let capable_sources: Vec<String> = step_sources
                    .iter()
                    .filter(|s| {
                        self.capabilities
                            .get(*s)
                            .is_some_and(|c| c.supported_filters.iter().any(|f| f.name == "from_name" || f.name == "from_email"))
                    })
                    .cloned()
                    .collect();
                if !capable_sources.is_empty() {
                    step_sources = capable_sources;
                }

                let mut step_filters = Vec::new();
                if let Some(top_group) = previous_step_aggregates.first() {
                    let value = top_group.label.clone().unwrap_or_else(|| top_group.group_value.clone());
                    step_filters.push(FilterClause::new("from_name", FilterOperator::Contains, value));
                } else if let Some(first_result) = previous_step_results.first() {
                    if let Some(source) = self.capabilities.get(&first_result.source) {
                        let entity = extractor.extract_from_metadata(first_result, source);
                        step_filters.extend(entity.to_filters());
                    }
                }
                carried_filters = step_filters;
            }

            let decisions: Vec<RoutingDecision> = step_sources
                .iter()
                .filter_map(|source| {
                    let capability = self.capabilities.get(source)?;
                    let filters: Vec<FilterClause> = carried_filters
                        .iter()
                        .filter(|f| capability.supported_filters.iter().any(|s| s.name == f.field))
                        .cloned()
                        .collect();
                    let focus = step.query_focus.clone().unwrap_or_else(|| query.to_string());
                    let methods = if capability.supported_methods.contains(&RetrievalMethod::Vector) {
                        vec![RetrievalMethod::Vector]
                    } else {
                        capability.supported_methods.first().cloned().into_iter().collect()
                    };
                    Some(RoutingDecision {
                        source: source.clone(),
                        methods,
                        query: focus,
                        filters,
                        mode: SearchMode::Search,
                        sort_field: None,
                        sort_order: None,
                        group_by: None,
                        aggregate_top_n: None,
                    })
                })
                .collect();

            if decisions.is_empty() {
                continue;
            }
            had_explicit_filters = had_explicit_filters || decisions.iter().any(|d| !d.filters.is_empty());

            let (step_results, step_count, step_count_source, step_aggregates, step_aggregates_source, step_sources_queried, step_methods_used) =
                self.execute_decisions(&decisions, max_results, errors).await;

            if count.is_none() {
                count = step_count;
                count_source = step_count_source;
            }
            if aggregates.is_none() {
                if let Some(ref step_aggs) = step_aggregates {
                    if !step_aggs.is_empty() {
                        aggregates = step_aggregates.clone();
                        aggregates_source = step_aggregates_source.clone();
                    }
                }
            }

            previous_step_aggregates = step_aggregates.unwrap_or_default();
            previous_step_results = step_results.clone();
            sources_queried.extend(step_sources_queried);
            methods_used.extend(step_methods_used);
            all_results.extend(step_results);
        }

        (
            all_results,
            count,
            count_source,
            aggregates,
            aggregates_source,
            RoutingComplexity::Complex,
            crate::model::PolicyControls {
                latency_budget: crate::model::Tier::Medium,
                quality_budget: crate::model::Tier::Medium,
                cost_budget: crate::model::Tier::Medium,
                fanout_limit: sources_queried.len().max(1),
            },
            Vec::new(),
            sources_queried,
            methods_used,
            had_explicit_filters,
        )
    }

    #[allow(clippy::type_complexity)]
    async fn execute_decisions(
        &self,
        decisions: &[RoutingDecision],
        max_results: u32,
        errors: &mut Vec<String>,
    ) -> (Vec<SearchResult>, Option<u64>, Option<String>, Option<Vec<AggregateGroup>>, Option<String>, Vec<String>, Vec<String>) {
        let futures = decisions.iter().map(|decision| self.dispatch_one(decision, max_results));
        let outcomes: Vec<Result<DispatcherResult, crate::error::SearchCoreError>> = join_all(futures).await;

        let mut results = Vec::new();
        let mut count = None;
        let mut count_source = None;
        let mut aggregates = None;
        let mut aggregates_source = None;
        let mut sources_queried = Vec::new();
        let mut methods_used = Vec::new();

        for (decision, outcome) in decisions.iter().zip(outcomes.into_iter()) {
            sources_queried.push(decision.source.clone());
            methods_used.extend(decision.methods.iter().map(|m| m.as_str().to_string()));
            match outcome {
                Ok(dispatcher_result) => {
                    if count.is_none() {
                        if let Some(c) = dispatcher_result.count {
                            count = Some(c);
                            count_source = Some(decision.source.clone());
                        }
                    }
                    if aggregates.is_none() && !dispatcher_result.aggregates.is_empty() {
                        aggregates = Some(dispatcher_result.aggregates.clone());
                        aggregates_source = Some(decision.source.clone());
                    }
                    results.extend(dispatcher_result.results);
                }
                Err(e) => {
                    errors.push(e.as_meta_error());
                }
            }
        }

        (results, count, count_source, aggregates, aggregates_source, sources_queried, methods_used)
    }

    async fn dispatch_one(&self, decision: &RoutingDecision, max_results: u32) -> Result<DispatcherResult, crate::error::SearchCoreError> {
        if self.dispatcher.has_source(&decision.source) {
            let capability_routing_args = self.capabilities.get(&decision.source).and_then(|c| c.request_routing_args.as_ref());
            self.dispatcher
                .search(
                    &decision.source,
                    &decision.query,
                    Some(&decision.methods),
                    Some(&decision.filters),
                    max_results,
                    decision.mode,
                    decision.sort_field.as_deref(),
                    decision.sort_order,
                    decision.group_by.as_deref(),
                    decision.aggregate_top_n,
                    capability_routing_args,
                )
                .await
        } else if let Some(backend) = self.direct_backends.get(&decision.source) {
            let results = backend
                .search(&decision.query, Some(&decision.methods), Some(&decision.filters), max_results)
                .await?;
            Ok(DispatcherResult {
                results,
                count: None,
                aggregates: Vec::new(),
                mode: Some(SearchMode::Search),
            })
        } else {
            Err(crate::error::SearchCoreError::Dispatch {
                source: decision.source.clone(),
                message: "no backend registered for source".to_string(),
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn refine(
        &self,
        intent: &Intent,
        query: &str,
        max_results: u32,
        original_sources: &[String],
        had_explicit_filters: bool,
        results: &mut Vec<SearchResult>,
        errors: &mut Vec<String>,
        trace: &mut Vec<RefinementTraceEntry>,
        iterations: &mut u32,
    ) {
        let mut fired: HashSet<RefinementReason> = HashSet::new();
        let complexity_multi_hop = intent.complexity == IntentComplexity::MultiHop;

        for _round in 0..MAX_REFINEMENT_DECISIONS {
            let reason = self.next_refinement_reason(intent, results, had_explicit_filters, complexity_multi_hop);
            let Some(reason) = reason else { break };

            if fired.contains(&reason) {
                trace.push(RefinementTraceEntry {
                    reason,
                    action: refinement_action_label(reason),
                    fired: false,
                    circuit_breaker_open: true,
                });
                break;
            }
            fired.insert(reason);

            let retry_decisions = self.build_retry_decisions(reason, query, results, original_sources);
            let retry_decisions: Vec<RoutingDecision> = retry_decisions.into_iter().take(MAX_REFINEMENT_DECISIONS).collect();

            if retry_decisions.is_empty() {
                trace.push(RefinementTraceEntry {
                    reason,
                    action: refinement_action_label(reason),
                    fired: false,
                    circuit_breaker_open: false,
                });
                continue;
            }

            let (retry_results, _count, _count_source, _aggregates, _aggregates_source, _sources_queried, _methods_used) =
                self.execute_decisions(&retry_decisions, max_results, errors).await;
            results.extend(retry_results);
            *iterations += 1;

            trace.push(RefinementTraceEntry {
                reason,
                action: refinement_action_label(reason),
                fired: true,
                circuit_breaker_open: false,
            });
        }
    }

    fn next_refinement_reason(
        &self,
        intent: &Intent,
        results: &[SearchResult],
        had_explicit_filters: bool,
        complexity_multi_hop: bool,
    ) -> Option<RefinementReason> {
        if results.is_empty() && (!had_explicit_filters || complexity_multi_hop) {
            return Some(RefinementReason::NoResults);
        }
        if !results.is_empty() && results.len() < 3 {
            return Some(RefinementReason::LowSourceCoverage);
        }
        if !results.is_empty() {
            let avg_max_score: f32 = results.iter().map(SearchResult::max_score).sum::<f32>() / results.len() as f32;
            if avg_max_score < LOW_CONFIDENCE_THRESHOLD {
                return Some(RefinementReason::LowConfidence);
            }
        }
        let distinct_sources: HashSet<&str> = results.iter().map(|r| r.source.as_str()).collect();
        if distinct_sources.len() == 1 && intent.source_hints.len() >= 2 && !complexity_multi_hop {
            return Some(RefinementReason::SingleSource);
        }
        None
    }

    fn build_retry_decisions(
        &self,
        reason: RefinementReason,
        query: &str,
        results: &[SearchResult],
        original_sources: &[String],
    ) -> Vec<RoutingDecision> {
        let returned_sources: HashSet<&str> = results.iter().map(|r| r.source.as_str()).collect();
        let empty_sources: Vec<String> = original_sources
            .iter()
            .filter(|s| !returned_sources.contains(s.as_str()))
            .cloned()
            .collect();

        match reason {
            RefinementReason::NoResults => original_sources
                .iter()
                .filter_map(|source| {
                    let capability = self.capabilities.get(source)?;
                    let mut methods = vec![RetrievalMethod::Vector];
                    if capability.supported_methods.contains(&RetrievalMethod::Structured) {
                        methods.push(RetrievalMethod::Structured);
                    }
                    Some(RoutingDecision {
                        source: source.clone(),
                        methods,
                        query: query.to_string(),
                        filters: Vec::new(),
                        mode: SearchMode::Search,
                        sort_field: None,
                        sort_order: None,
                        group_by: None,
                        aggregate_top_n: None,
                    })
                })
                .collect(),
            RefinementReason::LowSourceCoverage | RefinementReason::SingleSource => empty_sources
                .iter()
                .filter_map(|source| {
                    let capability = self.capabilities.get(source)?;
                    Some(RoutingDecision {
                        source: source.clone(),
                        methods: capability.supported_methods.clone(),
                        query: query.to_string(),
                        filters: Vec::new(),
                        mode: SearchMode::Search,
                        sort_field: None,
                        sort_order: None,
                        group_by: None,
                        aggregate_top_n: None,
                    })
                })
                .collect(),
            RefinementReason::LowConfidence => original_sources
                .iter()
                .filter_map(|source| {
                    let capability = self.capabilities.get(source)?;
                    let mut extra = Vec::new();
                    for candidate in [RetrievalMethod::Fulltext, RetrievalMethod::Vector] {
                        if capability.supported_methods.contains(&candidate) {
                            extra.push(candidate);
                        }
                    }
                    if extra.is_empty() {
                        return None;
                    }
                    Some(RoutingDecision {
                        source: source.clone(),
                        methods: extra,
                        query: query.to_string(),
                        filters: Vec::new(),
                        mode: SearchMode::Search,
                        sort_field: None,
                        sort_order: None,
                        group_by: None,
                        aggregate_top_n: None,
                    })
                })
                .collect(),
        }
    }
}

fn refinement_action_label(reason: RefinementReason) -> String {
    match reason {
        RefinementReason::NoResults => "broaden_retry_all".to_string(),
        RefinementReason::LowSourceCoverage => "retry_empty_sources".to_string(),
        RefinementReason::LowConfidence => "broaden_methods".to_string(),
        RefinementReason::SingleSource => "retry_other_sources".to_string(),
    }
}

fn assemble_context(request: &SearchRequest) -> Option<String> {
    if let Some(message) = &request.user_message {
        let trimmed = message.trim();
        if !trimmed.is_empty() {
            return Some(truncate(trimmed, 200));
        }
    }
    if let Some(context) = &request.conversation_context {
        for line in context.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || ROLE_PREFIX.is_match(trimmed) {
                continue;
            }
            return Some(truncate(trimmed, 200));
        }
    }
    None
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn parse_lenient_intent_json(raw: &str) -> Option<Intent> {
    let cleaned = strip_code_fence(raw.trim());
    let no_trailing_commas = remove_trailing_commas(&cleaned);
    serde_json::from_str(&no_trailing_commas).ok()
}

fn strip_code_fence(s: &str) -> String {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix("```json") {
        return stripped.trim_end_matches("```").trim().to_string();
    }
    if let Some(stripped) = s.strip_prefix("```") {
        return stripped.trim_end_matches("```").trim().to_string();
    }
    s.to_string()
}

fn remove_trailing_commas(s: &str) -> String {
    static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
    TRAILING_COMMA.replace_all(s, "$1").to_string()
}
