//! Retrieval router (C4): deterministically chooses sources, methods, filters,
//! mode/group-by, and a policy plan for one query.

use std::collections::HashSet;

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::capabilities::CapabilityRegistry;
use crate::model::{
    Capability, FilterClause, FilterOperator, Intent, PolicyControls, RetrievalMethod, RoutingComplexity,
    RoutingDecision, RoutingPlan, SearchMode, SourceMatch, SourcePolicyTraceEntry, Tier,
};

const RELATIONSHIP_KEYWORDS: &[&str] = &["between", "related to", "about the same", "thread", "conversation", "regarding"];
const NEGATION_WORDS: &[&str] = &["not", "without", "except", "excluding", "instead of"];

static FROM_EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bfrom\s+(\S+@\S+)").unwrap());
static DATE_AFTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:after|since|from)\s+(\d{4}-\d{2}-\d{2})\b").unwrap());
static DATE_BEFORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:before|until|by)\s+(\d{4}-\d{2}-\d{2})\b").unwrap());

fn humanize_source_name(source_name: &str) -> String {
    source_name
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministically tokenizes on whitespace/punctuation, lower-cased, dropping
/// single-character tokens.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

fn build_aliases(capability: &Capability) -> Vec<String> {
    let mut aliases: HashSet<String> = HashSet::new();
    aliases.insert(capability.source_name.to_lowercase());
    let humanized = humanize_source_name(&capability.source_name).to_lowercase();
    aliases.insert(humanized.clone());
    for token in tokenize(&capability.source_name) {
        aliases.insert(token);
    }
    for token in tokenize(&humanized) {
        aliases.insert(token);
    }
    if let Some(label) = &capability.display_label {
        aliases.insert(label.to_lowercase());
        for token in tokenize(label) {
            aliases.insert(token);
        }
    }
    for hint in &capability.alias_hints {
        aliases.insert(hint.clone());
    }
    aliases.into_iter().filter(|a| !a.is_empty()).collect()
}

struct ScoredSource {
    score: f32,
    reasons: Vec<String>,
    earliest_position: usize,
}

fn score_source(query_lower: &str, query_tokens: &HashSet<String>, aliases: &[String]) -> ScoredSource {
    let mut score = 0.0_f32;
    let mut reasons = Vec::new();
    let mut earliest_position = usize::MAX;
    let trimmed = query_lower.trim();

    for alias in aliases {
        if alias == trimmed {
            score += 0.5;
            reasons.push(format!("exact_match:{alias}"));
            earliest_position = 0;
            continue;
        }
        if let Some(pos) = word_boundary_position(query_lower, alias) {
            let position_bonus = if query_lower.is_empty() {
                0.0
            } else {
                0.05 * (1.0 - (pos as f32 / query_lower.len() as f32))
            };
            score += 0.35 + position_bonus;
            reasons.push(format!("alias_match:{alias}@{pos}"));
            earliest_position = earliest_position.min(pos);
        }

        let alias_tokens = tokenize(alias);
        if !alias_tokens.is_empty() {
            let overlap = alias_tokens.intersection(query_tokens).count();
            if overlap > 0 {
                let ratio = overlap as f32 / alias_tokens.len() as f32;
                score += 0.35 * ratio;
                reasons.push(format!("token_overlap:{alias}:{ratio:.2}"));
            }
        }

        for neg in NEGATION_WORDS {
            let pattern = format!(r"(?i)\b{}\s+{}\b", regex::escape(neg), regex::escape(alias));
            if let Ok(re) = Regex::new(&pattern) {
                if re.is_match(query_lower) {
                    score -= 0.7;
                    reasons.push(format!("negated:{alias}"));
                }
            }
        }
    }

    ScoredSource {
        score: score.clamp(0.0, 1.0),
        reasons,
        earliest_position: if earliest_position == usize::MAX { query_lower.len() } else { earliest_position },
    }
}

fn word_boundary_position(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let pattern = format!(r"\b{}\b", regex::escape(needle));
    Regex::new(&pattern).ok()?.find(haystack).map(|m| m.start())
}

/// Routes queries to appropriate sources and methods based on registered capabilities.
pub struct RetrievalRouter<'a> {
    capabilities: &'a CapabilityRegistry,
}

impl<'a> RetrievalRouter<'a> {
    pub fn new(capabilities: &'a CapabilityRegistry) -> Self {
        Self { capabilities }
    }

    /// Scores every registered source against `query`, keeping only those at or above
    /// `threshold`, sorted by confidence desc, then earliest match position, then
    /// source name; truncated to `top_n`.
    pub fn match_sources(&self, query: &str, threshold: f32, top_n: usize) -> Vec<SourceMatch> {
        let query_lower = query.to_lowercase();
        let query_tokens = tokenize(query);

        let mut scored: Vec<(String, ScoredSource)> = self
            .capabilities
            .all_sources()
            .into_iter()
            .filter_map(|source| {
                let capability = self.capabilities.get(&source)?;
                let aliases = build_aliases(capability);
                Some((source, score_source(&query_lower, &query_tokens, &aliases)))
            })
            .collect();

        scored.retain(|(_, s)| s.score >= threshold);
        scored.sort_by(|(name_a, a), (name_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap()
                .then(a.earliest_position.cmp(&b.earliest_position))
                .then(name_a.cmp(name_b))
        });
        scored.truncate(top_n);

        scored
            .into_iter()
            .map(|(source, s)| SourceMatch {
                source,
                confidence: s.score,
                reasons: s.reasons,
            })
            .collect()
    }

    /// Builds a full routing plan from structured intent and the raw query.
    pub fn route(&self, intent: &Intent, query: &str, user_timezone: &str) -> RoutingPlan {
        let complexity = self.classify_complexity(intent, query);
        let source_matches = self.match_sources(query, 0.55, 10);

        let (target_sources, used_default_sources) = self.select_sources(intent, query, &source_matches);

        let (mode, group_by) = self.resolve_mode_and_group_by(intent, &target_sources);
        let filters = self.extract_filters(intent, query, user_timezone);

        let mut decisions = Vec::new();
        let mut source_policy_trace = Vec::new();
        for source in &target_sources {
            let Some(capability) = self.capabilities.get(source) else {
                continue;
            };
            let methods = self.select_methods(capability, query, &filters, intent);
            let source_filters: Vec<FilterClause> = filters
                .iter()
                .filter(|f| capability.supported_filters.iter().any(|s| s.name == f.field))
                .cloned()
                .collect();

            let decision_mode = if mode == SearchMode::Aggregate && !self.capabilities.supports_mode(source, SearchMode::Aggregate) {
                SearchMode::Search
            } else {
                mode
            };

            decisions.push(RoutingDecision {
                source: source.clone(),
                methods,
                query: query.to_string(),
                filters: source_filters,
                mode: decision_mode,
                sort_field: None,
                sort_order: None,
                group_by: if decision_mode == SearchMode::Aggregate { group_by.clone() } else { None },
                aggregate_top_n: if decision_mode == SearchMode::Aggregate {
                    Some(intent.aggregate_top_n)
                } else {
                    None
                },
            });

            let matched_score = source_matches.iter().find(|m| &m.source == source);
            source_policy_trace.push(SourcePolicyTraceEntry {
                source: source.clone(),
                score: matched_score.map(|m| m.confidence).unwrap_or(0.0),
                reasons: matched_score.map(|m| m.reasons.clone()).unwrap_or_default(),
            });
        }

        let policy_controls = self.build_policy_controls(&target_sources, used_default_sources);

        let reasoning = format!(
            "routed to {} source(s): {} | complexity={:?}",
            decisions.len(),
            decisions
                .iter()
                .map(|d| format!("{}[{}]", d.source, d.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(",")))
                .collect::<Vec<_>>()
                .join(", "),
            complexity
        );
        tracing::info!(%reasoning, "router decision");

        RoutingPlan {
            decisions,
            complexity,
            source_matches,
            policy_controls,
            source_policy_trace,
            used_default_sources,
            reasoning,
        }
    }

    fn classify_complexity(&self, intent: &Intent, query: &str) -> RoutingComplexity {
        if intent.complexity == crate::model::IntentComplexity::MultiHop {
            return RoutingComplexity::Complex;
        }
        if intent.source_hints.len() > 2 {
            return RoutingComplexity::Complex;
        }
        let query_lower = query.to_lowercase();
        if RELATIONSHIP_KEYWORDS.iter().any(|kw| query_lower.contains(kw)) {
            return RoutingComplexity::Complex;
        }
        if intent.entities.len() > 3 {
            return RoutingComplexity::Complex;
        }
        RoutingComplexity::Simple
    }

    /// Returns (sources, used_default_sources).
    fn select_sources(&self, intent: &Intent, query: &str, source_matches: &[SourceMatch]) -> (Vec<String>, bool) {
        let available: HashSet<String> = self.capabilities.all_sources().into_iter().collect();
        if available.is_empty() {
            return (Vec::new(), false);
        }

        if !intent.source_hints.is_empty() {
            let mut target: Vec<String> = intent
                .source_hints
                .iter()
                .filter(|s| available.contains(*s))
                .cloned()
                .collect();
            target.sort();
            target.dedup();
            if !target.is_empty() {
                return (target, false);
            }
        }

        if !source_matches.is_empty() {
            let mut target: Vec<String> = source_matches.iter().map(|m| m.source.clone()).collect();
            target.sort();
            return (target, false);
        }

        let _ = query;
        let mut personal = self.capabilities.personal_sources();
        if !personal.is_empty() {
            personal.sort();
            (personal, true)
        } else {
            let mut all: Vec<String> = available.into_iter().collect();
            all.sort();
            (all, true)
        }
    }

    fn resolve_mode_and_group_by(&self, intent: &Intent, candidates: &[String]) -> (SearchMode, Option<String>) {
        if intent.search_mode != SearchMode::Aggregate {
            return (intent.search_mode, None);
        }

        let any_supports_aggregate = candidates.iter().any(|s| self.capabilities.supports_mode(s, SearchMode::Aggregate));
        if !any_supports_aggregate {
            return (SearchMode::Search, None);
        }

        if let Some(requested) = &intent.aggregate_group_by {
            let declared = candidates.iter().any(|s| self.capabilities.supports_group_by(s, requested));
            if declared {
                return (SearchMode::Aggregate, Some(requested.clone()));
            }
        }

        let fallback = candidates.iter().find_map(|s| {
            self.capabilities
                .get(s)
                .and_then(|c| c.supported_group_by_fields.first().cloned())
        });
        (SearchMode::Aggregate, fallback)
    }

    fn extract_filters(&self, intent: &Intent, query: &str, user_timezone: &str) -> Vec<FilterClause> {
        let mut filters = Vec::new();

        for entity in &intent.entities {
            match entity.role {
                crate::model::EntityRole::Sender => {
                    if let Some(name) = &entity.name {
                        filters.push(FilterClause::new("from_name", FilterOperator::Contains, name.as_str()));
                    }
                    if let Some(email) = &entity.email {
                        filters.push(FilterClause::new("from_email", FilterOperator::Contains, email.as_str()));
                    }
                }
                crate::model::EntityRole::Recipient => {
                    if let Some(name) = &entity.name {
                        filters.push(FilterClause::new("to_email", FilterOperator::Contains, name.as_str()));
                    }
                    if let Some(email) = &entity.email {
                        filters.push(FilterClause::new("to_email", FilterOperator::Contains, email.as_str()));
                    }
                }
            }
        }

        if let Some(temporal) = &intent.temporal {
            filters.extend(self.temporal_filters(temporal, user_timezone));
        }

        if let Some(caps) = FROM_EMAIL.captures(query) {
            let value = caps.get(1).unwrap().as_str().to_string();
            if !filters.iter().any(|f| f.field == "from_email") {
                filters.push(FilterClause::new("from_email", FilterOperator::Contains, value));
            }
        }
        if let Some(caps) = DATE_AFTER.captures(query) {
            let value = caps.get(1).unwrap().as_str().to_string();
            if !filters.iter().any(|f| f.field == "date_after") {
                filters.push(FilterClause::new("date_after", FilterOperator::Gte, value));
            }
        }
        if let Some(caps) = DATE_BEFORE.captures(query) {
            let value = caps.get(1).unwrap().as_str().to_string();
            if !filters.iter().any(|f| f.field == "date_before") {
                filters.push(FilterClause::new("date_before", FilterOperator::Lte, value));
            }
        }

        filters
    }

    fn temporal_filters(&self, temporal: &str, user_timezone: &str) -> Vec<FilterClause> {
        let now = crate::timezone::now_in_timezone(user_timezone);
        let today = now.date_naive();
        let mut out = Vec::new();
        match temporal {
            "today" => {
                out.push(FilterClause::new("date_after", FilterOperator::Gte, today.to_string()));
            }
            "yesterday" => {
                let yesterday = today - Duration::days(1);
                out.push(FilterClause::new("date_after", FilterOperator::Gte, yesterday.to_string()));
                out.push(FilterClause::new("date_before", FilterOperator::Lte, yesterday.to_string()));
            }
            "this week" | "last week" => {
                let days = if temporal == "this week" { 7 } else { 14 };
                out.push(FilterClause::new(
                    "date_after",
                    FilterOperator::Gte,
                    (today - Duration::days(days)).to_string(),
                ));
            }
            "this month" | "last month" => {
                let days = if temporal == "this month" { 30 } else { 60 };
                out.push(FilterClause::new(
                    "date_after",
                    FilterOperator::Gte,
                    (today - Duration::days(days)).to_string(),
                ));
            }
            "recent" | "recently" | "most recent" | "latest" => {
                out.push(FilterClause::new(
                    "date_after",
                    FilterOperator::Gte,
                    (today - Duration::days(30)).to_string(),
                ));
            }
            _ => {}
        }
        out
    }

    fn select_methods(
        &self,
        capability: &Capability,
        query: &str,
        filters: &[FilterClause],
        _intent: &Intent,
    ) -> Vec<RetrievalMethod> {
        let supported = &capability.supported_methods;
        let has_filters = !filters.is_empty();
        let has_query = !query.trim().is_empty();
        let mut methods = Vec::new();

        if has_filters && supported.contains(&RetrievalMethod::Structured) {
            methods.push(RetrievalMethod::Structured);
        }
        if has_query && supported.contains(&RetrievalMethod::Fulltext) {
            methods.push(RetrievalMethod::Fulltext);
        }
        if has_query && supported.contains(&RetrievalMethod::Vector) {
            methods.push(RetrievalMethod::Vector);
        }

        if methods.is_empty() {
            if has_query && supported.contains(&RetrievalMethod::Vector) {
                methods.push(RetrievalMethod::Vector);
            } else if supported.contains(&RetrievalMethod::Structured) {
                methods.push(RetrievalMethod::Structured);
            } else if let Some(first) = supported.first() {
                methods.push(*first);
            }
        }
        methods
    }

    fn build_policy_controls(&self, sources: &[String], used_default_sources: bool) -> PolicyControls {
        let tier_rank = |t: Tier| match t {
            Tier::Low => 0,
            Tier::Medium => 1,
            Tier::High => 2,
        };
        let mut latency = Tier::Low;
        let mut quality = Tier::Low;
        let mut cost = Tier::Low;
        for source in sources {
            if let Some(cap) = self.capabilities.get(source) {
                if tier_rank(cap.latency_tier) > tier_rank(latency) {
                    latency = cap.latency_tier;
                }
                if tier_rank(cap.quality_tier) > tier_rank(quality) {
                    quality = cap.quality_tier;
                }
                if tier_rank(cap.cost_tier) > tier_rank(cost) {
                    cost = cap.cost_tier;
                }
            }
        }
        PolicyControls {
            latency_budget: latency,
            quality_budget: quality,
            cost_budget: cost,
            fanout_limit: if used_default_sources { 3 } else { sources.len() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FilterSpec, SourceClass};

    fn make_capability(name: &str, methods: &[RetrievalMethod], filters: &[&str]) -> Capability {
        Capability {
            source_name: name.to_string(),
            source_class: SourceClass::Personal,
            supported_methods: methods.to_vec(),
            supported_filters: filters
                .iter()
                .map(|f| FilterSpec {
                    name: f.to_string(),
                    value_type: "string".into(),
                    operators: vec![FilterOperator::Contains, FilterOperator::Gte, FilterOperator::Lte],
                    description: String::new(),
                })
                .collect(),
            supported_modes: vec![SearchMode::Search],
            supported_group_by_fields: Vec::new(),
            max_limit: 50,
            default_limit: 10,
            sort_fields: Vec::new(),
            default_ranking: "vector".into(),
            display_label: None,
            alias_hints: Vec::new(),
            freshness_window_days: None,
            latency_tier: Tier::Low,
            quality_tier: Tier::Medium,
            cost_tier: Tier::Low,
            request_routing_args: None,
            entity_extraction_rules: None,
        }
    }

    #[test]
    fn match_sources_ranks_exact_alias_above_partial() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(make_capability("email", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        registry
            .register(make_capability("calendar", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        let router = RetrievalRouter::new(&registry);
        let matches = router.match_sources("check my email inbox", 0.3, 10);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].source, "email");
    }

    #[test]
    fn negation_suppresses_source_match() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(make_capability("calendar", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        let router = RetrievalRouter::new(&registry);
        let matches = router.match_sources("anything not calendar related", 0.3, 10);
        assert!(matches.iter().all(|m| m.source != "calendar"));
    }

    #[test]
    fn select_methods_prefers_structured_with_filters() {
        let registry = CapabilityRegistry::new();
        let router = RetrievalRouter::new(&registry);
        let cap = make_capability("email", &[RetrievalMethod::Structured, RetrievalMethod::Vector], &["from_name"]);
        let filters = vec![FilterClause::new("from_name", FilterOperator::Contains, "alice")];
        let intent = Intent::default();
        let methods = router.select_methods(&cap, "alice's emails", &filters, &intent);
        assert_eq!(methods[0], RetrievalMethod::Structured);
    }

    #[test]
    fn extract_filters_handles_today() {
        let registry = CapabilityRegistry::new();
        let router = RetrievalRouter::new(&registry);
        let mut intent = Intent::default();
        intent.temporal = Some("today".to_string());
        let filters = router.extract_filters(&intent, "emails today", "UTC");
        assert!(filters.iter().any(|f| f.field == "date_after"));
    }

    #[test]
    fn aggregate_downgrades_to_search_without_support() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(make_capability("email", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        let router = RetrievalRouter::new(&registry);
        let mut intent = Intent::default();
        intent.search_mode = SearchMode::Aggregate;
        let (mode, group_by) = router.resolve_mode_and_group_by(&intent, &["email".to_string()]);
        assert_eq!(mode, SearchMode::Search);
        assert!(group_by.is_none());
    }

    #[test]
    fn broad_fallback_marks_used_default_sources() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(make_capability("email", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        registry
            .register(make_capability("calendar", &[RetrievalMethod::Structured], &[]))
            .unwrap();
        let router = RetrievalRouter::new(&registry);
        let intent = Intent::default();
        let plan = router.route(&intent, "xyzzy nonsense query", "UTC");
        assert!(plan.used_default_sources);
        assert!(plan.decisions.len() <= 3);
    }

    #[test]
    fn filters_restricted_to_capability_declared_set() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(make_capability("email", &[RetrievalMethod::Structured], &["from_name"]))
            .unwrap();
        let router = RetrievalRouter::new(&registry);
        let mut intent = Intent::default();
        intent.source_hints = vec!["email".to_string()];
        intent.entities = vec![crate::model::EntityHint {
            role: crate::model::EntityRole::Recipient,
            name: None,
            email: Some("bob@example.com".into()),
        }];
        let plan = router.route(&intent, "emails to bob", "UTC");
        let decision = &plan.decisions[0];
        assert!(decision.filters.iter().all(|f| f.field == "from_name"));
    }
}
