//! Deterministic intent analyzer (C5): turns a raw query plus router source matches
//! into a structured [`Intent`] without invoking a language model, gated by a
//! confidence threshold below which callers should fall back to an LM.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{EntityHint, EntityRole, Intent, IntentComplexity, SearchMode, SourceMatch};

const SOURCE_THRESHOLD: f32 = 0.55;
const AGG_THRESHOLD: f32 = 0.55;

/// One extractor's output: a value plus how confident the extractor is in it and why.
#[derive(Debug, Clone)]
pub struct ExtractorSignal<T> {
    pub value: T,
    pub confidence: f32,
    pub reasons: Vec<String>,
}

impl<T> ExtractorSignal<T> {
    fn new(value: T, confidence: f32, reasons: Vec<String>) -> Self {
        Self { value, confidence, reasons }
    }
}

/// Full output of one deterministic analysis pass, including the gate decision.
#[derive(Debug, Clone)]
pub struct DeterministicIntentResult {
    pub intent: Intent,
    pub aggregate_confidence: f32,
    pub extractor_confidence: ExtractorConfidence,
    pub extractor_reasons: ExtractorReasons,
    pub should_use_deterministic: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfidence {
    pub source: f32,
    pub temporal: f32,
    pub entities: f32,
    pub query_type: f32,
}

#[derive(Debug, Clone)]
pub struct ExtractorReasons {
    pub source: Vec<String>,
    pub temporal: Vec<String>,
    pub entities: Vec<String>,
    pub query_type: Vec<String>,
}

impl DeterministicIntentResult {
    /// Renders a structured trace suitable for [`crate::model::ResponseMeta::intent_trace`].
    pub fn trace(&self) -> serde_json::Value {
        serde_json::json!({
            "aggregate_confidence": self.aggregate_confidence,
            "should_use_deterministic": self.should_use_deterministic,
            "source": {"confidence": self.extractor_confidence.source, "reasons": self.extractor_reasons.source},
            "temporal": {"confidence": self.extractor_confidence.temporal, "reasons": self.extractor_reasons.temporal},
            "entities": {"confidence": self.extractor_confidence.entities, "reasons": self.extractor_reasons.entities},
            "query_type": {"confidence": self.extractor_confidence.query_type, "reasons": self.extractor_reasons.query_type},
        })
    }
}

static TEMPORAL_PATTERNS: Lazy<Vec<(Regex, &'static str, f32)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\bmost recent\b").unwrap(), "most recent", 0.9),
        (Regex::new(r"(?i)\blatest\b").unwrap(), "latest", 0.9),
        (Regex::new(r"(?i)\brecently\b").unwrap(), "recently", 0.85),
        (Regex::new(r"(?i)\brecent\b").unwrap(), "recent", 0.8),
        (Regex::new(r"(?i)\btoday\b").unwrap(), "today", 1.0),
        (Regex::new(r"(?i)\byesterday\b").unwrap(), "yesterday", 1.0),
        (Regex::new(r"(?i)\bthis week\b").unwrap(), "this week", 0.95),
        (Regex::new(r"(?i)\blast week\b").unwrap(), "last week", 0.95),
        (Regex::new(r"(?i)\bthis month\b").unwrap(), "this month", 0.95),
        (Regex::new(r"(?i)\blast month\b").unwrap(), "last month", 0.95),
    ]
});

static FROM_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bfrom\s+([\w.+-]+@[\w.-]+|[A-Za-z][\w' .-]{1,40})").unwrap());
static TO_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bto\s+([\w.+-]+@[\w.-]+|[A-Za-z][\w' .-]{1,40})").unwrap());
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.+-]+@[\w.-]+$").unwrap());

static COUNT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(count|how many|number of|total)\b").unwrap());
static AGGREGATE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(top|breakdown|grouped|group by|per)\b").unwrap());

/// Deterministically derives structured intent from a query and the router's source
/// match trace, without calling a language model.
pub struct DeterministicIntentAnalyzer;

impl DeterministicIntentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// `fast_path_intent` carries a pre-computed multi-hop retrieval plan (if any),
    /// usually produced by a cheap rule-based pre-pass upstream of the analyzer.
    pub fn analyze(
        &self,
        query: &str,
        source_matches: &[SourceMatch],
        fast_path_intent: Option<&Intent>,
    ) -> DeterministicIntentResult {
        let source_signal = self.extract_source_hints(source_matches);
        let temporal_signal = self.extract_temporal(query);
        let entity_signal = self.extract_entities(query);
        let query_type_signal = self.extract_query_type(query);

        let mut source_confidence = source_signal.confidence;
        let mut source_reasons = source_signal.reasons.clone();
        let mut complexity = IntentComplexity::Simple;
        let mut retrieval_plan = None;

        if let Some(fast_path) = fast_path_intent {
            if fast_path.retrieval_plan.is_some() {
                source_confidence = source_confidence.max(0.7);
                source_reasons.push("fast_path:retrieval_plan".to_string());
                complexity = IntentComplexity::MultiHop;
                retrieval_plan = fast_path.retrieval_plan.clone();
            }
        }

        let aggregate_confidence = (source_confidence * 0.45
            + query_type_signal.confidence * 0.25
            + temporal_signal.confidence * 0.15
            + entity_signal.confidence * 0.15)
            .min(1.0);
        let aggregate_confidence = (aggregate_confidence * 1000.0).round() / 1000.0;

        let should_use_deterministic = source_confidence >= SOURCE_THRESHOLD || aggregate_confidence >= AGG_THRESHOLD;

        let (search_mode, aggregate_group_by, aggregate_top_n) = match query_type_signal.value {
            QueryType::Count => (SearchMode::Count, None, 10),
            QueryType::Aggregate => (SearchMode::Aggregate, None, 10),
            QueryType::Search => (SearchMode::Search, None, 10),
        };

        let intent = Intent {
            label: "find_information".to_string(),
            entities: entity_signal.value,
            temporal: temporal_signal.value,
            source_hints: source_signal.value,
            complexity,
            retrieval_plan,
            search_mode,
            aggregate_group_by,
            aggregate_top_n,
        };

        DeterministicIntentResult {
            intent,
            aggregate_confidence,
            extractor_confidence: ExtractorConfidence {
                source: source_confidence,
                temporal: temporal_signal.confidence,
                entities: entity_signal.confidence,
                query_type: query_type_signal.confidence,
            },
            extractor_reasons: ExtractorReasons {
                source: source_reasons,
                temporal: temporal_signal.reasons,
                entities: entity_signal.reasons,
                query_type: query_type_signal.reasons,
            },
            should_use_deterministic,
        }
    }

    fn extract_source_hints(&self, source_matches: &[SourceMatch]) -> ExtractorSignal<Vec<String>> {
        if source_matches.is_empty() {
            return ExtractorSignal::new(Vec::new(), 0.0, Vec::new());
        }
        let mut sorted: Vec<&SourceMatch> = source_matches.iter().collect();
        sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap().then(a.source.cmp(&b.source)));

        let confidence = sorted.iter().map(|m| m.confidence).fold(0.0_f32, f32::max).min(1.0);
        let reasons = sorted.iter().take(3).map(|m| format!("{}:{:.2}", m.source, m.confidence)).collect();
        let sources = sorted.into_iter().map(|m| m.source.clone()).collect();
        ExtractorSignal::new(sources, confidence, reasons)
    }

    fn extract_temporal(&self, query: &str) -> ExtractorSignal<Option<String>> {
        for (pattern, label, confidence) in TEMPORAL_PATTERNS.iter() {
            if pattern.is_match(query) {
                return ExtractorSignal::new(Some(label.to_string()), *confidence, vec![format!("matched:{label}")]);
            }
        }
        ExtractorSignal::new(None, 0.0, Vec::new())
    }

    fn extract_entities(&self, query: &str) -> ExtractorSignal<Vec<EntityHint>> {
        let mut entities = Vec::new();
        let mut confidence = 0.0_f32;
        let mut reasons = Vec::new();

        if let Some(caps) = FROM_PATTERN.captures(query) {
            let raw = caps.get(1).unwrap().as_str().trim().to_string();
            let is_email = EMAIL_PATTERN.is_match(&raw);
            let (name, email) = if is_email { (None, Some(raw.clone())) } else { (Some(raw.clone()), None) };
            let c = if is_email { 0.9 } else { 0.75 };
            confidence = confidence.max(c);
            reasons.push(format!("from:{raw}"));
            entities.push(EntityHint { role: EntityRole::Sender, name, email });
        }
        if let Some(caps) = TO_PATTERN.captures(query) {
            let raw = caps.get(1).unwrap().as_str().trim().to_string();
            let is_email = EMAIL_PATTERN.is_match(&raw);
            let (name, email) = if is_email { (None, Some(raw.clone())) } else { (Some(raw.clone()), None) };
            let c = if is_email { 0.9 } else { 0.75 };
            confidence = confidence.max(c);
            reasons.push(format!("to:{raw}"));
            entities.push(EntityHint { role: EntityRole::Recipient, name, email });
        }

        ExtractorSignal::new(entities, confidence, reasons)
    }

    fn extract_query_type(&self, query: &str) -> ExtractorSignal<QueryType> {
        if query.trim().is_empty() {
            return ExtractorSignal::new(QueryType::Search, 0.0, Vec::new());
        }
        if COUNT_PATTERN.is_match(query) {
            return ExtractorSignal::new(QueryType::Count, 0.95, vec!["matched:count".to_string()]);
        }
        if AGGREGATE_PATTERN.is_match(query) {
            return ExtractorSignal::new(QueryType::Aggregate, 0.8, vec!["matched:aggregate".to_string()]);
        }
        ExtractorSignal::new(QueryType::Search, 0.45, Vec::new())
    }
}

impl Default for DeterministicIntentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryType {
    Search,
    Count,
    Aggregate,
}
