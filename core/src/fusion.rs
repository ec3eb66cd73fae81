//! Weighted fusion ranker (C6): deduplicates cross-source results and ranks them by a
//! single fused score.

use std::collections::HashMap;

use crate::model::SearchResult;

fn method_weight(method: &str) -> f32 {
    match method {
        "structured" => 1.0,
        "graph" => 0.9,
        "fulltext" => 0.85,
        "vector" => 0.7,
        _ => 0.5,
    }
}

fn source_class_boost(result: &SearchResult, is_personal_query: bool) -> f32 {
    use crate::model::SourceClass;
    if is_personal_query {
        match result.source_class {
            SourceClass::Personal => 1.0,
            SourceClass::Web => 0.8,
        }
    } else {
        match result.source_class {
            SourceClass::Web => 1.0,
            SourceClass::Personal => 0.9,
        }
    }
}

/// Weighted average of a result's per-method scores, scaled by the source-class boost
/// for the current query (personal queries favor personal sources and vice versa).
pub fn compute_fused_score(result: &SearchResult, is_personal_query: bool) -> f32 {
    let mut weighted_sum = 0.0_f32;
    let mut total_weight = 0.0_f32;
    for (method, score) in &result.scores {
        let weight = method_weight(method);
        weighted_sum += score * weight;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return 0.0;
    }
    (weighted_sum / total_weight) * source_class_boost(result, is_personal_query)
}

/// Merges duplicate `(source, id)` results, keeping the max score per method and the
/// union of methods used.
pub fn deduplicate_results(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut merged: HashMap<(String, String), SearchResult> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new();

    for result in results {
        let key = (result.source.clone(), result.id.clone());
        match merged.get_mut(&key) {
            None => {
                order.push(key.clone());
                merged.insert(key, result);
            }
            Some(existing) => {
                for (method, score) in &result.scores {
                    let slot = existing.scores.entry(method.clone()).or_insert(0.0);
                    if *score > *slot {
                        *slot = *score;
                    }
                }
                for method in &result.methods_used {
                    if !existing.methods_used.contains(method) {
                        existing.methods_used.push(method.clone());
                    }
                }
                if existing.snippet.is_empty() && !result.snippet.is_empty() {
                    existing.snippet = result.snippet;
                }
                if existing.provenance.is_none() {
                    existing.provenance = result.provenance;
                }
            }
        }
    }

    order.into_iter().filter_map(|key| merged.remove(&key)).collect()
}

/// Deduplicates, scores, and ranks results from possibly-overlapping sources into one
/// ordered list, breaking score ties deterministically by `(source, id)`.
pub struct FusionRanker;

impl FusionRanker {
    pub fn new() -> Self {
        Self
    }

    pub fn fuse_and_rank(&self, results: Vec<SearchResult>, is_personal_query: bool, max_results: usize) -> Vec<SearchResult> {
        let input_count = results.len();
        let deduped = deduplicate_results(results);
        let deduped_count = deduped.len();

        let mut scored: Vec<(f32, SearchResult)> = deduped
            .into_iter()
            .map(|r| (compute_fused_score(&r, is_personal_query), r))
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap()
                .then(a.source.cmp(&b.source))
                .then(a.id.cmp(&b.id))
        });

        scored.truncate(max_results);

        tracing::info!(input_count, deduped_count, ranked_count = scored.len(), "fused and ranked results");

        scored.into_iter().map(|(_, r)| r).collect()
    }
}

impl Default for FusionRanker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceClass;
    use std::collections::HashMap;

    fn make_result(source: &str, id: &str, class: SourceClass, scores: &[(&str, f32)]) -> SearchResult {
        let mut score_map = HashMap::new();
        let mut methods = Vec::new();
        for (method, score) in scores {
            score_map.insert(method.to_string(), *score);
            methods.push(method.to_string());
        }
        SearchResult {
            id: id.to_string(),
            source: source.to_string(),
            source_class: class,
            title: String::new(),
            snippet: String::new(),
            timestamp: None,
            scores: score_map,
            methods_used: methods,
            metadata: HashMap::new(),
            provenance: None,
        }
    }

    #[test]
    fn compute_fused_score_weights_structured_above_vector() {
        let structured = make_result("email", "1", SourceClass::Personal, &[("structured", 0.6)]);
        let vector = make_result("email", "2", SourceClass::Personal, &[("vector", 0.6)]);
        assert!(compute_fused_score(&structured, true) > compute_fused_score(&vector, true));
    }

    #[test]
    fn personal_query_boosts_personal_sources() {
        let personal = make_result("email", "1", SourceClass::Personal, &[("fulltext", 0.5)]);
        let web = make_result("web", "1", SourceClass::Web, &[("fulltext", 0.5)]);
        assert!(compute_fused_score(&personal, true) > compute_fused_score(&web, true));
    }

    #[test]
    fn web_query_boosts_web_sources() {
        let personal = make_result("email", "1", SourceClass::Personal, &[("fulltext", 0.5)]);
        let web = make_result("web", "1", SourceClass::Web, &[("fulltext", 0.5)]);
        assert!(compute_fused_score(&web, false) > compute_fused_score(&personal, false));
    }

    #[test]
    fn deduplicate_merges_scores_and_methods() {
        let a = make_result("email", "1", SourceClass::Personal, &[("structured", 0.4)]);
        let b = make_result("email", "1", SourceClass::Personal, &[("vector", 0.9)]);
        let merged = deduplicate_results(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].scores.get("structured"), Some(&0.4));
        assert_eq!(merged[0].scores.get("vector"), Some(&0.9));
        assert_eq!(merged[0].methods_used.len(), 2);
    }

    #[test]
    fn ties_break_by_source_then_id() {
        let a = make_result("calendar", "1", SourceClass::Personal, &[("structured", 0.5)]);
        let b = make_result("email", "1", SourceClass::Personal, &[("structured", 0.5)]);
        let ranker = FusionRanker::new();
        let ranked = ranker.fuse_and_rank(vec![b, a], true, 10);
        assert_eq!(ranked[0].source, "calendar");
        assert_eq!(ranked[1].source, "email");
    }

    #[test]
    fn max_results_truncates() {
        let results = (0..5)
            .map(|i| make_result("email", &i.to_string(), SourceClass::Personal, &[("vector", 0.5)]))
            .collect();
        let ranker = FusionRanker::new();
        let ranked = ranker.fuse_and_rank(results, true, 2);
        assert_eq!(ranked.len(), 2);
    }
}
