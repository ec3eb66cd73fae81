//! Entity extractor (C7): turns prior-step result metadata into filter-ready entity
//! hints for the next hop of a multi-hop plan, falling back to an LM only when the
//! capability-declared metadata rules yield nothing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Capability, EntityParser, FilterClause, FilterOperator, SearchResult};

static NAME_EMAIL_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:(.+?)\s*<([^>]+)>|(.+))$").unwrap());
static LLM_NAME_EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)\s*\(([^)]+)\)$").unwrap());

/// One entity extracted from a result's metadata or an LM fallback response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedEntity {
    pub from_name: Option<String>,
    pub from_email: Option<String>,
}

impl ExtractedEntity {
    pub fn is_empty(&self) -> bool {
        self.from_name.is_none() && self.from_email.is_none()
    }

    /// Renders this entity as `contains` filters on `from_name`/`from_email`.
    pub fn to_filters(&self) -> Vec<FilterClause> {
        let mut filters = Vec::new();
        if let Some(name) = &self.from_name {
            filters.push(FilterClause::new("from_name", FilterOperator::Contains, name.as_str()));
        }
        if let Some(email) = &self.from_email {
            filters.push(FilterClause::new("from_email", FilterOperator::Contains, email.as_str()));
        }
        filters
    }
}

/// Extracts entity hints from the metadata a prior-step result carries, guided by the
/// target source capability's declared [`crate::model::EntityExtractionRule`]s.
pub struct EntityExtractor;

impl EntityExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Tries every declared rule against `result.metadata` in order, stopping at the
    /// first rule that yields a non-empty entity.
    pub fn extract_from_metadata(&self, result: &SearchResult, capability: &Capability) -> ExtractedEntity {
        let Some(rules) = &capability.entity_extraction_rules else {
            return ExtractedEntity::default();
        };

        for rule in rules {
            let Some(raw) = result.metadata.get(&rule.metadata_key).and_then(|v| v.as_str()) else {
                continue;
            };
            if raw.trim().is_empty() {
                continue;
            }

            let entity = match rule.parser {
                EntityParser::String => apply_to_target(&rule.target_field, raw.trim()),
                EntityParser::EmailFromHeader => parse_email_from_header(raw),
            };
            if !entity.is_empty() {
                return entity;
            }
        }
        ExtractedEntity::default()
    }

    /// Parses an LM's free-text answer about who a result is "from". Recognizes
    /// `Name (email)`, a plain name, or an explicit "none" sentinel.
    pub fn parse_llm_response(&self, raw: &str) -> ExtractedEntity {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > 200 {
            return ExtractedEntity::default();
        }
        let lowered = trimmed.to_lowercase();
        if lowered == "none" || lowered == "unknown" {
            return ExtractedEntity::default();
        }

        if let Some(caps) = LLM_NAME_EMAIL.captures(trimmed) {
            let name = caps.get(1).unwrap().as_str().trim().to_string();
            let email = caps.get(2).unwrap().as_str().trim().to_string();
            return ExtractedEntity {
                from_name: if name.is_empty() { None } else { Some(name) },
                from_email: if email.is_empty() { None } else { Some(email) },
            };
        }

        ExtractedEntity { from_name: Some(trimmed.to_string()), from_email: None }
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_to_target(target_field: &str, raw: &str) -> ExtractedEntity {
    match target_field {
        "from_email" => ExtractedEntity { from_name: None, from_email: Some(raw.to_string()) },
        _ => ExtractedEntity { from_name: Some(raw.to_string()), from_email: None },
    }
}

fn parse_email_from_header(raw: &str) -> ExtractedEntity {
    let Some(caps) = NAME_EMAIL_HEADER.captures(raw.trim()) else {
        return ExtractedEntity::default();
    };
    if let (Some(name), Some(email)) = (caps.get(1), caps.get(2)) {
        return ExtractedEntity {
            from_name: Some(name.as_str().trim().to_string()),
            from_email: Some(email.as_str().trim().to_string()),
        };
    }
    if let Some(bare) = caps.get(3) {
        let bare = bare.as_str().trim();
        if bare.contains('@') {
            return ExtractedEntity { from_name: None, from_email: Some(bare.to_string()) };
        }
        return ExtractedEntity { from_name: Some(bare.to_string()), from_email: None };
    }
    ExtractedEntity::default()
}
