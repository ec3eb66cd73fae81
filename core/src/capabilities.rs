//! Capability registry (C1): caches per-source metadata used for every routing decision.
//!
//! Capabilities are registered once at startup — either from discovery via the MCP
//! dispatcher's `fetch_capabilities`, or directly for in-process backends — and are
//! never mutated during a search.

use std::collections::HashMap;

use crate::error::{SearchCoreError, SearchCoreResult};
use crate::model::{Capability, SourceClass};

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

/// Stores and queries search capabilities across all backends.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers one capability. Last `register` wins for a given
    /// `source_name` (I6: tiers are required by the type system already; this also
    /// rejects empty aliases and non-positive freshness windows per the design).
    pub fn register(&mut self, capability: Capability) -> SearchCoreResult<()> {
        if capability.alias_hints.iter().any(|a| a.trim().is_empty()) {
            return Err(SearchCoreError::RegistryValidation(format!(
                "source '{}' has an empty alias_hints entry",
                capability.source_name
            )));
        }
        if let Some(days) = capability.freshness_window_days {
            if days == 0 {
                return Err(SearchCoreError::RegistryValidation(format!(
                    "source '{}' has non-positive freshness_window_days",
                    capability.source_name
                )));
            }
        }

        let mut capability = capability;
        capability.alias_hints = normalize_aliases(&capability.alias_hints);

        tracing::info!(
            source = %capability.source_name,
            methods = ?capability.supported_methods,
            filters = ?capability.supported_filters.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "registered capability"
        );
        self.capabilities.insert(capability.source_name.clone(), capability);
        Ok(())
    }

    /// Accepts either a single-source payload or `{"sources": [...]}`, matching what
    /// real MCP backends disagree on in practice.
    pub fn register_from_payload(&mut self, payload: serde_json::Value) -> SearchCoreResult<()> {
        if let Some(sources) = payload.get("sources").and_then(|v| v.as_array()) {
            for entry in sources {
                let cap: Capability = serde_json::from_value(entry.clone()).map_err(|e| {
                    SearchCoreError::RegistryValidation(format!("invalid capability entry: {e}"))
                })?;
                self.register(cap)?;
            }
            Ok(())
        } else {
            let cap: Capability = serde_json::from_value(payload).map_err(|e| {
                SearchCoreError::RegistryValidation(format!("invalid capability payload: {e}"))
            })?;
            self.register(cap)
        }
    }

    pub fn get(&self, source_name: &str) -> Option<&Capability> {
        self.capabilities.get(source_name)
    }

    pub fn all_sources(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// Display labels for all sources, sorted by source name: `display_label` when
    /// set and non-blank, else the humanized source name.
    pub fn source_labels_for_agent(&self) -> Vec<String> {
        let mut names: Vec<&String> = self.capabilities.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let cap = &self.capabilities[name];
                match &cap.display_label {
                    Some(label) if !label.trim().is_empty() => label.trim().to_string(),
                    _ => humanize_source_name(name),
                }
            })
            .collect()
    }

    pub fn personal_sources(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(_, caps)| caps.source_class == SourceClass::Personal)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn web_sources(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(_, caps)| caps.source_class == SourceClass::Web)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn sources_supporting_method(&self, method: crate::model::RetrievalMethod) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(_, caps)| caps.supported_methods.contains(&method))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn sources_supporting_filter(&self, filter_name: &str) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(_, caps)| caps.supported_filters.iter().any(|f| f.name == filter_name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn can_handle(&self, source_name: &str, method: crate::model::RetrievalMethod) -> bool {
        self.capabilities
            .get(source_name)
            .is_some_and(|caps| caps.supported_methods.contains(&method))
    }

    /// Defaults to `["search"]` when a capability declares no explicit modes, mirroring
    /// the fallback the original capability-discovery path relies on.
    pub fn supports_mode(&self, source_name: &str, mode: crate::model::SearchMode) -> bool {
        match self.capabilities.get(source_name) {
            None => false,
            Some(caps) if caps.supported_modes.is_empty() => mode == crate::model::SearchMode::Search,
            Some(caps) => caps.supported_modes.contains(&mode),
        }
    }

    pub fn supports_group_by(&self, source_name: &str, field: &str) -> bool {
        self.capabilities
            .get(source_name)
            .is_some_and(|caps| caps.supported_group_by_fields.iter().any(|f| f == field))
    }
}

fn normalize_aliases(aliases: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for alias in aliases {
        let normalized = alias.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}
