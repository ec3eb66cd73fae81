use std::collections::HashMap;

use serde::Deserialize;

/// Flat name → enabled map, loaded from a JSON file so ops can flip a source or
/// retrieval path off without a redeploy.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct FeatureToggles {
    #[serde(flatten)]
    pub flags: HashMap<String, bool>,
}

impl FeatureToggles {
    pub fn from_path(path: Option<String>) -> Self {
        let default_path = std::env::var("FEATURE_TOGGLES_PATH").unwrap_or_else(|_| "feature-toggles.json".to_string());
        let path = path.unwrap_or(default_path);

        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => FeatureToggles::default(),
        }
    }

    pub fn from_env_path() -> Self {
        Self::from_path(None)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn is_enabled_or(&self, name: &str, default: bool) -> bool {
        self.flags.get(name).copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_toggles() {
        let toggles = FeatureToggles::from_path(Some("/nonexistent/feature-toggles.json".to_string()));
        assert!(!toggles.is_enabled("web_search"));
        assert!(toggles.is_enabled_or("web_search", true));
    }
}
