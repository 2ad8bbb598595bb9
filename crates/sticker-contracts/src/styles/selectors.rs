use super::registry::{normalize_style_id, StyleRegistry, StyleSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSelection {
    pub style: StyleSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

impl StyleRegistry {
    /// Resolves a requested style id, falling back to the default for unknown
    /// or missing ids.
    pub fn resolve(&self, requested: Option<&str>) -> StyleSelection {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let Some(requested_value) = requested else {
            return StyleSelection {
                style: self.default_style().clone(),
                requested: None,
                fallback_reason: Some("No style specified; using default.".to_string()),
            };
        };

        if let Some(style) = self.get(requested_value) {
            return StyleSelection {
                style: style.clone(),
                requested: Some(requested_value.to_string()),
                fallback_reason: None,
            };
        }

        let default = self.default_style().clone();
        StyleSelection {
            fallback_reason: Some(format!(
                "Unknown style '{}'; using '{}'.",
                normalize_style_id(requested_value),
                default.id
            )),
            style: default,
            requested: Some(requested_value.to_string()),
        }
    }
}
