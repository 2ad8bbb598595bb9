use indexmap::IndexMap;

pub const DEFAULT_STYLE_ID: &str = "cartoon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSpec {
    pub id: String,
    pub label: String,
    /// Fragment appended to the generation prompt.
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct StyleRegistry {
    styles: IndexMap<String, StyleSpec>,
    default: StyleSpec,
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StyleRegistry {
    /// The first style in `styles` becomes the default when a custom table is
    /// given. Custom keys and ids are normalized the same way lookups are.
    pub fn new(styles: Option<IndexMap<String, StyleSpec>>) -> Self {
        if let Some(custom) = styles {
            let styles: IndexMap<String, StyleSpec> = custom
                .into_iter()
                .map(|(key, mut style)| {
                    let key = normalize_style_id(&key);
                    style.id = key.clone();
                    (key, style)
                })
                .collect();
            if let Some(default) = styles.values().next().cloned() {
                return Self { styles, default };
            }
        }
        let styles = default_styles();
        let default = styles
            .get(DEFAULT_STYLE_ID)
            .cloned()
            .unwrap_or_else(fallback_style);
        Self { styles, default }
    }

    pub fn get(&self, id: &str) -> Option<&StyleSpec> {
        self.styles.get(&normalize_style_id(id))
    }

    pub fn default_style(&self) -> &StyleSpec {
        &self.default
    }

    pub fn list(&self) -> impl Iterator<Item = &StyleSpec> {
        self.styles.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.styles.keys().cloned().collect()
    }
}

pub(super) fn normalize_style_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['_', ' '], "-")
}

fn fallback_style() -> StyleSpec {
    StyleSpec {
        id: DEFAULT_STYLE_ID.to_string(),
        label: "Cartoon".to_string(),
        prompt: "bold cartoon illustration".to_string(),
    }
}

fn default_styles() -> IndexMap<String, StyleSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, label: &str, prompt: &str| {
        map.insert(
            id.to_string(),
            StyleSpec {
                id: id.to_string(),
                label: label.to_string(),
                prompt: prompt.to_string(),
            },
        );
    };

    insert(
        "cartoon",
        "Cartoon",
        "bold cartoon illustration, thick clean outlines, flat vibrant colors, playful proportions",
    );
    insert(
        "anime",
        "Anime",
        "anime style, cel shading, expressive eyes, crisp line art",
    );
    insert(
        "pixel-art",
        "Pixel Art",
        "retro 32-bit pixel art, limited palette, hard pixel edges, no dithering noise",
    );
    insert(
        "watercolor",
        "Watercolor",
        "soft watercolor painting, gentle washes, soft bleeding pigment edges",
    );
    insert(
        "3d-clay",
        "3D Clay",
        "cute 3D claymation render, soft studio lighting, rounded tactile shapes",
    );
    insert(
        "kawaii",
        "Kawaii",
        "kawaii chibi style, pastel colors, oversized head, blushing cheeks",
    );
    insert(
        "line-art",
        "Line Art",
        "minimal monoline line art, white strokes, no fill shading",
    );

    map
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{StyleRegistry, StyleSpec, DEFAULT_STYLE_ID};

    #[test]
    fn builtin_registry_defaults_to_cartoon() {
        let registry = StyleRegistry::default();
        assert_eq!(registry.default_style().id, DEFAULT_STYLE_ID);
        assert_eq!(registry.ids().first().map(String::as_str), Some("cartoon"));
        assert_eq!(registry.list().count(), 7);
    }

    #[test]
    fn lookup_normalizes_case_and_separators() {
        let registry = StyleRegistry::default();
        assert_eq!(
            registry.get("Pixel_Art").map(|style| style.id.as_str()),
            Some("pixel-art")
        );
        assert_eq!(
            registry.get(" 3D clay ").map(|style| style.id.as_str()),
            Some("3d-clay")
        );
        assert!(registry.get("oil-painting").is_none());
    }

    #[test]
    fn custom_table_uses_first_entry_as_default() {
        let mut styles = IndexMap::new();
        styles.insert(
            "mono".to_string(),
            StyleSpec {
                id: "mono".to_string(),
                label: "Mono".to_string(),
                prompt: "black and white".to_string(),
            },
        );
        let registry = StyleRegistry::new(Some(styles));
        assert_eq!(registry.default_style().id, "mono");

        let fallback = StyleRegistry::new(Some(IndexMap::new()));
        assert_eq!(fallback.default_style().id, DEFAULT_STYLE_ID);
    }

    #[test]
    fn custom_keys_resolve_regardless_of_case() {
        let mut styles = IndexMap::new();
        styles.insert(
            "Neon Glow".to_string(),
            StyleSpec {
                id: "Neon Glow".to_string(),
                label: "Neon Glow".to_string(),
                prompt: "glowing neon outlines".to_string(),
            },
        );
        let registry = StyleRegistry::new(Some(styles));

        let style = registry.get("neon_glow").map(|style| style.id.as_str());
        assert_eq!(style, Some("neon-glow"));
        assert_eq!(registry.get("NEON GLOW").map(|style| style.label.as_str()), Some("Neon Glow"));
        assert_eq!(registry.ids(), vec!["neon-glow".to_string()]);
    }
}
