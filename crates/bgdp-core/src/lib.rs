//! Core domain model for the board game data pipeline.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "bgdp-core";

/// Separator used for every multi-valued attribute column.
pub const LIST_SEPARATOR: &str = "; ";

/// One persisted catalog row.
///
/// `name` and `description` are populated only by the description-focused
/// extraction profile; the catalog profile leaves them empty. Play-time
/// fields stay raw strings because the upstream API reports them as
/// attribute text and downstream consumers do their own coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mechanics: Option<String>,
    pub category: Option<String>,
    pub gametype: Option<String>,
    pub playingtime: Option<String>,
    pub minplaytime: Option<String>,
    pub maxplaytime: Option<String>,
    pub best_numplayers: Option<f64>,
    pub image: Option<String>,
    pub thumbnail: Option<String>,
}

impl GameRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            mechanics: None,
            category: None,
            gametype: None,
            playingtime: None,
            minplaytime: None,
            maxplaytime: None,
            best_numplayers: None,
            image: None,
            thumbnail: None,
        }
    }
}

/// Narrowed projection emitted by the downstream simplify pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameAttributeView {
    pub id: String,
    pub name: String,
    pub mechanics: String,
    pub simple_mechanics: String,
    pub category: String,
    pub simple_category: String,
}

impl GameAttributeView {
    pub fn from_record(
        record: &GameRecord,
        mechanics_map: &AttributeMapping,
        category_map: &AttributeMapping,
    ) -> Self {
        let mechanics = record.mechanics.as_deref().unwrap_or_default();
        let category = record.category.as_deref().unwrap_or_default();
        Self {
            id: record.id.clone(),
            name: record.name.clone().unwrap_or_default(),
            mechanics: mechanics.to_string(),
            simple_mechanics: simplify_list(mechanics, mechanics_map),
            category: category.to_string(),
            simple_category: simplify_list(category, category_map),
        }
    }
}

/// Static raw-value -> canonical-value lookup for one attribute family.
/// Loaded once, read-only afterwards; unknown keys pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMapping {
    entries: HashMap<String, String>,
}

impl AttributeMapping {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, raw: impl Into<String>, canonical: impl Into<String>) {
        self.entries.insert(raw.into(), canonical.into());
    }

    /// Identity fallback for values absent from the table.
    pub fn canonical<'a>(&'a self, raw: &'a str) -> &'a str {
        self.entries.get(raw).map(String::as_str).unwrap_or(raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonicalize one `"; "`-joined list: split, trim, map with identity
/// fallback, then deduplicate preserving first-seen order.
pub fn simplify_list(raw: &str, mapping: &AttributeMapping) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mapped = mapping.canonical(item);
        if seen.insert(mapped.to_string()) {
            out.push(mapped.to_string());
        }
    }
    out.join(LIST_SEPARATOR)
}

/// Fixed blend weights for the hybrid recommendation score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    /// Collaborative vs. content share within the non-LLM term.
    pub alpha: f64,
    /// LLM share of the final blend.
    pub beta: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.33,
        }
    }
}

/// Element-wise weighted blend of the three score vectors:
/// `((cf * alpha) + (cbf * (1 - alpha))) * (1 - beta) + llm * beta`.
///
/// Interface-only by design; trailing elements of longer inputs are
/// ignored so callers own length alignment.
pub fn hybrid_scores(cf: &[f64], cbf: &[f64], llm: &[f64], weights: HybridWeights) -> Vec<f64> {
    let HybridWeights { alpha, beta } = weights;
    cf.iter()
        .zip(cbf.iter())
        .zip(llm.iter())
        .map(|((cf, cbf), llm)| ((cf * alpha) + (cbf * (1.0 - alpha))) * (1.0 - beta) + llm * beta)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mech_map() -> AttributeMapping {
        AttributeMapping::from_pairs([("Dice Rolling", "Luck")])
    }

    #[test]
    fn simplify_maps_then_deduplicates_preserving_order() {
        let out = simplify_list("Dice Rolling; Dice Rolling; Set Collection", &mech_map());
        assert_eq!(out, "Luck; Set Collection");
    }

    #[test]
    fn simplify_identity_fallback_for_unknown_values() {
        let out = simplify_list("Worker Placement; Dice Rolling", &mech_map());
        assert_eq!(out, "Worker Placement; Luck");
    }

    #[test]
    fn simplify_empty_input_yields_empty_string() {
        assert_eq!(simplify_list("", &mech_map()), "");
        assert_eq!(simplify_list("   ", &mech_map()), "");
    }

    #[test]
    fn simplify_trims_ragged_whitespace_around_items() {
        let out = simplify_list("Dice Rolling ;  Set Collection;; ", &mech_map());
        assert_eq!(out, "Luck; Set Collection");
    }

    #[test]
    fn attribute_view_simplifies_both_families() {
        let mut record = GameRecord::new("822");
        record.name = Some("Carcassonne".to_string());
        record.mechanics = Some("Tile Placement; Dice Rolling".to_string());
        record.category = Some("Medieval; City Building".to_string());
        let cats = AttributeMapping::from_pairs([("Medieval", "Historical")]);
        let view = GameAttributeView::from_record(&record, &mech_map(), &cats);
        assert_eq!(view.simple_mechanics, "Tile Placement; Luck");
        assert_eq!(view.simple_category, "Historical; City Building");
        assert_eq!(view.mechanics, "Tile Placement; Dice Rolling");
    }

    #[test]
    fn hybrid_blend_matches_closed_form() {
        let out = hybrid_scores(&[1.0], &[0.0], &[0.5], HybridWeights::default());
        // ((1*0.5) + (0*0.5)) * 0.67 + 0.5 * 0.33
        assert!((out[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn hybrid_blend_is_elementwise() {
        let weights = HybridWeights { alpha: 1.0, beta: 0.0 };
        let out = hybrid_scores(&[0.2, 0.4], &[9.0, 9.0], &[9.0, 9.0], weights);
        assert_eq!(out, vec![0.2, 0.4]);
    }
}
