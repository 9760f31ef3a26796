//! Tag model: normalization, the edit contract, the delta journal, and the
//! implication engine.

mod deltas;
mod implications;
mod repository;

pub use deltas::{
    apply_deltas, clear_deltas, clear_deltas_for_md5, compute_deltas, image_deltas, record_delta,
    DeltaView,
};
pub use implications::{
    ImplicationChain, ImplicationEngine, ImplicationError, ImplicationRule,
    ImplicationSuggestion, PreviewImpact, ReapplyStats, SuggestionPage, SUGGESTION_CACHE_TTL,
};
pub use repository::{EditOutcome, TagRepository};

/// Normalize an externally supplied tag name.
///
/// Lowercases, collapses internal whitespace to underscores, and rewrites the
/// flat `rating_<x>` form to the canonical `rating:<x>`.
pub fn normalize_tag_name(name: &str) -> String {
    let mut normalized = name
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    for rating in ["general", "sensitive", "questionable", "explicit"] {
        let flat = format!("rating_{}", rating);
        if normalized == flat {
            normalized = format!("rating:{}", rating);
            break;
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_tag_name("Blue Hair"), "blue_hair");
        assert_eq!(normalize_tag_name("  solo  "), "solo");
        assert_eq!(normalize_tag_name("rating_explicit"), "rating:explicit");
        assert_eq!(normalize_tag_name("rating:general"), "rating:general");
        // Only the exact flat rating names rewrite
        assert_eq!(normalize_tag_name("rating_chart"), "rating_chart");
    }
}
