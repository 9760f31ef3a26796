//! Catalog record types
//!
//! The core entities persisted by the catalog store: images, tags, the
//! image/tag relation, relations between images, and the retained raw
//! per-source metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TAG CATEGORIES
// ============================================================================

/// Base tag categories
///
/// The six editable categories plus `rating`, which is reserved for the
/// `rating:*` tags and is never exposed as an editable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagCategory {
    Character,
    Copyright,
    Artist,
    Species,
    Meta,
    General,
    Rating,
}

impl Default for TagCategory {
    fn default() -> Self {
        TagCategory::General
    }
}

impl TagCategory {
    /// The six categories backed by denormalized columns on the image row.
    pub const DENORMALIZED: [TagCategory; 6] = [
        TagCategory::Character,
        TagCategory::Copyright,
        TagCategory::Artist,
        TagCategory::Species,
        TagCategory::Meta,
        TagCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagCategory::Character => "character",
            TagCategory::Copyright => "copyright",
            TagCategory::Artist => "artist",
            TagCategory::Species => "species",
            TagCategory::Meta => "meta",
            TagCategory::General => "general",
            TagCategory::Rating => "rating",
        }
    }

    /// Parse from a stored name, defaulting unknown values to `general`.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "character" => TagCategory::Character,
            "copyright" => TagCategory::Copyright,
            "artist" => TagCategory::Artist,
            "species" => TagCategory::Species,
            "meta" => TagCategory::Meta,
            "rating" => TagCategory::Rating,
            _ => TagCategory::General,
        }
    }

    /// Denormalized column name on the images table (`None` for rating).
    pub fn column(&self) -> Option<&'static str> {
        match self {
            TagCategory::Character => Some("tags_character"),
            TagCategory::Copyright => Some("tags_copyright"),
            TagCategory::Artist => Some("tags_artist"),
            TagCategory::Species => Some("tags_species"),
            TagCategory::Meta => Some("tags_meta"),
            TagCategory::General => Some("tags_general"),
            TagCategory::Rating => None,
        }
    }

    /// Merge priority when the same tag arrives from several sources with
    /// conflicting categories: character > species > copyright > artist >
    /// meta > general.
    pub fn merge_priority(&self) -> u8 {
        match self {
            TagCategory::Character => 6,
            TagCategory::Species => 5,
            TagCategory::Copyright => 4,
            TagCategory::Artist => 3,
            TagCategory::Meta => 2,
            TagCategory::General => 1,
            TagCategory::Rating => 0,
        }
    }
}

impl std::fmt::Display for TagCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EXTENDED CATEGORIES
// ============================================================================

/// Extended semantic axes for general tags
///
/// Assigned by the recategorization pass and used by the tag-similarity
/// weights and the implication correlation miner's allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedCategory {
    SubjectCount,
    BodyPhysique,
    BodyHair,
    BodyFace,
    BodyGenitalia,
    AttireMain,
    AttireInner,
    AttireLegwear,
    AttireAcc,
    Action,
    Pose,
    Expression,
    SexualAct,
    Object,
    Setting,
    Framing,
    Focus,
    StyleArt,
    StyleTech,
    MetaAttributes,
    MetaText,
    Status,
}

impl ExtendedCategory {
    pub const ALL: [ExtendedCategory; 22] = [
        ExtendedCategory::SubjectCount,
        ExtendedCategory::BodyPhysique,
        ExtendedCategory::BodyHair,
        ExtendedCategory::BodyFace,
        ExtendedCategory::BodyGenitalia,
        ExtendedCategory::AttireMain,
        ExtendedCategory::AttireInner,
        ExtendedCategory::AttireLegwear,
        ExtendedCategory::AttireAcc,
        ExtendedCategory::Action,
        ExtendedCategory::Pose,
        ExtendedCategory::Expression,
        ExtendedCategory::SexualAct,
        ExtendedCategory::Object,
        ExtendedCategory::Setting,
        ExtendedCategory::Framing,
        ExtendedCategory::Focus,
        ExtendedCategory::StyleArt,
        ExtendedCategory::StyleTech,
        ExtendedCategory::MetaAttributes,
        ExtendedCategory::MetaText,
        ExtendedCategory::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedCategory::SubjectCount => "00_Subject_Count",
            ExtendedCategory::BodyPhysique => "01_Body_Physique",
            ExtendedCategory::BodyHair => "02_Body_Hair",
            ExtendedCategory::BodyFace => "03_Body_Face",
            ExtendedCategory::BodyGenitalia => "04_Body_Genitalia",
            ExtendedCategory::AttireMain => "05_Attire_Main",
            ExtendedCategory::AttireInner => "06_Attire_Inner",
            ExtendedCategory::AttireLegwear => "07_Attire_Legwear",
            ExtendedCategory::AttireAcc => "08_Attire_Acc",
            ExtendedCategory::Action => "09_Action",
            ExtendedCategory::Pose => "10_Pose",
            ExtendedCategory::Expression => "11_Expression",
            ExtendedCategory::SexualAct => "12_Sexual_Act",
            ExtendedCategory::Object => "13_Object",
            ExtendedCategory::Setting => "14_Setting",
            ExtendedCategory::Framing => "15_Framing",
            ExtendedCategory::Focus => "16_Focus",
            ExtendedCategory::StyleArt => "17_Style_Art",
            ExtendedCategory::StyleTech => "18_Style_Tech",
            ExtendedCategory::MetaAttributes => "19_Meta_Attributes",
            ExtendedCategory::MetaText => "20_Meta_Text",
            ExtendedCategory::Status => "21_Status",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

// ============================================================================
// RATINGS
// ============================================================================

/// Content rating, normalized from the single-letter codes the boorus use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    General,
    Sensitive,
    Questionable,
    Explicit,
    Unknown,
}

impl Rating {
    /// Map a source rating code (`g`/`s`/`q`/`e`, or a full word) to a rating.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "g" | "general" | "safe" => Rating::General,
            "s" | "sensitive" => Rating::Sensitive,
            "q" | "questionable" => Rating::Questionable,
            "e" | "explicit" => Rating::Explicit,
            _ => Rating::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::General => "general",
            Rating::Sensitive => "sensitive",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
            Rating::Unknown => "unknown",
        }
    }

    /// The tag name this rating is stored under, e.g. `rating:general`.
    pub fn tag_name(&self) -> String {
        format!("rating:{}", self.as_str())
    }
}

// ============================================================================
// TAG ORIGIN
// ============================================================================

/// How an (image, tag) tuple came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOrigin {
    Original,
    Implication,
    AiInference,
}

impl TagOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagOrigin::Original => "original",
            TagOrigin::Implication => "implication",
            TagOrigin::AiInference => "ai_inference",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "implication" => TagOrigin::Implication,
            "ai_inference" => TagOrigin::AiInference,
            _ => TagOrigin::Original,
        }
    }
}

// ============================================================================
// CATEGORIZED TAG SETS
// ============================================================================

/// A full categorized tag set for one image, one list per editable category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorizedTags {
    #[serde(default)]
    pub character: Vec<String>,
    #[serde(default)]
    pub copyright: Vec<String>,
    #[serde(default)]
    pub artist: Vec<String>,
    #[serde(default)]
    pub species: Vec<String>,
    #[serde(default)]
    pub meta: Vec<String>,
    #[serde(default)]
    pub general: Vec<String>,
}

impl CategorizedTags {
    pub fn is_empty(&self) -> bool {
        TagCategory::DENORMALIZED
            .iter()
            .all(|c| self.category(*c).is_empty())
    }

    pub fn category(&self, category: TagCategory) -> &[String] {
        match category {
            TagCategory::Character => &self.character,
            TagCategory::Copyright => &self.copyright,
            TagCategory::Artist => &self.artist,
            TagCategory::Species => &self.species,
            TagCategory::Meta => &self.meta,
            TagCategory::General | TagCategory::Rating => &self.general,
        }
    }

    pub fn category_mut(&mut self, category: TagCategory) -> &mut Vec<String> {
        match category {
            TagCategory::Character => &mut self.character,
            TagCategory::Copyright => &mut self.copyright,
            TagCategory::Artist => &mut self.artist,
            TagCategory::Species => &mut self.species,
            TagCategory::Meta => &mut self.meta,
            TagCategory::General | TagCategory::Rating => &mut self.general,
        }
    }

    /// Iterate all (category, tag) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (TagCategory, &str)> {
        TagCategory::DENORMALIZED.into_iter().flat_map(move |c| {
            self.category(c).iter().map(move |t| (c, t.as_str()))
        })
    }

    /// Total tag count across categories.
    pub fn len(&self) -> usize {
        TagCategory::DENORMALIZED
            .iter()
            .map(|c| self.category(*c).len())
            .sum()
    }

    /// Drop from `general` any tag already present in a specific category,
    /// then sort and dedupe each list.
    pub fn normalize(&mut self) {
        use std::collections::BTreeSet;
        let specific: BTreeSet<String> = [
            &self.character,
            &self.copyright,
            &self.artist,
            &self.species,
            &self.meta,
        ]
        .iter()
        .flat_map(|v| v.iter().cloned())
        .collect();
        self.general.retain(|t| !specific.contains(t));
        for c in TagCategory::DENORMALIZED {
            let list = self.category_mut(c);
            list.sort();
            list.dedup();
        }
    }

    /// Parse from the six space-separated denormalized strings.
    pub fn from_strings(
        character: &str,
        copyright: &str,
        artist: &str,
        species: &str,
        meta: &str,
        general: &str,
    ) -> Self {
        fn split(s: &str) -> Vec<String> {
            s.split_whitespace().map(str::to_string).collect()
        }
        Self {
            character: split(character),
            copyright: split(copyright),
            artist: split(artist),
            species: split(species),
            meta: split(meta),
            general: split(general),
        }
    }

    /// Render one category as its sorted, space-separated column value.
    pub fn column_value(&self, category: TagCategory) -> String {
        let mut tags: Vec<&str> = self.category(category).iter().map(String::as_str).collect();
        tags.sort_unstable();
        tags.join(" ")
    }
}

// ============================================================================
// IMAGE RECORD
// ============================================================================

/// One cataloged artifact (image, video, or zip animation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    /// Path relative to the managed image directory; unique.
    pub filepath: String,
    /// Content hash; unique.
    pub md5: String,
    pub width: i64,
    pub height: i64,
    pub file_size: i64,
    pub ingested_at: DateTime<Utc>,
    /// Source whose payload currently drives the tags, or `merged`.
    pub active_source: Option<String>,
    pub tags_character: String,
    pub tags_copyright: String,
    pub tags_artist: String,
    pub tags_species: String,
    pub tags_meta: String,
    pub tags_general: String,
    pub post_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub has_children: bool,
    /// 64-bit DCT perceptual hash, 16 lowercase hex chars.
    pub phash: Option<String>,
    /// Color-histogram hash, lowercase hex.
    pub colorhash: Option<String>,
    pub rating: Option<String>,
    /// Source-provided passthrough; never derived locally.
    pub score: Option<i64>,
}

impl ImageRecord {
    /// The denormalized categorized tags as structured lists.
    pub fn categorized_tags(&self) -> CategorizedTags {
        CategorizedTags::from_strings(
            &self.tags_character,
            &self.tags_copyright,
            &self.tags_artist,
            &self.tags_species,
            &self.tags_meta,
            &self.tags_general,
        )
    }

    /// All tags across categories as one set-ordered list.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .categorized_tags()
            .iter()
            .map(|(_, t)| t.to_string())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

// ============================================================================
// TAG RECORD
// ============================================================================

/// A tag row plus its derived usage count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub category: TagCategory,
    pub extended_category: Option<String>,
    /// Derived from the image/tag relation; not authoritative.
    pub usage_count: i64,
}

// ============================================================================
// IMAGE RELATIONS
// ============================================================================

/// Relation kinds between two images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    NonDuplicate,
    ParentChild,
    Sibling,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::NonDuplicate => "non_duplicate",
            RelationType::ParentChild => "parent_child",
            RelationType::Sibling => "sibling",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "non_duplicate" => Some(RelationType::NonDuplicate),
            "parent_child" => Some(RelationType::ParentChild),
            "sibling" => Some(RelationType::Sibling),
            _ => None,
        }
    }

    /// parent_child stores (parent, child); everything else (min, max).
    pub fn is_directional(&self) -> bool {
        matches!(self, RelationType::ParentChild)
    }
}

/// Where a relation row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationSource {
    Manual,
    Ingested,
    DuplicateReview,
}

impl RelationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationSource::Manual => "manual",
            RelationSource::Ingested => "ingested",
            RelationSource::DuplicateReview => "duplicate_review",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "ingested" => RelationSource::Ingested,
            "duplicate_review" => RelationSource::DuplicateReview,
            _ => RelationSource::Manual,
        }
    }
}

/// A stored relation between two images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRelation {
    pub id: i64,
    pub image_id_a: i64,
    pub image_id_b: i64,
    pub relation_type: RelationType,
    pub source: RelationSource,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// DELTA JOURNAL
// ============================================================================

/// Journal operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    Add,
    Remove,
}

impl DeltaOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOp::Add => "add",
            DeltaOp::Remove => "remove",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            DeltaOp::Add => DeltaOp::Remove,
            DeltaOp::Remove => DeltaOp::Add,
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "add" => Some(DeltaOp::Add),
            "remove" => Some(DeltaOp::Remove),
            _ => None,
        }
    }
}

/// One journaled manual tag edit, keyed by image MD5 so it survives rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDelta {
    pub image_md5: String,
    pub tag_name: String,
    pub tag_category: TagCategory,
    pub operation: DeltaOp,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// RAW METADATA
// ============================================================================

/// The retained per-image ground truth: every source payload that ever
/// matched, stored verbatim, plus lookup provenance flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMetadata {
    pub md5: String,
    pub relative_path: String,
    #[serde(default)]
    pub saucenao_lookup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saucenao_response: Option<serde_json::Value>,
    #[serde(default, alias = "camie_tagger_lookup")]
    pub local_tagger_lookup: bool,
    /// Source name -> full payload as returned by the provider.
    #[serde(default)]
    pub sources: BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_roundtrip() {
        for c in TagCategory::DENORMALIZED {
            assert_eq!(TagCategory::parse_name(c.as_str()), c);
        }
        assert_eq!(TagCategory::parse_name("rating"), TagCategory::Rating);
        assert_eq!(TagCategory::parse_name("bogus"), TagCategory::General);
    }

    #[test]
    fn merge_priority_ordering() {
        assert!(TagCategory::Character.merge_priority() > TagCategory::Species.merge_priority());
        assert!(TagCategory::Species.merge_priority() > TagCategory::Copyright.merge_priority());
        assert!(TagCategory::Copyright.merge_priority() > TagCategory::Artist.merge_priority());
        assert!(TagCategory::Artist.merge_priority() > TagCategory::Meta.merge_priority());
        assert!(TagCategory::Meta.merge_priority() > TagCategory::General.merge_priority());
    }

    #[test]
    fn rating_codes() {
        assert_eq!(Rating::from_code("g"), Rating::General);
        assert_eq!(Rating::from_code("E"), Rating::Explicit);
        assert_eq!(Rating::from_code("questionable"), Rating::Questionable);
        assert_eq!(Rating::from_code("??"), Rating::Unknown);
        assert_eq!(Rating::Sensitive.tag_name(), "rating:sensitive");
    }

    #[test]
    fn categorized_tags_normalize_drops_specific_from_general() {
        let mut tags = CategorizedTags {
            character: vec!["aoi_(sample)".into()],
            general: vec!["1girl".into(), "aoi_(sample)".into(), "1girl".into()],
            ..Default::default()
        };
        tags.normalize();
        assert_eq!(tags.general, vec!["1girl".to_string()]);
        assert_eq!(tags.column_value(TagCategory::Character), "aoi_(sample)");
    }

    #[test]
    fn extended_categories_are_22() {
        assert_eq!(ExtendedCategory::ALL.len(), 22);
        assert_eq!(
            ExtendedCategory::parse_name("17_Style_Art"),
            Some(ExtendedCategory::StyleArt)
        );
        assert_eq!(ExtendedCategory::parse_name("nope"), None);
    }

    #[test]
    fn raw_metadata_accepts_legacy_lookup_flag() {
        let json = r#"{"md5":"abc","relative_path":"a.png","camie_tagger_lookup":true,"sources":{}}"#;
        let meta: RawMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.local_tagger_lookup);
    }
}
