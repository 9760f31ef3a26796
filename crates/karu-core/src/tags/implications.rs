//! Implication engine
//!
//! Directed tag rules (`source -> implied`) with two automatic miners: a
//! naming-pattern detector over character tags and a statistical
//! co-occurrence detector. Applying rules writes relation rows with origin
//! `implication`; the transitive closure is computed per image with a
//! visited set so chains and cycles terminate. Rule creation refuses cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogError, TagCategory};
use crate::config::Config;
use crate::tags::normalize_tag_name;
use crate::tags::repository::TagRepository;

/// Suggestion cache lifetime.
pub const SUGGESTION_CACHE_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Implication engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ImplicationError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    /// The proposed rule would close a cycle
    #[error("circular implication detected: {source_tag} -> {implied} -> ... -> {source_tag}")]
    Circular { source_tag: String, implied: String },
    /// One of the named tags does not exist
    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

pub type Result<T> = std::result::Result<T, ImplicationError>;

// ============================================================================
// TYPES
// ============================================================================

/// A mined or manual rule proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplicationSuggestion {
    pub source_tag: String,
    pub implied_tag: String,
    pub confidence: f64,
    /// `naming_pattern` or `correlation`
    pub pattern_type: String,
    pub reason: String,
    /// Images that would gain the implied tag
    pub affected_images: i64,
    /// Co-occurrence count backing a correlation proposal
    pub sample_size: i64,
    pub source_category: String,
    pub implied_category: String,
}

/// A stored rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplicationRule {
    pub source_tag: String,
    pub source_category: String,
    pub implied_tag: String,
    pub implied_category: String,
    pub inference_type: String,
    pub confidence: f64,
    pub status: String,
    pub created_at: String,
}

/// Recursive implication chain from one tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplicationChain {
    pub tag: String,
    pub category: String,
    pub implies: Vec<ImplicationChain>,
}

/// Impact preview for a proposed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewImpact {
    pub total_images: i64,
    pub already_has_tag: i64,
    pub will_gain_tag: i64,
    pub chain_implications: Vec<String>,
    pub conflicts: Vec<String>,
}

/// Result of a clear-and-reapply pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapplyStats {
    pub cleared_tags: usize,
    pub rules_applied: usize,
    pub tags_added: usize,
    pub images_updated: usize,
}

/// A page of filtered suggestions.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionPage {
    pub suggestions: Vec<ImplicationSuggestion>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_more: bool,
    pub naming_count: usize,
    pub correlation_count: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The implication engine.
pub struct ImplicationEngine {
    catalog: Arc<Catalog>,
    min_confidence: f64,
    min_co_occurrence: i64,
    allowed_extended: Vec<String>,
    cache: RwLock<Option<(Instant, Vec<ImplicationSuggestion>)>>,
}

impl ImplicationEngine {
    pub fn new(catalog: Arc<Catalog>, config: &Config) -> Self {
        Self {
            catalog,
            min_confidence: config.implication_min_confidence,
            min_co_occurrence: config.implication_min_co_occurrence,
            allowed_extended: config.implication_allowed_extended_categories.clone(),
            cache: RwLock::new(None),
        }
    }

    // ========================================================================
    // MINING
    // ========================================================================

    /// Naming-pattern proposals over character tags.
    ///
    /// `name_(x)` proposes `name_(x) -> x` when `x` exists as a copyright tag
    /// (confidence 0.92). `a_(mid)_(franchise)` proposes the variant -> base
    /// `a_(franchise)` when the base exists (confidence 0.95).
    pub fn detect_naming_patterns(&self) -> Result<Vec<ImplicationSuggestion>> {
        let final_paren = Regex::new(r"\(([^)]+)\)$").expect("static pattern");
        let variant = Regex::new(r"^(.+?)_\([^)]+\)_\((.+?)\)$").expect("static pattern");
        let middle = Regex::new(r"_\(([^)]+)\)_").expect("static pattern");

        let character_tags: Vec<String> = {
            let reader = self.catalog.reader()?;
            let mut stmt =
                reader.prepare("SELECT name FROM tags WHERE category = 'character'")?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };
        let character_set: HashSet<&str> = character_tags.iter().map(String::as_str).collect();

        let mut suggestions = Vec::new();
        for tag_name in &character_tags {
            if let Some(captures) = final_paren.captures(tag_name) {
                let implied = captures[1].to_string();
                if self.tag_category(&implied)? == Some(TagCategory::Copyright)
                    && !self.rule_exists(tag_name, &implied)?
                {
                    suggestions.push(ImplicationSuggestion {
                        source_tag: tag_name.clone(),
                        implied_tag: implied.clone(),
                        confidence: 0.92,
                        pattern_type: "naming_pattern".to_string(),
                        reason: format!("Naming pattern: extracted \"{}\" from tag name", implied),
                        affected_images: self.count_images_with_tag(tag_name)?,
                        sample_size: 0,
                        source_category: "character".to_string(),
                        implied_category: "copyright".to_string(),
                    });
                }
            }

            if let Some(captures) = variant.captures(tag_name) {
                let base_tag = format!("{}_({})", &captures[1], &captures[2]);
                if character_set.contains(base_tag.as_str())
                    && !self.rule_exists(tag_name, &base_tag)?
                {
                    let middle_part = middle
                        .captures(tag_name)
                        .map(|c| c[1].to_string())
                        .unwrap_or_else(|| "variant".to_string());
                    suggestions.push(ImplicationSuggestion {
                        source_tag: tag_name.clone(),
                        implied_tag: base_tag,
                        confidence: 0.95,
                        pattern_type: "naming_pattern".to_string(),
                        reason: format!("Variant pattern: {} form implies base character", middle_part),
                        affected_images: self.count_images_with_tag(tag_name)?,
                        sample_size: 0,
                        source_category: "character".to_string(),
                        implied_category: "character".to_string(),
                    });
                }
            }
        }
        Ok(suggestions)
    }

    /// Correlation proposals: for each character tag with enough usage, every
    /// co-occurring allowed tag whose co-occurrence rate clears the
    /// confidence floor.
    pub fn detect_correlations(&self) -> Result<Vec<ImplicationSuggestion>> {
        struct CharRow {
            id: i64,
            name: String,
            usage: i64,
        }

        let characters: Vec<CharRow> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT t.id, t.name, COUNT(it.image_id) AS usage_count
                 FROM tags t
                 JOIN image_tags it ON it.tag_id = t.id
                 WHERE t.category = 'character'
                 GROUP BY t.id
                 HAVING usage_count >= ?1",
            )?;
            let rows = stmt
                .query_map([self.min_co_occurrence], |r| {
                    Ok(CharRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        usage: r.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let extended_filter = if self.allowed_extended.is_empty() {
            String::new()
        } else {
            let placeholders = self
                .allowed_extended
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(",");
            format!("AND t2.extended_category IN ({})", placeholders)
        };

        let mut suggestions = Vec::new();
        for character in &characters {
            let rows: Vec<(String, String, i64)> = {
                let reader = self.catalog.reader()?;
                let sql = format!(
                    "SELECT t2.name, t2.category, COUNT(DISTINCT it2.image_id) AS co_occurrence
                     FROM image_tags it1
                     JOIN image_tags it2 ON it1.image_id = it2.image_id
                     JOIN tags t2 ON t2.id = it2.tag_id
                     WHERE it1.tag_id = ?1
                       AND it2.tag_id != ?1
                       AND t2.category IN ('copyright', 'general')
                       {}
                     GROUP BY t2.id
                     HAVING co_occurrence >= ?2",
                    extended_filter
                );
                let mut stmt = reader.prepare(&sql)?;
                let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(character.id)];
                for cat in &self.allowed_extended {
                    bind.push(Box::new(cat.clone()));
                }
                bind.push(Box::new(self.min_co_occurrence));
                let params = rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref()));
                let rows = stmt
                    .query_map(params, |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            for (name, category, co_occurrence) in rows {
                let confidence = co_occurrence as f64 / character.usage as f64;
                if confidence < self.min_confidence || self.rule_exists(&character.name, &name)? {
                    continue;
                }
                suggestions.push(ImplicationSuggestion {
                    source_tag: character.name.clone(),
                    implied_tag: name,
                    confidence,
                    pattern_type: "correlation".to_string(),
                    reason: format!(
                        "{}% co-occurrence ({}/{} images)",
                        (confidence * 100.0) as i64,
                        co_occurrence,
                        character.usage
                    ),
                    affected_images: character.usage - co_occurrence,
                    sample_size: co_occurrence,
                    source_category: "character".to_string(),
                    implied_category: category,
                });
            }
        }
        Ok(suggestions)
    }

    /// All suggestions, from the TTL cache when fresh.
    pub fn suggestions(&self) -> Result<Vec<ImplicationSuggestion>> {
        if let Some((at, cached)) = self.cache.read().ok().and_then(|g| (*g).clone()) {
            if at.elapsed() < SUGGESTION_CACHE_TTL {
                return Ok(cached);
            }
        }

        let mut fresh = self.detect_naming_patterns()?;
        fresh.extend(self.detect_correlations()?);

        if let Ok(mut guard) = self.cache.write() {
            *guard = Some((Instant::now(), fresh.clone()));
        }
        Ok(fresh)
    }

    /// Clear the suggestion cache (called on any approval).
    pub fn invalidate_cache(&self) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = None;
        }
    }

    /// Filtered, paginated suggestions. Category filters accept `!name`
    /// exclusions; `all` disables a filter.
    pub fn paginated_suggestions(
        &self,
        page: usize,
        limit: usize,
        pattern_type: Option<&str>,
        source_categories: &[String],
        implied_categories: &[String],
    ) -> Result<SuggestionPage> {
        let all = self.suggestions()?;
        let naming_count = all.iter().filter(|s| s.pattern_type == "naming_pattern").count();
        let correlation_count = all.len() - naming_count;

        let filtered: Vec<ImplicationSuggestion> = all
            .into_iter()
            .filter(|s| match pattern_type {
                Some(p) if p != "all" => s.pattern_type == p,
                _ => true,
            })
            .filter(|s| category_filter_matches(&s.source_category, source_categories))
            .filter(|s| category_filter_matches(&s.implied_category, implied_categories))
            .collect();

        let total = filtered.len();
        let limit = limit.max(1);
        let total_pages = total.div_ceil(limit).max(1);
        let page = page.max(1);
        let start = (page - 1) * limit;
        let suggestions = filtered
            .into_iter()
            .skip(start)
            .take(limit)
            .collect::<Vec<_>>();

        Ok(SuggestionPage {
            suggestions,
            page,
            limit,
            total,
            total_pages,
            has_more: page < total_pages,
            naming_count,
            correlation_count,
        })
    }

    // ========================================================================
    // RULE CRUD
    // ========================================================================

    /// Approve a suggestion: cycle-check, insert the rule, optionally apply
    /// it to existing images. Returns how many images gained the tag.
    pub fn approve(
        &self,
        source_tag: &str,
        implied_tag: &str,
        inference_type: &str,
        confidence: f64,
        apply_now: bool,
    ) -> Result<usize> {
        let source_tag = normalize_tag_name(source_tag);
        let implied_tag = normalize_tag_name(implied_tag);

        // Reject when the source already appears in the implied tag's chain
        let chain = self.chain(&implied_tag, 10)?;
        if flatten_chain(&chain).contains(&source_tag) {
            return Err(ImplicationError::Circular {
                source_tag,
                implied: implied_tag,
            });
        }

        let source_id = self
            .tag_id(&source_tag)?
            .ok_or_else(|| ImplicationError::UnknownTag(source_tag.clone()))?;
        let implied_id = self
            .tag_id(&implied_tag)?
            .ok_or_else(|| ImplicationError::UnknownTag(implied_tag.clone()))?;

        {
            let writer = self.catalog.writer()?;
            writer.execute(
                "INSERT OR IGNORE INTO tag_implications
                 (source_tag_id, implied_tag_id, inference_type, confidence, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                params![
                    source_id,
                    implied_id,
                    inference_type,
                    confidence,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        self.invalidate_cache();
        tracing::info!(source = %source_tag, implied = %implied_tag, inference_type, "implication approved");

        if apply_now {
            self.apply_rule_to_existing(&source_tag, &implied_tag)
        } else {
            Ok(0)
        }
    }

    /// Create a manual rule (confidence 1.0).
    pub fn create_manual(&self, source_tag: &str, implied_tag: &str, apply_now: bool) -> Result<usize> {
        self.approve(source_tag, implied_tag, "manual", 1.0, apply_now)
    }

    /// Delete a rule. Returns whether a row was removed.
    pub fn delete_rule(&self, source_tag: &str, implied_tag: &str) -> Result<bool> {
        let writer = self.catalog.writer()?;
        let removed = writer.execute(
            "DELETE FROM tag_implications
             WHERE source_tag_id = (SELECT id FROM tags WHERE name = ?1)
               AND implied_tag_id = (SELECT id FROM tags WHERE name = ?2)",
            params![normalize_tag_name(source_tag), normalize_tag_name(implied_tag)],
        )?;
        drop(writer);
        self.invalidate_cache();
        Ok(removed > 0)
    }

    /// All active rules.
    pub fn all_rules(&self) -> Result<Vec<ImplicationRule>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT ts.name, ts.category, ti2.name, ti2.category,
                    ti.inference_type, ti.confidence, ti.status, ti.created_at
             FROM tag_implications ti
             JOIN tags ts ON ts.id = ti.source_tag_id
             JOIN tags ti2 ON ti2.id = ti.implied_tag_id
             WHERE ti.status = 'active'
             ORDER BY ts.category, ts.name",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ImplicationRule {
                    source_tag: r.get(0)?,
                    source_category: r.get(1)?,
                    implied_tag: r.get(2)?,
                    implied_category: r.get(3)?,
                    inference_type: r.get(4)?,
                    confidence: r.get(5)?,
                    status: r.get(6)?,
                    created_at: r.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rules where `tag_name` is source or implied.
    pub fn rules_for_tag(&self, tag_name: &str) -> Result<Vec<ImplicationRule>> {
        let name = normalize_tag_name(tag_name);
        Ok(self
            .all_rules()?
            .into_iter()
            .filter(|r| r.source_tag == name || r.implied_tag == name)
            .collect())
    }

    /// Tags that imply `tag_name` (reverse lookup).
    pub fn tags_implying(&self, tag_name: &str) -> Result<Vec<String>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT ts.name
             FROM tag_implications ti
             JOIN tags ts ON ts.id = ti.source_tag_id
             JOIN tags ti2 ON ti2.id = ti.implied_tag_id
             WHERE ti2.name = ?1 AND ti.status = 'active'",
        )?;
        let rows = stmt
            .query_map([normalize_tag_name(tag_name)], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// The recursive chain from a tag; a visited set stops cycles.
    pub fn chain(&self, tag_name: &str, max_depth: usize) -> Result<ImplicationChain> {
        let mut visited = HashSet::new();
        self.build_chain(&normalize_tag_name(tag_name), 0, max_depth, &mut visited)
    }

    fn build_chain(
        &self,
        tag: &str,
        depth: usize,
        max_depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<ImplicationChain> {
        let category = self
            .tag_category(tag)?
            .unwrap_or(TagCategory::General)
            .as_str()
            .to_string();

        if depth >= max_depth || visited.contains(tag) {
            return Ok(ImplicationChain {
                tag: tag.to_string(),
                category,
                implies: vec![],
            });
        }
        visited.insert(tag.to_string());

        let direct: Vec<String> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT ti2.name
                 FROM tag_implications ti
                 JOIN tags ts ON ts.id = ti.source_tag_id
                 JOIN tags ti2 ON ti2.id = ti.implied_tag_id
                 WHERE ts.name = ?1 AND ti.status = 'active'",
            )?;
            let rows = stmt
                .query_map([tag], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };

        let mut implies = Vec::new();
        for implied in direct {
            implies.push(self.build_chain(&implied, depth + 1, max_depth, visited)?);
        }

        Ok(ImplicationChain {
            tag: tag.to_string(),
            category,
            implies,
        })
    }

    /// Preview a proposed rule's impact, reporting circular conflicts.
    pub fn preview(&self, source_tag: &str, implied_tag: &str) -> Result<PreviewImpact> {
        let source_tag = normalize_tag_name(source_tag);
        let implied_tag = normalize_tag_name(implied_tag);

        let total_images = self.count_images_with_tag(&source_tag)?;
        let already_has: i64 = {
            let reader = self.catalog.reader()?;
            reader.query_row(
                "SELECT COUNT(DISTINCT it.image_id)
                 FROM image_tags it
                 JOIN tags t ON t.id = it.tag_id
                 WHERE t.name = ?1
                   AND it.image_id IN (
                       SELECT it2.image_id FROM image_tags it2
                       JOIN tags t2 ON t2.id = it2.tag_id
                       WHERE t2.name = ?2
                   )",
                params![implied_tag, source_tag],
                |r| r.get(0),
            )?
        };

        let chain = self.chain(&implied_tag, 10)?;
        let chain_tags = flatten_chain(&chain);
        let mut conflicts = Vec::new();
        if chain_tags.contains(&source_tag) {
            conflicts.push(format!(
                "Circular implication detected: {} -> {} -> ... -> {}",
                source_tag, implied_tag, source_tag
            ));
        }

        Ok(PreviewImpact {
            total_images,
            already_has_tag: already_has,
            will_gain_tag: total_images - already_has,
            chain_implications: chain_tags.into_iter().collect(),
            conflicts,
        })
    }

    // ========================================================================
    // APPLICATION
    // ========================================================================

    /// Insert the implied tag (origin `implication`) on every image that has
    /// the source tag but not the implied one.
    pub fn apply_rule_to_existing(&self, source_tag: &str, implied_tag: &str) -> Result<usize> {
        let implied_id = self
            .tag_id(&normalize_tag_name(implied_tag))?
            .ok_or_else(|| ImplicationError::UnknownTag(implied_tag.to_string()))?;

        let image_ids: Vec<i64> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT DISTINCT it.image_id
                 FROM image_tags it
                 JOIN tags t ON t.id = it.tag_id
                 WHERE t.name = ?1
                   AND it.image_id NOT IN (
                       SELECT it2.image_id FROM image_tags it2
                       JOIN tags t2 ON t2.id = it2.tag_id
                       WHERE t2.name = ?2
                   )",
            )?;
            let rows = stmt
                .query_map(
                    params![normalize_tag_name(source_tag), normalize_tag_name(implied_tag)],
                    |r| r.get(0),
                )?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            rows
        };

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let mut count = 0usize;
        for image_id in &image_ids {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO image_tags (image_id, tag_id, origin)
                 VALUES (?1, ?2, 'implication')",
                params![image_id, implied_id],
            )?;
            if inserted > 0 {
                count += 1;
                TagRepository::rebuild_denormalized_for_image_tx(&tx, *image_id)
                    .map_err(ImplicationError::Catalog)?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Remove every `implication`-origin relation row, then recompute the
    /// transitive closure for every image and write it back. Running this
    /// twice yields identical relation state.
    pub fn clear_and_reapply(&self) -> Result<ReapplyStats> {
        let rules = self.load_rule_map()?;
        let image_ids = self.catalog.all_image_ids().map_err(ImplicationError::Catalog)?;

        let mut stats = ReapplyStats {
            rules_applied: rules.len(),
            ..Default::default()
        };

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;

        stats.cleared_tags = tx.execute("DELETE FROM image_tags WHERE origin = 'implication'", [])?;

        let tag_ids: HashMap<String, i64> = {
            let mut stmt = tx.prepare("SELECT name, id FROM tags")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().collect()
        };

        for image_id in &image_ids {
            let current: BTreeSet<String> = {
                let mut stmt = tx.prepare(
                    "SELECT t.name FROM image_tags it
                     JOIN tags t ON t.id = it.tag_id WHERE it.image_id = ?1",
                )?;
                let rows = stmt
                    .query_map([image_id], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows.into_iter().collect()
            };

            let to_add = closure_additions(&current, &rules);
            if to_add.is_empty() {
                continue;
            }
            stats.images_updated += 1;
            for tag in &to_add {
                if let Some(tag_id) = tag_ids.get(tag) {
                    let inserted = tx.execute(
                        "INSERT OR IGNORE INTO image_tags (image_id, tag_id, origin)
                         VALUES (?1, ?2, 'implication')",
                        params![image_id, tag_id],
                    )?;
                    stats.tags_added += inserted;
                }
            }
            TagRepository::rebuild_denormalized_for_image_tx(&tx, *image_id)
                .map_err(ImplicationError::Catalog)?;
        }

        tx.commit()?;
        tracing::info!(
            cleared = stats.cleared_tags,
            rules = stats.rules_applied,
            added = stats.tags_added,
            images = stats.images_updated,
            "implications reapplied"
        );
        Ok(stats)
    }

    /// Remove every `implication`-origin relation row without reapplying.
    pub fn clear_implied(&self) -> Result<usize> {
        let affected: Vec<i64> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT DISTINCT image_id FROM image_tags WHERE origin = 'implication'",
            )?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            rows
        };

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let removed = tx.execute("DELETE FROM image_tags WHERE origin = 'implication'", [])?;
        for image_id in &affected {
            TagRepository::rebuild_denormalized_for_image_tx(&tx, *image_id)
                .map_err(ImplicationError::Catalog)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn load_rule_map(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT ts.name, ti2.name
             FROM tag_implications ti
             JOIN tags ts ON ts.id = ti.source_tag_id
             JOIN tags ti2 ON ti2.id = ti.implied_tag_id
             WHERE ti.status = 'active'",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, implied) in rows {
            map.entry(source).or_default().push(implied);
        }
        Ok(map)
    }

    fn tag_id(&self, name: &str) -> Result<Option<i64>> {
        let reader = self.catalog.reader()?;
        Ok(reader
            .query_row("SELECT id FROM tags WHERE name = ?1", [name], |r| r.get(0))
            .optional()?)
    }

    fn tag_category(&self, name: &str) -> Result<Option<TagCategory>> {
        let reader = self.catalog.reader()?;
        let category: Option<String> = reader
            .query_row("SELECT category FROM tags WHERE name = ?1", [name], |r| r.get(0))
            .optional()?;
        Ok(category.map(|c| TagCategory::parse_name(&c)))
    }

    fn rule_exists(&self, source: &str, implied: &str) -> Result<bool> {
        let reader = self.catalog.reader()?;
        let exists = reader
            .query_row(
                "SELECT 1 FROM tag_implications ti
                 JOIN tags ts ON ts.id = ti.source_tag_id
                 JOIN tags ti2 ON ti2.id = ti.implied_tag_id
                 WHERE ts.name = ?1 AND ti2.name = ?2",
                params![source, implied],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn count_images_with_tag(&self, name: &str) -> Result<i64> {
        let reader = self.catalog.reader()?;
        Ok(reader.query_row(
            "SELECT COUNT(DISTINCT it.image_id)
             FROM image_tags it JOIN tags t ON t.id = it.tag_id
             WHERE t.name = ?1",
            [name],
            |r| r.get(0),
        )?)
    }
}

/// Expand an image's tag set through the rule map to a fixed point. The
/// visited set bounds the walk on cycles.
fn closure_additions(
    current: &BTreeSet<String>,
    rules: &BTreeMap<String, Vec<String>>,
) -> BTreeSet<String> {
    let mut to_add = BTreeSet::new();
    let mut frontier: Vec<String> = current.iter().cloned().collect();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(tag) = frontier.pop() {
        if !visited.insert(tag.clone()) {
            continue;
        }
        if let Some(implied_list) = rules.get(&tag) {
            for implied in implied_list {
                if !current.contains(implied) && to_add.insert(implied.clone()) {
                    frontier.push(implied.clone());
                }
            }
        }
    }
    to_add
}

fn flatten_chain(chain: &ImplicationChain) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack = vec![chain];
    while let Some(node) = stack.pop() {
        out.insert(node.tag.clone());
        for child in &node.implies {
            stack.push(child);
        }
    }
    out
}

/// `!name` entries exclude; plain entries include; `all` or empty disables.
fn category_filter_matches(category: &str, filters: &[String]) -> bool {
    if filters.is_empty() || filters.iter().any(|f| f == "all") {
        return true;
    }
    let exclusions: Vec<&str> = filters
        .iter()
        .filter_map(|f| f.strip_prefix('!'))
        .collect();
    let inclusions: Vec<&str> = filters
        .iter()
        .filter(|f| !f.starts_with('!'))
        .map(String::as_str)
        .collect();

    (inclusions.is_empty() || inclusions.contains(&category))
        && !exclusions.contains(&category)
}

// ============================================================================
// TESTS
// ============================================================================
