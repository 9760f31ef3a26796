//! Tag repository
//!
//! The single entry point for categorized tag edits, plus recategorization,
//! denormalized-column regeneration, tag manager operations (rename, merge,
//! delete, prune), and per-image source switching.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::catalog::{
    Catalog, CatalogError, CategorizedTags, ExtendedCategory, Rating, Result, TagCategory,
    TagOrigin,
};
use crate::sources::{self, SourceId, MERGED_SOURCE};
use crate::tags::deltas::{diff_tag_sets, record_delta_tx};
use crate::tags::normalize_tag_name;

/// Outcome of one categorized edit.
#[derive(Debug, Clone, Default)]
pub struct EditOutcome {
    /// Tag operations this edit performed against the previous state. Zero
    /// means the edit was a no-op and nothing was journaled.
    pub deltas: usize,
}

/// Tag repository over the catalog store.
pub struct TagRepository {
    catalog: Arc<Catalog>,
}

impl TagRepository {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    // ========================================================================
    // EDIT CONTRACT
    // ========================================================================

    /// Apply a categorized tag edit to one image.
    ///
    /// In a single transaction: computes the delta against the image's
    /// current tags, replaces the normalized relation (rating rows are kept),
    /// rewrites the denormalized columns, creates or recategorizes every tag,
    /// and journals the deltas with cancellation.
    pub fn update_image_tags(&self, filepath: &str, new_tags: &CategorizedTags) -> Result<EditOutcome> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;

        let mut normalized = CategorizedTags::default();
        for category in TagCategory::DENORMALIZED {
            let list = normalized.category_mut(category);
            for tag in new_tags.category(category) {
                let name = normalize_tag_name(tag);
                if !name.is_empty() {
                    list.push(name);
                }
            }
        }
        normalized.normalize();

        let deltas = diff_tag_sets(&image.categorized_tags(), &normalized);

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;

        // Replace the relation, preserving rating rows
        tx.execute(
            "DELETE FROM image_tags
             WHERE image_id = ?1
               AND tag_id NOT IN (SELECT id FROM tags WHERE category = 'rating')",
            [image.id],
        )?;

        for (category, tag) in normalized.iter() {
            let category = if tag.starts_with("rating:") {
                TagCategory::Rating
            } else {
                category
            };
            let tag_id = Catalog::upsert_tag_tx(&tx, tag, category)?;
            Catalog::link_tag_tx(&tx, image.id, tag_id, TagOrigin::Original)?;
        }

        Self::rebuild_denormalized_for_image_tx(&tx, image.id)?;

        for (tag, category, op) in &deltas {
            record_delta_tx(&tx, &image.md5, tag, *category, *op)?;
        }

        tx.commit()?;
        tracing::info!(filepath, deltas = deltas.len(), "tags updated");
        Ok(EditOutcome { deltas: deltas.len() })
    }

    // ========================================================================
    // DENORMALIZED COLUMNS
    // ========================================================================

    /// Rewrite one image's denormalized category columns from the relation.
    pub(crate) fn rebuild_denormalized_for_image_tx(tx: &Connection, image_id: i64) -> Result<()> {
        let mut stmt = tx.prepare(
            "SELECT t.name, t.category FROM image_tags it
             JOIN tags t ON t.id = it.tag_id
             WHERE it.image_id = ?1",
        )?;
        let rows = stmt
            .query_map([image_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut by_category: BTreeMap<TagCategory, Vec<String>> = BTreeMap::new();
        for (name, category) in rows {
            let category = TagCategory::parse_name(&category);
            if category == TagCategory::Rating {
                continue;
            }
            by_category.entry(category).or_default().push(name);
        }

        for category in TagCategory::DENORMALIZED {
            let mut names = by_category.remove(&category).unwrap_or_default();
            names.sort();
            let column = category.column().expect("denormalized category");
            tx.execute(
                &format!("UPDATE images SET {} = ?1 WHERE id = ?2", column),
                params![names.join(" "), image_id],
            )?;
        }
        Ok(())
    }

    /// Rewrite every image's denormalized columns from the relation.
    pub fn rebuild_denormalized_all(&self) -> Result<usize> {
        let ids = self.catalog.all_image_ids()?;
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        for id in &ids {
            Self::rebuild_denormalized_for_image_tx(&tx, *id)?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    // ========================================================================
    // RECATEGORIZATION
    // ========================================================================

    /// Move general tags to the more specific category their name occupies in
    /// the denormalized columns elsewhere in the catalog.
    pub fn recategorize_misplaced_tags(&self) -> Result<usize> {
        let mut moved = 0usize;
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;

        for category in [
            TagCategory::Character,
            TagCategory::Species,
            TagCategory::Copyright,
            TagCategory::Artist,
            TagCategory::Meta,
        ] {
            let column = category.column().expect("denormalized category");
            let mut stmt = tx.prepare(&format!(
                "SELECT DISTINCT {} FROM images WHERE {} != ''",
                column, column
            ))?;
            let columns = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
            for value in columns {
                names.extend(value.split_whitespace().map(str::to_string));
            }

            for name in names {
                let changed = tx.execute(
                    "UPDATE tags SET category = ?1 WHERE name = ?2 AND category = 'general'",
                    params![category.as_str(), name],
                )?;
                moved += changed;
            }
        }

        tx.commit()?;
        if moved > 0 {
            tracing::info!(moved, "recategorized misplaced general tags");
        }
        Ok(moved)
    }

    /// Assign or clear a tag's extended category (general tags only).
    pub fn set_extended_category(
        &self,
        tag_name: &str,
        extended: Option<ExtendedCategory>,
    ) -> Result<bool> {
        let writer = self.catalog.writer()?;
        let changed = writer.execute(
            "UPDATE tags SET extended_category = ?1 WHERE name = ?2 AND category = 'general'",
            params![extended.map(|e| e.as_str()), normalize_tag_name(tag_name)],
        )?;
        Ok(changed > 0)
    }

    // ========================================================================
    // TAG MANAGER OPERATIONS
    // ========================================================================

    /// Rename a tag. Renaming onto an existing tag merges into it.
    pub fn rename_tag(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_name = normalize_tag_name(old_name);
        let new_name = normalize_tag_name(new_name);
        if old_name == new_name {
            return Ok(());
        }

        let existing: Option<i64> = {
            let reader = self.catalog.reader()?;
            reader
                .query_row("SELECT id FROM tags WHERE name = ?1", [&new_name], |r| r.get(0))
                .optional()?
        };

        if existing.is_some() {
            return self.merge_tags(&old_name, &new_name);
        }

        let affected = self.images_with_tag(&old_name)?;
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let changed = tx.execute(
            "UPDATE tags SET name = ?1 WHERE name = ?2",
            params![new_name, old_name],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound(old_name));
        }
        for image_id in &affected {
            Self::rebuild_denormalized_for_image_tx(&tx, *image_id)?;
        }
        tx.commit()?;
        tracing::info!(from = %old_name, to = %new_name, images = affected.len(), "tag renamed");
        Ok(())
    }

    /// Merge `from` into `into`: repoint relations, drop the source tag.
    pub fn merge_tags(&self, from: &str, into: &str) -> Result<()> {
        let from = normalize_tag_name(from);
        let into = normalize_tag_name(into);
        let affected = self.images_with_tag(&from)?;

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;

        let from_id: i64 = tx
            .query_row("SELECT id FROM tags WHERE name = ?1", [&from], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(from.clone()))?;
        let into_id: i64 = tx
            .query_row("SELECT id FROM tags WHERE name = ?1", [&into], |r| r.get(0))
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(into.clone()))?;

        tx.execute(
            "INSERT OR IGNORE INTO image_tags (image_id, tag_id, origin)
             SELECT image_id, ?1, origin FROM image_tags WHERE tag_id = ?2",
            params![into_id, from_id],
        )?;
        tx.execute("DELETE FROM image_tags WHERE tag_id = ?1", [from_id])?;
        tx.execute("DELETE FROM tags WHERE id = ?1", [from_id])?;

        for image_id in &affected {
            Self::rebuild_denormalized_for_image_tx(&tx, *image_id)?;
        }
        tx.commit()?;
        tracing::info!(from = %from, into = %into, images = affected.len(), "tags merged");
        Ok(())
    }

    /// Delete a tag everywhere.
    pub fn delete_tag(&self, name: &str) -> Result<usize> {
        let name = normalize_tag_name(name);
        let affected = self.images_with_tag(&name)?;

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let tag_id: Option<i64> = tx
            .query_row("SELECT id FROM tags WHERE name = ?1", [&name], |r| r.get(0))
            .optional()?;
        let tag_id = match tag_id {
            Some(id) => id,
            None => return Ok(0),
        };
        tx.execute("DELETE FROM image_tags WHERE tag_id = ?1", [tag_id])?;
        tx.execute("DELETE FROM tags WHERE id = ?1", [tag_id])?;
        for image_id in &affected {
            Self::rebuild_denormalized_for_image_tx(&tx, *image_id)?;
        }
        tx.commit()?;
        Ok(affected.len())
    }

    /// Remove tags with no remaining relation rows. Explicit maintenance; tags
    /// are never pruned implicitly.
    pub fn prune_orphan_tags(&self) -> Result<usize> {
        let writer = self.catalog.writer()?;
        let removed = writer.execute(
            "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM image_tags)",
            [],
        )?;
        if removed > 0 {
            tracing::info!(removed, "pruned orphan tags");
        }
        Ok(removed)
    }

    fn images_with_tag(&self, name: &str) -> Result<Vec<i64>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT it.image_id FROM image_tags it
             JOIN tags t ON t.id = it.tag_id WHERE t.name = ?1",
        )?;
        let rows = stmt
            .query_map([name], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SOURCE SWITCHING
    // ========================================================================

    /// Re-derive one image's tags from a single stored raw source, or from
    /// the merged union of all of them (`merged`). Does not journal deltas;
    /// this is a source change, not a manual edit.
    pub fn switch_source(&self, filepath: &str, source: &str) -> Result<()> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;
        let raw = self
            .catalog
            .raw_metadata(image.id)?
            .ok_or_else(|| CatalogError::NotFound(format!("raw metadata for {}", filepath)))?;

        let mut hits = BTreeMap::new();
        for (name, payload) in &raw.sources {
            if let Some(id) = SourceId::parse_name(name) {
                if let Some(hit) = sources::hit_from_raw(id, payload) {
                    hits.insert(id.as_str().to_string(), hit);
                }
            }
        }
        if hits.is_empty() {
            return Err(CatalogError::NotFound(format!("no sources for {}", filepath)));
        }

        let selection = if source == MERGED_SOURCE {
            // Merged over a single source degenerates to that source
            sources::merge_hits(&hits, &[])
                .filter(|_| hits.len() > 1)
                .or_else(|| {
                    hits.values()
                        .next()
                        .map(|hit| {
                            let single =
                                BTreeMap::from([(hit.source.as_str().to_string(), hit.clone())]);
                            sources::select_active(&single, &[hit.source.as_str().to_string()], false)
                        })
                        .flatten()
                })
        } else {
            hits.get(source).map(|hit| {
                let single = BTreeMap::from([(source.to_string(), hit.clone())]);
                sources::select_active(&single, &[source.to_string()], false)
            })
            .flatten()
        }
        .ok_or_else(|| CatalogError::NotFound(format!("source {} for {}", source, filepath)))?;

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        Self::apply_selection_tx(&tx, image.id, &selection)?;
        tx.commit()?;
        tracing::info!(filepath, source = %selection.active_source, "source switched");
        Ok(())
    }

    /// Replace an image's relation, linkage columns, and rating from a
    /// selection. Shared with the rebuild engine.
    pub(crate) fn apply_selection_tx(
        tx: &Connection,
        image_id: i64,
        selection: &sources::ActiveSelection,
    ) -> Result<()> {
        tx.execute("DELETE FROM image_tags WHERE image_id = ?1", [image_id])?;

        for (category, tag) in selection.tags.iter() {
            let name = normalize_tag_name(tag);
            if name.is_empty() {
                continue;
            }
            let category = if name.starts_with("rating:") {
                TagCategory::Rating
            } else {
                category
            };
            let tag_id = Catalog::upsert_tag_tx(tx, &name, category)?;
            Catalog::link_tag_tx(tx, image_id, tag_id, TagOrigin::Original)?;
        }

        if let Some((rating, origin)) = selection.rating {
            if rating != Rating::Unknown {
                let tag_id = Catalog::upsert_tag_tx(tx, &rating.tag_name(), TagCategory::Rating)?;
                Catalog::link_tag_tx(tx, image_id, tag_id, origin)?;
            }
        }

        tx.execute(
            "UPDATE images SET active_source = ?1, post_id = ?2, parent_id = ?3,
                    has_children = ?4, rating = ?5
             WHERE id = ?6",
            params![
                selection.active_source,
                selection.post_id,
                selection.parent_id,
                selection.has_children as i64,
                selection.rating.map(|(r, _)| r.as_str().to_string()),
                image_id
            ],
        )?;

        Self::rebuild_denormalized_for_image_tx(tx, image_id)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
