//! Image relations
//!
//! Relations between image pairs: `non_duplicate`, `parent_child`, and
//! `sibling`. `parent_child` stores (parent, child) directionally; the other
//! types store (min_id, max_id). Existence checks always consider both
//! column orderings. The parent/child graph is kept acyclic.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::catalog::{Catalog, CatalogError, ImageRelation, RelationSource, RelationType, Result};

/// A relation viewed from the perspective of one image.
#[derive(Debug, Clone, Serialize)]
pub struct RelationDisplay {
    pub id: i64,
    pub relation_type: RelationType,
    pub source: RelationSource,
    pub created_at: DateTime<Utc>,
    /// `parent`, `child`, or the relation type name for symmetric types.
    pub display_type: String,
    pub other_image_id: i64,
    pub other_filepath: String,
}

/// Relation repository over the catalog store.
pub struct RelationRepository {
    catalog: Arc<Catalog>,
}

impl RelationRepository {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Canonical column order for a pair.
    pub fn normalize_pair(id_a: i64, id_b: i64, relation_type: RelationType) -> (i64, i64) {
        if relation_type.is_directional() {
            (id_a, id_b)
        } else {
            (id_a.min(id_b), id_a.max(id_b))
        }
    }

    /// Add a relation. Returns `false` when the same pair/type already
    /// exists. Self-relations and parent/child cycles are rejected.
    pub fn add_relation(
        &self,
        id_a: i64,
        id_b: i64,
        relation_type: RelationType,
        source: RelationSource,
    ) -> Result<bool> {
        if id_a == id_b {
            return Err(CatalogError::NotFound(format!(
                "self-relation rejected for image {}",
                id_a
            )));
        }

        let (a, b) = Self::normalize_pair(id_a, id_b, relation_type);

        if relation_type == RelationType::ParentChild && self.would_create_cycle(a, b)? {
            return Err(CatalogError::NotFound(format!(
                "parent_child cycle rejected: {} -> {}",
                a, b
            )));
        }

        let writer = self.catalog.writer()?;
        let inserted = writer.execute(
            "INSERT OR IGNORE INTO image_relations (image_id_a, image_id_b, relation_type, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                a,
                b,
                relation_type.as_str(),
                source.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Whether adding the edge parent -> child closes a cycle: true when the
    /// parent is already reachable from the child.
    fn would_create_cycle(&self, parent: i64, child: i64) -> Result<bool> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT image_id_b FROM image_relations
             WHERE relation_type = 'parent_child' AND image_id_a = ?1",
        )?;

        let mut queue = VecDeque::from([child]);
        let mut visited = HashSet::new();
        while let Some(node) = queue.pop_front() {
            if node == parent {
                return Ok(true);
            }
            if !visited.insert(node) {
                continue;
            }
            let children = stmt
                .query_map([node], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            queue.extend(children);
        }
        Ok(false)
    }

    /// Any relation between the pair, both orderings considered.
    pub fn has_any_relation(&self, id_a: i64, id_b: i64) -> Result<bool> {
        let reader = self.catalog.reader()?;
        let exists = reader
            .query_row(
                "SELECT 1 FROM image_relations
                 WHERE (image_id_a = ?1 AND image_id_b = ?2)
                    OR (image_id_a = ?2 AND image_id_b = ?1)
                 LIMIT 1",
                params![id_a, id_b],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    /// All relations involving an image, oriented for display.
    pub fn relations_for_image(&self, image_id: i64) -> Result<Vec<RelationDisplay>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT ir.id, ir.image_id_a, ir.image_id_b, ir.relation_type, ir.source, ir.created_at,
                    ia.filepath, ib.filepath
             FROM image_relations ir
             JOIN images ia ON ia.id = ir.image_id_a
             JOIN images ib ON ib.id = ir.image_id_b
             WHERE ir.image_id_a = ?1 OR ir.image_id_b = ?1
             ORDER BY ir.created_at DESC",
        )?;
        let rows = stmt
            .query_map([image_id], |r| {
                let rel_type: String = r.get(3)?;
                let source: String = r.get(4)?;
                let created: String = r.get(5)?;
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    rel_type,
                    source,
                    created,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, a, b, rel_type, source, created, path_a, path_b) in rows {
            let relation_type = match RelationType::parse_name(&rel_type) {
                Some(t) => t,
                None => continue,
            };
            let (display_type, other_image_id, other_filepath) = if relation_type.is_directional() {
                if a == image_id {
                    ("child".to_string(), b, path_b)
                } else {
                    ("parent".to_string(), a, path_a)
                }
            } else if a == image_id {
                (relation_type.as_str().to_string(), b, path_b)
            } else {
                (relation_type.as_str().to_string(), a, path_a)
            };

            out.push(RelationDisplay {
                id,
                relation_type,
                source: RelationSource::parse_name(&source),
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                display_type,
                other_image_id,
                other_filepath,
            });
        }
        Ok(out)
    }

    /// Delete relations between a pair; optionally restricted to one type.
    /// Both orderings are considered.
    pub fn delete_relation(
        &self,
        id_a: i64,
        id_b: i64,
        relation_type: Option<RelationType>,
    ) -> Result<bool> {
        let writer = self.catalog.writer()?;
        let removed = match relation_type {
            Some(t) => writer.execute(
                "DELETE FROM image_relations
                 WHERE ((image_id_a = ?1 AND image_id_b = ?2)
                     OR (image_id_a = ?2 AND image_id_b = ?1))
                   AND relation_type = ?3",
                params![id_a, id_b, t.as_str()],
            )?,
            None => writer.execute(
                "DELETE FROM image_relations
                 WHERE (image_id_a = ?1 AND image_id_b = ?2)
                    OR (image_id_a = ?2 AND image_id_b = ?1)",
                params![id_a, id_b],
            )?,
        };
        Ok(removed > 0)
    }

    /// Delete one relation row by id, returning it when found.
    pub fn delete_relation_by_id(&self, relation_id: i64) -> Result<Option<ImageRelation>> {
        let found = {
            let reader = self.catalog.reader()?;
            reader
                .query_row(
                    "SELECT id, image_id_a, image_id_b, relation_type, source, created_at
                     FROM image_relations WHERE id = ?1",
                    [relation_id],
                    |r| {
                        let rel_type: String = r.get(3)?;
                        let source: String = r.get(4)?;
                        let created: String = r.get(5)?;
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, i64>(1)?,
                            r.get::<_, i64>(2)?,
                            rel_type,
                            source,
                            created,
                        ))
                    },
                )
                .optional()?
        };

        let (id, a, b, rel_type, source, created) = match found {
            Some(row) => row,
            None => return Ok(None),
        };

        let writer = self.catalog.writer()?;
        writer.execute("DELETE FROM image_relations WHERE id = ?1", [relation_id])?;

        Ok(Some(ImageRelation {
            id,
            image_id_a: a,
            image_id_b: b,
            relation_type: RelationType::parse_name(&rel_type)
                .unwrap_or(RelationType::NonDuplicate),
            source: RelationSource::parse_name(&source),
            created_at: DateTime::parse_from_rfc3339(&created)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;

    fn setup() -> (Arc<Catalog>, RelationRepository, Vec<i64>) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let ids = (0..4)
            .map(|i| {
                catalog
                    .commit_ingest(&sample_commit(&format!("img{}.jpg", i), &format!("md5{}", i)))
                    .unwrap()
            })
            .collect();
        let relations = RelationRepository::new(catalog.clone());
        (catalog, relations, ids)
    }

    #[test]
    fn symmetric_types_store_min_max() {
        let (catalog, relations, ids) = setup();
        let (hi, lo) = (ids[1].max(ids[0]), ids[1].min(ids[0]));
        relations
            .add_relation(hi, lo, RelationType::Sibling, RelationSource::DuplicateReview)
            .unwrap();

        let reader = catalog.reader().unwrap();
        let (a, b): (i64, i64) = reader
            .query_row(
                "SELECT image_id_a, image_id_b FROM image_relations",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((a, b), (lo, hi));
    }

    #[test]
    fn parent_child_preserves_direction() {
        let (_c, relations, ids) = setup();
        relations
            .add_relation(ids[1], ids[0], RelationType::ParentChild, RelationSource::Manual)
            .unwrap();
        let view = relations.relations_for_image(ids[1]).unwrap();
        assert_eq!(view[0].display_type, "child");
        assert_eq!(view[0].other_image_id, ids[0]);
        let view = relations.relations_for_image(ids[0]).unwrap();
        assert_eq!(view[0].display_type, "parent");
    }

    #[test]
    fn duplicate_pair_type_is_rejected_once() {
        let (_c, relations, ids) = setup();
        assert!(relations
            .add_relation(ids[0], ids[1], RelationType::NonDuplicate, RelationSource::Manual)
            .unwrap());
        // Same pair in the other order is the same row
        assert!(!relations
            .add_relation(ids[1], ids[0], RelationType::NonDuplicate, RelationSource::Manual)
            .unwrap());
    }

    #[test]
    fn has_any_relation_checks_both_orderings() {
        let (_c, relations, ids) = setup();
        relations
            .add_relation(ids[0], ids[1], RelationType::ParentChild, RelationSource::Manual)
            .unwrap();
        assert!(relations.has_any_relation(ids[0], ids[1]).unwrap());
        assert!(relations.has_any_relation(ids[1], ids[0]).unwrap());
        assert!(!relations.has_any_relation(ids[0], ids[2]).unwrap());
    }

    #[test]
    fn self_relations_are_rejected() {
        let (_c, relations, ids) = setup();
        assert!(relations
            .add_relation(ids[0], ids[0], RelationType::Sibling, RelationSource::Manual)
            .is_err());
    }

    #[test]
    fn parent_child_cycles_are_rejected() {
        let (_c, relations, ids) = setup();
        relations
            .add_relation(ids[0], ids[1], RelationType::ParentChild, RelationSource::Manual)
            .unwrap();
        relations
            .add_relation(ids[1], ids[2], RelationType::ParentChild, RelationSource::Manual)
            .unwrap();
        // 2 -> 0 would close the loop 0 -> 1 -> 2 -> 0
        assert!(relations
            .add_relation(ids[2], ids[0], RelationType::ParentChild, RelationSource::Manual)
            .is_err());
        // Unrelated edge still works
        assert!(relations
            .add_relation(ids[2], ids[3], RelationType::ParentChild, RelationSource::Manual)
            .unwrap());
    }

    #[test]
    fn delete_by_pair_and_by_id() {
        let (_c, relations, ids) = setup();
        relations
            .add_relation(ids[0], ids[1], RelationType::Sibling, RelationSource::Manual)
            .unwrap();
        assert!(relations
            .delete_relation(ids[1], ids[0], Some(RelationType::Sibling))
            .unwrap());
        assert!(!relations.has_any_relation(ids[0], ids[1]).unwrap());

        relations
            .add_relation(ids[0], ids[1], RelationType::Sibling, RelationSource::Manual)
            .unwrap();
        let view = relations.relations_for_image(ids[0]).unwrap();
        let deleted = relations.delete_relation_by_id(view[0].id).unwrap().unwrap();
        assert_eq!(deleted.relation_type, RelationType::Sibling);
        assert!(relations.delete_relation_by_id(view[0].id).unwrap().is_none());
    }
}
