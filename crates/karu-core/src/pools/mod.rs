//! Pools
//!
//! Ordered, named sequences of images. Positions are 1-indexed and kept
//! contiguous through removals and reorders.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::catalog::{Catalog, CatalogError, Result};

/// Pool header plus its size.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub image_count: i64,
}

/// A pool with its ordered members.
#[derive(Debug, Clone, Serialize)]
pub struct PoolDetails {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// (position, image id, filepath), position-ascending.
    pub images: Vec<(i64, i64, String)>,
}

/// Pool repository over the catalog store.
pub struct PoolRepository {
    catalog: Arc<Catalog>,
}

impl PoolRepository {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn create_pool(&self, name: &str, description: &str) -> Result<i64> {
        let writer = self.catalog.writer()?;
        writer.execute(
            "INSERT INTO pools (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, Utc::now().to_rfc3339()],
        )?;
        Ok(writer.last_insert_rowid())
    }

    pub fn update_pool(&self, pool_id: i64, name: &str, description: &str) -> Result<()> {
        let writer = self.catalog.writer()?;
        let changed = writer.execute(
            "UPDATE pools SET name = ?1, description = ?2 WHERE id = ?3",
            params![name, description, pool_id],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound(format!("pool {}", pool_id)));
        }
        Ok(())
    }

    pub fn delete_pool(&self, pool_id: i64) -> Result<bool> {
        let writer = self.catalog.writer()?;
        Ok(writer.execute("DELETE FROM pools WHERE id = ?1", [pool_id])? > 0)
    }

    pub fn all_pools(&self) -> Result<Vec<PoolSummary>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT p.id, p.name, p.description, COUNT(pi.image_id) AS image_count
             FROM pools p
             LEFT JOIN pool_images pi ON pi.pool_id = p.id
             GROUP BY p.id ORDER BY p.name",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PoolSummary {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    description: r.get(2)?,
                    image_count: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pool_details(&self, pool_id: i64) -> Result<PoolDetails> {
        let reader = self.catalog.reader()?;
        let header = reader
            .query_row(
                "SELECT id, name, description FROM pools WHERE id = ?1",
                [pool_id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::NotFound(format!("pool {}", pool_id)))?;

        let mut stmt = reader.prepare(
            "SELECT pi.position, i.id, i.filepath
             FROM pool_images pi
             JOIN images i ON i.id = pi.image_id
             WHERE pi.pool_id = ?1 ORDER BY pi.position",
        )?;
        let images = stmt
            .query_map([pool_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PoolDetails {
            id: header.0,
            name: header.1,
            description: header.2,
            images,
        })
    }

    /// Append an image at the end of a pool. No-op if already a member.
    pub fn add_image(&self, pool_id: i64, image_id: i64) -> Result<bool> {
        let writer = self.catalog.writer()?;
        let next: i64 = writer.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM pool_images WHERE pool_id = ?1",
            [pool_id],
            |r| r.get(0),
        )?;
        let inserted = writer.execute(
            "INSERT OR IGNORE INTO pool_images (pool_id, image_id, position) VALUES (?1, ?2, ?3)",
            params![pool_id, image_id, next],
        )?;
        Ok(inserted > 0)
    }

    /// Remove an image and close the position gap.
    pub fn remove_image(&self, pool_id: i64, image_id: i64) -> Result<bool> {
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let removed_position: Option<i64> = tx
            .query_row(
                "SELECT position FROM pool_images WHERE pool_id = ?1 AND image_id = ?2",
                params![pool_id, image_id],
                |r| r.get(0),
            )
            .optional()?;
        let position = match removed_position {
            Some(p) => p,
            None => return Ok(false),
        };
        tx.execute(
            "DELETE FROM pool_images WHERE pool_id = ?1 AND image_id = ?2",
            params![pool_id, image_id],
        )?;
        tx.execute(
            "UPDATE pool_images SET position = position - 1
             WHERE pool_id = ?1 AND position > ?2",
            params![pool_id, position],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Re-sequence a pool to the given order; members absent from `ordered`
    /// keep their relative order after it.
    pub fn reorder(&self, pool_id: i64, ordered: &[i64]) -> Result<()> {
        let current: Vec<i64> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT image_id FROM pool_images WHERE pool_id = ?1 ORDER BY position",
            )?;
            let rows = stmt
                .query_map([pool_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            rows
        };

        let mut sequence: Vec<i64> = ordered
            .iter()
            .copied()
            .filter(|id| current.contains(id))
            .collect();
        for id in current {
            if !sequence.contains(&id) {
                sequence.push(id);
            }
        }

        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        // Two passes avoid transient unique collisions on (pool, position)
        for (idx, image_id) in sequence.iter().enumerate() {
            tx.execute(
                "UPDATE pool_images SET position = ?1 WHERE pool_id = ?2 AND image_id = ?3",
                params![-(idx as i64 + 1), pool_id, image_id],
            )?;
        }
        tx.execute(
            "UPDATE pool_images SET position = -position WHERE pool_id = ?1",
            [pool_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn pools_for_image(&self, image_id: i64) -> Result<Vec<PoolSummary>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT p.id, p.name, p.description,
                    (SELECT COUNT(*) FROM pool_images x WHERE x.pool_id = p.id) AS image_count
             FROM pools p
             JOIN pool_images pi ON pi.pool_id = p.id
             WHERE pi.image_id = ?1 ORDER BY p.name",
        )?;
        let rows = stmt
            .query_map([image_id], |r| {
                Ok(PoolSummary {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    description: r.get(2)?,
                    image_count: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn search_pools(&self, fragment: &str) -> Result<Vec<PoolSummary>> {
        let pattern = format!("%{}%", fragment.to_lowercase());
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT p.id, p.name, p.description, COUNT(pi.image_id) AS image_count
             FROM pools p
             LEFT JOIN pool_images pi ON pi.pool_id = p.id
             WHERE LOWER(p.name) LIKE ?1
             GROUP BY p.id ORDER BY p.name",
        )?;
        let rows = stmt
            .query_map([pattern], |r| {
                Ok(PoolSummary {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    description: r.get(2)?,
                    image_count: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Image ids in the named pool, position order. Used by the `pool:` query
    /// token.
    pub fn image_ids_by_pool_name(&self, name: &str) -> Result<Vec<i64>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT pi.image_id FROM pool_images pi
             JOIN pools p ON p.id = pi.pool_id
             WHERE LOWER(p.name) = LOWER(?1)
             ORDER BY pi.position",
        )?;
        let rows = stmt
            .query_map([name], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;

    fn setup() -> (Arc<Catalog>, PoolRepository, Vec<i64>) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let ids = (0..4)
            .map(|i| {
                catalog
                    .commit_ingest(&sample_commit(&format!("img{}.jpg", i), &format!("md5{}", i)))
                    .unwrap()
            })
            .collect();
        let pools = PoolRepository::new(catalog.clone());
        (catalog, pools, ids)
    }

    fn positions(pools: &PoolRepository, pool_id: i64) -> Vec<(i64, i64)> {
        pools
            .pool_details(pool_id)
            .unwrap()
            .images
            .iter()
            .map(|(pos, id, _)| (*pos, *id))
            .collect()
    }

    #[test]
    fn add_assigns_contiguous_positions() {
        let (_c, pools, ids) = setup();
        let pool = pools.create_pool("story", "a short story").unwrap();
        for id in &ids[..3] {
            pools.add_image(pool, *id).unwrap();
        }
        assert_eq!(
            positions(&pools, pool),
            vec![(1, ids[0]), (2, ids[1]), (3, ids[2])]
        );
        // Re-adding is a no-op
        assert!(!pools.add_image(pool, ids[0]).unwrap());
    }

    #[test]
    fn remove_closes_gaps() {
        let (_c, pools, ids) = setup();
        let pool = pools.create_pool("story", "").unwrap();
        for id in &ids[..3] {
            pools.add_image(pool, *id).unwrap();
        }
        pools.remove_image(pool, ids[1]).unwrap();
        assert_eq!(positions(&pools, pool), vec![(1, ids[0]), (2, ids[2])]);
    }

    #[test]
    fn reorder_renumbers_from_one() {
        let (_c, pools, ids) = setup();
        let pool = pools.create_pool("story", "").unwrap();
        for id in &ids[..3] {
            pools.add_image(pool, *id).unwrap();
        }
        pools.reorder(pool, &[ids[2], ids[0], ids[1]]).unwrap();
        assert_eq!(
            positions(&pools, pool),
            vec![(1, ids[2]), (2, ids[0]), (3, ids[1])]
        );
    }

    #[test]
    fn lookup_by_name_and_for_image() {
        let (_c, pools, ids) = setup();
        let pool = pools.create_pool("My Story", "").unwrap();
        pools.add_image(pool, ids[0]).unwrap();

        assert_eq!(pools.image_ids_by_pool_name("my story").unwrap(), vec![ids[0]]);
        let memberships = pools.pools_for_image(ids[0]).unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].name, "My Story");
        assert!(pools.pools_for_image(ids[3]).unwrap().is_empty());
    }
}
