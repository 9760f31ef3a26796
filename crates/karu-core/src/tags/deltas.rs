//! Tag delta journal
//!
//! Append-only log of manual tag edits, keyed by image MD5 so entries
//! survive full catalog rebuilds. Recording an operation opposite to the
//! latest outstanding one for the same (MD5, tag) cancels both rows, which
//! keeps the journal minimal and makes replay idempotent under repeated
//! edits. The journal is retained after replay; a rebuild is free to run
//! again at any time.

use chrono::Utc;
use rusqlite::params;

use crate::catalog::{Catalog, CategorizedTags, DeltaOp, Result, TagCategory, TagOrigin};
use crate::tags::normalize_tag_name;

/// Net view of an image's journal: what manual edits are outstanding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaView {
    pub added: Vec<(String, TagCategory)>,
    pub removed: Vec<(String, TagCategory)>,
}

/// Record one journal operation with cancellation.
///
/// If an outstanding opposite operation exists for the same (MD5, tag), that
/// row is deleted and nothing is inserted (net zero).
pub fn record_delta(
    catalog: &Catalog,
    image_md5: &str,
    tag_name: &str,
    tag_category: TagCategory,
    operation: DeltaOp,
) -> Result<()> {
    let writer = catalog.writer()?;
    record_delta_tx(&writer, image_md5, tag_name, tag_category, operation)
}

pub(crate) fn record_delta_tx(
    conn: &rusqlite::Connection,
    image_md5: &str,
    tag_name: &str,
    tag_category: TagCategory,
    operation: DeltaOp,
) -> Result<()> {
    let tag_name = normalize_tag_name(tag_name);
    let opposite = operation.opposite();

    let cancelled = conn.execute(
        "DELETE FROM tag_deltas WHERE image_md5 = ?1 AND tag_name = ?2 AND operation = ?3",
        params![image_md5, tag_name, opposite.as_str()],
    )?;

    if cancelled > 0 {
        tracing::debug!(
            md5 = image_md5,
            tag = %tag_name,
            op = operation.as_str(),
            "delta cancelled against outstanding {}",
            opposite.as_str()
        );
        return Ok(());
    }

    conn.execute(
        "INSERT OR REPLACE INTO tag_deltas (image_md5, tag_name, tag_category, operation, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            image_md5,
            tag_name,
            tag_category.as_str(),
            operation.as_str(),
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Compare an incoming categorized edit against the image's current tags and
/// return the per-tag operations this edit performs.
pub fn compute_deltas(
    catalog: &Catalog,
    filepath: &str,
    new_tags: &CategorizedTags,
) -> Result<Vec<(String, TagCategory, DeltaOp)>> {
    let image = match catalog.image_by_filepath(filepath)? {
        Some(img) => img,
        None => return Ok(vec![]),
    };
    Ok(diff_tag_sets(&image.categorized_tags(), new_tags))
}

/// Pure diff of two categorized tag sets.
pub(crate) fn diff_tag_sets(
    old: &CategorizedTags,
    new: &CategorizedTags,
) -> Vec<(String, TagCategory, DeltaOp)> {
    use std::collections::BTreeSet;
    let mut deltas = Vec::new();
    for category in TagCategory::DENORMALIZED {
        let old_set: BTreeSet<String> = old
            .category(category)
            .iter()
            .map(|t| normalize_tag_name(t))
            .collect();
        let new_set: BTreeSet<String> = new
            .category(category)
            .iter()
            .map(|t| normalize_tag_name(t))
            .collect();
        for added in new_set.difference(&old_set) {
            deltas.push((added.clone(), category, DeltaOp::Add));
        }
        for removed in old_set.difference(&new_set) {
            deltas.push((removed.clone(), category, DeltaOp::Remove));
        }
    }
    deltas
}

/// Replay the whole journal in timestamp order against the normalized
/// relation. Returns the number of applied operations. The caller is
/// responsible for rebuilding the denormalized columns afterwards.
pub fn apply_deltas(catalog: &Catalog) -> Result<usize> {
    struct Row {
        image_md5: String,
        tag_name: String,
        tag_category: TagCategory,
        operation: DeltaOp,
    }

    let rows: Vec<Row> = {
        let reader = catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT image_md5, tag_name, tag_category, operation
             FROM tag_deltas ORDER BY timestamp, image_md5, tag_name",
        )?;
        let mapped = stmt.query_map([], |r| {
            let category: String = r.get(2)?;
            let op: String = r.get(3)?;
            Ok(Row {
                image_md5: r.get(0)?,
                tag_name: r.get(1)?,
                tag_category: TagCategory::parse_name(&category),
                operation: DeltaOp::parse_name(&op).unwrap_or(DeltaOp::Add),
            })
        })?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };

    if rows.is_empty() {
        return Ok(0);
    }

    let mut writer = catalog.writer()?;
    let tx = writer.transaction()?;
    let mut applied = 0usize;

    for row in rows {
        let image_id: Option<i64> = {
            use rusqlite::OptionalExtension;
            tx.query_row(
                "SELECT id FROM images WHERE md5 = ?1",
                [&row.image_md5],
                |r| r.get(0),
            )
            .optional()?
        };
        let image_id = match image_id {
            Some(id) => id,
            None => {
                tracing::warn!(md5 = %row.image_md5, tag = %row.tag_name, "delta skipped, image gone");
                continue;
            }
        };

        match row.operation {
            DeltaOp::Add => {
                let tag_id = Catalog::upsert_tag_tx(&tx, &row.tag_name, row.tag_category)?;
                Catalog::link_tag_tx(&tx, image_id, tag_id, TagOrigin::Original)?;
            }
            DeltaOp::Remove => {
                tx.execute(
                    "DELETE FROM image_tags
                     WHERE image_id = ?1 AND tag_id = (SELECT id FROM tags WHERE name = ?2)",
                    params![image_id, row.tag_name],
                )?;
            }
        }
        applied += 1;
    }

    tx.commit()?;
    Ok(applied)
}

/// Net outstanding edits for one image, computed by folding the journal in
/// order: an add followed by a remove of the same tag vanishes.
pub fn image_deltas(catalog: &Catalog, filepath: &str) -> Result<DeltaView> {
    let image = match catalog.image_by_filepath(filepath)? {
        Some(img) => img,
        None => return Ok(DeltaView::default()),
    };

    let reader = catalog.reader()?;
    let mut stmt = reader.prepare(
        "SELECT tag_name, tag_category, operation FROM tag_deltas
         WHERE image_md5 = ?1 ORDER BY timestamp",
    )?;
    let rows = stmt
        .query_map([&image.md5], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut states: std::collections::BTreeMap<String, (DeltaOp, TagCategory)> =
        std::collections::BTreeMap::new();
    for (tag, category, op) in rows {
        let category = TagCategory::parse_name(&category);
        match DeltaOp::parse_name(&op) {
            Some(DeltaOp::Add) => {
                states.insert(tag, (DeltaOp::Add, category));
            }
            Some(DeltaOp::Remove) => {
                if matches!(states.get(&tag), Some((DeltaOp::Add, _))) {
                    states.remove(&tag);
                } else {
                    states.insert(tag, (DeltaOp::Remove, category));
                }
            }
            None => {}
        }
    }

    let mut view = DeltaView::default();
    for (tag, (op, category)) in states {
        match op {
            DeltaOp::Add => view.added.push((tag, category)),
            DeltaOp::Remove => view.removed.push((tag, category)),
        }
    }
    Ok(view)
}

/// Drop every journal row. Returns the number removed.
pub fn clear_deltas(catalog: &Catalog) -> Result<usize> {
    let writer = catalog.writer()?;
    Ok(writer.execute("DELETE FROM tag_deltas", [])?)
}

/// Drop the journal rows for one image.
pub fn clear_deltas_for_md5(catalog: &Catalog, md5: &str) -> Result<usize> {
    let writer = catalog.writer()?;
    Ok(writer.execute("DELETE FROM tag_deltas WHERE image_md5 = ?1", [md5])?)
}

// ============================================================================
// TESTS
// ============================================================================
