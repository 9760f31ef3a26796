//! SQLite Catalog Store
//!
//! Relational persistence for images, tags, source linkages, raw metadata,
//! relations, the delta journal, pools, implications, and the similarity
//! caches. All mutators funnel through this type.
//!
//! Uses separate reader/writer connections behind mutexes so `Catalog` is
//! `Send + Sync` and shareable as `Arc<Catalog>` without an outer lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::migrations;
use super::types::{
    CategorizedTags, ImageRecord, Rating, RawMetadata, TagCategory, TagOrigin, TagRecord,
};
use crate::semantic::embedding_to_bytes;
use crate::tags::normalize_tag_name;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Catalog error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Unique-constraint violation (duplicate MD5 or filepath)
    #[error("Duplicate: {0}")]
    Duplicate(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed stored JSON
    #[error("Malformed metadata: {0}")]
    Json(#[from] serde_json::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Catalog result type
pub type Result<T> = std::result::Result<T, CatalogError>;

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// INGEST COMMIT INPUT
// ============================================================================

/// Everything one ingest worker produced for a single artifact, committed in
/// one transaction.
#[derive(Debug, Clone)]
pub struct IngestCommit {
    pub filepath: String,
    pub md5: String,
    pub width: i64,
    pub height: i64,
    pub file_size: i64,
    pub active_source: Option<String>,
    pub tags: CategorizedTags,
    pub post_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub has_children: bool,
    pub score: Option<i64>,
    /// Rating plus its trust origin (`original` for danbooru/e621,
    /// `ai_inference` for the local tagger).
    pub rating: Option<(Rating, TagOrigin)>,
    /// Every source that contributed metadata.
    pub source_names: Vec<String>,
    pub raw_metadata: RawMetadata,
    pub phash: Option<String>,
    pub colorhash: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

// ============================================================================
// CATALOG
// ============================================================================

/// The catalog store
pub struct Catalog {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Catalog {
    /// Apply PRAGMAs shared by every connection.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(path)?;
        Self::configure_connection(&writer)?;
        migrations::apply_migrations(&writer)?;

        let reader = Connection::open(path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory catalog for tests. Reader and writer share one connection
    /// because separate `:memory:` handles would see different databases.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        migrations::apply_migrations(&writer)?;
        // A second in-memory handle cannot see the first one's tables, so
        // route reads through the writer connection as well.
        let reader = Connection::open_in_memory()?;
        migrations::apply_migrations(&reader)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: None,
        })
    }

    /// Filesystem path of the database, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive writer connection. Mutators that need multi-statement
    /// atomicity take this and open a transaction on it.
    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| CatalogError::Init("Writer lock poisoned".into()))
    }

    /// Shared reader connection.
    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        // In-memory catalogs have independent connections; route reads
        // through the writer so both see the same database.
        if self.path.is_none() {
            return self.writer();
        }
        self.reader
            .lock()
            .map_err(|_| CatalogError::Init("Reader lock poisoned".into()))
    }

    // ========================================================================
    // IMAGE READS
    // ========================================================================

    fn map_image_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
        let ingested_at: String = row.get("ingested_at")?;
        Ok(ImageRecord {
            id: row.get("id")?,
            filepath: row.get("filepath")?,
            md5: row.get("md5")?,
            width: row.get("image_width")?,
            height: row.get("image_height")?,
            file_size: row.get("file_size")?,
            ingested_at: DateTime::parse_from_rfc3339(&ingested_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            active_source: row.get("active_source")?,
            tags_character: row.get("tags_character")?,
            tags_copyright: row.get("tags_copyright")?,
            tags_artist: row.get("tags_artist")?,
            tags_species: row.get("tags_species")?,
            tags_meta: row.get("tags_meta")?,
            tags_general: row.get("tags_general")?,
            post_id: row.get("post_id")?,
            parent_id: row.get("parent_id")?,
            has_children: row.get::<_, i64>("has_children")? != 0,
            phash: row.get("phash")?,
            colorhash: row.get("colorhash")?,
            rating: row.get("rating")?,
            score: row.get("score")?,
        })
    }

    pub fn image_by_id(&self, id: i64) -> Result<Option<ImageRecord>> {
        let reader = self.reader()?;
        let rec = reader
            .query_row("SELECT * FROM images WHERE id = ?1", [id], Self::map_image_row)
            .optional()?;
        Ok(rec)
    }

    pub fn image_by_filepath(&self, filepath: &str) -> Result<Option<ImageRecord>> {
        let reader = self.reader()?;
        let rec = reader
            .query_row(
                "SELECT * FROM images WHERE filepath = ?1",
                [filepath],
                Self::map_image_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn image_by_md5(&self, md5: &str) -> Result<Option<ImageRecord>> {
        let reader = self.reader()?;
        let rec = reader
            .query_row("SELECT * FROM images WHERE md5 = ?1", [md5], Self::map_image_row)
            .optional()?;
        Ok(rec)
    }

    pub fn md5_exists(&self, md5: &str) -> Result<bool> {
        let reader = self.reader()?;
        let exists = reader
            .query_row("SELECT 1 FROM images WHERE md5 = ?1", [md5], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn image_count(&self) -> Result<i64> {
        let reader = self.reader()?;
        Ok(reader.query_row("SELECT COUNT(*) FROM images", [], |r| r.get(0))?)
    }

    pub fn all_filepaths(&self) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT filepath FROM images")?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn all_images(&self) -> Result<Vec<ImageRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT * FROM images ORDER BY id")?;
        let rows = stmt
            .query_map([], Self::map_image_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn all_image_ids(&self) -> Result<Vec<i64>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT id FROM images ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    /// (id, phash hex) for every image with a stored pHash, ordered by id.
    pub fn images_with_phash(&self) -> Result<Vec<(i64, String)>> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT id, phash FROM images WHERE phash IS NOT NULL ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // INGEST COMMIT
    // ========================================================================

    /// Commit one analyzed artifact in a single transaction.
    ///
    /// Returns the new image id, or `CatalogError::Duplicate` when the MD5
    /// or filepath already exists (the transaction rolls back).
    pub fn commit_ingest(&self, commit: &IngestCommit) -> Result<i64> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let image_id = match Self::commit_ingest_tx(&tx, commit) {
            Ok(id) => id,
            Err(CatalogError::Database(e)) if is_unique_violation(&e) => {
                drop(tx);
                return Err(CatalogError::Duplicate(commit.md5.clone()));
            }
            Err(e) => {
                drop(tx);
                return Err(e);
            }
        };
        tx.commit()?;
        Ok(image_id)
    }

    fn commit_ingest_tx(tx: &Transaction<'_>, commit: &IngestCommit) -> Result<i64> {
        let now = Utc::now().to_rfc3339();

        let mut tags = commit.tags.clone();
        tags.normalize();

        tx.execute(
            "INSERT INTO images (
                filepath, md5, image_width, image_height, file_size, ingested_at,
                active_source, tags_character, tags_copyright, tags_artist,
                tags_species, tags_meta, tags_general,
                post_id, parent_id, has_children,
                phash, colorhash, rating, score
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10,
                ?11, ?12, ?13,
                ?14, ?15, ?16,
                ?17, ?18, ?19, ?20
            )",
            params![
                commit.filepath,
                commit.md5,
                commit.width,
                commit.height,
                commit.file_size,
                now,
                commit.active_source,
                tags.column_value(TagCategory::Character),
                tags.column_value(TagCategory::Copyright),
                tags.column_value(TagCategory::Artist),
                tags.column_value(TagCategory::Species),
                tags.column_value(TagCategory::Meta),
                tags.column_value(TagCategory::General),
                commit.post_id,
                commit.parent_id,
                commit.has_children as i64,
                commit.phash,
                commit.colorhash,
                commit.rating.map(|(r, _)| r.as_str().to_string()),
                commit.score,
            ],
        )?;
        let image_id = tx.last_insert_rowid();

        // Normalized relation with categories
        for (category, tag_name) in tags.iter() {
            let normalized = normalize_tag_name(tag_name);
            if normalized.is_empty() {
                continue;
            }
            let category = if normalized.starts_with("rating:") {
                TagCategory::Rating
            } else {
                category
            };
            let tag_id = Self::upsert_tag_tx(tx, &normalized, category)?;
            Self::link_tag_tx(tx, image_id, tag_id, TagOrigin::Original)?;
        }

        // Rating tag, trust-laddered origin
        if let Some((rating, origin)) = commit.rating {
            if rating != Rating::Unknown {
                let tag_id = Self::upsert_tag_tx(tx, &rating.tag_name(), TagCategory::Rating)?;
                Self::link_tag_tx(tx, image_id, tag_id, origin)?;
            }
        }

        // Source linkage
        for name in &commit.source_names {
            let source_id = Self::upsert_source_tx(tx, name)?;
            tx.execute(
                "INSERT OR IGNORE INTO image_sources (image_id, source_id) VALUES (?1, ?2)",
                params![image_id, source_id],
            )?;
        }

        // Raw metadata blob, retained verbatim for the rebuild engine
        let blob = serde_json::to_string(&commit.raw_metadata)?;
        tx.execute(
            "INSERT OR REPLACE INTO raw_metadata (image_id, data) VALUES (?1, ?2)",
            params![image_id, blob],
        )?;

        // Embedding
        if let Some(vector) = &commit.embedding {
            tx.execute(
                "INSERT OR REPLACE INTO embeddings (image_id, embedding, dimensions, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![image_id, embedding_to_bytes(vector), vector.len() as i64, now],
            )?;
        }

        Ok(image_id)
    }

    // ========================================================================
    // TAG / SOURCE PRIMITIVES (transaction-scoped)
    // ========================================================================

    pub(crate) fn upsert_tag_tx(
        tx: &Connection,
        name: &str,
        category: TagCategory,
    ) -> Result<i64> {
        tx.execute(
            "INSERT INTO tags (name, category) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET category = excluded.category",
            params![name, category.as_str()],
        )?;
        let id = tx.query_row("SELECT id FROM tags WHERE name = ?1", [name], |r| r.get(0))?;
        Ok(id)
    }

    pub(crate) fn link_tag_tx(
        tx: &Connection,
        image_id: i64,
        tag_id: i64,
        origin: TagOrigin,
    ) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO image_tags (image_id, tag_id, origin) VALUES (?1, ?2, ?3)",
            params![image_id, tag_id, origin.as_str()],
        )?;
        Ok(())
    }

    pub(crate) fn upsert_source_tx(tx: &Connection, name: &str) -> Result<i64> {
        tx.execute(
            "INSERT OR IGNORE INTO sources (name) VALUES (?1)",
            params![name],
        )?;
        let id = tx.query_row("SELECT id FROM sources WHERE name = ?1", [name], |r| r.get(0))?;
        Ok(id)
    }

    // ========================================================================
    // TAG READS
    // ========================================================================

    pub fn tag_by_name(&self, name: &str) -> Result<Option<TagRecord>> {
        let reader = self.reader()?;
        let rec = reader
            .query_row(
                "SELECT t.id, t.name, t.category, t.extended_category,
                        (SELECT COUNT(*) FROM image_tags it WHERE it.tag_id = t.id) AS usage_count
                 FROM tags t WHERE t.name = ?1",
                [name],
                Self::map_tag_row,
            )
            .optional()?;
        Ok(rec)
    }

    fn map_tag_row(row: &Row<'_>) -> rusqlite::Result<TagRecord> {
        let category: String = row.get("category")?;
        Ok(TagRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            category: TagCategory::parse_name(&category),
            extended_category: row.get("extended_category")?,
            usage_count: row.get("usage_count")?,
        })
    }

    /// All tags, highest usage first.
    pub fn all_tags(&self) -> Result<Vec<TagRecord>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.id, t.name, t.category, t.extended_category,
                    COUNT(it.image_id) AS usage_count
             FROM tags t
             LEFT JOIN image_tags it ON it.tag_id = t.id
             GROUP BY t.id
             ORDER BY usage_count DESC, t.name",
        )?;
        let rows = stmt
            .query_map([], Self::map_tag_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Tag names (with origin) for one image, grouped by category.
    pub fn tags_for_image(&self, image_id: i64) -> Result<Vec<(String, TagCategory, TagOrigin)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.name, t.category, it.origin
             FROM image_tags it
             JOIN tags t ON t.id = it.tag_id
             WHERE it.image_id = ?1
             ORDER BY t.name",
        )?;
        let rows = stmt
            .query_map([image_id], |r| {
                let name: String = r.get(0)?;
                let category: String = r.get(1)?;
                let origin: String = r.get(2)?;
                Ok((
                    name,
                    TagCategory::parse_name(&category),
                    TagOrigin::parse_name(&origin),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Substring tag lookup for autocomplete: prefix matches first, then by
    /// usage count.
    pub fn search_tags(&self, fragment: &str, limit: usize) -> Result<Vec<TagRecord>> {
        let fragment = fragment.to_lowercase();
        let pattern = format!("%{}%", fragment);
        let prefix = format!("{}%", fragment);
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.id, t.name, t.category, t.extended_category,
                    COUNT(it.image_id) AS usage_count
             FROM tags t
             LEFT JOIN image_tags it ON it.tag_id = t.id
             WHERE t.name LIKE ?1
             GROUP BY t.id
             ORDER BY (t.name LIKE ?2) DESC, usage_count DESC, t.name
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![pattern, prefix, limit as i64], Self::map_tag_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SOURCES / RAW METADATA
    // ========================================================================

    pub fn sources_for_image(&self, image_id: i64) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT s.name FROM image_sources ims
             JOIN sources s ON s.id = ims.source_id
             WHERE ims.image_id = ?1 ORDER BY s.name",
        )?;
        let rows = stmt
            .query_map([image_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    pub fn raw_metadata(&self, image_id: i64) -> Result<Option<RawMetadata>> {
        let reader = self.reader()?;
        let data: Option<String> = reader
            .query_row(
                "SELECT data FROM raw_metadata WHERE image_id = ?1",
                [image_id],
                |r| r.get(0),
            )
            .optional()?;
        match data {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    /// Replace an image's retained raw-metadata document.
    pub fn store_raw_metadata(&self, image_id: i64, raw: &RawMetadata) -> Result<()> {
        let blob = serde_json::to_string(raw)?;
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO raw_metadata (image_id, data) VALUES (?1, ?2)",
            params![image_id, blob],
        )?;
        Ok(())
    }

    /// (image_id, raw blob) for every image, for the rebuild engine.
    pub fn all_raw_metadata(&self) -> Result<Vec<(i64, String)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT image_id, data FROM raw_metadata ORDER BY image_id")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // HASHES / EMBEDDINGS
    // ========================================================================

    pub fn set_hashes(
        &self,
        image_id: i64,
        phash: Option<&str>,
        colorhash: Option<&str>,
    ) -> Result<()> {
        let writer = self.writer()?;
        if let Some(p) = phash {
            writer.execute(
                "UPDATE images SET phash = ?1 WHERE id = ?2",
                params![p, image_id],
            )?;
        }
        if let Some(c) = colorhash {
            writer.execute(
                "UPDATE images SET colorhash = ?1 WHERE id = ?2",
                params![c, image_id],
            )?;
        }
        Ok(())
    }

    pub fn store_embedding(&self, image_id: i64, vector: &[f32]) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO embeddings (image_id, embedding, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                image_id,
                embedding_to_bytes(vector),
                vector.len() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn embedding_for_image(&self, image_id: i64) -> Result<Option<Vec<u8>>> {
        let reader = self.reader()?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT embedding FROM embeddings WHERE image_id = ?1",
                [image_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    /// (image_id, blob, stored dimension) for every embedding row.
    pub fn all_embeddings(&self) -> Result<Vec<(i64, Vec<u8>, i64)>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT image_id, embedding, dimensions FROM embeddings ORDER BY image_id")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_embedding(&self, image_id: i64) -> Result<bool> {
        let writer = self.writer()?;
        let n = writer.execute("DELETE FROM embeddings WHERE image_id = ?1", [image_id])?;
        Ok(n > 0)
    }

    // ========================================================================
    // DELETE
    // ========================================================================

    /// Remove an image's database footprint: the row itself (cascading the
    /// relation, source, raw-metadata, pool, and embedding rows) plus its
    /// duplicate-pair and similars cache entries. The caller owns file and
    /// thumbnail removal.
    pub fn delete_image(&self, image_id: i64) -> Result<Option<ImageRecord>> {
        let record = self.image_by_id(image_id)?;
        if record.is_none() {
            return Ok(None);
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "DELETE FROM duplicate_pairs WHERE image_id_a = ?1 OR image_id_b = ?1",
            [image_id],
        )?;
        tx.execute(
            "DELETE FROM duplicate_pair_suggestions WHERE image_id_a = ?1 OR image_id_b = ?1",
            [image_id],
        )?;
        tx.execute(
            "DELETE FROM similar_images_cache WHERE source_image_id = ?1 OR similar_image_id = ?1",
            [image_id],
        )?;
        tx.execute("DELETE FROM images WHERE id = ?1", [image_id])?;
        tx.commit()?;
        Ok(record)
    }

    // ========================================================================
    // CONFIG STORE
    // ========================================================================

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let value = reader
            .query_row(
                "SELECT value FROM config_store WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR REPLACE INTO config_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Image counts per contributing source.
    pub fn source_breakdown(&self) -> Result<BTreeMap<String, i64>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT s.name, COUNT(ims.image_id)
             FROM sources s
             JOIN image_sources ims ON ims.source_id = s.id
             GROUP BY s.id",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    /// Tag counts per base category.
    pub fn category_counts(&self) -> Result<BTreeMap<String, i64>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT category, COUNT(*) FROM tags GROUP BY category")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn avg_tags_per_image(&self) -> Result<f64> {
        let images = self.image_count()?;
        if images == 0 {
            return Ok(0.0);
        }
        let reader = self.reader()?;
        let links: i64 = reader.query_row("SELECT COUNT(*) FROM image_tags", [], |r| r.get(0))?;
        Ok(links as f64 / images as f64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_commit(filepath: &str, md5: &str) -> IngestCommit {
        IngestCommit {
            filepath: filepath.to_string(),
            md5: md5.to_string(),
            width: 800,
            height: 600,
            file_size: 12345,
            active_source: Some("danbooru".into()),
            tags: CategorizedTags {
                character: vec!["aoi_(sample)".into()],
                copyright: vec!["sample".into()],
                general: vec!["1girl".into(), "solo".into(), "smile".into(), "blue_hair".into()],
                ..Default::default()
            },
            post_id: Some(123456),
            parent_id: None,
            has_children: false,
            score: Some(42),
            rating: Some((Rating::General, TagOrigin::Original)),
            source_names: vec!["danbooru".into()],
            raw_metadata: RawMetadata {
                md5: md5.to_string(),
                relative_path: filepath.to_string(),
                ..Default::default()
            },
            phash: Some("00ff00ff00ff00ff".into()),
            colorhash: Some("0001abc".into()),
            embedding: Some(vec![0.5_f32; 8]),
        }
    }

    #[test]
    fn commit_and_read_back() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = catalog.commit_ingest(&sample_commit("a/b.jpg", "aaaa")).unwrap();

        let img = catalog.image_by_id(id).unwrap().unwrap();
        assert_eq!(img.filepath, "a/b.jpg");
        assert_eq!(img.tags_character, "aoi_(sample)");
        assert_eq!(img.tags_copyright, "sample");
        assert!(img.tags_general.contains("blue_hair"));
        assert_eq!(img.active_source.as_deref(), Some("danbooru"));
        assert_eq!(img.rating.as_deref(), Some("general"));
        assert_eq!(img.score, Some(42));

        // Rating tag landed with category 'rating' and origin 'original'
        let tags = catalog.tags_for_image(id).unwrap();
        let rating = tags.iter().find(|(n, _, _)| n == "rating:general").unwrap();
        assert_eq!(rating.1, TagCategory::Rating);
        assert_eq!(rating.2, TagOrigin::Original);

        assert_eq!(catalog.sources_for_image(id).unwrap(), vec!["danbooru"]);
        assert!(catalog.md5_exists("aaaa").unwrap());
        assert!(catalog.raw_metadata(id).unwrap().is_some());
    }

    #[test]
    fn duplicate_md5_rolls_back() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.commit_ingest(&sample_commit("a.jpg", "same")).unwrap();
        let err = catalog
            .commit_ingest(&sample_commit("b.jpg", "same"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(_)));
        // Nothing from the rolled-back commit is visible
        assert!(catalog.image_by_filepath("b.jpg").unwrap().is_none());
        assert_eq!(catalog.image_count().unwrap(), 1);
    }

    #[test]
    fn delete_image_clears_caches() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.commit_ingest(&sample_commit("a.jpg", "m1")).unwrap();
        let b = catalog.commit_ingest(&sample_commit("b.jpg", "m2")).unwrap();
        {
            let writer = catalog.writer().unwrap();
            writer
                .execute(
                    "INSERT INTO duplicate_pairs (image_id_a, image_id_b, distance, threshold, computed_at)
                     VALUES (?1, ?2, 2, 15, 'now')",
                    params![a.min(b), a.max(b)],
                )
                .unwrap();
        }
        let removed = catalog.delete_image(b).unwrap();
        assert!(removed.is_some());
        let reader = catalog.reader().unwrap();
        let pairs: i64 = reader
            .query_row("SELECT COUNT(*) FROM duplicate_pairs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pairs, 0);
    }

    #[test]
    fn config_store_roundtrip() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.config_get("k").unwrap().is_none());
        catalog.config_set("k", "v1").unwrap();
        catalog.config_set("k", "v2").unwrap();
        assert_eq!(catalog.config_get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn search_tags_prefers_prefix() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.commit_ingest(&sample_commit("a.jpg", "m1")).unwrap();
        let hits = catalog.search_tags("blu", 10).unwrap();
        assert_eq!(hits[0].name, "blue_hair");
    }
}
