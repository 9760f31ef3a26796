//! Database Migrations
//!
//! Schema migration definitions for the catalog store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: images, tags, sources, raw metadata",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Delta journal, implications, pools, image relations",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Similarity: embeddings, duplicate pairs, suggestion and similars caches",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Config store for the priority monitor",
        up: MIGRATION_V4_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Core entities
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT NOT NULL UNIQUE,
    md5 TEXT NOT NULL UNIQUE,
    image_width INTEGER NOT NULL DEFAULT 0,
    image_height INTEGER NOT NULL DEFAULT 0,
    file_size INTEGER NOT NULL DEFAULT 0,
    ingested_at TEXT NOT NULL,
    active_source TEXT,

    -- Denormalized categorized tag columns, kept coherent with image_tags
    tags_character TEXT NOT NULL DEFAULT '',
    tags_copyright TEXT NOT NULL DEFAULT '',
    tags_artist TEXT NOT NULL DEFAULT '',
    tags_species TEXT NOT NULL DEFAULT '',
    tags_meta TEXT NOT NULL DEFAULT '',
    tags_general TEXT NOT NULL DEFAULT '',

    -- Active-source post linkage
    post_id INTEGER,
    parent_id INTEGER,
    has_children INTEGER NOT NULL DEFAULT 0,

    -- Perceptual fingerprints (lowercase hex)
    phash TEXT,
    colorhash TEXT,

    rating TEXT,
    -- Source-provided passthrough
    score INTEGER
);

CREATE INDEX IF NOT EXISTS idx_images_md5 ON images(md5);
CREATE INDEX IF NOT EXISTS idx_images_phash ON images(phash);
CREATE INDEX IF NOT EXISTS idx_images_post_id ON images(post_id);
CREATE INDEX IF NOT EXISTS idx_images_ingested ON images(ingested_at);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL DEFAULT 'general',
    extended_category TEXT
);

CREATE INDEX IF NOT EXISTS idx_tags_category ON tags(category);

CREATE TABLE IF NOT EXISTS image_tags (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    -- 'original' | 'implication' | 'ai_inference'
    origin TEXT NOT NULL DEFAULT 'original',
    PRIMARY KEY (image_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_image_tags_origin ON image_tags(origin);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS image_sources (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    PRIMARY KEY (image_id, source_id)
);

-- Retained ground truth for the rebuild engine: one JSON document per image
CREATE TABLE IF NOT EXISTS raw_metadata (
    image_id INTEGER PRIMARY KEY REFERENCES images(id) ON DELETE CASCADE,
    data TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Curation state
const MIGRATION_V2_UP: &str = r#"
-- Manual tag edits, keyed by MD5 so they survive full rebuilds
CREATE TABLE IF NOT EXISTS tag_deltas (
    image_md5 TEXT NOT NULL,
    tag_name TEXT NOT NULL,
    tag_category TEXT NOT NULL DEFAULT 'general',
    -- 'add' | 'remove'
    operation TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (image_md5, tag_name, operation)
);

CREATE INDEX IF NOT EXISTS idx_tag_deltas_md5 ON tag_deltas(image_md5);
CREATE INDEX IF NOT EXISTS idx_tag_deltas_time ON tag_deltas(timestamp);

CREATE TABLE IF NOT EXISTS tag_implications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    implied_tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    -- 'naming_pattern' | 'correlation' | 'manual'
    inference_type TEXT NOT NULL DEFAULT 'manual',
    confidence REAL NOT NULL DEFAULT 1.0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    UNIQUE (source_tag_id, implied_tag_id)
);

CREATE INDEX IF NOT EXISTS idx_implications_source ON tag_implications(source_tag_id);
CREATE INDEX IF NOT EXISTS idx_implications_implied ON tag_implications(implied_tag_id);

CREATE TABLE IF NOT EXISTS pools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pool_images (
    pool_id INTEGER NOT NULL REFERENCES pools(id) ON DELETE CASCADE,
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    -- 1-indexed, contiguous per pool
    position INTEGER NOT NULL,
    PRIMARY KEY (pool_id, image_id)
);

CREATE INDEX IF NOT EXISTS idx_pool_images_pool ON pool_images(pool_id, position);

-- parent_child rows store (parent, child); other types store (min, max).
-- No foreign keys: a non_duplicate row must outlive a deleted partner so the
-- survivor never re-queues against it.
CREATE TABLE IF NOT EXISTS image_relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id_a INTEGER NOT NULL,
    image_id_b INTEGER NOT NULL,
    -- 'non_duplicate' | 'parent_child' | 'sibling'
    relation_type TEXT NOT NULL,
    -- 'manual' | 'ingested' | 'duplicate_review'
    source TEXT NOT NULL DEFAULT 'manual',
    created_at TEXT NOT NULL,
    UNIQUE (image_id_a, image_id_b, relation_type)
);

CREATE INDEX IF NOT EXISTS idx_relations_a ON image_relations(image_id_a);
CREATE INDEX IF NOT EXISTS idx_relations_b ON image_relations(image_id_b);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Similarity subsystem
const MIGRATION_V3_UP: &str = r#"
-- Embedding vectors as little-endian f32 BLOBs
CREATE TABLE IF NOT EXISTS embeddings (
    image_id INTEGER PRIMARY KEY REFERENCES images(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Pre-computed pHash pairs within the scan threshold; (image_id_a < image_id_b)
CREATE TABLE IF NOT EXISTS duplicate_pairs (
    image_id_a INTEGER NOT NULL,
    image_id_b INTEGER NOT NULL,
    distance INTEGER NOT NULL,
    threshold INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (image_id_a, image_id_b)
);

CREATE INDEX IF NOT EXISTS idx_duplicate_pairs_distance ON duplicate_pairs(distance);

-- Cached per-pair visual-diff signals for the review queue
CREATE TABLE IF NOT EXISTS duplicate_pair_suggestions (
    image_id_a INTEGER NOT NULL,
    image_id_b INTEGER NOT NULL,
    signal REAL NOT NULL,
    visual_signal REAL NOT NULL,
    metadata_adjustment REAL NOT NULL,
    mean_abs_diff REAL NOT NULL,
    changed_ratio REAL NOT NULL,
    largest_blob_ratio REAL NOT NULL,
    blob_count INTEGER NOT NULL,
    peak_blob_contrast REAL NOT NULL,
    mask_mismatch REAL NOT NULL,
    pixel_ratio REAL NOT NULL,
    filesize_ratio REAL NOT NULL,
    tag_gap_ratio REAL NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (image_id_a, image_id_b)
);

CREATE INDEX IF NOT EXISTS idx_pair_suggestions_signal ON duplicate_pair_suggestions(signal);

-- Top-N similars per (source image, similarity type), ranked
CREATE TABLE IF NOT EXISTS similar_images_cache (
    source_image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    similar_image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    similarity_score REAL NOT NULL,
    -- 'visual' | 'semantic' | 'tag' | 'blended'
    similarity_type TEXT NOT NULL,
    rank INTEGER NOT NULL,
    PRIMARY KEY (source_image_id, similarity_type, rank)
);

CREATE INDEX IF NOT EXISTS idx_similars_source ON similar_images_cache(source_image_id, similarity_type);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// V4: Key/value config store (priority hash lives here)
const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS config_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

UPDATE schema_version SET version = 4, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrations_apply_cleanly_and_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(
            get_current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );

        // Second run is a no-op
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn versions_are_strictly_increasing() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last, "migration versions must increase");
            last = m.version;
        }
    }
}
