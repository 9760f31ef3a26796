//! Rebuild engine
//!
//! Full catalog re-derivation from the retained raw per-source payloads:
//! clears the normalized relation, the source set, and the tags table, then
//! reinserts everything honoring the configured priority order (or the
//! merged default), reruns recategorization, regenerates the denormalized
//! columns, and finally replays the delta journal so manual edits survive.
//! Raw metadata, pools, and the relation graph are never touched.
//!
//! The priority monitor hashes the configured `BOORU_PRIORITY` list and
//! triggers a rebuild whenever the stored hash differs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::catalog::{Catalog, RawMetadata};
use crate::config::Config;
use crate::monitor::{LogLevel, MonitorService};
use crate::sources::{self, SourceId};
use crate::tags::{apply_deltas, TagRepository};

/// Config-store key holding the last applied priority hash.
pub const PRIORITY_HASH_KEY: &str = "booru_priority_hash";

// ============================================================================
// TYPES
// ============================================================================

/// Rebuild statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildStats {
    pub images_processed: usize,
    pub images_skipped: usize,
    pub deltas_applied: usize,
    pub rules_restored: usize,
    pub tags_recategorized: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The rebuild engine.
pub struct RebuildEngine {
    catalog: Arc<Catalog>,
    config: Config,
    monitor: Arc<MonitorService>,
}

impl RebuildEngine {
    pub fn new(catalog: Arc<Catalog>, config: Config, monitor: Arc<MonitorService>) -> Self {
        Self {
            catalog,
            config,
            monitor,
        }
    }

    /// Full rebuild from raw metadata. Idempotent; may be re-run at any time.
    pub fn full_rebuild(
        &self,
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> crate::catalog::Result<RebuildStats> {
        let was_running = self.monitor.is_running();
        self.monitor.set_running(false);
        self.monitor
            .add_log("Rebuilding catalog from raw metadata", LogLevel::Info);

        let mut stats = RebuildStats::default();
        let repo = TagRepository::new(self.catalog.clone());

        // Implication rules reference tag ids; snapshot them by name so they
        // survive the tags-table clear
        let rules = self.snapshot_rules()?;

        let blobs = self.catalog.all_raw_metadata()?;
        let total = blobs.len();

        {
            let mut writer = self.catalog.writer()?;
            let tx = writer.transaction()?;

            tx.execute("DELETE FROM image_tags", [])?;
            tx.execute("DELETE FROM image_sources", [])?;
            tx.execute("DELETE FROM tags", [])?;
            for source in SourceId::ALL {
                Catalog::upsert_source_tx(&tx, source.as_str())?;
            }

            for (done, (image_id, blob)) in blobs.iter().enumerate() {
                let raw: RawMetadata = match serde_json::from_str(blob) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(image_id, "skipping malformed raw metadata: {}", e);
                        stats.images_skipped += 1;
                        continue;
                    }
                };

                let mut hits = BTreeMap::new();
                for (name, payload) in &raw.sources {
                    if let Some(id) = SourceId::parse_name(name) {
                        if let Some(hit) = sources::hit_from_raw(id, payload) {
                            hits.insert(id.as_str().to_string(), hit);
                        }
                    }
                }

                let selection = sources::select_active(
                    &hits,
                    &self.config.booru_priority,
                    self.config.use_merged_sources_by_default,
                );
                match selection {
                    Some(selection) => {
                        TagRepository::apply_selection_tx(&tx, *image_id, &selection)?;
                        for name in hits.keys() {
                            let source_id = Catalog::upsert_source_tx(&tx, name)?;
                            tx.execute(
                                "INSERT OR IGNORE INTO image_sources (image_id, source_id) VALUES (?1, ?2)",
                                rusqlite::params![image_id, source_id],
                            )?;
                        }
                        stats.images_processed += 1;
                    }
                    None => stats.images_skipped += 1,
                }

                if let Some(cb) = progress {
                    if done % 50 == 0 || done + 1 == total {
                        cb(done + 1, total);
                    }
                }
            }

            tx.commit()?;
        }

        stats.rules_restored = self.restore_rules(&rules)?;
        stats.tags_recategorized = repo.recategorize_misplaced_tags()?;
        repo.rebuild_denormalized_all()?;

        stats.deltas_applied = apply_deltas(&self.catalog)?;
        if stats.deltas_applied > 0 {
            repo.rebuild_denormalized_all()?;
        }

        self.monitor.add_log(
            format!(
                "Rebuild complete: {} images, {} deltas replayed",
                stats.images_processed, stats.deltas_applied
            ),
            LogLevel::Success,
        );
        self.monitor.set_running(was_running);
        Ok(stats)
    }

    fn snapshot_rules(&self) -> crate::catalog::Result<Vec<(String, String, String, f64, String, String)>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT ts.name, ti2.name, ti.inference_type, ti.confidence, ti.status, ti.created_at
             FROM tag_implications ti
             JOIN tags ts ON ts.id = ti.source_tag_id
             JOIN tags ti2 ON ti2.id = ti.implied_tag_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn restore_rules(
        &self,
        rules: &[(String, String, String, f64, String, String)],
    ) -> crate::catalog::Result<usize> {
        if rules.is_empty() {
            return Ok(0);
        }
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        let mut restored = 0usize;
        for (source, implied, inference_type, confidence, status, created_at) in rules {
            let source_id =
                Catalog::upsert_tag_tx(&tx, source, crate::catalog::TagCategory::General)?;
            let implied_id =
                Catalog::upsert_tag_tx(&tx, implied, crate::catalog::TagCategory::General)?;
            restored += tx.execute(
                "INSERT OR IGNORE INTO tag_implications
                 (source_tag_id, implied_tag_id, inference_type, confidence, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![source_id, implied_id, inference_type, confidence, status, created_at],
            )?;
        }
        tx.commit()?;
        Ok(restored)
    }
}

// ============================================================================
// PRIORITY MONITOR
// ============================================================================

/// Hash of a priority list, stable across restarts.
pub fn priority_hash(priority: &[String]) -> String {
    let encoded = serde_json::to_string(priority).unwrap_or_default();
    format!("{:x}", md5::compute(encoded.as_bytes()))
}

/// Compare the configured priority against the stored hash; on a change,
/// rebuild and store the new hash. The first run only stores it.
///
/// Returns whether a rebuild ran.
pub fn check_priority_changes(engine: &RebuildEngine) -> crate::catalog::Result<bool> {
    let current = priority_hash(&engine.config.booru_priority);
    let stored = engine.catalog.config_get(PRIORITY_HASH_KEY)?;

    match stored {
        None => {
            tracing::info!("first run: storing booru priority hash");
            engine.catalog.config_set(PRIORITY_HASH_KEY, &current)?;
            Ok(false)
        }
        Some(stored) if stored == current => Ok(false),
        Some(_) => {
            engine.monitor.add_log(
                format!(
                    "BOORU_PRIORITY changed ({}), re-deriving all tags",
                    engine.config.booru_priority.join(" > ")
                ),
                LogLevel::Info,
            );
            engine.full_rebuild(None)?;
            engine.catalog.config_set(PRIORITY_HASH_KEY, &current)?;
            Ok(true)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;
    use crate::catalog::{DeltaOp, TagCategory};
    use crate::sources::tests::{danbooru_raw, e621_raw};
    use crate::tags::record_delta;

    fn engine_with_two_source_image(priority: Vec<&str>) -> (Arc<Catalog>, RebuildEngine, i64) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let mut commit = sample_commit("a.jpg", "m1");
        commit.raw_metadata = RawMetadata {
            md5: "m1".into(),
            relative_path: "a.jpg".into(),
            sources: [
                ("danbooru".to_string(), danbooru_raw()),
                ("e621".to_string(), e621_raw()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let id = catalog.commit_ingest(&commit).unwrap();

        let mut config = Config::default();
        config.booru_priority = priority.into_iter().map(String::from).collect();
        let engine = RebuildEngine::new(
            catalog.clone(),
            config,
            Arc::new(MonitorService::new()),
        );
        (catalog, engine, id)
    }

    #[test]
    fn rebuild_honors_priority_order() {
        let (catalog, engine, _id) = engine_with_two_source_image(vec!["e621", "danbooru"]);
        let stats = engine.full_rebuild(None).unwrap();
        assert_eq!(stats.images_processed, 1);

        let img = catalog.image_by_filepath("a.jpg").unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("e621"));
        assert_eq!(img.post_id, Some(777));
        assert!(img.tags_species.contains("cat"));
    }

    #[test]
    fn rebuild_replays_manual_deltas() {
        let (catalog, engine, id) = engine_with_two_source_image(vec!["danbooru", "e621"]);
        record_delta(&catalog, "m1", "my_manual_tag", TagCategory::General, DeltaOp::Add).unwrap();
        record_delta(&catalog, "m1", "smile", TagCategory::General, DeltaOp::Remove).unwrap();

        let stats = engine.full_rebuild(None).unwrap();
        assert_eq!(stats.deltas_applied, 2);

        let img = catalog.image_by_filepath("a.jpg").unwrap().unwrap();
        assert!(img.tags_general.contains("my_manual_tag"));
        assert!(!img.tags_general.contains("smile"));

        // The relation agrees with the columns
        let names: Vec<String> = catalog
            .tags_for_image(id)
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert!(names.contains(&"my_manual_tag".to_string()));
        assert!(!names.contains(&"smile".to_string()));
    }

    #[test]
    fn rebuild_twice_is_stable() {
        let (catalog, engine, id) = engine_with_two_source_image(vec!["danbooru", "e621"]);
        record_delta(&catalog, "m1", "kept_tag", TagCategory::General, DeltaOp::Add).unwrap();

        engine.full_rebuild(None).unwrap();
        let first: Vec<String> = catalog
            .tags_for_image(id)
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();

        engine.full_rebuild(None).unwrap();
        let second: Vec<String> = catalog
            .tags_for_image(id)
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn rebuild_preserves_implication_rules() {
        let (catalog, engine, _id) = engine_with_two_source_image(vec!["danbooru", "e621"]);
        let implications = crate::tags::ImplicationEngine::new(
            catalog.clone(),
            &Config::default(),
        );
        implications
            .create_manual("aoi_(sample)", "sample", false)
            .unwrap();

        let stats = engine.full_rebuild(None).unwrap();
        assert_eq!(stats.rules_restored, 1);
        assert_eq!(implications.all_rules().unwrap().len(), 1);
    }

    #[test]
    fn priority_monitor_first_run_stores_hash_only() {
        let (catalog, engine, _id) = engine_with_two_source_image(vec!["danbooru", "e621"]);
        assert!(!check_priority_changes(&engine).unwrap());
        assert!(catalog.config_get(PRIORITY_HASH_KEY).unwrap().is_some());
        // Unchanged priority: still no rebuild
        assert!(!check_priority_changes(&engine).unwrap());
    }

    #[test]
    fn priority_monitor_rebuilds_on_change() {
        let (catalog, engine, _id) = engine_with_two_source_image(vec!["e621", "danbooru"]);
        // Store a hash for a different ordering
        let other = priority_hash(&["danbooru".to_string(), "e621".to_string()]);
        catalog.config_set(PRIORITY_HASH_KEY, &other).unwrap();

        assert!(check_priority_changes(&engine).unwrap());
        let img = catalog.image_by_filepath("a.jpg").unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("e621"));
        assert_eq!(
            catalog.config_get(PRIORITY_HASH_KEY).unwrap().unwrap(),
            priority_hash(&engine.config.booru_priority)
        );
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = priority_hash(&["danbooru".to_string(), "e621".to_string()]);
        let b = priority_hash(&["e621".to_string(), "danbooru".to_string()]);
        assert_ne!(a, b);
        assert_eq!(a, priority_hash(&["danbooru".to_string(), "e621".to_string()]));
    }
}
