//! Similar-images cache
//!
//! Pre-computed top-N similars per (image, similarity type), stored with
//! rank so the sidebar read is a single indexed lookup. A miss falls back to
//! live computation at the service layer.

use rusqlite::params;
use serde::Serialize;

use crate::catalog::{Catalog, Result};
use crate::similarity::{BlendWeights, SimilarMatch, SimilarityService};

/// Cached similarity types.
pub const SIMILARITY_TYPES: [&str; 4] = ["visual", "semantic", "tag", "blended"];

/// Rebuild statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheRebuildStats {
    pub images_processed: usize,
    pub entries_written: usize,
    pub elapsed_seconds: f64,
}

/// Cached-entry summary.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarsCacheStats {
    pub cached_sources: i64,
    pub total_entries: i64,
    pub by_type: Vec<(String, i64)>,
}

/// Read the cached top-N for one image. Empty on a miss.
pub fn get_similar_from_cache(
    catalog: &Catalog,
    image_id: i64,
    limit: usize,
    similarity_type: &str,
) -> Result<Vec<SimilarMatch>> {
    let reader = catalog.reader()?;
    let mut stmt = reader.prepare(
        "SELECT c.similar_image_id, i.filepath, c.similarity_score
         FROM similar_images_cache c
         JOIN images i ON i.id = c.similar_image_id
         WHERE c.source_image_id = ?1 AND c.similarity_type = ?2
         ORDER BY c.rank
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![image_id, similarity_type, limit as i64], |r| {
            Ok(SimilarMatch {
                image_id: r.get(0)?,
                filepath: r.get(1)?,
                score: r.get(2)?,
                distance: None,
                match_type: similarity_type.to_string(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Replace one image's cached entries for a type, trimmed to `cache_size`.
pub fn store_in_cache(
    catalog: &Catalog,
    source_id: i64,
    results: &[SimilarMatch],
    similarity_type: &str,
    cache_size: usize,
) -> Result<usize> {
    let mut writer = catalog.writer()?;
    let tx = writer.transaction()?;
    tx.execute(
        "DELETE FROM similar_images_cache WHERE source_image_id = ?1 AND similarity_type = ?2",
        params![source_id, similarity_type],
    )?;
    let mut written = 0usize;
    for (rank, entry) in results.iter().take(cache_size).enumerate() {
        tx.execute(
            "INSERT INTO similar_images_cache
             (source_image_id, similar_image_id, similarity_score, similarity_type, rank)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_id,
                entry.image_id,
                entry.score,
                similarity_type,
                rank as i64 + 1
            ],
        )?;
        written += 1;
    }
    tx.commit()?;
    Ok(written)
}

/// Compute and cache one image's similars under the chosen type.
pub fn compute_and_cache_for_image(
    service: &SimilarityService,
    config: &crate::config::Config,
    image_id: i64,
    similarity_type: &str,
    force: bool,
) -> crate::similarity::Result<usize> {
    let catalog = service.catalog();
    if !force {
        let existing = get_similar_from_cache(catalog, image_id, 1, similarity_type)?;
        if !existing.is_empty() {
            return Ok(0);
        }
    }

    let image = match catalog.image_by_id(image_id)? {
        Some(img) => img,
        None => return Ok(0),
    };
    let limit = config.similarity_cache_size;

    let results = match similarity_type {
        "visual" => service.find_visual(
            &image.filepath,
            config.visual_similarity_threshold,
            limit,
            false,
        )?,
        "semantic" => service.find_semantic(&image.filepath, limit, false)?,
        "tag" => service.find_related_by_tags(&image.filepath, limit)?,
        _ => service.find_blended(
            &image.filepath,
            &BlendWeights::from_config(config),
            limit,
            false,
        )?,
    };

    Ok(store_in_cache(catalog, image_id, &results, similarity_type, limit)?)
}

/// Full cache rebuild across every image for one type.
pub fn rebuild_cache_full(
    service: &SimilarityService,
    config: &crate::config::Config,
    similarity_type: &str,
    progress: Option<&dyn Fn(usize, usize)>,
) -> crate::similarity::Result<CacheRebuildStats> {
    let started = std::time::Instant::now();
    let ids = service.catalog().all_image_ids()?;
    let total = ids.len();

    let mut stats = CacheRebuildStats::default();
    for (done, id) in ids.into_iter().enumerate() {
        stats.entries_written +=
            compute_and_cache_for_image(service, config, id, similarity_type, true)?;
        stats.images_processed += 1;
        if let Some(cb) = progress {
            if done % 25 == 0 || done + 1 == total {
                cb(done + 1, total);
            }
        }
    }
    stats.elapsed_seconds = started.elapsed().as_secs_f64();
    tracing::info!(
        images = stats.images_processed,
        entries = stats.entries_written,
        similarity_type,
        "similars cache rebuilt"
    );
    Ok(stats)
}

/// Clear the cache entirely or for one type.
pub fn clear_cache(catalog: &Catalog, similarity_type: Option<&str>) -> Result<usize> {
    let writer = catalog.writer()?;
    let removed = match similarity_type {
        Some(t) => writer.execute(
            "DELETE FROM similar_images_cache WHERE similarity_type = ?1",
            [t],
        )?,
        None => writer.execute("DELETE FROM similar_images_cache", [])?,
    };
    Ok(removed)
}

/// Cache population summary.
pub fn stats(catalog: &Catalog) -> Result<SimilarsCacheStats> {
    let reader = catalog.reader()?;
    let cached_sources: i64 = reader.query_row(
        "SELECT COUNT(DISTINCT source_image_id) FROM similar_images_cache",
        [],
        |r| r.get(0),
    )?;
    let total_entries: i64 =
        reader.query_row("SELECT COUNT(*) FROM similar_images_cache", [], |r| r.get(0))?;
    let mut stmt = reader.prepare(
        "SELECT similarity_type, COUNT(*) FROM similar_images_cache GROUP BY similarity_type",
    )?;
    let by_type = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
    Ok(SimilarsCacheStats {
        cached_sources,
        total_entries,
        by_type,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::tests::service_with;

    #[test]
    fn cache_roundtrip_preserves_rank_order() {
        let (catalog, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000001")),
            ("c.jpg", "m3", Some("0000000000000003")),
        ]);
        let config = crate::config::Config::default();
        let a = catalog.image_by_filepath("a.jpg").unwrap().unwrap().id;

        let written = compute_and_cache_for_image(&service, &config, a, "visual", true).unwrap();
        assert_eq!(written, 2);

        let cached = get_similar_from_cache(&catalog, a, 10, "visual").unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].filepath, "b.jpg");
        assert_eq!(cached[1].filepath, "c.jpg");
        assert!(cached[0].score >= cached[1].score);
    }

    #[test]
    fn non_forced_recompute_skips_cached_entries() {
        let (catalog, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000001")),
        ]);
        let config = crate::config::Config::default();
        let a = catalog.image_by_filepath("a.jpg").unwrap().unwrap().id;

        assert_eq!(
            compute_and_cache_for_image(&service, &config, a, "visual", true).unwrap(),
            1
        );
        assert_eq!(
            compute_and_cache_for_image(&service, &config, a, "visual", false).unwrap(),
            0
        );
    }

    #[test]
    fn trim_respects_cache_size() {
        let (catalog, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000001")),
            ("c.jpg", "m3", Some("0000000000000003")),
            ("d.jpg", "m4", Some("0000000000000007")),
        ]);
        let mut config = crate::config::Config::default();
        config.similarity_cache_size = 2;
        let a = catalog.image_by_filepath("a.jpg").unwrap().unwrap().id;

        let written = compute_and_cache_for_image(&service, &config, a, "visual", true).unwrap();
        assert_eq!(written, 2);
    }

    #[test]
    fn rebuild_and_clear() {
        let (catalog, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000001")),
        ]);
        let config = crate::config::Config::default();
        let rebuilt = rebuild_cache_full(&service, &config, "visual", None).unwrap();
        assert_eq!(rebuilt.images_processed, 2);
        assert_eq!(rebuilt.entries_written, 2);

        let summary = stats(&catalog).unwrap();
        assert_eq!(summary.cached_sources, 2);

        assert_eq!(clear_cache(&catalog, Some("visual")).unwrap(), 2);
        assert_eq!(stats(&catalog).unwrap().total_entries, 0);
    }
}
