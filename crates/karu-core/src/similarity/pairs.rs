//! Duplicate-pair cache
//!
//! The O(n^2) pHash scan runs once as a background task and writes its
//! results into `duplicate_pairs` in a single replacement transaction; the
//! review queue then reads from the cache instantly. Pairs always store
//! (min_id, max_id). Review commits remove their pair; a re-scan replaces
//! the whole cache.

use chrono::Utc;
use rayon::prelude::*;
use rusqlite::params;
use serde::Serialize;

use crate::catalog::{Catalog, Result};
use crate::hash::hamming_distance;

/// Below this image count the scan stays single-threaded; the work is too
/// small to amortize fan-out overhead.
const PARALLEL_THRESHOLD: usize = 200;

/// Progress callback: (comparisons done, comparisons total).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Sync);

/// Scan statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStats {
    pub pair_count: usize,
    pub image_count: usize,
    pub comparisons: u64,
    pub elapsed_seconds: f64,
}

/// Cache summary for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCacheStats {
    pub cached_pairs: i64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub hashed_images: i64,
    pub scan_threshold: u32,
    pub suggestion_cached_pairs: i64,
    pub suggestion_cache_ready: bool,
}

/// Run the full pairwise scan and atomically replace the cache.
///
/// Hashes are decoded to integers once so each comparison is a single XOR +
/// popcount. The outer index is chunked across cores; each chunk compares
/// its rows against all later rows, and chunk count exceeds worker count so
/// the heavier early rows spread out.
pub fn scan_duplicate_pairs(
    catalog: &Catalog,
    threshold: u32,
    progress: Option<ProgressFn<'_>>,
) -> Result<ScanStats> {
    let started = std::time::Instant::now();

    let rows = catalog.images_with_phash()?;
    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
    let hashes: Vec<u64> = rows
        .iter()
        .map(|(_, hex)| u64::from_str_radix(hex, 16).unwrap_or(0))
        .collect();

    let n = ids.len();
    let total_comparisons = (n as u64).saturating_mul(n as u64 - u64::from(n > 0)) / 2;

    let found = if n < PARALLEL_THRESHOLD {
        scan_serial(&ids, &hashes, threshold, progress)
    } else {
        scan_parallel(&ids, &hashes, threshold, progress)
    };

    if let Some(cb) = progress {
        cb(total_comparisons, total_comparisons);
    }

    let now = Utc::now().to_rfc3339();
    let mut writer = catalog.writer()?;
    let tx = writer.transaction()?;
    tx.execute("DELETE FROM duplicate_pairs", [])?;
    tx.execute("DELETE FROM duplicate_pair_suggestions", [])?;
    for (a, b, distance) in &found {
        tx.execute(
            "INSERT INTO duplicate_pairs (image_id_a, image_id_b, distance, threshold, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![a, b, distance, threshold, now],
        )?;
    }
    tx.commit()?;

    let stats = ScanStats {
        pair_count: found.len(),
        image_count: n,
        comparisons: total_comparisons,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    };
    tracing::info!(
        pairs = stats.pair_count,
        images = stats.image_count,
        elapsed_s = stats.elapsed_seconds,
        "duplicate-pair scan complete"
    );
    Ok(stats)
}

fn scan_serial(
    ids: &[i64],
    hashes: &[u64],
    threshold: u32,
    progress: Option<ProgressFn<'_>>,
) -> Vec<(i64, i64, u32)> {
    let n = ids.len();
    let total = (n as u64).saturating_mul(n as u64 - u64::from(n > 0)) / 2;
    let mut found = Vec::new();
    let mut done = 0u64;

    for i in 0..n {
        let h = hashes[i];
        for j in (i + 1)..n {
            let distance = hamming_distance(h, hashes[j]);
            if distance <= threshold {
                found.push((ids[i], ids[j], distance));
            }
        }
        done += (n - i - 1) as u64;
        if let Some(cb) = progress {
            if i % 50 == 0 {
                cb(done, total);
            }
        }
    }
    found
}

fn scan_parallel(
    ids: &[i64],
    hashes: &[u64],
    threshold: u32,
    progress: Option<ProgressFn<'_>>,
) -> Vec<(i64, i64, u32)> {
    let n = ids.len();
    let total = (n as u64) * (n as u64 - 1) / 2;
    let workers = rayon::current_num_threads().max(1);

    // More chunks than workers for load balancing: early outer indices carry
    // far more comparisons than late ones
    let num_chunks = workers * 4;
    let chunk_size = (n / num_chunks).max(1);

    let ranges: Vec<(usize, usize)> = (0..num_chunks + 1)
        .map(|c| (c * chunk_size, ((c + 1) * chunk_size).min(n)))
        .filter(|(start, end)| start < end)
        .collect();

    let done = std::sync::atomic::AtomicU64::new(0);
    let mut found: Vec<(i64, i64, u32)> = ranges
        .par_iter()
        .flat_map_iter(|(start, end)| {
            let mut chunk_found = Vec::new();
            for i in *start..*end {
                let h = hashes[i];
                for j in (i + 1)..n {
                    let distance = hamming_distance(h, hashes[j]);
                    if distance <= threshold {
                        chunk_found.push((ids[i], ids[j], distance));
                    }
                }
            }
            let chunk_comparisons: u64 = (*start..*end).map(|i| (n - i - 1) as u64).sum();
            let current = done.fetch_add(chunk_comparisons, std::sync::atomic::Ordering::Relaxed)
                + chunk_comparisons;
            if let Some(cb) = progress {
                cb(current, total);
            }
            chunk_found
        })
        .collect();

    found.sort_unstable();
    found
}

/// Remove one pair (and its cached suggestion), normalized to (min, max).
pub fn remove_pair(catalog: &Catalog, id_a: i64, id_b: i64) -> Result<()> {
    let (lo, hi) = (id_a.min(id_b), id_a.max(id_b));
    let writer = catalog.writer()?;
    writer.execute(
        "DELETE FROM duplicate_pairs WHERE image_id_a = ?1 AND image_id_b = ?2",
        params![lo, hi],
    )?;
    writer.execute(
        "DELETE FROM duplicate_pair_suggestions WHERE image_id_a = ?1 AND image_id_b = ?2",
        params![lo, hi],
    )?;
    Ok(())
}

/// Drop the whole cache. Returns removed pair count.
pub fn clear_cache(catalog: &Catalog) -> Result<usize> {
    let writer = catalog.writer()?;
    let removed = writer.execute("DELETE FROM duplicate_pairs", [])?;
    writer.execute("DELETE FROM duplicate_pair_suggestions", [])?;
    Ok(removed)
}

/// Cache summary.
pub fn cache_stats(catalog: &Catalog, default_threshold: u32) -> Result<DuplicateCacheStats> {
    let reader = catalog.reader()?;
    let cached_pairs: i64 =
        reader.query_row("SELECT COUNT(*) FROM duplicate_pairs", [], |r| r.get(0))?;
    let (oldest, newest): (Option<String>, Option<String>) = reader.query_row(
        "SELECT MIN(computed_at), MAX(computed_at) FROM duplicate_pairs",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let hashed_images: i64 = reader.query_row(
        "SELECT COUNT(*) FROM images WHERE phash IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let scan_threshold: Option<u32> =
        reader.query_row("SELECT MAX(threshold) FROM duplicate_pairs", [], |r| r.get(0))?;
    let suggestion_cached_pairs: i64 = reader.query_row(
        "SELECT COUNT(*) FROM duplicate_pair_suggestions",
        [],
        |r| r.get(0),
    )?;

    Ok(DuplicateCacheStats {
        cached_pairs,
        oldest,
        newest,
        hashed_images,
        scan_threshold: scan_threshold.unwrap_or(default_threshold),
        suggestion_cached_pairs,
        suggestion_cache_ready: cached_pairs > 0 && suggestion_cached_pairs >= cached_pairs,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;

    fn catalog_with_hashes(hashes: &[&str]) -> (Catalog, Vec<i64>) {
        let catalog = Catalog::open_in_memory().unwrap();
        let ids = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let mut commit = sample_commit(&format!("{}.jpg", i), &format!("m{}", i));
                commit.phash = Some(h.to_string());
                catalog.commit_ingest(&commit).unwrap()
            })
            .collect();
        (catalog, ids)
    }

    fn stored_pairs(catalog: &Catalog) -> Vec<(i64, i64, u32)> {
        let reader = catalog.reader().unwrap();
        let mut stmt = reader
            .prepare("SELECT image_id_a, image_id_b, distance FROM duplicate_pairs ORDER BY image_id_a, image_id_b")
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    #[test]
    fn scan_finds_pairs_within_threshold() {
        let (catalog, ids) = catalog_with_hashes(&[
            "0000000000000000",
            "0000000000000003", // distance 2 from first
            "ffffffffffffffff",
        ]);
        let stats = scan_duplicate_pairs(&catalog, 8, None).unwrap();
        assert_eq!(stats.image_count, 3);
        assert_eq!(stats.comparisons, 3);
        assert_eq!(stats.pair_count, 1);

        let pairs = stored_pairs(&catalog);
        assert_eq!(pairs, vec![(ids[0].min(ids[1]), ids[0].max(ids[1]), 2)]);
    }

    #[test]
    fn pairs_always_store_min_id_first() {
        let (catalog, _ids) = catalog_with_hashes(&[
            "00000000000000ff",
            "00000000000000fe",
            "00000000000000fc",
        ]);
        scan_duplicate_pairs(&catalog, 16, None).unwrap();
        for (a, b, _) in stored_pairs(&catalog) {
            assert!(a < b);
        }
    }

    #[test]
    fn rescan_replaces_cache_deterministically() {
        let (catalog, _) = catalog_with_hashes(&[
            "0000000000000000",
            "0000000000000001",
            "0000000000000003",
        ]);
        scan_duplicate_pairs(&catalog, 4, None).unwrap();
        let first = stored_pairs(&catalog);
        scan_duplicate_pairs(&catalog, 4, None).unwrap();
        let second = stored_pairs(&catalog);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn serial_and_parallel_agree() {
        let ids: Vec<i64> = (0..300).collect();
        let hashes: Vec<u64> = (0..300).map(|i| (i as u64) * 7).collect();
        let mut serial = scan_serial(&ids, &hashes, 6, None);
        serial.sort_unstable();
        let parallel = scan_parallel(&ids, &hashes, 6, None);
        assert_eq!(serial, parallel);
    }

    #[test]
    fn remove_pair_normalizes_order() {
        let (catalog, ids) = catalog_with_hashes(&["0000000000000000", "0000000000000001"]);
        scan_duplicate_pairs(&catalog, 4, None).unwrap();
        assert_eq!(stored_pairs(&catalog).len(), 1);
        // Pass the pair in reversed order
        remove_pair(&catalog, ids[1].max(ids[0]), ids[1].min(ids[0])).unwrap();
        assert!(stored_pairs(&catalog).is_empty());
    }

    #[test]
    fn empty_catalog_scans_clean() {
        let catalog = Catalog::open_in_memory().unwrap();
        let stats = scan_duplicate_pairs(&catalog, 8, None).unwrap();
        assert_eq!(stats.pair_count, 0);
        assert_eq!(stats.image_count, 0);
    }
}
