//! Cache manager
//!
//! Process-wide derived indices with an explicit lifecycle: the tag id/name
//! maps, per-image tag-id arrays (i32 for memory economy), the post-id to
//! MD5 cross-source map, and the homepage hot buffer. Readers take the
//! shared lock; a rebuild swaps the whole structure in under the exclusive
//! lock. Handlers must not hold a guard across suspension points.
//!
//! Ingest-driven invalidation is debounced: per-artifact commits call
//! `mark_activity`, and the watcher's idle loop fires one reload once the
//! system has been quiet for the configured window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::catalog::{Catalog, Result};

/// One ready-to-serve homepage entry.
#[derive(Debug, Clone)]
pub struct HomepageEntry {
    pub filepath: String,
    pub tags: String,
}

#[derive(Default)]
struct CacheInner {
    tag_id_by_name: HashMap<String, i32>,
    tag_name_by_id: HashMap<i32, String>,
    tag_counts: HashMap<i32, i64>,
    /// filepath -> sorted tag ids
    image_tag_ids: HashMap<String, Vec<i32>>,
    /// active-source post id -> md5 (used to walk booru parent/child links)
    post_id_to_md5: HashMap<i64, String>,
}

struct DebounceState {
    pending_reload: bool,
    last_activity: Instant,
}

/// The process-wide cache manager.
pub struct CacheManager {
    inner: RwLock<CacheInner>,
    debounce: Mutex<DebounceState>,
    homepage: Mutex<VecDeque<Vec<HomepageEntry>>>,
    homepage_pages: usize,
    page_size: usize,
}

impl CacheManager {
    pub fn new(page_size: usize, homepage_pages: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            debounce: Mutex::new(DebounceState {
                pending_reload: false,
                last_activity: Instant::now(),
            }),
            homepage: Mutex::new(VecDeque::new()),
            homepage_pages,
            page_size,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Full (re)load of every derived index from the catalog. Builds the new
    /// structure outside the lock and swaps it in.
    pub fn reload_all(&self, catalog: &Catalog) -> Result<()> {
        let started = Instant::now();
        let mut fresh = CacheInner::default();

        for tag in catalog.all_tags()? {
            let id = tag.id as i32;
            fresh.tag_id_by_name.insert(tag.name.clone(), id);
            fresh.tag_name_by_id.insert(id, tag.name);
            fresh.tag_counts.insert(id, tag.usage_count);
        }

        for image in catalog.all_images()? {
            let mut ids: Vec<i32> = image
                .all_tags()
                .iter()
                .filter_map(|t| fresh.tag_id_by_name.get(t).copied())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            fresh.image_tag_ids.insert(image.filepath.clone(), ids);
            if let Some(post_id) = image.post_id {
                fresh.post_id_to_md5.insert(post_id, image.md5.clone());
            }
        }

        let images = fresh.image_tag_ids.len();
        let tags = fresh.tag_id_by_name.len();
        if let Ok(mut guard) = self.inner.write() {
            *guard = fresh;
        }
        self.flush_homepage();
        tracing::info!(images, tags, elapsed_ms = started.elapsed().as_millis() as u64, "cache reloaded");
        Ok(())
    }

    /// Selective refresh of one image plus the tag counts.
    pub fn invalidate_image(&self, catalog: &Catalog, filepath: &str) -> Result<()> {
        let image = catalog.image_by_filepath(filepath)?;
        let tags = catalog.all_tags()?;

        if let Ok(mut guard) = self.inner.write() {
            guard.tag_counts.clear();
            for tag in tags {
                let id = tag.id as i32;
                guard.tag_id_by_name.insert(tag.name.clone(), id);
                guard.tag_name_by_id.insert(id, tag.name);
                guard.tag_counts.insert(id, tag.usage_count);
            }
            match image {
                Some(image) => {
                    let mut ids: Vec<i32> = image
                        .all_tags()
                        .iter()
                        .filter_map(|t| guard.tag_id_by_name.get(t).copied())
                        .collect();
                    ids.sort_unstable();
                    ids.dedup();
                    guard.image_tag_ids.insert(image.filepath.clone(), ids);
                    if let Some(post_id) = image.post_id {
                        guard.post_id_to_md5.insert(post_id, image.md5.clone());
                    }
                }
                None => {
                    guard.image_tag_ids.remove(filepath);
                }
            }
        }
        self.flush_homepage();
        Ok(())
    }

    /// Drop one image from the derived indices (after a delete).
    pub fn remove_image(&self, filepath: &str) {
        if let Ok(mut guard) = self.inner.write() {
            guard.image_tag_ids.remove(filepath);
        }
        self.flush_homepage();
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn tag_id(&self, name: &str) -> Option<i32> {
        self.inner.read().ok()?.tag_id_by_name.get(name).copied()
    }

    pub fn tag_name(&self, id: i32) -> Option<String> {
        self.inner.read().ok()?.tag_name_by_id.get(&id).cloned()
    }

    pub fn tag_count(&self, name: &str) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|g| {
                let id = g.tag_id_by_name.get(name)?;
                g.tag_counts.get(id).copied()
            })
            .unwrap_or(0)
    }

    pub fn image_tag_ids(&self, filepath: &str) -> Option<Vec<i32>> {
        self.inner.read().ok()?.image_tag_ids.get(filepath).cloned()
    }

    pub fn md5_for_post_id(&self, post_id: i64) -> Option<String> {
        self.inner.read().ok()?.post_id_to_md5.get(&post_id).cloned()
    }

    pub fn cached_image_count(&self) -> usize {
        self.inner.read().map(|g| g.image_tag_ids.len()).unwrap_or(0)
    }

    // ========================================================================
    // DEBOUNCED RELOAD
    // ========================================================================

    /// Record ingest activity; a reload becomes pending.
    pub fn mark_activity(&self) {
        if let Ok(mut guard) = self.debounce.lock() {
            guard.pending_reload = true;
            guard.last_activity = Instant::now();
        }
    }

    /// When a reload is pending and the system has been idle for at least
    /// `window`, clear the flag and return true. The caller performs the
    /// actual reload.
    pub fn take_pending_reload(&self, window: Duration) -> bool {
        if let Ok(mut guard) = self.debounce.lock() {
            if guard.pending_reload && guard.last_activity.elapsed() >= window {
                guard.pending_reload = false;
                return true;
            }
        }
        false
    }

    /// Whether a reload is waiting on the idle window.
    pub fn reload_pending(&self) -> bool {
        self.debounce.lock().map(|g| g.pending_reload).unwrap_or(false)
    }

    // ========================================================================
    // HOMEPAGE HOT BUFFER
    // ========================================================================

    /// Pop a pre-built page; `None` on a cold buffer (caller builds one
    /// synchronously and should then call `refill_homepage`).
    pub fn pop_homepage_page(&self) -> Option<Vec<HomepageEntry>> {
        self.homepage.lock().ok()?.pop_front()
    }

    /// Whether the producer has pages to build.
    pub fn homepage_needs_refill(&self) -> bool {
        self.homepage
            .lock()
            .map(|g| g.len() < self.homepage_pages)
            .unwrap_or(false)
    }

    /// Build one randomized page from the catalog and push it.
    pub fn refill_homepage(&self, catalog: &Catalog) -> Result<()> {
        let images = catalog.all_images()?;
        if images.is_empty() {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        let page: Vec<HomepageEntry> = images
            .choose_multiple(&mut rng, self.page_size.min(images.len()))
            .map(|img| HomepageEntry {
                filepath: img.filepath.clone(),
                tags: img.all_tags().join(" "),
            })
            .collect();

        if let Ok(mut guard) = self.homepage.lock() {
            if guard.len() < self.homepage_pages {
                guard.push_back(page);
            }
        }
        Ok(())
    }

    /// Flush the homepage buffer (ingest/delete/edit invalidation).
    pub fn flush_homepage(&self) {
        if let Ok(mut guard) = self.homepage.lock() {
            guard.clear();
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

    #[test]
    fn reload_builds_tag_and_image_indices() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.commit_ingest(&sample_commit("a.jpg", "m1")).unwrap();
        catalog.commit_ingest(&sample_commit("b.jpg", "m2")).unwrap();

        let cache = CacheManager::new(50, 3);
        cache.reload_all(&catalog).unwrap();

        assert_eq!(cache.cached_image_count(), 2);
        let id = cache.tag_id("blue_hair").expect("tag cached");
        assert_eq!(cache.tag_name(id).as_deref(), Some("blue_hair"));
        assert_eq!(cache.tag_count("blue_hair"), 2);
        assert!(cache.image_tag_ids("a.jpg").unwrap().contains(&id));
        assert_eq!(cache.md5_for_post_id(123456).as_deref(), Some("m1"));
    }

    #[test]
    fn invalidate_image_refreshes_one_entry() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.commit_ingest(&sample_commit("a.jpg", "m1")).unwrap();
        let cache = CacheManager::new(50, 3);
        cache.reload_all(&catalog).unwrap();

        catalog.commit_ingest(&sample_commit("b.jpg", "m2")).unwrap();
        cache.invalidate_image(&catalog, "b.jpg").unwrap();
        assert!(cache.image_tag_ids("b.jpg").is_some());

        // Deleted images fall out on invalidation
        let id = catalog.image_by_filepath("a.jpg").unwrap().unwrap().id;
        catalog.delete_image(id).unwrap();
        cache.invalidate_image(&catalog, "a.jpg").unwrap();
        assert!(cache.image_tag_ids("a.jpg").is_none());
    }

    #[test]
    fn debounce_waits_for_idle_window() {
        let cache = CacheManager::new(50, 3);
        assert!(!cache.take_pending_reload(Duration::ZERO));

        cache.mark_activity();
        assert!(cache.reload_pending());
        // Not idle long enough
        assert!(!cache.take_pending_reload(Duration::from_secs(60)));
        assert!(cache.reload_pending());
        // Idle window elapsed
        assert!(cache.take_pending_reload(Duration::ZERO));
        assert!(!cache.reload_pending());
        // Consumed; nothing pending now
        assert!(!cache.take_pending_reload(Duration::ZERO));
    }

    #[test]
    fn homepage_buffer_fills_and_flushes() {
        let catalog = Catalog::open_in_memory().unwrap();
        for i in 0..5 {
            catalog
                .commit_ingest(&sample_commit(&format!("{}.jpg", i), &format!("m{}", i)))
                .unwrap();
        }
        let cache = CacheManager::new(2, 2);
        assert!(cache.homepage_needs_refill());
        cache.refill_homepage(&catalog).unwrap();
        cache.refill_homepage(&catalog).unwrap();
        assert!(!cache.homepage_needs_refill());

        let page = cache.pop_homepage_page().unwrap();
        assert_eq!(page.len(), 2);

        cache.flush_homepage();
        assert!(cache.pop_homepage_page().is_none());
    }
}
