//! Filesystem watcher
//!
//! Real-time ingest: a `notify` watcher on the managed image directory and
//! the ingest staging directory feeds created files into the pipeline's
//! worker pool. Per-artifact commits only mark cache activity; a separate
//! idle loop fires one cache reload once the system has been quiet for the
//! configured debounce window, so bursts coalesce into a single reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::ingest::{AnalyzeOptions, IngestOrigin, IngestPipeline};
use crate::monitor::{LogLevel, MonitorService};

/// Per-file debounce window: editors and downloaders fire several events
/// while a file lands.
const FILE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Delay before touching a freshly created file, so it is fully written.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Watcher error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Watch setup failed: {0}")]
    Notify(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, WatcherError>;

// ============================================================================
// WATCHER
// ============================================================================

/// A running watcher session. Dropping (or calling `stop`) detaches the
/// filesystem watches and ends the idle-reload loop.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Stop watching and end the idle loop.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Start watching the image and ingest directories.
///
/// Created artifacts are debounced per path and submitted to the pipeline's
/// bounded worker pool on the given runtime. Also spawns the idle loop that
/// performs the debounced cache reload.
pub fn start(
    pipeline: Arc<IngestPipeline>,
    cache: Arc<CacheManager>,
    monitor: Arc<MonitorService>,
    runtime: tokio::runtime::Handle,
) -> Result<WatcherHandle> {
    let config = pipeline.config().clone();
    let stop = Arc::new(AtomicBool::new(false));
    let recently_seen: Arc<Mutex<HashMap<PathBuf, Instant>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let callback_pipeline = Arc::clone(&pipeline);
    let callback_monitor = Arc::clone(&monitor);
    let callback_runtime = runtime.clone();
    let callback_config = config.clone();
    let callback_seen = Arc::clone(&recently_seen);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("watch event error: {}", e);
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        for path in event.paths {
            if !Config::is_supported_artifact(&path) {
                continue;
            }
            if !debounce_path(&callback_seen, &path) {
                continue;
            }

            let origin = origin_of(&callback_config, &path);
            callback_monitor.add_log(
                format!("Detected {}, queuing for analysis", path.display()),
                LogLevel::Info,
            );

            let pipeline = Arc::clone(&callback_pipeline);
            callback_runtime.spawn(async move {
                tokio::time::sleep(SETTLE_DELAY).await;
                if !path.exists() {
                    return;
                }
                pipeline
                    .process_files(vec![(path, origin)], AnalyzeOptions::default())
                    .await;
            });
        }
    })?;

    watcher.watch(&config.image_directory, RecursiveMode::Recursive)?;
    if config.ingest_directory.exists() {
        watcher.watch(&config.ingest_directory, RecursiveMode::Recursive)?;
        monitor.add_log(
            format!("Watching ingest folder {}", config.ingest_directory.display()),
            LogLevel::Info,
        );
    }
    monitor.add_log("Background monitor started (watch mode)", LogLevel::Info);
    monitor.set_running(true);

    // Idle loop: one coalesced reload once ingest has been quiet
    {
        let stop = Arc::clone(&stop);
        let window = Duration::from_secs_f64(config.reload_debounce_secs);
        let catalog = Arc::clone(pipeline.catalog());
        let idle_monitor = Arc::clone(&monitor);
        runtime.spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                if cache.take_pending_reload(window) {
                    idle_monitor.add_log("Reloading data after batch ingest", LogLevel::Info);
                    match cache.reload_all(&catalog) {
                        Ok(()) => idle_monitor.add_log("Data reload complete", LogLevel::Success),
                        Err(e) => idle_monitor
                            .add_log(format!("Data reload failed: {}", e), LogLevel::Error),
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            idle_monitor.set_running(false);
            idle_monitor.add_log("Background monitor stopped", LogLevel::Info);
        });
    }

    Ok(WatcherHandle {
        _watcher: watcher,
        stop,
    })
}

/// True when this path has not fired within the debounce window.
fn debounce_path(seen: &Mutex<HashMap<PathBuf, Instant>>, path: &Path) -> bool {
    let mut guard = match seen.lock() {
        Ok(g) => g,
        Err(_) => return true,
    };
    let now = Instant::now();
    guard.retain(|_, at| now.duration_since(*at) < FILE_DEBOUNCE);
    if guard.contains_key(path) {
        return false;
    }
    guard.insert(path.to_path_buf(), now);
    true
}

fn origin_of(config: &Config, path: &Path) -> IngestOrigin {
    if path.starts_with(&config.ingest_directory) {
        IngestOrigin::Staged
    } else {
        IngestOrigin::InPlace
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{fixture, write_png};

    #[test]
    fn debounce_suppresses_rapid_repeats() {
        let seen = Mutex::new(HashMap::new());
        let path = Path::new("a.png");
        assert!(debounce_path(&seen, path));
        assert!(!debounce_path(&seen, path));
        assert!(debounce_path(&seen, Path::new("b.png")));
    }

    #[test]
    fn origin_split_by_directory() {
        let fx = fixture(false);
        let staged = fx.config.ingest_directory.join("x.png");
        let in_place = fx.config.image_directory.join("y.png");
        assert_eq!(origin_of(&fx.config, &staged), IngestOrigin::Staged);
        assert_eq!(origin_of(&fx.config, &in_place), IngestOrigin::InPlace);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_picks_up_staged_files() {
        let fx = fixture(true);
        let cache = Arc::new(CacheManager::new(50, 3));
        let monitor = Arc::new(MonitorService::new());

        let handle = start(
            Arc::clone(&fx.pipeline),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        write_png(&fx.config.ingest_directory.join("dropped.png"), 42);

        // Wait out the settle delay plus processing
        let mut committed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if fx.catalog.image_count().unwrap() > 0 {
                committed = true;
                break;
            }
        }
        handle.stop();
        assert!(committed, "watcher never ingested the staged file");
    }
}
