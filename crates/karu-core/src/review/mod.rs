//! Duplicate-review service
//!
//! Turns the pre-computed `duplicate_pairs` cache into a review queue:
//! enriches each pair with a cached visual-diff suggestion, classifies it
//! into likely-duplicate / likely-variation / uncertain against configurable
//! bounds, paginates under several sort modes, and commits batched review
//! actions (delete / relate / dismiss) transactionally with optional
//! calibration logging.

pub mod metrics;

use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogError, RelationSource, RelationType};
use crate::config::Config;
use crate::maintenance;
use crate::relations::RelationRepository;
use crate::similarity::pairs;
use metrics::{ImageFacts, PairMetrics, SuggestionRecord};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Review service error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Maintenance(#[from] crate::maintenance::MaintenanceError),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

// ============================================================================
// TYPES
// ============================================================================

/// Suggestion classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionClass {
    LikelyDuplicate,
    LikelyVariation,
    Uncertain,
    Unavailable,
}

impl SuggestionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionClass::LikelyDuplicate => "likely_duplicate",
            SuggestionClass::LikelyVariation => "likely_variation",
            SuggestionClass::Uncertain => "uncertain",
            SuggestionClass::Unavailable => "unavailable",
        }
    }
}

/// A classified suggestion attached to a queue pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub label: SuggestionClass,
    pub text: String,
    pub signal: Option<f64>,
    pub confidence: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<SuggestionRecord>,
}

/// Queue sort modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Distance,
    LikelyDuplicates,
    DuplicateHunt,
    DuplicateFirst,
}

impl QueueMode {
    pub fn parse_name(s: &str) -> Self {
        match s {
            "likely_duplicates" => QueueMode::LikelyDuplicates,
            "duplicate_hunt" => QueueMode::DuplicateHunt,
            "duplicate_first" => QueueMode::DuplicateFirst,
            _ => QueueMode::Distance,
        }
    }
}

/// Per-image metadata shown alongside a pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairImage {
    pub id: i64,
    pub filepath: String,
    pub md5: String,
    pub width: i64,
    pub height: i64,
    pub file_size: i64,
    pub tag_count: i64,
    pub score: Option<i64>,
}

/// One queue entry.
#[derive(Debug, Clone, Serialize)]
pub struct QueuePair {
    pub image_a: PairImage,
    pub image_b: PairImage,
    pub distance: u32,
    /// Percent confidence scaled against the scan threshold.
    pub confidence: f64,
    pub suggestion: Suggestion,
}

/// A page of the review queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueuePage {
    pub pairs: Vec<QueuePair>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    pub scan_threshold: u32,
    pub queue_mode: QueueMode,
    pub suggestion_cache_ready: bool,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// Review actions from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActionKind {
    DeleteA,
    DeleteB,
    NonDuplicate,
    Related,
}

/// One staged action.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewAction {
    pub image_id_a: i64,
    pub image_id_b: i64,
    pub action: ReviewActionKind,
    /// For `related`: `parent_child_ab`, `parent_child_ba`, or `sibling`.
    #[serde(default)]
    pub detail: Option<String>,
    /// The suggestion the client saw, for calibration logging.
    #[serde(default)]
    pub suggestion: Option<Suggestion>,
}

/// Commit summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitResults {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub calibration_matches: usize,
    pub calibration_uncertain: usize,
    pub calibration_mismatches: usize,
    pub calibration_logged: usize,
}

/// Suggestion precompute statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuggestionBuildStats {
    pub pair_count: usize,
    pub source_pairs: usize,
    pub elapsed_seconds: f64,
}

// ============================================================================
// SERVICE
// ============================================================================

type MetricsKey = (String, u64, String, u64);

/// The duplicate-review service.
pub struct ReviewService {
    catalog: Arc<Catalog>,
    config: Config,
    relations: RelationRepository,
    /// Memoized preview diffs keyed by (path, mtime) pairs.
    metrics_cache: Mutex<LruCache<MetricsKey, Option<PairMetrics>>>,
}

impl ReviewService {
    pub fn new(catalog: Arc<Catalog>, config: Config) -> Self {
        Self {
            relations: RelationRepository::new(catalog.clone()),
            catalog,
            config,
            metrics_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(4096).expect("static capacity"),
            )),
        }
    }

    // ========================================================================
    // SUGGESTION PRECOMPUTE
    // ========================================================================

    /// Compute and cache suggestion records for every cached pair, replacing
    /// the suggestion table.
    pub fn compute_suggestions(
        &self,
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> Result<SuggestionBuildStats> {
        let started = std::time::Instant::now();
        let pair_rows: Vec<(i64, i64)> = {
            let reader = self.catalog.reader()?;
            let mut stmt = reader.prepare(
                "SELECT image_id_a, image_id_b FROM duplicate_pairs ORDER BY distance",
            )?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let total = pair_rows.len();
        let mut records = Vec::new();
        for (done, (a, b)) in pair_rows.iter().enumerate() {
            if let Some(record) = self.build_record_for_pair(*a, *b)? {
                records.push((*a, *b, record));
            }
            if let Some(cb) = progress {
                if done % 10 == 0 || done + 1 == total {
                    cb(done + 1, total);
                }
            }
        }

        let now = Utc::now().to_rfc3339();
        let mut writer = self.catalog.writer()?;
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM duplicate_pair_suggestions", [])?;
        for (a, b, r) in &records {
            tx.execute(
                "INSERT OR REPLACE INTO duplicate_pair_suggestions (
                    image_id_a, image_id_b, signal, visual_signal, metadata_adjustment,
                    mean_abs_diff, changed_ratio, largest_blob_ratio, blob_count,
                    peak_blob_contrast, mask_mismatch, pixel_ratio, filesize_ratio,
                    tag_gap_ratio, computed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    a,
                    b,
                    r.signal,
                    r.visual_signal,
                    r.metadata_adjustment,
                    r.mean_abs_diff,
                    r.changed_ratio,
                    r.largest_blob_ratio,
                    r.blob_count,
                    r.peak_blob_contrast,
                    r.mask_mismatch,
                    r.pixel_ratio,
                    r.filesize_ratio,
                    r.tag_gap_ratio,
                    now
                ],
            )?;
        }
        tx.commit()?;

        Ok(SuggestionBuildStats {
            pair_count: records.len(),
            source_pairs: total,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn build_record_for_pair(&self, id_a: i64, id_b: i64) -> Result<Option<SuggestionRecord>> {
        let image_a = self.pair_image(id_a)?;
        let image_b = self.pair_image(id_b)?;
        let (image_a, image_b) = match (image_a, image_b) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(None),
        };

        let visual = self.pair_metrics(&image_a, &image_b);
        let visual = match visual {
            Some(m) => m,
            None => return Ok(None),
        };

        Ok(Some(metrics::build_suggestion_record(
            &visual,
            &facts_of(&image_a),
            &facts_of(&image_b),
        )))
    }

    /// Preview-diff metrics, memoized on (path, mtime) so re-queues are free.
    fn pair_metrics(&self, a: &PairImage, b: &PairImage) -> Option<PairMetrics> {
        let path_a = self.preview_path(&a.filepath)?;
        let path_b = self.preview_path(&b.filepath)?;

        let mtime = |p: &PathBuf| -> u64 {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };

        // Order-independent key
        let mut sides = [
            (path_a.display().to_string(), mtime(&path_a)),
            (path_b.display().to_string(), mtime(&path_b)),
        ];
        sides.sort();
        let key = (
            sides[0].0.clone(),
            sides[0].1,
            sides[1].0.clone(),
            sides[1].1,
        );

        if let Ok(mut cache) = self.metrics_cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return cached.clone();
            }
        }

        let computed = metrics::compute_pair_metrics(
            std::path::Path::new(&sides[0].0),
            std::path::Path::new(&sides[1].0),
        );
        if let Ok(mut cache) = self.metrics_cache.lock() {
            cache.put(key, computed.clone());
        }
        computed
    }

    /// Prefer the thumbnail preview, falling back to the original file.
    fn preview_path(&self, filepath: &str) -> Option<PathBuf> {
        let thumb = self
            .config
            .thumb_directory
            .join(filepath)
            .with_extension("webp");
        if thumb.exists() {
            return Some(thumb);
        }
        let original = self.config.image_directory.join(filepath);
        original.exists().then_some(original)
    }

    // ========================================================================
    // CLASSIFICATION
    // ========================================================================

    /// Classify a signal against the bounds. Confidence is the normalized
    /// distance from the nearest boundary.
    pub fn classify_signal(signal: f64, lower: f64, upper: f64) -> Suggestion {
        let band = (upper - lower).max(1e-6);
        let (label, text, confidence) = if signal <= lower {
            (
                SuggestionClass::LikelyDuplicate,
                "Suggest duplicate",
                ((lower - signal) / lower.max(1e-6)).min(1.0),
            )
        } else if signal >= upper {
            (
                SuggestionClass::LikelyVariation,
                "Suggest variation",
                ((signal - upper) / (1.0 - upper).max(1e-6)).min(1.0),
            )
        } else {
            let midpoint = (lower + upper) / 2.0;
            (
                SuggestionClass::Uncertain,
                "Needs review",
                1.0 - ((signal - midpoint).abs() / (band / 2.0)).min(1.0),
            )
        };

        Suggestion {
            label,
            text: text.to_string(),
            signal: Some(signal),
            confidence,
            lower_bound: lower,
            upper_bound: upper,
            record: None,
        }
    }

    fn unavailable_suggestion(lower: f64, upper: f64) -> Suggestion {
        Suggestion {
            label: SuggestionClass::Unavailable,
            text: "No suggestion".to_string(),
            signal: None,
            confidence: 0.0,
            lower_bound: lower,
            upper_bound: upper,
            record: None,
        }
    }

    /// Clamp the suggestion bounds into shape: both in [0, 1], upper above
    /// lower.
    pub fn coerce_bounds(&self, lower: Option<f64>, upper: Option<f64>) -> (f64, f64) {
        let lower = lower
            .unwrap_or(self.config.suggestion_lower_bound)
            .clamp(0.0, 1.0);
        let mut upper = upper
            .unwrap_or(self.config.suggestion_upper_bound)
            .clamp(0.0, 1.0);
        if upper <= lower {
            upper = (lower + 0.05).min(1.0);
        }
        (lower, upper)
    }

    // ========================================================================
    // QUEUE
    // ========================================================================

    /// Read a page of the queue: pairs within the hamming threshold with no
    /// existing relation (either ordering), sorted per the mode.
    pub fn queue(
        &self,
        threshold: u32,
        offset: i64,
        limit: i64,
        queue_mode: QueueMode,
        suggestion_lower: Option<f64>,
        suggestion_upper: Option<f64>,
    ) -> Result<QueuePage> {
        const NOT_REVIEWED: &str = "NOT EXISTS (
            SELECT 1 FROM image_relations ir
            WHERE (ir.image_id_a = dp.image_id_a AND ir.image_id_b = dp.image_id_b)
               OR (ir.image_id_a = dp.image_id_b AND ir.image_id_b = dp.image_id_a)
        )";

        let (lower, upper) = self.coerce_bounds(suggestion_lower, suggestion_upper);
        let cache_stats = pairs::cache_stats(&self.catalog, self.config.duplicate_scan_threshold)?;
        let scan_threshold = cache_stats.scan_threshold.max(1);
        let cache_ready = cache_stats.suggestion_cache_ready;

        struct Row {
            id_a: i64,
            id_b: i64,
            distance: u32,
            record: Option<SuggestionRecord>,
        }

        let (total, rows): (i64, Vec<Row>) = {
            let reader = self.catalog.reader()?;

            if queue_mode == QueueMode::Distance || !cache_ready {
                let total: i64 = reader.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM duplicate_pairs dp WHERE dp.distance <= ?1 AND {}",
                        NOT_REVIEWED
                    ),
                    [threshold],
                    |r| r.get(0),
                )?;
                let mut stmt = reader.prepare(&format!(
                    "SELECT dp.image_id_a, dp.image_id_b, dp.distance,
                            dps.signal, dps.visual_signal, dps.metadata_adjustment,
                            dps.mean_abs_diff, dps.changed_ratio, dps.largest_blob_ratio,
                            dps.blob_count, dps.peak_blob_contrast, dps.mask_mismatch,
                            dps.pixel_ratio, dps.filesize_ratio, dps.tag_gap_ratio
                     FROM duplicate_pairs dp
                     LEFT JOIN duplicate_pair_suggestions dps
                       ON dps.image_id_a = dp.image_id_a AND dps.image_id_b = dp.image_id_b
                     WHERE dp.distance <= ?1 AND {}
                     ORDER BY dp.distance ASC, dp.image_id_a, dp.image_id_b
                     LIMIT ?2 OFFSET ?3",
                    NOT_REVIEWED
                ))?;
                let rows = stmt
                    .query_map(params![threshold, limit, offset], map_queue_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (
                    total,
                    rows.into_iter()
                        .map(|(id_a, id_b, distance, record)| Row {
                            id_a,
                            id_b,
                            distance,
                            record,
                        })
                        .collect(),
                )
            } else {
                let (filter_clause, order_clause): (&str, String) = match queue_mode {
                    QueueMode::LikelyDuplicates => (
                        "AND dps.signal <= ?4",
                        "ORDER BY dps.signal ASC, dp.distance ASC".to_string(),
                    ),
                    QueueMode::DuplicateHunt => (
                        "",
                        format!(
                            "ORDER BY CASE WHEN dps.signal <= {lower} THEN 0
                                           WHEN dps.signal < {upper} THEN 1
                                           ELSE 2 END ASC,
                                     dps.signal ASC,
                                     dps.largest_blob_ratio ASC,
                                     dps.peak_blob_contrast ASC,
                                     dps.changed_ratio ASC,
                                     dp.distance ASC,
                                     dps.mean_abs_diff ASC"
                        ),
                    ),
                    _ => (
                        "",
                        format!(
                            "ORDER BY CASE WHEN dps.signal <= {lower} THEN 0
                                           WHEN dps.signal < {upper} THEN 1
                                           ELSE 2 END ASC,
                                     dps.signal ASC, dp.distance ASC"
                        ),
                    ),
                };

                let count_sql = format!(
                    "SELECT COUNT(*) FROM duplicate_pairs dp
                     JOIN duplicate_pair_suggestions dps
                       ON dps.image_id_a = dp.image_id_a AND dps.image_id_b = dp.image_id_b
                     WHERE dp.distance <= ?1 AND {} {}",
                    NOT_REVIEWED,
                    if queue_mode == QueueMode::LikelyDuplicates {
                        "AND dps.signal <= ?2"
                    } else {
                        ""
                    }
                );
                let total: i64 = if queue_mode == QueueMode::LikelyDuplicates {
                    reader.query_row(&count_sql, params![threshold, lower], |r| r.get(0))?
                } else {
                    reader.query_row(&count_sql, params![threshold], |r| r.get(0))?
                };

                let select_sql = format!(
                    "SELECT dp.image_id_a, dp.image_id_b, dp.distance,
                            dps.signal, dps.visual_signal, dps.metadata_adjustment,
                            dps.mean_abs_diff, dps.changed_ratio, dps.largest_blob_ratio,
                            dps.blob_count, dps.peak_blob_contrast, dps.mask_mismatch,
                            dps.pixel_ratio, dps.filesize_ratio, dps.tag_gap_ratio
                     FROM duplicate_pairs dp
                     JOIN duplicate_pair_suggestions dps
                       ON dps.image_id_a = dp.image_id_a AND dps.image_id_b = dp.image_id_b
                     WHERE dp.distance <= ?1 AND {} {}
                     {}
                     LIMIT ?2 OFFSET ?3",
                    NOT_REVIEWED, filter_clause, order_clause
                );
                let mut stmt = reader.prepare(&select_sql)?;
                let rows = if queue_mode == QueueMode::LikelyDuplicates {
                    stmt.query_map(params![threshold, limit, offset, lower], map_queue_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                } else {
                    stmt.query_map(params![threshold, limit, offset], map_queue_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                (
                    total,
                    rows.into_iter()
                        .map(|(id_a, id_b, distance, record)| Row {
                            id_a,
                            id_b,
                            distance,
                            record,
                        })
                        .collect(),
                )
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let image_a = self.pair_image(row.id_a)?;
            let image_b = self.pair_image(row.id_b)?;
            let (image_a, image_b) = match (image_a, image_b) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };

            let suggestion = match row.record {
                Some(record) => {
                    let mut s = Self::classify_signal(record.signal, lower, upper);
                    s.record = Some(record);
                    s
                }
                None => {
                    // Cache miss: diff the previews live
                    match self.pair_metrics(&image_a, &image_b) {
                        Some(visual) => {
                            let record = metrics::build_suggestion_record(
                                &visual,
                                &facts_of(&image_a),
                                &facts_of(&image_b),
                            );
                            let mut s = Self::classify_signal(record.signal, lower, upper);
                            s.record = Some(record);
                            s
                        }
                        None => Self::unavailable_suggestion(lower, upper),
                    }
                }
            };

            let confidence =
                ((1.0 - row.distance as f64 / scan_threshold as f64) * 100.0).max(0.0);
            out.push(QueuePair {
                image_a,
                image_b,
                distance: row.distance,
                confidence: (confidence * 10.0).round() / 10.0,
                suggestion,
            });
        }

        Ok(QueuePage {
            pairs: out,
            total,
            offset,
            limit,
            scan_threshold,
            queue_mode,
            suggestion_cache_ready: cache_ready,
            lower_bound: lower,
            upper_bound: upper,
        })
    }

    fn pair_image(&self, image_id: i64) -> Result<Option<PairImage>> {
        let reader = self.catalog.reader()?;
        let row = reader
            .query_row(
                "SELECT i.id, i.filepath, i.md5, i.image_width, i.image_height, i.file_size,
                        i.score,
                        (SELECT COUNT(*) FROM image_tags it WHERE it.image_id = i.id) AS tag_count
                 FROM images i WHERE i.id = ?1",
                [image_id],
                |r| {
                    Ok(PairImage {
                        id: r.get(0)?,
                        filepath: r.get(1)?,
                        md5: r.get(2)?,
                        width: r.get(3)?,
                        height: r.get(4)?,
                        file_size: r.get(5)?,
                        score: r.get(6)?,
                        tag_count: r.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // ACTION COMMIT
    // ========================================================================

    /// Commit a batch of review actions sequentially. Every processed pair is
    /// removed from the cache regardless of action; deletions record a
    /// `non_duplicate` relation so the survivor never re-queues against the
    /// same partner.
    pub fn commit_actions(
        &self,
        actions: &[ReviewAction],
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> CommitResults {
        let mut results = CommitResults::default();
        let total = actions.len();

        for (done, action) in actions.iter().enumerate() {
            match self.execute_action(action) {
                Ok(()) => {
                    results.success_count += 1;
                    if self.config.review_calibration_enabled {
                        match self.log_calibration(action) {
                            Ok(Some(outcome)) => {
                                results.calibration_logged += 1;
                                match outcome {
                                    CalibrationOutcome::Matches => results.calibration_matches += 1,
                                    CalibrationOutcome::Uncertain => {
                                        results.calibration_uncertain += 1
                                    }
                                    CalibrationOutcome::Mismatches => {
                                        results.calibration_mismatches += 1
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!("calibration log write failed: {}", e)
                            }
                        }
                    }
                }
                Err(e) => {
                    results.error_count += 1;
                    results.errors.push(format!(
                        "pair ({}, {}): {}",
                        action.image_id_a, action.image_id_b, e
                    ));
                }
            }
            if let Some(cb) = progress {
                cb(done + 1, total);
            }
        }
        results
    }

    fn execute_action(&self, action: &ReviewAction) -> Result<()> {
        let (id_a, id_b) = (action.image_id_a, action.image_id_b);

        match action.action {
            ReviewActionKind::DeleteA => {
                maintenance::delete_image_completely(&self.catalog, &self.config, id_a)?;
                self.relations.add_relation(
                    id_a,
                    id_b,
                    RelationType::NonDuplicate,
                    RelationSource::DuplicateReview,
                )?;
            }
            ReviewActionKind::DeleteB => {
                maintenance::delete_image_completely(&self.catalog, &self.config, id_b)?;
                self.relations.add_relation(
                    id_a,
                    id_b,
                    RelationType::NonDuplicate,
                    RelationSource::DuplicateReview,
                )?;
            }
            ReviewActionKind::NonDuplicate => {
                self.relations.add_relation(
                    id_a,
                    id_b,
                    RelationType::NonDuplicate,
                    RelationSource::DuplicateReview,
                )?;
            }
            ReviewActionKind::Related => match action.detail.as_deref() {
                Some("parent_child_ab") => {
                    self.relations.add_relation(
                        id_a,
                        id_b,
                        RelationType::ParentChild,
                        RelationSource::DuplicateReview,
                    )?;
                }
                Some("parent_child_ba") => {
                    self.relations.add_relation(
                        id_b,
                        id_a,
                        RelationType::ParentChild,
                        RelationSource::DuplicateReview,
                    )?;
                }
                Some("sibling") | None => {
                    self.relations.add_relation(
                        id_a,
                        id_b,
                        RelationType::Sibling,
                        RelationSource::DuplicateReview,
                    )?;
                }
                Some(other) => return Err(ReviewError::UnknownAction(other.to_string())),
            },
        }

        pairs::remove_pair(&self.catalog, id_a, id_b)?;
        Ok(())
    }

    // ========================================================================
    // CALIBRATION LOG
    // ========================================================================

    fn log_calibration(&self, action: &ReviewAction) -> Result<Option<CalibrationOutcome>> {
        let suggestion = match &action.suggestion {
            Some(s) => s.clone(),
            None => return Ok(None),
        };

        let manual_class = match action.action {
            ReviewActionKind::DeleteA | ReviewActionKind::DeleteB => "duplicate",
            ReviewActionKind::NonDuplicate | ReviewActionKind::Related => "variation",
        };
        let outcome = calibration_outcome(suggestion.label, manual_class);

        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "image_id_a": action.image_id_a,
            "image_id_b": action.image_id_b,
            "action": action.action,
            "detail": action.detail,
            "manual_class": manual_class,
            "suggested_class": suggestion.label.as_str(),
            "outcome": outcome.as_str(),
            "signal": suggestion.signal,
            "confidence": suggestion.confidence,
            "bounds": {"lower": suggestion.lower_bound, "upper": suggestion.upper_bound},
            "metrics": suggestion.record,
        });

        let path = &self.config.review_calibration_log;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", record)?;
        Ok(Some(outcome))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalibrationOutcome {
    Matches,
    Uncertain,
    Mismatches,
}

impl CalibrationOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CalibrationOutcome::Matches => "matches",
            CalibrationOutcome::Uncertain => "uncertain",
            CalibrationOutcome::Mismatches => "mismatches",
        }
    }
}

fn calibration_outcome(suggested: SuggestionClass, manual_class: &str) -> CalibrationOutcome {
    match suggested {
        SuggestionClass::Uncertain | SuggestionClass::Unavailable => CalibrationOutcome::Uncertain,
        SuggestionClass::LikelyDuplicate if manual_class == "duplicate" => {
            CalibrationOutcome::Matches
        }
        SuggestionClass::LikelyVariation if manual_class == "variation" => {
            CalibrationOutcome::Matches
        }
        _ => CalibrationOutcome::Mismatches,
    }
}

type QueueRowTuple = (i64, i64, u32, Option<SuggestionRecord>);

fn map_queue_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRowTuple> {
    let signal: Option<f64> = r.get(3)?;
    let record = match signal {
        Some(signal) => Some(SuggestionRecord {
            signal,
            visual_signal: r.get(4)?,
            metadata_adjustment: r.get(5)?,
            mean_abs_diff: r.get(6)?,
            changed_ratio: r.get(7)?,
            largest_blob_ratio: r.get(8)?,
            blob_count: r.get(9)?,
            peak_blob_contrast: r.get(10)?,
            mask_mismatch: r.get(11)?,
            pixel_ratio: r.get(12)?,
            filesize_ratio: r.get(13)?,
            tag_gap_ratio: r.get(14)?,
        }),
        None => None,
    };
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, record))
}

fn facts_of(image: &PairImage) -> ImageFacts {
    ImageFacts {
        width: image.width,
        height: image.height,
        file_size: image.file_size,
        tag_count: image.tag_count,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;
    use crate::similarity::pairs::scan_duplicate_pairs;

    fn setup(hashes: &[&str]) -> (Arc<Catalog>, ReviewService, Vec<i64>) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let ids: Vec<i64> = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let mut commit = sample_commit(&format!("{}.jpg", i), &format!("m{}", i));
                commit.phash = Some(h.to_string());
                catalog.commit_ingest(&commit).unwrap()
            })
            .collect();
        scan_duplicate_pairs(&catalog, 15, None).unwrap();

        let service = ReviewService::new(catalog.clone(), Config::default());
        (catalog, service, ids)
    }

    fn insert_suggestion(catalog: &Catalog, a: i64, b: i64, signal: f64) {
        let writer = catalog.writer().unwrap();
        writer
            .execute(
                "INSERT OR REPLACE INTO duplicate_pair_suggestions (
                    image_id_a, image_id_b, signal, visual_signal, metadata_adjustment,
                    mean_abs_diff, changed_ratio, largest_blob_ratio, blob_count,
                    peak_blob_contrast, mask_mismatch, pixel_ratio, filesize_ratio,
                    tag_gap_ratio, computed_at
                ) VALUES (?1, ?2, ?3, ?3, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 'now')",
                params![a.min(b), a.max(b), signal],
            )
            .unwrap();
    }

    #[test]
    fn classification_bounds() {
        let s = ReviewService::classify_signal(0.005, 0.012, 0.04);
        assert_eq!(s.label, SuggestionClass::LikelyDuplicate);
        let s = ReviewService::classify_signal(0.2, 0.012, 0.04);
        assert_eq!(s.label, SuggestionClass::LikelyVariation);
        let s = ReviewService::classify_signal(0.026, 0.012, 0.04);
        assert_eq!(s.label, SuggestionClass::Uncertain);
        // Midpoint of the band has the highest uncertainty confidence
        assert!(s.confidence > 0.9);
    }

    #[test]
    fn queue_distance_mode_sorts_ascending() {
        let (_catalog, service, _ids) = setup(&[
            "0000000000000000",
            "0000000000000001", // d=1 vs first
            "000000000000000f", // d=4 vs first, d=3 vs second
        ]);
        let page = service
            .queue(15, 0, 50, QueueMode::Distance, None, None)
            .unwrap();
        assert_eq!(page.total, 3);
        let distances: Vec<u32> = page.pairs.iter().map(|p| p.distance).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn queue_threshold_filters_pairs() {
        let (_catalog, service, _ids) = setup(&[
            "0000000000000000",
            "0000000000000001",
            "00000000000000ff",
        ]);
        let page = service
            .queue(2, 0, 50, QueueMode::Distance, None, None)
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.pairs[0].distance, 1);
    }

    #[test]
    fn reviewed_pairs_drop_out_of_queue() {
        let (_catalog, service, ids) = setup(&["0000000000000000", "0000000000000001"]);
        assert_eq!(
            service
                .queue(15, 0, 50, QueueMode::Distance, None, None)
                .unwrap()
                .total,
            1
        );

        let results = service.commit_actions(
            &[ReviewAction {
                image_id_a: ids[0],
                image_id_b: ids[1],
                action: ReviewActionKind::NonDuplicate,
                detail: None,
                suggestion: None,
            }],
            None,
        );
        assert_eq!(results.success_count, 1);
        assert_eq!(
            service
                .queue(15, 0, 50, QueueMode::Distance, None, None)
                .unwrap()
                .total,
            0
        );
    }

    #[test]
    fn likely_duplicates_mode_filters_by_signal() {
        let (catalog, service, ids) = setup(&[
            "0000000000000000",
            "0000000000000001",
            "0000000000000003",
        ]);
        // Three pairs; cache all of them so the mode engages
        insert_suggestion(&catalog, ids[0], ids[1], 0.005);
        insert_suggestion(&catalog, ids[0], ids[2], 0.5);
        insert_suggestion(&catalog, ids[1], ids[2], 0.3);

        let page = service
            .queue(15, 0, 50, QueueMode::LikelyDuplicates, None, None)
            .unwrap();
        assert!(page.suggestion_cache_ready);
        assert_eq!(page.total, 1);
        assert_eq!(page.pairs[0].suggestion.label, SuggestionClass::LikelyDuplicate);
    }

    #[test]
    fn duplicate_first_buckets_by_class() {
        let (catalog, service, ids) = setup(&[
            "0000000000000000",
            "0000000000000001",
            "0000000000000003",
        ]);
        insert_suggestion(&catalog, ids[0], ids[1], 0.5); // variation
        insert_suggestion(&catalog, ids[0], ids[2], 0.005); // duplicate
        insert_suggestion(&catalog, ids[1], ids[2], 0.02); // uncertain

        let page = service
            .queue(15, 0, 50, QueueMode::DuplicateFirst, None, None)
            .unwrap();
        let labels: Vec<SuggestionClass> =
            page.pairs.iter().map(|p| p.suggestion.label).collect();
        assert_eq!(
            labels,
            vec![
                SuggestionClass::LikelyDuplicate,
                SuggestionClass::Uncertain,
                SuggestionClass::LikelyVariation
            ]
        );
    }

    #[test]
    fn sibling_commit_records_min_max_relation() {
        let (catalog, service, ids) = setup(&["0000000000000000", "0000000000000001"]);
        let results = service.commit_actions(
            &[ReviewAction {
                image_id_a: ids[1].max(ids[0]),
                image_id_b: ids[1].min(ids[0]),
                action: ReviewActionKind::Related,
                detail: Some("sibling".to_string()),
                suggestion: None,
            }],
            None,
        );
        assert_eq!(results.success_count, 1);

        let reader = catalog.reader().unwrap();
        let (a, b, t): (i64, i64, String) = reader
            .query_row(
                "SELECT image_id_a, image_id_b, relation_type FROM image_relations",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(t, "sibling");
        assert!(a < b);
        // Pair is gone from the cache
        let pairs_left: i64 = reader
            .query_row("SELECT COUNT(*) FROM duplicate_pairs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pairs_left, 0);
    }

    #[test]
    fn delete_b_removes_image_and_records_relation() {
        let (catalog, service, ids) = setup(&["0000000000000000", "0000000000000002"]);
        let results = service.commit_actions(
            &[ReviewAction {
                image_id_a: ids[0],
                image_id_b: ids[1],
                action: ReviewActionKind::DeleteB,
                detail: None,
                suggestion: None,
            }],
            None,
        );
        assert_eq!(results.success_count, 1, "{:?}", results.errors);
        assert!(catalog.image_by_id(ids[1]).unwrap().is_none());
        assert!(catalog.image_by_id(ids[0]).unwrap().is_some());

        let reader = catalog.reader().unwrap();
        let relation_count: i64 = reader
            .query_row(
                "SELECT COUNT(*) FROM image_relations WHERE relation_type = 'non_duplicate'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(relation_count, 1);
    }

    #[test]
    fn calibration_outcomes() {
        assert_eq!(
            calibration_outcome(SuggestionClass::LikelyDuplicate, "duplicate"),
            CalibrationOutcome::Matches
        );
        assert_eq!(
            calibration_outcome(SuggestionClass::LikelyVariation, "duplicate"),
            CalibrationOutcome::Mismatches
        );
        assert_eq!(
            calibration_outcome(SuggestionClass::Uncertain, "duplicate"),
            CalibrationOutcome::Uncertain
        );
    }
}
