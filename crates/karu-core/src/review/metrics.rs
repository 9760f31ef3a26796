//! Pair diff metrics
//!
//! The per-pair visual evidence behind a review suggestion. Both previews
//! are aspect-fit onto a fixed square canvas; the diff is measured inside
//! the union coverage mask, despeckled, and segmented into connected
//! changed regions. The composite signal weighs the largest coherent
//! region most, then its contrast, then overall changed area, then any
//! coverage-mask mismatch.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Square preview edge for diffing.
pub const PREVIEW_SIZE: u32 = 256;

/// Per-pixel difference floor for the change mask (~24/255).
pub const DIFF_PIXEL_THRESHOLD: f32 = 24.0 / 255.0;

/// Minimum lit 3x3 neighbors for a diff pixel to survive despeckling.
pub const DIFF_NEIGHBOR_MIN: u32 = 4;

/// Guards that stop metadata evidence from overpowering visually
/// near-identical pairs.
const LOW_VISUAL_SIGNAL_GUARD: f64 = 0.02;
const LOW_BLOB_RATIO_GUARD: f64 = 0.0025;

// ============================================================================
// TYPES
// ============================================================================

/// Visual diff metrics for one pair. `None` from the compute functions means
/// the diff was unavailable (missing preview, empty overlay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMetrics {
    pub mean_abs_diff: f64,
    pub changed_ratio: f64,
    pub largest_blob_ratio: f64,
    pub blob_count: i64,
    pub peak_blob_contrast: f64,
    pub mask_mismatch: f64,
    /// `0.55*largest_blob + 0.25*peak_contrast + 0.15*changed + 0.05*mask`
    pub variation_signal: f64,
}

/// Secondary metadata evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMetrics {
    pub pixel_ratio: f64,
    pub filesize_ratio: f64,
    pub tag_gap_ratio: f64,
    pub variation_adjustment: f64,
}

/// The full cached suggestion record for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionRecord {
    pub signal: f64,
    pub visual_signal: f64,
    pub metadata_adjustment: f64,
    pub mean_abs_diff: f64,
    pub changed_ratio: f64,
    pub largest_blob_ratio: f64,
    pub blob_count: i64,
    pub peak_blob_contrast: f64,
    pub mask_mismatch: f64,
    pub pixel_ratio: f64,
    pub filesize_ratio: f64,
    pub tag_gap_ratio: f64,
}

/// The metadata inputs to the adjustment, per image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFacts {
    pub width: i64,
    pub height: i64,
    pub file_size: i64,
    pub tag_count: i64,
}

// ============================================================================
// PREVIEW LOADING
// ============================================================================

struct DiffArrays {
    /// RGB over white, per channel in [0, 1]
    rgb: Vec<[f32; 3]>,
    /// Slightly blurred grayscale in [0, 1]
    gray: Vec<f32>,
    /// Source alpha in [0, 1]
    alpha: Vec<f32>,
}

fn load_diff_arrays(path: &Path) -> Option<DiffArrays> {
    let img = image::open(path).ok()?;
    Some(diff_arrays_from(&img))
}

fn diff_arrays_from(img: &DynamicImage) -> DiffArrays {
    let size = PREVIEW_SIZE;
    let contained = img.resize(size, size, FilterType::Lanczos3).to_rgba8();
    let (w, h) = contained.dimensions();
    let offset_x = (size - w) / 2;
    let offset_y = (size - h) / 2;

    // Aspect-fit onto a transparent canvas, centered
    let mut fitted = RgbaImage::from_pixel(size, size, image::Rgba([255, 255, 255, 0]));
    image::imageops::overlay(&mut fitted, &contained, offset_x as i64, offset_y as i64);

    let n = (size * size) as usize;
    let mut rgb = vec![[0f32; 3]; n];
    let mut alpha = vec![0f32; n];
    let mut gray_img = image::GrayImage::new(size, size);

    for (i, p) in fitted.pixels().enumerate() {
        let a = p.0[3] as f32 / 255.0;
        // Composite over white
        let r = (p.0[0] as f32 / 255.0) * a + (1.0 - a);
        let g = (p.0[1] as f32 / 255.0) * a + (1.0 - a);
        let b = (p.0[2] as f32 / 255.0) * a + (1.0 - a);
        rgb[i] = [r, g, b];
        alpha[i] = a;
        let luma = (0.299 * r + 0.587 * g + 0.114 * b) * 255.0;
        gray_img.put_pixel(i as u32 % size, i as u32 / size, image::Luma([luma as u8]));
    }

    // Slight blur so compression grain does not dominate contrast readings
    let blurred = image::imageops::blur(&gray_img, 0.4);
    let gray: Vec<f32> = blurred.pixels().map(|p| p.0[0] as f32 / 255.0).collect();

    DiffArrays { rgb, gray, alpha }
}

// ============================================================================
// METRIC COMPUTATION
// ============================================================================

/// Diff two preview files. `None` when either preview fails to load or the
/// union coverage is empty.
pub fn compute_pair_metrics(path_a: &Path, path_b: &Path) -> Option<PairMetrics> {
    let a = load_diff_arrays(path_a)?;
    let b = load_diff_arrays(path_b)?;
    compute_metrics_from_arrays(&a, &b)
}

/// Diff two already-loaded frames (test seam).
pub fn compute_pair_metrics_from_images(a: &DynamicImage, b: &DynamicImage) -> Option<PairMetrics> {
    compute_metrics_from_arrays(&diff_arrays_from(a), &diff_arrays_from(b))
}

fn compute_metrics_from_arrays(a: &DiffArrays, b: &DiffArrays) -> Option<PairMetrics> {
    let size = PREVIEW_SIZE as usize;
    let n = size * size;

    // Union coverage: anywhere either preview has pixels
    let union_mask: Vec<bool> = (0..n)
        .map(|i| a.alpha[i].max(b.alpha[i]) > 0.0)
        .collect();
    let overlay_pixels = union_mask.iter().filter(|m| **m).count();
    if overlay_pixels == 0 {
        return None;
    }

    // Max-channel RGB difference and grayscale difference
    let rgb_diff: Vec<f32> = (0..n)
        .map(|i| {
            let pa = a.rgb[i];
            let pb = b.rgb[i];
            (pa[0] - pb[0])
                .abs()
                .max((pa[1] - pb[1]).abs())
                .max((pa[2] - pb[2]).abs())
        })
        .collect();
    let gray_diff: Vec<f32> = (0..n).map(|i| (a.gray[i] - b.gray[i]).abs()).collect();
    let mask_diff: Vec<f32> = (0..n).map(|i| (a.alpha[i] - b.alpha[i]).abs()).collect();

    let mean_abs_diff = {
        let sum: f32 = (0..n).filter(|i| union_mask[*i]).map(|i| rgb_diff[i]).sum();
        sum as f64 / overlay_pixels as f64
    };
    let mask_mismatch = mask_diff.iter().map(|v| *v as f64).sum::<f64>() / n as f64;

    let raw_mask: Vec<bool> = (0..n)
        .map(|i| union_mask[i] && rgb_diff[i] >= DIFF_PIXEL_THRESHOLD)
        .collect();
    let cleaned = despeckle(&raw_mask, size);

    let changed = cleaned.iter().filter(|m| **m).count();
    let changed_ratio = changed as f64 / overlay_pixels as f64;

    let (blob_count, largest_blob_pixels, peak_blob_contrast) =
        extract_change_regions(&cleaned, &gray_diff, &union_mask, size);
    let largest_blob_ratio = largest_blob_pixels as f64 / overlay_pixels as f64;

    let variation_signal = largest_blob_ratio * 0.55
        + peak_blob_contrast * 0.25
        + changed_ratio * 0.15
        + mask_mismatch * 0.05;

    Some(PairMetrics {
        mean_abs_diff,
        changed_ratio,
        largest_blob_ratio,
        blob_count: blob_count as i64,
        peak_blob_contrast,
        mask_mismatch,
        variation_signal,
    })
}

/// Drop diff pixels whose 3x3 neighborhood has too few lit neighbors, so
/// compression speckle cannot masquerade as a changed region.
fn despeckle(mask: &[bool], size: usize) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 0..size {
        for x in 0..size {
            let i = y * size + x;
            if !mask[i] {
                continue;
            }
            let mut neighbors = 0u32;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let ny = y as i64 + dy;
                    let nx = x as i64 + dx;
                    if ny < 0 || nx < 0 || ny >= size as i64 || nx >= size as i64 {
                        continue;
                    }
                    if mask[ny as usize * size + nx as usize] {
                        neighbors += 1;
                    }
                }
            }
            // The 3x3 window count includes the center pixel itself
            out[i] = neighbors >= DIFF_NEIGHBOR_MIN;
        }
    }
    out
}

/// Connected components (8-neighborhood) over the cleaned change mask.
/// Returns (blob count, largest blob pixel count, peak mean contrast).
fn extract_change_regions(
    change_mask: &[bool],
    gray_diff: &[f32],
    union_mask: &[bool],
    size: usize,
) -> (usize, usize, f64) {
    let mut visited = vec![false; change_mask.len()];
    let mut blob_count = 0usize;
    let mut largest = 0usize;
    let mut peak_contrast = 0f64;

    for start in 0..change_mask.len() {
        if !change_mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        let mut stack = vec![start];
        let mut pixels = Vec::new();

        while let Some(i) = stack.pop() {
            pixels.push(i);
            let y = i / size;
            let x = i % size;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dy == 0 && dx == 0 {
                        continue;
                    }
                    let ny = y as i64 + dy;
                    let nx = x as i64 + dx;
                    if ny < 0 || nx < 0 || ny >= size as i64 || nx >= size as i64 {
                        continue;
                    }
                    let ni = ny as usize * size + nx as usize;
                    if change_mask[ni] && !visited[ni] {
                        visited[ni] = true;
                        stack.push(ni);
                    }
                }
            }
        }

        blob_count += 1;
        largest = largest.max(pixels.len());
        let contrasts: Vec<f64> = pixels
            .iter()
            .filter(|i| union_mask[**i])
            .map(|i| gray_diff[*i] as f64)
            .collect();
        if !contrasts.is_empty() {
            let mean = contrasts.iter().sum::<f64>() / contrasts.len() as f64;
            peak_contrast = peak_contrast.max(mean);
        }
    }

    (blob_count, largest, peak_contrast)
}

// ============================================================================
// METADATA EVIDENCE
// ============================================================================

/// Pixel-area, filesize, and tag-count evidence for a pair.
pub fn compute_metadata_metrics(a: &ImageFacts, b: &ImageFacts) -> MetadataMetrics {
    let pixels_a = (a.width.max(0) * a.height.max(0)).max(1) as f64;
    let pixels_b = (b.width.max(0) * b.height.max(0)).max(1) as f64;
    let file_a = a.file_size.max(1) as f64;
    let file_b = b.file_size.max(1) as f64;
    let tags_a = a.tag_count.max(0) as f64;
    let tags_b = b.tag_count.max(0) as f64;

    let pixel_ratio = pixels_a.min(pixels_b) / pixels_a.max(pixels_b);
    let filesize_ratio = file_a.min(file_b) / file_a.max(file_b);
    let tag_gap_ratio = (tags_a - tags_b).abs() / tags_a.max(tags_b).max(1.0);

    let variation_adjustment = (1.0 - pixel_ratio) * 0.020
        + (1.0 - filesize_ratio) * 0.012
        + tag_gap_ratio * 0.006;

    MetadataMetrics {
        pixel_ratio,
        filesize_ratio,
        tag_gap_ratio,
        variation_adjustment,
    }
}

/// Scale the metadata adjustment down when the visual evidence says the pair
/// is near-identical, so metadata alone cannot flip the classification.
pub fn guard_metadata_adjustment(
    raw_adjustment: f64,
    visual_signal: f64,
    largest_blob_ratio: f64,
) -> f64 {
    if raw_adjustment <= 0.0 {
        return 0.0;
    }
    if visual_signal >= LOW_VISUAL_SIGNAL_GUARD || largest_blob_ratio >= LOW_BLOB_RATIO_GUARD {
        return raw_adjustment;
    }
    let visual_scale = (visual_signal.max(0.0) / LOW_VISUAL_SIGNAL_GUARD).min(1.0);
    let blob_scale = (largest_blob_ratio.max(0.0) / LOW_BLOB_RATIO_GUARD).min(1.0);
    let guard_scale = visual_scale.max(blob_scale).max(0.15);
    raw_adjustment * guard_scale
}

/// Assemble the cached record from visual + metadata evidence.
pub fn build_suggestion_record(
    metrics: &PairMetrics,
    facts_a: &ImageFacts,
    facts_b: &ImageFacts,
) -> SuggestionRecord {
    let metadata = compute_metadata_metrics(facts_a, facts_b);
    let adjustment = guard_metadata_adjustment(
        metadata.variation_adjustment,
        metrics.variation_signal,
        metrics.largest_blob_ratio,
    );
    SuggestionRecord {
        signal: (metrics.variation_signal + adjustment).min(1.0),
        visual_signal: metrics.variation_signal,
        metadata_adjustment: adjustment,
        mean_abs_diff: metrics.mean_abs_diff,
        changed_ratio: metrics.changed_ratio,
        largest_blob_ratio: metrics.largest_blob_ratio,
        blob_count: metrics.blob_count,
        peak_blob_contrast: metrics.peak_blob_contrast,
        mask_mismatch: metrics.mask_mismatch,
        pixel_ratio: metadata.pixel_ratio,
        filesize_ratio: metadata.filesize_ratio,
        tag_gap_ratio: metadata.tag_gap_ratio,
    }
}

// ============================================================================
// TESTS
// ============================================================================
