//! Hash engine
//!
//! Perceptual (DCT) and color-histogram hashes for every ingested artifact.
//! Stills hash directly; zip animations hash the first extracted frame;
//! videos hash a sampled middle frame via the `FrameExtractor` seam.
//!
//! Hashes are pure functions of file bytes. pHash is 64 bits (8x8 DCT over a
//! 32x32 grayscale reduction, median-thresholded) stored as 16 lowercase hex
//! chars; hamming distance is XOR + popcount on the integer form.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::config::{IMAGE_EXTENSIONS, VIDEO_EXTENSIONS, ZIP_EXTENSIONS};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Hash engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Image decode failure
    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),
    /// Zip archive failure
    #[error("Zip error: {0}")]
    Zip(String),
    /// No frame could be produced for the artifact
    #[error("No hashable frame for {0}")]
    NoFrame(String),
    /// Unknown or unsupported artifact kind
    #[error("Unsupported artifact: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, HashError>;

// ============================================================================
// ARTIFACT KINDS
// ============================================================================

/// What kind of artifact a path names, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Still,
    Video,
    ZipAnimation,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactKind::Still)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactKind::Video)
        } else if ZIP_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactKind::ZipAnimation)
        } else {
            None
        }
    }
}

// ============================================================================
// MD5
// ============================================================================

/// Chunked MD5 of a file, as 32 lowercase hex chars.
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// MD5 of an in-memory buffer.
pub fn bytes_md5(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

// ============================================================================
// FRAME EXTRACTION SEAM
// ============================================================================

/// Produces a representative frame for artifacts that are not plain stills.
///
/// Video decoding is an external concern; the default extractor resolves the
/// mirrored preview image when one exists and reports `NoFrame` otherwise.
pub trait FrameExtractor: Send + Sync {
    /// A middle frame for a video artifact.
    fn middle_frame(&self, path: &Path) -> Result<DynamicImage>;
}

/// Frame extractor backed by the external thumbnailer's preview mirror.
pub struct PreviewFrameExtractor {
    pub image_directory: std::path::PathBuf,
    pub thumb_directory: std::path::PathBuf,
}

impl PreviewFrameExtractor {
    fn preview_path(&self, path: &Path) -> Option<std::path::PathBuf> {
        let rel = path.strip_prefix(&self.image_directory).ok()?;
        Some(self.thumb_directory.join(rel).with_extension("webp"))
    }
}

impl FrameExtractor for PreviewFrameExtractor {
    fn middle_frame(&self, path: &Path) -> Result<DynamicImage> {
        let preview = self
            .preview_path(path)
            .filter(|p| p.exists())
            .ok_or_else(|| HashError::NoFrame(path.display().to_string()))?;
        Ok(image::open(preview)?)
    }
}

// ============================================================================
// HASH PRIMITIVES
// ============================================================================

/// 64-bit DCT perceptual hash.
///
/// Reduce to 32x32 grayscale, run a 2D DCT, take the low-frequency 8x8
/// block, and set each bit where the coefficient exceeds the block median.
pub fn phash64(img: &DynamicImage) -> u64 {
    const REDUCED: u32 = 32;
    const BLOCK: usize = 8;

    let gray = img
        .resize_exact(REDUCED, REDUCED, FilterType::Lanczos3)
        .to_luma8();
    let n = REDUCED as usize;
    let mut pixels = vec![0f64; n * n];
    for (x, y, p) in gray.enumerate_pixels() {
        pixels[y as usize * n + x as usize] = p.0[0] as f64;
    }

    // Low-frequency BLOCK x BLOCK corner of the 2D DCT-II
    let mut coeffs = [0f64; BLOCK * BLOCK];
    for u in 0..BLOCK {
        for v in 0..BLOCK {
            let mut sum = 0f64;
            for y in 0..n {
                let cy = ((2 * y + 1) as f64 * u as f64 * std::f64::consts::PI
                    / (2.0 * n as f64))
                    .cos();
                for x in 0..n {
                    let cx = ((2 * x + 1) as f64 * v as f64 * std::f64::consts::PI
                        / (2.0 * n as f64))
                        .cos();
                    sum += pixels[y * n + x] * cy * cx;
                }
            }
            coeffs[u * BLOCK + v] = sum;
        }
    }

    let mut sorted = coeffs;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = (sorted[BLOCK * BLOCK / 2 - 1] + sorted[BLOCK * BLOCK / 2]) / 2.0;

    let mut hash = 0u64;
    for (i, c) in coeffs.iter().enumerate() {
        if *c > median {
            hash |= 1 << i;
        }
    }
    hash
}

/// Low-resolution color-histogram hash.
///
/// 3x3x3 RGB occupancy histogram over opaque pixels; each bit marks a bin
/// holding more than its fair share. 27 bits, 7 lowercase hex chars.
pub fn colorhash(img: &DynamicImage) -> u32 {
    const BINS: usize = 3;

    let small = img.resize_exact(32, 32, FilterType::Triangle).to_rgba8();
    let mut histogram = [0u32; BINS * BINS * BINS];
    let mut total = 0u32;
    for p in small.pixels() {
        if p.0[3] < 16 {
            continue;
        }
        let r = (p.0[0] as usize * BINS) / 256;
        let g = (p.0[1] as usize * BINS) / 256;
        let b = (p.0[2] as usize * BINS) / 256;
        histogram[r * BINS * BINS + g * BINS + b] += 1;
        total += 1;
    }
    if total == 0 {
        return 0;
    }

    let mean = total as f64 / histogram.len() as f64;
    let mut hash = 0u32;
    for (i, count) in histogram.iter().enumerate() {
        if *count as f64 > mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Hamming distance between two pHash integers.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Hamming distance between two stored hex hashes; `None` if either fails to
/// parse.
pub fn hamming_distance_hex(a: &str, b: &str) -> Option<u32> {
    let a = u64::from_str_radix(a, 16).ok()?;
    let b = u64::from_str_radix(b, 16).ok()?;
    Some(hamming_distance(a, b))
}

/// Render a pHash as its stored form: 16 lowercase hex chars.
pub fn phash_to_hex(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Render a color hash as its stored form.
pub fn colorhash_to_hex(hash: u32) -> String {
    format!("{:07x}", hash)
}

// ============================================================================
// HASH ENGINE
// ============================================================================

/// Computed fingerprints for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPair {
    pub phash: String,
    pub colorhash: String,
}

/// Per-artifact hash computation with frame dispatch.
pub struct HashEngine {
    frame_extractor: Arc<dyn FrameExtractor>,
}

impl HashEngine {
    pub fn new(frame_extractor: Arc<dyn FrameExtractor>) -> Self {
        Self { frame_extractor }
    }

    /// Load the representative frame for any supported artifact.
    pub fn load_frame(&self, path: &Path) -> Result<DynamicImage> {
        let kind = ArtifactKind::from_path(path)
            .ok_or_else(|| HashError::Unsupported(path.display().to_string()))?;
        match kind {
            ArtifactKind::Still => Ok(image::open(path)?),
            ArtifactKind::ZipAnimation => first_zip_frame(path),
            ArtifactKind::Video => self.frame_extractor.middle_frame(path),
        }
    }

    /// Compute both hashes for an artifact.
    pub fn compute(&self, path: &Path) -> Result<HashPair> {
        let frame = self.load_frame(path)?;
        Ok(Self::compute_from_frame(&frame))
    }

    /// Compute both hashes from an already-loaded frame.
    pub fn compute_from_frame(frame: &DynamicImage) -> HashPair {
        HashPair {
            phash: phash_to_hex(phash64(frame)),
            colorhash: colorhash_to_hex(colorhash(frame)),
        }
    }

    /// Pixel dimensions of the representative frame.
    pub fn frame_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        Ok(self.load_frame(path)?.dimensions())
    }
}

/// First image frame of a zip animation, by entry-name order.
fn first_zip_frame(path: &Path) -> Result<DynamicImage> {
    let file = File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| HashError::Zip(e.to_string()))?;

    let mut names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    names.sort();

    let first = names
        .first()
        .ok_or_else(|| HashError::NoFrame(path.display().to_string()))?;
    let mut entry = archive
        .by_name(first)
        .map_err(|e| HashError::Zip(e.to_string()))?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(image::load_from_memory(&bytes)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32, color: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(color)))
    }

    fn gradient(w: u32, h: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 255 / w) as u8, (y * 255 / h) as u8, 128, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn phash_is_deterministic_and_scale_stable() {
        let a = phash64(&gradient(256, 256));
        let b = phash64(&gradient(256, 256));
        assert_eq!(a, b);
        // The same content at a different scale stays within a tight distance
        let c = phash64(&gradient(128, 128));
        assert!(hamming_distance(a, c) <= 4, "distance {}", hamming_distance(a, c));
    }

    #[test]
    fn phash_separates_different_content() {
        let a = phash64(&gradient(64, 64));
        let b = phash64(&solid(64, 64, [255, 255, 255, 255]));
        assert!(hamming_distance(a, b) > 8);
    }

    #[test]
    fn hex_forms() {
        assert_eq!(phash_to_hex(0), "0000000000000000");
        assert_eq!(phash_to_hex(u64::MAX), "ffffffffffffffff");
        assert_eq!(hamming_distance_hex("00ff", "0000"), Some(8));
        assert_eq!(hamming_distance_hex("zzzz", "0000"), None);
    }

    #[test]
    fn colorhash_differs_between_palettes() {
        let red = colorhash(&solid(32, 32, [255, 0, 0, 255]));
        let blue = colorhash(&solid(32, 32, [0, 0, 255, 255]));
        assert_ne!(red, blue);
    }

    #[test]
    fn colorhash_ignores_transparent_pixels() {
        let transparent = colorhash(&solid(32, 32, [255, 0, 0, 0]));
        assert_eq!(transparent, 0);
    }

    #[test]
    fn md5_matches_known_vector() {
        // RFC 1321 test vector
        assert_eq!(bytes_md5(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn artifact_kind_dispatch() {
        assert_eq!(ArtifactKind::from_path(Path::new("a.png")), Some(ArtifactKind::Still));
        assert_eq!(ArtifactKind::from_path(Path::new("a.MP4")), Some(ArtifactKind::Video));
        assert_eq!(
            ArtifactKind::from_path(Path::new("a.zip")),
            Some(ArtifactKind::ZipAnimation)
        );
        assert_eq!(ArtifactKind::from_path(Path::new("a.txt")), None);
    }
}
