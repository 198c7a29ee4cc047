use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::CodecError;

const DOWNSCALE_FILTER: FilterType = FilterType::Lanczos3;

/// How a decode should be shaped to its target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Decode to fit within `target`, never upscaling. Used for thumbnails
    /// and fast-view display where a full-resolution buffer is wasted work.
    Thumbnail,
    /// Decode at the source file's native resolution regardless of target.
    Full,
}

/// An immutable, decoded RGB24 pixel buffer.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    /// Row-major RGB8 bytes, stride == width * 3.
    bytes: std::sync::Arc<[u8]>,
}

impl PixelBuffer {
    fn from_rgb_image(image: image::RgbImage) -> Self {
        let width = image.width();
        let height = image.height();
        PixelBuffer {
            width,
            height,
            bytes: image.into_raw().into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.width * 3
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

const SUPPORTED_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp"];

/// Returns true if `path`'s extension is one this codec can decode.
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decodes `path` to an RGB24 buffer shaped according to `mode`/`target`.
///
/// Pure with respect to filesystem input and free of shared state, so it is
/// safe to invoke from any worker thread in the scheduler's pool.
pub fn decode(
    path: &Path,
    target: Option<(u32, u32)>,
    mode: DecodeMode,
) -> Result<PixelBuffer, CodecError> {
    if !path.exists() {
        return Err(CodecError::NotFound {
            path: path.to_path_buf(),
        });
    }
    if !is_supported(path) {
        return Err(CodecError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let image = image::open(path).map_err(|source| classify_open_error(path, source))?;
    let image = flatten_to_opaque(image);

    let shaped = match (mode, target) {
        (DecodeMode::Thumbnail, Some((w, h))) => fit_within(&image, w, h),
        _ => image,
    };

    Ok(PixelBuffer::from_rgb_image(shaped.to_rgb8()))
}

/// Reads just the pixel dimensions of `path` without decoding the full
/// image, for folder-listing resolution probes.
pub fn probe_dimensions(path: &Path) -> Result<(u32, u32), CodecError> {
    if !path.exists() {
        return Err(CodecError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let reader = image::ImageReader::open(path)
        .map_err(|source| CodecError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| CodecError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;
    reader
        .into_dimensions()
        .map_err(|source| classify_open_error(path, source))
}

fn fit_within(image: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    if w <= target_w && h <= target_h {
        // Never upscale: a source already inside the box is returned as-is.
        return image.clone();
    }
    image.resize(target_w, target_h, DOWNSCALE_FILTER)
}

/// Composites any alpha channel against a neutral mid-gray background so the
/// scheduler/cache only ever deal with opaque RGB24 buffers.
fn flatten_to_opaque(image: DynamicImage) -> DynamicImage {
    if !has_alpha(&image) {
        return image;
    }
    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut flattened = image::RgbImage::from_pixel(w, h, image::Rgb([128, 128, 128]));
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        if a == 255 {
            flattened.put_pixel(x, y, image::Rgb([r, g, b]));
            continue;
        }
        if a == 0 {
            continue;
        }
        let alpha = a as u32;
        let blend = |channel: u8, background: u8| -> u8 {
            (((channel as u32 * alpha) + (background as u32 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, image::Rgb([blend(r, 128), blend(g, 128), blend(b, 128)]));
    }
    DynamicImage::ImageRgb8(flattened)
}

fn has_alpha(image: &DynamicImage) -> bool {
    image.color().has_alpha()
}

fn classify_open_error(path: &Path, source: image::ImageError) -> CodecError {
    match &source {
        image::ImageError::Unsupported(_) => CodecError::UnsupportedFormat {
            path: path.to_path_buf(),
        },
        image::ImageError::IoError(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => {
            CodecError::NotFound {
                path: path.to_path_buf(),
            }
        }
        image::ImageError::Limits(_) => CodecError::OutOfMemory {
            path: path.to_path_buf(),
        },
        _ => CodecError::CorruptData {
            path: path.to_path_buf(),
            source,
        },
    }
}

pub fn thumbnail_cache_path(source: &Path, cache_dir: &Path) -> PathBuf {
    cache_dir.join(format!("{}.png", hash_path(source)))
}

fn hash_path(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let result = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in &result[..16] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(image)
            .save_with_format(&path, image::ImageFormat::Png)
            .expect("test fixture should encode");
        path
    }

    #[test]
    fn unsupported_extension_is_rejected_before_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path).unwrap().write_all(b"hi").unwrap();
        let err = decode(&path, None, DecodeMode::Full).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedFormat { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let path = PathBuf::from("/nonexistent/path/to/image.png");
        let err = decode(&path, None, DecodeMode::Full).unwrap_err();
        assert!(matches!(err, CodecError::NotFound { .. }));
    }

    #[test]
    fn thumbnail_mode_never_upscales_a_small_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "tiny.png", 1, 1);
        let buffer = decode(&path, Some((100, 100)), DecodeMode::Thumbnail).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (1, 1));
    }

    #[test]
    fn thumbnail_mode_fits_within_the_tighter_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "wide.png", 4000, 2000);
        let buffer = decode(&path, Some((400, 400)), DecodeMode::Thumbnail).unwrap();
        assert!(buffer.width() <= 400 && buffer.height() <= 400);
        // Aspect ratio roughly preserved (2:1 source).
        assert!(buffer.width() >= buffer.height());
    }

    #[test]
    fn full_mode_ignores_target_box() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "native.png", 300, 200);
        let buffer = decode(&path, Some((50, 50)), DecodeMode::Full).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (300, 200));
    }

    #[test]
    fn stride_is_width_times_three() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "stride.png", 10, 5);
        let buffer = decode(&path, None, DecodeMode::Full).unwrap();
        assert_eq!(buffer.stride(), 30);
        assert_eq!(buffer.bytes().len(), 30 * 5);
    }

    #[test]
    fn hash_path_is_deterministic() {
        let path = PathBuf::from("/some/folder/image.png");
        assert_eq!(hash_path(&path), hash_path(&path));
    }
}
