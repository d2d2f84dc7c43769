/// Pyramid generation from full-resolution source images
///
/// Every photo's pyramid lives at a deterministic cache path derived from a
/// content hash of its canonical locator, so regeneration is idempotent and
/// two processes land on the same file.

use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::pyramid::file::PyramidFile;
use crate::sources::Photo;

/// Longest edge of the largest tile. Anything bigger is scaled down once
/// before the halving ladder starts.
const SCALE_CEILING: u32 = 1600;

/// Halving stops once the longest edge is at or below this.
const MIN_LONG_EDGE: u32 = 64;

pub struct PyramidGenerator;

impl PyramidGenerator {
    /// Default pyramid cache directory, `~/.cache/photo-cache/pyramids` on
    /// Linux.
    pub fn default_cache_dir() -> PathBuf {
        let mut path = dirs_next::cache_dir()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        path.push("photo-cache");
        path.push("pyramids");
        path
    }

    /// Deterministic cache locator for a photo's pyramid.
    pub fn pyramid_path(cache_dir: &Path, uri: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(uri.as_bytes()));
        cache_dir.join(format!("{}.pyr", hash))
    }

    /// Open the cached pyramid for a photo, generating it first if the file
    /// is missing, foreign, or unreadable.
    pub fn load_or_generate(photo: &dyn Photo, cache_dir: &Path) -> Result<PyramidFile> {
        let path = Self::pyramid_path(cache_dir, photo.uri());

        match PyramidFile::open(&path) {
            Ok(pyramid) => return Ok(pyramid),
            Err(err) => {
                tracing::debug!(uri = %photo.uri(), %err, "pyramid not usable, generating");
            }
        }

        Self::generate(photo, cache_dir)
    }

    /// Build and persist the pyramid for a photo, returning it freshly
    /// opened from disk.
    pub fn generate(photo: &dyn Photo, cache_dir: &Path) -> Result<PyramidFile> {
        let path = Self::pyramid_path(cache_dir, photo.uri());
        tracing::debug!(uri = %photo.uri(), pyramid = %path.display(), "generating pyramid");

        let bytes = photo.read_image_bytes()?;
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let mut decoder = reader
            .into_decoder()
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let orientation = decoder
            .orientation()
            .unwrap_or(Orientation::NoTransforms);
        let mut image = DynamicImage::from_decoder(decoder)
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        image.apply_orientation(orientation);

        let longest = image.width().max(image.height());
        if longest > SCALE_CEILING {
            let scale = longest as f64 / SCALE_CEILING as f64;
            let width = (image.width() as f64 / scale).round() as u32;
            let height = (image.height() as f64 / scale).round() as u32;
            image = image.resize_exact(width, height, FilterType::Triangle);
        }

        // Halve until the long edge fits in MIN_LONG_EDGE, collecting every
        // level. Built largest-to-smallest, stored smallest-first.
        let mut levels = Vec::with_capacity(7);
        let mut current = image;
        loop {
            let next = if current.width().max(current.height()) > MIN_LONG_EDGE {
                Some(current.resize_exact(
                    current.width().div_ceil(2),
                    current.height().div_ceil(2),
                    FilterType::Triangle,
                ))
            } else {
                None
            };
            levels.push(current);
            match next {
                Some(halved) => current = halved,
                None => break,
            }
        }
        levels.reverse();

        std::fs::create_dir_all(cache_dir).map_err(Error::persistence)?;
        let pyramid = PyramidFile::from_images(levels);
        pyramid.write_to(&path)?;

        PyramidFile::open(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PhotoMetadata;
    use chrono::{DateTime, Utc};
    use image::{Rgb, RgbImage};

    struct FixturePhoto {
        uri: String,
        bytes: Result<Vec<u8>>,
        meta: PhotoMetadata,
    }

    impl FixturePhoto {
        fn solid(uri: &str, width: u32, height: u32) -> Self {
            let image =
                DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 40])));
            let mut bytes = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .unwrap();
            FixturePhoto {
                uri: uri.to_string(),
                bytes: Ok(bytes),
                meta: PhotoMetadata::default(),
            }
        }

        fn unreachable(uri: &str) -> Self {
            FixturePhoto {
                uri: uri.to_string(),
                bytes: Err(Error::SourceUnavailable("offline".into())),
                meta: PhotoMetadata::default(),
            }
        }
    }

    impl Photo for FixturePhoto {
        fn uri(&self) -> &str {
            &self.uri
        }

        fn source_id(&self) -> i64 {
            0
        }

        fn image_stamp(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn metadata(&self) -> &PhotoMetadata {
            &self.meta
        }

        fn read_image_bytes(&self) -> Result<Vec<u8>> {
            self.bytes.clone()
        }
    }

    #[test]
    fn locator_is_deterministic_and_collision_free() {
        let dir = Path::new("/cache");
        let a = PyramidGenerator::pyramid_path(dir, "file:///a.jpg");
        let b = PyramidGenerator::pyramid_path(dir, "file:///b.jpg");
        assert_eq!(a, PyramidGenerator::pyramid_path(dir, "file:///a.jpg"));
        assert_ne!(a, b);
        assert!(a.extension().is_some_and(|e| e == "pyr"));
    }

    #[test]
    fn halving_ladder_for_a_3200x2400_source() {
        let dir = tempfile::tempdir().unwrap();
        let photo = FixturePhoto::solid("file:///big.png", 3200, 2400);

        let pyramid = PyramidGenerator::generate(&photo, dir.path()).unwrap();
        let dims: Vec<(u32, u32)> =
            pyramid.tiles().iter().map(|t| t.dimensions()).collect();
        assert_eq!(
            dims,
            vec![
                (50, 38),
                (100, 75),
                (200, 150),
                (400, 300),
                (800, 600),
                (1600, 1200),
            ]
        );
    }

    #[test]
    fn small_source_yields_a_single_tile() {
        let dir = tempfile::tempdir().unwrap();
        let photo = FixturePhoto::solid("file:///tiny.png", 48, 32);

        let pyramid = PyramidGenerator::generate(&photo, dir.path()).unwrap();
        let dims: Vec<(u32, u32)> =
            pyramid.tiles().iter().map(|t| t.dimensions()).collect();
        assert_eq!(dims, vec![(48, 32)]);
    }

    #[test]
    fn load_or_generate_reuses_an_existing_pyramid() {
        let dir = tempfile::tempdir().unwrap();
        let photo = FixturePhoto::solid("file:///reuse.png", 320, 240);

        PyramidGenerator::generate(&photo, dir.path()).unwrap();
        let path = PyramidGenerator::pyramid_path(dir.path(), photo.uri());
        let written = std::fs::metadata(&path).unwrap().modified().unwrap();

        let again = PyramidGenerator::load_or_generate(&photo, dir.path()).unwrap();
        assert_eq!(again.tile_count(), 4);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            written
        );
    }

    #[test]
    fn corrupt_cache_file_triggers_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let photo = FixturePhoto::solid("file:///corrupt.png", 320, 240);
        let path = PyramidGenerator::pyramid_path(dir.path(), photo.uri());
        std::fs::write(&path, b"garbage").unwrap();

        let pyramid = PyramidGenerator::load_or_generate(&photo, dir.path()).unwrap();
        assert_eq!(pyramid.tile_count(), 4);
    }

    #[test]
    fn unreachable_photo_surfaces_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let photo = FixturePhoto::unreachable("file:///gone.png");

        match PyramidGenerator::generate(&photo, dir.path()) {
            Err(Error::SourceUnavailable(_)) => {}
            other => panic!("expected source unavailable, got {:?}", other),
        }
    }
}
