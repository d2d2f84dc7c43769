/// Binary pyramid file format with lazy per-tile decoding
///
/// File layout:
///  * 4 bytes file tag: 70 79 72 ("pyr") + version byte (currently 01)
///  * 4 bytes tile count (little-endian i32)
///  * N times 16 bytes tile header:
///    * 4 bytes width (i32)
///    * 4 bytes height (i32)
///    * 4 bytes payload offset (i32)
///    * 4 bytes payload length (i32)
///  * concatenated JPEG tile payloads
///
/// Opening a pyramid reads and validates only the header; tile payloads are
/// decoded on first use and cached per tile.

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

/// File tag: "pyr" + version 01. A mismatch means "not a pyramid file",
/// which callers treat as absent and regenerate.
pub const PYRAMID_MAGIC: [u8; 4] = [0x70, 0x79, 0x72, 0x01];

/// JPEG quality used for all tile payloads.
const TILE_QUALITY: u8 = 80;

/// One resolution level of a pyramid.
pub struct Tile {
    width: u32,
    height: u32,
    offset: u32,
    length: u32,
    image: OnceLock<Arc<DynamicImage>>,
}

impl Tile {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("decoded", &self.image.get().is_some())
            .finish()
    }
}

/// A multi-resolution pyramid, either opened from disk or freshly generated.
///
/// Once written, a pyramid file is read-only and an instance can be shared
/// between readers; the lazy decode path serializes only around the decode
/// of a single tile.
pub struct PyramidFile {
    path: Option<PathBuf>,
    tiles: Vec<Tile>,
    decode_lock: Mutex<()>,
}

impl PyramidFile {
    /// Open a pyramid file, reading and validating the header only.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(Error::io)?;

        let mut magic = [0u8; 4];
        read_header_bytes(&mut file, &mut magic)?;
        if magic != PYRAMID_MAGIC {
            return Err(Error::Format(format!(
                "bad file tag {:02x?} in {}",
                magic,
                path.display()
            )));
        }

        let mut count_buf = [0u8; 4];
        read_header_bytes(&mut file, &mut count_buf)?;
        let count = i32::from_le_bytes(count_buf);
        if count < 0 {
            return Err(Error::Format(format!("negative tile count {}", count)));
        }

        let mut tiles = Vec::with_capacity(count as usize);
        let mut header = vec![0u8; count as usize * 16];
        read_header_bytes(&mut file, &mut header)?;
        for i in 0..count as usize {
            let field = |n: usize| {
                let at = i * 16 + n * 4;
                i32::from_le_bytes(header[at..at + 4].try_into().unwrap())
            };
            let (width, height, offset, length) = (field(0), field(1), field(2), field(3));
            if width <= 0 || height <= 0 || offset < 0 || length < 0 {
                return Err(Error::Format(format!(
                    "tile {} has invalid header ({}x{} @ {}+{})",
                    i, width, height, offset, length
                )));
            }
            tiles.push(Tile {
                width: width as u32,
                height: height as u32,
                offset: offset as u32,
                length: length as u32,
                image: OnceLock::new(),
            });
        }

        // Tiles are written smallest-to-largest, but a foreign writer might
        // not honor that. The lookup scan depends on the order, so sort.
        tiles.sort_by_key(|t| (t.width as u64) * (t.height as u64));

        Ok(PyramidFile {
            path: Some(path.to_path_buf()),
            tiles,
            decode_lock: Mutex::new(()),
        })
    }

    /// Build a pyramid from already-decoded images, smallest first.
    /// Used by the generator; `write_to` persists it.
    pub fn from_images(images: Vec<DynamicImage>) -> Self {
        let tiles = images
            .into_iter()
            .map(|img| {
                let tile = Tile {
                    width: img.width(),
                    height: img.height(),
                    offset: 0,
                    length: 0,
                    image: OnceLock::new(),
                };
                let _ = tile.image.set(Arc::new(img));
                tile
            })
            .collect();
        PyramidFile {
            path: None,
            tiles,
            decode_lock: Mutex::new(()),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Find the best matching tile: the first (smallest) tile strictly
    /// larger than the requested box in both dimensions, so it can be shown
    /// at the requested size without upscaling. Falls back to the largest
    /// tile when nothing covers the box.
    pub fn find_best(&self, width: u32, height: u32) -> Result<&Tile> {
        let mut best = None;
        for tile in &self.tiles {
            best = Some(tile);
            if tile.width > width && tile.height > height {
                break;
            }
        }
        best.ok_or(Error::EmptyPyramid)
    }

    /// True iff a tile of `have` dimensions is exactly what `find_best`
    /// would pick for the desired box. Used to decide whether an
    /// already-fetched thumbnail is still optimal after a resize.
    pub fn is_best_size(
        &self,
        have_width: u32,
        have_height: u32,
        desired_width: u32,
        desired_height: u32,
    ) -> Result<bool> {
        let tile = self.find_best(desired_width, desired_height)?;
        Ok(tile.width == have_width && tile.height == have_height)
    }

    /// Decode one tile, reading its payload from the backing file on first
    /// call. Repeat calls return the cached image.
    pub fn decode(&self, tile: &Tile) -> Result<Arc<DynamicImage>> {
        if let Some(image) = tile.image.get() {
            return Ok(Arc::clone(image));
        }

        // The lock scopes the decode, not the whole read path: two threads
        // can hold decoded tiles of the same pyramid, they just never decode
        // the same tile twice.
        let _guard = self.decode_lock.lock();
        if let Some(image) = tile.image.get() {
            return Ok(Arc::clone(image));
        }

        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Io("pyramid has no backing file".into()))?;
        let mut file = File::open(path).map_err(Error::io)?;
        file.seek(SeekFrom::Start(tile.offset as u64))
            .map_err(Error::io)?;
        let mut payload = vec![0u8; tile.length as usize];
        file.read_exact(&mut payload).map_err(Error::io)?;

        let image = image::load_from_memory(&payload)
            .map_err(|e| Error::Format(format!("undecodable tile payload: {}", e)))?;
        let image = Arc::new(image);
        let _ = tile.image.set(Arc::clone(&image));
        Ok(image)
    }

    /// Serialize header plus all tile payloads. In-memory tiles are encoded
    /// to JPEG; tiles opened from disk are copied through byte-for-byte.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let payloads: Vec<Vec<u8>> = self
            .tiles
            .iter()
            .map(|tile| self.tile_payload(tile))
            .collect::<Result<_>>()?;

        let mut header = Vec::with_capacity(8 + self.tiles.len() * 16);
        header.extend_from_slice(&PYRAMID_MAGIC);
        header.extend_from_slice(&(self.tiles.len() as i32).to_le_bytes());

        let mut data_offset = (8 + self.tiles.len() * 16) as i32;
        for (tile, payload) in self.tiles.iter().zip(&payloads) {
            header.extend_from_slice(&(tile.width as i32).to_le_bytes());
            header.extend_from_slice(&(tile.height as i32).to_le_bytes());
            header.extend_from_slice(&data_offset.to_le_bytes());
            header.extend_from_slice(&(payload.len() as i32).to_le_bytes());
            data_offset += payload.len() as i32;
        }

        let mut file = File::create(path).map_err(Error::persistence)?;
        file.write_all(&header).map_err(Error::persistence)?;
        for payload in &payloads {
            file.write_all(payload).map_err(Error::persistence)?;
        }
        Ok(())
    }

    fn tile_payload(&self, tile: &Tile) -> Result<Vec<u8>> {
        if let Some(image) = tile.image.get() {
            let mut buf = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, TILE_QUALITY);
            encoder
                .encode_image(&image.to_rgb8())
                .map_err(|e| Error::Persistence(format!("tile encode failed: {}", e)))?;
            return Ok(buf);
        }

        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Io("pyramid has no backing file".into()))?;
        let mut file = File::open(path).map_err(Error::io)?;
        file.seek(SeekFrom::Start(tile.offset as u64))
            .map_err(Error::io)?;
        let mut payload = vec![0u8; tile.length as usize];
        file.read_exact(&mut payload).map_err(Error::io)?;
        Ok(payload)
    }
}

impl std::fmt::Debug for PyramidFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidFile")
            .field("path", &self.path)
            .field("tiles", &self.tiles)
            .finish()
    }
}

// Short reads while parsing the header mean the file is foreign or
// truncated, not that the device failed.
fn read_header_bytes(file: &mut File, buf: &mut [u8]) -> Result<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Format("truncated header".into())
        } else {
            Error::io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    fn ladder() -> PyramidFile {
        PyramidFile::from_images(vec![
            solid(50, 38, [255, 0, 0]),
            solid(100, 75, [0, 255, 0]),
            solid(200, 150, [0, 0, 255]),
            solid(400, 300, [255, 255, 0]),
        ])
    }

    #[test]
    fn find_best_picks_smallest_covering_tile() {
        let pyramid = ladder();
        assert_eq!(pyramid.find_best(80, 60).unwrap().dimensions(), (100, 75));
        assert_eq!(pyramid.find_best(10, 10).unwrap().dimensions(), (50, 38));
        // Exact match is not "strictly larger": the next level up wins.
        assert_eq!(
            pyramid.find_best(100, 75).unwrap().dimensions(),
            (200, 150)
        );
    }

    #[test]
    fn find_best_falls_back_to_largest() {
        let pyramid = ladder();
        assert_eq!(
            pyramid.find_best(1000, 1000).unwrap().dimensions(),
            (400, 300)
        );
    }

    #[test]
    fn find_best_on_empty_pyramid_fails() {
        let pyramid = PyramidFile::from_images(vec![]);
        assert_eq!(pyramid.find_best(10, 10).unwrap_err(), Error::EmptyPyramid);
    }

    #[test]
    fn is_best_size_matches_find_best() {
        let pyramid = ladder();
        assert!(pyramid.is_best_size(100, 75, 80, 60).unwrap());
        assert!(!pyramid.is_best_size(50, 38, 80, 60).unwrap());
        assert!(!pyramid.is_best_size(200, 150, 80, 60).unwrap());
    }

    #[test]
    fn round_trip_preserves_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ladder.pyr");

        ladder().write_to(&path).unwrap();
        let reopened = PyramidFile::open(&path).unwrap();

        assert_eq!(reopened.tile_count(), 4);
        let dims: Vec<(u32, u32)> =
            reopened.tiles().iter().map(|t| t.dimensions()).collect();
        assert_eq!(dims, vec![(50, 38), (100, 75), (200, 150), (400, 300)]);

        // Lossy codec tolerance: solid colors survive JPEG within a few
        // levels per channel.
        let tile = reopened.find_best(80, 60).unwrap();
        let image = reopened.decode(tile).unwrap();
        let pixel = image.to_rgb8().get_pixel(50, 37).0;
        assert!(pixel[0] < 32 && pixel[1] > 224 && pixel[2] < 32, "{:?}", pixel);
    }

    #[test]
    fn decode_is_cached_per_tile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ladder.pyr");
        ladder().write_to(&path).unwrap();

        let reopened = PyramidFile::open(&path).unwrap();
        let tile = reopened.find_best(80, 60).unwrap();
        let first = reopened.decode(tile).unwrap();
        let second = reopened.decode(tile).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn foreign_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-pyramid.pyr");
        std::fs::write(&path, b"JFIF definitely not a pyramid").unwrap();

        match PyramidFile::open(&path) {
            Err(Error::Format(_)) => {}
            other => panic!("expected format error, got {:?}", other),
        }
    }

    #[test]
    fn truncated_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pyr");
        let mut bytes = PYRAMID_MAGIC.to_vec();
        bytes.extend_from_slice(&5i32.to_le_bytes());
        // Promises five tiles, delivers none.
        std::fs::write(&path, &bytes).unwrap();

        match PyramidFile::open(&path) {
            Err(Error::Format(_)) => {}
            other => panic!("expected format error, got {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        match PyramidFile::open(Path::new("/nonexistent/x.pyr")) {
            Err(Error::Io(_)) => {}
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn tiles_are_sorted_defensively_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shuffled.pyr");
        // Largest first: a writer that ignores the convention.
        PyramidFile::from_images(vec![
            solid(200, 150, [0, 0, 255]),
            solid(50, 38, [255, 0, 0]),
            solid(100, 75, [0, 255, 0]),
        ])
        .write_to(&path)
        .unwrap();

        let reopened = PyramidFile::open(&path).unwrap();
        let dims: Vec<(u32, u32)> =
            reopened.tiles().iter().map(|t| t.dimensions()).collect();
        assert_eq!(dims, vec![(50, 38), (100, 75), (200, 150)]);
    }
}
