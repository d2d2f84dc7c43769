/// Photo source contracts
///
/// This module defines the seams between the cache core and pluggable photo
/// sources:
/// - The `Photo` and `CacheablePhotoSource` traits (this file)
/// - Persisted catalog records (records.rs)
/// - The durable source registry (registry.rs)
/// - The local folder source implementation (local.rs)

pub mod local;
pub mod records;
pub mod registry;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::{Error, Result};

pub use local::{LocalFilePhoto, LocalFolderPhotoSource};
pub use records::{CachedPhoto, CachedPhotoRecord, PhotoSourceRecord};
pub use registry::{RegistryEvent, SourceRegistry};

/// Attributes parsed from a photo's image data. Parsing happens at most once
/// per photo instance and is side-effect-free; any field the extractor can't
/// provide stays unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoMetadata {
    pub comment: Option<String>,
    pub date_taken: Option<DateTime<Utc>>,
    /// EXIF-style orientation value (1 = upright). Transform math belongs to
    /// the image library, not this crate.
    pub orientation: u16,
    pub rating: Option<u32>,
    pub exposure_time: Option<f64>,
    pub f_number: Option<f64>,
    pub focal_length: Option<f64>,
    pub focal_length_35mm: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A single photo, identified by its source-relative locator plus the cache
/// id of the source it came from.
pub trait Photo: Send + Sync {
    /// Canonical locator, e.g. `file:///home/me/pics/a.jpg`.
    fn uri(&self) -> &str;

    /// Cache id of the owning source (0 when not yet registered).
    fn source_id(&self) -> i64;

    /// Timestamp of the underlying image data.
    fn image_stamp(&self) -> DateTime<Utc>;

    /// Lazily parsed attributes, computed once and cached.
    fn metadata(&self) -> &PhotoMetadata;

    /// Full-resolution encoded image bytes. For a local source this is a
    /// file read; a network source would fetch here.
    fn read_image_bytes(&self) -> Result<Vec<u8>>;
}

/// Discriminator for the concrete source implementations this build knows
/// about. The string form is what gets persisted, so it must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    LocalFolder,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::LocalFolder => "local-folder",
        }
    }

    pub fn parse(value: &str) -> Option<SourceKind> {
        match value {
            "local-folder" => Some(SourceKind::LocalFolder),
            _ => None,
        }
    }
}

/// Pushed by a source when its availability may have changed. The registry
/// drains these, compares against the persisted flag, and re-raises real
/// changes to its own subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEvent {
    pub cache_id: i64,
}

/// A photo source that can be registered with the [`SourceRegistry`] and
/// revived across process restarts.
pub trait CacheablePhotoSource: Send + Sync {
    /// Which factory can rebuild this source.
    fn kind(&self) -> SourceKind;

    /// The id under which this source is cached (0 = unregistered).
    /// Assigned once by the registry; not managed manually.
    fn cache_id(&self) -> i64;
    fn set_cache_id(&self, id: i64);

    fn display_name(&self) -> String;

    /// Whether photos can currently be read from this source.
    fn available(&self) -> bool;

    /// Install the channel availability changes are pushed on.
    fn connect_availability(&self, tx: Sender<SourceEvent>);

    /// Called when the registry revives the source on startup: reload the
    /// parameters persisted under the cache id.
    fn wake_up(&self) -> Result<()>;

    /// Called once at registration: persist the parameters needed to revive
    /// this source later, keyed by the cache id.
    fn persist(&self) -> Result<()>;

    /// Start the source: sync with the registry, e.g. register photos that
    /// are not cached yet. Runs on a background worker.
    fn start(&self, registry: &Arc<SourceRegistry>) -> Result<()>;

    /// Callback from the registry: the given photo is now cached under
    /// `cache_id`. The source records its own locator mapping so it can find
    /// the photo again later.
    fn register_cached_photo(&self, photo: &Arc<dyn Photo>, cache_id: i64) -> Result<()>;

    /// Resolve a previously registered cache id back to a live photo.
    fn lookup_cached_photo(&self, cache_id: i64) -> Result<Arc<dyn Photo>>;

    /// Enumerate the source's photos. Finite and restartable: every call
    /// re-enumerates.
    fn photos(&self) -> Result<Box<dyn Iterator<Item = Arc<dyn Photo>> + '_>>;

    /// Optional configuration surface.
    fn set_option(&self, key: &str, _value: serde_json::Value) -> Result<()> {
        Err(Error::Io(format!("option {:?} not supported", key)))
    }

    fn get_option(&self, key: &str) -> Result<serde_json::Value> {
        Err(Error::Io(format!("option {:?} not supported", key)))
    }
}

/// Canonical `file://` locator for a local path.
pub fn path_to_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Local path for a `file://` locator, if it is one.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trips_through_discriminator() {
        let kind = SourceKind::LocalFolder;
        assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        assert_eq!(SourceKind::parse("flickr"), None);
    }

    #[test]
    fn uri_helpers_round_trip() {
        let path = Path::new("/photos/holiday/IMG_0001.jpg");
        let uri = path_to_uri(path);
        assert_eq!(uri, "file:///photos/holiday/IMG_0001.jpg");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
        assert_eq!(uri_to_path("https://example.com/a.jpg"), None);
    }
}
