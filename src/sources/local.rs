/// Local folder photo source
///
/// Enumerates image files under a root directory with walkdir, persists its
/// root and its uri-to-cache-id mapping through the record store, and
/// re-registers anything new on every start.

use chrono::{DateTime, TimeZone, Utc};
use image::{ImageDecoder, ImageReader};
use parking_lot::Mutex;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::sources::registry::{SourceFactory, SourceRegistry};
use crate::sources::{
    path_to_uri, CacheablePhotoSource, Photo, PhotoMetadata, SourceEvent, SourceKind,
};
use crate::store::{Record, SqliteStore};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "tif", "tiff", "bmp", "webp"];

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
}

// Persisted parameters of one folder source, keyed by the source's cache id.
#[derive(Debug, Clone, PartialEq)]
struct FolderParamsRecord {
    cache_id: i64,
    source_id: i64,
    root: String,
}

impl Record for FolderParamsRecord {
    const TABLE: &'static str = "local_folder_params";
    const CREATE_SQL: &'static str = "CREATE TABLE IF NOT EXISTS local_folder_params (
        cache_id  INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL UNIQUE,
        root      TEXT NOT NULL
    )";
    const COLUMNS: &'static [&'static str] = &["source_id", "root"];

    fn id(&self) -> i64 {
        self.cache_id
    }

    fn set_id(&mut self, id: i64) {
        self.cache_id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.source_id),
            Value::Text(self.root.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(FolderParamsRecord {
            cache_id: row.get(0)?,
            source_id: row.get(1)?,
            root: row.get(2)?,
        })
    }
}

// The source's own locator mapping: which uri ended up under which photo
// cache id.
#[derive(Debug, Clone, PartialEq)]
struct FolderUriRecord {
    cache_id: i64,
    source_id: i64,
    photo_id: i64,
    uri: String,
}

impl Record for FolderUriRecord {
    const TABLE: &'static str = "local_folder_uris";
    const CREATE_SQL: &'static str = "CREATE TABLE IF NOT EXISTS local_folder_uris (
        cache_id  INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL,
        photo_id  INTEGER NOT NULL,
        uri       TEXT NOT NULL
    )";
    const COLUMNS: &'static [&'static str] = &["source_id", "photo_id", "uri"];

    fn id(&self) -> i64 {
        self.cache_id
    }

    fn set_id(&mut self, id: i64) {
        self.cache_id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.source_id),
            Value::Integer(self.photo_id),
            Value::Text(self.uri.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(FolderUriRecord {
            cache_id: row.get(0)?,
            source_id: row.get(1)?,
            photo_id: row.get(2)?,
            uri: row.get(3)?,
        })
    }
}

/// A photo backed by a file on the local filesystem. Metadata is extracted
/// from the file header at most once, on first access.
pub struct LocalFilePhoto {
    path: PathBuf,
    uri: String,
    source_id: i64,
    meta: OnceLock<PhotoMetadata>,
    stamp: OnceLock<DateTime<Utc>>,
}

impl LocalFilePhoto {
    pub fn new(path: PathBuf, source_id: i64) -> Self {
        let uri = path_to_uri(&path);
        LocalFilePhoto {
            path,
            uri,
            source_id,
            meta: OnceLock::new(),
            stamp: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Header-only read: dimensions and orientation without decoding pixels.
    fn extract_metadata(&self) -> PhotoMetadata {
        let mut meta = PhotoMetadata {
            orientation: 1,
            ..PhotoMetadata::default()
        };
        let decoder = ImageReader::open(&self.path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| e.to_string())
            .and_then(|r| r.into_decoder().map_err(|e| e.to_string()));
        match decoder {
            Ok(mut decoder) => {
                let (width, height) = decoder.dimensions();
                meta.width = Some(width);
                meta.height = Some(height);
                if let Ok(orientation) = decoder.orientation() {
                    meta.orientation = exif_value(orientation);
                }
            }
            Err(err) => {
                tracing::debug!(uri = %self.uri, %err, "metadata extraction failed");
            }
        }
        meta
    }
}

fn exif_value(orientation: image::metadata::Orientation) -> u16 {
    use image::metadata::Orientation;
    match orientation {
        Orientation::NoTransforms => 1,
        Orientation::FlipHorizontal => 2,
        Orientation::Rotate180 => 3,
        Orientation::FlipVertical => 4,
        Orientation::Rotate90FlipH => 5,
        Orientation::Rotate90 => 6,
        Orientation::Rotate270FlipH => 7,
        Orientation::Rotate270 => 8,
    }
}

impl Photo for LocalFilePhoto {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn source_id(&self) -> i64 {
        self.source_id
    }

    fn image_stamp(&self) -> DateTime<Utc> {
        *self.stamp.get_or_init(|| {
            std::fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| {
                    mtime
                        .duration_since(std::time::UNIX_EPOCH)
                        .ok()
                        .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single())
                })
                .unwrap_or_else(Utc::now)
        })
    }

    fn metadata(&self) -> &PhotoMetadata {
        self.meta.get_or_init(|| self.extract_metadata())
    }

    fn read_image_bytes(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path)
            .map_err(|e| Error::SourceUnavailable(format!("{}: {}", self.path.display(), e)))
    }
}

/// A source serving every image file under one root directory.
pub struct LocalFolderPhotoSource {
    store: Arc<SqliteStore>,
    cache_id: AtomicI64,
    root: Mutex<Option<PathBuf>>,
    // uri -> photo cache id, loaded on wake_up and grown on registration
    registered: Mutex<HashMap<String, i64>>,
    availability_tx: Mutex<Option<Sender<SourceEvent>>>,
}

impl LocalFolderPhotoSource {
    pub fn new(store: Arc<SqliteStore>, root: PathBuf) -> Arc<Self> {
        Arc::new(LocalFolderPhotoSource {
            store,
            cache_id: AtomicI64::new(0),
            root: Mutex::new(Some(root)),
            registered: Mutex::new(HashMap::new()),
            availability_tx: Mutex::new(None),
        })
    }

    /// Empty shell for the registry to revive via [`wake_up`]; the root comes
    /// back from the persisted parameters.
    ///
    /// [`wake_up`]: CacheablePhotoSource::wake_up
    pub fn revive(store: Arc<SqliteStore>) -> Arc<Self> {
        Arc::new(LocalFolderPhotoSource {
            store,
            cache_id: AtomicI64::new(0),
            root: Mutex::new(None),
            registered: Mutex::new(HashMap::new()),
            availability_tx: Mutex::new(None),
        })
    }

    /// Factory for [`SourceRegistry::register_factory`].
    pub fn factory(store: Arc<SqliteStore>) -> SourceFactory {
        Box::new(move || Self::revive(Arc::clone(&store)) as Arc<dyn CacheablePhotoSource>)
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.root.lock().clone()
    }

    fn notify_availability(&self) {
        if let Some(tx) = self.availability_tx.lock().as_ref() {
            let _ = tx.send(SourceEvent {
                cache_id: self.cache_id(),
            });
        }
    }
}

impl CacheablePhotoSource for LocalFolderPhotoSource {
    fn kind(&self) -> SourceKind {
        SourceKind::LocalFolder
    }

    fn cache_id(&self) -> i64 {
        self.cache_id.load(Ordering::SeqCst)
    }

    fn set_cache_id(&self, id: i64) {
        self.cache_id.store(id, Ordering::SeqCst);
    }

    fn display_name(&self) -> String {
        match self.root.lock().as_ref() {
            Some(root) => format!("Folder {}", root.display()),
            None => "Folder (not configured)".to_string(),
        }
    }

    fn available(&self) -> bool {
        self.root
            .lock()
            .as_ref()
            .is_some_and(|root| root.is_dir())
    }

    fn connect_availability(&self, tx: Sender<SourceEvent>) {
        *self.availability_tx.lock() = Some(tx);
    }

    fn wake_up(&self) -> Result<()> {
        self.store.prepare::<FolderParamsRecord>()?;
        self.store.prepare::<FolderUriRecord>()?;

        let source_id = self.cache_id();
        let params: Option<FolderParamsRecord> = self
            .store
            .fetch_first_matching("source_id = ?1", &[&source_id])?;
        let params = params.ok_or_else(|| {
            Error::Persistence(format!("no folder parameters for source {}", source_id))
        })?;
        *self.root.lock() = Some(PathBuf::from(params.root));

        let mut registered = self.registered.lock();
        let uris: Vec<FolderUriRecord> = self.store.fetch_all()?;
        for record in uris {
            if record.source_id == source_id {
                registered.insert(record.uri, record.photo_id);
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.store.prepare::<FolderParamsRecord>()?;
        self.store.prepare::<FolderUriRecord>()?;

        let source_id = self.cache_id();
        let root = self
            .root
            .lock()
            .as_ref()
            .map(|r| r.display().to_string())
            .unwrap_or_default();

        let existing: Option<FolderParamsRecord> = self
            .store
            .fetch_first_matching("source_id = ?1", &[&source_id])?;
        let mut record = match existing {
            Some(mut record) => {
                record.root = root;
                record
            }
            None => FolderParamsRecord {
                cache_id: 0,
                source_id,
                root,
            },
        };
        self.store.save(&mut record, false)
    }

    /// Rescan: register every photo under the root that has no cache id yet.
    /// Throttled so a large first import does not starve the store.
    fn start(&self, registry: &Arc<SourceRegistry>) -> Result<()> {
        if !self.available() {
            self.notify_availability();
            return Ok(());
        }

        let mut fresh = 0usize;
        for photo in self.photos()? {
            if self.registered.lock().contains_key(photo.uri()) {
                continue;
            }
            registry.register_photo(self, &photo)?;
            fresh += 1;
            std::thread::sleep(Duration::from_millis(1));
        }

        tracing::info!(
            source = self.cache_id(),
            fresh,
            "local folder scan finished"
        );
        self.notify_availability();
        Ok(())
    }

    fn register_cached_photo(&self, photo: &Arc<dyn Photo>, cache_id: i64) -> Result<()> {
        let mut record = FolderUriRecord {
            cache_id: 0,
            source_id: self.cache_id(),
            photo_id: cache_id,
            uri: photo.uri().to_string(),
        };
        self.store.save(&mut record, false)?;
        self.registered
            .lock()
            .insert(photo.uri().to_string(), cache_id);
        Ok(())
    }

    fn lookup_cached_photo(&self, cache_id: i64) -> Result<Arc<dyn Photo>> {
        let source_id = self.cache_id();
        let record: Option<FolderUriRecord> = self.store.fetch_first_matching(
            "source_id = ?1 AND photo_id = ?2",
            &[&source_id, &cache_id],
        )?;
        let record = record
            .ok_or_else(|| Error::SourceUnavailable(format!("photo {} is not cached", cache_id)))?;
        let path = crate::sources::uri_to_path(&record.uri)
            .ok_or_else(|| Error::SourceUnavailable(record.uri.clone()))?;
        Ok(Arc::new(LocalFilePhoto::new(path, source_id)))
    }

    fn photos(&self) -> Result<Box<dyn Iterator<Item = Arc<dyn Photo>> + '_>> {
        let root = self
            .root
            .lock()
            .clone()
            .ok_or_else(|| Error::SourceUnavailable("folder source has no root".into()))?;
        let source_id = self.cache_id();

        let iter = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_image_path(entry.path()))
            .map(move |entry| {
                Arc::new(LocalFilePhoto::new(entry.into_path(), source_id)) as Arc<dyn Photo>
            });
        Ok(Box::new(iter))
    }

    fn set_option(&self, key: &str, value: serde_json::Value) -> Result<()> {
        match key {
            "root" => {
                let root = value
                    .as_str()
                    .ok_or_else(|| Error::Io("root must be a string".into()))?;
                *self.root.lock() = Some(PathBuf::from(root));
                if self.cache_id() != 0 {
                    self.persist()?;
                }
                self.notify_availability();
                Ok(())
            }
            _ => Err(Error::Io(format!("option {:?} not supported", key))),
        }
    }

    fn get_option(&self, key: &str) -> Result<serde_json::Value> {
        match key {
            "root" => Ok(self
                .root
                .lock()
                .as_ref()
                .map(|r| serde_json::Value::String(r.display().to_string()))
                .unwrap_or(serde_json::Value::Null)),
            _ => Err(Error::Io(format!("option {:?} not supported", key))),
        }
    }
}
