/// Persisted catalog records
///
/// `PhotoSourceRecord` and `CachedPhotoRecord` are the durable projections
/// of sources and photos: what survives a restart and what availability
/// queries can filter on without waking any source.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sources::{uri_to_path, Photo, PhotoMetadata};
use crate::store::Record;

/// Durable descriptor of a registered photo source.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoSourceRecord {
    /// Primary key, assigned on first save. Permanent once assigned.
    pub cache_id: i64,
    /// Discriminator used to rebuild the concrete source implementation.
    pub source_kind: String,
    /// Denormalized availability flag for fast filtering. May be stale
    /// between restarts; reconciled when the source starts.
    pub available: bool,
}

impl Record for PhotoSourceRecord {
    const TABLE: &'static str = "photo_sources";
    const CREATE_SQL: &'static str = "CREATE TABLE IF NOT EXISTS photo_sources (
        cache_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        source_kind TEXT NOT NULL,
        available   INTEGER NOT NULL
    )";
    const COLUMNS: &'static [&'static str] = &["source_kind", "available"];

    fn id(&self) -> i64 {
        self.cache_id
    }

    fn set_id(&mut self, id: i64) {
        self.cache_id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.source_kind.clone()),
            Value::Integer(self.available as i64),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(PhotoSourceRecord {
            cache_id: row.get(0)?,
            source_kind: row.get(1)?,
            available: row.get::<_, i64>(2)? != 0,
        })
    }
}

/// Persisted projection of a photo: identity plus denormalized metadata.
/// Created when a source registers a newly discovered photo; never mutated
/// or deleted by this crate afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPhotoRecord {
    pub cache_id: i64,
    /// Owning source's cache id.
    pub source_id: i64,
    pub uri: String,
    /// Unix seconds of the underlying image data.
    pub image_stamp: i64,
    pub comment: Option<String>,
    pub date_taken: Option<i64>,
    pub orientation: i64,
    pub rating: Option<i64>,
    pub exposure_time: Option<f64>,
    pub f_number: Option<f64>,
    pub focal_length: Option<f64>,
    pub focal_length_35mm: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

impl CachedPhotoRecord {
    /// Denormalize a photo into its persisted form.
    pub fn from_photo(photo: &dyn Photo, source_id: i64) -> Self {
        let meta = photo.metadata();
        CachedPhotoRecord {
            cache_id: 0,
            source_id,
            uri: photo.uri().to_string(),
            image_stamp: photo.image_stamp().timestamp(),
            comment: meta.comment.clone(),
            date_taken: meta.date_taken.map(|d| d.timestamp()),
            orientation: meta.orientation as i64,
            rating: meta.rating.map(|r| r as i64),
            exposure_time: meta.exposure_time,
            f_number: meta.f_number,
            focal_length: meta.focal_length,
            focal_length_35mm: meta.focal_length_35mm,
            camera_make: meta.camera_make.clone(),
            camera_model: meta.camera_model.clone(),
            width: meta.width.map(|w| w as i64),
            height: meta.height.map(|h| h as i64),
        }
    }
}

fn opt_text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

fn opt_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

fn opt_real(value: Option<f64>) -> Value {
    value.map(Value::Real).unwrap_or(Value::Null)
}

impl Record for CachedPhotoRecord {
    const TABLE: &'static str = "cached_photos";
    const CREATE_SQL: &'static str = "CREATE TABLE IF NOT EXISTS cached_photos (
        cache_id          INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id         INTEGER NOT NULL,
        uri               TEXT NOT NULL,
        image_stamp       INTEGER NOT NULL,
        comment           TEXT,
        date_taken        INTEGER,
        orientation       INTEGER NOT NULL,
        rating            INTEGER,
        exposure_time     REAL,
        f_number          REAL,
        focal_length      REAL,
        focal_length_35mm REAL,
        camera_make       TEXT,
        camera_model      TEXT,
        width             INTEGER,
        height            INTEGER
    )";
    const COLUMNS: &'static [&'static str] = &[
        "source_id",
        "uri",
        "image_stamp",
        "comment",
        "date_taken",
        "orientation",
        "rating",
        "exposure_time",
        "f_number",
        "focal_length",
        "focal_length_35mm",
        "camera_make",
        "camera_model",
        "width",
        "height",
    ];

    fn id(&self) -> i64 {
        self.cache_id
    }

    fn set_id(&mut self, id: i64) {
        self.cache_id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.source_id),
            Value::Text(self.uri.clone()),
            Value::Integer(self.image_stamp),
            opt_text(&self.comment),
            opt_int(self.date_taken),
            Value::Integer(self.orientation),
            opt_int(self.rating),
            opt_real(self.exposure_time),
            opt_real(self.f_number),
            opt_real(self.focal_length),
            opt_real(self.focal_length_35mm),
            opt_text(&self.camera_make),
            opt_text(&self.camera_model),
            opt_int(self.width),
            opt_int(self.height),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(CachedPhotoRecord {
            cache_id: row.get(0)?,
            source_id: row.get(1)?,
            uri: row.get(2)?,
            image_stamp: row.get(3)?,
            comment: row.get(4)?,
            date_taken: row.get(5)?,
            orientation: row.get(6)?,
            rating: row.get(7)?,
            exposure_time: row.get(8)?,
            f_number: row.get(9)?,
            focal_length: row.get(10)?,
            focal_length_35mm: row.get(11)?,
            camera_make: row.get(12)?,
            camera_model: row.get(13)?,
            width: row.get(14)?,
            height: row.get(15)?,
        })
    }
}

/// A record-backed [`Photo`]: the catalog view of a photo, usable for
/// thumbnailing without waking the owning source as long as the locator is
/// directly readable.
pub struct CachedPhoto {
    record: CachedPhotoRecord,
    meta: PhotoMetadata,
    path: Option<PathBuf>,
}

impl CachedPhoto {
    pub fn new(record: CachedPhotoRecord) -> Self {
        let meta = PhotoMetadata {
            comment: record.comment.clone(),
            date_taken: record
                .date_taken
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            orientation: record.orientation as u16,
            rating: record.rating.map(|r| r as u32),
            exposure_time: record.exposure_time,
            f_number: record.f_number,
            focal_length: record.focal_length,
            focal_length_35mm: record.focal_length_35mm,
            camera_make: record.camera_make.clone(),
            camera_model: record.camera_model.clone(),
            width: record.width.map(|w| w as u32),
            height: record.height.map(|h| h as u32),
        };
        let path = uri_to_path(&record.uri);
        CachedPhoto { record, meta, path }
    }

    pub fn cache_id(&self) -> i64 {
        self.record.cache_id
    }
}

impl Photo for CachedPhoto {
    fn uri(&self) -> &str {
        &self.record.uri
    }

    fn source_id(&self) -> i64 {
        self.record.source_id
    }

    fn image_stamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.record.image_stamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn metadata(&self) -> &PhotoMetadata {
        &self.meta
    }

    fn read_image_bytes(&self) -> Result<Vec<u8>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::SourceUnavailable(format!("{} is not local", self.record.uri)))?;
        std::fs::read(path).map_err(|e| Error::SourceUnavailable(e.to_string()))
    }
}

/// Convenience alias used by the registry's catalogue view.
pub fn cached_photo(record: CachedPhotoRecord) -> Arc<dyn Photo> {
    Arc::new(CachedPhoto::new(record))
}
