//! Photo source cache and multi-resolution preview pipeline.
//!
//! The crate has three layers:
//! - `sources`: pluggable photo sources, persisted through a generic record
//!   store so they survive restarts ([`sources::SourceRegistry`]).
//! - `pyramid`: per-photo multi-resolution image files, generated once and
//!   decoded lazily tile by tile ([`pyramid::PyramidGenerator`],
//!   [`pyramid::PyramidLoader`]).
//! - `thumbs`: a bounded LRU of decoded thumbnails feeding a grid view
//!   ([`thumbs::ThumbnailCache`]).

pub mod error;
pub mod pyramid;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod thumbs;

pub use error::{Error, Result};
pub use pyramid::{PyramidFile, PyramidGenerator, PyramidLoader};
pub use scheduler::{BackgroundScheduler, Job};
pub use sources::{
    CacheablePhotoSource, LocalFolderPhotoSource, Photo, PhotoMetadata, SourceKind, SourceRegistry,
};
pub use store::{Record, SqliteStore};
pub use thumbs::{ThumbnailCache, ThumbnailHandle};
