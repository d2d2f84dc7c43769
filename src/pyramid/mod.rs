/// Multi-resolution image pyramid pipeline
///
/// This module covers the pyramid cache:
/// - Binary tile file format with lazy per-tile decode (file.rs)
/// - Pyramid generation from full-resolution sources (generator.rs)
/// - Shared, ref-counted, cancellable loading (loader.rs)

pub mod file;
pub mod generator;
pub mod loader;

pub use file::{PyramidFile, Tile};
pub use generator::PyramidGenerator;
pub use loader::{CheckHandle, PreviewHandle, PyramidLoader};
