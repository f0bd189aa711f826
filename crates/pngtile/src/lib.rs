//! # pngtile
//!
//! Tile-based random access to very large PNG images.
//!
//! A source PNG is decoded once into an on-disk cache file: a fixed
//! header page followed by the raw pixel rows, laid out so the whole
//! file can be memory-mapped and served without ever re-decoding the
//! source. Arbitrary rectangular tiles, optionally downsampled by a
//! power of two, are then encoded on demand as standalone PNG streams
//! straight from the mapping.
//!
//! # Architecture
//!
//! - [`Image`] - the façade: binds a source path to its cache, exposes
//!   status/update/open/tile operations
//! - [`CacheStore`] - cache lifecycle: atomic rebuild via an exclusive
//!   `.tmp` side-file, read-only mapping for serving
//! - [`PngSource`] - streaming decode of the source PNG, with optional
//!   sparse filtering of background regions
//! - [`Tile`] / [`TileSink`] - a render request and where its PNG bytes
//!   go (borrowed stream or owned buffer)
//!
//! # Quick start
//!
//! ```ignore
//! use pngtile::{CacheStatus, Image, ImageParams, TileParams};
//!
//! let mut image = Image::for_source("world.png".as_ref())?;
//!
//! if image.status("world.png".as_ref())? != CacheStatus::Fresh {
//!     image.update("world.png".as_ref(), &ImageParams::default())?;
//! }
//!
//! image.open()?;
//! let tile = image.tile_mem(&TileParams {
//!     width: 256,
//!     height: 256,
//!     x: 1024,
//!     y: 1024,
//!     zoom: 0,
//! })?;
//! ```
//!
//! # Concurrency
//!
//! Tile renders borrow an open image shared (`&Image`), so any number
//! may run in parallel; updates and open/close need `&mut Image`. Cache
//! rebuilds exclude each other through exclusive creation of the `.tmp`
//! side-file and publish atomically via `rename`, so readers never see
//! a partially written cache.

#![warn(missing_docs)]

mod cache;
mod codec;
mod error;
mod image;
mod tile;

pub use cache::{
    sniff as sniff_cache, stat as stat_cache, read_info as read_cache_info, CacheHeader,
    CacheInfo, CacheSniff, CacheStatus, CacheStore, CACHE_HEADER_SIZE, CACHE_MAGIC, CACHE_VERSION,
};
pub use codec::{
    sniff as sniff_png, PngHeader, PngSource, PALETTE_MAX, PNG_SIGNATURE, SPARSE_BLOCK_PIXELS,
};
pub use error::{Error, Result};
pub use image::{cache_path_for, Image, ImageInfo, ImageParams};
pub use tile::{MemBuf, Tile, TileParams, TileSink};
