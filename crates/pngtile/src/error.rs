//! Error types for cache and tile operations.
//!
//! Every fallible operation in the crate returns [`Error`]. I/O-backed
//! variants carry the originating [`std::io::Error`] and, where it helps
//! diagnostics, the filesystem path involved.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or serving an image cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer allocation failed.
    #[error("allocation failed")]
    Mem,

    /// A cache path could not be derived from the source path.
    #[error("cannot derive cache path from {}: no file extension", .0.display())]
    Path(PathBuf),

    /// Operation is incompatible with the image's current state.
    #[error("operation incompatible with image state")]
    ImgMode,

    /// Cannot stat the source image.
    #[error("stat {}", path.display())]
    ImgStat {
        /// Source image path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Cannot open the source image.
    #[error("open {}", path.display())]
    ImgOpen {
        /// Source image path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The source is not a supported image.
    #[error("unsupported image: {0}")]
    ImgFormat(String),

    /// The source PNG is interlaced, which is not supported.
    #[error("interlaced PNG images are not supported")]
    ImgFormatInterlace,

    /// The source is itself a cache file.
    #[error("source {} is a cache file", .0.display())]
    ImgFormatCache(PathBuf),

    /// The PNG encoder could not be set up.
    #[error("PNG encoder setup: {0}")]
    PngCreate(String),

    /// The PNG codec failed mid-operation.
    #[error("PNG codec: {0}")]
    PngInternal(String),

    /// Operation is incompatible with the cache store's current state.
    #[error("operation incompatible with cache state")]
    CacheMode,

    /// Cannot stat the cache file.
    #[error("stat {}", path.display())]
    CacheStat {
        /// Cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Cannot open the cache file for reading.
    #[error("open {}", path.display())]
    CacheOpenRead {
        /// Cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Cannot create the cache side-file. A concurrent updater holds it.
    #[error("create {}", path.display())]
    CacheOpenTmp {
        /// Side-file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Cannot unlink a stale cache side-file.
    #[error("unlink {}", path.display())]
    CacheUnlinkTmp {
        /// Side-file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Reading the cache header failed.
    #[error("read {}", path.display())]
    CacheRead {
        /// Cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Writing cache contents failed.
    #[error("write {}", path.display())]
    CacheWrite {
        /// Cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Extending the cache side-file failed.
    #[error("truncate {}", path.display())]
    CacheTrunc {
        /// Side-file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Memory-mapping the cache file failed.
    #[error("mmap {}", path.display())]
    CacheMmap {
        /// Cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Renaming the side-file over the cache failed.
    #[error("rename {}", path.display())]
    CacheRenameTmp {
        /// Side-file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The cache file does not carry the cache magic.
    #[error("bad cache magic")]
    CacheMagic,

    /// The cache file was written by an incompatible version.
    #[error("unsupported cache version {0}")]
    CacheVersion(u16),

    /// The cache header is malformed.
    #[error("bad cache header: {0}")]
    CacheFormat(String),

    /// A tile dimension is zero.
    #[error("tile has a zero dimension")]
    TileDim,

    /// The tile starts entirely outside the image.
    #[error("tile origin outside the image")]
    TileClip,

    /// The zoom factor is not a supported downsampling factor.
    #[error("unsupported zoom factor {0}")]
    TileZoom(i32),
}

impl Error {
    /// True for header-validation failures that mark a cache as
    /// incompatible rather than broken: the cache can be rebuilt.
    pub fn is_incompat(&self) -> bool {
        matches!(
            self,
            Error::CacheMagic | Error::CacheVersion(_) | Error::CacheFormat(_)
        )
    }
}
