//! Image façade: binds a source PNG to its cache file.
//!
//! An [`Image`] owns the cache path and drives the whole lifecycle:
//! check freshness, rebuild the cache, map it, and render tiles.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::cache::{self, CacheInfo, CacheSniff, CacheStatus, CacheStore};
use crate::codec::{self, PngSource};
use crate::error::{Error, Result};
use crate::tile::{Tile, TileParams};

/// Options applied when building a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageParams {
    /// Pixel value treated as background during the update: aligned to
    /// the start of the source's pixel format, compared over `col_bytes`
    /// bytes. Runs of background pixels are skipped to keep the cache
    /// file sparse.
    pub background_pixel: Option<[u8; 4]>,
}

/// Metadata for an image and its cache.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Bits per pixel of the source image.
    pub bpp: u32,
    /// Last modification of the source file, when available.
    pub image_mtime: Option<SystemTime>,
    /// Size of the source file in bytes; zero when unavailable.
    pub image_bytes: u64,
    /// Cache file details.
    pub cache: CacheInfo,
}

/// Derive the cache path for a source image by swapping its final
/// extension for `.cache`.
pub fn cache_path_for(source: &Path) -> Result<PathBuf> {
    if source.extension().is_none() {
        return Err(Error::Path(source.to_path_buf()));
    }
    Ok(source.with_extension("cache"))
}

/// Reject sources this library cannot cache.
fn check_source(source: &Path) -> Result<()> {
    if codec::sniff(source)? {
        return Ok(());
    }

    // a cache file handed in as the source is a usage error worth its
    // own diagnostic
    match cache::sniff(source)? {
        CacheSniff::NotCache => Err(Error::ImgFormat(format!(
            "{} is not a PNG file",
            source.display()
        ))),
        _ => Err(Error::ImgFormatCache(source.to_path_buf())),
    }
}

/// A source image bound to its on-disk cache.
///
/// Freshly constructed images are closed; [`open`](Image::open) maps the
/// cache for serving. While open, any number of tile renders may run
/// concurrently, but [`update`](Image::update) is refused.
pub struct Image {
    cache: CacheStore,
}

impl Image {
    /// Bind to a cache path directly. No I/O happens here.
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache: CacheStore::new(cache_path),
        }
    }

    /// Bind to the cache belonging to a source image.
    ///
    /// Verifies that the source looks like a PNG: anything else fails
    /// `ImgFormat`, and a cache file fails `ImgFormatCache`.
    pub fn for_source(source: &Path) -> Result<Self> {
        check_source(source)?;
        Ok(Self::new(cache_path_for(source)?))
    }

    /// The cache file path this image is bound to.
    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// True while the cache is mapped for serving.
    pub fn is_open(&self) -> bool {
        self.cache.is_open()
    }

    /// Compare the cache against the source image. No state change.
    pub fn status(&self, source: &Path) -> Result<CacheStatus> {
        cache::stat(self.cache.path(), source)
    }

    /// Image and cache metadata.
    ///
    /// Reads the cache header transiently; source stat failures degrade
    /// to absent fields rather than erroring.
    pub fn info(&self, source: &Path) -> Result<ImageInfo> {
        let (cache_info, header) = cache::read_info(self.cache.path())?;

        let (image_mtime, image_bytes) = match fs::metadata(source) {
            Ok(meta) => (meta.modified().ok(), meta.len()),
            Err(_) => (None, 0),
        };

        Ok(ImageInfo {
            width: header.png.width,
            height: header.png.height,
            bpp: header.png.bits_per_pixel(),
            image_mtime,
            image_bytes,
            cache: cache_info,
        })
    }

    /// Rebuild the cache from the source image.
    ///
    /// Fails `ImgMode` while the image is open for serving. The rebuild
    /// is atomic; see [`CacheStore::update`].
    pub fn update(&mut self, source: &Path, params: &ImageParams) -> Result<()> {
        if self.cache.is_open() {
            return Err(Error::ImgMode);
        }

        check_source(source)?;
        debug!(
            source = %source.display(),
            cache = %self.cache.path().display(),
            "updating cache"
        );

        let decoder = PngSource::open(source)?;
        self.cache.update(decoder, params)
    }

    /// Map the cache read-only for serving. A no-op when already open.
    pub fn open(&mut self) -> Result<()> {
        self.cache.open()
    }

    /// Unmap the cache. The image can be reopened or updated afterwards.
    pub fn close(&mut self) {
        self.cache.close()
    }

    /// Render a tile into a borrowed stream.
    ///
    /// The stream is flushed after the final row but not closed.
    /// Requires the image to be open.
    pub fn tile_file(&self, params: &TileParams, out: &mut dyn Write) -> Result<()> {
        if !self.cache.is_open() {
            return Err(Error::ImgMode);
        }

        Tile::to_stream(*params, out).render(&self.cache)
    }

    /// Render a tile into a freshly allocated buffer.
    ///
    /// Requires the image to be open.
    pub fn tile_mem(&self, params: &TileParams) -> Result<Vec<u8>> {
        if !self.cache.is_open() {
            return Err(Error::ImgMode);
        }

        let mut tile = Tile::to_mem(*params)?;
        tile.render(&self.cache)?;
        Ok(tile.into_mem().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_path_for() {
        assert_eq!(
            cache_path_for(Path::new("/data/map.png")).unwrap(),
            Path::new("/data/map.cache")
        );
        assert!(matches!(
            cache_path_for(Path::new("/data/noext")),
            Err(Error::Path(_))
        ));
    }

    #[test]
    fn test_for_source_rejects_non_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"plain text, nothing like a PNG").unwrap();

        assert!(matches!(
            Image::for_source(&path),
            Err(Error::ImgFormat(_))
        ));
    }

    #[test]
    fn test_for_source_rejects_cache_file() {
        use crate::cache::{CacheHeader, CACHE_HEADER_SIZE};
        use crate::codec::{PngHeader, PALETTE_MAX};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.cache");

        let header = CacheHeader {
            png: PngHeader {
                width: 1,
                height: 1,
                bit_depth: 8,
                color_type: 2,
                num_palette: 0,
                row_bytes: 3,
                col_bytes: 3,
                palette: [0u8; PALETTE_MAX * 3],
            },
            params: ImageParams::default(),
            data_size: 3,
        };
        let mut bytes = header.encode().to_vec();
        bytes.resize(CACHE_HEADER_SIZE + 3, 0);
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Image::for_source(&path),
            Err(Error::ImgFormatCache(_))
        ));
    }

    #[test]
    fn test_tile_requires_open() {
        let image = Image::new("/nonexistent/img.cache");
        let params = TileParams {
            width: 16,
            height: 16,
            x: 0,
            y: 0,
            zoom: 0,
        };

        assert!(matches!(image.tile_mem(&params), Err(Error::ImgMode)));

        let mut out = Vec::new();
        assert!(matches!(
            image.tile_file(&params, &mut out),
            Err(Error::ImgMode)
        ));
    }
}
