//! On-disk cache format and store lifecycle.
//!
//! A cache file is a fixed 4096-byte header page followed by the raw
//! pixel-data region, `height * row_bytes` bytes laid out exactly as the
//! codec decodes rows. The whole file is memory-mapped for serving, so a
//! tile render is pointer arithmetic plus a PNG encode.
//!
//! Header page layout (little-endian):
//!
//! ```text
//! offset  size  field
//! 0       6     magic "PNGTIL"
//! 6       2     version (u16) = 5
//! 8       4     format (u32), 1 = PNG
//! 12      4     width (u32)
//! 16      4     height (u32)
//! 20      1     bit_depth
//! 21      1     color_type
//! 22      2     num_palette (u16)
//! 24      4     row_bytes (u32)
//! 28      1     col_bytes
//! 29      3     (alignment)
//! 32      768   palette, 256 x {R,G,B}
//! 800     1     params flags (bit 0 = background present)
//! 801     4     params background pixel
//! 805     3     (alignment)
//! 808     8     data_size (u64)
//! 816     ...   reserved, zero to 4096
//! ```
//!
//! Updates are transactional: the new content is built in a `.tmp`
//! sibling created with exclusive semantics and renamed over the
//! `.cache` only once fully decoded, so concurrent readers either see
//! the previous cache or none at all.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapOptions};
use tracing::{debug, warn};

use crate::codec::{self, PngHeader, PngSource, PALETTE_MAX};
use crate::error::{Error, Result};
use crate::image::ImageParams;
use crate::tile::TileParams;

/// Magic bytes at the start of every cache file.
pub const CACHE_MAGIC: [u8; 6] = *b"PNGTIL";

/// Current cache format version. Any other version is incompatible.
pub const CACHE_VERSION: u16 = 5;

/// Size of the header page; the data region starts at this offset.
pub const CACHE_HEADER_SIZE: usize = 4096;

const FORMAT_PNG: u32 = 1;

const OFF_VERSION: usize = 6;
const OFF_FORMAT: usize = 8;
const OFF_WIDTH: usize = 12;
const OFF_HEIGHT: usize = 16;
const OFF_BIT_DEPTH: usize = 20;
const OFF_COLOR_TYPE: usize = 21;
const OFF_NUM_PALETTE: usize = 22;
const OFF_ROW_BYTES: usize = 24;
const OFF_COL_BYTES: usize = 28;
const OFF_PALETTE: usize = 32;
const OFF_PARAMS_FLAGS: usize = 800;
const OFF_BACKGROUND: usize = 801;
const OFF_DATA_SIZE: usize = 808;

const PARAMS_BACKGROUND: u8 = 0x01;

/// The parsed cache header page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    /// Geometry and palette of the cached image.
    pub png: PngHeader,
    /// Parameters the cache was built with.
    pub params: ImageParams,
    /// Length in bytes of the pixel-data region.
    pub data_size: u64,
}

impl CacheHeader {
    fn new(png: PngHeader, params: ImageParams) -> Self {
        let data_size = png.data_size();
        Self {
            png,
            params,
            data_size,
        }
    }

    /// Serialize into a header page.
    pub fn encode(&self) -> Box<[u8; CACHE_HEADER_SIZE]> {
        let mut page = Box::new([0u8; CACHE_HEADER_SIZE]);

        page[..6].copy_from_slice(&CACHE_MAGIC);
        LittleEndian::write_u16(&mut page[OFF_VERSION..], CACHE_VERSION);
        LittleEndian::write_u32(&mut page[OFF_FORMAT..], FORMAT_PNG);
        LittleEndian::write_u32(&mut page[OFF_WIDTH..], self.png.width);
        LittleEndian::write_u32(&mut page[OFF_HEIGHT..], self.png.height);
        page[OFF_BIT_DEPTH] = self.png.bit_depth;
        page[OFF_COLOR_TYPE] = self.png.color_type;
        LittleEndian::write_u16(&mut page[OFF_NUM_PALETTE..], self.png.num_palette);
        LittleEndian::write_u32(&mut page[OFF_ROW_BYTES..], self.png.row_bytes);
        page[OFF_COL_BYTES] = self.png.col_bytes;
        page[OFF_PALETTE..OFF_PALETTE + self.png.palette.len()].copy_from_slice(&self.png.palette);

        if let Some(background) = self.params.background_pixel {
            page[OFF_PARAMS_FLAGS] = PARAMS_BACKGROUND;
            page[OFF_BACKGROUND..OFF_BACKGROUND + 4].copy_from_slice(&background);
        }

        LittleEndian::write_u64(&mut page[OFF_DATA_SIZE..], self.data_size);

        page
    }

    /// Parse and validate a header page.
    pub fn decode(page: &[u8; CACHE_HEADER_SIZE]) -> Result<Self> {
        if page[..6] != CACHE_MAGIC {
            return Err(Error::CacheMagic);
        }

        let version = LittleEndian::read_u16(&page[OFF_VERSION..]);
        if version != CACHE_VERSION {
            return Err(Error::CacheVersion(version));
        }

        let format = LittleEndian::read_u32(&page[OFF_FORMAT..]);
        if format != FORMAT_PNG {
            return Err(Error::CacheFormat(format!("unknown format tag {format}")));
        }

        let width = LittleEndian::read_u32(&page[OFF_WIDTH..]);
        let height = LittleEndian::read_u32(&page[OFF_HEIGHT..]);
        let bit_depth = page[OFF_BIT_DEPTH];
        let color_type = page[OFF_COLOR_TYPE];
        let num_palette = LittleEndian::read_u16(&page[OFF_NUM_PALETTE..]);
        let row_bytes = LittleEndian::read_u32(&page[OFF_ROW_BYTES..]);
        let col_bytes = page[OFF_COL_BYTES];
        let data_size = LittleEndian::read_u64(&page[OFF_DATA_SIZE..]);

        if !matches!(bit_depth, 1 | 2 | 4 | 8 | 16) {
            return Err(Error::CacheFormat(format!("bad bit depth {bit_depth}")));
        }

        let channels = color_type_channels_checked(color_type)?;
        let expected_col = channels * if bit_depth == 16 { 2 } else { 1 };
        if col_bytes != expected_col {
            return Err(Error::CacheFormat(format!(
                "col_bytes {col_bytes} does not match color type {color_type} at depth {bit_depth}"
            )));
        }

        if (row_bytes as u64) < width as u64 * col_bytes as u64 {
            return Err(Error::CacheFormat(format!(
                "row_bytes {row_bytes} shorter than {width} pixels"
            )));
        }

        if data_size != height as u64 * row_bytes as u64 {
            return Err(Error::CacheFormat(format!(
                "data size {data_size} does not match {height} rows of {row_bytes} bytes"
            )));
        }

        if num_palette as usize > PALETTE_MAX {
            return Err(Error::CacheFormat(format!("palette of {num_palette} entries")));
        }
        let is_palette = color_type == 3;
        if is_palette == (num_palette == 0) {
            return Err(Error::CacheFormat(format!(
                "palette of {num_palette} entries for color type {color_type}"
            )));
        }

        let mut palette = [0u8; PALETTE_MAX * 3];
        let palette_len = palette.len();
        palette.copy_from_slice(&page[OFF_PALETTE..OFF_PALETTE + palette_len]);

        let background_pixel = if page[OFF_PARAMS_FLAGS] & PARAMS_BACKGROUND != 0 {
            let mut px = [0u8; 4];
            px.copy_from_slice(&page[OFF_BACKGROUND..OFF_BACKGROUND + 4]);
            Some(px)
        } else {
            None
        };

        Ok(Self {
            png: PngHeader {
                width,
                height,
                bit_depth,
                color_type,
                num_palette,
                row_bytes,
                col_bytes,
                palette,
            },
            params: ImageParams { background_pixel },
            data_size,
        })
    }
}

fn color_type_channels_checked(color_type: u8) -> Result<u8> {
    codec::color_type_channels(color_type)
        .ok_or_else(|| Error::CacheFormat(format!("unknown color type {color_type}")))
}

/// Result of probing a file for the cache format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSniff {
    /// A cache file this build can serve.
    Valid,
    /// Not a cache file at all.
    NotCache,
    /// A cache file from an incompatible version.
    VersionMismatch,
    /// Carries the magic but the header is malformed.
    BadFormat,
}

/// Freshness of a cache relative to its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Cache exists and is up to date; serving needs no update.
    Fresh,
    /// Cache does not exist yet.
    None,
    /// Cache exists but the source has changed since it was built.
    Stale,
    /// Cache exists but cannot be used by this build.
    Incompat,
}

/// Filesystem-level information about a cache file.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    /// Cache format version.
    pub version: u16,
    /// Last modification time of the cache file.
    pub mtime: SystemTime,
    /// Apparent size of the cache file in bytes.
    pub bytes: u64,
    /// Allocated 512-byte blocks. Less than `bytes / 512` for sparse
    /// caches.
    pub blocks: u64,
}

/// Read the header page, zero-padding if the file is shorter.
fn read_header_page(file: &mut File, path: &Path) -> Result<Box<[u8; CACHE_HEADER_SIZE]>> {
    let mut page = Box::new([0u8; CACHE_HEADER_SIZE]);
    let mut at = 0;

    while at < page.len() {
        match file.read(&mut page[at..]) {
            Ok(0) => break,
            Ok(n) => at += n,
            Err(e) => {
                return Err(Error::CacheRead {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }

    Ok(page)
}

fn load_header(path: &Path) -> Result<CacheHeader> {
    let mut file = File::open(path).map_err(|e| Error::CacheOpenRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let page = read_header_page(&mut file, path)?;
    CacheHeader::decode(&page)
}

/// Probe a file for the cache format.
///
/// Returns the classification; only I/O failures are errors.
pub fn sniff(path: &Path) -> Result<CacheSniff> {
    match load_header(path) {
        Ok(_) => Ok(CacheSniff::Valid),
        Err(Error::CacheMagic) => Ok(CacheSniff::NotCache),
        Err(Error::CacheVersion(_)) => Ok(CacheSniff::VersionMismatch),
        Err(Error::CacheFormat(_)) => Ok(CacheSniff::BadFormat),
        Err(e) => Err(e),
    }
}

/// Compare a cache against its source image.
pub fn stat(cache_path: &Path, source_path: &Path) -> Result<CacheStatus> {
    let source_meta = fs::metadata(source_path).map_err(|e| Error::ImgStat {
        path: source_path.to_path_buf(),
        source: e,
    })?;

    let cache_meta = match fs::metadata(cache_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheStatus::None),
        Err(e) => {
            return Err(Error::CacheStat {
                path: cache_path.to_path_buf(),
                source: e,
            });
        }
    };

    let source_mtime = source_meta.modified().map_err(|e| Error::ImgStat {
        path: source_path.to_path_buf(),
        source: e,
    })?;
    let cache_mtime = cache_meta.modified().map_err(|e| Error::CacheStat {
        path: cache_path.to_path_buf(),
        source: e,
    })?;

    if source_mtime > cache_mtime {
        return Ok(CacheStatus::Stale);
    }

    match load_header(cache_path) {
        Ok(_) => Ok(CacheStatus::Fresh),
        Err(e) if e.is_incompat() => Ok(CacheStatus::Incompat),
        Err(e) => Err(e),
    }
}

/// Read a cache file's header and filesystem information.
pub fn read_info(cache_path: &Path) -> Result<(CacheInfo, CacheHeader)> {
    let header = load_header(cache_path)?;

    let meta = fs::metadata(cache_path).map_err(|e| Error::CacheStat {
        path: cache_path.to_path_buf(),
        source: e,
    })?;
    let mtime = meta.modified().map_err(|e| Error::CacheStat {
        path: cache_path.to_path_buf(),
        source: e,
    })?;

    Ok((
        CacheInfo {
            version: CACHE_VERSION,
            mtime,
            bytes: meta.len(),
            blocks: allocated_blocks(&meta),
        },
        header,
    ))
}

#[cfg(unix)]
fn allocated_blocks(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks()
}

#[cfg(not(unix))]
fn allocated_blocks(_meta: &fs::Metadata) -> u64 {
    0
}

struct OpenCache {
    // keeps the descriptor alive for the mapping's lifetime
    _file: File,
    map: Mmap,
    header: CacheHeader,
}

/// Lifecycle of a single on-disk cache: build it from a source PNG and
/// serve tiles from a read-only mapping of it.
///
/// Mutating operations take `&mut self`; tile renders borrow the mapping
/// through `&self`, so the type system enforces that no update or close
/// can run while renders are in flight.
pub struct CacheStore {
    path: PathBuf,
    open: Option<OpenCache>,
}

impl CacheStore {
    /// Create a store for the given cache path. No I/O happens here.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: None,
        }
    }

    /// The cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while the cache is mapped for serving.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The mapped cache's header, if open.
    pub fn header(&self) -> Option<&CacheHeader> {
        self.open.as_ref().map(|open| &open.header)
    }

    /// Map the cache read-only for serving. A no-op when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Ok(());
        }

        let mut file = File::open(&self.path).map_err(|e| Error::CacheOpenRead {
            path: self.path.clone(),
            source: e,
        })?;

        let page = read_header_page(&mut file, &self.path)?;
        let header = CacheHeader::decode(&page)?;

        let total = CACHE_HEADER_SIZE as u64 + header.data_size;
        let actual = file
            .metadata()
            .map_err(|e| Error::CacheStat {
                path: self.path.clone(),
                source: e,
            })?
            .len();
        if actual < total {
            return Err(Error::CacheFormat(format!(
                "file is {actual} bytes, header claims {total}"
            )));
        }

        let map = unsafe { MmapOptions::new().len(total as usize).map(&file) }.map_err(|e| {
            Error::CacheMmap {
                path: self.path.clone(),
                source: e,
            }
        })?;

        self.open = Some(OpenCache {
            _file: file,
            map,
            header,
        });

        Ok(())
    }

    /// Drop the mapping and descriptor. Idempotent.
    pub fn close(&mut self) {
        self.open = None;
    }

    /// Rebuild the cache from a source PNG.
    ///
    /// The new content is decoded into an exclusively-created `.tmp`
    /// sibling and renamed into place; a failure at any point removes
    /// the side-file and leaves any existing cache untouched. A second
    /// concurrent updater fails at the exclusive create with
    /// [`Error::CacheOpenTmp`].
    pub fn update<R: Read + std::io::BufRead + std::io::Seek>(
        &mut self,
        source: PngSource<R>,
        params: &ImageParams,
    ) -> Result<()> {
        if self.open.is_some() {
            return Err(Error::CacheMode);
        }

        let header = CacheHeader::new(source.header().clone(), params.clone());
        let tmp_path = self.path.with_extension("tmp");

        // a stale side-file from a crashed update is fair game
        match fs::remove_file(&tmp_path) {
            Ok(()) => debug!(path = %tmp_path.display(), "removed stale side-file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::CacheUnlinkTmp {
                    path: tmp_path,
                    source: e,
                });
            }
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }

        let file = options.open(&tmp_path).map_err(|e| Error::CacheOpenTmp {
            path: tmp_path.clone(),
            source: e,
        })?;

        let guard = TmpGuard::new(&tmp_path);

        (&file)
            .write_all(header.encode().as_slice())
            .map_err(|e| Error::CacheWrite {
                path: tmp_path.clone(),
                source: e,
            })?;

        let total = CACHE_HEADER_SIZE as u64 + header.data_size;
        file.set_len(total).map_err(|e| Error::CacheTrunc {
            path: tmp_path.clone(),
            source: e,
        })?;

        let mut map =
            unsafe { MmapOptions::new().len(total as usize).map_mut(&file) }.map_err(|e| {
                Error::CacheMmap {
                    path: tmp_path.clone(),
                    source: e,
                }
            })?;

        // stores through the mapping keep background runs unallocated
        source.decode_into(&mut map[CACHE_HEADER_SIZE..], params)?;

        map.flush().map_err(|e| Error::CacheWrite {
            path: tmp_path.clone(),
            source: e,
        })?;
        drop(map);

        file.sync_all().map_err(|e| Error::CacheWrite {
            path: tmp_path.clone(),
            source: e,
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|e| Error::CacheRenameTmp {
            path: tmp_path.clone(),
            source: e,
        })?;

        guard.disarm();
        debug!(path = %self.path.display(), bytes = total, "cache updated");

        Ok(())
    }

    /// Encode one tile from the open mapping into `out`.
    pub(crate) fn render_tile<W: Write>(&self, params: &TileParams, out: &mut W) -> Result<()> {
        let open = self.open.as_ref().ok_or(Error::CacheMode)?;
        let data = &open.map[CACHE_HEADER_SIZE..];

        codec::encode_tile(&open.header.png, data, params, out)
    }
}

/// Removes the update side-file unless the update completed.
struct TmpGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> TmpGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = fs::remove_file(self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove side-file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_header() -> CacheHeader {
        CacheHeader::new(
            PngHeader {
                width: 4,
                height: 2,
                bit_depth: 8,
                color_type: 2,
                num_palette: 0,
                row_bytes: 12,
                col_bytes: 3,
                palette: [0u8; PALETTE_MAX * 3],
            },
            ImageParams::default(),
        )
    }

    fn palette_header() -> CacheHeader {
        let mut palette = [0u8; PALETTE_MAX * 3];
        palette[..6].copy_from_slice(&[255, 0, 0, 0, 255, 0]);
        CacheHeader::new(
            PngHeader {
                width: 8,
                height: 8,
                bit_depth: 8,
                color_type: 3,
                num_palette: 2,
                row_bytes: 8,
                col_bytes: 1,
                palette,
            },
            ImageParams {
                background_pixel: Some([0xFF, 0xEE, 0xDD, 0x00]),
            },
        )
    }

    #[test]
    fn test_header_roundtrip() {
        for header in [rgb_header(), palette_header()] {
            let page = header.encode();
            let decoded = CacheHeader::decode(&page).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut page = rgb_header().encode();
        page[0] = b'X';
        assert!(matches!(CacheHeader::decode(&page), Err(Error::CacheMagic)));
    }

    #[test]
    fn test_header_rejects_other_version() {
        let mut page = rgb_header().encode();
        LittleEndian::write_u16(&mut page[OFF_VERSION..], CACHE_VERSION + 1);
        assert!(matches!(
            CacheHeader::decode(&page),
            Err(Error::CacheVersion(v)) if v == CACHE_VERSION + 1
        ));
    }

    #[test]
    fn test_header_rejects_data_size_mismatch() {
        let mut page = rgb_header().encode();
        LittleEndian::write_u64(&mut page[OFF_DATA_SIZE..], 1);
        assert!(matches!(
            CacheHeader::decode(&page),
            Err(Error::CacheFormat(_))
        ));
    }

    #[test]
    fn test_header_rejects_palette_mismatch() {
        // palette entries on a truecolor image
        let mut page = rgb_header().encode();
        LittleEndian::write_u16(&mut page[OFF_NUM_PALETTE..], 3);
        assert!(matches!(
            CacheHeader::decode(&page),
            Err(Error::CacheFormat(_))
        ));
    }

    fn write_cache_file(path: &Path, header: &CacheHeader) {
        let mut bytes = header.encode().to_vec();
        bytes.resize(CACHE_HEADER_SIZE + header.data_size as usize, 0);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_sniff_classification() {
        let dir = tempfile::tempdir().unwrap();

        let valid = dir.path().join("a.cache");
        write_cache_file(&valid, &rgb_header());
        assert_eq!(sniff(&valid).unwrap(), CacheSniff::Valid);

        let other = dir.path().join("b.cache");
        fs::write(&other, b"not a cache at all").unwrap();
        assert_eq!(sniff(&other).unwrap(), CacheSniff::NotCache);

        let versioned = dir.path().join("c.cache");
        let mut page = rgb_header().encode();
        LittleEndian::write_u16(&mut page[OFF_VERSION..], 99);
        fs::write(&versioned, page.as_slice()).unwrap();
        assert_eq!(sniff(&versioned).unwrap(), CacheSniff::VersionMismatch);

        let malformed = dir.path().join("d.cache");
        let mut page = rgb_header().encode();
        page[OFF_BIT_DEPTH] = 7;
        fs::write(&malformed, page.as_slice()).unwrap();
        assert_eq!(sniff(&malformed).unwrap(), CacheSniff::BadFormat);

        assert!(matches!(
            sniff(&dir.path().join("missing.cache")),
            Err(Error::CacheOpenRead { .. })
        ));
    }

    #[test]
    fn test_stat_lattice() {
        let dir = tempfile::tempdir().unwrap();

        let source = dir.path().join("img.png");
        fs::write(&source, b"source bytes").unwrap();

        let cache_path = dir.path().join("img.cache");

        // no cache yet
        assert_eq!(stat(&cache_path, &source).unwrap(), CacheStatus::None);

        write_cache_file(&cache_path, &rgb_header());
        assert_eq!(stat(&cache_path, &source).unwrap(), CacheStatus::Fresh);

        // backdate the cache below the source mtime
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(&cache_path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert_eq!(stat(&cache_path, &source).unwrap(), CacheStatus::Stale);

        // corrupt magic: incompatible, not an error
        write_cache_file(&cache_path, &rgb_header());
        let mut bytes = fs::read(&cache_path).unwrap();
        bytes[0] = b'X';
        fs::write(&cache_path, &bytes).unwrap();
        // rewrite may bump mtime above the source; stat checks mtime first
        let newer = SystemTime::now() + std::time::Duration::from_secs(10);
        File::options()
            .write(true)
            .open(&cache_path)
            .unwrap()
            .set_modified(newer)
            .unwrap();
        assert_eq!(stat(&cache_path, &source).unwrap(), CacheStatus::Incompat);

        // missing source
        assert!(matches!(
            stat(&cache_path, &dir.path().join("missing.png")),
            Err(Error::ImgStat { .. })
        ));
    }

    #[test]
    fn test_truncated_cache_is_incompat() {
        let dir = tempfile::tempdir().unwrap();

        let source = dir.path().join("img.png");
        fs::write(&source, b"source").unwrap();

        // only the first five magic bytes survive
        let cache_path = dir.path().join("img.cache");
        fs::write(&cache_path, &CACHE_MAGIC[..5]).unwrap();
        let newer = SystemTime::now() + std::time::Duration::from_secs(10);
        File::options()
            .write(true)
            .open(&cache_path)
            .unwrap()
            .set_modified(newer)
            .unwrap();

        assert_eq!(stat(&cache_path, &source).unwrap(), CacheStatus::Incompat);
    }

    #[test]
    fn test_read_info() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("img.cache");
        write_cache_file(&cache_path, &palette_header());

        let (info, header) = read_info(&cache_path).unwrap();
        assert_eq!(info.version, CACHE_VERSION);
        assert_eq!(
            info.bytes,
            CACHE_HEADER_SIZE as u64 + header.data_size
        );
        assert_eq!(header.png.width, 8);
        assert_eq!(header.params.background_pixel, Some([0xFF, 0xEE, 0xDD, 0x00]));
    }

    #[test]
    fn test_open_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("img.cache");

        // valid header but data region missing
        fs::write(&cache_path, rgb_header().encode().as_slice()).unwrap();

        let mut store = CacheStore::new(&cache_path);
        assert!(matches!(store.open(), Err(Error::CacheFormat(_))));
        assert!(!store.is_open());
    }

    #[test]
    fn test_open_close_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("img.cache");
        write_cache_file(&cache_path, &rgb_header());

        let mut store = CacheStore::new(&cache_path);
        store.open().unwrap();
        store.open().unwrap();
        assert!(store.is_open());
        assert_eq!(store.header().unwrap().png.width, 4);

        store.close();
        store.close();
        assert!(!store.is_open());
    }
}
