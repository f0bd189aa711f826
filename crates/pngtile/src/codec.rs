//! PNG codec adapter.
//!
//! Wraps the `png` crate behind the two operations the cache needs:
//! streaming a source PNG's rows into the cache's data region, and
//! encoding a rectangular tile of that region back out as a standalone
//! PNG. All `png::*` error values are translated to crate errors at this
//! boundary; no caller sees the underlying codec types fail.
//!
//! The cache stores rows in the source's own pixel format with one
//! exception: sub-byte bit depths are unpacked to one pixel per byte, so
//! that `row_bytes = width * col_bytes` holds for every cache. Encoding
//! re-packs those rows, which keeps a full-image tile bit-identical to
//! the source.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::ImageParams;
use crate::tile::TileParams;

/// The 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Granularity of sparse-decode detection, in pixels.
///
/// During a sparse update each row is divided into blocks of this many
/// pixels; a block is stored only if at least one of its pixels differs
/// from the background pattern.
pub const SPARSE_BLOCK_PIXELS: usize = 64;

/// Maximum number of palette entries in a PNG.
pub const PALETTE_MAX: usize = 256;

/// Largest accepted downsampling exponent. Beyond this the sampled
/// region arithmetic would overflow before clamping to the image.
pub(crate) const MAX_ZOOM: i32 = 30;

const COLOR_GRAYSCALE: u8 = 0;
const COLOR_RGB: u8 = 2;
const COLOR_PALETTE: u8 = 3;
const COLOR_GRAYSCALE_ALPHA: u8 = 4;
const COLOR_RGBA: u8 = 6;

/// Probe a file for the PNG signature.
///
/// Returns `Ok(true)` for a PNG, `Ok(false)` for anything else that
/// could be read. Open failures surface as [`Error::ImgOpen`].
pub fn sniff(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| Error::ImgOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut signature = [0u8; 8];
    match file.read_exact(&mut signature) {
        Ok(()) => Ok(signature == PNG_SIGNATURE),
        // too short to be any image
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::ImgOpen {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Number of channels for a raw PNG color type tag.
pub(crate) fn color_type_channels(color_type: u8) -> Option<u8> {
    match color_type {
        COLOR_GRAYSCALE | COLOR_PALETTE => Some(1),
        COLOR_GRAYSCALE_ALPHA => Some(2),
        COLOR_RGB => Some(3),
        COLOR_RGBA => Some(4),
        _ => None,
    }
}

/// Snapshot of a source PNG's header, as laid out in the cache.
///
/// `row_bytes` and `col_bytes` describe the cache's row layout, not the
/// PNG wire format: sub-byte depths are unpacked to one byte per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PngHeader {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Bit depth per channel (1, 2, 4, 8 or 16).
    pub bit_depth: u8,
    /// Raw PNG color type tag (0, 2, 3, 4 or 6).
    pub color_type: u8,
    /// Number of used palette entries; non-zero only for palette images.
    pub num_palette: u16,
    /// Length of one cached row in bytes.
    pub row_bytes: u32,
    /// Length of one pixel in bytes.
    pub col_bytes: u8,
    /// Palette entries as packed R,G,B triples.
    pub palette: [u8; PALETTE_MAX * 3],
}

impl PngHeader {
    pub(crate) fn from_info(info: &png::Info) -> Result<Self> {
        let bit_depth = info.bit_depth as u8;
        let color_type = info.color_type as u8;

        let channels = color_type_channels(color_type).ok_or_else(|| {
            Error::ImgFormat(format!("unknown PNG color type {color_type}"))
        })?;

        // sub-byte depths are stored unpacked, one pixel per byte
        let col_bytes = channels * if bit_depth == 16 { 2 } else { 1 };
        let row_bytes = info.width * col_bytes as u32;

        debug!(
            width = info.width,
            height = info.height,
            bit_depth,
            color_type,
            row_bytes,
            col_bytes,
            "source PNG header"
        );

        let mut palette = [0u8; PALETTE_MAX * 3];
        let num_palette = if color_type == COLOR_PALETTE {
            let plte = info
                .palette
                .as_deref()
                .ok_or_else(|| Error::PngInternal("palette image without PLTE".into()))?;
            if plte.len() > palette.len() {
                return Err(Error::PngInternal(format!(
                    "PLTE of {} bytes exceeds {} entries",
                    plte.len(),
                    PALETTE_MAX
                )));
            }
            palette[..plte.len()].copy_from_slice(plte);
            (plte.len() / 3) as u16
        } else {
            0
        };

        Ok(Self {
            width: info.width,
            height: info.height,
            bit_depth,
            color_type,
            num_palette,
            row_bytes,
            col_bytes,
            palette,
        })
    }

    /// Size of the pixel-data region for this header.
    pub fn data_size(&self) -> u64 {
        self.height as u64 * self.row_bytes as u64
    }

    /// True for palette-based images.
    pub fn is_palette(&self) -> bool {
        self.color_type == COLOR_PALETTE
    }

    /// Bits per pixel of the source image.
    pub fn bits_per_pixel(&self) -> u32 {
        let channels = self.col_bytes as u32 / if self.bit_depth == 16 { 2 } else { 1 };
        channels * self.bit_depth as u32
    }

    /// Resolve a palette index to its R,G,B triple.
    fn palette_rgb(&self, index: u8) -> [u8; 3] {
        let at = index as usize * 3;
        [self.palette[at], self.palette[at + 1], self.palette[at + 2]]
    }

    fn png_color_type(&self) -> Result<png::ColorType> {
        Ok(match self.color_type {
            COLOR_GRAYSCALE => png::ColorType::Grayscale,
            COLOR_RGB => png::ColorType::Rgb,
            COLOR_PALETTE => png::ColorType::Indexed,
            COLOR_GRAYSCALE_ALPHA => png::ColorType::GrayscaleAlpha,
            COLOR_RGBA => png::ColorType::Rgba,
            other => return Err(Error::CacheFormat(format!("unknown color type {other}"))),
        })
    }

    fn png_bit_depth(&self) -> Result<png::BitDepth> {
        Ok(match self.bit_depth {
            1 => png::BitDepth::One,
            2 => png::BitDepth::Two,
            4 => png::BitDepth::Four,
            8 => png::BitDepth::Eight,
            16 => png::BitDepth::Sixteen,
            other => return Err(Error::CacheFormat(format!("unknown bit depth {other}"))),
        })
    }
}

/// A source PNG opened for a single streaming decode.
pub struct PngSource<R: Read + BufRead + Seek> {
    reader: png::Reader<R>,
    header: PngHeader,
}

impl PngSource<BufReader<File>> {
    /// Open a source PNG from the filesystem.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::ImgOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + BufRead + Seek> PngSource<R> {
    /// Bind a decoder to a byte stream and parse the PNG header.
    ///
    /// Interlaced images are rejected: the row-streaming decode below
    /// relies on rows arriving in top-to-bottom order.
    pub fn new(input: R) -> Result<Self> {
        let mut decoder = png::Decoder::new(input);
        decoder.set_transformations(png::Transformations::IDENTITY);

        let reader = decoder.read_info().map_err(decode_err)?;
        let info = reader.info();

        if info.interlaced {
            return Err(Error::ImgFormatInterlace);
        }

        let header = PngHeader::from_info(info)?;

        Ok(Self { reader, header })
    }

    /// The header snapshot for this source.
    pub fn header(&self) -> &PngHeader {
        &self.header
    }

    /// Decode every row into `dest`, which must hold `data_size` bytes.
    ///
    /// With a background pixel set in `params`, rows are filtered in
    /// blocks of [`SPARSE_BLOCK_PIXELS`]: blocks consisting entirely of
    /// background pixels are never written, so pages of a truncated
    /// destination mapping stay unallocated. Pixels wider than the
    /// 4-byte background pattern always decode direct.
    pub fn decode_into(mut self, dest: &mut [u8], params: &ImageParams) -> Result<()> {
        let header = self.header.clone();
        let row_bytes = header.row_bytes as usize;
        let col_bytes = header.col_bytes as usize;

        debug_assert_eq!(dest.len() as u64, header.data_size());

        let background = params
            .background_pixel
            .as_ref()
            .filter(|_| col_bytes <= 4)
            .map(|px| &px[..col_bytes]);

        // scratch for unpacking sub-byte rows
        let mut unpacked = (header.bit_depth < 8).then(|| vec![0u8; row_bytes]);

        for row_index in 0..header.height as usize {
            let row = self
                .reader
                .next_row()
                .map_err(decode_err)?
                .ok_or_else(|| Error::PngInternal("decoder ran out of rows".into()))?;

            let out = &mut dest[row_index * row_bytes..(row_index + 1) * row_bytes];
            let src: &[u8] = match unpacked.as_mut() {
                Some(buf) => {
                    unpack_row(row.data(), header.bit_depth, header.width as usize, buf);
                    buf
                }
                None => &row.data()[..row_bytes],
            };

            match background {
                Some(bg) => copy_sparse_row(out, src, col_bytes, bg),
                None => out.copy_from_slice(src),
            }
        }

        // drain trailing chunks after the last row
        self.reader.finish().map_err(decode_err)
    }
}

/// Copy one row in [`SPARSE_BLOCK_PIXELS`]-sized blocks, skipping blocks
/// that consist entirely of the background pattern.
fn copy_sparse_row(dest: &mut [u8], src: &[u8], col_bytes: usize, background: &[u8]) {
    let block_bytes = SPARSE_BLOCK_PIXELS * col_bytes;

    for (out, block) in dest.chunks_mut(block_bytes).zip(src.chunks(block_bytes)) {
        if block.chunks(col_bytes).any(|px| px != background) {
            out.copy_from_slice(block);
        }
    }
}

/// Unpack a sub-byte row (MSB-first, per the PNG spec) to one byte per
/// pixel.
fn unpack_row(packed: &[u8], bit_depth: u8, width: usize, out: &mut [u8]) {
    let bits = bit_depth as usize;
    let per_byte = 8 / bits;
    let mask = (1u16 << bits) as u8 - 1;

    for (index, px) in out[..width].iter_mut().enumerate() {
        let byte = packed[index / per_byte];
        let shift = 8 - bits * (index % per_byte + 1);
        *px = (byte >> shift) & mask;
    }
}

/// Pack one-byte-per-pixel values back into a sub-byte row.
fn pack_row(unpacked: &[u8], bit_depth: u8, out: &mut [u8]) {
    let bits = bit_depth as usize;
    let per_byte = 8 / bits;
    let mask = (1u16 << bits) as u8 - 1;

    out.fill(0);
    for (index, &px) in unpacked.iter().enumerate() {
        let shift = 8 - bits * (index % per_byte + 1);
        out[index / per_byte] |= (px & mask) << shift;
    }
}

/// Bytes occupied by one packed row of `width` pixels.
fn packed_row_len(width: usize, bit_depth: u8) -> usize {
    let per_byte = 8 / bit_depth as usize;
    width.div_ceil(per_byte)
}

/// Encode a tile of the mapped pixel data as a standalone PNG.
///
/// `data` is the cache's pixel-data region for `header`. The output is
/// written to `out` row by row; the sink is not flushed or closed here,
/// that stays with the caller.
pub(crate) fn encode_tile<W: Write>(
    header: &PngHeader,
    data: &[u8],
    params: &TileParams,
    out: W,
) -> Result<()> {
    if params.x >= header.width || params.y >= header.height {
        return Err(Error::TileClip);
    }
    if params.zoom < 0 || params.zoom > MAX_ZOOM {
        return Err(Error::TileZoom(params.zoom));
    }

    if params.zoom > 0 {
        encode_zoomed(header, data, params, out)
    } else {
        encode_unzoomed(header, data, params, out)
    }
}

/// Unscaled tile: same bit depth, color type and palette as the source.
fn encode_unzoomed<W: Write>(
    header: &PngHeader,
    data: &[u8],
    params: &TileParams,
    out: W,
) -> Result<()> {
    let mut encoder = png::Encoder::new(out, params.width, params.height);
    encoder.set_color(header.png_color_type()?);
    encoder.set_depth(header.png_bit_depth()?);
    if header.is_palette() {
        encoder.set_palette(header.palette[..header.num_palette as usize * 3].to_vec());
    }

    let mut writer = encoder.write_header().map_err(encode_create_err)?;
    let mut stream = writer.stream_writer().map_err(encode_create_err)?;

    let row_bytes = header.row_bytes as usize;
    let col_bytes = header.col_bytes as usize;
    let x = params.x as usize;
    let y = params.y as usize;
    let out_width = params.width as usize;
    let out_bytes = out_width * col_bytes;

    // the encoder expects packed rows for sub-byte depths
    let mut packed =
        (header.bit_depth < 8).then(|| vec![0u8; packed_row_len(out_width, header.bit_depth)]);

    let clips = params.x as u64 + params.width as u64 > header.width as u64
        || params.y as u64 + params.height as u64 > header.height as u64;

    if !clips {
        // fully inside: emit rows straight out of the mapping
        for row in y..y + params.height as usize {
            let at = row * row_bytes + x * col_bytes;
            write_row(&mut stream, &data[at..at + out_bytes], header, &mut packed)?;
        }
    } else {
        let clip_x = (params.x as u64 + params.width as u64).min(header.width as u64) as usize;
        let clip_y = (params.y as u64 + params.height as u64).min(header.height as u64) as usize;

        // bytes of real pixel data per row, the rest is fill
        let real_bytes = (clip_x - x) * col_bytes;
        let mut row_buf = vec![0u8; out_bytes];

        for row in y..clip_y {
            let at = row * row_bytes + x * col_bytes;
            row_buf[..real_bytes].copy_from_slice(&data[at..at + real_bytes]);
            write_row(&mut stream, &row_buf, header, &mut packed)?;
        }

        // rows below the image are pure fill
        row_buf[..real_bytes].fill(0);
        for _ in clip_y..y + params.height as usize {
            write_row(&mut stream, &row_buf, header, &mut packed)?;
        }
    }

    stream.finish().map_err(encode_err)
}

fn write_row<W: Write>(
    stream: &mut W,
    row: &[u8],
    header: &PngHeader,
    packed: &mut Option<Vec<u8>>,
) -> Result<()> {
    match packed.as_mut() {
        Some(buf) => {
            pack_row(row, header.bit_depth, buf);
            stream.write_all(buf)
        }
        None => stream.write_all(row),
    }
    .map_err(write_err)
}

/// Downsampled tile: always an 8-bit RGB PNG.
///
/// Each output pixel summarizes a `2^zoom` square of source pixels by
/// successive pairwise averaging, with the sampled region clamped to the
/// image. Only 8-bit palette sources can be resolved to RGB here; other
/// formats are rejected rather than emitting stale colors.
fn encode_zoomed<W: Write>(
    header: &PngHeader,
    data: &[u8],
    params: &TileParams,
    out: W,
) -> Result<()> {
    if !header.is_palette() || header.bit_depth != 8 {
        return Err(Error::ImgFormat(
            "zoomed tiles require an 8-bit palette source".into(),
        ));
    }

    let zoom = params.zoom as u32;

    let mut encoder = png::Encoder::new(out, params.width, params.height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder.write_header().map_err(encode_create_err)?;
    let mut stream = writer.stream_writer().map_err(encode_create_err)?;

    let row_bytes = header.row_bytes as usize;
    // source pixels per output pixel, per axis
    let span = 1u64 << zoom;

    let in_col_start = params.x as usize;
    let in_col_end = (params.x as u64 + (params.width as u64) * span).min(header.width as u64) as usize;

    let mut row_buf = vec![0u8; params.width as usize * 3];

    for out_row in 0..params.height as u64 {
        row_buf.fill(0);

        let in_row_start = params.y as u64 + out_row * span;
        let in_row_end = (in_row_start + span).min(header.height as u64);

        // rows past the bottom edge contribute nothing
        for in_row in in_row_start..in_row_end {
            let row = &data[in_row as usize * row_bytes..][..row_bytes];

            for in_col in in_col_start..in_col_end {
                let out_col = (in_col - in_col_start) >> zoom;
                let rgb = header.palette_rgb(row[in_col]);

                let px = &mut row_buf[out_col * 3..out_col * 3 + 3];
                px[0] = avg(px[0], rgb[0]);
                px[1] = avg(px[1], rgb[1]);
                px[2] = avg(px[2], rgb[2]);
            }
        }

        stream.write_all(&row_buf).map_err(write_err)?;
    }

    stream.finish().map_err(encode_err)
}

#[inline]
fn avg(left: u8, right: u8) -> u8 {
    ((left as u16 + right as u16) / 2) as u8
}

fn decode_err(err: png::DecodingError) -> Error {
    Error::PngInternal(err.to_string())
}

fn encode_err(err: png::EncodingError) -> Error {
    if let png::EncodingError::IoError(ref io_err) = err {
        if io_err.kind() == io::ErrorKind::OutOfMemory {
            return Error::Mem;
        }
    }
    Error::PngInternal(err.to_string())
}

/// Encoder setup failures (signature, IHDR, PLTE) map to `PngCreate`.
fn encode_create_err(err: png::EncodingError) -> Error {
    if let png::EncodingError::IoError(ref io_err) = err {
        if io_err.kind() == io::ErrorKind::OutOfMemory {
            return Error::Mem;
        }
    }
    Error::PngCreate(err.to_string())
}

fn write_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return Error::Mem;
    }
    Error::PngInternal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_pack_roundtrip() {
        for &depth in &[1u8, 2, 4] {
            let width = 13; // not a whole number of bytes
            let max = (1u16 << depth) as u8 - 1;
            let pixels: Vec<u8> = (0..width as u8).map(|i| i % (max + 1)).collect();

            let mut packed = vec![0u8; packed_row_len(width, depth)];
            pack_row(&pixels, depth, &mut packed);

            let mut unpacked = vec![0u8; width];
            unpack_row(&packed, depth, width, &mut unpacked);

            assert_eq!(unpacked, pixels, "depth {depth}");
        }
    }

    #[test]
    fn test_unpack_is_msb_first() {
        // 0b1011_0001 at depth 1 is pixels 1,0,1,1,0,0,0,1
        let mut out = vec![0u8; 8];
        unpack_row(&[0b1011_0001], 1, 8, &mut out);
        assert_eq!(out, &[1, 0, 1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_sparse_row_skips_background_blocks() {
        let col_bytes = 1;
        let background = [7u8];
        let width = SPARSE_BLOCK_PIXELS * 2 + 10;

        // first block all background, second block one outlier, tail all background
        let mut src = vec![7u8; width];
        src[SPARSE_BLOCK_PIXELS + 3] = 9;

        let mut dest = vec![0u8; width];
        copy_sparse_row(&mut dest, &src, col_bytes, &background);

        assert!(dest[..SPARSE_BLOCK_PIXELS].iter().all(|&b| b == 0));
        assert_eq!(
            &dest[SPARSE_BLOCK_PIXELS..2 * SPARSE_BLOCK_PIXELS],
            &src[SPARSE_BLOCK_PIXELS..2 * SPARSE_BLOCK_PIXELS]
        );
        assert!(dest[2 * SPARSE_BLOCK_PIXELS..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sparse_row_multibyte_pixels() {
        let col_bytes = 3;
        let background = [1u8, 2, 3];
        let pixels = SPARSE_BLOCK_PIXELS * 2;

        let mut src = Vec::with_capacity(pixels * col_bytes);
        for _ in 0..pixels {
            src.extend_from_slice(&background);
        }
        // a pixel matching the background in its first byte only
        src[4 * col_bytes..5 * col_bytes].copy_from_slice(&[1, 9, 9]);

        let mut dest = vec![0u8; src.len()];
        copy_sparse_row(&mut dest, &src, col_bytes, &background);

        let block_bytes = SPARSE_BLOCK_PIXELS * col_bytes;
        assert_eq!(&dest[..block_bytes], &src[..block_bytes]);
        assert!(dest[block_bytes..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_avg_is_pairwise() {
        // a moving average, not an arithmetic mean: later samples weigh more
        let mut acc = 0u8;
        for sample in [100u8, 200, 100] {
            acc = avg(acc, sample);
        }
        assert_eq!(acc, 112);
    }

    #[test]
    fn test_sniff() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();

        let png_path = dir.path().join("a.png");
        let mut f = File::create(&png_path).unwrap();
        f.write_all(&PNG_SIGNATURE).unwrap();
        f.write_all(b"junk").unwrap();
        assert!(sniff(&png_path).unwrap());

        let other = dir.path().join("b.dat");
        std::fs::write(&other, b"definitely not a png").unwrap();
        assert!(!sniff(&other).unwrap());

        let short = dir.path().join("c.dat");
        std::fs::write(&short, b"abc").unwrap();
        assert!(!sniff(&short).unwrap());

        assert!(matches!(
            sniff(&dir.path().join("missing.png")),
            Err(Error::ImgOpen { .. })
        ));
    }
}
