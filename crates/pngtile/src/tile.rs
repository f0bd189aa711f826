//! Tile parameters and output sinks.
//!
//! A [`Tile`] pairs the requested region with one of two output sinks:
//! a borrowed byte stream (flushed but never closed), or an owned
//! in-memory buffer that the caller takes back after the render.

use std::io::{self, Write};

use crate::cache::CacheStore;
use crate::error::{Error, Result};

/// Initial capacity of the in-memory tile buffer.
const TILE_BUF_SIZE: usize = 16 * 1024;

/// A rectangular region of the source image to render.
///
/// The tile may extend past the right and bottom image edges (the
/// overhang is filled), but its origin must lie inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Left edge, in source image coordinates.
    pub x: u32,
    /// Top edge, in source image coordinates.
    pub y: u32,
    /// Downsampling exponent: the tile covers `2^zoom` source pixels per
    /// output pixel. Zero renders unscaled; negative values (upscaling)
    /// are rejected.
    pub zoom: i32,
}

/// Growable output buffer for in-memory tile rendering.
///
/// Starts at 16 KiB and doubles whenever an append would overflow the
/// current capacity. Allocation failures surface as [`Error::Mem`]
/// instead of aborting.
#[derive(Debug)]
pub struct MemBuf {
    buf: Vec<u8>,
}

impl MemBuf {
    /// Allocate an empty buffer with the initial capacity.
    pub fn new() -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(TILE_BUF_SIZE).map_err(|_| Error::Mem)?;
        Ok(Self { buf })
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let needed = self.buf.len().checked_add(data.len()).ok_or(Error::Mem)?;

        if needed > self.buf.capacity() {
            let mut target = self.buf.capacity().max(TILE_BUF_SIZE);
            while target < needed {
                target = target.checked_mul(2).ok_or(Error::Mem)?;
            }
            self.buf
                .try_reserve_exact(target - self.buf.len())
                .map_err(|_| Error::Mem)?;
        }

        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the written bytes out of the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for MemBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data).map_err(|_| {
            io::Error::new(io::ErrorKind::OutOfMemory, "tile buffer allocation failed")
        })?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where a rendered tile goes.
pub enum TileSink<'a> {
    /// A borrowed byte stream. Flushed after the final row, never
    /// closed; the caller keeps ownership.
    Stream(&'a mut dyn Write),
    /// An owned growable buffer.
    Mem(MemBuf),
}

/// A tile render in progress: region parameters plus the output sink.
pub struct Tile<'a> {
    params: TileParams,
    sink: TileSink<'a>,
}

impl<'a> Tile<'a> {
    /// Render into a borrowed stream.
    pub fn to_stream(params: TileParams, out: &'a mut dyn Write) -> Self {
        Self {
            params,
            sink: TileSink::Stream(out),
        }
    }

    /// Render into an owned memory buffer.
    pub fn to_mem(params: TileParams) -> Result<Self> {
        Ok(Self {
            params,
            sink: TileSink::Mem(MemBuf::new()?),
        })
    }

    /// The tile's region parameters.
    pub fn params(&self) -> &TileParams {
        &self.params
    }

    /// Render this tile from an open cache.
    ///
    /// Any number of renders may run against the same open cache
    /// concurrently; the store hands out shared references only.
    pub fn render(&mut self, cache: &CacheStore) -> Result<()> {
        if self.params.width == 0 || self.params.height == 0 {
            return Err(Error::TileDim);
        }

        match &mut self.sink {
            TileSink::Stream(out) => {
                cache.render_tile(&self.params, out)?;
                out.flush().map_err(|e| Error::PngInternal(e.to_string()))
            }
            TileSink::Mem(buf) => cache.render_tile(&self.params, buf),
        }
    }

    /// Take the rendered bytes out of a memory-sink tile.
    pub fn into_mem(self) -> Option<Vec<u8>> {
        match self.sink {
            TileSink::Stream(_) => None,
            TileSink::Mem(buf) => Some(buf.into_vec()),
        }
    }
}
