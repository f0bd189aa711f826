//! pngtile - cache and tile large PNG images from the command line.
//!
//! Opens each given image, reports its cache status, updates the cache
//! when needed, prints image info, and optionally renders one tile.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pngtile::{CacheStatus, Image, ImageInfo, ImageParams, TileParams};

#[derive(Parser)]
#[command(name = "pngtile")]
#[command(version, about = "Tile-based access to large PNG images")]
#[command(long_about = "
Open each of the given PNG images, check its cache status, update the
cache when stale, display image info, and optionally render a tile.

Examples:
  pngtile map.png                         # build/refresh map.cache
  pngtile -B 0xffffff00 map.png           # sparse cache, white background
  pngtile -W 256 -H 256 -x 512 -y 512 map.png -o tile.png
  pngtile -W 256 -H 256 -z 2 map.png -o - > tile.png
  pngtile -W 256 -H 256 --benchmark 1000 --randomize map.png
")]
struct Cli {
    /// Image files to process
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Suppress informational output
    #[arg(short, long)]
    quiet: bool,

    /// Display more informational output
    #[arg(short, long)]
    verbose: bool,

    /// Equivalent to --verbose
    #[arg(short = 'D', long)]
    debug: bool,

    /// Unconditionally update image caches
    #[arg(short = 'U', long)]
    force_update: bool,

    /// Do not update image caches
    #[arg(short = 'N', long)]
    no_update: bool,

    /// Background pattern for sparse caches: 0xHH.. (up to 4 bytes)
    #[arg(short = 'B', long, value_parser = parse_background)]
    background: Option<[u8; 4]>,

    /// Tile width
    #[arg(short = 'W', long, default_value_t = 0)]
    width: u32,

    /// Tile height
    #[arg(short = 'H', long, default_value_t = 0)]
    height: u32,

    /// Tile x offset
    #[arg(short = 'x', long, default_value_t = 0)]
    x: u32,

    /// Tile y offset
    #[arg(short = 'y', long, default_value_t = 0)]
    y: u32,

    /// Downsampling factor, as a power of two
    #[arg(short = 'z', long, default_value_t = 0)]
    zoom: i32,

    /// Tile output path, '-' for stdout
    #[arg(short = 'o', long)]
    out: Option<PathBuf>,

    /// Render the tile repeatedly and report throughput
    #[arg(long, value_name = "N")]
    benchmark: Option<u32>,

    /// Randomize the tile origin for every benchmark iteration
    #[arg(long)]
    randomize: bool,
}

/// Parse `0xHHHHHHHH` into a background pixel, left-aligned, missing
/// trailing bytes zero.
fn parse_background(value: &str) -> std::result::Result<[u8; 4], String> {
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("expected 0xHH.. hex value, got '{value}'"))?;

    if hex.is_empty() || hex.len() > 8 || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("expected 1 to 4 hex bytes, got '{value}'"));
    }

    let mut pixel = [0u8; 4];
    for (at, px) in pixel.iter_mut().enumerate().take(hex.len() / 2) {
        *px = u8::from_str_radix(&hex[at * 2..at * 2 + 2], 16)
            .map_err(|e| format!("bad hex in '{value}': {e}"))?;
    }
    Ok(pixel)
}

/// Map -q/-v/-D onto a tracing filter; RUST_LOG wins when set.
fn init_tracing(cli: &Cli) {
    let filter = if cli.quiet {
        "warn"
    } else if cli.verbose || cli.debug {
        "debug"
    } else {
        "info"
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // tile output may go to stdout; diagnostics stay on stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut failed = false;
    for path in &cli.images {
        if let Err(e) = process_image(path, &cli) {
            eprintln!("pngtile: {}: {:#}", path.display(), e);
            failed = true;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn process_image(path: &Path, cli: &Cli) -> Result<()> {
    let mut image = Image::for_source(path)?;

    let status = image.status(path)?;
    debug!(image = %path.display(), ?status, "cache status");

    if status != CacheStatus::Fresh || cli.force_update {
        if cli.no_update {
            warn!(image = %path.display(), "cache is not fresh, update suppressed");
        } else {
            let params = ImageParams {
                background_pixel: cli.background,
            };
            image.update(path, &params).context("cache update")?;
            info!(cache = %image.cache_path().display(), "cache updated");
        }
    }

    let image_info = image.info(path).context("cache info")?;
    info!(
        image = %path.display(),
        width = image_info.width,
        height = image_info.height,
        bpp = image_info.bpp,
        cache_bytes = image_info.cache.bytes,
        cache_blocks = image_info.cache.blocks,
        cache_version = image_info.cache.version,
        "image"
    );

    if cli.width > 0 && cli.height > 0 {
        image.open().context("open cache")?;

        let params = TileParams {
            width: cli.width,
            height: cli.height,
            x: cli.x,
            y: cli.y,
            zoom: cli.zoom,
        };

        if let Some(iterations) = cli.benchmark {
            run_benchmark(&image, &image_info, params, iterations, cli.randomize)?;
        } else {
            render_tile(&image, path, &params, cli.out.as_deref())?;
        }
    }

    Ok(())
}

fn render_tile(
    image: &Image,
    source: &Path,
    params: &TileParams,
    out: Option<&Path>,
) -> Result<()> {
    if out == Some(Path::new("-")) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        image.tile_file(params, &mut lock).context("render tile")?;
        return Ok(());
    }

    let out_path = match out {
        Some(path) => path.to_path_buf(),
        None => source.with_extension("tile.png"),
    };

    let mut file =
        File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?;
    image.tile_file(params, &mut file).context("render tile")?;
    file.flush()?;

    info!(
        tile = %out_path.display(),
        width = params.width,
        height = params.height,
        x = params.x,
        y = params.y,
        zoom = params.zoom,
        "tile rendered"
    );

    Ok(())
}

fn run_benchmark(
    image: &Image,
    image_info: &ImageInfo,
    params: TileParams,
    iterations: u32,
    randomize: bool,
) -> Result<()> {
    let mut rng = rand::rng();
    let mut total_bytes = 0u64;

    let start = Instant::now();
    for _ in 0..iterations {
        let mut tile = params;
        if randomize {
            tile.x = rng.random_range(0..image_info.width);
            tile.y = rng.random_range(0..image_info.height);
        }
        total_bytes += image.tile_mem(&tile)?.len() as u64;
    }
    let elapsed = start.elapsed();

    info!(
        iterations,
        total_bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        tiles_per_sec = iterations as f64 / elapsed.as_secs_f64(),
        "benchmark"
    );

    Ok(())
}
