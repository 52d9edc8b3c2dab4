//! Subcommand implementations, all printing JSON to stdout

use crate::settings::{Command, LatLonRect, Settings, window};
use anyhow::{Context, bail};
use gps_trail_lib::crypt::KEY_LEN;
use gps_trail_lib::{
    ApRect, CryptKey, Direction, FileBackend, Fix, GpsContext, IndexConfig, KeyRegistry, Published, ap_rect,
    utils,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

const KEY_FILE: &str = "trail.key";
const CONFIG_FILE: &str = "config.json";
const KEY_ID: u32 = 1;

/// Longest wait for the area set worker before giving up
const QUERY_TIMEOUT: Duration = Duration::from_secs(600);

pub fn run(settings: &Settings) -> anyhow::Result<()> {
    let dir = settings.data_dir.as_path();
    let config = load_or_create_config(dir)?;
    let key = load_or_create_key(dir)?;
    let mut backend = FileBackend::open(dir)
        .with_context(|| format!("opening data directory {}", dir.display()))?;
    let context = GpsContext::open(config, KeyRegistry::new(KEY_ID, key), &mut backend)
        .context("loading the index")?;

    match &settings.command {
        Command::Ingest { file } => {
            let (fixes, malformed) = read_fixes(file)?;
            let report = context.ingest(fixes)?;
            let rows_written = context.flush(&mut backend)?;
            tracing::info!("Wrote {rows_written} rows to {}", dir.display());
            print_json(&IngestOutput {
                accepted: report.accepted,
                rejected: report.rejected,
                malformed,
                rows_written,
            })
        }
        Command::Info => print_json(&context.info()?),
        Command::Area {
            lat1,
            lon1,
            lat2,
            lon2,
            from,
            to,
        } => {
            let rect = LatLonRect {
                lat1: *lat1,
                lon1: *lon1,
                lat2: *lat2,
                lon2: *lon2,
            };
            let area = to_ap_rect(&context, &rect);
            print_json(&query(&context, vec![area], window(*from, *to))?)
        }
        Command::Path { areas, from, to } => {
            let areas = areas.iter().map(|rect| to_ap_rect(&context, rect)).collect();
            print_json(&query(&context, areas, window(*from, *to))?)
        }
        Command::Where { time, depth, after } => {
            let direction = if *after {
                Direction::EarliestAfter
            } else {
                Direction::LatestBefore
            };
            print_json(&locate(&context, *time, *depth, direction)?)
        }
    }
}

#[derive(Serialize)]
struct IngestOutput {
    accepted: usize,
    rejected: usize,
    /// Lines that could not be parsed
    malformed: usize,
    rows_written: usize,
}

#[derive(Serialize)]
struct WhereOutput {
    requested_time: i64,
    /// Nearest second the trail was recorded at
    time: i64,
    depth: u8,
    lat: f64,
    lon: f64,
    /// Side of the reported panel in meters at the equator
    panel_size_m: f64,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The stored configuration, or the default one written on first use
fn load_or_create_config(dir: &Path) -> anyhow::Result<IndexConfig> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        return serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()));
    }
    std::fs::create_dir_all(dir)?;
    let config = IndexConfig::default();
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!("Created {} with the default configuration", path.display());
    Ok(config)
}

/// The stored key, or a new random one written on first use
fn load_or_create_key(dir: &Path) -> anyhow::Result<CryptKey> {
    let path = dir.join(KEY_FILE);
    if path.exists() {
        let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let Ok(bytes) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) else {
            bail!(
                "{} holds {} bytes, expected {KEY_LEN}",
                path.display(),
                bytes.len()
            );
        };
        return Ok(CryptKey::from_bytes(bytes));
    }
    std::fs::create_dir_all(dir)?;
    let key = CryptKey::generate();
    std::fs::write(&path, key.as_bytes()).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!("Generated a new key in {}", path.display());
    Ok(key)
}

/// Parse `time_sec lat lon` lines; blank lines and `#` comments are skipped
fn read_fixes(path: &Path) -> anyhow::Result<(Vec<Fix>, usize)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut fixes = Vec::new();
    let mut malformed = 0;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_fix(line) {
            Some(fix) => fixes.push(fix),
            None => {
                tracing::warn!("{}:{}: cannot parse '{line}'", path.display(), number + 1);
                malformed += 1;
            }
        }
    }
    tracing::debug!("Read {} fixes from {}", fixes.len(), path.display());
    Ok((fixes, malformed))
}

fn parse_fix(line: &str) -> Option<Fix> {
    let mut parts = line.split_whitespace();
    let time_sec = parts.next()?.parse().ok()?;
    let lat: f64 = parts.next()?.parse().ok()?;
    let lon: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    Some(Fix { time_sec, lat, lon })
}

fn to_ap_rect(context: &GpsContext, rect: &LatLonRect) -> ApRect {
    let max_units = context.index().read().config().max_ap_units();
    let (x1, y1) = utils::wgs84_to_ap_units(rect.lat1, rect.lon1, max_units);
    let (x2, y2) = utils::wgs84_to_ap_units(rect.lat2, rect.lon2, max_units);
    ap_rect(x1, y1, x2, y2)
}

/// Run the area set worker over `areas` until the complete result is published
fn query(context: &GpsContext, areas: Vec<ApRect>, window: Option<(i64, i64)>) -> anyhow::Result<Published> {
    let set = context.selected_area_set();
    let worker = set.spawn()?;
    set.set_requested_time(window);
    set.set_areas(areas);

    let published = set.wait_for_result(QUERY_TIMEOUT);
    set.shutdown();
    if worker.join().is_err() {
        bail!("area set worker panicked");
    }
    match published {
        Some(Published { error: Some(error), .. }) => bail!("area query failed: {error}"),
        Some(published) => Ok(published),
        None => bail!("no result after {} seconds", QUERY_TIMEOUT.as_secs()),
    }
}

fn locate(context: &GpsContext, time: i64, depth: u8, direction: Direction) -> anyhow::Result<WhereOutput> {
    let index = context.index().read();
    let root = index.area_panels().get_row(index.root_panel())?;
    let Some(root_tree) = root.time_tree() else {
        bail!("the index is empty");
    };
    let nearest = index
        .time_trees()
        .get_nearest_time_point(root_tree, time, direction)?;

    let depth = depth.min(index.config().max_depth);
    let Some(ap) = index.find_area_panel_for_time(nearest, depth, direction)? else {
        bail!("no panel at depth {depth} holds time {nearest}");
    };
    let panel = index.area_panels().get_row(ap)?;
    let (x, y) = panel.center(index.widths())?;
    let max_units = index.config().max_ap_units();
    let (lat, lon) = utils::ap_units_to_wgs84(x, y, max_units);

    Ok(WhereOutput {
        requested_time: time,
        time: nearest,
        depth: panel.depth(),
        lat,
        lon,
        panel_size_m: panel.width(index.widths())? as f64 * utils::EARTH_SIZE_METERS / max_units as f64,
    })
}
