//! Tile addressing, fetching and decoding.
//!
//! Street data is partitioned into spherical-mercator tiles at zoom 12. Each
//! tile exists once per object type, so a decoded unit is addressed by
//! (source, tile id, object type, hierarchy).

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use geo::{Coord, Rect};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{LockResultExt, MatchError, Result};
use crate::geometry;
use crate::types::{Intersection, Metadata, Reference, Segment};

/// Zoom level of the street tile pyramid.
pub const TILE_ZOOM: u8 = 12;

/// Kinds of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileType {
    Reference,
    Intersection,
    Geometry,
    Metadata,
}

impl TileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileType::Reference => "reference",
            TileType::Intersection => "intersection",
            TileType::Geometry => "geometry",
            TileType::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reference" => Some(TileType::Reference),
            "intersection" => Some(TileType::Intersection),
            "geometry" => Some(TileType::Geometry),
            "metadata" => Some(TileType::Metadata),
            _ => None,
        }
    }
}

/// Tile set selection shared by every path in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileParams {
    /// Source and build, e.g. `osm/planet-181224`
    pub source: String,
    /// Road hierarchy level included in the tiles
    pub hierarchy: u8,
}

impl Default for TileParams {
    fn default() -> Self {
        Self {
            source: "osm/planet-181224".to_string(),
            hierarchy: 6,
        }
    }
}

/// Address of one decoded tile unit. Loading is idempotent per path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePath {
    pub source: String,
    pub tile_id: String,
    pub tile_type: TileType,
    pub hierarchy: u8,
}

impl TilePath {
    pub fn new(params: &TileParams, tile_id: &str, tile_type: TileType) -> Self {
        Self {
            source: params.source.clone(),
            tile_id: tile_id.to_string(),
            tile_type,
            hierarchy: params.hierarchy,
        }
    }

    /// `<source>/<tileId>.<type>.<hierarchy>.pbf`
    pub fn to_path_string(&self) -> String {
        format!("{}.pbf", self.cache_key())
    }

    /// `<source>/<tileId>.<type>.<hierarchy>`
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}.{}.{}",
            self.source,
            self.tile_id,
            self.tile_type.as_str(),
            self.hierarchy
        )
    }

    /// Parse a path produced by [`TilePath::to_path_string`].
    pub fn from_path_string(path: &str) -> Option<Self> {
        let (source, file) = path.rsplit_once('/')?;
        let mut parts = file.split('.');
        let tile_id = parts.next()?;
        let tile_type = TileType::parse(parts.next()?)?;
        let hierarchy = parts.next()?.parse().ok()?;
        if source.is_empty() || tile_id.is_empty() {
            return None;
        }
        Some(Self {
            source: source.to_string(),
            tile_id: tile_id.to_string(),
            tile_type,
            hierarchy,
        })
    }
}

/// Set of tile ids and types sharing one source/hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePathGroup {
    pub params: TileParams,
    pub tile_ids: Vec<String>,
    pub tile_types: Vec<TileType>,
}

impl TilePathGroup {
    pub fn new(params: &TileParams, tile_ids: Vec<String>) -> Self {
        let mut tile_ids = tile_ids;
        tile_ids.sort();
        tile_ids.dedup();
        Self {
            params: params.clone(),
            tile_ids,
            tile_types: Vec::new(),
        }
    }

    /// Tiles covering a point buffered by `buffer` metres.
    pub fn from_point(point: Coord, buffer: f64, params: &TileParams) -> Self {
        Self::new(params, tile_ids_for_point(point, buffer))
    }

    /// Tiles covering a rectangle buffered by `buffer` metres.
    pub fn from_rect(rect: Rect, buffer: f64, params: &TileParams) -> Self {
        Self::new(params, tile_ids_for_rect(rect, buffer))
    }

    pub fn add_type(&mut self, tile_type: TileType) {
        if !self.tile_types.contains(&tile_type) {
            self.tile_types.push(tile_type);
        }
    }

    pub fn with_types(mut self, types: &[TileType]) -> Self {
        for t in types {
            self.add_type(*t);
        }
        self
    }

    /// Every (tile id, type) path in the group.
    pub fn paths(&self) -> Vec<TilePath> {
        let mut paths = Vec::with_capacity(self.tile_ids.len() * self.tile_types.len());
        for tile_type in &self.tile_types {
            for tile_id in &self.tile_ids {
                paths.push(TilePath::new(&self.params, tile_id, *tile_type));
            }
        }
        paths
    }

    /// Sorted path strings, used for stable identities.
    pub fn path_strings(&self) -> Vec<String> {
        let mut strings: Vec<String> = self.paths().iter().map(|p| p.to_path_string()).collect();
        strings.sort();
        strings
    }
}

// ============================================================================
// Web Mercator Math
// ============================================================================

/// Convert longitude to tile X coordinate at given zoom
#[inline]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    (lon + 180.0) / 360.0 * n
}

/// Convert latitude to tile Y coordinate at given zoom
#[inline]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    let n = 2.0_f64.powi(zoom as i32);
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n
}

#[inline]
fn clamp_tile(v: f64, zoom: u8) -> u32 {
    let max = (1u32 << zoom) - 1;
    (v.floor().max(0.0) as u32).min(max)
}

/// Tile id `z-x-y` containing a coordinate.
pub fn tile_id_for_coord(c: Coord) -> String {
    format!(
        "{}-{}-{}",
        TILE_ZOOM,
        clamp_tile(lon_to_tile_x(c.x, TILE_ZOOM), TILE_ZOOM),
        clamp_tile(lat_to_tile_y(c.y, TILE_ZOOM), TILE_ZOOM)
    )
}

/// Tile ids intersecting the bounds `[min_lon, min_lat, max_lon, max_lat]`.
pub fn tile_ids_for_bounds(bounds: [f64; 4]) -> Vec<String> {
    let [min_lon, min_lat, max_lon, max_lat] = bounds;
    let min_x = clamp_tile(lon_to_tile_x(min_lon, TILE_ZOOM), TILE_ZOOM);
    let max_x = clamp_tile(lon_to_tile_x(max_lon, TILE_ZOOM), TILE_ZOOM);
    // Y grows southward
    let min_y = clamp_tile(lat_to_tile_y(max_lat, TILE_ZOOM), TILE_ZOOM);
    let max_y = clamp_tile(lat_to_tile_y(min_lat, TILE_ZOOM), TILE_ZOOM);

    let mut ids = Vec::new();
    for x in min_x..=max_x {
        for y in min_y..=max_y {
            ids.push(format!("{}-{}-{}", TILE_ZOOM, x, y));
        }
    }
    ids
}

pub fn tile_ids_for_point(point: Coord, buffer: f64) -> Vec<String> {
    if buffer > 0.0 {
        tile_ids_for_rect(geometry::buffered_envelope(point, buffer), 0.0)
    } else {
        tile_ids_for_bounds([point.x, point.y, point.x, point.y])
    }
}

pub fn tile_ids_for_rect(rect: Rect, buffer: f64) -> Vec<String> {
    let (min, max) = if buffer > 0.0 {
        let sw = geometry::buffered_envelope(rect.min(), buffer).min();
        let ne = geometry::buffered_envelope(rect.max(), buffer).max();
        (sw, ne)
    } else {
        (rect.min(), rect.max())
    };
    tile_ids_for_bounds([min.x, min.y, max.x, max.y])
}

// ============================================================================
// Decoding
// ============================================================================

/// Typed records decoded from one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    Segments(Vec<Segment>),
    References(Vec<Reference>),
    Intersections(Vec<Intersection>),
    Metadata(Vec<Metadata>),
}

impl TileData {
    pub fn len(&self) -> usize {
        match self {
            TileData::Segments(v) => v.len(),
            TileData::References(v) => v.len(),
            TileData::Intersections(v) => v.len(),
            TileData::Metadata(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tile_type(&self) -> TileType {
        match self {
            TileData::Segments(_) => TileType::Geometry,
            TileData::References(_) => TileType::Reference,
            TileData::Intersections(_) => TileType::Intersection,
            TileData::Metadata(_) => TileType::Metadata,
        }
    }

    fn empty(tile_type: TileType) -> Self {
        match tile_type {
            TileType::Geometry => TileData::Segments(Vec::new()),
            TileType::Reference => TileData::References(Vec::new()),
            TileType::Intersection => TileData::Intersections(Vec::new()),
            TileType::Metadata => TileData::Metadata(Vec::new()),
        }
    }
}

/// Turns raw tile bytes into typed records.
pub trait TileDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], tile_type: TileType) -> Result<TileData>;
}

/// Decoder for tiles stored as JSON arrays of records.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTileDecoder;

impl JsonTileDecoder {
    pub fn encode(data: &TileData) -> Result<Vec<u8>> {
        let bytes = match data {
            TileData::Segments(v) => serde_json::to_vec(v)?,
            TileData::References(v) => serde_json::to_vec(v)?,
            TileData::Intersections(v) => serde_json::to_vec(v)?,
            TileData::Metadata(v) => serde_json::to_vec(v)?,
        };
        Ok(bytes)
    }
}

impl TileDecoder for JsonTileDecoder {
    fn decode(&self, bytes: &[u8], tile_type: TileType) -> Result<TileData> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(TileData::empty(tile_type));
        }
        let decode_err = |e: serde_json::Error| MatchError::TileDecode {
            path: tile_type.as_str().to_string(),
            message: e.to_string(),
        };
        let data = match tile_type {
            TileType::Geometry => TileData::Segments(serde_json::from_slice(bytes).map_err(decode_err)?),
            TileType::Reference => {
                TileData::References(serde_json::from_slice(bytes).map_err(decode_err)?)
            }
            TileType::Intersection => {
                TileData::Intersections(serde_json::from_slice(bytes).map_err(decode_err)?)
            }
            TileType::Metadata => TileData::Metadata(serde_json::from_slice(bytes).map_err(decode_err)?),
        };
        Ok(data)
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Supplies raw tile bytes. A tile that does not exist is empty, not an error.
pub trait TileSource: Send + Sync {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>>;
}

impl<T: TileSource + ?Sized> TileSource for Arc<T> {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>> {
        (**self).fetch(path)
    }
}

/// In-process tile store.
#[derive(Debug, Default)]
pub struct MemoryTileSource {
    tiles: RwLock<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryTileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &TilePath, bytes: Vec<u8>) {
        if let Ok(mut tiles) = self.tiles.write() {
            tiles.insert(path.cache_key(), bytes);
        }
    }

    /// Store typed records, JSON-encoded.
    pub fn insert_data(&self, path: &TilePath, data: &TileData) -> Result<()> {
        self.insert(path, JsonTileDecoder::encode(data)?);
        Ok(())
    }

    /// Number of fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl TileSource for MemoryTileSource {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let tiles = self.tiles.read().or_poisoned("tile store")?;
        Ok(tiles.get(&path.cache_key()).cloned().unwrap_or_default())
    }
}

/// Tiles read from a directory laid out by cache key.
#[derive(Debug, Clone)]
pub struct DirectoryTileSource {
    root: PathBuf,
}

impl DirectoryTileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TileSource for DirectoryTileSource {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>> {
        let file = self.root.join(path.cache_key());
        match fs::read(&file) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(MatchError::TileFetch {
                path: file.display().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// On-disk cache in front of another source.
///
/// Entries live at `<dir>/<source>/<tileId>.<type>.<hierarchy>`. A miss
/// fetches from the inner source and persists the bytes before returning.
pub struct CachedTileSource<S: TileSource> {
    inner: S,
    dir: PathBuf,
}

impl<S: TileSource> CachedTileSource<S> {
    pub fn new(inner: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    pub fn cache_path(&self, path: &TilePath) -> PathBuf {
        self.dir.join(path.cache_key())
    }

    /// Sibling of `file` with `.tmp` appended, keeping the hierarchy suffix.
    fn temp_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn persist(file: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so readers never see a partial tile
        let tmp = Self::temp_path(file);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, file)
    }
}

impl<S: TileSource> TileSource for CachedTileSource<S> {
    fn fetch(&self, path: &TilePath) -> Result<Vec<u8>> {
        let file = self.cache_path(path);
        if let Ok(bytes) = fs::read(&file) {
            debug!("[TileCache] hit {}", path.cache_key());
            return Ok(bytes);
        }

        let bytes = self.inner.fetch(path)?;
        Self::persist(&file, &bytes).map_err(|e| MatchError::TileFetch {
            path: file.display().to_string(),
            message: format!("failed to persist tile: {}", e),
        })?;
        debug!("[TileCache] stored {} ({} bytes)", path.cache_key(), bytes.len());
        Ok(bytes)
    }
}
