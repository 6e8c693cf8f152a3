//! # Routable Graph
//!
//! Builds a mode-filtered routing graph for one extent, hands it to an
//! external [`RoutingEngine`], and answers HMM trace matches by translating
//! the engine's node sequences back into street references.
//!
//! ## Lifecycle
//!
//! `Unbuilt → Building → Ready`, or `Building → Failed`. Match queries in any
//! state other than `Ready` fail with [`MatchError::GraphNotBuilt`].
//!
//! ## Cache layout
//!
//! Everything lives under `<cache_dir>/<identity>/`, where the identity is a
//! SHA-256 over the covered tile paths and the travel mode:
//! - `routing/` - the engine's index
//! - `bridge.db` - the [`BridgeStore`]
//!
//! A graph whose routing index and bridge store already exist is opened
//! without re-deriving nodes and edges. Builds for the same identity are
//! serialised process-wide so only one writer touches the directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use geo::{Coord, Geometry, LineString, Rect};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::candidates::PointCandidate;
use crate::engine::{EdgeRecord, NodeRecord, RoutingEngine, RoutingIndex};
use crate::error::{LockResultExt, MatchError, Result};
use crate::geometry;
use crate::matching::{Matcher, PathCandidate};
use crate::persistence::{intersection_key, node_key, pair_key, BridgeStore};
use crate::tile_index::TileIndex;
use crate::tiles::{TilePathGroup, TileType};
use crate::types::{Direction, RoadClass, Segment};
use crate::MatchConfig;

/// Buffer around the extent when selecting tiles (metres).
const EXTENT_BUFFER: f64 = 1000.0;

/// Per-identity build locks shared by every graph in the process.
static BUILD_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn build_lock(identity: &str) -> Result<Arc<Mutex<()>>> {
    let mut locks = BUILD_LOCKS.lock().or_poisoned("build lock table")?;
    Ok(locks
        .entry(identity.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

// ============================================================================
// Travel Modes
// ============================================================================

/// Travel mode a graph is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphMode {
    CarAll,
    CarSurfaceOnly,
    CarMotorwayOnly,
    Bike,
    Pedestrian,
}

impl GraphMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphMode::CarAll => "car-all",
            GraphMode::CarSurfaceOnly => "car-surface-only",
            GraphMode::CarMotorwayOnly => "car-motorway-only",
            GraphMode::Bike => "bike",
            GraphMode::Pedestrian => "ped",
        }
    }

    /// Whether segments of this class are routable in this mode.
    pub fn allows(&self, road_class: RoadClass) -> bool {
        match self {
            GraphMode::CarAll => road_class != RoadClass::Other,
            GraphMode::CarSurfaceOnly => {
                road_class != RoadClass::Other && road_class != RoadClass::Motorway
            }
            GraphMode::CarMotorwayOnly => road_class == RoadClass::Motorway,
            GraphMode::Bike | GraphMode::Pedestrian => road_class != RoadClass::Motorway,
        }
    }

    /// Tags handed to the routing engine for an edge of this class.
    pub fn edge_tags(&self, road_class: RoadClass) -> Vec<(String, String)> {
        let mut tags = vec![("highway".to_string(), road_class.highway_tag().to_string())];
        match self {
            GraphMode::Bike => tags.push(("bicycle".to_string(), "yes".to_string())),
            GraphMode::Pedestrian => tags.push(("foot".to_string(), "yes".to_string())),
            _ => {}
        }
        tags
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Observable build state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphState {
    Unbuilt,
    Building,
    Ready,
    Failed(String),
}

impl GraphState {
    pub fn name(&self) -> &'static str {
        match self {
            GraphState::Unbuilt => "unbuilt",
            GraphState::Building => "building",
            GraphState::Ready => "ready",
            GraphState::Failed(_) => "failed",
        }
    }
}

struct GraphInner {
    state: GraphState,
    routing: Option<Box<dyn RoutingIndex>>,
    bridge: Option<BridgeStore>,
}

/// Nodes, edges and bridge entries derived from indexed segments.
struct Assembly {
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    intersections: Vec<(String, u64)>,
    pairs: Vec<(String, Vec<String>)>,
}

/// Routable graph for one extent and travel mode.
pub struct Graph {
    identity: String,
    extent: Rect,
    mode: GraphMode,
    tiles: TilePathGroup,
    dir: PathBuf,
    index: Arc<TileIndex>,
    engine: Arc<dyn RoutingEngine>,
    matcher: Matcher,
    inner: RwLock<GraphInner>,
}

impl Graph {
    pub fn new(
        extent: Rect,
        mode: GraphMode,
        index: Arc<TileIndex>,
        engine: Arc<dyn RoutingEngine>,
        cache_dir: impl AsRef<Path>,
        config: MatchConfig,
    ) -> Result<Self> {
        let tiles = TilePathGroup::from_rect(extent, EXTENT_BUFFER, index.params())
            .with_types(&[TileType::Geometry, TileType::Reference]);
        let identity = graph_identity(&tiles.path_strings(), mode);
        let dir = cache_dir.as_ref().join(&identity);
        let matcher = Matcher::new(index.clone(), config)?;

        Ok(Self {
            identity,
            extent,
            mode,
            tiles,
            dir,
            index,
            engine,
            matcher,
            inner: RwLock::new(GraphInner {
                state: GraphState::Unbuilt,
                routing: None,
                bridge: None,
            }),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    pub fn extent(&self) -> Rect {
        self.extent
    }

    /// Directory holding the routing index and bridge store.
    pub fn cache_path(&self) -> &Path {
        &self.dir
    }

    pub fn tile_paths(&self) -> Vec<String> {
        self.tiles.path_strings()
    }

    pub fn state(&self) -> GraphState {
        self.inner
            .read()
            .map(|inner| inner.state.clone())
            .unwrap_or_else(|_| GraphState::Failed("graph lock poisoned".to_string()))
    }

    fn set_state(&self, state: GraphState) {
        if let Ok(mut inner) = self.inner.write() {
            inner.state = state;
        }
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Build or open the graph. A no-op once `Ready`.
    pub fn build(&self) -> Result<()> {
        if self.state() == GraphState::Ready {
            return Ok(());
        }

        let lock = build_lock(&self.identity)?;
        let _guard = lock.lock().or_poisoned("build")?;
        // Another caller may have finished while this one waited
        if self.state() == GraphState::Ready {
            return Ok(());
        }

        self.set_state(GraphState::Building);
        let started = Instant::now();

        match self.build_locked() {
            Ok((routing, bridge)) => {
                let mut inner = self.inner.write().or_poisoned("graph")?;
                inner.routing = Some(routing);
                inner.bridge = Some(bridge);
                inner.state = GraphState::Ready;
                info!(
                    "[Graph] {} ready in {:.2?} ({})",
                    self.identity,
                    started.elapsed(),
                    self.mode.as_str()
                );
                Ok(())
            }
            Err(e) => {
                let message = match &e {
                    MatchError::RoutingEngineFailure { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                warn!("[Graph] Build of {} failed: {}", self.identity, message);
                self.set_state(GraphState::Failed(message.clone()));
                Err(MatchError::RoutingEngineFailure {
                    identity: self.identity.clone(),
                    path: self.dir.display().to_string(),
                    message,
                })
            }
        }
    }

    fn build_locked(&self) -> Result<(Box<dyn RoutingIndex>, BridgeStore)> {
        fs::create_dir_all(&self.dir)?;
        let routing_dir = self.dir.join("routing");
        let bridge_path = self.dir.join("bridge.db");

        // Queries resolve references through the index either way
        self.index.index_tiles(&self.tiles)?;

        if self.engine.index_exists(&routing_dir) {
            let bridge = BridgeStore::open(&bridge_path)?;
            if bridge.is_complete() {
                info!("[Graph] Opening cached graph {}", self.identity);
                let routing = self.engine.open_index(&routing_dir)?;
                return Ok((routing, bridge));
            }
            warn!(
                "[Graph] Bridge store for {} is incomplete, rebuilding",
                self.identity
            );
        }

        if bridge_path.exists() {
            fs::remove_file(&bridge_path)?;
        }
        let bridge = BridgeStore::open(&bridge_path)?;

        let assembly = self.assemble(&bridge)?;
        info!(
            "[Graph] Building {} with {} nodes and {} edges",
            self.identity,
            assembly.nodes.len(),
            assembly.edges.len()
        );

        let node_entries: Vec<(String, NodeRecord)> = assembly
            .nodes
            .iter()
            .map(|n| (node_key(n.id), n.clone()))
            .collect();
        let intersection_entries: Vec<(String, u64)> = assembly
            .intersections
            .iter()
            .map(|(id, node)| (intersection_key(id), *node))
            .collect();
        bridge.put_many(&node_entries)?;
        bridge.put_many(&intersection_entries)?;
        bridge.put_many(&assembly.pairs)?;

        self.engine
            .build_index(&routing_dir, &assembly.nodes, &assembly.edges)?;
        let routing = self.engine.open_index(&routing_dir)?;
        bridge.mark_complete()?;
        Ok((routing, bridge))
    }

    /// Segments inside the buffered extent that the mode can travel.
    fn eligible_segments(&self) -> Result<Vec<Segment>> {
        let min = geometry::buffered_envelope(self.extent.min(), EXTENT_BUFFER).min();
        let max = geometry::buffered_envelope(self.extent.max(), EXTENT_BUFFER).max();
        let buffered = Rect::new(min, max);

        let segments = self
            .index
            .intersects(buffered, TileType::Geometry)?
            .into_iter()
            .filter_map(|feature| self.index.segment(&feature.id))
            .filter(|segment| self.mode.allows(segment.road_class))
            .collect();
        Ok(segments)
    }

    fn assemble(&self, bridge: &BridgeStore) -> Result<Assembly> {
        let mut next_node: u64 = 1;
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut intersection_nodes: HashMap<String, u64> = HashMap::new();
        let mut pairs: BTreeMap<String, Vec<String>> = BTreeMap::new();

        let mut new_node = |c: &[f64; 2], nodes: &mut Vec<NodeRecord>| {
            let id = next_node;
            next_node += 1;
            nodes.push(NodeRecord {
                id,
                lon: c[0],
                lat: c[1],
            });
            id
        };

        for segment in self.eligible_segments()? {
            let coords = &segment.coordinates;
            if coords.len() < 2 {
                continue;
            }
            let last = coords.len() - 1;

            let mut node_ids = Vec::with_capacity(coords.len());
            for (i, c) in coords.iter().enumerate() {
                let intersection_id = if i == 0 {
                    Some(&segment.from_intersection_id)
                } else if i == last {
                    Some(&segment.to_intersection_id)
                } else {
                    None
                };

                let id = match intersection_id {
                    Some(iid) => {
                        let known = intersection_nodes
                            .get(iid)
                            .copied()
                            .or_else(|| bridge.intersection_node(iid));
                        match known {
                            Some(id) => id,
                            None => {
                                let id = new_node(c, &mut nodes);
                                intersection_nodes.insert(iid.clone(), id);
                                id
                            }
                        }
                    }
                    None => new_node(c, &mut nodes),
                };
                node_ids.push(id);
            }

            for w in node_ids.windows(2) {
                push_unique(
                    pairs.entry(pair_key(w[0], w[1])).or_default(),
                    &segment.forward_reference_id,
                );
                if let Some(back) = &segment.back_reference_id {
                    push_unique(pairs.entry(pair_key(w[1], w[0])).or_default(), back);
                }
            }

            edges.push(EdgeRecord {
                id: edges.len() as u64 + 1,
                nodes: node_ids,
                oneway: segment.is_oneway(),
                tags: self.mode.edge_tags(segment.road_class),
            });
        }

        let mut intersections: Vec<(String, u64)> = intersection_nodes.into_iter().collect();
        intersections.sort();

        Ok(Assembly {
            nodes,
            edges,
            intersections,
            pairs: pairs.into_iter().collect(),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn not_built(&self, state: &GraphState) -> MatchError {
        MatchError::GraphNotBuilt {
            identity: self.identity.clone(),
            state: state.name().to_string(),
        }
    }

    /// HMM match of a coordinate trace.
    ///
    /// Returns `Ok(None)` when the engine finds no matching, reports zero
    /// confidence, or fails during the query.
    pub fn match_trace(&self, trace: &LineString) -> Result<Option<PathCandidate>> {
        let inner = self.inner.read().or_poisoned("graph")?;
        let (routing, bridge) = match (&inner.state, &inner.routing, &inner.bridge) {
            (GraphState::Ready, Some(routing), Some(bridge)) => (routing, bridge),
            (state, _, _) => return Err(self.not_built(state)),
        };

        if trace.0.len() < 2 {
            return Err(MatchError::InvalidInput {
                message: format!("trace needs at least 2 coordinates, got {}", trace.0.len()),
            });
        }

        let coordinates: Vec<[f64; 2]> = trace.0.iter().map(|c| [c.x, c.y]).collect();
        let radii = vec![self.matcher.config().search_radius; coordinates.len()];

        let response = match routing.match_trace(&coordinates, &radii) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("[Graph] Match query on {} failed: {}", self.identity, e);
                return Ok(None);
            }
        };
        let Some(best) = response.best() else {
            debug!("[Graph] No confident matching for {} points", coordinates.len());
            return Ok(None);
        };

        let mut nodes: Vec<u64> = best.legs.iter().flat_map(|leg| leg.nodes.iter().copied()).collect();
        nodes.dedup();

        let mut seen = HashSet::new();
        let mut reference_ids = Vec::new();
        for w in nodes.windows(2) {
            for reference_id in bridge.pair_references(w[0], w[1]) {
                if seen.insert(reference_id.clone()) {
                    reference_ids.push(reference_id);
                }
            }
        }
        if reference_ids.is_empty() {
            debug!("[Graph] Matched nodes map to no references");
            return Ok(None);
        }

        Ok(self
            .matcher
            .assemble_trace(trace, &reference_ids, best.confidence))
    }

    /// HMM match of a line or multi-line geometry.
    ///
    /// Multi-line parts are joined in order into one trace.
    pub fn match_geom(&self, geometry: &Geometry) -> Result<Option<PathCandidate>> {
        match geometry {
            Geometry::LineString(line) => self.match_trace(line),
            Geometry::MultiLineString(lines) => {
                let mut coords: Vec<Coord> = lines.0.iter().flat_map(|l| l.0.iter().copied()).collect();
                coords.dedup();
                self.match_trace(&LineString::new(coords))
            }
            _ => Err(MatchError::InvalidInput {
                message: "trace matching needs a line geometry".to_string(),
            }),
        }
    }

    /// Best point candidate, once the graph is ready.
    pub fn match_point(&self, point: Coord, bearing: Option<f64>) -> Result<Option<PointCandidate>> {
        let state = self.state();
        if state != GraphState::Ready {
            return Err(self.not_built(&state));
        }
        self.matcher.match_point(point, bearing)
    }

    pub fn direction_for_reference(&self, reference_id: &str) -> Option<Direction> {
        self.index.direction_for_reference(reference_id)
    }

    pub fn from_intersection_id_for_reference(&self, reference_id: &str) -> Option<String> {
        self.index.from_intersection_id(reference_id)
    }

    pub fn to_intersection_id_for_reference(&self, reference_id: &str) -> Option<String> {
        self.index.to_intersection_id(reference_id)
    }

    /// Routing node recorded for an intersection, once ready.
    pub fn node_for_intersection(&self, intersection_id: &str) -> Option<u64> {
        let inner = self.inner.read().ok()?;
        inner.bridge.as_ref()?.intersection_node(intersection_id)
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}

/// Hex SHA-256 of the sorted tile paths and the travel mode.
pub fn graph_identity(tile_paths: &[String], mode: GraphMode) -> String {
    let mut sorted = tile_paths.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(sorted.join(" ").as_bytes());
    hasher.update(b"|");
    hasher.update(mode.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}
