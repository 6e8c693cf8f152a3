//! Bounded path search over the reference graph.
//!
//! Intersections are vertices and references are directed edges weighted by
//! their length. The search enumerates simple paths from a start reference to
//! an end reference whose length falls inside a tolerance window around the
//! probe length, pruning branches that cannot reach the end point in budget.

use std::collections::{HashMap, HashSet};

use geo::Coord;
use log::debug;

use crate::geometry;
use crate::types::Reference;

/// Maximum edge expansions for one search.
const MAX_EXPANSIONS: usize = 10_000;

/// Maximum number of references in one path.
const MAX_DEPTH: usize = 256;

/// Directed reference edge between two intersections.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub reference_id: String,
    pub from: String,
    pub to: String,
    /// Reference length in metres
    pub length: f64,
    /// Coordinate of the `from` intersection
    pub start: Coord,
}

/// Search request between two partially traversed references.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub start_reference: &'a str,
    /// Metres along the start reference where the path begins
    pub start_location: f64,
    pub end_reference: &'a str,
    /// Metres along the end reference where the path ends
    pub end_location: f64,
    pub end_coord: Coord,
    /// Expected path length in metres
    pub target_length: f64,
    /// Allowed relative deviation from `target_length`
    pub tolerance: f64,
}

/// A path found by [`ReferenceGraph::find_route`].
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub reference_ids: Vec<String>,
    /// Metres travelled, counting partial start/end references
    pub length: f64,
}

/// Adjacency over loaded references.
#[derive(Debug, Default, Clone)]
pub struct ReferenceGraph {
    outgoing: HashMap<String, Vec<GraphEdge>>,
    by_reference: HashMap<String, GraphEdge>,
}

struct Search<'a, 'r> {
    graph: &'a ReferenceGraph,
    request: &'a RouteRequest<'r>,
    min: f64,
    max: f64,
    budget: usize,
    path: Vec<String>,
    visited: HashSet<String>,
    results: Vec<Route>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference as an edge. Re-adding the same id is a no-op.
    pub fn add_reference(&mut self, reference: &Reference) {
        if self.by_reference.contains_key(&reference.id) {
            return;
        }
        let (Some(first), Some(last)) = (
            reference.location_references.first(),
            reference.location_references.last(),
        ) else {
            return;
        };
        if reference.location_references.len() < 2 {
            return;
        }

        let edge = GraphEdge {
            reference_id: reference.id.clone(),
            from: first.intersection_id.clone(),
            to: last.intersection_id.clone(),
            length: reference.length(),
            start: first.coord(),
        };
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .push(edge.clone());
        self.by_reference.insert(reference.id.clone(), edge);
    }

    pub fn edge_count(&self) -> usize {
        self.by_reference.len()
    }

    pub fn edge(&self, reference_id: &str) -> Option<&GraphEdge> {
        self.by_reference.get(reference_id)
    }

    /// Best path from the start reference to the end reference.
    ///
    /// Among paths whose length lies within `target·(1 ± tolerance)`, returns
    /// the one minimising `|target / length − 1|`.
    pub fn find_route(&self, request: &RouteRequest<'_>) -> Option<Route> {
        if request.start_reference == request.end_reference {
            return None;
        }
        let start = self.by_reference.get(request.start_reference)?;
        if !self.by_reference.contains_key(request.end_reference) {
            return None;
        }

        let mut search = Search {
            graph: self,
            request,
            min: request.target_length * (1.0 - request.tolerance),
            max: request.target_length * (1.0 + request.tolerance),
            budget: MAX_EXPANSIONS,
            path: vec![start.reference_id.clone()],
            visited: HashSet::from([start.from.clone(), start.to.clone()]),
            results: Vec::new(),
        };

        let initial = (start.length - request.start_location).max(0.0);
        search.expand(&start.to, initial);

        if search.budget == 0 {
            debug!(
                "[RouteSearch] expansion budget exhausted between {} and {}",
                request.start_reference, request.end_reference
            );
        }

        let target = request.target_length;
        search
            .results
            .into_iter()
            .filter(|r| r.length > 0.0)
            .min_by(|a, b| {
                let da = (target / a.length - 1.0).abs();
                let db = (target / b.length - 1.0).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

impl Search<'_, '_> {
    fn expand(&mut self, node: &str, cost: f64) {
        if self.budget == 0 || self.path.len() >= MAX_DEPTH {
            return;
        }
        self.budget -= 1;

        let Some(edges) = self.graph.outgoing.get(node) else {
            return;
        };

        for edge in edges {
            if edge.reference_id == self.request.end_reference {
                let total = cost + self.request.end_location;
                if total >= self.min && total <= self.max {
                    let mut reference_ids = self.path.clone();
                    reference_ids.push(edge.reference_id.clone());
                    self.results.push(Route {
                        reference_ids,
                        length: total,
                    });
                }
                continue;
            }

            if edge.reference_id == self.request.start_reference || self.visited.contains(&edge.to)
            {
                continue;
            }

            // Straight-line distance is a lower bound on what remains
            let remaining = geometry::distance(edge.start, self.request.end_coord);
            if cost + remaining > self.max {
                continue;
            }

            let next_cost = cost + edge.length;
            if next_cost > self.max {
                continue;
            }

            self.path.push(edge.reference_id.clone());
            self.visited.insert(edge.to.clone());
            self.expand(&edge.to, next_cost);
            self.visited.remove(&edge.to);
            self.path.pop();
        }
    }
}
