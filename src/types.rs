//! Street network records as delivered by tiles.
//!
//! Segments are undirected street polylines. References are directed
//! traversals of a segment, anchored by location references at each
//! intersection. Objects are immutable once loaded into the index.

use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};
use crate::geometry;

/// Functional road classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoadClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    Tertiary,
    Residential,
    Unclassified,
    Service,
    Other,
}

impl RoadClass {
    /// Decode the numeric road class used in tile records.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RoadClass::Motorway,
            1 => RoadClass::Trunk,
            2 => RoadClass::Primary,
            3 => RoadClass::Secondary,
            4 => RoadClass::Tertiary,
            5 => RoadClass::Residential,
            6 => RoadClass::Unclassified,
            7 => RoadClass::Service,
            _ => RoadClass::Other,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            RoadClass::Motorway => 0,
            RoadClass::Trunk => 1,
            RoadClass::Primary => 2,
            RoadClass::Secondary => 3,
            RoadClass::Tertiary => 4,
            RoadClass::Residential => 5,
            RoadClass::Unclassified => 6,
            RoadClass::Service => 7,
            RoadClass::Other => 8,
        }
    }

    /// OSM highway tag closest to this class.
    pub fn highway_tag(&self) -> &'static str {
        match self {
            RoadClass::Motorway => "motorway",
            RoadClass::Trunk => "trunk",
            RoadClass::Primary => "primary",
            RoadClass::Secondary => "secondary",
            RoadClass::Tertiary => "tertiary",
            RoadClass::Residential => "residential",
            RoadClass::Unclassified => "unclassified",
            RoadClass::Service => "service",
            RoadClass::Other => "road",
        }
    }
}

/// Physical form of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FormOfWay {
    #[default]
    Undefined,
    Motorway,
    MultipleCarriageway,
    SingleCarriageway,
    Roundabout,
    TrafficSquare,
    SlipRoad,
    Other,
}

impl FormOfWay {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FormOfWay::Undefined,
            1 => FormOfWay::Motorway,
            2 => FormOfWay::MultipleCarriageway,
            3 => FormOfWay::SingleCarriageway,
            4 => FormOfWay::Roundabout,
            5 => FormOfWay::TrafficSquare,
            6 => FormOfWay::SlipRoad,
            _ => FormOfWay::Other,
        }
    }
}

/// Direction of a reference relative to its segment's vertex order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Side of the street relative to a directed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SideOfStreet {
    Right,
    Left,
    Center,
    #[default]
    Unknown,
}

impl SideOfStreet {
    /// Classify an intercept angle measured clockwise from the line bearing.
    pub fn from_intercept_angle(angle: f64) -> Self {
        if angle < 180.0 {
            SideOfStreet::Right
        } else if angle > 180.0 {
            SideOfStreet::Left
        } else {
            SideOfStreet::Center
        }
    }

    /// Signed lateral offset for this side (positive = right).
    pub fn signed_offset(&self, offset: f64) -> Option<f64> {
        match self {
            SideOfStreet::Right => Some(offset.abs()),
            SideOfStreet::Left => Some(-offset.abs()),
            SideOfStreet::Center | SideOfStreet::Unknown => None,
        }
    }
}

/// Undirected street polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub from_intersection_id: String,
    pub to_intersection_id: String,
    pub forward_reference_id: String,
    #[serde(default)]
    pub back_reference_id: Option<String>,
    pub road_class: RoadClass,
    /// Ordered [lon, lat] vertices
    pub coordinates: Vec<[f64; 2]>,
}

impl Segment {
    pub fn line(&self) -> LineString {
        LineString::new(
            self.coordinates
                .iter()
                .map(|c| Coord { x: c[0], y: c[1] })
                .collect(),
        )
    }

    /// Segments without a back reference can only be traversed forward.
    pub fn is_oneway(&self) -> bool {
        self.back_reference_id.is_none()
    }

    /// Reference id for the given direction, if the segment supports it.
    pub fn reference_id(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Forward => Some(self.forward_reference_id.as_str()),
            Direction::Backward => self.back_reference_id.as_deref(),
        }
    }
}

/// Anchor point along a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReference {
    pub intersection_id: String,
    pub lon: f64,
    pub lat: f64,
    #[serde(default)]
    pub inbound_bearing: Option<f64>,
    #[serde(default)]
    pub outbound_bearing: Option<f64>,
    /// Centimetres to the next location reference
    #[serde(default)]
    pub distance_to_next_ref: Option<u64>,
}

impl LocationReference {
    pub fn coord(&self) -> Coord {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// Directed traversal of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub id: String,
    pub geometry_id: String,
    #[serde(default)]
    pub form_of_way: FormOfWay,
    pub location_references: Vec<LocationReference>,
}

impl Reference {
    /// Reference length in metres (distances are stored in centimetres).
    pub fn length(&self) -> f64 {
        self.location_references
            .iter()
            .filter_map(|lr| lr.distance_to_next_ref)
            .map(|cm| cm as f64 / 100.0)
            .sum()
    }

    pub fn from_intersection_id(&self) -> Option<&str> {
        self.location_references
            .first()
            .map(|lr| lr.intersection_id.as_str())
    }

    pub fn to_intersection_id(&self) -> Option<&str> {
        self.location_references
            .last()
            .map(|lr| lr.intersection_id.as_str())
    }

    /// Check the structural invariants of a decoded reference.
    pub fn validate(&self) -> Result<()> {
        if self.location_references.len() < 2 {
            return Err(MatchError::InvalidInput {
                message: format!(
                    "reference '{}' has {} location references, minimum 2 required",
                    self.id,
                    self.location_references.len()
                ),
            });
        }
        Ok(())
    }
}

/// Street intersection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intersection {
    pub id: String,
    pub lon: f64,
    pub lat: f64,
    #[serde(default)]
    pub node_id: Option<u64>,
    #[serde(default)]
    pub inbound_reference_ids: Vec<String>,
    #[serde(default)]
    pub outbound_reference_ids: Vec<String>,
}

impl Intersection {
    pub fn coord(&self) -> Coord {
        Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// Basemap metadata attached to a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub geometry_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub way_ids: Vec<u64>,
}

/// Object stored in the id index, tagged once at insert time.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexedObject {
    Segment(Segment),
    Reference(Reference),
    Intersection(Intersection),
}

impl IndexedObject {
    pub fn id(&self) -> &str {
        match self {
            IndexedObject::Segment(s) => &s.id,
            IndexedObject::Reference(r) => &r.id,
            IndexedObject::Intersection(i) => &i.id,
        }
    }
}

/// Directional description of a probe line: its endpoints, endpoint
/// bearings and length. Used to seed candidate search for direct matching.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureReference {
    pub direction: Direction,
    pub start: Coord,
    pub end: Coord,
    /// Bearing over the first 20 m of the (directed) line
    pub outbound_bearing: f64,
    /// Bearing over the last 20 m of the (directed) line
    pub inbound_bearing: f64,
    pub length: f64,
}

impl FeatureReference {
    /// Describe `line` travelled in `direction` (backward reverses it).
    pub fn from_line(line: &LineString, direction: Direction) -> Option<Self> {
        if line.0.len() < 2 {
            return None;
        }
        let directed = match direction {
            Direction::Forward => line.clone(),
            Direction::Backward => geometry::reversed(line),
        };
        Some(Self {
            direction,
            start: *directed.0.first()?,
            end: *directed.0.last()?,
            outbound_bearing: geometry::outbound_bearing(&directed)?,
            inbound_bearing: geometry::inbound_bearing(&directed)?,
            length: geometry::line_length(&directed),
        })
    }
}
