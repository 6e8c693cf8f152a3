//! Geometry utilities over lon/lat polylines.
//!
//! Distances are great-circle metres (`geo::Haversine`). Operations that need
//! planar math (projection onto a segment, lateral offsets) work in a local
//! equirectangular frame anchored near the geometry, which is accurate at
//! street scale.
//!
//! Lateral offsets follow one convention throughout the crate: a positive
//! offset moves geometry to the right of its direction of travel.

use geo::{Coord, Distance, Haversine, LineString, Point, Rect};

/// Mean earth radius used by `geo::Haversine`.
pub const EARTH_RADIUS: f64 = 6_371_008.8;

/// Length of the window used to sample inbound/outbound bearings.
pub const BEARING_SAMPLE_DISTANCE: f64 = 20.0;

/// Metres per degree of latitude.
#[inline]
fn metres_per_degree() -> f64 {
    EARTH_RADIUS * std::f64::consts::PI / 180.0
}

/// Great-circle distance between two coordinates in metres.
#[inline]
pub fn distance(a: Coord, b: Coord) -> f64 {
    Haversine::distance(Point::from(a), Point::from(b))
}

/// Initial bearing from `a` to `b` in degrees, range (-180, 180].
pub fn bearing(a: Coord, b: Coord) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let dlon = (b.x - a.x).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees()
}

/// Point reached travelling `dist` metres from `origin` on `bearing_deg`.
pub fn destination(origin: Coord, dist: f64, bearing_deg: f64) -> Coord {
    let lat1 = origin.y.to_radians();
    let lon1 = origin.x.to_radians();
    let theta = bearing_deg.to_radians();
    let delta = dist / EARTH_RADIUS;

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    Coord {
        x: lon2.to_degrees(),
        y: lat2.to_degrees(),
    }
}

/// Wrap an angle into [0, 360).
#[inline]
pub fn normalize_angle(a: f64) -> f64 {
    let wrapped = a.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Smallest absolute difference between two angles, in [0, 180].
#[inline]
pub fn angle_delta(a1: f64, a2: f64) -> f64 {
    180.0 - (((a1 - a2).abs()) - 180.0).abs()
}

/// Root mean square of the values. Empty input scores 0.
pub fn rmse(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| v * v).sum();
    (sum / values.len() as f64).sqrt()
}

/// Round both ordinates to `places` decimals.
pub fn round_coord(c: Coord, places: i32) -> Coord {
    let factor = 10f64.powi(places);
    Coord {
        x: (c.x * factor).round() / factor,
        y: (c.y * factor).round() / factor,
    }
}

/// Bounding rectangle of a point buffered by `radius` metres.
pub fn buffered_envelope(point: Coord, radius: f64) -> Rect {
    let dlat = radius / metres_per_degree();
    let cos_lat = point.y.to_radians().cos().abs().max(1e-6);
    let dlon = (dlat / cos_lat).min(180.0);
    Rect::new(
        Coord {
            x: point.x - dlon,
            y: point.y - dlat,
        },
        Coord {
            x: point.x + dlon,
            y: point.y + dlat,
        },
    )
}

/// Total length of a polyline in metres.
pub fn line_length(line: &LineString) -> f64 {
    line.0.windows(2).map(|w| distance(w[0], w[1])).sum()
}

/// Cumulative distance at each vertex.
fn cumulative_distances(coords: &[Coord]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(coords.len());
    let mut travelled = 0.0;
    for (i, c) in coords.iter().enumerate() {
        if i > 0 {
            travelled += distance(coords[i - 1], *c);
        }
        cumulative.push(travelled);
    }
    cumulative
}

#[inline]
fn lerp(a: Coord, b: Coord, t: f64) -> Coord {
    Coord {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
    }
}

/// Point `dist` metres along the line, clamped to the endpoints.
pub fn along(line: &LineString, dist: f64) -> Option<Coord> {
    let coords = &line.0;
    let first = *coords.first()?;
    if dist <= 0.0 || coords.len() == 1 {
        return Some(first);
    }

    let mut travelled = 0.0;
    for w in coords.windows(2) {
        let seg = distance(w[0], w[1]);
        if travelled + seg >= dist {
            if seg <= 0.0 {
                return Some(w[0]);
            }
            return Some(lerp(w[0], w[1], (dist - travelled) / seg));
        }
        travelled += seg;
    }
    coords.last().copied()
}

/// Projection of a point onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPoint {
    /// Projected coordinate on the line
    pub coord: Coord,
    /// Index of the vertex starting the segment containing the projection
    pub index: usize,
    /// Distance from the search point to the projection (metres)
    pub distance: f64,
    /// Distance along the line from its start to the projection (metres)
    pub location: f64,
}

/// Local equirectangular frame anchored at `origin`, in metres.
#[derive(Debug, Clone, Copy)]
struct LocalFrame {
    origin: Coord,
    kx: f64,
    ky: f64,
}

impl LocalFrame {
    fn new(origin: Coord) -> Self {
        let ky = metres_per_degree();
        let kx = ky * origin.y.to_radians().cos();
        Self { origin, kx, ky }
    }

    fn to_xy(&self, c: Coord) -> (f64, f64) {
        ((c.x - self.origin.x) * self.kx, (c.y - self.origin.y) * self.ky)
    }

    fn from_xy(&self, x: f64, y: f64) -> Coord {
        Coord {
            x: self.origin.x + x / self.kx,
            y: self.origin.y + y / self.ky,
        }
    }
}

/// Closest point on `line` to `point`.
pub fn nearest_point_on_line(line: &LineString, point: Coord) -> Option<NearestPoint> {
    let coords = &line.0;
    let first = *coords.first()?;
    if coords.len() == 1 {
        return Some(NearestPoint {
            coord: first,
            index: 0,
            distance: distance(first, point),
            location: 0.0,
        });
    }

    let frame = LocalFrame::new(point);
    let mut best: Option<NearestPoint> = None;
    let mut travelled = 0.0;

    for (i, w) in coords.windows(2).enumerate() {
        let (ax, ay) = frame.to_xy(w[0]);
        let (bx, by) = frame.to_xy(w[1]);
        let (dx, dy) = (bx - ax, by - ay);
        let len2 = dx * dx + dy * dy;

        let t = if len2 > 0.0 {
            ((-ax * dx - ay * dy) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let projected = lerp(w[0], w[1], t);
        let d = distance(projected, point);

        if best.map_or(true, |b| d < b.distance) {
            best = Some(NearestPoint {
                coord: projected,
                index: i,
                distance: d,
                location: travelled + distance(w[0], projected),
            });
        }

        travelled += distance(w[0], w[1]);
    }

    best
}

/// Sub-polyline between `start` and `stop` metres along the line.
///
/// Negative bounds clamp to 0. Returns `None` for reversed, zero-length or
/// out-of-range slices.
pub fn slice_along(line: &LineString, start: f64, stop: f64) -> Option<LineString> {
    let coords = &line.0;
    if coords.len() < 2 {
        return None;
    }

    let start = start.max(0.0);
    let stop = stop.max(0.0);
    if stop <= start {
        return None;
    }

    let cumulative = cumulative_distances(coords);
    let total = *cumulative.last()?;
    if start > total {
        return None;
    }

    let mut out = Vec::with_capacity(coords.len());
    out.push(along(line, start)?);
    for (c, &cum) in coords.iter().zip(cumulative.iter()) {
        if cum > start && cum < stop {
            out.push(*c);
        }
    }
    out.push(along(line, stop)?);
    out.dedup();

    if out.len() < 2 {
        return None;
    }
    Some(LineString::new(out))
}

/// Offset a polyline laterally by `offset` metres (positive = right of travel).
pub fn line_offset(line: &LineString, offset: f64) -> LineString {
    let mut coords = line.0.clone();
    coords.dedup();
    if offset == 0.0 || coords.len() < 2 {
        return LineString::new(coords);
    }

    let frame = LocalFrame::new(coords[0]);
    let xy: Vec<(f64, f64)> = coords.iter().map(|c| frame.to_xy(*c)).collect();

    // Offset each segment along its right-hand normal
    let segments: Vec<((f64, f64), (f64, f64))> = xy
        .windows(2)
        .map(|w| {
            let (dx, dy) = (w[1].0 - w[0].0, w[1].1 - w[0].1);
            let len = (dx * dx + dy * dy).sqrt();
            let (nx, ny) = (dy / len * offset, -dx / len * offset);
            ((w[0].0 + nx, w[0].1 + ny), (w[1].0 + nx, w[1].1 + ny))
        })
        .collect();

    let mut out = Vec::with_capacity(coords.len());
    out.push(segments[0].0);
    for pair in segments.windows(2) {
        out.push(join_segments(pair[0], pair[1]));
    }
    if let Some(last) = segments.last() {
        out.push(last.1);
    }

    LineString::new(out.into_iter().map(|(x, y)| frame.from_xy(x, y)).collect())
}

/// Intersection of the infinite lines through two offset segments.
fn join_segments(s1: ((f64, f64), (f64, f64)), s2: ((f64, f64), (f64, f64))) -> (f64, f64) {
    let (p, p2) = s1;
    let (q, q2) = s2;
    let r = (p2.0 - p.0, p2.1 - p.1);
    let s = (q2.0 - q.0, q2.1 - q.1);
    let cross = r.0 * s.1 - r.1 * s.0;

    if cross.abs() < 1e-9 {
        return q;
    }

    let t = ((q.0 - p.0) * s.1 - (q.1 - p.1) * s.0) / cross;
    (p.0 + t * r.0, p.1 + t * r.1)
}

/// Offset a point perpendicular to `bearing_deg` (positive = right).
pub fn point_offset(point: Coord, bearing_deg: f64, offset: f64) -> Coord {
    if offset == 0.0 {
        return point;
    }
    let side = if offset > 0.0 { 90.0 } else { -90.0 };
    destination(point, offset.abs(), bearing_deg + side)
}

/// Bearing of the line segment containing distance `dist`.
pub fn bearing_at(line: &LineString, dist: f64) -> Option<f64> {
    let coords = &line.0;
    if coords.len() < 2 {
        return None;
    }
    let cumulative = cumulative_distances(coords);
    let mut index = coords.len() - 2;
    for i in 0..coords.len() - 1 {
        if cumulative[i + 1] >= dist {
            index = i;
            break;
        }
    }
    Some(bearing(coords[index], coords[index + 1]))
}

/// Compass bearing of the first 20 metres of the line.
pub fn outbound_bearing(line: &LineString) -> Option<f64> {
    let len = line_length(line);
    let (start, end) = if len > BEARING_SAMPLE_DISTANCE {
        (along(line, 0.0)?, along(line, BEARING_SAMPLE_DISTANCE)?)
    } else {
        (*line.0.first()?, *line.0.last()?)
    };
    Some(normalize_angle(bearing(start, end).round()))
}

/// Compass bearing of the last 20 metres of the line.
pub fn inbound_bearing(line: &LineString) -> Option<f64> {
    let len = line_length(line);
    let (start, end) = if len > BEARING_SAMPLE_DISTANCE {
        (along(line, len - BEARING_SAMPLE_DISTANCE)?, *line.0.last()?)
    } else {
        (*line.0.first()?, *line.0.last()?)
    };
    Some(normalize_angle(bearing(start, end).round()))
}

/// Reverse the vertex order of a line.
pub fn reversed(line: &LineString) -> LineString {
    let mut coords = line.0.clone();
    coords.reverse();
    LineString::new(coords)
}
