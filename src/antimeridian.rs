//! Antimeridian handling for scene footprints.
//!
//! A footprint straddling ±180° comes out of the metadata store with some
//! vertices near +180 and some near -180, which renders as a band across the
//! whole map. Shifting the western vertices by +360 keeps the ring
//! contiguous in longitude.

use geo_types::{Coord, LineString, Polygon};

/// A ring with a vertex east of this longitude is a crossing candidate.
pub const EAST_EDGE_LON: f64 = 160.0;
/// A ring with a vertex west of this longitude is a crossing candidate.
pub const WEST_EDGE_LON: f64 = -160.0;
/// Vertices west of this longitude are shifted by a full turn when rewrapping.
pub const REWRAP_BELOW_LON: f64 = -170.0;

/// True if the ring has at least one vertex east of 160° and at least one
/// vertex west of -160°, anywhere in the ring.
pub fn crosses_antimeridian(ring: &LineString<f64>) -> bool {
    let mut east = false;
    let mut west = false;

    for coord in ring.coords() {
        if coord.x > EAST_EDGE_LON {
            east = true;
        } else if coord.x < WEST_EDGE_LON {
            west = true;
        }
    }

    east && west
}

/// Returns a copy of the ring with every vertex west of -170° moved 360° east.
pub fn rewrap(ring: &LineString<f64>) -> LineString<f64> {
    ring.coords()
        .map(|coord| {
            if coord.x < REWRAP_BELOW_LON {
                Coord {
                    x: coord.x + 360.0,
                    y: coord.y,
                }
            } else {
                *coord
            }
        })
        .collect()
}

/// Rewraps the exterior ring if it crosses the antimeridian. Holes are left alone.
pub fn normalize_polygon(mut polygon: Polygon<f64>) -> Polygon<f64> {
    if crosses_antimeridian(polygon.exterior()) {
        polygon.exterior_mut(|exterior| *exterior = rewrap(exterior));
    }
    polygon
}
