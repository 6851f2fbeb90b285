use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::{Point, TrackerError};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Grid cell edge in degrees, ~1.1 km of latitude. Chosen to roughly match
/// the common query radii (stop discovery ~1 km, vehicle discovery a few km).
const CELL_DEG: f64 = 0.01;
const METERS_PER_DEG_LAT: f64 = 111_320.0;
const LNG_CELLS: i32 = (360.0 / CELL_DEG) as i32;

/// Upper bound on the ring width in cells. Longitude cells shrink towards the
/// poles; without a cap a polar query would walk the whole parallel.
const MAX_RING: i32 = 1_000;

/// The one haversine implementation in the engine. GeoIndex and the journey
/// matcher both route through here.
pub fn haversine_meters(a: Point, b: Point) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Vehicle,
    Stop,
    Rider,
}

type CellId = (i32, i32);

fn cell_of(p: Point) -> CellId {
    let lat = (p.lat / CELL_DEG).floor() as i32;
    let lng = ((p.lng / CELL_DEG).floor() as i32).rem_euclid(LNG_CELLS);
    (lat, lng)
}

/// In-memory spatial index over point entities. Cell buckets live in a
/// DashMap, so upserts for entities in different cells proceed in parallel
/// and a radius query only ever holds one bucket at a time.
pub struct GeoIndex {
    cells: DashMap<(EntityKind, CellId), HashSet<CompactString>>,
    positions: DashMap<(EntityKind, CompactString), Point>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            positions: DashMap::new(),
        }
    }

    pub fn upsert(
        &self,
        kind: EntityKind,
        id: &CompactString,
        point: Point,
    ) -> Result<(), TrackerError> {
        point.validate()?;
        let new_cell = cell_of(point);

        let old = self.positions.insert((kind, id.clone()), point);
        if let Some(old_point) = old {
            let old_cell = cell_of(old_point);
            if old_cell == new_cell {
                // Same bucket, position refresh only.
                return Ok(());
            }
            if let Some(mut bucket) = self.cells.get_mut(&(kind, old_cell)) {
                bucket.remove(id);
            }
        }

        self.cells
            .entry((kind, new_cell))
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    pub fn remove(&self, kind: EntityKind, id: &CompactString) {
        if let Some((_, point)) = self.positions.remove(&(kind, id.clone())) {
            let cell = cell_of(point);
            if let Some(mut bucket) = self.cells.get_mut(&(kind, cell)) {
                bucket.remove(id);
            }
        }
    }

    pub fn position_of(&self, kind: EntityKind, id: &CompactString) -> Option<Point> {
        self.positions.get(&(kind, id.clone())).map(|p| *p)
    }

    /// K-nearest within `radius_m`, ascending by distance, ties broken by id.
    /// Visits the candidate cell plus enough neighbour rings to cover the
    /// radius, then filters by exact great-circle distance.
    pub fn query_radius(
        &self,
        center: Point,
        radius_m: f64,
        kind: EntityKind,
        limit: usize,
    ) -> Result<Vec<(CompactString, f64)>, TrackerError> {
        center.validate()?;
        if !(radius_m.is_finite() && radius_m >= 0.0) {
            return Err(TrackerError::InvalidReading("radius"));
        }

        let (center_lat, center_lng) = cell_of(center);
        let ring_lat = ((radius_m / (CELL_DEG * METERS_PER_DEG_LAT)).ceil() as i32).min(MAX_RING);
        let lng_scale = center.lat.to_radians().cos().abs().max(1e-6);
        let ring_lng = ((radius_m / (CELL_DEG * METERS_PER_DEG_LAT * lng_scale)).ceil() as i32)
            .min(MAX_RING);

        let mut hits: Vec<(CompactString, f64)> = Vec::new();
        for d_lat in -ring_lat..=ring_lat {
            for d_lng in -ring_lng..=ring_lng {
                let cell = (center_lat + d_lat, (center_lng + d_lng).rem_euclid(LNG_CELLS));
                let Some(bucket) = self.cells.get(&(kind, cell)) else {
                    continue;
                };
                for id in bucket.iter() {
                    let Some(pos) = self.positions.get(&(kind, id.clone())) else {
                        continue;
                    };
                    let dist = haversine_meters(center, *pos);
                    if dist <= radius_m {
                        hits.push((id.clone(), dist));
                    }
                }
            }
        }

        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.positions.iter().filter(|e| e.key().0 == kind).count()
    }
}
