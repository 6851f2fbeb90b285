use chrono::Utc;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::geo::EntityKind;
use crate::state::AppState;
use crate::types::{EventKind, Point, TrackerError, VehicleStatus};

/// One driver-app update. `occupancy` rides in as i64 so a negative count
/// reaches validation intact instead of wrapping in deserialization.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub vehicle_id: CompactString,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub occupancy: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub vehicle_id: CompactString,
    pub status: VehicleStatus,
    pub occupancy_percentage: u8,
    pub online: bool,
}

/// Apply one position/occupancy update. Everything is validated before any
/// mutation, so a rejected update leaves the vehicle record and the geo
/// index exactly as they were. On acceptance the vehicle record, the geo
/// index and the broadcast all happen while the vehicle's entry is held,
/// which serializes updates per vehicle and keeps its event order intact.
pub fn ingest(state: &AppState, update: PositionUpdate) -> Result<IngestAck, TrackerError> {
    let point = Point::new(update.lat, update.lng)?;

    if let Some(speed) = update.speed {
        if !speed.is_finite() || speed < 0.0 {
            return Err(TrackerError::InvalidReading("speed"));
        }
    }
    if let Some(heading) = update.heading {
        if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
            return Err(TrackerError::InvalidReading("heading"));
        }
    }
    if let Some(accuracy) = update.accuracy {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(TrackerError::InvalidReading("accuracy"));
        }
    }
    if let Some(occ) = update.occupancy {
        if occ < 0 {
            return Err(TrackerError::InvalidOccupancy(occ));
        }
    }

    let mut entry = state
        .vehicles
        .get_mut(&update.vehicle_id)
        .ok_or_else(|| TrackerError::UnknownVehicle(update.vehicle_id.clone()))?;
    let v = entry.value_mut();
    if !v.active {
        return Err(TrackerError::InactiveVehicle(v.vehicle_id.clone()));
    }

    let came_online = !v.online;

    v.position = point;
    // Optional readings are per-update: an update without speed/heading
    // clears the previous ones rather than letting them go stale silently.
    v.speed = update.speed;
    v.heading = update.heading;
    v.accuracy = update.accuracy;
    if let Some(occ) = update.occupancy {
        // Over-capacity reports clamp; negatives were rejected above.
        v.occupancy.current = occ.min(v.occupancy.capacity as i64) as u32;
    }
    if v.status == VehicleStatus::OutOfService {
        // Implicit re-entry: a valid position update puts the vehicle back
        // into the Stopped/Running cycle.
        v.status = VehicleStatus::Stopped;
    }
    v.online = true;
    v.last_update_at = Utc::now().timestamp();

    state.geo.upsert(EntityKind::Vehicle, &v.vehicle_id, point)?;

    if came_online {
        state.publish_vehicle_event(v, EventKind::CameOnline);
    }
    state.publish_vehicle_event(v, EventKind::Position);

    Ok(IngestAck {
        vehicle_id: v.vehicle_id.clone(),
        status: v.status,
        occupancy_percentage: v.occupancy_percentage(),
        online: v.online,
    })
}
