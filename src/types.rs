use chrono::Utc;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A WGS84 coordinate pair. Anything entering the engine goes through
/// `Point::new` (or `validate` after deserialization) before it touches state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Result<Self, TrackerError> {
        let p = Self { lat, lng };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        let ok = self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng);
        if ok {
            Ok(())
        } else {
            Err(TrackerError::InvalidCoordinate {
                lat: self.lat,
                lng: self.lng,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleStatus {
    Stopped,
    Running,
    Delayed,
    Maintenance,
    OutOfService,
}

impl VehicleStatus {
    /// Maintenance and OutOfService vehicles are invisible to matching.
    pub fn in_service(&self) -> bool {
        !matches!(self, VehicleStatus::Maintenance | VehicleStatus::OutOfService)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Occupancy {
    pub current: u32,
    pub capacity: u32,
}

impl Occupancy {
    /// Rounded percentage; a zero-capacity vehicle counts as full so the
    /// journey ranking demotes it instead of dividing by zero.
    pub fn percentage(&self) -> u8 {
        if self.capacity == 0 {
            return 100;
        }
        let pct = (self.current as f64 / self.capacity as f64) * 100.0;
        pct.round().min(100.0) as u8
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub vehicle_id: CompactString,
    /// Registration plate. Opaque to the engine, carried for operators.
    pub registration: CompactString,
    pub route_id: Option<CompactString>,
    pub position: Point,
    pub speed: Option<f64>,    // km/h
    pub heading: Option<f64>,  // degrees, [0, 360)
    pub accuracy: Option<f64>, // GPS accuracy in meters
    pub occupancy: Occupancy,
    pub status: VehicleStatus,
    pub online: bool,
    pub active: bool,
    pub last_update_at: i64, // epoch seconds
}

impl Vehicle {
    pub fn occupancy_percentage(&self) -> u8 {
        self.occupancy.percentage()
    }
}

/// What the external fleet-admin collaborator hands us when a vehicle enters
/// the fleet. Everything else on `Vehicle` starts at its resting value.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRegistration {
    pub vehicle_id: CompactString,
    pub registration: CompactString,
    #[serde(default)]
    pub route_id: Option<CompactString>,
    pub capacity: u32,
    pub lat: f64,
    pub lng: f64,
}

impl VehicleRegistration {
    pub fn into_vehicle(self, position: Point) -> Vehicle {
        Vehicle {
            vehicle_id: self.vehicle_id,
            registration: self.registration,
            route_id: self.route_id,
            position,
            speed: None,
            heading: None,
            accuracy: None,
            occupancy: Occupancy {
                current: 0,
                capacity: self.capacity,
            },
            status: VehicleStatus::Stopped,
            online: false,
            active: true,
            last_update_at: Utc::now().timestamp(),
        }
    }
}

// Catalog reference data. Owned by the external route/stop catalog; the
// engine only caches it (see catalog.rs).

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Local,
    Express,
    Intercity,
    Deluxe,
}

impl RouteType {
    /// Assumed average in-service speed, used for ETA only.
    pub fn average_speed_kmh(&self) -> f64 {
        match self {
            RouteType::Local => 25.0,
            RouteType::Express => 50.0,
            RouteType::Intercity => 60.0,
            RouteType::Deluxe => 55.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub stop_id: CompactString,
    pub sequence: u32,
    pub position: Point,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub route_id: CompactString,
    pub name: CompactString,
    pub route_type: RouteType,
    /// Ordered by `sequence`.
    pub stops: Vec<RouteStop>,
    pub is_active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMembership {
    pub route_id: CompactString,
    pub sequence: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub stop_id: CompactString,
    pub name: CompactString,
    pub position: Point,
    #[serde(default)]
    pub memberships: Vec<RouteMembership>,
}

// Broadcast events.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Position,
    CameOnline,
    WentOffline,
    StatusChange,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerEvent {
    pub vehicle_id: CompactString,
    pub route_id: Option<CompactString>,
    pub position: Point,
    pub status: VehicleStatus,
    pub occupancy_percentage: u8,
    pub timestamp: i64,
    pub event_kind: EventKind,
}

impl TrackerEvent {
    pub fn of(vehicle: &Vehicle, kind: EventKind) -> Self {
        Self {
            vehicle_id: vehicle.vehicle_id.clone(),
            route_id: vehicle.route_id.clone(),
            position: vehicle.position,
            status: vehicle.status,
            occupancy_percentage: vehicle.occupancy_percentage(),
            timestamp: Utc::now().timestamp(),
            event_kind: kind,
        }
    }
}

// Rejection taxonomy. Validation errors are synchronous and all-or-nothing:
// a rejected update mutates nothing.

#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("coordinate out of range: lat {lat}, lng {lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
    #[error("vehicle {0} is not registered")]
    UnknownVehicle(CompactString),
    #[error("invalid occupancy: {0}")]
    InvalidOccupancy(i64),
    #[error("invalid {0} reading")]
    InvalidReading(&'static str),
    #[error("vehicle {0} is already registered")]
    DuplicateVehicle(CompactString),
    #[error("vehicle {0} is deactivated")]
    InactiveVehicle(CompactString),
}

impl TrackerError {
    /// Stable machine-readable code for the HTTP boundary.
    pub fn reason(&self) -> &'static str {
        match self {
            TrackerError::InvalidCoordinate { .. } => "invalid_coordinate",
            TrackerError::UnknownVehicle(_) => "unknown_vehicle",
            TrackerError::InvalidOccupancy(_) => "invalid_occupancy",
            TrackerError::InvalidReading(_) => "invalid_reading",
            TrackerError::DuplicateVehicle(_) => "duplicate_vehicle",
            TrackerError::InactiveVehicle(_) => "inactive_vehicle",
        }
    }
}
