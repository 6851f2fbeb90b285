use compact_str::CompactString;
use dashmap::DashMap;
use std::sync::Arc;

use crate::broadcast::{Broadcaster, Topic};
use crate::catalog::CatalogManager;
use crate::geo::{EntityKind, GeoIndex};
use crate::types::{
    EventKind, Point, TrackerError, TrackerEvent, Vehicle, VehicleRegistration, VehicleStatus,
};

/// Process-wide engine state. Built once in main, passed as Arc to every
/// request handler and background loop. There is exactly one authoritative
/// record per vehicle id, and all position mutations flow through
/// `ingest::ingest`, so the vehicle table and the geo index never diverge
/// for longer than a single update.
pub struct AppState {
    // Map VehicleID -> authoritative live record
    pub vehicles: DashMap<CompactString, Vehicle>,

    pub geo: Arc<GeoIndex>,

    pub catalog: CatalogManager,

    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(catalog_source: String) -> Self {
        Self {
            vehicles: DashMap::new(),
            geo: Arc::new(GeoIndex::new()),
            catalog: CatalogManager::new(catalog_source),
            broadcaster: Broadcaster::new(),
        }
    }

    /// Entry point for the external fleet-admin collaborator. A vehicle must
    /// be registered before `ingest` will accept updates for it.
    pub fn register_vehicle(&self, reg: VehicleRegistration) -> Result<(), TrackerError> {
        let position = Point::new(reg.lat, reg.lng)?;
        let vehicle_id = reg.vehicle_id.clone();

        let mut created = false;
        self.vehicles.entry(vehicle_id.clone()).or_insert_with(|| {
            created = true;
            reg.into_vehicle(position)
        });
        if !created {
            return Err(TrackerError::DuplicateVehicle(vehicle_id));
        }

        self.geo.upsert(EntityKind::Vehicle, &vehicle_id, position)?;
        println!("Registered vehicle {}", vehicle_id);
        Ok(())
    }

    /// Vehicles are never deleted while the fleet knows them, only
    /// deactivated. A deactivated vehicle rejects ingest and drops out of
    /// every query surface.
    pub fn deactivate_vehicle(&self, vehicle_id: &str) -> Result<(), TrackerError> {
        let mut entry = self
            .vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| TrackerError::UnknownVehicle(CompactString::from(vehicle_id)))?;
        entry.value_mut().active = false;
        entry.value_mut().online = false;
        drop(entry);

        self.geo
            .remove(EntityKind::Vehicle, &CompactString::from(vehicle_id));
        println!("Deactivated vehicle {}", vehicle_id);
        Ok(())
    }

    /// Operator-driven status transition (dispatch sets Maintenance,
    /// OutOfService, Delayed...). The OutOfService -> Stopped re-entry on the
    /// next valid position update lives in `ingest`.
    pub fn set_status(
        &self,
        vehicle_id: &str,
        status: VehicleStatus,
    ) -> Result<Vehicle, TrackerError> {
        let mut entry = self
            .vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| TrackerError::UnknownVehicle(CompactString::from(vehicle_id)))?;
        let v = entry.value_mut();
        if !v.active {
            return Err(TrackerError::InactiveVehicle(v.vehicle_id.clone()));
        }

        if v.status != status {
            v.status = status;
            self.publish_vehicle_event(v, EventKind::StatusChange);
        }
        Ok(v.clone())
    }

    pub fn snapshot(&self, vehicle_id: &str) -> Option<Vehicle> {
        self.vehicles.get(vehicle_id).map(|v| v.clone())
    }

    /// Fan a state-change event out to the vehicle topic, the route topic
    /// (when assigned) and the global topic.
    pub fn publish_vehicle_event(&self, vehicle: &Vehicle, kind: EventKind) {
        let event = TrackerEvent::of(vehicle, kind);
        self.broadcaster
            .publish(&Topic::Vehicle(vehicle.vehicle_id.clone()), &event);
        if let Some(route_id) = &vehicle.route_id {
            self.broadcaster
                .publish(&Topic::Route(route_id.clone()), &event);
        }
        self.broadcaster.publish(&Topic::Global, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str) -> VehicleRegistration {
        VehicleRegistration {
            vehicle_id: CompactString::from(id),
            registration: CompactString::from("MH-01-AB-1234"),
            route_id: Some(CompactString::from("route_42")),
            capacity: 50,
            lat: 19.0760,
            lng: 72.8777,
        }
    }

    #[test]
    fn test_register_and_duplicate() {
        let state = AppState::new("unused".to_string());
        state.register_vehicle(registration("BUS_001")).unwrap();
        assert_eq!(state.geo.count(EntityKind::Vehicle), 1);

        let err = state.register_vehicle(registration("BUS_001")).unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateVehicle(_)));
    }

    #[test]
    fn test_register_rejects_bad_position() {
        let state = AppState::new("unused".to_string());
        let mut reg = registration("BUS_001");
        reg.lat = 95.0;
        assert!(state.register_vehicle(reg).is_err());
        assert!(state.snapshot("BUS_001").is_none());
    }

    #[test]
    fn test_deactivate_removes_from_index() {
        let state = AppState::new("unused".to_string());
        state.register_vehicle(registration("BUS_001")).unwrap();
        state.deactivate_vehicle("BUS_001").unwrap();

        let v = state.snapshot("BUS_001").unwrap();
        assert!(!v.active);
        assert_eq!(state.geo.count(EntityKind::Vehicle), 0);
    }

    #[tokio::test]
    async fn test_set_status_publishes_once_per_change() {
        let state = AppState::new("unused".to_string());
        state.register_vehicle(registration("BUS_001")).unwrap();

        let mut sub = state
            .broadcaster
            .subscribe(Topic::Vehicle(CompactString::from("BUS_001")));

        state
            .set_status("BUS_001", VehicleStatus::Maintenance)
            .unwrap();
        // Same status again is a no-op, not a second event.
        state
            .set_status("BUS_001", VehicleStatus::Maintenance)
            .unwrap();

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_kind, EventKind::StatusChange);
        assert_eq!(event.status, VehicleStatus::Maintenance);
        assert!(sub.rx.try_recv().is_err());
    }
}
