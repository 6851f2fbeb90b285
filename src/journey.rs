use compact_str::CompactString;
use serde::Serialize;
use std::collections::HashMap;

use crate::geo::{EntityKind, haversine_meters};
use crate::state::AppState;
use crate::types::{Point, Stop, TrackerError};

/// Walking pace charged against the rider: 12 minutes per km.
const WALK_MINUTES_PER_KM: f64 = 12.0;

/// How far from the boarding stop we still consider a vehicle a candidate.
/// Beyond this an ETA is useless for a catch-this-bus decision.
const VEHICLE_SEARCH_RADIUS_M: f64 = 30_000.0;

/// Stop candidates examined per endpoint.
const STOP_CANDIDATES: usize = 8;

/// At or above this occupancy a vehicle ranks behind every under-capacity one.
const FULL_THRESHOLD: u8 = 90;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Journey {
    pub vehicle_id: CompactString,
    pub route_id: CompactString,
    pub board_stop_id: CompactString,
    pub eta_minutes: u32,
    pub occupancy_percentage: u8,
    pub walk_meters: u32,
}

#[derive(Debug)]
pub enum JourneyOutcome {
    Matches(Vec<Journey>),
    /// No route serves both ends in the right direction. A valid empty
    /// answer, not a failure.
    NoDirectService,
}

/// A route that covers origin and destination in order, with the cheapest
/// boarding stop found for it.
struct Boarding {
    stop_id: CompactString,
    stop_position: Point,
    walk_meters: f64,
}

/// Match vehicles to an origin/destination pair. Stops within walking range
/// of both ends are paired; a route qualifies when it serves both stops with
/// the destination later in the sequence; online in-service vehicles on a
/// qualifying route are ranked by (full?, eta).
pub fn find_vehicles_between(
    state: &AppState,
    origin: Point,
    destination: Point,
    max_walk_radius: f64,
) -> Result<JourneyOutcome, TrackerError> {
    origin.validate()?;
    destination.validate()?;
    if !(max_walk_radius.is_finite() && max_walk_radius >= 0.0) {
        return Err(TrackerError::InvalidReading("radius"));
    }

    let origin_stops =
        state
            .geo
            .query_radius(origin, max_walk_radius, EntityKind::Stop, STOP_CANDIDATES)?;
    let dest_stops = state.geo.query_radius(
        destination,
        max_walk_radius,
        EntityKind::Stop,
        STOP_CANDIDATES,
    )?;
    if origin_stops.is_empty() || dest_stops.is_empty() {
        return Ok(JourneyOutcome::NoDirectService);
    }

    let boardings = qualifying_routes(state, &origin_stops, &dest_stops);
    if boardings.is_empty() {
        return Ok(JourneyOutcome::NoDirectService);
    }

    let mut best: HashMap<CompactString, Journey> = HashMap::new();
    for (route_id, boarding) in &boardings {
        let Some(route) = state.catalog.get_route(route_id) else {
            continue;
        };
        if !route.is_active {
            continue;
        }
        let speed_kmh = route.route_type.average_speed_kmh();
        let walk_minutes = boarding.walk_meters / 1000.0 * WALK_MINUTES_PER_KM;

        let candidates = state.geo.query_radius(
            boarding.stop_position,
            VEHICLE_SEARCH_RADIUS_M,
            EntityKind::Vehicle,
            usize::MAX,
        )?;

        for (vehicle_id, approach_meters) in candidates {
            let Some(v) = state.vehicles.get(&vehicle_id) else {
                continue;
            };
            // Stale positions make for lies, not ETAs: offline vehicles are
            // excluded by policy, as are out-of-service ones.
            if !v.active || !v.online || !v.status.in_service() {
                continue;
            }
            if v.route_id.as_deref() != Some(route_id.as_str()) {
                continue;
            }

            let drive_minutes = approach_meters / 1000.0 / speed_kmh * 60.0;
            let eta_minutes = (walk_minutes + drive_minutes).round() as u32;
            let journey = Journey {
                vehicle_id: vehicle_id.clone(),
                route_id: route_id.clone(),
                board_stop_id: boarding.stop_id.clone(),
                eta_minutes,
                occupancy_percentage: v.occupancy_percentage(),
                walk_meters: boarding.walk_meters.round() as u32,
            };
            drop(v);

            // A vehicle can qualify through several stop pairs; keep its
            // cheapest journey.
            let better = best
                .get(&vehicle_id)
                .is_none_or(|existing| journey.eta_minutes < existing.eta_minutes);
            if better {
                best.insert(vehicle_id, journey);
            }
        }
    }

    let mut matches: Vec<Journey> = best.into_values().collect();
    matches.sort_by(|a, b| {
        let a_full = a.occupancy_percentage >= FULL_THRESHOLD;
        let b_full = b.occupancy_percentage >= FULL_THRESHOLD;
        a_full
            .cmp(&b_full)
            .then(a.eta_minutes.cmp(&b.eta_minutes))
            .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
    });

    Ok(JourneyOutcome::Matches(matches))
}

/// Pair every nearby origin stop with every nearby destination stop and keep
/// the routes serving both with `dest.sequence > origin.sequence`. Per route,
/// the boarding stop with the shortest walk wins.
fn qualifying_routes(
    state: &AppState,
    origin_stops: &[(CompactString, f64)],
    dest_stops: &[(CompactString, f64)],
) -> HashMap<CompactString, Boarding> {
    let lookup = |id: &CompactString| -> Option<Stop> { state.catalog.get_stop(id) };

    let mut boardings: HashMap<CompactString, Boarding> = HashMap::new();
    for (origin_id, walk_meters) in origin_stops {
        let Some(origin_stop) = lookup(origin_id) else {
            continue;
        };
        for (dest_id, _) in dest_stops {
            if origin_id == dest_id {
                continue;
            }
            let Some(dest_stop) = lookup(dest_id) else {
                continue;
            };

            for om in &origin_stop.memberships {
                let serves_onward = dest_stop
                    .memberships
                    .iter()
                    .any(|dm| dm.route_id == om.route_id && dm.sequence > om.sequence);
                if !serves_onward {
                    continue;
                }

                let better = boardings
                    .get(&om.route_id)
                    .is_none_or(|existing| *walk_meters < existing.walk_meters);
                if better {
                    boardings.insert(
                        om.route_id.clone(),
                        Boarding {
                            stop_id: origin_id.clone(),
                            stop_position: origin_stop.position,
                            walk_meters: *walk_meters,
                        },
                    );
                }
            }
        }
    }
    boardings
}

/// Straight-line ETA for closing on a point at a given speed. The vehicle
/// detail endpoint uses this for its nearest-stop arrival hint.
pub fn eta_minutes_at_speed(from: Point, to: Point, speed_kmh: f64) -> Option<u32> {
    if !(speed_kmh.is_finite() && speed_kmh > 0.0) {
        return None;
    }
    let km = haversine_meters(from, to) / 1000.0;
    Some((km / speed_kmh * 60.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogDocument;
    use crate::ingest::{PositionUpdate, ingest};
    use crate::types::{Route, RouteStop, RouteType, VehicleRegistration};

    // A small two-route world around Mumbai:
    //   route_42: stop_001 (Mumbai Central) -> stop_002 (Dadar)
    //   route_77: stop_003 -> stop_004, nowhere near the first pair's routes
    const CENTRAL: Point = Point {
        lat: 19.0760,
        lng: 72.8777,
    };
    const DADAR: Point = Point {
        lat: 19.0178,
        lng: 72.8478,
    };
    const ANDHERI: Point = Point {
        lat: 19.1197,
        lng: 72.8464,
    };
    const BORIVALI: Point = Point {
        lat: 19.2307,
        lng: 72.8567,
    };

    fn stop(id: &str, position: Point) -> crate::types::Stop {
        crate::types::Stop {
            stop_id: CompactString::from(id),
            name: CompactString::from(id),
            position,
            memberships: Vec::new(),
        }
    }

    fn route(id: &str, stops: &[(&str, u32, Point)]) -> Route {
        Route {
            route_id: CompactString::from(id),
            name: CompactString::from(id),
            route_type: RouteType::Local,
            stops: stops
                .iter()
                .map(|(sid, seq, p)| RouteStop {
                    stop_id: CompactString::from(*sid),
                    sequence: *seq,
                    position: *p,
                })
                .collect(),
            is_active: true,
        }
    }

    fn world() -> AppState {
        let state = AppState::new("unused".to_string());
        state.catalog.install_document(
            CatalogDocument {
                routes: vec![
                    route("route_42", &[("stop_001", 1, CENTRAL), ("stop_002", 2, DADAR)]),
                    route("route_77", &[("stop_003", 1, ANDHERI), ("stop_004", 2, BORIVALI)]),
                ],
                stops: vec![
                    stop("stop_001", CENTRAL),
                    stop("stop_002", DADAR),
                    stop("stop_003", ANDHERI),
                    stop("stop_004", BORIVALI),
                ],
            },
            &state.geo,
        );
        state
    }

    fn add_bus(state: &AppState, id: &str, route_id: &str, capacity: u32) {
        state
            .register_vehicle(VehicleRegistration {
                vehicle_id: CompactString::from(id),
                registration: CompactString::from(id),
                route_id: Some(CompactString::from(route_id)),
                capacity,
                lat: CENTRAL.lat,
                lng: CENTRAL.lng,
            })
            .unwrap();
    }

    fn report(state: &AppState, id: &str, at: Point, occupancy: i64) {
        ingest(
            state,
            PositionUpdate {
                vehicle_id: CompactString::from(id),
                lat: at.lat,
                lng: at.lng,
                speed: None,
                heading: None,
                accuracy: None,
                occupancy: Some(occupancy),
            },
        )
        .unwrap();
    }

    fn matches(outcome: JourneyOutcome) -> Vec<Journey> {
        match outcome {
            JourneyOutcome::Matches(m) => m,
            JourneyOutcome::NoDirectService => panic!("expected matches, got NoDirectService"),
        }
    }

    #[test]
    fn test_finds_vehicle_on_covering_route() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        report(&state, "BUS_001", CENTRAL, 10);

        let found = matches(
            find_vehicles_between(&state, CENTRAL, DADAR, 1_000.0).unwrap(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vehicle_id, "BUS_001");
        assert_eq!(found[0].route_id, "route_42");
        assert_eq!(found[0].board_stop_id, "stop_001");
        assert_eq!(found[0].occupancy_percentage, 20);
    }

    #[test]
    fn test_directionality_respected() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        report(&state, "BUS_001", CENTRAL, 10);

        // Dadar -> Central rides against the stop sequence; route_42 must
        // not qualify in reverse.
        let outcome = find_vehicles_between(&state, DADAR, CENTRAL, 1_000.0).unwrap();
        assert!(matches!(outcome, JourneyOutcome::NoDirectService));
    }

    #[test]
    fn test_disjoint_routes_yield_no_direct_service() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        report(&state, "BUS_001", CENTRAL, 10);

        // Central and Borivali are only served by routes that never meet.
        let outcome = find_vehicles_between(&state, CENTRAL, BORIVALI, 1_000.0).unwrap();
        assert!(matches!(outcome, JourneyOutcome::NoDirectService));
    }

    #[test]
    fn test_offline_vehicle_excluded() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        // Registered but never reported: online is false.

        let found = matches(
            find_vehicles_between(&state, CENTRAL, DADAR, 1_000.0).unwrap(),
        );
        assert!(found.is_empty(), "offline vehicles must never match");
    }

    #[test]
    fn test_nearly_full_vehicle_ranks_last() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        add_bus(&state, "BUS_002", "route_42", 50);
        // BUS_001 at 90%, right at the threshold; BUS_002 comfortable.
        report(&state, "BUS_001", CENTRAL, 45);
        report(&state, "BUS_002", DADAR, 10);

        let found = matches(
            find_vehicles_between(&state, CENTRAL, DADAR, 1_000.0).unwrap(),
        );
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[0].vehicle_id, "BUS_002",
            "under-capacity vehicle wins even with the worse ETA"
        );
        assert!(found[0].eta_minutes >= found[1].eta_minutes);
    }

    #[test]
    fn test_maintenance_vehicle_excluded() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        report(&state, "BUS_001", CENTRAL, 10);
        state
            .set_status("BUS_001", crate::types::VehicleStatus::Maintenance)
            .unwrap();

        let found = matches(
            find_vehicles_between(&state, CENTRAL, DADAR, 1_000.0).unwrap(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_eta_orders_closer_vehicle_first() {
        let state = world();
        add_bus(&state, "BUS_001", "route_42", 50);
        add_bus(&state, "BUS_002", "route_42", 50);
        report(&state, "BUS_001", DADAR, 10); // a few km out
        report(&state, "BUS_002", CENTRAL, 10); // at the boarding stop

        let found = matches(
            find_vehicles_between(&state, CENTRAL, DADAR, 1_000.0).unwrap(),
        );
        assert_eq!(found[0].vehicle_id, "BUS_002");
        assert!(found[0].eta_minutes <= found[1].eta_minutes);
    }

    #[test]
    fn test_rejects_invalid_query_points() {
        let state = world();
        let bad = Point { lat: 95.0, lng: 0.0 };
        assert!(find_vehicles_between(&state, bad, DADAR, 1_000.0).is_err());
    }
}
