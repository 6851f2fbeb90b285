use anyhow::Result;
use compact_str::CompactString;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use warp::Filter;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};

mod broadcast;
mod catalog;
mod geo;
mod ingest;
mod journey;
mod persistence;
mod state;
mod sweep;
mod types;

use broadcast::Topic;
use geo::EntityKind;
use ingest::{PositionUpdate, ingest};
use journey::{JourneyOutcome, find_vehicles_between};
use persistence::{load_state, save_state};
use state::AppState;
use sweep::sweep_offline;
use types::{Point, TrackerError, VehicleRegistration, VehicleStatus};

const DATA_DIR: &str = "./data";

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize State
    println!("Initializing Fleet State...");
    let data_dir = std::env::var("FLEET_DATA_DIR").unwrap_or_else(|_| DATA_DIR.to_string());
    let catalog_source = std::env::var("CATALOG_SOURCE")
        .unwrap_or_else(|_| format!("{}/catalog.json", data_dir));
    let offline_timeout = env_secs("OFFLINE_TIMEOUT_SECS", 120);
    let sweep_interval = env_secs("SWEEP_INTERVAL_SECS", 30);

    let state = Arc::new(AppState::new(catalog_source));

    // 2. Load Persistence (Recovery)
    if let Err(e) = load_state(&state, &data_dir) {
        eprintln!("Warning: Failed to load previous state: {}", e);
    }

    // 3. Load Catalog (Background Refresh)
    // The catalog fetch is blocking (file read or blocking HTTP), so it runs
    // off the async runtime.
    let state_clone_catalog = state.clone();
    let loaded =
        tokio::task::spawn_blocking(move || {
            state_clone_catalog
                .catalog
                .load_initial(&state_clone_catalog.geo)
        })
        .await?;
    if let Err(e) = loaded {
        eprintln!(
            "Warning: Initial catalog load failed: {}. Background updater will retry.",
            e
        );
    }
    state.catalog.start_updater(state.geo.clone());

    // 4. Staleness Sweep Loop
    let state_clone_sweep = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            sweep_offline(&state_clone_sweep, offline_timeout);
        }
    });

    // 5. Persistence Loop
    let state_clone_persist = state.clone();
    let data_dir_persist = data_dir.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if let Err(e) = save_state(&state_clone_persist, &data_dir_persist) {
                eprintln!("Error saving state: {}", e);
            }
        }
    });

    // 6. HTTP Server
    // Use .boxed() to simplify types
    let state_filter_base = state.clone();
    let state_filter = warp::any().map(move || state_filter_base.clone()).boxed();

    // POST /location
    let location_route = warp::path("location")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|update: PositionUpdate, state: Arc<AppState>| match ingest(&state, update) {
            Ok(ack) => warp::reply::with_status(
                warp::reply::json(&json!({
                    "accepted": true,
                    "vehicleId": ack.vehicle_id,
                    "status": ack.status,
                    "occupancyPercentage": ack.occupancy_percentage,
                })),
                StatusCode::OK,
            ),
            Err(e) => rejection_reply(&e),
        });

    // GET /nearby
    let nearby_route = warp::path("nearby")
        .and(warp::get())
        .and(warp::query::<NearbyQuery>())
        .and(state_filter.clone())
        .map(|q: NearbyQuery, state: Arc<AppState>| {
            let center = Point { lat: q.lat, lng: q.lng };
            let kind = q.kind.unwrap_or(EntityKind::Vehicle);
            match state.geo.query_radius(center, q.radius_meters, kind, q.limit) {
                Ok(hits) => {
                    let body: Vec<NearbyHit> = hits
                        .into_iter()
                        .map(|(entity_id, distance_meters)| NearbyHit {
                            entity_id,
                            distance_meters,
                        })
                        .collect();
                    warp::reply::with_status(warp::reply::json(&body), StatusCode::OK)
                }
                Err(e) => rejection_reply(&e),
            }
        });

    // POST /journey
    let journey_route = warp::path("journey")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|req: JourneyRequest, state: Arc<AppState>| {
            let origin = Point {
                lat: req.origin.lat,
                lng: req.origin.lng,
            };
            let destination = Point {
                lat: req.destination.lat,
                lng: req.destination.lng,
            };
            match find_vehicles_between(&state, origin, destination, req.max_walk_radius) {
                Ok(JourneyOutcome::Matches(matches)) => warp::reply::with_status(
                    warp::reply::json(&json!({
                        "matches": matches,
                        "noDirectService": false,
                    })),
                    StatusCode::OK,
                ),
                Ok(JourneyOutcome::NoDirectService) => warp::reply::with_status(
                    warp::reply::json(&json!({
                        "matches": [],
                        "noDirectService": true,
                    })),
                    StatusCode::OK,
                ),
                Err(e) => rejection_reply(&e),
            }
        });

    // POST /vehicles (registration, called by the fleet-admin side)
    let register_route = warp::path("vehicles")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|reg: VehicleRegistration, state: Arc<AppState>| {
            let vehicle_id = reg.vehicle_id.clone();
            match state.register_vehicle(reg) {
                Ok(()) => warp::reply::with_status(
                    warp::reply::json(&json!({ "registered": true, "vehicleId": vehicle_id })),
                    StatusCode::OK,
                ),
                Err(e) => rejection_reply(&e),
            }
        });

    // GET /vehicles/:id
    let vehicle_route = warp::path("vehicles")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(state_filter.clone())
        .map(|vehicle_id: String, state: Arc<AppState>| {
            let Some(v) = state.snapshot(&vehicle_id) else {
                return rejection_reply(&TrackerError::UnknownVehicle(CompactString::from(
                    vehicle_id,
                )));
            };
            let nearby_stops = state
                .geo
                .query_radius(v.position, 2_000.0, EntityKind::Stop, 5)
                .unwrap_or_default();
            let eta_to_nearest_stop = nearby_stops.first().and_then(|(stop_id, _)| {
                let stop_pos = state.geo.position_of(EntityKind::Stop, stop_id)?;
                journey::eta_minutes_at_speed(v.position, stop_pos, v.speed?)
            });
            let stops: Vec<NearbyHit> = nearby_stops
                .into_iter()
                .map(|(entity_id, distance_meters)| NearbyHit {
                    entity_id,
                    distance_meters,
                })
                .collect();
            warp::reply::with_status(
                warp::reply::json(&json!({
                    "vehicle": v,
                    "occupancyPercentage": v.occupancy_percentage(),
                    "etaToNearestStopMinutes": eta_to_nearest_stop,
                    "nearbyStops": stops,
                })),
                StatusCode::OK,
            )
        });

    // POST /vehicles/:id/status (operator action)
    let status_route = warp::path("vehicles")
        .and(warp::path::param::<String>())
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|vehicle_id: String, change: StatusChange, state: Arc<AppState>| {
            match state.set_status(&vehicle_id, change.status) {
                Ok(v) => warp::reply::with_status(
                    warp::reply::json(&json!({
                        "vehicleId": v.vehicle_id,
                        "status": v.status,
                    })),
                    StatusCode::OK,
                ),
                Err(e) => rejection_reply(&e),
            }
        });

    // DELETE /vehicles/:id (deactivation; the record stays, the vehicle
    // drops out of every query surface)
    let deactivate_route = warp::path("vehicles")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(state_filter.clone())
        .map(|vehicle_id: String, state: Arc<AppState>| {
            match state.deactivate_vehicle(&vehicle_id) {
                Ok(()) => warp::reply::with_status(
                    warp::reply::json(&json!({ "deactivated": true, "vehicleId": vehicle_id })),
                    StatusCode::OK,
                ),
                Err(e) => rejection_reply(&e),
            }
        });

    // GET /routes/:id/vehicles
    let route_vehicles_route = warp::path("routes")
        .and(warp::path::param::<String>())
        .and(warp::path("vehicles"))
        .and(warp::path::end())
        .and(warp::get())
        .and(state_filter.clone())
        .map(|route_id: String, state: Arc<AppState>| {
            let Some(route) = state.catalog.get_route(&route_id) else {
                return warp::reply::with_status(
                    warp::reply::json(&json!({ "error": "unknown_route" })),
                    StatusCode::NOT_FOUND,
                );
            };
            let mut vehicles = Vec::new();
            let mut online = 0usize;
            for r in state.vehicles.iter() {
                let v = r.value();
                if !v.active || v.route_id.as_deref() != Some(route_id.as_str()) {
                    continue;
                }
                if v.online {
                    online += 1;
                }
                vehicles.push(json!({
                    "vehicle": v,
                    "occupancyPercentage": v.occupancy_percentage(),
                }));
            }
            warp::reply::with_status(
                warp::reply::json(&json!({
                    "route": {
                        "routeId": route.route_id,
                        "name": route.name,
                        "routeType": route.route_type,
                    },
                    "vehicles": vehicles,
                    "totalVehicles": vehicles.len(),
                    "onlineVehicles": online,
                })),
                StatusCode::OK,
            )
        });

    // PUT /riders/:id/location
    // Riders are transient points in the geo index, not engine-owned records;
    // rider apps push these so dashboards can see waiting demand near stops.
    let rider_location_route = warp::path("riders")
        .and(warp::path::param::<String>())
        .and(warp::path("location"))
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|rider_id: String, loc: LatLng, state: Arc<AppState>| {
            let rider_id = CompactString::from(rider_id);
            let point = Point {
                lat: loc.lat,
                lng: loc.lng,
            };
            match state.geo.upsert(EntityKind::Rider, &rider_id, point) {
                Ok(()) => warp::reply::with_status(
                    warp::reply::json(&json!({ "updated": true, "riderId": rider_id })),
                    StatusCode::OK,
                ),
                Err(e) => rejection_reply(&e),
            }
        });

    // DELETE /riders/:id
    let rider_forget_route = warp::path("riders")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(state_filter.clone())
        .map(|rider_id: String, state: Arc<AppState>| {
            state.geo.remove(EntityKind::Rider, &CompactString::from(rider_id.as_str()));
            warp::reply::with_status(
                warp::reply::json(&json!({ "forgotten": true, "riderId": rider_id })),
                StatusCode::OK,
            )
        });

    // GET /events?topic=vehicle:<id>|route:<id>|global (WebSocket)
    let events_route = warp::path("events")
        .and(warp::ws())
        .and(warp::query::<EventsQuery>())
        .and(state_filter.clone())
        .map(|ws: warp::ws::Ws, q: EventsQuery, state: Arc<AppState>| {
            ws.on_upgrade(move |socket| handle_events_socket(socket, q.topic, state))
        });

    let routes = location_route
        .or(nearby_route)
        .or(journey_route)
        .or(register_route)
        .or(status_route)
        .or(vehicle_route)
        .or(deactivate_route)
        .or(route_vehicles_route)
        .or(rider_location_route)
        .or(rider_forget_route)
        .or(events_route)
        .boxed();

    let server_port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT env variable");
    println!("Server running at http://localhost:{}", server_port);
    warp::serve(routes).run(([0, 0, 0, 0], server_port)).await;

    Ok(())
}

/// Bridge one broadcast subscription onto a WebSocket. Runs until the client
/// goes away; the subscription is torn down on the way out, so a dead socket
/// costs the broadcaster nothing past its final failed send.
async fn handle_events_socket(socket: WebSocket, topic: Option<String>, state: Arc<AppState>) {
    let topic = match topic.as_deref() {
        None => Topic::Global,
        Some(raw) => match Topic::parse(raw) {
            Some(t) => t,
            None => {
                // Unusable topic: say so and hang up.
                let (mut tx, _) = socket.split();
                let _ = tx
                    .send(Message::text(
                        json!({ "error": "invalid_topic" }).to_string(),
                    ))
                    .await;
                let _ = tx.send(Message::close()).await;
                return;
            }
        },
    };

    let mut sub = state.broadcaster.subscribe(topic.clone());
    println!("Observer subscribed to {}", topic);

    let (mut tx, mut rx_ws) = socket.split();
    loop {
        tokio::select! {
            event = sub.rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if tx.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            incoming = rx_ws.next() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(msg)) if msg.is_close() => break,
                    // Anything else from the client is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&sub.topic, sub.id);
    println!("Observer unsubscribed from {}", topic);
}

fn rejection_reply(e: &TrackerError) -> warp::reply::WithStatus<warp::reply::Json> {
    let code = match e {
        TrackerError::UnknownVehicle(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    warp::reply::with_status(
        warp::reply::json(&json!({
            "accepted": false,
            "reason": e.reason(),
            "message": e.to_string(),
        })),
        code,
    )
}

fn default_radius() -> f64 {
    1_000.0
}

fn default_limit() -> usize {
    20
}

fn default_walk_radius() -> f64 {
    1_000.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    #[serde(default = "default_radius")]
    radius_meters: f64,
    #[serde(default)]
    kind: Option<EntityKind>,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NearbyHit {
    entity_id: CompactString,
    distance_meters: f64,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JourneyRequest {
    origin: LatLng,
    destination: LatLng,
    #[serde(default = "default_walk_radius")]
    max_walk_radius: f64,
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: VehicleStatus,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    topic: Option<String>,
}
