use anyhow::{Context, Result};
use compact_str::CompactString;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::geo::{EntityKind, GeoIndex};
use crate::types::{Route, RouteMembership, Stop};

/// The document shape the external catalog publishes. Stops may omit their
/// memberships; we rebuild them from the route stop lists either way.
#[derive(Debug, Deserialize)]
pub struct CatalogDocument {
    pub routes: Vec<Route>,
    pub stops: Vec<Stop>,
}

#[derive(Default)]
pub struct CatalogData {
    pub routes: HashMap<CompactString, Route>,
    pub stops: HashMap<CompactString, Stop>,
}

/// Read-mostly cache of the route/stop reference data. The engine never
/// writes to the catalog; it swaps in whole snapshots from the external
/// source and answers point lookups from the latest one.
pub struct CatalogManager {
    source: String,
    data: Arc<RwLock<CatalogData>>,
}

impl CatalogManager {
    pub fn new(source: String) -> Self {
        Self {
            source,
            data: Arc::new(RwLock::new(CatalogData::default())),
        }
    }

    // Try to load immediately (blocking), returns error if fails
    pub fn load_initial(&self, geo: &GeoIndex) -> Result<()> {
        log_info("Performing initial catalog load...");
        let doc = Self::fetch_document(&self.source)?;
        self.install_document(doc, geo);
        log_info("Initial catalog load complete.");
        Ok(())
    }

    pub fn start_updater(&self, geo: Arc<GeoIndex>) {
        let data_clone = self.data.clone();
        let source = self.source.clone();

        thread::spawn(move || {
            loop {
                // Refresh hourly; a failed fetch keeps the previous snapshot.
                thread::sleep(Duration::from_secs(3600));
                log_info("Refreshing catalog data...");
                match Self::fetch_document(&source) {
                    Ok(doc) => {
                        let new_data = Self::build(doc);
                        install(&data_clone, new_data, &geo);
                        log_info("Catalog refreshed successfully.");
                    }
                    Err(e) => {
                        eprintln!("Failed to refresh catalog: {:?}", e);
                    }
                }
            }
        });
    }

    /// Swap in a catalog snapshot directly. This is the same path the
    /// background refresh takes; tests and embedded setups feed it documents
    /// without a file or URL in between.
    pub fn install_document(&self, doc: CatalogDocument, geo: &GeoIndex) {
        let new_data = Self::build(doc);
        install(&self.data, new_data, geo);
    }

    pub fn get_route(&self, route_id: &str) -> Option<Route> {
        self.data.read().unwrap().routes.get(route_id).cloned()
    }

    pub fn get_stop(&self, stop_id: &str) -> Option<Stop> {
        self.data.read().unwrap().stops.get(stop_id).cloned()
    }

    pub fn has_data(&self) -> bool {
        !self.data.read().unwrap().stops.is_empty()
    }

    fn fetch_document(source: &str) -> Result<CatalogDocument> {
        let raw = if source.starts_with("http://") || source.starts_with("https://") {
            reqwest::blocking::get(source)
                .with_context(|| format!("catalog fetch failed: {}", source))?
                .text()?
        } else {
            std::fs::read_to_string(source)
                .with_context(|| format!("catalog file not readable: {}", source))?
        };
        let doc: CatalogDocument = serde_json::from_str(&raw).context("catalog JSON invalid")?;
        Ok(doc)
    }

    fn build(doc: CatalogDocument) -> CatalogData {
        let mut data = CatalogData::default();

        for mut route in doc.routes {
            route.stops.sort_by_key(|s| s.sequence);
            data.routes.insert(route.route_id.clone(), route);
        }

        for stop in doc.stops {
            data.stops.insert(stop.stop_id.clone(), stop);
        }

        // Rebuild stop -> route memberships from the route stop lists, so a
        // stop document that omits them still answers "which routes serve me".
        for route in data.routes.values() {
            for rs in &route.stops {
                if let Some(stop) = data.stops.get_mut(&rs.stop_id) {
                    let already = stop
                        .memberships
                        .iter()
                        .any(|m| m.route_id == route.route_id && m.sequence == rs.sequence);
                    if !already {
                        stop.memberships.push(RouteMembership {
                            route_id: route.route_id.clone(),
                            sequence: rs.sequence,
                        });
                    }
                }
            }
        }

        println!(
            "Catalog built: {} routes, {} stops",
            data.routes.len(),
            data.stops.len()
        );

        data
    }
}

/// Swap the snapshot and bring the geo index in line: upsert every stop in
/// the new data, drop the ones that vanished.
fn install(data: &Arc<RwLock<CatalogData>>, new_data: CatalogData, geo: &GeoIndex) {
    let removed: Vec<CompactString> = {
        let old = data.read().unwrap();
        old.stops
            .keys()
            .filter(|id| !new_data.stops.contains_key(*id))
            .cloned()
            .collect()
    };

    for (stop_id, stop) in &new_data.stops {
        if let Err(e) = geo.upsert(EntityKind::Stop, stop_id, stop.position) {
            eprintln!("Skipping stop {} with bad position: {}", stop_id, e);
        }
    }
    for stop_id in removed {
        geo.remove(EntityKind::Stop, &stop_id);
    }

    let mut d = data.write().unwrap();
    *d = new_data;
}

fn log_info(msg: &str) {
    println!("[{}] {}", chrono::Utc::now().to_rfc3339(), msg);
}
