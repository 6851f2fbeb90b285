use crate::geo::EntityKind;
use crate::state::AppState;
use crate::types::Vehicle;
use compact_str::CompactString;

use anyhow::Result;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// One snapshot record per vehicle id, no positional history. Enough to
/// survive a restart with registrations and last-known state intact.
pub fn save_state(state: &AppState, dir: &str) -> Result<()> {
    let _ = std::fs::create_dir_all(dir);

    let vehicles_path = format!("{}/vehicles.bin", dir);

    // Collect DashMap to HashMap for serialization
    let mut snapshot: HashMap<CompactString, Vehicle> = HashMap::new();
    for r in state.vehicles.iter() {
        snapshot.insert(r.key().clone(), r.value().clone());
    }

    let f = File::create(vehicles_path)?;
    bincode::serialize_into(f, &snapshot)?;

    Ok(())
}

pub fn load_state(state: &AppState, dir: &str) -> Result<()> {
    let vehicles_path = format!("{}/vehicles.bin", dir);
    if !Path::new(&vehicles_path).exists() {
        return Ok(());
    }

    let f = File::open(vehicles_path)?;
    let snapshot: HashMap<CompactString, Vehicle> = bincode::deserialize_from(f)?;

    for (vehicle_id, vehicle) in snapshot {
        // Re-seed the geo index; deactivated vehicles stay out of it.
        if vehicle.active {
            if let Err(e) = state
                .geo
                .upsert(EntityKind::Vehicle, &vehicle_id, vehicle.position)
            {
                eprintln!("Skipping stored vehicle {} with bad position: {}", vehicle_id, e);
                continue;
            }
        }
        state.vehicles.insert(vehicle_id, vehicle);
    }
    println!("Loaded {} vehicle snapshot(s) from disk.", state.vehicles.len());

    Ok(())
}
