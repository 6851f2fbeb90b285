use chrono::Utc;
use compact_str::CompactString;
use std::time::Duration;

use crate::state::AppState;
use crate::types::EventKind;

/// Mark vehicles offline when no update has arrived within `timeout`.
///
/// Two passes: a lock-light scan collects candidates, then each candidate is
/// re-checked under its own entry lock before mutation; a vehicle that
/// updated (or was deactivated) between the passes is left alone. No lock is
/// held across the whole sweep. Only the online -> offline edge publishes,
/// so repeated sweeps over the same silent vehicle emit nothing new.
pub fn sweep_offline(state: &AppState, timeout: Duration) -> usize {
    let now = Utc::now().timestamp();
    let cutoff = now - timeout.as_secs() as i64;

    let mut stale: Vec<CompactString> = Vec::new();
    for r in state.vehicles.iter() {
        if r.online && r.last_update_at < cutoff {
            stale.push(r.key().clone());
        }
    }

    let mut flipped = 0;
    for vehicle_id in stale {
        if let Some(mut entry) = state.vehicles.get_mut(&vehicle_id) {
            let v = entry.value_mut();
            if v.online && v.last_update_at < cutoff {
                v.online = false;
                state.publish_vehicle_event(v, EventKind::WentOffline);
                flipped += 1;
            }
        }
    }

    if flipped > 0 {
        println!("Sweep: marked {} vehicle(s) offline.", flipped);
    }
    flipped
}
