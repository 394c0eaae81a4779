//! # Auto-expire Loop (C7)
//!
//! `Ensure` is meant to be invoked periodically by the embedding host's own
//! scheduler (an ensure-loop tick, a cron-like timer — this crate has no
//! timer of its own). It is gated at 24h: a call within 24h of the last
//! successful sweep is a no-op. When it does run, every snapshot set whose
//! recorded expiration has passed is removed, but only if nothing is
//! currently using it.

use crate::backend;
use crate::collab::{StateStore, TaskRunner};
use crate::conflict;
use crate::error::Result;
use crate::registry;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::path::Path;

/// Task kinds that block an auto-expire sweep of a given set: an export or
/// check still reading the archive, or a restore still depending on it.
const CONFLICTS_WITH: &[&str] = &["export-snapshot", "check-snapshot", "restore-snapshot"];

const LAST_RUN_KEY: &str = "snapshots-auto-expire-last-run";

fn sweep_interval() -> Duration {
    Duration::hours(24)
}

fn read_last_run(store: &dyn StateStore) -> Option<DateTime<Utc>> {
    crate::collab::get_optional(store, LAST_RUN_KEY)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
}

fn write_last_run(store: &mut dyn StateStore, at: DateTime<Utc>) -> Result<()> {
    let value = serde_json::to_value(at).map_err(crate::error::StateError::Serde)?;
    store.set(LAST_RUN_KEY, value)
}

/// Runs one sweep if 24h have passed since the last one; otherwise returns
/// immediately. Returns the set-IDs actually removed this call.
pub fn ensure(
    snapshots_dir: &Path,
    store: &mut dyn StateStore,
    runner: &dyn TaskRunner,
    now: DateTime<Utc>,
) -> Result<Vec<u64>> {
    if let Some(last_run) = read_last_run(store) {
        if now - last_run < sweep_interval() {
            return Ok(Vec::new());
        }
    }

    let expired = registry::expired_sets(store, now)?;
    if expired.is_empty() {
        write_last_run(store, now)?;
        return Ok(Vec::new());
    }

    let mut remaining: std::collections::BTreeSet<u64> = expired.iter().copied().collect();
    let mut removed = Vec::new();

    let snapshots_dir_owned = snapshots_dir.to_path_buf();
    backend::iter(snapshots_dir, |reader| {
        let set_id = reader.snapshot.set_id;
        if !remaining.contains(&set_id) {
            return Ok(());
        }
        if conflict::check_conflict(runner, store, set_id, CONFLICTS_WITH).is_err() {
            // Still in use; leave it for the next cycle.
            return Ok(());
        }

        // State-first, then file: an unlink failure never leaves a set
        // whose registry bookkeeping says "gone" but whose archive lingers
        // forever unswept, since the next sweep still has the file to find
        // via Iter even if it no longer has the expiration entry.
        if let Err(e) = registry::remove_state(store, set_id) {
            warn!("auto-expire: failed to remove registry state for set #{set_id}: {e}");
            return Ok(());
        }
        let path = backend::filename(&snapshots_dir_owned, &reader.snapshot);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("auto-expire: removed snapshot set #{set_id}");
                remaining.remove(&set_id);
                removed.push(set_id);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                remaining.remove(&set_id);
                removed.push(set_id);
            }
            Err(e) => warn!("auto-expire: failed to remove archive for set #{set_id}: {e}"),
        }
        Ok(())
    })?;

    if remaining.is_empty() {
        write_last_run(store, now)?;
    }

    Ok(removed)
}
