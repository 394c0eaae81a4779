//! # Snapshot Set Registry (C5)
//!
//! Owns the two durable state-store keys the engine persists outside the
//! archive files themselves: the last-allocated `set_id` counter and the
//! per-set expiration schedule. Also owns the in-memory `snapshot-ops`
//! exclusion map the conflict arbiter (C8) consults alongside the task
//! graph.

use crate::collab::{get_optional, StateStore};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

const LAST_SET_ID_KEY: &str = "last-snapshot-set-id";
const EXPIRATIONS_KEY: &str = "snapshots-expiration";
const OPS_CACHE_KEY: &str = "snapshot-ops";

/// Allocates the next `set_id`: one more than the larger of the stored
/// counter and the highest `set_id` actually observed on disk (covering
/// the case where archive files exist without a matching counter value,
/// e.g. after a restore of an older state.json).
pub fn allocate_set_id(store: &mut dyn StateStore, highest_on_disk: u64) -> Result<u64> {
    let stored = get_optional(store, LAST_SET_ID_KEY)?
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let next = stored.max(highest_on_disk) + 1;
    store.set(LAST_SET_ID_KEY, serde_json::json!(next))?;
    Ok(next)
}

/// Records that `set_id` expires at `expiry` (auto-save retention).
pub fn save_expiration(
    store: &mut dyn StateStore,
    set_id: u64,
    expiry: DateTime<Utc>,
) -> Result<()> {
    let mut table = read_expirations(store)?;
    table.insert(set_id, expiry);
    write_expirations(store, &table)
}

/// Removes any expiration record for `set_id` (called by `Forget` and by
/// the auto-expire loop once a set has been removed).
pub fn remove_state(store: &mut dyn StateStore, set_id: u64) -> Result<()> {
    let mut table = read_expirations(store)?;
    if table.remove(&set_id).is_some() {
        write_expirations(store, &table)?;
    }
    Ok(())
}

/// Returns every `set_id` whose recorded expiration is at or before `now`,
/// sorted ascending.
pub fn expired_sets(store: &dyn StateStore, now: DateTime<Utc>) -> Result<Vec<u64>> {
    let table = read_expirations(store)?;
    let mut ids: Vec<u64> = table
        .into_iter()
        .filter(|(_, expiry)| *expiry <= now)
        .map(|(id, _)| id)
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

fn read_expirations(store: &dyn StateStore) -> Result<BTreeMap<u64, DateTime<Utc>>> {
    match get_optional(store, EXPIRATIONS_KEY)? {
        Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
        None => Ok(BTreeMap::new()),
    }
}

fn write_expirations(
    store: &mut dyn StateStore,
    table: &BTreeMap<u64, DateTime<Utc>>,
) -> Result<()> {
    let value = serde_json::to_value(table).map_err(crate::error::StateError::Serde)?;
    store.set(EXPIRATIONS_KEY, value)
}

/// Marks `set_id` as having operation `op` in progress, for the
/// op-marker half of the conflict check (component C8). This is an
/// in-memory-only cache slot, never persisted to durable state, mirroring
/// the design's separation between the task-based and op-marker-based
/// conflict checks.
pub fn set_op_in_progress(store: &mut dyn StateStore, set_id: u64, op: &str) {
    let mut ops = read_ops_cache(store);
    ops.insert(set_id, op.to_string());
    store.cache(OPS_CACHE_KEY, serde_json::to_value(&ops).unwrap_or_default());
}

/// Clears the op-in-progress marker for `set_id`.
pub fn unset_op_in_progress(store: &mut dyn StateStore, set_id: u64) {
    let mut ops = read_ops_cache(store);
    ops.remove(&set_id);
    store.cache(OPS_CACHE_KEY, serde_json::to_value(&ops).unwrap_or_default());
}

/// Looks up the in-progress operation name for `set_id`, if any.
pub fn op_in_progress(store: &dyn StateStore, set_id: u64) -> Option<String> {
    read_ops_cache(store).get(&set_id).cloned()
}

fn read_ops_cache(store: &dyn StateStore) -> BTreeMap<u64, String> {
    store
        .cached(OPS_CACHE_KEY)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeStore {
        persisted: RefCell<HashMap<String, serde_json::Value>>,
        cache: RefCell<HashMap<String, serde_json::Value>>,
    }

    impl StateStore for FakeStore {
        fn get(&self, key: &str) -> Result<serde_json::Value> {
            self.persisted
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| crate::error::StateError::NoState(key.to_string()).into())
        }
        fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
            self.persisted.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        fn cached(&self, key: &str) -> Option<serde_json::Value> {
            self.cache.borrow().get(key).cloned()
        }
        fn cache(&mut self, key: &str, value: serde_json::Value) {
            self.cache.borrow_mut().insert(key.to_string(), value);
        }
        fn uncache(&mut self, key: &str) {
            self.cache.borrow_mut().remove(key);
        }
    }

    #[test]
    fn set_id_allocation_is_monotonic() {
        let mut store = FakeStore::default();
        assert_eq!(allocate_set_id(&mut store, 0).unwrap(), 1);
        assert_eq!(allocate_set_id(&mut store, 0).unwrap(), 2);
        assert_eq!(allocate_set_id(&mut store, 10).unwrap(), 11);
        assert_eq!(allocate_set_id(&mut store, 5).unwrap(), 12);
    }

    #[test]
    fn expiration_roundtrip_and_sweep() {
        let mut store = FakeStore::default();
        let now = Utc::now();
        save_expiration(&mut store, 1, now - Duration::hours(1)).unwrap();
        save_expiration(&mut store, 2, now + Duration::hours(1)).unwrap();

        let expired = expired_sets(&store, now).unwrap();
        assert_eq!(expired, vec![1]);

        remove_state(&mut store, 1).unwrap();
        assert!(expired_sets(&store, now).unwrap().is_empty());
    }

    #[test]
    fn op_marker_roundtrip() {
        let mut store = FakeStore::default();
        assert!(op_in_progress(&store, 7).is_none());
        set_op_in_progress(&mut store, 7, "restore-snapshot");
        assert_eq!(op_in_progress(&store, 7), Some("restore-snapshot".to_string()));
        unset_op_in_progress(&mut store, 7);
        assert!(op_in_progress(&store, 7).is_none());
    }
}
