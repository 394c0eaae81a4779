//! # Conflict Arbiter (C8)
//!
//! A snapshot set must not be touched by two operations at once. Two
//! independent checks are combined, matching the design's description of
//! the source's dual conflict-detection paths:
//!
//! 1. **Task-based**: scan every not-yet-ready task in the host scheduler's
//!    task graph; if any carries a `snapshot-setup` payload naming the same
//!    `set_id`, the new operation conflicts with that task's change.
//! 2. **Op-marker-based**: consult the in-memory `snapshot-ops` map
//!    (component C5) for an operation already marked in progress against
//!    the same `set_id`, independent of whether a task graph is involved
//!    at all (covers operations invoked directly, outside a change).
//!
//! Both checks run on every call; either one tripping is a conflict.

use crate::collab::{snapshot_setup, StateStore, TaskRunner};
use crate::error::{ConflictError, Result};
use crate::registry;

/// Checks `set_id` against both conflict sources, restricted to the task
/// kinds / op names in `conflicts_with` (e.g. a restore only conflicts with
/// an in-progress `forget-snapshot` or `export-snapshot`, not with another
/// `check-snapshot`). Returns `Err(ConflictError::ChangeInProgress)` or
/// `Err(ConflictError::OpInProgress)` on the first conflict found; `Ok(())`
/// if neither check finds one.
pub fn check_conflict(
    runner: &dyn TaskRunner,
    store: &dyn StateStore,
    set_id: u64,
    conflicts_with: &[&str],
) -> Result<()> {
    check_task_conflict(runner, set_id, conflicts_with)?;
    check_op_conflict(store, set_id, conflicts_with)?;
    Ok(())
}

fn check_task_conflict(runner: &dyn TaskRunner, set_id: u64, conflicts_with: &[&str]) -> Result<()> {
    for task_id in runner.tasks_not_ready() {
        let task = runner.task(task_id);
        if !conflicts_with.contains(&task.kind()) {
            continue;
        }
        let setup = snapshot_setup(task)?;
        if setup.set_id == set_id {
            return Err(ConflictError::ChangeInProgress {
                set_id,
                change_id: task.change_id(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_op_conflict(store: &dyn StateStore, set_id: u64, conflicts_with: &[&str]) -> Result<()> {
    if let Some(op) = registry::op_in_progress(store, set_id) {
        if conflicts_with.contains(&op.as_str()) {
            return Err(ConflictError::OpInProgress { set_id, op }.into());
        }
    }
    Ok(())
}
