//! # Task Orchestrator (C6)
//!
//! Builds the task graphs the host scheduler runs for each user-visible
//! snapshot intent, and implements the do/undo/cleanup handlers for the
//! five task kinds the design names: `save-snapshot`, `restore-snapshot`,
//! `cleanup-after-restore`, `check-snapshot`, `forget-snapshot`.
//!
//! There is no real scheduler in this crate — [`crate::collab::TaskRunner`]
//! and [`crate::collab::Task`] are the seam a host package manager's
//! change/task machinery would sit behind. The functions here are grouped
//! in two halves: *builders*, which turn a user intent into one or more
//! tasks wired into a caller-owned `TaskRunner`, and *handlers*, which a
//! host scheduler would invoke at do/undo/cleanup time for a task of the
//! matching kind.

use crate::archive::OpenMode;
use crate::backend;
use crate::collab::{
    snapshot_setup, ConfigIO, SnapInfoLookup, SnapshotSetup, StateStore, Task, TaskId, TaskRunner,
    UserDb,
};
use crate::conflict;
use crate::error::{Result, SnapshotError};
use crate::restore_state::RestoreState;
use crate::config::RetentionPolicy;
use crate::snapshot::SnapshotOptions;
use crate::users;
use chrono::Utc;
use log::warn;
use std::path::Path;

pub const SAVE_SNAPSHOT: &str = "save-snapshot";
pub const RESTORE_SNAPSHOT: &str = "restore-snapshot";
pub const CLEANUP_AFTER_RESTORE: &str = "cleanup-after-restore";
pub const CHECK_SNAPSHOT: &str = "check-snapshot";
pub const FORGET_SNAPSHOT: &str = "forget-snapshot";
pub const EXPORT_SNAPSHOT: &str = "export-snapshot";

const RESTORE_STATE_KEY: &str = "restore-state";

/// Truncates a snap-ID to 7 hex chars for error messages, per the
/// compatibility-check error format.
fn truncate_snap_id(id: &str) -> String {
    id.chars().take(7).collect()
}

/// Collaborators a `do`/`undo` handler needs beyond the task graph itself.
pub struct Collaborators<'a> {
    pub snapshots_dir: &'a Path,
    pub snap_lookup: &'a dyn SnapInfoLookup,
    pub user_db: &'a dyn UserDb,
    pub config_io: &'a dyn ConfigIO,
    pub home_glob: &'a str,
}

// ─── Builders ───────────────────────────────────────────────────────────────

/// Resolves `Save`'s target list: an explicit `snap_names` list is looked up
/// as given; an empty or absent one expands to every active installed snap,
/// sorted by name. Each resolved name is paired with its current revision
/// via `snap_lookup`, since `build_save_tasks`'s per-snap tasks need it for
/// their `snapshot-setup` payload.
pub fn resolve_save_targets(
    snap_lookup: &dyn SnapInfoLookup,
    snap_names: Option<Vec<String>>,
) -> Result<Vec<(String, i64)>> {
    let names = match snap_names {
        Some(names) if !names.is_empty() => names,
        _ => {
            let mut all = snap_lookup.all_active_snap_names()?;
            all.sort();
            all
        }
    };
    names
        .into_iter()
        .map(|name| {
            let revision = snap_lookup.current_info(&name)?.revision;
            Ok((name, revision))
        })
        .collect()
}

/// Builds one `save-snapshot` task per target snap, after checking for a
/// conflicting in-flight operation against `set_id`.
pub fn build_save_tasks(
    runner: &mut dyn TaskRunner,
    _store: &dyn StateStore,
    set_id: u64,
    targets: &[(String, i64)],
    requested_users: Option<Vec<String>>,
    options: Option<SnapshotOptions>,
    auto: bool,
) -> Result<Vec<TaskId>> {
    // Save's exclusivity is enforced by the host's own change-conflict guard
    // over snap names, not by the C8 arbiter: a set-ID does not exist yet at
    // build time for a fresh save.
    let mut ids = Vec::with_capacity(targets.len());
    for (snap, current_revision) in targets {
        let id = runner.new_task(SAVE_SNAPSHOT, &format!("Save data for snap {snap}"));
        let setup = SnapshotSetup {
            set_id,
            snap: snap.clone(),
            users: requested_users.clone(),
            filename: None,
            current_revision: *current_revision,
            auto,
            options: options.clone(),
        };
        runner
            .task_mut(id)
            .set("snapshot-setup", serde_json::to_value(&setup)?);
        ids.push(id);
    }
    Ok(ids)
}

/// Builds one `restore-snapshot` task per target snap plus a trailing
/// `cleanup-after-restore` task that waits on all of them, so the cleanup
/// only runs after every restore in the set has either committed or been
/// reverted.
pub fn build_restore_tasks(
    runner: &mut dyn TaskRunner,
    store: &dyn StateStore,
    set_id: u64,
    targets: &[(String, i64)],
) -> Result<(Vec<TaskId>, TaskId)> {
    conflict::check_conflict(runner, store, set_id, &[FORGET_SNAPSHOT, EXPORT_SNAPSHOT])?;

    let mut restore_ids = Vec::with_capacity(targets.len());
    for (snap, current_revision) in targets {
        let id = runner.new_task(RESTORE_SNAPSHOT, &format!("Restore data for snap {snap}"));
        let setup = SnapshotSetup {
            set_id,
            snap: snap.clone(),
            users: None,
            filename: None,
            current_revision: *current_revision,
            auto: false,
            options: None,
        };
        runner
            .task_mut(id)
            .set("snapshot-setup", serde_json::to_value(&setup)?);
        restore_ids.push(id);
    }

    let cleanup_id = runner.new_task(
        CLEANUP_AFTER_RESTORE,
        &format!("Cleanup after restoring snapshot set #{set_id}"),
    );
    for &restore_id in &restore_ids {
        runner.add_wait(cleanup_id, restore_id);
    }

    Ok((restore_ids, cleanup_id))
}

/// Builds one `check-snapshot` task per target snap. Check is read-only;
/// it still goes through the conflict check so it cannot race a
/// concurrent forget of the same set.
pub fn build_check_tasks(
    runner: &mut dyn TaskRunner,
    store: &dyn StateStore,
    set_id: u64,
    snaps: &[String],
) -> Result<Vec<TaskId>> {
    conflict::check_conflict(runner, store, set_id, &[FORGET_SNAPSHOT])?;

    let mut ids = Vec::with_capacity(snaps.len());
    for snap in snaps {
        let id = runner.new_task(CHECK_SNAPSHOT, &format!("Check snapshot for snap {snap}"));
        let setup = SnapshotSetup {
            set_id,
            snap: snap.clone(),
            users: None,
            filename: None,
            current_revision: 0,
            auto: false,
            options: None,
        };
        runner
            .task_mut(id)
            .set("snapshot-setup", serde_json::to_value(&setup)?);
        ids.push(id);
    }
    Ok(ids)
}

/// Builds one `forget-snapshot` task per target snap.
pub fn build_forget_tasks(
    runner: &mut dyn TaskRunner,
    store: &dyn StateStore,
    set_id: u64,
    snaps: &[String],
) -> Result<Vec<TaskId>> {
    conflict::check_conflict(
        runner,
        store,
        set_id,
        &[CHECK_SNAPSHOT, RESTORE_SNAPSHOT, EXPORT_SNAPSHOT],
    )?;

    let mut ids = Vec::with_capacity(snaps.len());
    for snap in snaps {
        let id = runner.new_task(FORGET_SNAPSHOT, &format!("Forget snapshot for snap {snap}"));
        let setup = SnapshotSetup {
            set_id,
            snap: snap.clone(),
            users: None,
            filename: None,
            current_revision: 0,
            auto: false,
            options: None,
        };
        runner
            .task_mut(id)
            .set("snapshot-setup", serde_json::to_value(&setup)?);
        ids.push(id);
    }
    Ok(ids)
}

// ─── Handlers: save-snapshot ────────────────────────────────────────────────

/// `do` handler for `save-snapshot`: resolves the snap and user set, records
/// the eventual filename and (for an auto-snapshot) its expiry *before*
/// writing the archive, then calls [`backend::save`]. That ordering matters:
/// if the process dies partway, the filename/expiry bookkeeping this task
/// wrote is exactly what `undo` (which re-enters via `forget-snapshot`) needs
/// to clean up, even if the archive itself was never written.
pub fn do_save_snapshot(
    task: &mut dyn Task,
    collab: &Collaborators,
    store: &mut dyn StateStore,
    retention: RetentionPolicy,
    should_cancel: &dyn Fn() -> bool,
) -> Result<()> {
    let mut setup = snapshot_setup(task)?;
    let snap_info = collab.snap_lookup.current_info(&setup.snap)?;
    let requested = setup.users.clone().unwrap_or_default();
    let resolved_users = users::enumerate_users(collab.user_db, collab.home_glob, &requested)?;
    let config = collab.config_io.get_snap_config(&setup.snap)?;

    let mut stub = crate::snapshot::Snapshot::new(
        setup.set_id,
        &snap_info.snap_name,
        &snap_info.instance_name,
        &snap_info.snap_id,
        snap_info.revision,
        &snap_info.version,
        snap_info.epoch.clone(),
    );
    stub.auto = setup.auto;
    let filename = backend::filename(collab.snapshots_dir, &stub);
    setup.filename = Some(filename);
    task.set("snapshot-setup", serde_json::to_value(&setup)?);

    if setup.auto {
        if let Some(expiry) = retention.expiry_from(Utc::now()) {
            crate::registry::save_expiration(store, setup.set_id, expiry)?;
        }
    }

    let request = backend::SaveRequest {
        set_id: setup.set_id,
        snap: &snap_info,
        config,
        users: &resolved_users,
        options: setup.options.clone(),
        auto: setup.auto,
    };
    let result = backend::save(collab.snapshots_dir, request, should_cancel);

    if result.is_err() && setup.auto {
        crate::registry::remove_state(store, setup.set_id)?;
    }
    result?;
    Ok(())
}

/// `undo` handler for `save-snapshot`. The design specifies that save's undo
/// is forget's do: both need to remove the archive file (if one was written)
/// and the set's registry bookkeeping, so this simply re-enters
/// [`do_forget_snapshot`] rather than duplicating that logic.
pub fn undo_save_snapshot(
    task: &dyn Task,
    snapshots_dir: &Path,
    store: &mut dyn StateStore,
) -> Result<()> {
    do_forget_snapshot(task, snapshots_dir, store)
}

// ─── Handlers: restore-snapshot ─────────────────────────────────────────────

/// `do` handler for `restore-snapshot`: opens the archive named in the
/// task's setup, restores every payload entry, and stashes the resulting
/// `RestoreState` back onto the task so `undo` (full revert) or
/// `cleanup-after-restore` (finalize) can find it.
pub fn do_restore_snapshot(task: &mut dyn Task, collab: &Collaborators) -> Result<()> {
    let setup = snapshot_setup(task)?;
    let filename = setup
        .filename
        .clone()
        .ok_or_else(|| SnapshotError::internal("restore-snapshot task missing filename"))?;
    let reader = backend::open(&filename, OpenMode::TrustMetadata)?;

    let snap_info = collab.snap_lookup.current_info(&setup.snap)?;
    if !reader.snapshot.snap_id.is_empty()
        && !snap_info.snap_id.is_empty()
        && reader.snapshot.snap_id != snap_info.snap_id
    {
        return Err(crate::error::ArchiveError::SnapIdMismatch {
            snap: setup.snap.clone(),
            archive_id: truncate_snap_id(&reader.snapshot.snap_id),
            installed_id: truncate_snap_id(&snap_info.snap_id),
        }
        .into());
    }
    if !snap_info.epoch.can_read(&reader.snapshot.epoch.write) {
        return Err(crate::error::ArchiveError::UnreadableEpoch {
            snap: setup.snap.clone(),
            revision: setup.current_revision,
            archive_write: reader.snapshot.epoch.write.clone(),
            candidate_read: snap_info.epoch.read.clone(),
        }
        .into());
    }

    let requested = setup.users.clone().unwrap_or_default();
    let resolved_users = users::enumerate_users(collab.user_db, collab.home_glob, &requested)?;

    let pre_restore_config = collab.config_io.get_snap_config(&setup.snap)?;
    let request = backend::RestoreRequest {
        revision: setup.current_revision,
        users: &resolved_users,
        system_data_dir: &snap_info.data_dir,
        logf: &|line: &str| log::info!("{line}"),
    };
    let mut state = backend::restore(&reader, request)?;
    state.config = pre_restore_config.clone();

    // Always write the archive's `conf`, even when absent: a nil archived
    // config means "clear the live config" (`None`), not "skip the write"
    // and not the literal JSON `null` value. The restore-state isn't on the
    // task yet, so a failure here must revert the filesystem changes
    // directly rather than rely on the task runner's undo.
    if let Err(e) = collab
        .config_io
        .set_snap_config(&setup.snap, reader.snapshot.conf.clone())
    {
        state.revert();
        return Err(e);
    }

    task.set(RESTORE_STATE_KEY, serde_json::to_value(&state)?);
    Ok(())
}

/// `undo` handler for `restore-snapshot`: reverts every filesystem change
/// `do` made (and restores the pre-restore config, if the do handler got
/// that far), via the task's stored `RestoreState`.
pub fn undo_restore_snapshot(task: &mut dyn Task, collab: &Collaborators) -> Result<()> {
    let Some(value) = task.get(RESTORE_STATE_KEY) else {
        return Ok(());
    };
    let mut state: RestoreState = serde_json::from_value(value)?;
    if state.is_done() {
        return Ok(());
    }

    let setup = snapshot_setup(task)?;
    if let Err(e) = collab
        .config_io
        .set_snap_config(&setup.snap, state.config.clone())
    {
        warn!("failed to restore pre-restore config for {}: {e}", setup.snap);
    }

    state.revert();
    task.set(RESTORE_STATE_KEY, serde_json::to_value(&state)?);
    Ok(())
}

/// `cleanup` handler for `cleanup-after-restore`: for every restore task
/// this task waited on that finished successfully, finalizes its
/// `RestoreState` (removing the moved-aside originals). Restore tasks that
/// were undone instead have already reverted themselves and are skipped.
pub fn do_cleanup_after_restore(task: &dyn Task, runner: &dyn TaskRunner) -> Result<()> {
    for wait_id in task.wait_tasks() {
        let restore_task = runner.task(wait_id);
        if restore_task.status() != crate::collab::TaskStatus::Done {
            continue;
        }
        let Some(value) = restore_task.get(RESTORE_STATE_KEY) else {
            continue;
        };
        let mut state: RestoreState = serde_json::from_value(value)?;
        if !state.is_done() {
            state.cleanup();
        }
    }
    Ok(())
}

// ─── Handlers: check-snapshot ───────────────────────────────────────────────

/// `do` handler for `check-snapshot`: opens the named archive and verifies
/// every payload entry's hash. Read-only; has no `undo`.
pub fn do_check_snapshot(task: &dyn Task, collab: &Collaborators) -> Result<()> {
    let setup = snapshot_setup(task)?;
    let filename = setup
        .filename
        .clone()
        .ok_or_else(|| SnapshotError::internal("check-snapshot task missing filename"))?;
    let reader = backend::open(&filename, OpenMode::TrustMetadata)?;
    let user_filter = setup.users.unwrap_or_default();
    backend::check(&reader, &user_filter)?;
    let _ = collab.snapshots_dir;
    Ok(())
}

// ─── Handlers: forget-snapshot ──────────────────────────────────────────────

/// `do` handler for `forget-snapshot`: removes the archive file and its
/// registry bookkeeping. Irreversible by design — there is no meaningful
/// `undo` for a deleted archive, matching the source's behavior.
pub fn do_forget_snapshot(
    task: &dyn Task,
    snapshots_dir: &Path,
    store: &mut dyn StateStore,
) -> Result<()> {
    let setup = snapshot_setup(task)?;
    let filename = setup
        .filename
        .clone()
        .ok_or_else(|| SnapshotError::internal("forget-snapshot task missing filename"))?;
    let _ = snapshots_dir;
    // Registry bookkeeping goes first: auto snapshots have exactly one snap
    // per set, so this is unconditional, and clearing it before the unlink
    // matches the same state-before-file ordering the auto-expire loop uses.
    crate::registry::remove_state(store, setup.set_id)?;
    match std::fs::remove_file(&filename) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
