//! End-to-end coverage of the task orchestrator (C6) against a fake task
//! runner and the real archive backend: save, restore (with a rollback
//! path), check, and forget, each driven through its builder and handler
//! exactly as a host scheduler would.

use snapshot_core::collab::{
    ConfigIO, SnapInfo, SnapInfoLookup, StateStore, Task, TaskId, TaskRunner, TaskStatus, UserDb,
    UserRecord,
};
use snapshot_core::config::RetentionPolicy;
use snapshot_core::error::{Result, SnapshotError, UserError};
use snapshot_core::orchestrator::{self, Collaborators};
use snapshot_core::snapshot::Epoch;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

// ─── Fakes ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeStore {
    persisted: HashMap<String, serde_json::Value>,
    cache: HashMap<String, serde_json::Value>,
}

impl StateStore for FakeStore {
    fn get(&self, key: &str) -> Result<serde_json::Value> {
        self.persisted
            .get(key)
            .cloned()
            .ok_or_else(|| snapshot_core::error::StateError::NoState(key.to_string()).into())
    }
    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.persisted.insert(key.to_string(), value);
        Ok(())
    }
    fn cached(&self, key: &str) -> Option<serde_json::Value> {
        self.cache.get(key).cloned()
    }
    fn cache(&mut self, key: &str, value: serde_json::Value) {
        self.cache.insert(key.to_string(), value);
    }
    fn uncache(&mut self, key: &str) {
        self.cache.remove(key);
    }
}

struct FakeTask {
    id: TaskId,
    kind: String,
    status: TaskStatus,
    data: HashMap<String, serde_json::Value>,
    waits: Vec<TaskId>,
}

impl Task for FakeTask {
    fn id(&self) -> TaskId {
        self.id
    }
    fn kind(&self) -> &str {
        &self.kind
    }
    fn change_id(&self) -> String {
        "1".to_string()
    }
    fn status(&self) -> TaskStatus {
        self.status
    }
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.get(key).cloned()
    }
    fn set(&mut self, key: &str, value: serde_json::Value) {
        self.data.insert(key.to_string(), value);
    }
    fn wait_tasks(&self) -> Vec<TaskId> {
        self.waits.clone()
    }
}

#[derive(Default)]
struct FakeRunner {
    tasks: HashMap<TaskId, FakeTask>,
    next_id: TaskId,
}

impl TaskRunner for FakeRunner {
    fn new_task(&mut self, kind: &str, _summary: &str) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            FakeTask {
                id,
                kind: kind.to_string(),
                status: TaskStatus::Do,
                data: HashMap::new(),
                waits: Vec::new(),
            },
        );
        id
    }
    fn add_wait(&mut self, task: TaskId, waits_for: TaskId) {
        self.tasks.get_mut(&task).unwrap().waits.push(waits_for);
    }
    fn task(&self, id: TaskId) -> &dyn Task {
        self.tasks.get(&id).unwrap()
    }
    fn task_mut(&mut self, id: TaskId) -> &mut dyn Task {
        self.tasks.get_mut(&id).unwrap()
    }
    fn tasks_not_ready(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| !t.status.is_ready())
            .map(|t| t.id)
            .collect()
    }
}

impl FakeRunner {
    fn set_status(&mut self, id: TaskId, status: TaskStatus) {
        self.tasks.get_mut(&id).unwrap().status = status;
    }
}

struct FakeSnapInfoLookup {
    info: SnapInfo,
}

impl SnapInfoLookup for FakeSnapInfoLookup {
    fn current_info(&self, _instance_name: &str) -> Result<SnapInfo> {
        Ok(self.info.clone())
    }
    fn all_active_snap_names(&self) -> Result<Vec<String>> {
        Ok(vec![self.info.instance_name.clone()])
    }
}

#[derive(Default)]
struct FakeConfigIO {
    config: RefCell<Option<serde_json::Value>>,
}

impl ConfigIO for FakeConfigIO {
    fn get_snap_config(&self, _instance_name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.config.borrow().clone())
    }
    fn set_snap_config(&self, _instance_name: &str, value: Option<serde_json::Value>) -> Result<()> {
        *self.config.borrow_mut() = value;
        Ok(())
    }
}

struct NoUsers;

impl UserDb for NoUsers {
    fn lookup(&self, name: &str) -> std::result::Result<UserRecord, UserError> {
        Err(UserError::UnknownUser(name.to_string()))
    }
    fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError> {
        Err(UserError::UnknownUid(uid))
    }
}

/// Resolves exactly one known user record by name, standing in for a real
/// passwd-backed `UserDb` in tests that exercise the per-user restore path.
struct OneUser(UserRecord);

impl UserDb for OneUser {
    fn lookup(&self, name: &str) -> std::result::Result<UserRecord, UserError> {
        if name == self.0.username {
            Ok(self.0.clone())
        } else {
            Err(UserError::UnknownUser(name.to_string()))
        }
    }
    fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError> {
        if uid == self.0.uid {
            Ok(self.0.clone())
        } else {
            Err(UserError::UnknownUid(uid))
        }
    }
}

#[cfg(unix)]
fn current_uid_gid(path: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path).unwrap();
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn current_uid_gid(_path: &Path) -> (u32, u32) {
    (0, 0)
}

fn make_data_dir(root: &Path, revision: &str, files: &[(&str, &str)]) -> PathBuf {
    let data_dir = root.join("data");
    let rev_dir = data_dir.join(revision);
    let common_dir = data_dir.join("common");
    fs::create_dir_all(&rev_dir).unwrap();
    fs::create_dir_all(&common_dir).unwrap();
    for (name, content) in files {
        fs::write(rev_dir.join(name), content).unwrap();
    }
    data_dir
}

fn snap_info(revision: i64, data_dir: PathBuf, epoch: Epoch) -> SnapInfo {
    SnapInfo {
        snap_name: "hello".into(),
        instance_name: "hello".into(),
        snap_id: "hello-id".into(),
        revision,
        version: "1.0".into(),
        epoch,
        data_dir,
        common_dir: PathBuf::new(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[test]
fn save_then_restore_round_trips_through_the_task_graph() {
    let root = tempdir().unwrap();
    let snapshots_dir = root.path().join("snapshots");
    let data_dir = make_data_dir(root.path(), "42", &[("config.txt", "hello world")]);
    let info = snap_info(42, data_dir, Epoch::zero());

    let mut store = FakeStore::default();
    let mut runner = FakeRunner::default();
    let lookup = FakeSnapInfoLookup { info: info.clone() };
    let config_io = FakeConfigIO::default();
    let user_db = NoUsers;

    let save_ids =
        orchestrator::build_save_tasks(&mut runner, &store, 1, &[("hello".into(), 42)], None, None, false)
            .unwrap();
    assert_eq!(save_ids.len(), 1);

    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(save_ids[0]);
        orchestrator::do_save_snapshot(task, &collab, &mut store, RetentionPolicy::Disabled, &|| false)
            .expect("save succeeds");
    }
    runner.set_status(save_ids[0], TaskStatus::Done);

    let setup_after_save: snapshot_core::collab::SnapshotSetup =
        serde_json::from_value(runner.task(save_ids[0]).get("snapshot-setup").unwrap()).unwrap();
    let filename = setup_after_save.filename.clone().expect("save recorded its filename");
    assert!(filename.exists());

    let (restore_ids, cleanup_id) =
        orchestrator::build_restore_tasks(&mut runner, &store, 1, &[("hello".into(), 42)]).unwrap();
    assert_eq!(restore_ids.len(), 1);

    // The builder only knows the snap and revision; populating filename from
    // the save is the host scheduler's job in the real system (it reads the
    // set's snapshots out of the registry). Simulate that here.
    {
        let task = runner.task_mut(restore_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename.clone());
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }

    let restore_target = root.path().join("restored");
    let restore_info = snap_info(42, restore_target.clone(), Epoch::zero());
    let restore_lookup = FakeSnapInfoLookup { info: restore_info };

    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &restore_lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(restore_ids[0]);
        orchestrator::do_restore_snapshot(task, &collab).expect("restore succeeds");
    }
    runner.set_status(restore_ids[0], TaskStatus::Done);

    orchestrator::do_cleanup_after_restore(runner.task(cleanup_id), &runner).expect("cleanup succeeds");

    let restored_file = restore_target.join("42").join("config.txt");
    assert_eq!(fs::read_to_string(restored_file).unwrap(), "hello world");
}

#[test]
fn save_then_restore_round_trips_per_user_data_through_the_task_graph() {
    let root = tempdir().unwrap();
    let snapshots_dir = root.path().join("snapshots");
    let data_dir = make_data_dir(root.path(), "42", &[("config.txt", "hello world")]);
    let info = snap_info(42, data_dir, Epoch::zero());

    let home_root = tempdir().unwrap();
    let home = home_root.path().join("alice");
    let user_rev_dir = home.join("hello").join("42");
    fs::create_dir_all(&user_rev_dir).unwrap();
    fs::create_dir_all(home.join("hello").join("common")).unwrap();
    fs::write(user_rev_dir.join("profile.txt"), "alice's data").unwrap();

    let (uid, gid) = current_uid_gid(home_root.path());
    let alice = UserRecord {
        uid,
        gid,
        home: home.clone(),
        username: "alice".into(),
    };

    let mut store = FakeStore::default();
    let mut runner = FakeRunner::default();
    let lookup = FakeSnapInfoLookup { info: info.clone() };
    let config_io = FakeConfigIO::default();
    let user_db = OneUser(alice);

    let save_ids = orchestrator::build_save_tasks(
        &mut runner,
        &store,
        1,
        &[("hello".into(), 42)],
        Some(vec!["alice".into()]),
        None,
        false,
    )
    .unwrap();

    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(save_ids[0]);
        orchestrator::do_save_snapshot(task, &collab, &mut store, RetentionPolicy::Disabled, &|| false)
            .expect("save succeeds");
    }
    runner.set_status(save_ids[0], TaskStatus::Done);

    let setup_after_save: snapshot_core::collab::SnapshotSetup =
        serde_json::from_value(runner.task(save_ids[0]).get("snapshot-setup").unwrap()).unwrap();
    let filename = setup_after_save.filename.clone().expect("save recorded its filename");
    assert!(filename.exists());

    let (restore_ids, cleanup_id) =
        orchestrator::build_restore_tasks(&mut runner, &store, 1, &[("hello".into(), 42)]).unwrap();
    {
        let task = runner.task_mut(restore_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename.clone());
        setup.users = Some(vec!["alice".into()]);
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }

    // Wipe the live per-user data so restore has to recreate it.
    fs::remove_dir_all(home.join("hello")).unwrap();

    let restore_target = root.path().join("restored");
    let restore_info = snap_info(42, restore_target.clone(), Epoch::zero());
    let restore_lookup = FakeSnapInfoLookup { info: restore_info };

    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &restore_lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(restore_ids[0]);
        orchestrator::do_restore_snapshot(task, &collab).expect("restore succeeds");
    }
    runner.set_status(restore_ids[0], TaskStatus::Done);

    orchestrator::do_cleanup_after_restore(runner.task(cleanup_id), &runner).expect("cleanup succeeds");

    let restored_system_file = restore_target.join("42").join("config.txt");
    assert_eq!(fs::read_to_string(restored_system_file).unwrap(), "hello world");

    let restored_user_file = home.join("hello").join("42").join("profile.txt");
    assert_eq!(
        fs::read_to_string(restored_user_file).unwrap(),
        "alice's data",
        "per-user data must be restored under <home>/<instance_name>/<revision>, mirroring Save"
    );
    assert!(
        !home.join("42").exists(),
        "per-user restore must not land directly under <home>"
    );
}

#[test]
fn restore_rejects_an_incompatible_epoch_before_touching_the_filesystem() {
    let root = tempdir().unwrap();
    let snapshots_dir = root.path().join("snapshots");
    let data_dir = make_data_dir(root.path(), "1", &[("f", "x")]);
    let write_epoch = Epoch { read: vec![0], write: vec![0] };
    let info = snap_info(1, data_dir, write_epoch);

    let mut store = FakeStore::default();
    let mut runner = FakeRunner::default();
    let lookup = FakeSnapInfoLookup { info: info.clone() };
    let config_io = FakeConfigIO::default();
    let user_db = NoUsers;

    let save_ids =
        orchestrator::build_save_tasks(&mut runner, &store, 1, &[("hello".into(), 1)], None, None, false)
            .unwrap();
    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(save_ids[0]);
        orchestrator::do_save_snapshot(task, &collab, &mut store, RetentionPolicy::Disabled, &|| false).unwrap();
    }
    let filename: snapshot_core::collab::SnapshotSetup =
        serde_json::from_value(runner.task(save_ids[0]).get("snapshot-setup").unwrap()).unwrap();
    let filename = filename.filename.unwrap();

    let (restore_ids, _cleanup_id) =
        orchestrator::build_restore_tasks(&mut runner, &store, 1, &[("hello".into(), 1)]).unwrap();
    {
        let task = runner.task_mut(restore_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename);
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }

    // The installed candidate now only declares read compatibility with
    // epoch 9, incompatible with the archive's epoch 0 write.
    let incompatible_epoch = Epoch { read: vec![9], write: vec![9] };
    let restore_lookup = FakeSnapInfoLookup {
        info: snap_info(1, root.path().join("restored"), incompatible_epoch),
    };

    let collab = Collaborators {
        snapshots_dir: &snapshots_dir,
        snap_lookup: &restore_lookup,
        user_db: &user_db,
        config_io: &config_io,
        home_glob: "/nonexistent/*",
    };
    let task = runner.task_mut(restore_ids[0]);
    let err = orchestrator::do_restore_snapshot(task, &collab).unwrap_err();
    assert!(matches!(err, SnapshotError::Archive(snapshot_core::error::ArchiveError::UnreadableEpoch { .. })));
    assert!(!root.path().join("restored").exists());
}

#[test]
fn undo_restore_snapshot_is_idempotent() {
    let root = tempdir().unwrap();
    let snapshots_dir = root.path().join("snapshots");
    let data_dir = make_data_dir(root.path(), "1", &[("f", "x")]);
    let info = snap_info(1, data_dir, Epoch::zero());

    let mut store = FakeStore::default();
    let mut runner = FakeRunner::default();
    let lookup = FakeSnapInfoLookup { info: info.clone() };
    let config_io = FakeConfigIO::default();
    let user_db = NoUsers;

    let save_ids =
        orchestrator::build_save_tasks(&mut runner, &store, 1, &[("hello".into(), 1)], None, None, false)
            .unwrap();
    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(save_ids[0]);
        orchestrator::do_save_snapshot(task, &collab, &mut store, RetentionPolicy::Disabled, &|| false).unwrap();
    }
    let setup: snapshot_core::collab::SnapshotSetup =
        serde_json::from_value(runner.task(save_ids[0]).get("snapshot-setup").unwrap()).unwrap();
    let filename = setup.filename.unwrap();

    let (restore_ids, _cleanup_id) =
        orchestrator::build_restore_tasks(&mut runner, &store, 1, &[("hello".into(), 1)]).unwrap();
    {
        let task = runner.task_mut(restore_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename);
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }

    let restore_target = root.path().join("restored");
    let restore_lookup = FakeSnapInfoLookup {
        info: snap_info(1, restore_target.clone(), Epoch::zero()),
    };
    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &restore_lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(restore_ids[0]);
        orchestrator::do_restore_snapshot(task, &collab).unwrap();
    }

    let restored_file = restore_target.join("1").join("f");
    assert!(restored_file.exists());

    let collab = Collaborators {
        snapshots_dir: &snapshots_dir,
        snap_lookup: &restore_lookup,
        user_db: &user_db,
        config_io: &config_io,
        home_glob: "/nonexistent/*",
    };
    let task = runner.task_mut(restore_ids[0]);
    orchestrator::undo_restore_snapshot(task, &collab).expect("first revert succeeds");
    assert!(!restored_file.exists(), "revert must move the original back");

    // A second undo must be a no-op rather than erroring or attempting to
    // revert state that's already been reverted.
    let task = runner.task_mut(restore_ids[0]);
    orchestrator::undo_restore_snapshot(task, &collab).expect("second revert is a no-op");
}

#[test]
fn check_and_forget_round_trip_through_the_task_graph() {
    let root = tempdir().unwrap();
    let snapshots_dir = root.path().join("snapshots");
    let data_dir = make_data_dir(root.path(), "1", &[("f", "x")]);
    let info = snap_info(1, data_dir, Epoch::zero());

    let mut store = FakeStore::default();
    let mut runner = FakeRunner::default();
    let lookup = FakeSnapInfoLookup { info: info.clone() };
    let config_io = FakeConfigIO::default();
    let user_db = NoUsers;

    let save_ids =
        orchestrator::build_save_tasks(&mut runner, &store, 1, &[("hello".into(), 1)], None, None, false)
            .unwrap();
    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        let task = runner.task_mut(save_ids[0]);
        orchestrator::do_save_snapshot(task, &collab, &mut store, RetentionPolicy::Disabled, &|| false).unwrap();
    }
    runner.set_status(save_ids[0], TaskStatus::Done);
    let setup: snapshot_core::collab::SnapshotSetup =
        serde_json::from_value(runner.task(save_ids[0]).get("snapshot-setup").unwrap()).unwrap();
    let filename = setup.filename.unwrap();
    assert!(filename.exists());

    let check_ids =
        orchestrator::build_check_tasks(&mut runner, &store, 1, &["hello".into()]).unwrap();
    {
        let task = runner.task_mut(check_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename.clone());
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }
    {
        let collab = Collaborators {
            snapshots_dir: &snapshots_dir,
            snap_lookup: &lookup,
            user_db: &user_db,
            config_io: &config_io,
            home_glob: "/nonexistent/*",
        };
        orchestrator::do_check_snapshot(runner.task(check_ids[0]), &collab).expect("check passes");
    }
    runner.set_status(check_ids[0], TaskStatus::Done);

    let forget_ids =
        orchestrator::build_forget_tasks(&mut runner, &store, 1, &["hello".into()]).unwrap();
    {
        let task = runner.task_mut(forget_ids[0]);
        let mut setup: snapshot_core::collab::SnapshotSetup =
            serde_json::from_value(task.get("snapshot-setup").unwrap()).unwrap();
        setup.filename = Some(filename.clone());
        task.set("snapshot-setup", serde_json::to_value(&setup).unwrap());
    }
    orchestrator::do_forget_snapshot(runner.task(forget_ids[0]), &snapshots_dir, &mut store)
        .expect("forget succeeds");

    assert!(!filename.exists());
}

#[test]
fn forget_is_blocked_by_an_in_flight_check_on_the_same_set() {
    let store = FakeStore::default();
    let mut runner = FakeRunner::default();

    let check_ids = orchestrator::build_check_tasks(&mut runner, &store, 1, &["hello".into()]).unwrap();
    assert_eq!(check_ids.len(), 1);
    // Task is freshly created and thus not ready (Do), so it still counts as
    // in-flight for the conflict scan.

    let err = orchestrator::build_forget_tasks(&mut runner, &store, 1, &["hello".into()]).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Conflict(snapshot_core::error::ConflictError::ChangeInProgress { set_id: 1, .. })
    ));
}

#[test]
fn resolve_save_targets_expands_to_all_active_snaps_when_none_requested() {
    let info = snap_info(7, PathBuf::new(), Epoch::zero());
    let lookup = FakeSnapInfoLookup { info };

    let targets = orchestrator::resolve_save_targets(&lookup, None).unwrap();
    assert_eq!(targets, vec![("hello".to_string(), 7)]);
}

#[test]
fn resolve_save_targets_looks_up_revision_for_explicit_names() {
    let info = snap_info(3, PathBuf::new(), Epoch::zero());
    let lookup = FakeSnapInfoLookup { info };

    let targets =
        orchestrator::resolve_save_targets(&lookup, Some(vec!["hello".to_string()])).unwrap();
    assert_eq!(targets, vec![("hello".to_string(), 3)]);
}

#[test]
fn forget_of_a_different_set_is_unaffected_by_an_in_flight_check() {
    let store = FakeStore::default();
    let mut runner = FakeRunner::default();

    orchestrator::build_check_tasks(&mut runner, &store, 1, &["hello".into()]).unwrap();
    let forget_ids =
        orchestrator::build_forget_tasks(&mut runner, &store, 2, &["other".into()]).unwrap();
    assert_eq!(forget_ids.len(), 1);
}
