//! # Collaborator Contracts
//!
//! The snapshot engine is a subsystem of a larger package manager. This
//! module defines, as plain Rust traits, the seams the design calls out as
//! "external collaborators": the durable state store, the snap-info
//! lookup, the snap config I/O, the OS user database, and the host task
//! runner. Only the interface the engine *consumes* is specified here —
//! none of these traits' real implementations (state persistence, the
//! install database, hook execution, the scheduler) are in scope.
//!
//! The design's `lock()`/`unlock()` primitives on the state store are
//! expressed the idiomatic Rust way: callers hold a `Mutex` guard for the
//! duration of the critical section rather than calling matched lock/unlock
//! methods. See the "Open Question" entry in `DESIGN.md` for the tradeoff.

use crate::error::{Result, SnapshotError, StateError, UserError};
use crate::snapshot::{Epoch, SnapshotOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ─── State store ────────────────────────────────────────────────────────────

/// The durable key/value store the package manager persists its state in.
/// The snapshot engine reads and writes a handful of top-level keys
/// (`last-snapshot-set-id`, `snapshots`) and an in-memory-only
/// `snapshot-ops` cache slot (component C5).
pub trait StateStore: Send + Sync {
    /// Reads the JSON value stored under `key`. Returns
    /// `StateError::NoState` (never a bare I/O error) when the key is
    /// absent, so callers can distinguish "nothing stored yet" from a real
    /// failure.
    fn get(&self, key: &str) -> Result<serde_json::Value>;

    /// Overwrites the JSON value stored under `key`.
    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Reads a value from the in-memory cache slot (never persisted).
    fn cached(&self, key: &str) -> Option<serde_json::Value>;

    /// Writes a value into the in-memory cache slot.
    fn cache(&mut self, key: &str, value: serde_json::Value);

    /// Removes a value from the in-memory cache slot.
    fn uncache(&mut self, key: &str);
}

/// Convenience used throughout the registry: `get` a key, treating
/// "no state" as `None` rather than an error.
pub fn get_optional(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<serde_json::Value>> {
    match store.get(key) {
        Ok(v) => Ok(Some(v)),
        Err(SnapshotError::State(StateError::NoState(_))) => Ok(None),
        Err(e) => Err(e),
    }
}

// ─── Snap info lookup ───────────────────────────────────────────────────────

/// A snap's currently-installed metadata, as the install database would
/// report it.
#[derive(Debug, Clone)]
pub struct SnapInfo {
    /// Base snap name (equal to `instance_name` except for parallel-install
    /// instances, e.g. `"hello_devel"` has snap name `"hello"`).
    pub snap_name: String,
    pub instance_name: String,
    pub snap_id: String,
    pub revision: i64,
    pub version: String,
    pub epoch: Epoch,
    pub data_dir: PathBuf,
    pub common_dir: PathBuf,
}

impl SnapInfo {
    pub fn user_data_dir(&self, home: &Path) -> PathBuf {
        home.join(&self.instance_name).join(self.revision.to_string())
    }

    pub fn user_common_dir(&self, home: &Path) -> PathBuf {
        home.join(&self.instance_name).join("common")
    }
}

/// Looks up a snap's current install metadata. The only external database
/// the engine consults about *what is installed*.
pub trait SnapInfoLookup: Send + Sync {
    fn current_info(&self, instance_name: &str) -> Result<SnapInfo>;
    /// Names of all active installed snaps, for `Save` with no explicit
    /// target list.
    fn all_active_snap_names(&self) -> Result<Vec<String>>;
}

// ─── Config I/O ─────────────────────────────────────────────────────────────

/// Reads and writes a snap's live configuration blob (`snap get`/`snap set`
/// in the host tool). Treated as opaque JSON. Both methods take `&self`: a
/// handler only ever holds a shared [`Collaborators`](crate::orchestrator::Collaborators)
/// reference, so a real implementation reaches for interior mutability
/// (a `Mutex`-guarded config store) the same way `StateStore` does.
pub trait ConfigIO: Send + Sync {
    fn get_snap_config(&self, instance_name: &str) -> Result<Option<serde_json::Value>>;
    fn set_snap_config(
        &self,
        instance_name: &str,
        value: Option<serde_json::Value>,
    ) -> Result<()>;
}

// ─── User database ──────────────────────────────────────────────────────────

/// A resolved OS user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub username: String,
}

/// The platform user database: `getpwnam`/`getpwuid` in spirit.
pub trait UserDb: Send + Sync {
    fn lookup(&self, name: &str) -> std::result::Result<UserRecord, UserError>;
    fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError>;
}

// ─── Task runner ────────────────────────────────────────────────────────────

pub type TaskId = u64;

/// Lifecycle status of a task as the host scheduler tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Do,
    Doing,
    Done,
    Undoing,
    Undone,
    Error,
    Abort,
    Hold,
    Wait,
}

impl TaskStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Undone | TaskStatus::Error)
    }
}

/// One unit of work in the host scheduler's task graph.
pub trait Task: Send + Sync {
    fn id(&self) -> TaskId;
    fn kind(&self) -> &str;
    fn change_id(&self) -> String;
    fn status(&self) -> TaskStatus;
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&mut self, key: &str, value: serde_json::Value);
    /// Tasks this one waits for (`wait-for` edges), used by
    /// `cleanup-after-restore` to find the restores it follows.
    fn wait_tasks(&self) -> Vec<TaskId>;
}

/// The subset of the host scheduler's interface the engine drives: creating
/// tasks, wiring wait-for edges, and registering do/undo/cleanup handlers.
/// Handler functions are plain closures taking the task id and a reference
/// to the full collaborator set, matching this crate's synchronous,
/// cooperative-handler execution model (see "Concurrency & resource model"
/// in the design).
pub trait TaskRunner {
    fn new_task(&mut self, kind: &str, summary: &str) -> TaskId;
    fn add_wait(&mut self, task: TaskId, waits_for: TaskId);
    fn task(&self, id: TaskId) -> &dyn Task;
    fn task_mut(&mut self, id: TaskId) -> &mut dyn Task;
    /// All tasks in the change graph whose change is not yet ready
    /// (i.e. still pending/running), for the conflict arbiter to scan.
    fn tasks_not_ready(&self) -> Vec<TaskId>;
}

/// The `snapshot-setup` payload every snapshot task kind carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotSetup {
    pub set_id: u64,
    pub snap: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    pub current_revision: i64,
    #[serde(default)]
    pub auto: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SnapshotOptions>,
}

/// Reads a task's `snapshot-setup` payload, translating a missing payload
/// into the `Internal` error the design mandates (component C6/C8).
pub fn snapshot_setup(task: &dyn Task) -> Result<SnapshotSetup> {
    let value = task
        .get("snapshot-setup")
        .ok_or_else(|| SnapshotError::internal("task missing snapshot-setup payload"))?;
    serde_json::from_value(value).map_err(|e| SnapshotError::internal(e.to_string()))
}
