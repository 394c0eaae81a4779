//! # Snapshot Data Model
//!
//! A `Snapshot` is the unit of record produced by one `Save` call for one
//! snap: it describes a single archive container on disk (component C1's
//! `meta.json`) plus the bookkeeping the backend facade (C4) and task
//! orchestrator (C6) need to find, verify, and restore it.
//!
//! ## Repository layout
//!
//! ```text
//! <snapshots-dir>/
//! ├── 12_hello-snap_v1.33_42.zip
//! │     ├── archive.tgz        (system data)
//! │     ├── user/user.tgz      (per-user data)
//! │     ├── meta.json          (this Snapshot, JSON-encoded)
//! │     └── meta.sha3_384      (hex digest of meta.json + "\n")
//! └── 13_other-snap_v2.0_7.zip
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Forward/backward data-format compatibility declaration for a snap
/// revision. Restore refuses to proceed if the candidate revision's
/// `read` list does not contain the archive's `write` value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Epoch {
    #[serde(default = "Epoch::zero_list")]
    pub read: Vec<u32>,
    #[serde(default = "Epoch::zero_list")]
    pub write: Vec<u32>,
}

impl Epoch {
    fn zero_list() -> Vec<u32> {
        vec![0]
    }

    /// The implicit epoch 0, used by snaps that declare no epoch at all.
    pub fn zero() -> Self {
        Epoch {
            read: vec![0],
            write: vec![0],
        }
    }

    /// True if `self` (read as the installed candidate's epoch) can read
    /// data written under `archive_write`.
    pub fn can_read(&self, archive_write: &[u32]) -> bool {
        archive_write.iter().any(|w| self.read.contains(w))
    }
}

/// Caller-supplied options narrowing what `Save` includes in the archive.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Glob-like path patterns, anchored at `$SNAP_DATA`/`$SNAP_COMMON` (or
    /// the user equivalents), that the archiver omits from the tar stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// A single snapshot: one snap, one revision, one point in time, recorded
/// under a `set_id` shared with the other snaps saved in the same
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub set_id: u64,
    pub snap: String,
    pub instance_name: String,
    /// The installed snap's store identifier, recorded so `Restore` can
    /// refuse to apply an archive onto an unrelated (same-name) install.
    /// Empty for snaps that carry no snap-ID (e.g. local/unasserted builds).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snap_id: String,
    pub revision: i64,
    pub version: String,
    #[serde(default = "Epoch::zero")]
    pub epoch: Epoch,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,

    /// Archive-entry name → hex SHA3-384 digest of that entry's bytes.
    #[serde(rename = "sha3-384", default)]
    pub hashes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SnapshotOptions>,

    #[serde(default)]
    pub auto: bool,

    /// Fields neither this struct nor any older/newer version of it
    /// recognizes. Captured so a round-trip through a version of this
    /// struct that doesn't know about a given field still preserves it on
    /// re-encode, per the on-disk format's forward-compatibility contract.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,

    /// Non-empty iff the archive could be opened but failed integrity
    /// checks; populated by `Open`, never written to `meta.json` itself.
    #[serde(skip)]
    pub broken: String,
}

impl Snapshot {
    /// Creates a new, empty-hashes snapshot record ready to be populated by
    /// `Save` as it streams each payload entry.
    pub fn new(
        set_id: u64,
        snap: &str,
        instance_name: &str,
        snap_id: &str,
        revision: i64,
        version: &str,
        epoch: Epoch,
    ) -> Self {
        Snapshot {
            set_id,
            snap: snap.to_string(),
            instance_name: instance_name.to_string(),
            snap_id: snap_id.to_string(),
            revision,
            version: version.to_string(),
            epoch,
            time: Utc::now(),
            size: 0,
            hashes: BTreeMap::new(),
            config: None,
            conf: None,
            options: None,
            auto: false,
            unknown_fields: serde_json::Map::new(),
            broken: String::new(),
        }
    }

    pub fn is_broken(&self) -> bool {
        !self.broken.is_empty()
    }

    /// Validity check per the design's resolution of the source's apparent
    /// logic inversion: a snapshot is valid when it has at least one
    /// payload hash and a non-empty snap name. `Open` marks `broken` when
    /// this returns `false`, never when it returns `true`.
    pub fn is_valid(&self) -> bool {
        !self.snap.is_empty() && !self.hashes.is_empty()
    }

    /// Serializes the snapshot to pretty JSON for the `meta.json` entry.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deserializes a snapshot from the `meta.json` entry's bytes.
    /// Numbers are decoded through `serde_json`'s default `i64`/`u64`
    /// handling, which preserves full 64-bit fidelity.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The archive entry name for this snapshot's system-data payload.
    pub fn system_entry_name() -> &'static str {
        "archive.tgz"
    }

    /// The archive entry name for a given user's per-user data payload.
    pub fn user_entry_name(username: &str) -> String {
        format!("user/{username}.tgz")
    }
}

/// A group of `Snapshot`s sharing one `set_id`, the unit of restore/check/
/// forget in user-visible operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotSet {
    pub set_id: u64,
    pub snapshots: Vec<Snapshot>,
}

/// The canonical on-disk archive filename for a snapshot: `<set_id>_<snap>_<version>_<revision>.zip`.
pub fn archive_filename(snapshot: &Snapshot) -> PathBuf {
    let revision = if snapshot.revision < 0 {
        format!("x{}", -snapshot.revision)
    } else {
        snapshot.revision.to_string()
    };
    PathBuf::from(format!(
        "{}_{}_{}_{}.zip",
        snapshot.set_id, snapshot.snap, snapshot.version, revision
    ))
}

/// Parses the `set_id` prefix out of a snapshot filename, the fallback path
/// used when an embedded metadata read fails. `snap` names may not contain
/// `_`, so splitting on the first `_` is unambiguous.
pub fn set_id_from_filename(path: &std::path::Path) -> Option<u64> {
    let name = path.file_stem()?.to_str()?;
    let (prefix, _) = name.split_once('_')?;
    prefix.parse().ok()
}
