//! # Backend Facade (C4)
//!
//! The public surface snapd's snapshot subsystem calls into:
//! `Save`/`Open`/`Iter`/`List`/`Filename`/`Restore`/`Check`/`Import`/
//! `CleanupAbandonedImports`. Every operation here is a thin coordinator:
//! it allocates no state of its own beyond the snapshots directory on
//! disk, delegating archive I/O to [`crate::archive`], user resolution to
//! [`crate::users`], and restore bookkeeping to [`crate::restore_state`].

use crate::archive::{self, IterControl, OpenMode, PayloadSource, Reader};
use crate::collab::{SnapInfo, UserRecord};
use crate::error::{ArchiveError, Result, SnapshotError};
use crate::hash;
use crate::restore_state::{self, RestoreState};
use crate::snapshot::{archive_filename, Snapshot, SnapshotOptions, SnapshotSet};
use log::{info, warn};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory permission snapshots directories are created with.
#[cfg(unix)]
const SNAPSHOTS_DIR_MODE: u32 = 0o700;

/// A file write staged to a sibling temp path and only renamed into place
/// on an explicit [`AtomicFile::commit`]. Dropping without committing
/// removes the temp file, so a cancelled or failed `Save` never leaves a
/// partially written file at the target name.
struct AtomicFile {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl AtomicFile {
    fn create(final_path: &Path) -> std::io::Result<Self> {
        let temp_path = final_path.with_extension("zip.tmp");
        let file = File::create(&temp_path)?;
        Ok(AtomicFile {
            temp_path,
            final_path: final_path.to_path_buf(),
            file: Some(file),
            committed: false,
        })
    }

    fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("AtomicFile used after commit")
    }

    fn commit(mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        std::fs::rename(&self.temp_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Parameters for one `Save` call, producing exactly one `Snapshot`.
pub struct SaveRequest<'a> {
    pub set_id: u64,
    pub snap: &'a SnapInfo,
    pub config: Option<serde_json::Value>,
    pub users: &'a [UserRecord],
    pub options: Option<SnapshotOptions>,
    pub auto: bool,
}

/// Ensures the snapshots directory exists with mode 0700, creates the
/// archive file atomically, streams each payload entry through the tar
/// subprocess while tee'ing hash/size, writes metadata, and commits.
///
/// `should_cancel` is polled between payload entries and once more before
/// the final commit; returning `true` aborts the save (the atomic temp
/// file is discarded by `AtomicFile`'s `Drop`).
pub fn save(
    snapshots_dir: &Path,
    request: SaveRequest,
    should_cancel: &dyn Fn() -> bool,
) -> Result<Snapshot> {
    ensure_snapshots_dir(snapshots_dir)?;

    let mut snapshot = Snapshot::new(
        request.set_id,
        &request.snap.snap_name,
        &request.snap.instance_name,
        &request.snap.snap_id,
        request.snap.revision,
        &request.snap.version,
        request.snap.epoch.clone(),
    );
    snapshot.config = request.config.clone();
    snapshot.conf = request.config;
    snapshot.options = request.options.clone();
    snapshot.auto = request.auto;

    let filename = snapshots_dir.join(archive_filename(&snapshot));
    let mut atomic = AtomicFile::create(&filename)?;
    let zip_options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    {
        let mut zip = zip::ZipWriter::new(atomic.file_mut());

        let excludes = resolve_excludes(&request.options, &request.snap.data_dir);
        write_one_payload(
            &mut zip,
            zip_options,
            &mut snapshot,
            Snapshot::system_entry_name().to_string(),
            &request.snap.data_dir,
            request.snap.revision,
            excludes,
            None,
        )?;

        if should_cancel() {
            return Err(SnapshotError::internal("save cancelled"));
        }

        for user in request.users {
            let user_dir = request.snap.user_data_dir(&user.home);
            let user_parent = user_dir
                .parent()
                .ok_or_else(|| SnapshotError::internal("malformed user data dir"))?
                .to_path_buf();
            let excludes = resolve_excludes(&request.options, &user.home);
            write_one_payload(
                &mut zip,
                zip_options,
                &mut snapshot,
                Snapshot::user_entry_name(&user.username),
                &user_parent,
                request.snap.revision,
                excludes,
                Some((user.uid, user.gid)),
            )?;

            if should_cancel() {
                return Err(SnapshotError::internal("save cancelled"));
            }
        }

        archive::write_metadata(&mut zip, &snapshot, zip_options)?;

        if should_cancel() {
            return Err(SnapshotError::internal("save cancelled before commit"));
        }

        zip.finish().map_err(ArchiveError::from)?;
    }

    atomic.commit()?;
    Ok(snapshot)
}

#[allow(clippy::too_many_arguments)]
fn write_one_payload<W: Write + std::io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    options: zip::write::FileOptions,
    snapshot: &mut Snapshot,
    entry_name: String,
    parent: &Path,
    revision: i64,
    excludes: Vec<String>,
    run_as: Option<(u32, u32)>,
) -> Result<()> {
    zip.start_file(entry_name.as_str(), options)
        .map_err(ArchiveError::from)?;

    let leaf = revision.to_string();
    let source = PayloadSource {
        entry_name: entry_name.clone(),
        parent,
        leaf: &leaf,
        excludes,
        run_as,
    };
    let (digest, size) = archive::write_payload_entry(&source, &mut *zip)?;

    snapshot.hashes.insert(entry_name, digest);
    snapshot.size += size;
    Ok(())
}

fn resolve_excludes(options: &Option<SnapshotOptions>, home: &Path) -> Vec<String> {
    let Some(options) = options else {
        return Vec::new();
    };
    let home = home.to_string_lossy();
    options
        .exclude
        .iter()
        .map(|pattern| {
            pattern
                .replace("$SNAP_USER_DATA", &home)
                .replace("$SNAP_USER_COMMON", &home)
                .replace("$SNAP_DATA", &home)
                .replace("$SNAP_COMMON", &home)
        })
        .collect()
}

fn ensure_snapshots_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(SNAPSHOTS_DIR_MODE))?;
    }
    Ok(())
}

/// Opens a single snapshot archive by path.
pub fn open(path: &Path, mode: OpenMode) -> Result<Reader> {
    archive::open(path, mode)
}

/// Visits every snapshot archive in `snapshots_dir`. The visitor returns
/// `Err(IterControl::Stop)` to end iteration early without surfacing an
/// error; every opened `Reader` is implicitly closed (the archive file
/// handle is dropped) once the visitor returns.
pub fn iter<F>(snapshots_dir: &Path, visit: F) -> Result<()>
where
    F: FnMut(Reader) -> std::result::Result<(), IterControl>,
{
    archive::iter_dir(snapshots_dir, OpenMode::TrustMetadata, visit)
}

/// Lists snapshot sets, sorted by set-ID ascending, each with its
/// snapshots sorted by snap name ascending.
pub fn list(
    snapshots_dir: &Path,
    set_id_filter: Option<u64>,
    snap_name_filter: Option<&str>,
) -> Result<Vec<SnapshotSet>> {
    let mut by_set: std::collections::BTreeMap<u64, Vec<Snapshot>> = std::collections::BTreeMap::new();

    iter(snapshots_dir, |reader| {
        let snap = reader.snapshot;
        if snap.is_broken() {
            return Ok(());
        }
        if let Some(wanted) = set_id_filter {
            if snap.set_id != wanted {
                return Ok(());
            }
        }
        if let Some(wanted) = snap_name_filter {
            if snap.snap != wanted {
                return Ok(());
            }
        }
        by_set.entry(snap.set_id).or_default().push(snap);
        Ok(())
    })?;

    Ok(by_set
        .into_iter()
        .map(|(set_id, mut snapshots)| {
            snapshots.sort_by(|a, b| a.snap.cmp(&b.snap));
            SnapshotSet { set_id, snapshots }
        })
        .collect())
}

/// The deterministic on-disk path for a snapshot.
pub fn filename(snapshots_dir: &Path, snapshot: &Snapshot) -> PathBuf {
    snapshots_dir.join(archive_filename(snapshot))
}

/// Parameters for one `Restore` call.
pub struct RestoreRequest<'a> {
    pub revision: i64,
    pub users: &'a [UserRecord],
    pub system_data_dir: &'a Path,
    /// Called with a human-readable line as each entry restores; must be
    /// safe to call without holding the caller's state lock.
    pub logf: &'a dyn Fn(&str),
}

/// Restores every payload entry in `reader.snapshot` into the live data
/// directories, building up a `RestoreState` as it goes. On any failure
/// before returning, the partial `RestoreState` is reverted in place and
/// no state is handed back to the caller — matching the contract that a
/// failed restore leaves nothing for the caller to clean up.
pub fn restore(reader: &Reader, request: RestoreRequest) -> Result<RestoreState> {
    let mut state = RestoreState::new(None);

    let outcome = (|| -> Result<()> {
        for (entry_name, _hash) in &reader.snapshot.hashes {
            if entry_name == "archive.tgz" {
                restore_one_entry(
                    &reader.path,
                    &reader.snapshot,
                    entry_name,
                    request.system_data_dir,
                    request.revision,
                    None,
                    &mut state,
                    request.logf,
                )?;
            } else if let Some(username) = entry_name
                .strip_prefix("user/")
                .and_then(|s| s.strip_suffix(".tgz"))
            {
                if let Some(user) = request.users.iter().find(|u| u.username == username) {
                    let user_parent = user.home.join(&reader.snapshot.instance_name);
                    restore_one_entry(
                        &reader.path,
                        &reader.snapshot,
                        entry_name,
                        &user_parent,
                        request.revision,
                        Some((user.uid, user.gid)),
                        &mut state,
                        request.logf,
                    )?;
                }
            }
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => Ok(state),
        Err(e) => {
            state.revert();
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn restore_one_entry(
    archive_path: &Path,
    snapshot: &Snapshot,
    entry_name: &str,
    target_home: &Path,
    revision: i64,
    run_as: Option<(u32, u32)>,
    state: &mut RestoreState,
    logf: &dyn Fn(&str),
) -> Result<()> {
    let parent = target_home;
    if !parent.exists() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        if let Some((uid, gid)) = run_as {
            use std::os::unix::fs::chown;
            let _ = chown(parent, Some(uid), Some(gid));
        }
        state.created.push(parent.to_path_buf());
    }

    let extract_tmp = parent.join(format!(".extract-{revision}{}", restore_state::move_aside_suffix()));
    std::fs::create_dir_all(&extract_tmp)?;
    state.created.push(extract_tmp.clone());

    let file = File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(file).map_err(ArchiveError::from)?;
    let member = zip.by_name(entry_name).map_err(ArchiveError::from)?;

    let (actual_hash, actual_size) =
        archive::extract_payload_entry(member, &extract_tmp, run_as)?;

    let expected_hash = snapshot.hashes.get(entry_name).cloned().unwrap_or_default();
    if actual_hash != expected_hash {
        return Err(ArchiveError::HashMismatch {
            entry: entry_name.to_string(),
            expected: expected_hash,
            actual: actual_hash,
        }
        .into());
    }
    logf(&format!("restored {entry_name} ({actual_size} bytes)"));

    let revision_leaf = revision.to_string();
    for leaf in ["common", revision_leaf.as_str()] {
        let live_target = parent.join(leaf);
        let extracted_source = extract_tmp.join(leaf);
        if !extracted_source.exists() {
            continue;
        }
        if live_target.exists() {
            let suffix = restore_state::move_aside_suffix();
            let moved = parent.join(format!("{leaf}{suffix}"));
            std::fs::rename(&live_target, &moved)?;
            state.moved.push(moved);
        }
        std::fs::rename(&extracted_source, &live_target)?;
        state.created.push(live_target);
    }

    // extract_tmp only ever held the "common"/<revision> dirs just renamed
    // out above; remove the now-empty staging dir rather than leaving it
    // behind in the live snap-data parent.
    if let Err(e) = std::fs::remove_dir_all(&extract_tmp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    state.created.retain(|p| p != &extract_tmp);

    Ok(())
}

/// Verifies every payload entry (optionally filtered by username) against
/// its recorded hash and size.
pub fn check(reader: &Reader, user_filter: &[String]) -> Result<()> {
    archive::check(&reader.path, &reader.snapshot, user_filter)
}

/// Flags controlling `Import`'s duplicate-detection behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportFlags {
    pub no_duplicate_check: bool,
}

/// Materializes a caller-provided ZIP stream as a snapshot archive under
/// `snapshots_dir`, returning the snap names it contains.
///
/// `id` is the set-ID the caller wants this import filed under on this
/// system — typically freshly allocated via [`crate::registry::allocate_set_id`]
/// — which need not match whatever `set_id` the stream's own `meta.json`
/// carries from its originating system. The on-disk filename is computed
/// from `id`, not the embedded metadata; a later `Open` of the resulting
/// file must pass [`OpenMode::FilenameOverridesSetId`] to recover `id`
/// rather than the stream's original set-ID.
///
/// If an archive with the same `(snap, version, revision)` already exists
/// under any set and `flags.no_duplicate_check` is not set, returns a
/// duplicate error naming that archive's existing set-ID.
pub fn import<R: std::io::Read>(
    snapshots_dir: &Path,
    id: u64,
    mut stream: R,
    flags: ImportFlags,
) -> Result<Vec<String>> {
    ensure_snapshots_dir(snapshots_dir)?;

    let import_path = snapshots_dir.join(format!("import-{id}.zip.part"));
    {
        let mut file = File::create(&import_path)?;
        std::io::copy(&mut stream, &mut file)?;
    }

    let reader = archive::open(&import_path, OpenMode::TrustMetadata);
    let reader = match reader {
        Ok(r) => r,
        Err(e) => {
            let _ = std::fs::remove_file(&import_path);
            return Err(e);
        }
    };

    if !flags.no_duplicate_check {
        if let Some(existing) = find_matching(snapshots_dir, &reader.snapshot)? {
            let _ = std::fs::remove_file(&import_path);
            return Err(crate::error::ImportError::Duplicate {
                snap: reader.snapshot.snap.clone(),
                existing_set_id: existing,
            }
            .into());
        }
    }

    let mut target = reader.snapshot.clone();
    target.set_id = id;
    let final_path = filename(snapshots_dir, &target);
    std::fs::rename(&import_path, &final_path)?;
    Ok(vec![reader.snapshot.snap.clone()])
}

fn find_matching(snapshots_dir: &Path, candidate: &Snapshot) -> Result<Option<u64>> {
    let mut found = None;
    iter(snapshots_dir, |reader| {
        let snap = &reader.snapshot;
        if snap.snap == candidate.snap
            && snap.version == candidate.version
            && snap.revision == candidate.revision
        {
            found = Some(snap.set_id);
            return Err(IterControl::Stop);
        }
        Ok(())
    })?;
    Ok(found)
}

/// Removes any `import-*.zip.part` temp files left behind by a crash
/// mid-`Import`, reaped on startup. Returns the count removed.
pub fn cleanup_abandoned_imports(snapshots_dir: &Path) -> Result<usize> {
    if !snapshots_dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in std::fs::read_dir(snapshots_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("import-") && n.ends_with(".zip.part"))
        {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    count += 1;
                    info!("removed abandoned import temp file {}", path.display());
                }
                Err(e) => warn!("failed to remove abandoned import {}: {e}", path.display()),
            }
        }
    }
    Ok(count)
}

/// Scans `snapshots_dir` for the highest `set_id` encoded in any archive
/// filename, the fallback `allocate_set_id` (C5) folds in alongside the
/// state store's stored counter so a lost or stale counter can never
/// collide with an archive already on disk.
pub fn highest_set_id_on_disk(snapshots_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(snapshots_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| crate::snapshot::set_id_from_filename(&e.path()))
        .max()
        .unwrap_or(0)
}
