//! # Archive Codec (C1)
//!
//! Encodes and decodes a single snapshot container: a ZIP file holding one
//! or more gzip-compressed tar payload entries (`archive.tgz` for system
//! data, `user/<name>.tgz` per user) plus two reserved metadata entries,
//! `meta.json` and `meta.sha3_384`.
//!
//! Payload entries are produced and consumed by shelling out to the
//! system `tar` binary rather than an in-process tar implementation — see
//! "Design notes" in the written design for the tradeoff this buys
//! (portability and less custom code) against what it costs (fork/exec,
//! privilege-drop, and stderr-scraping instead of typed errors).

use crate::error::{ArchiveError, Result, SnapshotError};
use crate::hash;
use crate::snapshot::Snapshot;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Lines of child stderr retained for the bounded tail surfaced on
/// failure.
const STDERR_RING_LINES: usize = 20;

/// One payload entry to be written into the snapshot archive.
pub struct PayloadSource<'a> {
    /// Archive-entry name: `"archive.tgz"` or `"user/<name>.tgz"`.
    pub entry_name: String,
    /// Parent directory containing `leaf` and its sibling `common`.
    pub parent: &'a Path,
    /// Leaf directory name (the revision directory, e.g. `"42"`).
    pub leaf: &'a str,
    /// `$SNAP_DATA`/`$SNAP_COMMON`-relative exclude patterns (already
    /// resolved to filesystem paths) to pass as `tar --exclude=`.
    pub excludes: Vec<String>,
    /// Drop privileges to this uid/gid before running tar (per-user
    /// capture), or run as the current process (system capture / no
    /// privilege-drop helper available).
    pub run_as: Option<(u32, u32)>,
}

/// A bounded ring buffer of the last N lines of a subprocess's stderr.
struct StderrRing {
    lines: VecDeque<String>,
    total_lines: usize,
    cap: usize,
}

impl StderrRing {
    fn new(cap: usize) -> Self {
        StderrRing {
            lines: VecDeque::with_capacity(cap),
            total_lines: 0,
            cap,
        }
    }

    fn push(&mut self, line: String) {
        self.total_lines += 1;
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Formats the captured tail per the design's exact prefix/suffix
    /// rules: no "showing ..." suffix for 0 or 1 retained line, "tar
    /// failed: <status>" when nothing was captured at all.
    fn format(&self, exit_status: &str) -> String {
        if self.lines.is_empty() {
            return format!("tar failed: {exit_status}");
        }
        let body = self
            .lines
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if self.total_lines <= 1 {
            body
        } else {
            format!(
                "{body}\n... (showing last {} lines out of {})",
                self.lines.len(),
                self.total_lines
            )
        }
    }
}

/// Spawns `tar` to create a gzip-compressed payload entry, writing its
/// stdout (the gzip stream) through `writer` while tee'ing it through a
/// SHA3-384 hasher, and returns `(hex_digest, byte_count)`.
///
/// On a non-zero exit, returns `ArchiveError::TarFailed` carrying the
/// bounded stderr tail formatted exactly per the design:
/// `cannot create archive: <line1>\n... (showing last N lines out of M)`.
pub fn write_payload_entry<W: Write>(source: &PayloadSource, writer: W) -> Result<(String, u64)> {
    let mut cmd = Command::new("tar");
    cmd.arg("-c")
        .arg("--sparse")
        .arg("-z")
        .arg("-f")
        .arg("-")
        .arg("--directory")
        .arg(source.parent)
        .arg(source.leaf)
        .arg("common")
        .env("GZIP", "-9 -n")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for pattern in &source.excludes {
        cmd.arg(format!("--exclude={pattern}"));
    }

    if let Some((uid, gid)) = source.run_as {
        drop_privileges(&mut cmd, uid, gid);
    }

    let mut child = cmd.spawn().map_err(|e| ArchiveError::TarFailed(e.to_string()))?;
    let stdout = child.stdout.take().expect("tar stdout piped");

    let ring = Arc::new(Mutex::new(StderrRing::new(STDERR_RING_LINES)));
    let stderr_thread = spawn_stderr_reader(&mut child, ring.clone());

    let (digest, size) = hash::hash_copy(stdout, writer).map_err(SnapshotError::Io)?;

    let status = child.wait().map_err(|e| ArchiveError::TarFailed(e.to_string()))?;
    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    if !status.success() {
        let ring = ring.lock().expect("stderr ring mutex poisoned");
        return Err(ArchiveError::TarFailed(ring.format(&status.to_string())).into());
    }

    Ok((digest, size))
}

/// Spawns `tar` to extract a payload entry, streaming `reader` (the ZIP
/// member's bytes) into the child's stdin, while tee'ing it through a
/// SHA3-384 hasher, and returns `(hex_digest, byte_count)`.
pub fn extract_payload_entry<R: Read>(
    reader: R,
    destination: &Path,
    run_as: Option<(u32, u32)>,
) -> Result<(String, u64)> {
    let mut cmd = Command::new("tar");
    cmd.arg("-x")
        .arg("--sparse")
        .arg("-z")
        .arg("-f")
        .arg("-")
        .arg("--directory")
        .arg(destination)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    if let Some((uid, gid)) = run_as {
        drop_privileges(&mut cmd, uid, gid);
    }

    let mut child = cmd.spawn().map_err(|e| ArchiveError::TarFailed(e.to_string()))?;
    let mut stdin = child.stdin.take().expect("tar stdin piped");

    let ring = Arc::new(Mutex::new(StderrRing::new(STDERR_RING_LINES)));
    let stderr_thread = spawn_stderr_reader(&mut child, ring.clone());

    let (digest, size) = hash::hash_copy(reader, &mut stdin).map_err(SnapshotError::Io)?;
    drop(stdin);

    let status = child.wait().map_err(|e| ArchiveError::TarFailed(e.to_string()))?;
    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    if !status.success() {
        let ring = ring.lock().expect("stderr ring mutex poisoned");
        return Err(ArchiveError::TarFailed(ring.format(&status.to_string())).into());
    }

    Ok((digest, size))
}

fn spawn_stderr_reader(
    child: &mut Child,
    ring: Arc<Mutex<StderrRing>>,
) -> Option<std::thread::JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(std::thread::spawn(move || {
        let mut reader = std::io::BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::BufRead::read_line(&mut reader, &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    ring.lock()
                        .expect("stderr ring mutex poisoned")
                        .push(trimmed.to_string());
                }
            }
        }
    }))
}

#[cfg(unix)]
fn drop_privileges(cmd: &mut Command, uid: u32, gid: u32) {
    use std::os::unix::process::CommandExt;
    // SAFETY: pre_exec runs in the forked child before exec; it only
    // touches process-local credential state and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                .map_err(std::io::Error::from)?;
            nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn drop_privileges(_cmd: &mut Command, _uid: u32, _gid: u32) {}

/// Writes `meta.json` (the encoded `Snapshot`, with `hashes` already
/// populated) and `meta.sha3_384` (the hex digest of `meta.json` plus a
/// trailing newline) into an open ZIP writer.
pub fn write_metadata<W: Write + std::io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    snapshot: &Snapshot,
    options: zip::write::FileOptions,
) -> Result<()> {
    let json = snapshot
        .to_json()
        .map_err(|e| SnapshotError::internal(format!("failed to encode meta.json: {e}")))?;

    zip.start_file("meta.json", options)
        .map_err(ArchiveError::from)?;
    zip.write_all(json.as_bytes()).map_err(SnapshotError::Io)?;

    let digest = hash::hash_bytes(json.as_bytes());
    zip.start_file("meta.sha3_384", options)
        .map_err(ArchiveError::from)?;
    writeln!(zip, "{digest}").map_err(SnapshotError::Io)?;

    Ok(())
}

/// How `Open` should resolve `Snapshot::set_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Trust the `set_id` decoded from `meta.json`.
    TrustMetadata,
    /// Override the decoded `set_id` with the number parsed from the
    /// filename prefix before the first `_`.
    FilenameOverridesSetId,
}

/// A snapshot opened from disk: the decoded metadata plus, on integrity
/// failure, a non-empty `broken` reason. `open` can return `Ok` with
/// `broken` set (the reader is still usable for inspection) as well as
/// `Err` with a populated snapshot attached to the error's context.
pub struct Reader {
    pub snapshot: Snapshot,
    pub path: PathBuf,
}

/// Opens a snapshot archive: reads `meta.json` via the ZIP directory,
/// decodes it, then reads `meta.sha3_384` and compares both the declared
/// size (sum of payload `hashes`' sizes is not re-derived here — this
/// checks the metadata digest itself) and the recomputed hex digest.
///
/// On mismatch, marks the returned snapshot `broken` with a reason and
/// still returns it (wrapped in `Err` — callers that want the partial
/// reader use `open_tolerant`).
pub fn open(path: &Path, mode: OpenMode) -> Result<Reader> {
    match open_tolerant(path, mode) {
        (reader, None) => Ok(reader),
        (reader, Some(reason)) => Err(SnapshotError::Archive(ArchiveError::InvalidSnapshot(
            format!("{}: {reason}", reader.path.display()),
        ))),
    }
}

/// As `open`, but always returns the `Reader` (with `broken` populated on
/// failure) alongside an optional failure reason, instead of folding the
/// reason into an `Err`.
pub fn open_tolerant(path: &Path, mode: OpenMode) -> (Reader, Option<String>) {
    match open_inner(path, mode) {
        Ok((snapshot, reason)) => {
            let mut snapshot = snapshot;
            if let Some(reason) = &reason {
                snapshot.broken = reason.clone();
            }
            (
                Reader {
                    snapshot,
                    path: path.to_path_buf(),
                },
                reason,
            )
        }
        Err(e) => {
            let mut snapshot = Snapshot::new(0, "", "", "", 0, "", crate::snapshot::Epoch::zero());
            snapshot.broken = e.to_string();
            (
                Reader {
                    snapshot,
                    path: path.to_path_buf(),
                },
                Some(e.to_string()),
            )
        }
    }
}

fn open_inner(path: &Path, mode: OpenMode) -> Result<(Snapshot, Option<String>)> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(file).map_err(ArchiveError::from)?;

    let mut meta_json = String::new();
    zip.by_name("meta.json")
        .map_err(|_| ArchiveError::MissingMetadata("meta.json".to_string()))?
        .read_to_string(&mut meta_json)?;

    let mut snapshot = Snapshot::from_json(&meta_json)
        .map_err(|e| ArchiveError::InvalidSnapshot(e.to_string()))?;

    if mode == OpenMode::FilenameOverridesSetId {
        if let Some(set_id) = crate::snapshot::set_id_from_filename(path) {
            snapshot.set_id = set_id;
        }
    }

    let mut meta_hash_text = String::new();
    let meta_hash_entry = zip.by_name("meta.sha3_384");
    let reason = match meta_hash_entry {
        Err(_) => Some("missing meta.sha3_384 entry".to_string()),
        Ok(mut entry) => {
            entry.read_to_string(&mut meta_hash_text)?;
            let expected = meta_hash_text.trim();
            let actual = hash::hash_bytes(meta_json.as_bytes());
            if expected != actual {
                Some(format!(
                    "meta.json digest mismatch: expected {expected}, got {actual}"
                ))
            } else if !snapshot.is_valid() {
                Some("invalid snapshot".to_string())
            } else {
                None
            }
        }
    };

    Ok((snapshot, reason))
}

/// Verifies every payload entry matching `user_filter` (or all entries
/// when `user_filter` is empty) against the recorded hash and size.
pub fn check(path: &Path, snapshot: &Snapshot, user_filter: &[String]) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(file).map_err(ArchiveError::from)?;

    for (entry_name, expected_hash) in &snapshot.hashes {
        if !entry_applies(entry_name, user_filter) {
            continue;
        }
        let entry = zip.by_name(entry_name).map_err(ArchiveError::from)?;
        let (actual_hash, _size) = hash::hash_stream(entry).map_err(SnapshotError::Io)?;
        if &actual_hash != expected_hash {
            return Err(ArchiveError::HashMismatch {
                entry: entry_name.clone(),
                expected: expected_hash.clone(),
                actual: actual_hash,
            }
            .into());
        }
    }
    Ok(())
}

fn entry_applies(entry_name: &str, user_filter: &[String]) -> bool {
    if user_filter.is_empty() {
        return true;
    }
    match entry_name.strip_prefix("user/").and_then(|s| s.strip_suffix(".tgz")) {
        Some(username) => user_filter.iter().any(|u| u == username),
        None => true, // system archive.tgz is always checked
    }
}

/// Opens `dir`, lists filenames in batches of ~100, invokes `visit` with
/// each opened `Reader`. A sentinel `Err(Stop)` from `visit` ends the walk
/// silently (without surfacing as an error from `iter_dir`). A missing
/// directory is treated as "no snapshots".
pub fn iter_dir<F>(dir: &Path, mode: OpenMode, mut visit: F) -> Result<()>
where
    F: FnMut(Reader) -> std::result::Result<(), IterControl>,
{
    const BATCH: usize = 100;

    if !dir.exists() {
        return Ok(());
    }

    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
        .collect();
    names.sort();

    for chunk in names.chunks(BATCH) {
        for path in chunk {
            let reader = open_tolerant(path, mode).0;
            match visit(reader) {
                Ok(()) => {}
                Err(IterControl::Stop) => return Ok(()),
            }
        }
    }
    Ok(())
}

/// Sentinel returned by an `iter_dir` visitor to stop iteration early
/// without that being surfaced as an error.
pub enum IterControl {
    Stop,
}
