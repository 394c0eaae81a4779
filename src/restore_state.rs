//! # Restore-State Tracker (C3)
//!
//! Records the filesystem mutations a `Restore` call makes so the restore
//! can be rolled back (`Revert`, on any later failure in the same change)
//! or finalized (`Cleanup`, once the whole change has committed).
//!
//! Rollback intent is encoded directly in on-disk filenames rather than a
//! sidecar journal: a directory being replaced is renamed aside with a
//! `.~<9-char-token>~` suffix before the new one is swung into place, and
//! that suffix is what `Revert`/`Cleanup` use to find their way back.

use log::error;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};

const TOKEN_LEN: usize = 9;

/// Generates a `.~<token>~` suffix for a directory being moved aside.
pub fn move_aside_suffix() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    format!(".~{token}~")
}

/// Durable (task-attached) record of one restore's filesystem mutations,
/// letting a completed restore be rolled back or finalized exactly once.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RestoreState {
    /// Once-only guard: exactly one of `revert`/`cleanup` may run.
    done: bool,
    /// Directories created during restore; removed wholesale on revert.
    pub created: Vec<PathBuf>,
    /// Directories renamed aside (origin -> moved path, suffix already
    /// applied) during restore.
    pub moved: Vec<PathBuf>,
    /// The caller-provided pre-restore config snapshot, used to roll back
    /// the application's live config on revert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl RestoreState {
    pub fn new(config: Option<serde_json::Value>) -> Self {
        RestoreState {
            done: false,
            created: Vec::new(),
            moved: Vec::new(),
            config,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Removes everything recorded in `created`, then renames every entry
    /// in `moved` back to its original location by stripping the
    /// `.~<token>~` suffix. A second call after the first is a logged
    /// internal error and a no-op (the once-only guard).
    pub fn revert(&mut self) {
        if self.done {
            error!("RestoreState::revert called a second time; ignoring");
            return;
        }
        self.done = true;

        for path in &self.created {
            if let Err(e) = remove_tree(path) {
                error!("failed to remove {}: {e}", path.display());
            }
        }

        for moved in &self.moved {
            match recover_origin(moved) {
                Some(origin) => {
                    if let Err(e) = std::fs::rename(moved, &origin) {
                        error!(
                            "failed to restore {} from {}: {e}",
                            origin.display(),
                            moved.display()
                        );
                    }
                }
                None => error!("cannot recover origin path for {}", moved.display()),
            }
        }
    }

    /// Removes every path in `moved` (the originals have been discarded
    /// intentionally — the restore committed). A second call after the
    /// first is a logged internal error and a no-op.
    pub fn cleanup(&mut self) {
        if self.done {
            error!("RestoreState::cleanup called a second time; ignoring");
            return;
        }
        self.done = true;

        for path in &self.moved {
            if let Err(e) = remove_tree(path) {
                error!("failed to remove moved-aside {}: {e}", path.display());
            }
        }
    }
}

fn remove_tree(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    }
}

/// Strips a `.~<token>~` suffix (9-character token) from a moved-aside path,
/// recovering its original location.
fn recover_origin(moved: &Path) -> Option<PathBuf> {
    let name = moved.file_name()?.to_str()?;
    let marker = ".~";
    let idx = name.rfind(marker)?;
    let suffix = &name[idx..];
    // ".~" + TOKEN_LEN chars + "~"
    if suffix.len() != marker.len() + TOKEN_LEN + 1 || !suffix.ends_with('~') {
        return None;
    }
    let original_name = &name[..idx];
    Some(moved.with_file_name(original_name))
}
