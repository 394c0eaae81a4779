//! # snapshot-demo
//!
//! A thin CLI for manually exercising `snapshot_core` end to end. It is
//! demonstration tooling, not a product CLI: it wires trivial, file-backed
//! stand-ins for the collaborator traits the library consumes (durable
//! state, the OS user database) to the library's public functions and
//! drives them from `clap` subcommands. There is no task scheduler here —
//! each subcommand drives the backend directly rather than building and
//! running a task graph, since there is no real `TaskRunner` to run one on.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use snapshot_core::archive::OpenMode;
use snapshot_core::backend::{self, RestoreRequest, SaveRequest};
use snapshot_core::collab::{SnapInfo, StateStore, TaskId, TaskRunner, UserRecord};
use snapshot_core::config::{self, InstallKind};
use snapshot_core::error::Result;
use snapshot_core::snapshot::Epoch;
use snapshot_core::users::{self, OsUserDb};
use snapshot_core::{auto_expire, registry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// snapshot-demo — exercise the snapshot engine's save/restore/check/forget/expire operations
#[derive(Parser, Debug)]
#[command(name = "snapshot-demo", version, about = "Manually exercise the snapshot engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory snapshot archives are written to and read from
    #[arg(long, global = true, default_value = "./snapshots")]
    snapshots_dir: PathBuf,

    /// File the durable state (set-ID counter, expirations) is persisted to
    #[arg(long, global = true, default_value = "./snapshots-state.json")]
    state_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file
    Init {
        #[arg(short, long, default_value = "snapshot-core.toml")]
        output: PathBuf,
    },

    /// Save a snap's data directory into a new snapshot set
    Save {
        /// Snap instance name
        snap: String,
        /// Directory standing in for $SNAP_DATA
        data_dir: PathBuf,
        /// Revision number
        #[arg(long, default_value_t = 1)]
        revision: i64,
        /// Version string recorded in the archive filename
        #[arg(long, default_value = "1.0")]
        version: String,
        /// Mark this as an automatic snapshot (subject to retention)
        #[arg(long)]
        auto: bool,
    },

    /// List known snapshot sets
    List {
        #[arg(long)]
        set_id: Option<u64>,
    },

    /// Verify every payload entry in an archive against its recorded hash
    Check {
        filename: PathBuf,
    },

    /// Restore an archive's system-data payload into a target directory
    Restore {
        filename: PathBuf,
        target_dir: PathBuf,
    },

    /// Remove an archive and its registry bookkeeping
    Forget {
        filename: PathBuf,
    },

    /// Run one (gated) auto-expire sweep
    Expire,
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(cli) {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut store = FileStateStore::load(&cli.state_file)?;
    backend::cleanup_abandoned_imports(&cli.snapshots_dir)?;

    match &cli.command {
        Command::Init { output } => cmd_init(output),
        Command::Save {
            snap,
            data_dir,
            revision,
            version,
            auto,
        } => cmd_save(&cli.snapshots_dir, &mut store, snap, data_dir, *revision, version, *auto),
        Command::List { set_id } => cmd_list(&cli.snapshots_dir, *set_id),
        Command::Check { filename } => cmd_check(filename),
        Command::Restore { filename, target_dir } => cmd_restore(filename, target_dir),
        Command::Forget { filename } => cmd_forget(&mut store, filename),
        Command::Expire => cmd_expire(&cli.snapshots_dir, &mut store),
    }
}

fn cmd_init(output: &Path) -> Result<()> {
    config::init_config(output, InstallKind::Classic)?;
    eprintln!("{} wrote {}", "✓".green(), output.display());
    Ok(())
}

fn cmd_save(
    snapshots_dir: &Path,
    store: &mut FileStateStore,
    snap: &str,
    data_dir: &Path,
    revision: i64,
    version: &str,
    auto: bool,
) -> Result<()> {
    let set_id = registry::allocate_set_id(store, backend::highest_set_id_on_disk(snapshots_dir))?;

    let snap_info = SnapInfo {
        snap_name: snap.to_string(),
        instance_name: snap.to_string(),
        snap_id: String::new(),
        revision,
        version: version.to_string(),
        epoch: Epoch::zero(),
        data_dir: data_dir.to_path_buf(),
        common_dir: data_dir.join("common"),
    };
    let users = users::enumerate_users(&OsUserDb, users::DEFAULT_HOME_GLOB, &[])?;

    let pb = create_progress_bar(users.len() as u64 + 2, snap);
    let request = SaveRequest {
        set_id,
        snap: &snap_info,
        config: None,
        users: &users,
        options: None,
        auto,
    };
    let snapshot = backend::save(snapshots_dir, request, &|| {
        pb.inc(1);
        false
    })?;
    pb.finish_and_clear();

    if auto {
        let cfg = config::load_config(InstallKind::Classic).unwrap_or_else(|_| config::Config::default_for(InstallKind::Classic));
        if let Some(expiry) = cfg.snapshots.automatic.retention.expiry_from(chrono::Utc::now()) {
            registry::save_expiration(store, set_id, expiry)?;
        }
    }

    eprintln!(
        "{} saved set #{set_id} ({})",
        "✓".green(),
        backend::filename(snapshots_dir, &snapshot).display()
    );
    Ok(())
}

fn cmd_list(snapshots_dir: &Path, set_id: Option<u64>) -> Result<()> {
    let sets = backend::list(snapshots_dir, set_id, None)?;
    for set in sets {
        println!("{}", format!("set #{}", set.set_id).bold());
        for snap in &set.snapshots {
            println!("  {} revision {} ({})", snap.snap, snap.revision, snap.version);
        }
    }
    Ok(())
}

fn cmd_check(filename: &Path) -> Result<()> {
    let reader = backend::open(filename, OpenMode::TrustMetadata)?;
    backend::check(&reader, &[])?;
    eprintln!("{} {} is intact", "✓".green(), filename.display());
    Ok(())
}

fn cmd_restore(filename: &Path, target_dir: &Path) -> Result<()> {
    let reader = backend::open(filename, OpenMode::TrustMetadata)?;
    let users: Vec<UserRecord> = Vec::new();
    let pb = create_progress_bar(reader.snapshot.hashes.len() as u64, &reader.snapshot.snap);
    let request = RestoreRequest {
        revision: reader.snapshot.revision,
        users: &users,
        system_data_dir: target_dir,
        logf: &|line| {
            pb.inc(1);
            pb.set_message(line.to_string());
        },
    };
    let mut state = backend::restore(&reader, request)?;
    state.cleanup();
    pb.finish_and_clear();
    eprintln!("{} restored into {}", "✓".green(), target_dir.display());
    Ok(())
}

/// A progress bar for a save/restore of `target_name`, in the same spinner +
/// bar + message shape the teacher's backup/restore commands use.
fn create_progress_bar(total: u64, target_name: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "  {{spinner:.green}} {target_name} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} {{msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}

fn cmd_forget(store: &mut FileStateStore, filename: &Path) -> Result<()> {
    let reader = backend::open(filename, OpenMode::TrustMetadata)?;
    let set_id = reader.snapshot.set_id;
    std::fs::remove_file(filename)?;
    registry::remove_state(store, set_id)?;
    eprintln!("{} forgot {}", "✓".green(), filename.display());
    Ok(())
}

fn cmd_expire(snapshots_dir: &Path, store: &mut FileStateStore) -> Result<()> {
    let runner = EmptyRunner;
    let removed = auto_expire::ensure(snapshots_dir, store, &runner, chrono::Utc::now())?;
    if removed.is_empty() {
        eprintln!("nothing expired");
    } else {
        for set_id in removed {
            eprintln!("{} expired set #{set_id}", "✓".green());
        }
    }
    Ok(())
}

/// A `TaskRunner` with no tasks, standing in for the absent host scheduler:
/// every conflict check against it trivially passes.
struct EmptyRunner;

impl TaskRunner for EmptyRunner {
    fn new_task(&mut self, _kind: &str, _summary: &str) -> TaskId {
        unimplemented!("snapshot-demo drives the backend directly, without a task graph")
    }
    fn add_wait(&mut self, _task: TaskId, _waits_for: TaskId) {
        unimplemented!("snapshot-demo drives the backend directly, without a task graph")
    }
    fn task(&self, _id: TaskId) -> &dyn snapshot_core::collab::Task {
        unimplemented!("snapshot-demo drives the backend directly, without a task graph")
    }
    fn task_mut(&mut self, _id: TaskId) -> &mut dyn snapshot_core::collab::Task {
        unimplemented!("snapshot-demo drives the backend directly, without a task graph")
    }
    fn tasks_not_ready(&self) -> Vec<TaskId> {
        Vec::new()
    }
}

/// A `StateStore` persisted as one JSON file on disk; the in-memory cache
/// slot (`snapshot-ops`) lives only in the process, matching the design's
/// distinction between durable state and the op-in-progress markers.
struct FileStateStore {
    path: PathBuf,
    persisted: HashMap<String, serde_json::Value>,
    cache: HashMap<String, serde_json::Value>,
}

impl FileStateStore {
    fn load(path: &Path) -> Result<Self> {
        let persisted = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(FileStateStore {
            path: path.to_path_buf(),
            persisted,
            cache: HashMap::new(),
        })
    }

    fn flush(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.persisted)
            .map_err(snapshot_core::error::StateError::Serde)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<serde_json::Value> {
        self.persisted
            .get(key)
            .cloned()
            .ok_or_else(|| snapshot_core::error::StateError::NoState(key.to_string()).into())
    }

    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.persisted.insert(key.to_string(), value);
        self.flush()
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
