//! # Configuration
//!
//! The engine exposes exactly one configuration knob:
//! `snapshots.automatic.retention`, which governs whether auto-snapshots
//! expire at all and, if so, after how long. It is parsed the way the
//! teacher's `config.rs` parses TOML (`serde` + `toml`), searching the same
//! kind of standard locations, but the schema itself is the design's, not
//! the teacher's backup-target schema.

use crate::error::{ConfigError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Whether auto-snapshots expire, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// `"no"` in the config file: auto-snapshots are never created with an
    /// expiration and the auto-expire loop has nothing to do for them.
    Disabled,
    /// A duration string like `"24h"`: auto-snapshots persisted with this
    /// policy get an expiry of `now + duration` at save time.
    After(Duration),
}

impl RetentionPolicy {
    /// Default on "classic" (traditional distro) installs: 24 hours.
    pub fn classic_default() -> Self {
        RetentionPolicy::After(Duration::hours(24))
    }

    /// Default on "core" (fully-managed, single-snap-rootfs) installs:
    /// disabled outright.
    pub fn core_default() -> Self {
        RetentionPolicy::Disabled
    }

    /// Parses the config-file string form: `"no"`, or a duration like
    /// `"24h"`/`"30m"`/`"45s"`/`"2d"`.
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("no") {
            return Ok(RetentionPolicy::Disabled);
        }
        parse_duration(trimmed)
            .map(RetentionPolicy::After)
            .ok_or_else(|| ConfigError::InvalidRetention(raw.to_string()))
    }

    /// The expiry timestamp to persist for an auto-snapshot saved at `now`
    /// under this policy, or `None` if auto-snapshots never expire.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RetentionPolicy::Disabled => None,
            RetentionPolicy::After(d) => Some(now + *d),
        }
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::Disabled => write!(f, "no"),
            RetentionPolicy::After(d) => {
                let secs = d.num_seconds();
                if secs != 0 && secs % 86400 == 0 {
                    write!(f, "{}d", secs / 86400)
                } else if secs != 0 && secs % 3600 == 0 {
                    write!(f, "{}h", secs / 3600)
                } else if secs != 0 && secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{secs}s")
                }
            }
        }
    }
}

impl Serialize for RetentionPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RetentionPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RetentionPolicy::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let n: i64 = num.parse().ok()?;
    match unit {
        "s" => Some(Duration::seconds(n)),
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        "d" => Some(Duration::days(n)),
        _ => None,
    }
}

/// The kind of install the embedding host is running under, which picks
/// the default retention when no config file overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// A traditional distro install with a writable root filesystem.
    Classic,
    /// A fully snap-managed install (e.g. Ubuntu Core).
    Core,
}

/// `[snapshots.automatic]` in the config file.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct AutomaticConfig {
    pub retention: RetentionPolicy,
}

impl AutomaticConfig {
    pub fn default_for(kind: InstallKind) -> Self {
        AutomaticConfig {
            retention: match kind {
                InstallKind::Classic => RetentionPolicy::classic_default(),
                InstallKind::Core => RetentionPolicy::core_default(),
            },
        }
    }
}

/// `[snapshots]` in the config file.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct SnapshotsConfig {
    pub automatic: AutomaticConfig,
}

/// Top-level configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct Config {
    pub snapshots: SnapshotsConfig,
}

impl Config {
    pub fn default_for(kind: InstallKind) -> Self {
        Config {
            snapshots: SnapshotsConfig {
                automatic: AutomaticConfig::default_for(kind),
            },
        }
    }
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/snapshot-core.toml")];
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/snapshot-core.toml")));
    }
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/snapshot-core.toml")));
    }
    paths.push(PathBuf::from("snapshot-core.toml"));
    paths
}

/// Loads configuration from the first found config file in the search
/// path, falling back to `kind`'s default when none exists.
pub fn load_config(kind: InstallKind) -> Result<Config> {
    for path in config_search_paths() {
        if path.exists() {
            return load_config_from(&path);
        }
    }
    Ok(Config::default_for(kind))
}

/// Loads configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| crate::error::SnapshotError::internal(format!(
            "failed to read {}: {e}",
            path.display()
        )))?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

/// Writes a default configuration file for `kind` at `path`.
pub fn init_config(path: &Path, kind: InstallKind) -> Result<()> {
    let config = Config::default_for(kind);
    let toml_str = toml::to_string_pretty(&config).map_err(|e| {
        crate::error::SnapshotError::internal(format!("failed to serialize config: {e}"))
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml_str)?;
    Ok(())
}
