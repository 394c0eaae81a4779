//! A snapshot engine for a larger package manager: archives a snap's system
//! and per-user data to a content-verified container, tracks the sets those
//! archives belong to, and turns save/restore/check/forget intents into
//! task graphs the host scheduler can run, undo, and retry.
//!
//! This crate implements two halves of that system:
//!
//! - the snapshot **backend** ([`backend`]): the archive codec ([`archive`],
//!   [`snapshot`], [`hash`]), OS user enumeration ([`users`]), and
//!   restore-state bookkeeping ([`restore_state`]) it builds on;
//! - the snapshot **manager** ([`orchestrator`]): task-graph construction and
//!   do/undo/cleanup handlers, backed by the set registry ([`registry`]),
//!   conflict arbiter ([`conflict`]), and auto-expire sweep ([`auto_expire`]).
//!
//! Everything this crate needs from its embedding host — durable state, the
//! install database, snap configuration, the OS user database, the task
//! scheduler — is expressed as a trait in [`collab`]; none of those traits
//! are implemented here.

pub mod archive;
pub mod auto_expire;
pub mod backend;
pub mod collab;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hash;
pub mod orchestrator;
pub mod registry;
pub mod restore_state;
pub mod snapshot;
pub mod users;

pub use error::{Result, SnapshotError};
pub use snapshot::{Epoch, Snapshot, SnapshotOptions, SnapshotSet};
