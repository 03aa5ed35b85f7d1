//! Delayed Disposal Module
//!
//! Defers physical deletion of a container until a commit tracker confirms
//! that no durable state can still reference it.
//!
//! ## State Machine
//! ```text
//!            dispose()                 confirm_commit(id >= creation id)
//! Active ──────────────► Pending ───────────────────────────────────► Disposed
//!    │                                                                   ▲
//!    └──────────── dispose() on a shadow (nothing to delete) ────────────┘
//! ```
//!
//! ## Responsibilities
//! - [`CommitTracker`]: the external collaborator that owns commit ids
//! - [`InMemoryCommitTracker`]: reference tracker for tests and the CLI
//! - [`DelayedDisposalContainer`] / [`DelayedDisposalBuffer`]: the wrappers
//!
//! Trackers are not persisted. A resumed wrapper that was pending re-registers
//! with whatever tracker the new process supplies.

mod tracker;
mod wrapper;

use std::fmt;

use crate::error::Result;

pub use tracker::InMemoryCommitTracker;
pub use wrapper::{DelayedDisposalBuffer, DelayedDisposalContainer};

/// Physical-deletion callback handed to a [`CommitTracker`]
pub type DeleteCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Lifecycle of a delayed-disposal wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalState {
    /// Usable
    Active,
    /// Logically disposed, waiting for the tracker
    Pending,
    /// Physical storage released
    Disposed,
}

/// Source of commit ids and executor of deferred deletions
pub trait CommitTracker: Send + Sync + fmt::Debug {
    /// Id of the commit currently in progress
    fn current_commit_id(&self) -> u64;

    /// Run `on_commit` once a commit with id `>= commit_id_at_creation` is
    /// confirmed
    fn register_for_deferred_deletion(
        &self,
        identity: &str,
        commit_id_at_creation: u64,
        on_commit: DeleteCallback,
    ) -> Result<()>;
}
