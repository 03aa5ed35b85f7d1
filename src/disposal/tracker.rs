//! In-memory commit tracker

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

use super::{CommitTracker, DeleteCallback};

struct PendingDeletion {
    identity: String,
    /// Runs once a commit at or past this id is confirmed
    threshold: u64,
    callback: DeleteCallback,
}

struct TrackerState {
    /// Latest id handed out by `begin_commit`
    current: u64,
    last_confirmed: Option<u64>,
    /// In registration order
    pending: Vec<PendingDeletion>,
}

/// Commit tracker that keeps its registrations in memory
///
/// Callbacks run on the thread calling [`confirm_commit`](Self::confirm_commit),
/// outside the tracker's lock.
pub struct InMemoryCommitTracker {
    state: Mutex<TrackerState>,
}

impl InMemoryCommitTracker {
    /// Start counting commits at `start`
    pub fn new(start: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                current: start,
                last_confirmed: None,
                pending: Vec::new(),
            }),
        }
    }

    /// Advance to the next commit id and return it
    pub fn begin_commit(&self) -> u64 {
        let mut state = self.state.lock();
        state.current += 1;
        state.current
    }

    /// Mark `commit_id` durable and run every deletion it makes safe
    ///
    /// Returns the number of callbacks run, failed ones included.
    pub fn confirm_commit(&self, commit_id: u64) -> usize {
        let due: Vec<PendingDeletion> = {
            let mut state = self.state.lock();
            state.last_confirmed = Some(state.last_confirmed.map_or(commit_id, |c| c.max(commit_id)));
            let (due, keep) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| p.threshold <= commit_id);
            state.pending = keep;
            due
        };

        let count = due.len();
        for deletion in due {
            match (deletion.callback)() {
                Ok(()) => debug!(identity = %deletion.identity, commit_id, "Deferred deletion completed"),
                Err(e) => warn!(identity = %deletion.identity, commit_id, error = %e, "Deferred deletion failed"),
            }
        }
        count
    }

    /// Highest commit id confirmed so far
    pub fn last_confirmed(&self) -> Option<u64> {
        self.state.lock().last_confirmed
    }

    /// Number of registered deletions not yet run
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, identity: &str) -> bool {
        self.state.lock().pending.iter().any(|p| p.identity == identity)
    }
}

impl Default for InMemoryCommitTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for InMemoryCommitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryCommitTracker")
            .field("current", &state.current)
            .field("last_confirmed", &state.last_confirmed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl CommitTracker for InMemoryCommitTracker {
    fn current_commit_id(&self) -> u64 {
        self.state.lock().current
    }

    fn register_for_deferred_deletion(
        &self,
        identity: &str,
        commit_id_at_creation: u64,
        on_commit: DeleteCallback,
    ) -> Result<()> {
        debug!(identity, commit_id_at_creation, "Registered deferred deletion");
        self.state.lock().pending.push(PendingDeletion {
            identity: identity.to_string(),
            threshold: commit_id_at_creation,
            callback: on_commit,
        });
        Ok(())
    }
}
