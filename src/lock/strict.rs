use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{wait_for_grant, HolderInfo, Holders, LockId, LockMode, LockNode, Owner, Ticket, Wait};
use crate::config::Policy;
use crate::error::{LockError, Result};

#[derive(Debug, Default)]
struct StrictState {
    readers: Holders,
    writers: Holders,
    readers_below: Holders,
    writers_below: Holders,
    namespace_readers: Holders,
    namespace_writers: Holders,
}

impl StrictState {
    fn holders_mut(&mut self, mode: LockMode) -> &mut Holders {
        match mode {
            LockMode::Read => &mut self.readers,
            LockMode::Write => &mut self.writers,
            LockMode::ReadBelow => &mut self.readers_below,
            LockMode::WriteBelow => &mut self.writers_below,
            LockMode::ReadNamespace => &mut self.namespace_readers,
            LockMode::WriteNamespace => &mut self.namespace_writers,
        }
    }

    /// Whether `owner` may take `mode` right now.
    fn permits(&self, mode: LockMode, owner: Owner) -> bool {
        match mode {
            LockMode::Read | LockMode::ReadBelow => {
                !self.writers.held_by_other(owner) && !self.namespace_writers.held_by_other(owner)
            }
            LockMode::Write | LockMode::WriteBelow => {
                !self.readers.held_by_other(owner)
                    && !self.namespace_readers.held_by_other(owner)
                    && !self.writers.held_by_other(owner)
                    && !self.namespace_writers.held_by_other(owner)
            }
            LockMode::ReadNamespace => {
                !self.writers.held_by_other(owner)
                    && !self.writers_below.held_by_other(owner)
                    && !self.namespace_writers.held_by_other(owner)
            }
            LockMode::WriteNamespace => {
                !self.readers_below.held_by_other(owner)
                    && !self.namespace_readers.held_by_other(owner)
                    && !self.writers.held_by_other(owner)
                    && !self.writers_below.held_by_other(owner)
                    && !self.namespace_writers.held_by_other(owner)
            }
        }
    }
}

/// Lock node that tracks every mode per owner and blocks on any conflict.
#[derive(Debug)]
pub struct StrictLockNode {
    id: LockId,
    state: Mutex<StrictState>,
    released: Condvar,
}

impl StrictLockNode {
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(StrictState::default()),
            released: Condvar::new(),
        }
    }
}

impl Default for StrictLockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl LockNode for StrictLockNode {
    fn id(&self) -> LockId {
        self.id
    }

    fn policy(&self) -> Policy {
        Policy::Strict
    }

    fn acquire(&self, mode: LockMode, owner: Owner, wait: &Wait) -> Result<Ticket> {
        let mut state = wait_for_grant(&self.state, &self.released, mode, wait, |s| {
            s.permits(mode, owner)
        })?;
        state.holders_mut(mode).enter(owner);
        debug!("{} acquired {} on {}", owner, mode, self.id);
        Ok(Ticket::new(self.id, mode, owner))
    }

    fn release_mode(&self, mode: LockMode, owner: Owner) -> Result<()> {
        let left = self.state.lock().holders_mut(mode).leave(owner);
        // Wake everyone: one release can satisfy several distinct predicates.
        self.released.notify_all();
        if !left {
            warn!("{} released {} on {} without holding it", owner, mode, self.id);
            return Err(LockError::IllegalState(format!(
                "{} does not hold {} on {}",
                owner, mode, self.id
            )));
        }
        debug!("{} released {} on {}", owner, mode, self.id);
        Ok(())
    }

    fn wake_all(&self) {
        // Taking the mutex orders the notify after any waiter's predicate check.
        drop(self.state.lock());
        self.released.notify_all();
    }

    fn holders(&self) -> Vec<HolderInfo> {
        let state = self.state.lock();
        let mut out = Vec::new();
        state.readers.report(LockMode::Read, &mut out);
        state.writers.report(LockMode::Write, &mut out);
        state.readers_below.report(LockMode::ReadBelow, &mut out);
        state.writers_below.report(LockMode::WriteBelow, &mut out);
        state.namespace_readers.report(LockMode::ReadNamespace, &mut out);
        state.namespace_writers.report(LockMode::WriteNamespace, &mut out);
        out
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.readers.is_empty()
            && state.writers.is_empty()
            && state.readers_below.is_empty()
            && state.writers_below.is_empty()
            && state.namespace_readers.is_empty()
            && state.namespace_writers.is_empty()
    }
}
