use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{wait_for_grant, HolderInfo, Holders, LockId, LockMode, LockNode, Owner, Ticket, Wait};
use crate::config::Policy;
use crate::error::{LockError, Result};

#[derive(Debug, Default)]
struct WriterState {
    writers: Holders,
    writers_below: Holders,
    namespace_writers: Holders,
}

impl WriterState {
    fn holders_mut(&mut self, mode: LockMode) -> Option<&mut Holders> {
        match mode {
            LockMode::Write => Some(&mut self.writers),
            LockMode::WriteBelow => Some(&mut self.writers_below),
            LockMode::WriteNamespace => Some(&mut self.namespace_writers),
            LockMode::Read | LockMode::ReadBelow | LockMode::ReadNamespace => None,
        }
    }

    fn permits(&self, mode: LockMode, owner: Owner) -> bool {
        match mode {
            LockMode::Write | LockMode::WriteBelow => {
                !self.writers.held_by_other(owner) && !self.namespace_writers.held_by_other(owner)
            }
            LockMode::WriteNamespace => {
                !self.writers.held_by_other(owner)
                    && !self.writers_below.held_by_other(owner)
                    && !self.namespace_writers.held_by_other(owner)
            }
            LockMode::Read | LockMode::ReadBelow | LockMode::ReadNamespace => true,
        }
    }
}

/// Lock node whose reads never block and are never tracked.
///
/// Readers may observe a subtree halfway through a write; writers still
/// serialize against each other.
#[derive(Debug)]
pub struct DirtyReadLockNode {
    id: LockId,
    state: Mutex<WriterState>,
    released: Condvar,
}

impl DirtyReadLockNode {
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(WriterState::default()),
            released: Condvar::new(),
        }
    }
}

impl Default for DirtyReadLockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl LockNode for DirtyReadLockNode {
    fn id(&self) -> LockId {
        self.id
    }

    fn policy(&self) -> Policy {
        Policy::DirtyRead
    }

    fn acquire(&self, mode: LockMode, owner: Owner, wait: &Wait) -> Result<Ticket> {
        if !mode.is_write() {
            return Ok(Ticket::new(self.id, mode, owner));
        }
        let mut state = wait_for_grant(&self.state, &self.released, mode, wait, |s| {
            s.permits(mode, owner)
        })?;
        if let Some(holders) = state.holders_mut(mode) {
            holders.enter(owner);
        }
        debug!("{} acquired {} on {}", owner, mode, self.id);
        Ok(Ticket::new(self.id, mode, owner))
    }

    fn release_mode(&self, mode: LockMode, owner: Owner) -> Result<()> {
        let left = {
            let mut state = self.state.lock();
            match state.holders_mut(mode) {
                Some(holders) => holders.leave(owner),
                None => return Ok(()),
            }
        };
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
        drop(self.state.lock());
        self.released.notify_all();
    }

    fn holders(&self) -> Vec<HolderInfo> {
        let state = self.state.lock();
        let mut out = Vec::new();
        state.writers.report(LockMode::Write, &mut out);
        state.writers_below.report(LockMode::WriteBelow, &mut out);
        state.namespace_writers.report(LockMode::WriteNamespace, &mut out);
        out
    }
}
