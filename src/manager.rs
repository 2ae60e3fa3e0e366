//! Path-level facade over the access tree.
//!
//! Locking `/a/b/c` takes `read` on `/`, `/a` and `/a/b`, then the requested
//! mode on `/a/b/c`. Because every caller locks ancestors before descendants,
//! callers that never hold one path's lock while starting another path's walk
//! cannot deadlock. That discipline is the caller's responsibility; it is not
//! checked.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{LockConfig, Policy};
use crate::error::{LockError, Result};
use crate::lock::{Interrupt, LockMode, Owner, Ticket, Wait};
use crate::state::access_tree::{AccessNode, AccessTree, SEPARATOR};
use crate::status::ManagerStatus;

/// The four path-level lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    Read,
    Write,
    ReadNamespace,
    WriteNamespace,
}

impl LockKind {
    pub const ALL: [LockKind; 4] = [
        LockKind::Read,
        LockKind::Write,
        LockKind::ReadNamespace,
        LockKind::WriteNamespace,
    ];

    /// Mode taken on the last node of the path.
    pub fn leaf_mode(self) -> LockMode {
        match self {
            LockKind::Read => LockMode::Read,
            LockKind::Write => LockMode::Write,
            LockKind::ReadNamespace => LockMode::ReadNamespace,
            LockKind::WriteNamespace => LockMode::WriteNamespace,
        }
    }

    pub fn is_write(self) -> bool {
        self.leaf_mode().is_write()
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.leaf_mode(), f)
    }
}

/// Split an absolute path into its segments. `/` yields no segments.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let rest = path
        .strip_prefix(SEPARATOR)
        .ok_or_else(|| LockError::InvalidPath {
            path: path.to_string(),
            reason: "must start with /",
        })?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = rest.split(SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(LockError::InvalidPath {
            path: path.to_string(),
            reason: "contains an empty segment",
        });
    }
    Ok(segments)
}

/// A held path lock: one ticket per node from the root to the leaf.
///
/// Hand it back to the matching unlock call of the manager that produced it.
/// Dropping a held lock without unlocking leaks its holds.
pub struct NamespaceLock {
    kind: LockKind,
    owner: Owner,
    path: String,
    held: Vec<(Arc<AccessNode>, Ticket)>,
}

impl NamespaceLock {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.held.is_empty()
    }

    /// Tickets held, ancestor to leaf.
    pub fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.held.iter().map(|(_, ticket)| ticket)
    }
}

impl fmt::Debug for NamespaceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceLock")
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(
                "{} lock on {} by {} dropped without unlock",
                self.kind, self.path, self.owner
            );
        }
    }
}

/// Unlocks a still-held lock when dropped, e.g. while unwinding.
struct UnlockOnDrop<'a> {
    manager: &'a NamespaceLockManager,
    lock: NamespaceLock,
}

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        if self.lock.is_released() {
            return;
        }
        let kind = self.lock.kind;
        if let Err(e) = self.manager.unlock(kind, &mut self.lock) {
            warn!("Failed to unlock {} after early exit: {}", self.lock.path, e);
        }
    }
}

pub struct NamespaceLockManager {
    config: LockConfig,
    tree: AccessTree,
}

impl Default for NamespaceLockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl NamespaceLockManager {
    pub fn new(config: LockConfig) -> Self {
        let tree = AccessTree::new(config.policy);
        Self { config, tree }
    }

    pub fn with_policy(policy: Policy) -> Self {
        Self::new(LockConfig {
            policy,
            ..LockConfig::default()
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn tree(&self) -> &AccessTree {
        &self.tree
    }

    fn default_wait(&self) -> Wait {
        Wait::timeout(self.config.timeout)
    }

    pub fn read_lock(&self, owner: Owner, path: &str) -> Result<NamespaceLock> {
        self.lock(LockKind::Read, owner, path, &self.default_wait())
    }

    pub fn write_lock(&self, owner: Owner, path: &str) -> Result<NamespaceLock> {
        self.lock(LockKind::Write, owner, path, &self.default_wait())
    }

    pub fn read_namespace_lock(&self, owner: Owner, path: &str) -> Result<NamespaceLock> {
        self.lock(LockKind::ReadNamespace, owner, path, &self.default_wait())
    }

    pub fn write_namespace_lock(&self, owner: Owner, path: &str) -> Result<NamespaceLock> {
        self.lock(LockKind::WriteNamespace, owner, path, &self.default_wait())
    }

    pub fn read_unlock(&self, lock: &mut NamespaceLock) -> Result<()> {
        self.unlock(LockKind::Read, lock)
    }

    pub fn write_unlock(&self, lock: &mut NamespaceLock) -> Result<()> {
        self.unlock(LockKind::Write, lock)
    }

    pub fn read_namespace_unlock(&self, lock: &mut NamespaceLock) -> Result<()> {
        self.unlock(LockKind::ReadNamespace, lock)
    }

    pub fn write_namespace_unlock(&self, lock: &mut NamespaceLock) -> Result<()> {
        self.unlock(LockKind::WriteNamespace, lock)
    }

    /// Lock `path` for `owner`: `read` on each ancestor, root first, then
    /// `kind` on the leaf. On failure everything taken so far is released
    /// before the error is returned.
    pub fn lock(
        &self,
        kind: LockKind,
        owner: Owner,
        path: &str,
        wait: &Wait,
    ) -> Result<NamespaceLock> {
        let segments = split_path(path)?;
        let chain = self.tree.get_access(&segments[..]);
        let last = chain.len() - 1;
        let leaf = Arc::clone(&chain[last]);

        let mut held = Vec::with_capacity(chain.len());
        for (depth, node) in chain.into_iter().enumerate() {
            let mode = if depth == last {
                kind.leaf_mode()
            } else {
                LockMode::Read
            };
            match node.lock().acquire(mode, owner, wait) {
                Ok(ticket) => held.push((node, ticket)),
                Err(e) => {
                    debug!(
                        "{} lock on {} by {} failed at depth {}: {}",
                        kind, path, owner, depth, e
                    );
                    self.unwind(held, &leaf);
                    return Err(e);
                }
            }
        }

        debug!("{} lock on {} granted to {}", kind, path, owner);
        Ok(NamespaceLock {
            kind,
            owner,
            path: path.to_string(),
            held,
        })
    }

    /// Release a lock produced by [`lock`](Self::lock) with the same `kind`:
    /// leaf first, then ancestors up to the root, then the tree walk.
    pub fn unlock(&self, kind: LockKind, lock: &mut NamespaceLock) -> Result<()> {
        if lock.kind != kind {
            return Err(LockError::IllegalState(format!(
                "{} lock on {} released through {} unlock",
                lock.kind, lock.path, kind
            )));
        }
        let Some((root, _)) = lock.held.first() else {
            return Err(LockError::IllegalState(format!(
                "{} lock on {} already released",
                lock.kind, lock.path
            )));
        };
        if !Arc::ptr_eq(root, self.tree.root()) {
            return Err(LockError::IllegalState(format!(
                "{} lock on {} belongs to another lock manager",
                lock.kind, lock.path
            )));
        }

        let held = std::mem::take(&mut lock.held);
        let leaf = Arc::clone(&held[held.len() - 1].0);
        let mut first_err = None;
        for (node, ticket) in held.into_iter().rev() {
            if let Err(e) = node.lock().release(ticket) {
                first_err.get_or_insert(e);
            }
        }
        self.tree.release_access(&leaf);
        debug!("{} lock on {} released by {}", kind, lock.path, lock.owner);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `f` while holding a `kind` lock on `path`. The lock is released
    /// whatever `f` returns, and also if `f` panics.
    pub fn with_lock<R>(
        &self,
        kind: LockKind,
        owner: Owner,
        path: &str,
        f: impl FnOnce() -> R,
    ) -> Result<R> {
        let mut guard = UnlockOnDrop {
            manager: self,
            lock: self.lock(kind, owner, path, &self.default_wait())?,
        };
        let out = f();
        self.unlock(kind, &mut guard.lock)?;
        Ok(out)
    }

    /// Raise `interrupt` and wake every waiter, so acquisitions waiting with
    /// that token fail with [`LockError::Interrupted`].
    pub fn interrupt(&self, interrupt: &Interrupt) {
        interrupt.raise();
        self.tree.wake_all();
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            policy: self.config.policy,
            timeout_ms: self.config.timeout.as_millis() as u64,
            live_nodes: self.tree.live_nodes(),
            nodes: self.tree.snapshot(),
        }
    }

    pub fn status_json(&self) -> String {
        serde_json::to_string_pretty(&self.status()).unwrap_or_else(|_| "{}".to_string())
    }

    fn unwind(&self, held: Vec<(Arc<AccessNode>, Ticket)>, leaf: &Arc<AccessNode>) {
        for (node, ticket) in held.into_iter().rev() {
            if let Err(e) = node.lock().release(ticket) {
                warn!("Unwinding partial lock left a hold behind: {}", e);
            }
        }
        self.tree.release_access(leaf);
    }
}
