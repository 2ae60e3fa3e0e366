//! Per-path lock nodes.
//!
//! A [`LockNode`] guards one path segment. Callers identify themselves with an
//! explicit [`Owner`] token; every successful acquisition returns a [`Ticket`]
//! that must be handed back to release exactly what was taken. Two policies
//! implement the same contract:
//!
//! - [`StrictLockNode`] tracks all six modes per owner and blocks readers
//!   against writers.
//! - [`DirtyReadLockNode`] never blocks or tracks the read family; only the
//!   write family is tracked and mutually excluded.
//!
//! Holding a mode is reentrant: an owner may acquire a mode it already holds
//! (or a compatible one) without blocking on itself, and must release it the
//! same number of times.

pub mod dirty_read;
pub mod strict;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::config::Policy;
use crate::error::{LockError, Result};

pub use self::dirty_read::DirtyReadLockNode;
pub use self::strict::StrictLockNode;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: Owner = Owner::new();
}

/// The six lock modes a [`LockNode`] understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    Read,
    Write,
    ReadBelow,
    WriteBelow,
    ReadNamespace,
    WriteNamespace,
}

impl LockMode {
    pub const ALL: [LockMode; 6] = [
        LockMode::Read,
        LockMode::Write,
        LockMode::ReadBelow,
        LockMode::WriteBelow,
        LockMode::ReadNamespace,
        LockMode::WriteNamespace,
    ];

    pub fn is_write(self) -> bool {
        matches!(
            self,
            LockMode::Write | LockMode::WriteBelow | LockMode::WriteNamespace
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::ReadBelow => "read-below",
            LockMode::WriteBelow => "write-below",
            LockMode::ReadNamespace => "read-namespace",
            LockMode::WriteNamespace => "write-namespace",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a lock caller. Lock state is keyed by owner, not by thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Owner(u64);

impl Owner {
    /// Allocate a fresh, process-unique owner.
    pub fn new() -> Self {
        Owner(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// The owner bound to the calling thread. Stable for the thread's lifetime.
    pub fn current() -> Self {
        THREAD_OWNER.with(|owner| *owner)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Process-unique identity of a lock node, carried by its tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockId(u64);

impl LockId {
    fn next() -> Self {
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// Proof of a successful acquisition. Consumed by [`LockNode::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a ticket must be released or the lock stays held"]
pub struct Ticket {
    lock: LockId,
    mode: LockMode,
    owner: Owner,
}

impl Ticket {
    pub(crate) fn new(lock: LockId, mode: LockMode, owner: Owner) -> Self {
        Self { lock, mode, owner }
    }

    pub fn lock_id(&self) -> LockId {
        self.lock
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }
}

/// Shared flag that makes waiters holding it give up with
/// [`LockError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Waiters only notice after their node is notified; use
    /// `NamespaceLockManager::interrupt` to wake them.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long an acquisition may block, and what may cut it short.
#[derive(Debug, Clone)]
pub struct Wait {
    timeout: Duration,
    interrupt: Option<Interrupt>,
}

impl Wait {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            interrupt: None,
        }
    }

    pub fn millis(ms: u64) -> Self {
        Self::timeout(Duration::from_millis(ms))
    }

    /// Try once, never block.
    pub fn immediate() -> Self {
        Self::timeout(Duration::ZERO)
    }

    pub fn with_interrupt(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    pub fn budget(&self) -> Duration {
        self.timeout
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_raised)
    }
}

/// One owner's hold on one mode, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderInfo {
    pub owner: Owner,
    pub mode: LockMode,
    pub depth: u32,
}

/// Owner → reentrancy depth for a single mode.
#[derive(Debug, Default)]
pub(crate) struct Holders(HashMap<Owner, u32>);

impl Holders {
    pub(crate) fn enter(&mut self, owner: Owner) {
        *self.0.entry(owner).or_insert(0) += 1;
    }

    /// Drop one level of `owner`'s hold. Returns false if it held nothing.
    pub(crate) fn leave(&mut self, owner: Owner) -> bool {
        let Some(depth) = self.0.get_mut(&owner) else {
            return false;
        };
        *depth -= 1;
        if *depth == 0 {
            self.0.remove(&owner);
        }
        true
    }

    pub(crate) fn held_by_other(&self, owner: Owner) -> bool {
        self.0.keys().any(|holder| *holder != owner)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn report(&self, mode: LockMode, out: &mut Vec<HolderInfo>) {
        out.extend(self.0.iter().map(|(owner, depth)| HolderInfo {
            owner: *owner,
            mode,
            depth: *depth,
        }));
    }
}

/// The lock state machine guarding one path segment.
///
/// Implementors supply [`acquire`](LockNode::acquire) and
/// [`release_mode`](LockNode::release_mode); the per-mode operations are thin
/// wrappers over those two.
pub trait LockNode: Send + Sync + fmt::Debug {
    fn id(&self) -> LockId;

    fn policy(&self) -> Policy;

    /// Block until `mode` is compatible for `owner`, or `wait` runs out.
    /// A failed acquisition changes nothing.
    fn acquire(&self, mode: LockMode, owner: Owner, wait: &Wait) -> Result<Ticket>;

    /// Give back one level of `owner`'s hold on `mode`.
    fn release_mode(&self, mode: LockMode, owner: Owner) -> Result<()>;

    /// Notify every waiter so it rechecks its condition.
    fn wake_all(&self);

    /// Every tracked hold, in no particular order.
    fn holders(&self) -> Vec<HolderInfo>;

    fn is_idle(&self) -> bool {
        self.holders().is_empty()
    }

    fn read(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::Read, owner, wait)
    }

    fn write(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::Write, owner, wait)
    }

    fn read_below(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::ReadBelow, owner, wait)
    }

    fn write_below(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::WriteBelow, owner, wait)
    }

    fn read_namespace(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::ReadNamespace, owner, wait)
    }

    fn write_namespace(&self, owner: Owner, wait: &Wait) -> Result<Ticket> {
        self.acquire(LockMode::WriteNamespace, owner, wait)
    }

    fn release_read(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::Read, owner)
    }

    fn release_write(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::Write, owner)
    }

    fn release_read_below(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::ReadBelow, owner)
    }

    fn release_write_below(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::WriteBelow, owner)
    }

    fn release_read_namespace(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::ReadNamespace, owner)
    }

    fn release_write_namespace(&self, owner: Owner) -> Result<()> {
        self.release_mode(LockMode::WriteNamespace, owner)
    }

    /// Release whatever `ticket` names. Tickets from another node are rejected.
    fn release(&self, ticket: Ticket) -> Result<()> {
        if ticket.lock != self.id() {
            return Err(LockError::InvalidTicket(format!(
                "{} {} ticket for {} presented to {}",
                ticket.owner,
                ticket.mode,
                ticket.lock,
                self.id()
            )));
        }
        match ticket.mode {
            LockMode::Read => self.release_read(ticket.owner),
            LockMode::Write => self.release_write(ticket.owner),
            LockMode::ReadBelow => self.release_read_below(ticket.owner),
            LockMode::WriteBelow => self.release_write_below(ticket.owner),
            LockMode::ReadNamespace => self.release_read_namespace(ticket.owner),
            LockMode::WriteNamespace => self.release_write_namespace(ticket.owner),
        }
    }
}

/// Build a lock node for `policy`.
pub fn new_lock_node(policy: Policy) -> Box<dyn LockNode> {
    match policy {
        Policy::Strict => Box::new(StrictLockNode::new()),
        Policy::DirtyRead => Box::new(DirtyReadLockNode::new()),
    }
}

/// Bounded wait on `cond` until `granted` holds for the guarded state.
///
/// Returns the guard with the predicate satisfied so the caller can record its
/// hold before anyone else observes the state. Timeouts and interruptions
/// notify all other waiters before returning.
pub(crate) fn wait_for_grant<'a, S>(
    state: &'a Mutex<S>,
    cond: &Condvar,
    mode: LockMode,
    wait: &Wait,
    mut granted: impl FnMut(&S) -> bool,
) -> Result<MutexGuard<'a, S>> {
    let deadline = Instant::now().checked_add(wait.timeout);
    let mut guard = state.lock();
    loop {
        if granted(&*guard) {
            return Ok(guard);
        }
        if wait.is_interrupted() {
            drop(guard);
            cond.notify_all();
            return Err(LockError::Interrupted { mode });
        }
        let timed_out = match deadline {
            Some(deadline) => cond.wait_until(&mut guard, deadline).timed_out(),
            None => {
                cond.wait(&mut guard);
                false
            }
        };
        if timed_out && !granted(&*guard) {
            drop(guard);
            cond.notify_all();
            return Err(LockError::Timeout {
                mode,
                timeout: wait.timeout,
            });
        }
    }
}
