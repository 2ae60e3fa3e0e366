//! Hierarchical namespace lock manager.
//!
//! Callers lock slash-separated paths (`/docs/report`) in one of four kinds:
//! read, write, read-namespace and write-namespace. A lock on a path takes a
//! read hold on every ancestor and the requested mode on the path itself, so a
//! writer on `/docs/report` leaves `/docs/summary` fully available. Lock nodes
//! live in an [`AccessTree`] that creates them on first use and prunes them
//! once no walk passes through.
//!
//! ```no_run
//! use nslock::{NamespaceLockManager, Owner};
//!
//! let manager = NamespaceLockManager::default();
//! let owner = Owner::current();
//! let mut lock = manager.write_lock(owner, "/docs/report")?;
//! // ... mutate /docs/report ...
//! manager.write_unlock(&mut lock)?;
//! # Ok::<(), nslock::LockError>(())
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod state;
pub mod status;
pub mod stress;

pub use crate::config::{LockConfig, Policy};
pub use crate::error::{LockError, Result};
pub use crate::lock::{Interrupt, LockMode, LockNode, Owner, Ticket, Wait};
pub use crate::manager::{LockKind, NamespaceLock, NamespaceLockManager};
pub use crate::state::access_tree::{AccessNode, AccessTree};
