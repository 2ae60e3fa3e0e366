use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nslock::{Interrupt, LockError, LockKind, LockMode, Owner, Wait};

use crate::helpers::{
    assert_illegal_state, assert_timeout, dirty_read, let_waiter_block, now, strict, timed, LONG,
};

#[test]
fn test_siblings_do_not_block_each_other() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut c = manager.write_lock(a, "/a/b/c").unwrap();
    let mut d = manager.lock(LockKind::Write, b, "/a/b/d", &now()).unwrap();

    manager.write_unlock(&mut d).unwrap();
    manager.write_unlock(&mut c).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_same_path_blocks_other_owner() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut held = manager.write_lock(a, "/a/b/c").unwrap();
    assert_timeout(manager.lock(LockKind::Write, b, "/a/b/c", &now()));
    assert_timeout(manager.lock(LockKind::Read, b, "/a/b/c", &now()));

    manager.write_unlock(&mut held).unwrap();
    let mut next = manager.lock(LockKind::Write, b, "/a/b/c", &now()).unwrap();
    manager.write_unlock(&mut next).unwrap();
}

#[test]
fn test_write_waits_for_other_owners_reader() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut mine = manager.read_lock(a, "/x").unwrap();
    let mut theirs = manager.read_lock(b, "/x").unwrap();
    assert_timeout(manager.lock(LockKind::Write, a, "/x", &Wait::millis(50)));
    assert_eq!(manager.status().held_locks(), 4);

    manager.read_unlock(&mut theirs).unwrap();
    let mut write = manager.lock(LockKind::Write, a, "/x", &now()).unwrap();
    manager.write_unlock(&mut write).unwrap();
    manager.read_unlock(&mut mine).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_docs_report_scenario() {
    let manager = strict();
    let (t1, t2) = (Owner::new(), Owner::new());

    let mut report = manager.write_lock(t1, "/docs/report").unwrap();

    // T1 only holds read on /docs, so T2 can read it right away.
    let mut docs = manager.lock(LockKind::Read, t2, "/docs", &now()).unwrap();

    assert_timeout(manager.lock(LockKind::Read, t2, "/docs/report", &Wait::millis(50)));

    manager.write_unlock(&mut report).unwrap();
    let mut retry = manager.lock(LockKind::Read, t2, "/docs/report", &now()).unwrap();

    manager.read_unlock(&mut retry).unwrap();
    manager.read_unlock(&mut docs).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_writer_on_ancestor_blocks_descendants() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut parent = manager.write_lock(a, "/a").unwrap();
    assert_timeout(manager.lock(LockKind::Read, b, "/a/b", &now()));
    assert_timeout(manager.lock(LockKind::Write, b, "/a/b/c", &now()));

    // Another top-level subtree is untouched.
    let mut other = manager.lock(LockKind::Write, b, "/z", &now()).unwrap();
    manager.write_unlock(&mut other).unwrap();
    manager.write_unlock(&mut parent).unwrap();
}

#[test]
fn test_failed_lock_unwinds_everything() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut held = manager.write_lock(a, "/x").unwrap();
    assert_timeout(manager.lock(LockKind::Write, b, "/x/y/z", &now()));

    // Only the holder's walk remains: no /x/y, no holds by b anywhere.
    let status = manager.status();
    let paths: Vec<&str> = status.nodes.iter().map(|n| n.path.as_str()).collect();
    assert_eq!(paths, vec!["/", "/x"]);
    assert!(status
        .nodes
        .iter()
        .flat_map(|n| n.holders.iter())
        .all(|h| h.owner == a));
    assert_eq!(manager.tree().root().accessors("x"), 1);

    manager.write_unlock(&mut held).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_reentrant_write_lock() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut first = manager.write_lock(a, "/a/b").unwrap();
    let mut second = manager.write_lock(a, "/a/b").unwrap();

    manager.write_unlock(&mut first).unwrap();
    assert_timeout(manager.lock(LockKind::Write, b, "/a/b", &now()));

    manager.write_unlock(&mut second).unwrap();
    let mut next = manager.lock(LockKind::Write, b, "/a/b", &now()).unwrap();
    manager.write_unlock(&mut next).unwrap();
}

#[test]
fn test_namespace_locks() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut ns = manager.write_namespace_lock(a, "/a").unwrap();
    assert_timeout(manager.lock(LockKind::ReadNamespace, b, "/a", &now()));
    assert_timeout(manager.lock(LockKind::Read, b, "/a", &now()));
    assert_timeout(manager.lock(LockKind::Read, b, "/a/b", &now()));
    manager.write_namespace_unlock(&mut ns).unwrap();

    let mut r1 = manager.read_namespace_lock(a, "/a").unwrap();
    let mut r2 = manager.lock(LockKind::ReadNamespace, b, "/a", &now()).unwrap();
    assert_timeout(manager.lock(LockKind::WriteNamespace, b, "/a", &now()));
    manager.read_namespace_unlock(&mut r2).unwrap();
    manager.read_namespace_unlock(&mut r1).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_unlock_with_wrong_kind_keeps_the_lock() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut held = manager.write_lock(a, "/a").unwrap();
    assert_illegal_state(manager.read_unlock(&mut held));
    assert_illegal_state(manager.write_namespace_unlock(&mut held));
    assert!(!held.is_released());
    assert_timeout(manager.lock(LockKind::Write, b, "/a", &now()));

    manager.write_unlock(&mut held).unwrap();
    assert!(held.is_released());
}

#[test]
fn test_double_unlock_is_illegal_state() {
    let manager = strict();
    let a = Owner::new();

    let mut held = manager.read_lock(a, "/a/b").unwrap();
    manager.read_unlock(&mut held).unwrap();
    assert_illegal_state(manager.read_unlock(&mut held));
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_handle_from_another_manager_is_rejected() {
    let first = strict();
    let second = strict();
    let a = Owner::new();

    let mut held = first.write_lock(a, "/a").unwrap();
    assert_illegal_state(second.write_unlock(&mut held));
    first.write_unlock(&mut held).unwrap();
}

#[test]
fn test_malformed_paths_are_rejected() {
    let manager = strict();
    let a = Owner::new();

    for path in ["", "a/b", "//", "/a/", "/a//b"] {
        match manager.read_lock(a, path) {
            Err(LockError::InvalidPath { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected {:?} to be rejected, got {:?}", path, other),
        }
    }
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_root_can_be_locked() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let mut root = manager.write_lock(a, "/").unwrap();
    assert_eq!(root.tickets().count(), 1);
    assert_timeout(manager.lock(LockKind::Read, b, "/anything", &now()));
    manager.write_unlock(&mut root).unwrap();
}

#[test]
fn test_tickets_follow_the_path() {
    let manager = strict();
    let a = Owner::new();

    let mut held = manager.read_namespace_lock(a, "/a/b").unwrap();
    let modes: Vec<LockMode> = held.tickets().map(|t| t.mode()).collect();
    assert_eq!(
        modes,
        vec![LockMode::Read, LockMode::Read, LockMode::ReadNamespace]
    );
    assert_eq!(held.kind(), LockKind::ReadNamespace);
    assert_eq!(held.owner(), a);
    assert_eq!(held.path(), "/a/b");
    manager.read_namespace_unlock(&mut held).unwrap();
}

#[test]
fn test_with_lock_releases_afterwards() {
    let manager = strict();
    let a = Owner::new();

    let seen = manager
        .with_lock(LockKind::Write, a, "/a/b", || manager.tree().live_nodes())
        .unwrap();
    assert_eq!(seen, 3);
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_with_lock_releases_when_the_closure_panics() {
    let manager = strict();
    let (a, b) = (Owner::new(), Owner::new());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        manager.with_lock(LockKind::Write, a, "/a/b", || panic!("boom"))
    }));
    assert!(result.is_err());
    assert_eq!(manager.tree().live_nodes(), 1);
    assert_eq!(manager.status().held_locks(), 0);

    let mut next = manager.lock(LockKind::Write, b, "/a/b", &now()).unwrap();
    manager.write_unlock(&mut next).unwrap();
}

#[test]
fn test_status_json_reports_holders() {
    let manager = strict();
    let a = Owner::new();

    let mut held = manager.write_lock(a, "/docs/report").unwrap();
    let status: serde_json::Value = serde_json::from_str(&manager.status_json()).unwrap();

    assert_eq!(status["policy"], "strict");
    assert_eq!(status["live_nodes"], 3);
    let leaf = status["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["path"] == "/docs/report")
        .unwrap();
    assert_eq!(leaf["holders"][0]["mode"], "write");
    assert_eq!(leaf["holders"][0]["owner"], a.id());

    manager.write_unlock(&mut held).unwrap();
}

#[test]
fn test_blocked_writer_proceeds_after_unlock() {
    let manager = strict();
    let a = Owner::new();
    let mut held = manager.write_lock(a, "/a/b").unwrap();

    let manager2 = Arc::clone(&manager);
    let handle = timed(move || {
        let b = Owner::new();
        let mut lock = manager2.lock(LockKind::Write, b, "/a/b", &Wait::timeout(LONG))?;
        manager2.write_unlock(&mut lock)
    });
    let_waiter_block();
    manager.write_unlock(&mut held).unwrap();

    let (result, elapsed) = handle.join().unwrap();
    result.unwrap();
    assert!(elapsed < LONG);
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_interrupt_wakes_waiter() {
    let manager = strict();
    let a = Owner::new();
    let mut held = manager.write_lock(a, "/a").unwrap();
    let interrupt = Interrupt::new();

    let manager2 = Arc::clone(&manager);
    let wait = Wait::timeout(LONG).with_interrupt(&interrupt);
    let handle = timed(move || manager2.lock(LockKind::Write, Owner::new(), "/a/b", &wait));
    let_waiter_block();
    manager.interrupt(&interrupt);

    let (result, elapsed) = handle.join().unwrap();
    match result {
        Err(LockError::Interrupted { .. }) => {}
        other => panic!("expected an interruption, got {:?}", other),
    }
    assert!(elapsed < LONG);
    assert!(manager.tree().find(&["a", "b"]).is_none());

    manager.write_unlock(&mut held).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_writers_are_mutually_exclusive_under_contention() {
    let manager = strict();
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            std::thread::spawn(move || {
                let owner = Owner::new();
                for _ in 0..25 {
                    let mut lock = manager.write_lock(owner, "/shared/counter").unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    total.fetch_add(1, Ordering::SeqCst);
                    manager.write_unlock(&mut lock).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 200);
    assert_eq!(manager.tree().live_nodes(), 1);
}

#[test]
fn test_dirty_read_readers_pass_a_writer() {
    let manager = dirty_read();
    let (a, b) = (Owner::new(), Owner::new());

    let mut held = manager.write_lock(a, "/a").unwrap();
    let mut read = manager.lock(LockKind::Read, b, "/a", &now()).unwrap();
    let mut below = manager.lock(LockKind::Read, b, "/a/b", &now()).unwrap();
    assert_timeout(manager.lock(LockKind::Write, b, "/a", &now()));

    manager.read_unlock(&mut below).unwrap();
    manager.read_unlock(&mut read).unwrap();
    manager.write_unlock(&mut held).unwrap();
    assert_eq!(manager.tree().live_nodes(), 1);
}
