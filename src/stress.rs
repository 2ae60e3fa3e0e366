use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StressConfig;
use crate::error::{LockError, Result};
use crate::lock::{Owner, Wait};
use crate::manager::{LockKind, NamespaceLockManager};
use crate::status::ManagerStatus;

/// Segment names are drawn from a small alphabet so paths share ancestors.
const SEGMENT_NAMES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct KindCounts {
    pub acquired: u64,
    pub timeouts: u64,
    pub errors: u64,
}

impl KindCounts {
    fn merge(&mut self, other: &KindCounts) {
        self.acquired += other.acquired;
        self.timeouts += other.timeouts;
        self.errors += other.errors;
    }
}

#[derive(Debug, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub elapsed_ms: u64,
    pub per_kind: BTreeMap<LockKind, KindCounts>,
    /// Nodes still in the tree after every worker finished, root excluded.
    pub residual_nodes: usize,
    /// Holds still registered after every worker finished.
    pub residual_holds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midpoint_status: Option<ManagerStatus>,
}

impl StressReport {
    pub fn total(&self) -> KindCounts {
        let mut total = KindCounts::default();
        for counts in self.per_kind.values() {
            total.merge(counts);
        }
        total
    }
}

/// Build `count` random absolute paths of depth 1..=`depth`.
pub fn generate_paths(seed: u64, count: usize, depth: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(1..=depth);
            let mut path = String::new();
            for _ in 0..len {
                path.push('/');
                path.push_str(SEGMENT_NAMES[rng.gen_range(0..SEGMENT_NAMES.len())]);
            }
            path
        })
        .collect()
}

/// Run worker threads against a fresh manager until `config.duration`
/// elapses or `shutdown` is set.
pub fn run_stress(
    config: &StressConfig,
    shutdown: &AtomicBool,
    show_status: bool,
) -> Result<StressReport> {
    config.validate()?;

    let manager = NamespaceLockManager::new(config.lock.clone());
    let paths = generate_paths(config.seed, config.paths, config.depth);
    let start = Instant::now();
    let deadline = start + config.duration;

    info!(
        "Stress run: policy={:?}, threads={}, paths={}, duration={:?}",
        config.lock.policy, config.threads, config.paths, config.duration
    );

    let (per_kind, midpoint_status) = std::thread::scope(|scope| -> Result<_> {
        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let (manager, paths) = (&manager, &paths);
            let handle = std::thread::Builder::new()
                .name(format!("nslock-worker-{}", index))
                .spawn_scoped(scope, move || {
                    worker(index as u64, manager, paths, config, deadline, shutdown)
                })?;
            workers.push(handle);
        }

        let midpoint_status = if show_status {
            sleep_until(start + config.duration / 2, shutdown);
            Some(manager.status())
        } else {
            None
        };

        let mut per_kind: BTreeMap<LockKind, KindCounts> = BTreeMap::new();
        for handle in workers {
            let counts = handle
                .join()
                .map_err(|_| LockError::IllegalState("stress worker panicked".to_string()))?;
            for (kind, c) in counts {
                per_kind.entry(kind).or_default().merge(&c);
            }
        }
        Ok((per_kind, midpoint_status))
    })?;

    let status = manager.status();
    let report = StressReport {
        config: config.clone(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        per_kind,
        residual_nodes: status.live_nodes.saturating_sub(1),
        residual_holds: status.held_locks(),
        midpoint_status,
    };
    info!(
        "Stress run finished in {}ms, residual_nodes={}",
        report.elapsed_ms, report.residual_nodes
    );
    Ok(report)
}

fn worker(
    index: u64,
    manager: &NamespaceLockManager,
    paths: &[String],
    config: &StressConfig,
    deadline: Instant,
    shutdown: &AtomicBool,
) -> BTreeMap<LockKind, KindCounts> {
    let owner = Owner::new();
    let mut rng = StdRng::seed_from_u64(config.seed ^ (index + 1).wrapping_mul(0x9e37_79b9));
    let wait = Wait::timeout(config.lock.timeout);
    let mut counts: BTreeMap<LockKind, KindCounts> = BTreeMap::new();
    debug!("Stress worker {} running as {}", index, owner);

    while !shutdown.load(Ordering::Relaxed) && Instant::now() < deadline {
        let Some(path) = paths.choose(&mut rng) else {
            break;
        };
        let family: &[LockKind] = if rng.gen_bool(config.write_ratio) {
            &[LockKind::Write, LockKind::WriteNamespace]
        } else {
            &[LockKind::Read, LockKind::ReadNamespace]
        };
        let kind = family[rng.gen_range(0..family.len())];
        let entry = counts.entry(kind).or_default();

        match manager.lock(kind, owner, path, &wait) {
            Ok(mut lock) => {
                entry.acquired += 1;
                if !config.hold.is_zero() {
                    std::thread::sleep(config.hold);
                }
                if let Err(e) = manager.unlock(kind, &mut lock) {
                    warn!("Worker {} failed to unlock {}: {}", index, path, e);
                    entry.errors += 1;
                }
            }
            Err(e) if e.is_retryable() => entry.timeouts += 1,
            Err(e) => {
                warn!("Worker {} failed to lock {}: {}", index, path, e);
                entry.errors += 1;
            }
        }
    }

    debug!("Stress worker {} stopping", index);
    counts
}

/// Sleep in short ticks so the shutdown flag is noticed promptly.
fn sleep_until(until: Instant, shutdown: &AtomicBool) {
    let tick = Duration::from_millis(10);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(tick));
    }
}
