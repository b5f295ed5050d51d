//! Counters tracking carry-engine activity.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of carry statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct CarryStatsSnapshot {
    /// Carry operations executed across all levels.
    pub ops_executed: u64,
    /// Shifts into a left sibling.
    pub shifts_left: u64,
    /// Shifts into a right sibling.
    pub shifts_right: u64,
    /// Fresh nodes allocated by the space subsystem.
    pub new_nodes: u64,
    /// Level lock passes restarted after a neighbor conflict.
    pub lock_retries: u64,
    /// Paste requests satisfied by a fresh insert because no unit item
    /// covered or abutted the key.
    pub pastes_degraded: u64,
    /// Times a new root was stacked on top of the tree.
    pub root_grown: u64,
    /// Times the root was collapsed into its sole child.
    pub root_shrunk: u64,
}

/// Thread-safe statistics for carry passes.
#[derive(Default)]
pub struct CarryStats {
    ops_executed: AtomicU64,
    shifts_left: AtomicU64,
    shifts_right: AtomicU64,
    new_nodes: AtomicU64,
    lock_retries: AtomicU64,
    pastes_degraded: AtomicU64,
    root_grown: AtomicU64,
    root_shrunk: AtomicU64,
}

impl CarryStats {
    /// Carry operations executed so far.
    pub fn ops_executed(&self) -> u64 {
        self.ops_executed.load(AtomicOrdering::Relaxed)
    }

    /// Left shifts performed so far.
    pub fn shifts_left(&self) -> u64 {
        self.shifts_left.load(AtomicOrdering::Relaxed)
    }

    /// Right shifts performed so far.
    pub fn shifts_right(&self) -> u64 {
        self.shifts_right.load(AtomicOrdering::Relaxed)
    }

    /// Nodes allocated by the space subsystem so far.
    pub fn new_nodes(&self) -> u64 {
        self.new_nodes.load(AtomicOrdering::Relaxed)
    }

    /// Level lock restarts so far.
    pub fn lock_retries(&self) -> u64 {
        self.lock_retries.load(AtomicOrdering::Relaxed)
    }

    /// Paste-to-insert degradations so far.
    pub fn pastes_degraded(&self) -> u64 {
        self.pastes_degraded.load(AtomicOrdering::Relaxed)
    }

    /// Root growth events so far.
    pub fn root_grown(&self) -> u64 {
        self.root_grown.load(AtomicOrdering::Relaxed)
    }

    /// Root shrink events so far.
    pub fn root_shrunk(&self) -> u64 {
        self.root_shrunk.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_ops_executed(&self) {
        self.ops_executed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_shifts_left(&self) {
        self.shifts_left.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_shifts_right(&self) {
        self.shifts_right.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_new_nodes(&self) {
        self.new_nodes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_lock_retries(&self) {
        self.lock_retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pastes_degraded(&self) {
        self.pastes_degraded.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_grown(&self) {
        self.root_grown.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_shrunk(&self) {
        self.root_shrunk.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> CarryStatsSnapshot {
        CarryStatsSnapshot {
            ops_executed: self.ops_executed(),
            shifts_left: self.shifts_left(),
            shifts_right: self.shifts_right(),
            new_nodes: self.new_nodes(),
            lock_retries: self.lock_retries(),
            pastes_degraded: self.pastes_degraded(),
            root_grown: self.root_grown(),
            root_shrunk: self.root_shrunk(),
        }
    }

    /// Emits current counters to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "arbol::stats",
            ops_executed = snapshot.ops_executed,
            shifts_left = snapshot.shifts_left,
            shifts_right = snapshot.shifts_right,
            new_nodes = snapshot.new_nodes,
            lock_retries = snapshot.lock_retries,
            pastes_degraded = snapshot.pastes_degraded,
            root_grown = snapshot.root_grown,
            root_shrunk = snapshot.root_shrunk,
            "carry stats snapshot"
        );
    }
}
