//! Garbage collector
//!
//! Tracks objects whose reference counter dropped to zero. Unlocked ones
//! (`zombies`) are destroyed in bounded batches by replicated
//! `DestroyObjects` mutations issued from the leader; locked ones wait in
//! `locked_zombies` until their last lock is released.
//!
//! All bookkeeping happens on the state thread inside ordered mutations.
//! The collect future is the only piece handed out to other tasks.

use cellmaster_common::ObjectId;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Future resolved once the collector is empty.
pub type CollectFuture = Shared<BoxFuture<'static, ()>>;

struct CollectPromise {
    tx: Option<oneshot::Sender<()>>,
    future: CollectFuture,
}

impl CollectPromise {
    fn resolved() -> Self {
        Self {
            tx: None,
            future: futures::future::ready(()).boxed().shared(),
        }
    }

    fn pending() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            future: rx.map(|_| ()).boxed().shared(),
        }
    }

    const fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    fn resolve(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// GC counters, readable without the state lock.
#[derive(Debug, Default)]
pub struct GcStats {
    destroyed_objects: AtomicU64,
    zombies: AtomicU64,
    locked_zombies: AtomicU64,
}

impl GcStats {
    pub fn destroyed_objects(&self) -> u64 {
        self.destroyed_objects.load(Ordering::Relaxed)
    }

    pub fn zombies(&self) -> u64 {
        self.zombies.load(Ordering::Relaxed)
    }

    pub fn locked_zombies(&self) -> u64 {
        self.locked_zombies.load(Ordering::Relaxed)
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "# HELP cellmaster_gc_destroyed_objects_total Objects destroyed by the GC");
        let _ = writeln!(output, "# TYPE cellmaster_gc_destroyed_objects_total counter");
        let _ = writeln!(output, "cellmaster_gc_destroyed_objects_total {}", self.destroyed_objects());
        let _ = writeln!(output, "# HELP cellmaster_gc_zombies Unreferenced objects awaiting destruction");
        let _ = writeln!(output, "# TYPE cellmaster_gc_zombies gauge");
        let _ = writeln!(output, "cellmaster_gc_zombies{{locked=\"false\"}} {}", self.zombies());
        let _ = writeln!(output, "cellmaster_gc_zombies{{locked=\"true\"}} {}", self.locked_zombies());
        output
    }
}

/// Zombie bookkeeping of one replica.
pub struct GarbageCollector {
    zombies: HashSet<ObjectId>,
    locked_zombies: HashSet<ObjectId>,
    collect_promise: CollectPromise,
    stats: Arc<GcStats>,
    profiling: bool,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            zombies: HashSet::new(),
            locked_zombies: HashSet::new(),
            collect_promise: CollectPromise::resolved(),
            stats: Arc::new(GcStats::default()),
            profiling: true,
        }
    }

    pub fn stats(&self) -> Arc<GcStats> {
        self.stats.clone()
    }

    /// Forget every zombie and resolve pending collect futures.
    pub fn clear(&mut self) {
        self.zombies.clear();
        self.locked_zombies.clear();
        self.collect_promise.resolve();
        self.update_gauges();
    }

    /// Counters are frozen while recovering.
    pub fn set_profiling(&mut self, enabled: bool) {
        self.profiling = enabled;
        self.update_gauges();
    }

    /// Resolves once both zombie sets are empty.
    pub fn collect(&self) -> CollectFuture {
        self.collect_promise.future.clone()
    }

    /// An object lost its last reference.
    pub fn enqueue(&mut self, id: ObjectId, locked: bool) {
        if self.collect_promise.is_resolved() {
            self.collect_promise = CollectPromise::pending();
        }
        let inserted = if locked {
            self.locked_zombies.insert(id)
        } else {
            self.zombies.insert(id)
        };
        assert!(
            inserted && !(self.zombies.contains(&id) && self.locked_zombies.contains(&id)),
            "object {id} is enqueued for GC twice"
        );
        self.update_gauges();
    }

    /// A dead object lost its last lock.
    pub fn unlock(&mut self, id: ObjectId) {
        assert!(
            self.locked_zombies.remove(&id),
            "unlocked object {id} is not a locked zombie"
        );
        assert!(self.zombies.insert(id), "object {id} is a zombie twice");
        self.update_gauges();
    }

    /// Release every locked zombie; locks taken before a failover are abandoned.
    /// Returns the released ids.
    pub fn unlock_all(&mut self) -> Vec<ObjectId> {
        let released: Vec<ObjectId> = self.locked_zombies.drain().collect();
        for id in &released {
            assert!(self.zombies.insert(*id), "object {id} is a zombie twice");
        }
        if !released.is_empty() {
            debug!(count = released.len(), "Released locked zombies");
        }
        self.update_gauges();
        released
    }

    /// Take an object out of the collector right before it is destroyed.
    pub fn dequeue(&mut self, id: ObjectId) {
        assert!(
            self.zombies.remove(&id),
            "destroyed object {id} is not an unlocked zombie"
        );
        if self.profiling {
            self.stats.destroyed_objects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Resolve the collect future if nothing is left. Called once per
    /// destroy batch, after the whole batch is applied.
    pub fn check_empty(&mut self) {
        self.update_gauges();
        if self.zombies.is_empty() && self.locked_zombies.is_empty() {
            self.collect_promise.resolve();
        }
    }

    pub fn is_zombie(&self, id: ObjectId) -> bool {
        self.zombies.contains(&id)
    }

    pub fn is_locked_zombie(&self, id: ObjectId) -> bool {
        self.locked_zombies.contains(&id)
    }

    pub fn has_garbage(&self) -> bool {
        !self.zombies.is_empty()
    }

    pub fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    pub fn locked_zombie_count(&self) -> usize {
        self.locked_zombies.len()
    }

    /// Up to `max` unlocked zombies, in no particular order.
    pub fn select(&self, max: usize) -> Vec<ObjectId> {
        self.zombies.iter().take(max).copied().collect()
    }

    /// Both zombie sets, for the snapshot. Locks are local, so every zombie
    /// is restored unlocked.
    pub fn save(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .zombies
            .iter()
            .chain(self.locked_zombies.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn load(&mut self, ids: Vec<ObjectId>) {
        self.zombies.clear();
        self.locked_zombies.clear();
        self.zombies.extend(ids);
        if self.zombies.is_empty() {
            self.collect_promise.resolve();
        } else if self.collect_promise.is_resolved() {
            self.collect_promise = CollectPromise::pending();
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        if !self.profiling {
            return;
        }
        self.stats
            .zombies
            .store(self.zombies.len() as u64, Ordering::Relaxed);
        self.stats
            .locked_zombies
            .store(self.locked_zombies.len() as u64, Ordering::Relaxed);
    }
}
