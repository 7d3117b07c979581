use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::tree::{NodeId, TreeMove, TreeView};

/// Provenance tag: why a node or PV entry entered a queue. Diagnostics and
/// attribution only; the pipeline never branches on it.
pub type SourceTag = u8;

/// Node queued from a backup update that crossed the visit threshold.
pub const SOURCE_BACKUP: SourceTag = 1;
/// Node queued at expansion time.
pub const SOURCE_EXPANSION: SourceTag = 2;
/// Root node, submitted directly by worker 0.
pub const SOURCE_ROOT: SourceTag = 3;

/// One unit of helper work. The root snapshot is captured at enqueue time so
/// the purge pass can tell whether the entry is still inside the live
/// subtree; keeping node, root and source in one entry makes the pairing
/// invariant structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub node: NodeId,
    pub root: NodeId,
    pub source: SourceTag,
}

/// One decoded principal variation, ordered from the search root, in the
/// tree's own move encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvEntry {
    pub moves: Vec<TreeMove>,
    pub source: SourceTag,
    pub root: NodeId,
}

/// Blocking FIFO of analysis work, shared between tree-search threads
/// (producers) and helper workers (consumers).
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    cancelled: Arc<AtomicBool>,
}

impl WorkQueue {
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            cancelled,
        }
    }

    /// Queue a node for helper analysis. The caller holds the tree read
    /// lock (the `view`); the pending sentinel is written under the queue
    /// lock, in the same critical section as the push, so a concurrent
    /// reader never observes an enqueued-but-unmarked node.
    pub fn enqueue(&self, view: &TreeView<'_>, node: NodeId, source: SourceTag) {
        // Cancellation can race the enqueue; re-check before taking the lock.
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let mut items = self.items.lock().unwrap();
        view.set_pending(node);
        items.push_back(WorkItem {
            node,
            root: view.root(),
            source,
        });
        trace!(queued = items.len(), source, "node queued for helper analysis");
        drop(items);
        self.available.notify_one();
    }

    /// Block until work is available or cancellation is signaled. Returns
    /// `None` on cancellation; the caller must exit its loop.
    pub fn dequeue(&self) -> Option<WorkItem> {
        let mut items = self.items.lock().unwrap();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            items = self.available.wait(items).unwrap();
        }
    }

    /// Push an already-pending item back to the tail (deferral of a deep
    /// node). The node keeps its pending mark; the notify is harmless
    /// pacing.
    pub fn requeue(&self, item: WorkItem) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        drop(items);
        self.available.notify_one();
    }

    /// Discard entries whose captured root no longer equals `current_root`
    /// (the opponent's move advanced the tree past them). Remaining entries
    /// keep their relative order. Returns the number discarded.
    pub fn purge(&self, current_root: NodeId) -> usize {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|item| item.root == current_root);
        before - items.len()
    }

    /// Unconditionally drop everything (new game).
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let cleared = items.len();
        items.clear();
        cleared
    }

    /// Wake every waiting consumer so it can observe cancellation.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

/// Output queue of decoded PVs, consumed by the tree-extension subsystem.
#[derive(Default)]
pub struct PvQueue {
    entries: Mutex<VecDeque<PvEntry>>,
}

impl PvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: PvEntry) {
        self.entries.lock().unwrap().push_back(entry);
    }

    pub fn try_pop(&self) -> Option<PvEntry> {
        self.entries.lock().unwrap().pop_front()
    }

    /// Take every queued entry at once.
    pub fn drain(&self) -> Vec<PvEntry> {
        self.entries.lock().unwrap().drain(..).collect()
    }

    /// Same staleness rule as the work queue, applied to each entry's
    /// recorded ancestry root.
    pub fn purge(&self, current_root: NodeId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| entry.root == current_root);
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Ledger of nodes the tree-extension subsystem spliced in on the helper's
/// advice, with the root captured at record time. Purged like the queues;
/// feeds the per-move acceptance ratio.
#[derive(Default)]
pub struct ExtensionLedger {
    entries: Mutex<VecDeque<(NodeId, NodeId)>>,
}

impl ExtensionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: NodeId, root: NodeId) {
        self.entries.lock().unwrap().push_back((node, root));
    }

    pub fn purge(&self, current_root: NodeId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(_, root)| *root == current_root);
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
