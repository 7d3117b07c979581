use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::config::AdvisorConfig;
use crate::errors::{AdvisorError, Result};
use crate::queue::{ExtensionLedger, PvEntry, PvQueue, SourceTag, WorkItem, WorkQueue, SOURCE_ROOT};
use crate::session::{CommandPipe, HelperSession};
use crate::tree::{NodeId, SearchTree};
use crate::worker::run_request;

/// Retry interval for worker 0 while the root has no edges to analyze yet.
const ROOT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Total men on the board below which the time budget is halved.
const ENDGAME_MATERIAL_THRESHOLD: u32 = 20;
/// Floor for the per-request time budget.
const MIN_MOVETIME_MS: u64 = 10;

/// Per worker-index helper bundle. The session is parked here between
/// moves; the worker takes it for the duration of a move and returns it on
/// the way out. `stopped` is false exactly while a request is in flight.
pub(crate) struct HelperSlot {
    pub(crate) session: Option<HelperSession>,
    pub(crate) commands: CommandPipe,
    pub(crate) stopped: Arc<Mutex<bool>>,
    pub(crate) ready: bool,
}

/// Mutable coordination state, all behind one lock.
pub(crate) struct SharedStats {
    /// Current per-request time budget for bounded queries.
    pub(crate) movetime_ms: u64,
    /// Nodes the tree-extension subsystem spliced in this move.
    pub(crate) nodes_added: u64,
    /// Nodes the search reported visiting this move.
    pub(crate) nodes_observed: u64,
    pub(crate) game_nodes_added: u64,
    pub(crate) game_nodes_observed: u64,
    pub(crate) new_game: bool,
    pub(crate) active_workers: usize,
    /// Next worker index to reserve; two-phase init requires reading this
    /// before the slot vector is touched.
    pub(crate) thread_counter: usize,
    /// One-shot per move: the staleness purge ran.
    pub(crate) final_purge_done: bool,
    pub(crate) evals_this_move: u64,
    pub(crate) eval_time_this_move: Duration,
}

impl SharedStats {
    fn new(config: &AdvisorConfig) -> Self {
        Self {
            movetime_ms: config.base_movetime_ms,
            nodes_added: 0,
            nodes_observed: 0,
            game_nodes_added: 0,
            game_nodes_observed: 0,
            new_game: false,
            active_workers: 0,
            thread_counter: 0,
            final_purge_done: false,
            evals_this_move: 0,
            eval_time_this_move: Duration::ZERO,
        }
    }
}

pub(crate) struct CoordState {
    pub(crate) slots: Vec<HelperSlot>,
    pub(crate) stats: SharedStats,
    pub(crate) fatal: Option<AdvisorError>,
}

/// Everything the workers share, reference-counted into each thread.
pub(crate) struct PoolShared {
    pub(crate) config: AdvisorConfig,
    pub(crate) tree: Arc<SearchTree>,
    pub(crate) queue: WorkQueue,
    pub(crate) pv_out: PvQueue,
    pub(crate) ledger: ExtensionLedger,
    pub(crate) coord: Mutex<CoordState>,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl PoolShared {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Signal cancellation, wake queue waiters, and nudge every in-flight
    /// helper with a `stop` so a worker blocked on a silent stream gets its
    /// final answer and can drain.
    pub(crate) fn trip_cancellation(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.queue.notify_all();
        let coord = self.coord.lock().unwrap();
        for slot in &coord.slots {
            let mut stopped = slot.stopped.lock().unwrap();
            if !*stopped {
                let _ = slot.commands.send_line("stop");
                *stopped = true;
            }
        }
    }
}

/// Observable counters, for callers and tests.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub movetime_ms: u64,
    pub nodes_added: u64,
    pub nodes_observed: u64,
    pub game_nodes_added: u64,
    pub game_nodes_observed: u64,
    pub evals_this_move: u64,
    pub avg_request_ms: u64,
    pub active_workers: usize,
}

/// The advisor pool: spawns one worker thread per configured helper
/// instance, owns every helper process for the lifetime of the pool, and
/// runs the end-of-move bookkeeping.
///
/// Worker 0 continuously re-queries the tree root in unbounded mode; the
/// remaining workers consume the shared task queue with bounded-time
/// probes. Results land in the PV output queue for the tree-extension
/// subsystem to drain.
pub struct AdvisorPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AdvisorPool {
    pub fn new(config: AdvisorConfig, tree: Arc<SearchTree>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        Self {
            shared: Arc::new(PoolShared {
                queue: WorkQueue::new(Arc::clone(&cancelled)),
                pv_out: PvQueue::new(),
                ledger: ExtensionLedger::new(),
                coord: Mutex::new(CoordState {
                    slots: Vec::new(),
                    stats: SharedStats::new(&config),
                    fatal: None,
                }),
                cancelled,
                config,
                tree,
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start one worker thread per configured instance. No-op when no
    /// helper executable is configured.
    pub fn open_all(&self) {
        if !self.shared.config.enabled() {
            debug!("no helper engine configured; advisor subsystem stays off");
            return;
        }
        self.shared.cancelled.store(false, Ordering::Release);
        let mut threads = self.threads.lock().unwrap();
        for _ in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            threads.push(thread::spawn(move || worker_main(shared)));
        }
    }

    /// Request cooperative shutdown of every worker. Helpers are asked to
    /// stop gracefully; pipes are never force-closed.
    pub fn cancel(&self) {
        self.shared.trip_cancellation();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled()
    }

    /// Join every worker, fold the per-move statistics, adapt the time
    /// budget for simplified positions, and drop any PVs nobody consumed
    /// (they are stale by the next move). Returns the fatal error if a
    /// helper died during the move.
    pub fn wait_all(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        // The move is over and every worker is parked; re-arm the flag so
        // the next search's producers can enqueue before open_all runs.
        self.shared.cancelled.store(false, Ordering::Release);

        let fatal = {
            let mut coord = self.shared.coord.lock().unwrap();
            debug_assert_eq!(coord.stats.active_workers, 0);
            let root_material = self.shared.tree.root_board().combined().popcnt();
            let stats = &mut coord.stats;

            let observed_ratio = if stats.nodes_observed > 0 {
                stats.nodes_added as f32 / stats.nodes_observed as f32
            } else {
                0.0
            };
            let avg_request_ms = if stats.evals_this_move > 0 {
                stats.eval_time_this_move.as_millis() as u64 / stats.evals_this_move
            } else {
                0
            };

            // Simplified endgames need less helper depth per probe.
            if root_material < ENDGAME_MATERIAL_THRESHOLD {
                stats.movetime_ms = ((self.shared.config.base_movetime_ms as f32 * 0.5).round()
                    as u64)
                    .max(MIN_MOVETIME_MS);
            }

            if self.shared.config.verbosity >= 3 {
                info!(
                    queue = self.shared.queue.len(),
                    ratio = observed_ratio,
                    added = stats.nodes_added,
                    observed = stats.nodes_observed,
                    evals = stats.evals_this_move,
                    avg_request_ms,
                    next_movetime_ms = stats.movetime_ms,
                    "advisor summary for this move"
                );
            }

            stats.game_nodes_added += stats.nodes_added;
            stats.game_nodes_observed += stats.nodes_observed;
            stats.nodes_added = 0;
            stats.nodes_observed = 0;
            stats.evals_this_move = 0;
            stats.eval_time_this_move = Duration::ZERO;
            stats.final_purge_done = false;
            coord.fatal.take()
        };

        let stale = self.shared.pv_out.drain();
        if !stale.is_empty() {
            debug!(count = stale.len(), "discarded unconsumed candidate PVs at end of move");
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flag that a new game started; worker 0 resets stats and clears all
    /// queues on its next run.
    pub fn new_game(&self) {
        self.shared.coord.lock().unwrap().stats.new_game = true;
    }

    pub fn tree(&self) -> &Arc<SearchTree> {
        &self.shared.tree
    }

    /// Queue a node for helper analysis. Marks the node pending in the same
    /// critical section as the push.
    pub fn enqueue_node(&self, node: NodeId, source: SourceTag) {
        let view = self.shared.tree.read();
        self.shared.queue.enqueue(&view, node, source);
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Pop one decoded PV for splicing into the tree.
    pub fn try_pop_pv(&self) -> Option<PvEntry> {
        self.shared.pv_out.try_pop()
    }

    pub fn pending_pvs(&self) -> usize {
        self.shared.pv_out.len()
    }

    /// The tree-extension subsystem reports a node it spliced in on the
    /// helper's advice.
    pub fn note_extension(&self, node: NodeId) {
        let root = self.shared.tree.root();
        self.shared.ledger.record(node, root);
        self.shared.coord.lock().unwrap().stats.nodes_added += 1;
    }

    /// The search reports how many nodes it visited (for the acceptance
    /// ratio in the per-move summary).
    pub fn note_nodes_observed(&self, count: u64) {
        self.shared.coord.lock().unwrap().stats.nodes_observed += count;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let coord = self.shared.coord.lock().unwrap();
        let stats = &coord.stats;
        StatsSnapshot {
            movetime_ms: stats.movetime_ms,
            nodes_added: stats.nodes_added,
            nodes_observed: stats.nodes_observed,
            game_nodes_added: stats.game_nodes_added,
            game_nodes_observed: stats.game_nodes_observed,
            evals_this_move: stats.evals_this_move,
            avg_request_ms: if stats.evals_this_move > 0 {
                stats.eval_time_this_move.as_millis() as u64 / stats.evals_this_move
            } else {
                0
            },
            active_workers: stats.active_workers,
        }
    }
}

fn start_session(shared: &PoolShared, index: usize) -> Result<HelperSession> {
    let path = shared
        .config
        .helper_path
        .as_deref()
        .expect("open_all checked the helper path");
    let mut session = HelperSession::spawn(path, index)?;
    session.handshake(
        shared.config.options_for(index),
        shared.config.tablebase_path.as_deref(),
    )?;
    Ok(session)
}

fn worker_main(shared: Arc<PoolShared>) {
    // Two-phase init under the coordination lock: reserve our index, make
    // sure the helper instance for that index exists and is ready, then
    // publish by bumping the counters. The counter must not move before the
    // slot vector holds our entry.
    let (index, mut session, stopped) = {
        let mut coord = shared.coord.lock().unwrap();
        let index = coord.stats.thread_counter;

        if index >= coord.slots.len() || !coord.slots[index].ready {
            match start_session(&shared, index) {
                Ok(session) => {
                    coord.slots.push(HelperSlot {
                        commands: session.commands(),
                        stopped: Arc::new(Mutex::new(true)),
                        session: Some(session),
                        ready: true,
                    });
                    if index == 0 {
                        coord.stats.movetime_ms = shared.config.base_movetime_ms;
                        coord.stats.nodes_added = 0;
                        coord.stats.nodes_observed = 0;
                        coord.stats.new_game = false;
                    }
                }
                Err(e) => {
                    error!(worker = index, error = %e, "failed to start helper; shutting the pool down");
                    coord.fatal.get_or_insert(e);
                    drop(coord);
                    shared.trip_cancellation();
                    return;
                }
            }
        } else {
            // Helpers were already started (a resumed game). Worker 0 runs
            // new-game detection and the one-shot staleness purge before
            // steady state resumes.
            if index == 0 {
                if coord.stats.new_game {
                    info!("new game: resetting advisor stats and clearing queues");
                    coord.stats.movetime_ms = shared.config.base_movetime_ms;
                    coord.stats.nodes_added = 0;
                    coord.stats.nodes_observed = 0;
                    coord.stats.game_nodes_added = 0;
                    coord.stats.game_nodes_observed = 0;
                    coord.stats.evals_this_move = 0;
                    coord.stats.eval_time_this_move = Duration::ZERO;
                    shared.queue.clear();
                    shared.pv_out.clear();
                    shared.ledger.clear();
                    coord.stats.new_game = false;
                }
                if !coord.stats.final_purge_done {
                    let current_root = shared.tree.root();
                    let queue_purged = shared.queue.purge(current_root);
                    let pv_purged = shared.pv_out.purge(current_root);
                    let ledger_purged = shared.ledger.purge(current_root);
                    if queue_purged + pv_purged + ledger_purged > 0 {
                        debug!(
                            queue_purged,
                            pv_purged,
                            ledger_purged,
                            "purged entries outdated by the opponent's move"
                        );
                    }
                    coord.stats.final_purge_done = true;
                }
            }
            *coord.slots[index].stopped.lock().unwrap() = true;
        }

        let session = coord.slots[index]
            .session
            .take()
            .expect("helper session parked in its slot");
        let stopped = Arc::clone(&coord.slots[index].stopped);
        coord.stats.thread_counter += 1;
        coord.stats.active_workers += 1;
        (index, session, stopped)
    };

    let result = if index == 0 {
        root_loop(&shared, &mut session, &stopped)
    } else {
        consumer_loop(&shared, &mut session, &stopped, index)
    };
    let failed = result.is_err();

    {
        let mut coord = shared.coord.lock().unwrap();
        coord.slots[index].session = Some(session);
        coord.stats.active_workers -= 1;
        coord.stats.thread_counter -= 1;
        if let Err(e) = result {
            error!(worker = index, error = %e, "worker exited fatally");
            coord.fatal.get_or_insert(e);
        }
        debug!(worker = index, remaining = coord.stats.active_workers, "worker done");
    }
    if failed {
        shared.trip_cancellation();
    }
}

/// Worker 0: continuous unbounded analysis of the root, as soon as the root
/// has edges to make the result spliceable.
fn root_loop(
    shared: &Arc<PoolShared>,
    session: &mut HelperSession,
    stopped: &Arc<Mutex<bool>>,
) -> Result<()> {
    while !shared.cancelled() {
        let item = {
            let view = shared.tree.read();
            let root = view.root();
            if view.num_edges(root) > 0 {
                view.set_pending(root);
                Some(WorkItem {
                    node: root,
                    root,
                    source: SOURCE_ROOT,
                })
            } else {
                None
            }
        };
        match item {
            Some(item) => run_request(shared, session, stopped, 0, item)?,
            None => {
                trace!("root has no edges yet; retrying shortly");
                thread::sleep(ROOT_RETRY_INTERVAL);
            }
        }
    }
    Ok(())
}

/// Workers 1..N: block on the task queue and run one bounded request per
/// item until cancellation.
fn consumer_loop(
    shared: &Arc<PoolShared>,
    session: &mut HelperSession,
    stopped: &Arc<Mutex<bool>>,
    index: usize,
) -> Result<()> {
    while !shared.cancelled() {
        let Some(item) = shared.queue.dequeue() else {
            debug!(worker = index, "queue signaled shutdown");
            break;
        };
        run_request(shared, session, stopped, index, item)?;
    }
    Ok(())
}
