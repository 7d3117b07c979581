//! # Chess Advisor
//!
//! Helper-engine coordination for Monte-Carlo tree search: a pool of
//! externally spawned UCI "helper" processes that analyze positions from a
//! live search tree and feed principal variations back to it.
//!
//! The pool runs one worker thread per helper instance. Worker 0
//! continuously re-queries the tree root in unbounded (`go infinite`) mode;
//! the remaining workers block on a shared task queue and run bounded-time
//! (`go movetime`) probes against nodes the search flags as interesting.
//! Streamed `info` lines are decoded into move sequences and pushed to an
//! output queue for the tree-extension subsystem to splice in. The whole
//! pipeline is cooperatively cancellable: helpers are always stopped
//! gracefully and their streams drained so they stay framed for the next
//! request.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chess::Board;
//! use chess_advisor::{AdvisorConfig, AdvisorPool, SearchTree, SOURCE_EXPANSION};
//!
//! let tree = Arc::new(SearchTree::new(Board::default()));
//! let config = AdvisorConfig {
//!     helper_path: Some("stockfish".to_string()),
//!     workers: 2,
//!     ..AdvisorConfig::default()
//! };
//!
//! let pool = AdvisorPool::new(config, Arc::clone(&tree));
//! pool.open_all();
//!
//! // The search enqueues nodes as they become interesting...
//! pool.enqueue_node(tree.root(), SOURCE_EXPANSION);
//!
//! // ...and the tree-extension subsystem drains decoded PVs.
//! while let Some(entry) = pool.try_pop_pv() {
//!     println!("helper suggested a {}-move line", entry.moves.len());
//! }
//!
//! pool.cancel();
//! pool.wait_all().expect("no helper died");
//! ```

// Core modules
pub mod errors;

// Re-export commonly used types
pub use errors::{AdvisorError, Result};

pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod queue;
pub mod session;
pub mod tree;

mod worker;

pub use config::AdvisorConfig;
pub use coordinator::{AdvisorPool, StatsSnapshot};
pub use queue::{
    ExtensionLedger, PvEntry, PvQueue, SourceTag, WorkItem, WorkQueue, SOURCE_BACKUP,
    SOURCE_EXPANSION, SOURCE_ROOT,
};
pub use session::{CommandPipe, HelperSession};
pub use tree::{NodeId, SearchTree, TreeMove, TreeView, MARK_NONE, MARK_PENDING};
