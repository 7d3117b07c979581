use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Configuration for the advisor subsystem.
///
/// An absent (or empty) `helper_path` disables the whole subsystem: no worker
/// threads are started and no helper processes are spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Path to the helper engine executable. `None` disables the subsystem.
    pub helper_path: Option<String>,
    /// `key=value;key=value` option string sent to worker 0's helper.
    /// The root helper analyzes in unbounded mode and gets its own tuning.
    pub root_options: String,
    /// Option string sent to every other worker's helper.
    pub worker_options: String,
    /// Number of worker threads (and helper processes).
    pub workers: usize,
    /// Base per-request time budget in milliseconds for bounded queries.
    pub base_movetime_ms: u64,
    /// Nodes deeper than this are accepted with probability 1/depth.
    pub max_defer_depth: usize,
    /// Intermediate PV lines must report a search depth strictly greater
    /// than this to be accepted into the output queue.
    pub min_accept_depth: usize,
    /// Endgame tablebase directory forwarded to helpers that advertise
    /// a SyzygyPath option during the handshake.
    pub tablebase_path: Option<String>,
    /// Diagnostic verbosity: 3 enables per-move summaries, 5 per-request
    /// tracing, 9 echoes every helper line.
    pub verbosity: u8,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            root_options: "Threads=1;Hash=256".to_string(),
            worker_options: "Threads=1;Hash=64".to_string(),
            workers: num_cpus::get().clamp(1, 4),
            base_movetime_ms: 100,
            max_defer_depth: 26,
            min_accept_depth: 14,
            tablebase_path: None,
            verbosity: 3,
        }
    }
}

impl AdvisorConfig {
    /// True when a helper executable is configured.
    pub fn enabled(&self) -> bool {
        matches!(&self.helper_path, Some(path) if !path.is_empty())
    }

    /// Option string for a given worker index. Worker 0 (continuous root
    /// analysis) uses a different tuning than the in-tree probes.
    pub fn options_for(&self, index: usize) -> &str {
        if index == 0 {
            &self.root_options
        } else {
            &self.worker_options
        }
    }

    /// Load a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the configuration to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
