use std::sync::{Arc, Mutex};
use std::time::Instant;

use chess::Board;
use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::coordinator::PoolShared;
use crate::decoder::{decode_and_push, PvLine};
use crate::errors::{AdvisorError, Result};
use crate::queue::WorkItem;
use crate::session::HelperSession;
use crate::tree::TreeMove;

/// Drive one Helper Session through a single analysis request:
/// `Idle -> PositionSent -> Streaming -> (Stopping) -> Done`.
///
/// Worker 0 requests unbounded analysis; every other worker requests a
/// bounded-time probe using the shared time budget. The request borrows the
/// session; it never closes or replaces its streams, and it never overlaps
/// another request on the same session.
pub(crate) fn run_request(
    shared: &PoolShared,
    session: &mut HelperSession,
    stopped: &Arc<Mutex<bool>>,
    index: usize,
    item: WorkItem,
) -> Result<()> {
    if shared.cancelled() {
        debug!(worker = index, "cancelled before doing anything");
        return Ok(());
    }

    let depth = {
        let view = shared.tree.read();
        view.depth(item.node)
    };

    // Deep nodes are worth less helper time. When other work is waiting,
    // accept a node beyond the depth limit with probability 1/depth and
    // defer it to the queue tail otherwise; it stays marked pending.
    if depth > shared.config.max_defer_depth && !shared.queue.is_empty() {
        let sample: f32 = rand::thread_rng().gen();
        if 1.0 / depth as f32 > sample {
            trace!(worker = index, depth, "accepted a node beyond the depth limit");
        } else {
            shared.queue.requeue(item);
            return Ok(());
        }
    }

    if shared.cancelled() {
        debug!(worker = index, "cancelled before walking the ancestry");
        return Ok(());
    }

    // Build the position: walk node -> root collecting each edge's move,
    // reverse to root -> node order, replay on a working board.
    let (board, moves_from_root, black_at_root) = {
        let view = shared.tree.read();
        let black_at_root = view.black_to_move_at_root();
        // True when the mover on the edge currently being read is the
        // second player; the edge into a node at depth d was made at d-1.
        let mut flip = black_at_root ^ (depth % 2 == 0);
        let mut replay = Vec::with_capacity(depth);
        let mut moves_from_root: Vec<TreeMove> = Vec::with_capacity(depth);
        let mut cursor = item.node;
        while cursor != view.root() {
            let edge = view.edge(cursor).ok_or_else(|| {
                AdvisorError::InvalidPosition("queued node is detached from the tree".to_string())
            })?;
            replay.push(edge.to_move(flip));
            moves_from_root.push(edge);
            flip = !flip;
            cursor = view.parent(cursor).ok_or_else(|| {
                AdvisorError::InvalidPosition("queued node has no path to the root".to_string())
            })?;
        }
        replay.reverse();
        moves_from_root.reverse();

        let mut board: Board = *view.root_board();
        for mv in &replay {
            if !board.legal(*mv) {
                return Err(AdvisorError::InvalidPosition(format!(
                    "tree edge {} is not legal during replay",
                    mv
                )));
            }
            board = board.make_move_new(*mv);
        }
        (board, moves_from_root, black_at_root)
    };

    if shared.cancelled() {
        debug!(worker = index, "cancelled before sending the position");
        return Ok(());
    }

    let started = Instant::now();
    session.send_line(&format!("position fen {}", board))?;
    if index == 0 {
        debug!("starting unbounded root analysis on worker 0");
        session.send_line("go infinite")?;
    } else {
        let movetime = shared.coord.lock().unwrap().stats.movetime_ms;
        session.send_line(&format!("go movetime {}", movetime))?;
    }
    {
        let mut flag = stopped.lock().unwrap();
        if *flag {
            *flag = false;
        }
    }

    // Streaming. `prev_line` trails the read so the final `bestmove` leaves
    // the last info line in hand as the final candidate.
    let mut prev_line = String::new();
    let mut stopping = false;
    let mut second_stopping = false;
    let mut saw_eof = false;
    let mut last_pushed: Option<String> = None;

    loop {
        let line = match session.read_line()? {
            Some(line) => line,
            None => {
                saw_eof = true;
                break;
            }
        };
        if shared.config.verbosity >= 9 {
            trace!(worker = index, line = %line, "helper");
        }

        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or("");
        if first == "bestmove" {
            if tokens.next() == Some("info") {
                // A "bestmove info" line means the input stream is
                // corrupted. Issue stop, stay in the loop and wait for a
                // clean final answer.
                warn!(worker = index, "corrupted helper output 'bestmove info'; re-issuing stop");
                session.send_line("stop")?;
            } else {
                break;
            }
        }
        prev_line = line.clone();

        if !stopping {
            stopping = shared.cancelled();
            if stopping {
                // Send stop at most once, then keep reading until the
                // helper answers; closing or abandoning the stream here
                // would desynchronize the next request.
                let mut flag = stopped.lock().unwrap();
                if !*flag {
                    debug!(worker = index, "search stopped; halting the helper");
                    session.send_line("stop")?;
                    *flag = true;
                }
            } else if first == "info" {
                let ctx = PvLine {
                    line: &line,
                    depth_from_root: depth,
                    board,
                    moves_from_root: &moves_from_root,
                    source: item.source,
                    root: item.root,
                    black_at_root,
                    require_some_depth: true,
                };
                if decode_and_push(&ctx, shared.config.min_accept_depth, &shared.pv_out) {
                    last_pushed = Some(line);
                }
            }
        } else if !second_stopping {
            // Stop was already sent but the helper kept talking without a
            // bestmove. Send one more stop and note the anomaly.
            warn!(worker = index, "helper ignored stop; sending a second stop");
            session.send_line("stop")?;
            second_stopping = true;
        }
    }

    if saw_eof || !session.is_running() {
        error!(worker = index, "helper engine died");
        return Err(AdvisorError::HelperDied { index });
    }

    if stopping || shared.cancelled() {
        // Results of a stopped request are discarded, not because they are
        // unreliable but because shutdown latency matters more.
        debug!(worker = index, "discarding the result of a cancelled request");
        return Ok(());
    }

    {
        let mut flag = stopped.lock().unwrap();
        *flag = true;
    }

    if prev_line.is_empty() {
        debug!(worker = index, "empty answer from helper; nothing to queue");
        return Ok(());
    }

    let elapsed = started.elapsed();
    {
        let mut coord = shared.coord.lock().unwrap();
        coord.stats.evals_this_move += 1;
        coord.stats.eval_time_this_move += elapsed;
    }

    // Final candidate, depth requirement waived. Skipped when the very same
    // line already went out as an intermediate candidate.
    if last_pushed.as_deref() != Some(prev_line.as_str()) {
        let ctx = PvLine {
            line: &prev_line,
            depth_from_root: depth,
            board,
            moves_from_root: &moves_from_root,
            source: item.source,
            root: item.root,
            black_at_root,
            require_some_depth: false,
        };
        decode_and_push(&ctx, shared.config.min_accept_depth, &shared.pv_out);
    }
    Ok(())
}
