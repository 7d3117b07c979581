use chess::{Board, ChessMove, MoveGen};
use chess_advisor::{AdvisorConfig, AdvisorPool, SearchTree, SOURCE_EXPANSION};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    println!("Chess Advisor - Helper Pool Demo");
    println!("================================");

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("Usage: {} <helper_executable> [FEN_position] [movetime_ms]", args[0]);
        println!("Example: {} stockfish \"startpos\" 200", args[0]);
        return;
    }

    let helper_path = args[1].clone();
    let board = match args.get(2).map(String::as_str) {
        None | Some("startpos") => Board::default(),
        Some(fen) => Board::from_str(fen).expect("Valid FEN"),
    };
    let movetime_ms: u64 = args
        .get(3)
        .and_then(|v| v.parse().ok())
        .unwrap_or(200);

    println!("Helper: {}", helper_path);
    println!("Side to move: {:?}", board.side_to_move());

    // Build a small tree: the root plus one ply of children, so worker 0
    // has edges to analyze and the probe workers have nodes to pull.
    let tree = Arc::new(SearchTree::new(board));
    let root = tree.root();
    let children: Vec<_> = MoveGen::new_legal(&board)
        .take(4)
        .map(|mv: ChessMove| tree.add_child(root, mv))
        .collect();

    let config = AdvisorConfig {
        helper_path: Some(helper_path),
        workers: 2,
        base_movetime_ms: movetime_ms,
        ..AdvisorConfig::default()
    };

    let pool = AdvisorPool::new(config, Arc::clone(&tree));
    pool.open_all();
    for child in &children {
        pool.enqueue_node(*child, SOURCE_EXPANSION);
    }

    // Let the helpers think for a bit.
    std::thread::sleep(Duration::from_millis(movetime_ms * 4 + 500));

    // Drain the output queue the way the tree-extension subsystem would;
    // anything still queued at end of move is discarded as stale.
    let stats = pool.stats();
    println!("\nEvaluations this move: {}", stats.evals_this_move);

    let mut count = 0;
    while let Some(entry) = pool.try_pop_pv() {
        count += 1;
        let line: Vec<String> = entry.moves.iter().map(|tm| tm.to_string()).collect();
        println!("PV {} (source {}): {}", count, entry.source, line.join(" "));
    }
    if count == 0 {
        println!("The helpers produced no PVs (check the helper executable).");
    }

    pool.cancel();
    if let Err(e) = pool.wait_all() {
        eprintln!("Advisor pool failed: {}", e);
        std::process::exit(1);
    }
}
