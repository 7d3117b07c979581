use std::str::FromStr;

use chess::{Board, ChessMove, Color};
use tracing::{trace, warn};

use crate::queue::{PvEntry, PvQueue, SourceTag};
use crate::tree::{NodeId, TreeMove};

/// Hard cap on decoded sequence length, independent of the depth the helper
/// claims; bounds the cost of splicing a runaway line into the tree.
pub const MAX_PV_MOVES: usize = 99;

/// One raw helper response line together with the context of the request
/// that produced it.
pub struct PvLine<'a> {
    /// The raw line as read from the helper.
    pub line: &'a str,
    /// Distance from the search root to the node the helper analyzed.
    pub depth_from_root: usize,
    /// Working board positioned at that node.
    pub board: Board,
    /// Moves from the root to that node, internal encoding. The decoded
    /// continuation is appended to this prefix, so the pushed sequence
    /// always starts at the search root.
    pub moves_from_root: &'a [TreeMove],
    pub source: SourceTag,
    /// Ancestry root captured when the node was queued.
    pub root: NodeId,
    /// Whether the second player is to move at the search root.
    pub black_at_root: bool,
    /// When set, lines that do not report a depth beyond the configured
    /// minimum are rejected (shallow lines pollute the tree).
    pub require_some_depth: bool,
}

/// Decode one `info ... pv ...` line into a sequence of internal moves
/// ordered from the search root: the request's root-to-node prefix with the
/// decoded continuation appended.
///
/// Returns `None` when the line carries nothing usable: a free-text
/// `string` payload, a line gated out by the depth requirement, or a line
/// whose first pv token already fails to parse.
pub fn decode(ctx: &PvLine<'_>, min_accept_depth: usize) -> Option<Vec<TreeMove>> {
    let mut tokens = ctx.line.split_whitespace();

    // True while the side about to move is the second player. Seeded from
    // the root's side to move and the parity of the originating depth.
    let mut flip = ctx.black_at_root ^ (ctx.depth_from_root % 2 == 1);
    debug_assert_eq!(flip, ctx.board.side_to_move() == Color::Black);

    let mut board = ctx.board;
    let mut depth_reached = 0usize;
    let mut moves: Vec<TreeMove> = ctx.moves_from_root.to_vec();
    let mut decoded = 0usize;

    while let Some(token) = tokens.next() {
        match token {
            "info" => continue,
            // Free-text payload, not analysis data.
            "string" => {
                trace!(source = ctx.source, "ignoring free-text helper line");
                return None;
            }
            "depth" => {
                if let Some(value) = tokens.next() {
                    depth_reached = value.parse().unwrap_or(0);
                }
            }
            "pv" if !ctx.require_some_depth || depth_reached > min_accept_depth => {
                for token in tokens.by_ref() {
                    if decoded >= depth_reached || decoded >= MAX_PV_MOVES {
                        break;
                    }
                    let mv = match ChessMove::from_str(token) {
                        Ok(mv) => mv,
                        Err(_) => {
                            warn!(token, "ignoring bad pv move");
                            break;
                        }
                    };
                    if !board.legal(mv) {
                        warn!(%mv, "pv move is not legal here; dropping the tail");
                        break;
                    }
                    moves.push(TreeMove::from_move(mv, flip));
                    decoded += 1;
                    board = board.make_move_new(mv);
                    flip = !flip;
                }
            }
            _ => {}
        }
    }

    if decoded == 0 {
        None
    } else {
        trace!(
            depth = ctx.depth_from_root,
            reached = depth_reached,
            prefix = ctx.moves_from_root.len(),
            decoded,
            "decoded pv line"
        );
        Some(moves)
    }
}

/// Decode a line and, when it yields a non-empty sequence, push the result
/// to the PV output queue. Returns whether anything was pushed.
pub fn decode_and_push(ctx: &PvLine<'_>, min_accept_depth: usize, out: &PvQueue) -> bool {
    match decode(ctx, min_accept_depth) {
        Some(moves) => {
            out.push(PvEntry {
                moves,
                source: ctx.source,
                root: ctx.root,
            });
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SearchTree;

    fn root_ctx<'a>(line: &'a str, tree: &SearchTree, require_some_depth: bool) -> PvLine<'a> {
        PvLine {
            line,
            depth_from_root: 0,
            board: tree.root_board(),
            moves_from_root: &[],
            source: 1,
            root: tree.root(),
            black_at_root: tree.black_to_move_at_root(),
            require_some_depth,
        }
    }

    #[test]
    fn test_round_trip_from_start_position() {
        let tree = SearchTree::new(Board::default());
        let line = "info depth 20 seldepth 24 score cp 31 pv e2e4 e7e5 g1f3";
        let moves = decode(&root_ctx(line, &tree, true), 14).unwrap();
        assert_eq!(moves.len(), 3);

        // Replaying the decoded sequence reproduces the states the decoder
        // traversed internally.
        let mut board = tree.root_board();
        let mut flip = tree.black_to_move_at_root();
        for (tm, expected) in moves.iter().zip(["e2e4", "e7e5", "g1f3"]) {
            let mv = tm.to_move(flip);
            assert_eq!(mv, ChessMove::from_str(expected).unwrap());
            assert!(board.legal(mv));
            board = board.make_move_new(mv);
            flip = !flip;
        }
    }

    #[test]
    fn test_depth_gate_rejects_shallow_lines() {
        let tree = SearchTree::new(Board::default());
        let line = "info depth 14 score cp 10 pv e2e4";
        assert!(decode(&root_ctx(line, &tree, true), 14).is_none());

        // The same line passes once the requirement is waived.
        assert!(decode(&root_ctx(line, &tree, false), 14).is_some());

        // And a deep line passes the gate.
        let deep = "info depth 15 score cp 10 pv e2e4";
        assert!(decode(&root_ctx(deep, &tree, true), 14).is_some());
    }

    #[test]
    fn test_string_lines_are_ignored() {
        let tree = SearchTree::new(Board::default());
        let line = "info string NNUE evaluation enabled";
        assert!(decode(&root_ctx(line, &tree, false), 14).is_none());
    }

    #[test]
    fn test_bad_token_keeps_decoded_prefix() {
        let tree = SearchTree::new(Board::default());
        let line = "info depth 20 pv e2e4 xyzzy d2d4";
        let moves = decode(&root_ctx(line, &tree, false), 14).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].to_move(false), ChessMove::from_str("e2e4").unwrap());
    }

    #[test]
    fn test_illegal_move_keeps_decoded_prefix() {
        let tree = SearchTree::new(Board::default());
        // The second e2e4 is well-formed but illegal once the first one has
        // been applied to the working board.
        let line = "info depth 20 pv e2e4 e2e4";
        let moves = decode(&root_ctx(line, &tree, false), 14).unwrap();
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn test_sequence_capped_at_reported_depth() {
        let tree = SearchTree::new(Board::default());
        let line = "info depth 2 pv e2e4 e7e5 g1f3";
        let moves = decode(&root_ctx(line, &tree, false), 14).unwrap();
        assert_eq!(moves.len(), 2);
    }

    #[test]
    fn test_no_depth_reported_yields_nothing() {
        let tree = SearchTree::new(Board::default());
        let line = "info score cp 10 pv e2e4";
        assert!(decode(&root_ctx(line, &tree, false), 14).is_none());
    }

    #[test]
    fn test_flip_seeding_from_black_root() {
        let board =
            Board::from_str("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1").unwrap();
        let tree = SearchTree::new(board);
        let line = "info depth 20 pv e7e5 g1f3";
        let moves = decode(&root_ctx(line, &tree, true), 14).unwrap();
        assert_eq!(moves.len(), 2);
        // Black's move was encoded under flip; converting back with the same
        // flip state restores it.
        assert_eq!(moves[0].to_move(true), ChessMove::from_str("e7e5").unwrap());
        assert_eq!(moves[1].to_move(false), ChessMove::from_str("g1f3").unwrap());
    }

    #[test]
    fn test_prefix_is_prepended_to_the_continuation() {
        // Node one ply below the root: prefix [e2e4], helper line continues
        // with black's reply. The pushed sequence starts at the root.
        let tree = SearchTree::new(Board::default());
        let board = tree
            .root_board()
            .make_move_new(ChessMove::from_str("e2e4").unwrap());
        let prefix = [TreeMove::from_move(ChessMove::from_str("e2e4").unwrap(), false)];
        let ctx = PvLine {
            line: "info depth 20 pv e7e5 g1f3",
            depth_from_root: 1,
            board,
            moves_from_root: &prefix,
            source: 1,
            root: tree.root(),
            black_at_root: false,
            require_some_depth: true,
        };
        let moves = decode(&ctx, 14).unwrap();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[0].to_move(false), ChessMove::from_str("e2e4").unwrap());
        assert_eq!(moves[1].to_move(true), ChessMove::from_str("e7e5").unwrap());
        assert_eq!(moves[2].to_move(false), ChessMove::from_str("g1f3").unwrap());
    }

    #[test]
    fn test_prefix_alone_is_not_a_result() {
        // A gated line must yield nothing even though the prefix is
        // non-empty.
        let tree = SearchTree::new(Board::default());
        let board = tree
            .root_board()
            .make_move_new(ChessMove::from_str("e2e4").unwrap());
        let prefix = [TreeMove::from_move(ChessMove::from_str("e2e4").unwrap(), false)];
        let ctx = PvLine {
            line: "info depth 5 pv e7e5",
            depth_from_root: 1,
            board,
            moves_from_root: &prefix,
            source: 1,
            root: tree.root(),
            black_at_root: false,
            require_some_depth: true,
        };
        assert!(decode(&ctx, 14).is_none());
    }

    #[test]
    fn test_decode_and_push_attribution() {
        let tree = SearchTree::new(Board::default());
        let out = PvQueue::new();
        let line = "info depth 20 pv e2e4 e7e5";
        let mut ctx = root_ctx(line, &tree, true);
        ctx.source = 2;
        assert!(decode_and_push(&ctx, 14, &out));
        let entry = out.try_pop().unwrap();
        assert_eq!(entry.source, 2);
        assert_eq!(entry.root, tree.root());
        assert_eq!(entry.moves.len(), 2);
    }
}
