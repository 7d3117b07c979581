use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use chess::{Board, ChessMove, Color, File, Piece, Rank, Square};

use crate::errors::{AdvisorError, Result};

/// Advisor mark: the node has never been touched by the advisor.
pub const MARK_NONE: u16 = 0xFFFF;
/// Advisor mark: the node is queued for helper analysis. Written the instant
/// the node is enqueued; prevents duplicate enqueue.
pub const MARK_PENDING: u16 = 0xFFFE;

const PROMO_PIECES: [Piece; 4] = [Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen];

fn square_index(sq: Square) -> u16 {
    (sq.get_rank().to_index() * 8 + sq.get_file().to_index()) as u16
}

fn square_from_index(index: u16) -> Square {
    Square::make_square(
        Rank::from_index((index as usize) >> 3),
        File::from_index((index as usize) & 7),
    )
}

/// Mirror a square across the horizontal center line (a2 <-> a7).
fn mirror_square(sq: Square) -> Square {
    Square::make_square(Rank::from_index(7 - sq.get_rank().to_index()), sq.get_file())
}

/// A move in the tree's internal encoding: a packed u16 whose squares are
/// stored relative to the side making the move. Moves by the second player
/// are rank-mirrored on the way in, so the stored value always reads as if
/// the mover were the first player. Converting back to an absolute board
/// move requires the same flip the conversion in was done under.
///
/// Layout: bits 0-5 origin square, 6-11 destination square, 12-14 promotion
/// (0 = none, 1..=4 = knight/bishop/rook/queen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeMove(u16);

impl TreeMove {
    /// Encode an absolute board move. `flip` is true when the mover is the
    /// second player.
    pub fn from_move(mv: ChessMove, flip: bool) -> Self {
        let (from, to) = if flip {
            (mirror_square(mv.get_source()), mirror_square(mv.get_dest()))
        } else {
            (mv.get_source(), mv.get_dest())
        };
        let promo = match mv.get_promotion() {
            None => 0u16,
            Some(piece) => {
                PROMO_PIECES
                    .iter()
                    .position(|p| *p == piece)
                    .map(|i| i as u16 + 1)
                    .unwrap_or(0)
            }
        };
        TreeMove(square_index(from) | (square_index(to) << 6) | (promo << 12))
    }

    /// Decode back to an absolute board move under the same flip state the
    /// move was encoded with.
    pub fn to_move(self, flip: bool) -> ChessMove {
        let mut from = square_from_index(self.0 & 0x3F);
        let mut to = square_from_index((self.0 >> 6) & 0x3F);
        if flip {
            from = mirror_square(from);
            to = mirror_square(to);
        }
        let promo = match (self.0 >> 12) & 0x7 {
            0 => None,
            n => PROMO_PIECES.get(n as usize - 1).copied(),
        };
        ChessMove::new(from, to, promo)
    }

    /// Raw packed representation. Always below the mark sentinels.
    pub fn as_packed(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TreeMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Side-relative coordinates, as stored.
        write!(f, "{}", self.to_move(false))
    }
}

/// Stable identifier of a node in the search tree. Nodes are never removed,
/// so an id stays valid for the lifetime of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct NodeData {
    parent: Option<NodeId>,
    /// Move leading from the parent into this node, side-relative encoding.
    edge: Option<TreeMove>,
    /// Number of expanded child edges.
    num_edges: u32,
    /// Advisor mark; `MARK_NONE`, `MARK_PENDING`, or a packed suggested move.
    mark: AtomicU16,
}

impl NodeData {
    fn new(parent: Option<NodeId>, edge: Option<TreeMove>) -> Self {
        Self {
            parent,
            edge,
            num_edges: 0,
            mark: AtomicU16::new(MARK_NONE),
        }
    }
}

struct TreeInner {
    nodes: Vec<NodeData>,
    root: NodeId,
    root_board: Board,
}

/// The externally-owned search tree, reduced to the narrow interface the
/// advisor subsystem consumes: root, parent links, edge counts, per-edge
/// moves with a side-flip parameter, and the atomic pending sentinel.
/// Search threads mutate the tree under the write lock; the advisor only
/// ever reads (the sentinel is an atomic field, so marking a node pending
/// needs no write lock).
pub struct SearchTree {
    inner: RwLock<TreeInner>,
}

impl SearchTree {
    /// Create a tree holding a single root node at the given position.
    pub fn new(root_board: Board) -> Self {
        Self {
            inner: RwLock::new(TreeInner {
                nodes: vec![NodeData::new(None, None)],
                root: NodeId(0),
                root_board,
            }),
        }
    }

    /// Acquire the shared read lock for ancestry walks and edge reads.
    pub fn read(&self) -> TreeView<'_> {
        TreeView(self.inner.read().unwrap())
    }

    pub fn root(&self) -> NodeId {
        self.read().root()
    }

    pub fn root_board(&self) -> Board {
        self.read().root_board().clone()
    }

    pub fn black_to_move_at_root(&self) -> bool {
        self.read().black_to_move_at_root()
    }

    /// Expand one child edge of `parent` with the given absolute move.
    /// The caller (the search) is responsible for legality.
    pub fn add_child(&self, parent: NodeId, mv: ChessMove) -> NodeId {
        let mut inner = self.inner.write().unwrap();
        let black_at_root = inner.root_board.side_to_move() == Color::Black;
        let parent_depth = depth_of(&inner, parent);
        // Mover on this edge is the side to move at the parent.
        let flip = black_at_root ^ (parent_depth % 2 == 1);
        let id = NodeId(inner.nodes.len() as u32);
        inner
            .nodes
            .push(NodeData::new(Some(parent), Some(TreeMove::from_move(mv, flip))));
        inner.nodes[parent.index()].num_edges += 1;
        id
    }

    /// Advance the root to one of its children after a move was played on
    /// the board. Nodes outside the new root's subtree become stale and are
    /// swept from the advisor queues by the next purge pass.
    pub fn advance_root(&self, child: NodeId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.nodes[child.index()].parent != Some(inner.root) {
            return Err(AdvisorError::InvalidPosition(
                "new root must be a child of the current root".to_string(),
            ));
        }
        let edge = inner.nodes[child.index()]
            .edge
            .ok_or_else(|| AdvisorError::InvalidPosition("child node has no edge move".to_string()))?;
        let flip = inner.root_board.side_to_move() == Color::Black;
        let mv = edge.to_move(flip);
        if !inner.root_board.legal(mv) {
            return Err(AdvisorError::InvalidPosition(format!(
                "edge move {} is not legal in the root position",
                mv
            )));
        }
        inner.root_board = inner.root_board.make_move_new(mv);
        inner.root = child;
        Ok(())
    }

    /// Reset the tree to a single root at a fresh position (new game).
    pub fn new_game(&self, root_board: Board) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes = vec![NodeData::new(None, None)];
        inner.root = NodeId(0);
        inner.root_board = root_board;
    }

    /// Write the pending sentinel on a node.
    pub fn set_pending(&self, node: NodeId) {
        self.read().set_pending(node);
    }

    /// Current advisor mark of a node.
    pub fn mark(&self, node: NodeId) -> u16 {
        self.read().mark(node)
    }

    /// Record the helper's suggested first move on a node, replacing the
    /// pending sentinel.
    pub fn record_advisor_move(&self, node: NodeId, mv: TreeMove) {
        let inner = self.inner.read().unwrap();
        inner.nodes[node.index()]
            .mark
            .store(mv.as_packed(), Ordering::Release);
    }
}

fn depth_of(inner: &TreeInner, node: NodeId) -> usize {
    let mut depth = 0;
    let mut cur = node;
    while cur != inner.root {
        match inner.nodes[cur.index()].parent {
            Some(parent) => {
                depth += 1;
                cur = parent;
            }
            None => break,
        }
    }
    depth
}

/// Shared read view of the tree. Holding one pins the tree against
/// structural mutation; the advisor takes it for ancestry walks.
pub struct TreeView<'a>(RwLockReadGuard<'a, TreeInner>);

impl TreeView<'_> {
    pub fn root(&self) -> NodeId {
        self.0.root
    }

    pub fn root_board(&self) -> &Board {
        &self.0.root_board
    }

    pub fn black_to_move_at_root(&self) -> bool {
        self.0.root_board.side_to_move() == Color::Black
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.0.nodes[node.index()].parent
    }

    pub fn num_edges(&self, node: NodeId) -> usize {
        self.0.nodes[node.index()].num_edges as usize
    }

    /// Move leading into `node`, in the internal side-relative encoding.
    pub fn edge(&self, node: NodeId) -> Option<TreeMove> {
        self.0.nodes[node.index()].edge
    }

    /// Move leading into `node` as an absolute board move. `flip` is true
    /// when the mover on that edge is the second player.
    pub fn edge_move(&self, node: NodeId, flip: bool) -> Option<ChessMove> {
        self.0.nodes[node.index()].edge.map(|e| e.to_move(flip))
    }

    /// Distance from `node` up to the current root.
    pub fn depth(&self, node: NodeId) -> usize {
        depth_of(&self.0, node)
    }

    pub fn set_pending(&self, node: NodeId) {
        self.0.nodes[node.index()]
            .mark
            .store(MARK_PENDING, Ordering::Release);
    }

    pub fn mark(&self, node: NodeId) -> u16 {
        self.0.nodes[node.index()].mark.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tree_move_round_trip_unflipped() {
        let mv = ChessMove::from_str("e2e4").unwrap();
        let tm = TreeMove::from_move(mv, false);
        assert_eq!(tm.to_move(false), mv);
    }

    #[test]
    fn test_tree_move_round_trip_flipped() {
        let mv = ChessMove::from_str("e7e5").unwrap();
        let tm = TreeMove::from_move(mv, true);
        // Stored side-relative: e7e5 mirrored reads as e2e4.
        assert_eq!(tm.to_move(false), ChessMove::from_str("e2e4").unwrap());
        assert_eq!(tm.to_move(true), mv);
    }

    #[test]
    fn test_tree_move_promotion_survives_mirror() {
        let mv = ChessMove::from_str("a7a8q").unwrap();
        let tm = TreeMove::from_move(mv, false);
        assert_eq!(tm.to_move(false), mv);

        let black_promo = ChessMove::from_str("h2h1n").unwrap();
        let tm = TreeMove::from_move(black_promo, true);
        assert_eq!(tm.to_move(true), black_promo);
    }

    #[test]
    fn test_packed_values_stay_below_sentinels() {
        // Highest possible encoding: h8 -> h8 with a queen promotion.
        let mv = ChessMove::new(Square::H8, Square::H8, Some(Piece::Queen));
        let tm = TreeMove::from_move(mv, false);
        assert!(tm.as_packed() < MARK_PENDING);
    }

    #[test]
    fn test_add_child_and_walk() {
        let tree = SearchTree::new(Board::default());
        let root = tree.root();
        let e4 = tree.add_child(root, ChessMove::from_str("e2e4").unwrap());
        let e5 = tree.add_child(e4, ChessMove::from_str("e7e5").unwrap());

        let view = tree.read();
        assert_eq!(view.num_edges(root), 1);
        assert_eq!(view.num_edges(e4), 1);
        assert_eq!(view.depth(e5), 2);
        assert_eq!(view.parent(e5), Some(e4));
        // White made the first edge move, black the second.
        assert_eq!(
            view.edge_move(e4, false),
            Some(ChessMove::from_str("e2e4").unwrap())
        );
        assert_eq!(
            view.edge_move(e5, true),
            Some(ChessMove::from_str("e7e5").unwrap())
        );
    }

    #[test]
    fn test_pending_mark() {
        let tree = SearchTree::new(Board::default());
        let root = tree.root();
        assert_eq!(tree.mark(root), MARK_NONE);
        tree.set_pending(root);
        assert_eq!(tree.mark(root), MARK_PENDING);

        let mv = TreeMove::from_move(ChessMove::from_str("e2e4").unwrap(), false);
        tree.record_advisor_move(root, mv);
        assert_eq!(tree.mark(root), mv.as_packed());
    }

    #[test]
    fn test_advance_root_updates_board_and_depths() {
        let tree = SearchTree::new(Board::default());
        let root = tree.root();
        let e4 = tree.add_child(root, ChessMove::from_str("e2e4").unwrap());
        let e5 = tree.add_child(e4, ChessMove::from_str("e7e5").unwrap());

        tree.advance_root(e4).unwrap();
        assert_eq!(tree.root(), e4);
        assert!(tree.black_to_move_at_root());
        assert_eq!(tree.read().depth(e5), 1);
    }

    #[test]
    fn test_advance_root_rejects_non_child() {
        let tree = SearchTree::new(Board::default());
        let root = tree.root();
        let e4 = tree.add_child(root, ChessMove::from_str("e2e4").unwrap());
        let e5 = tree.add_child(e4, ChessMove::from_str("e7e5").unwrap());
        assert!(tree.advance_root(e5).is_err());
    }

    #[test]
    fn test_new_game_resets() {
        let tree = SearchTree::new(Board::default());
        let root = tree.root();
        tree.add_child(root, ChessMove::from_str("e2e4").unwrap());
        tree.new_game(Board::default());
        assert_eq!(tree.read().num_edges(tree.root()), 0);
    }
}
