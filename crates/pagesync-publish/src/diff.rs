//! Planning the minimal edit from the remote tree to the local one.
//!
//! Per sibling level, in this order:
//!
//! 1. Blocks whose subtree fingerprint matches a remote block are kept as
//!    they are. Duplicates pair up in order.
//! 2. Remaining blocks pair with remaining remote blocks in the same gap
//!    between matched blocks. A pair of the same remote type is kept and
//!    updated in place if its own content differs, then diffed one level
//!    down. Any other pair is replaced.
//! 3. Kept blocks outside the longest run already in remote order are moved.
//!    The remote has no move call, so a move deletes the block and creates
//!    the local subtree again at its new position.
//! 4. Remote leftovers are deleted and local leftovers created, each create
//!    anchored after the nearest preceding sibling already in place.
//!
//! The remote only appends, either at the end or after a given block. When
//! the first local block is not one that stays, the first block that would
//! stay is moved instead, and the blocks before it are placed after it while
//! it still exists.

use crate::remote::RemoteNode;
use pagesync_common::{BlockId, Fingerprint};
use pagesync_renderer::FingerprintedBlock;
use pagesync_renderer::wire::block_type;
use std::collections::{BTreeMap, VecDeque};

/// Structural path of a block in the local document.
pub type BlockPath = Vec<usize>;

/// Where a created block goes among its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    End,
    AfterRemote(BlockId),
    /// After a sibling created (or moved) earlier in the same apply.
    AfterNew(BlockPath),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub id: BlockId,
    pub path: BlockPath,
    pub anchor: Anchor,
    /// The moved block and its remote descendants.
    pub subtree: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    /// Create the local subtree at `path` under `parent`.
    Create {
        parent: BlockId,
        path: BlockPath,
        anchor: Anchor,
    },
    /// Rewrite a block's own content from the local block at `path`.
    Update { id: BlockId, path: BlockPath },
    Delete {
        id: BlockId,
        depth: usize,
        subtree: Vec<BlockId>,
    },
    /// Bring `parent`'s kept children into `ordered` by applying `moves`.
    Reorder {
        parent: BlockId,
        ordered: Vec<BlockId>,
        moves: Vec<Move>,
    },
}

/// A local block that already exists remotely as `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptBlock {
    pub path: BlockPath,
    pub id: BlockId,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub ops: Vec<SyncOp>,
    pub kept: Vec<KeptBlock>,
    /// Blocks matched by fingerprint, descendants included.
    pub unchanged: usize,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn creates(&self) -> impl Iterator<Item = (&BlockId, &BlockPath, &Anchor)> {
        self.ops.iter().filter_map(|op| match op {
            SyncOp::Create {
                parent,
                path,
                anchor,
            } => Some((parent, path, anchor)),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = (&BlockId, &BlockPath)> {
        self.ops.iter().filter_map(|op| match op {
            SyncOp::Update { id, path } => Some((id, path)),
            _ => None,
        })
    }

    /// Deletes, deepest first.
    pub fn deletes(&self) -> Vec<(&BlockId, usize)> {
        let mut deletes: Vec<_> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                SyncOp::Delete { id, depth, .. } => Some((id, *depth)),
                _ => None,
            })
            .collect();
        deletes.sort_by(|a, b| b.1.cmp(&a.1));
        deletes
    }

    pub fn reorders(&self) -> impl Iterator<Item = (&BlockId, &[Move])> {
        self.ops.iter().filter_map(|op| match op {
            SyncOp::Reorder { parent, moves, .. } => Some((parent, moves.as_slice())),
            _ => None,
        })
    }

    /// Every remote block the plan destroys, descendants included.
    pub fn destroyed(&self) -> Vec<BlockId> {
        let mut ids = Vec::new();
        for op in &self.ops {
            match op {
                SyncOp::Delete { subtree, .. } => ids.extend(subtree.iter().cloned()),
                SyncOp::Reorder { moves, .. } => {
                    for m in moves {
                        ids.extend(m.subtree.iter().cloned());
                    }
                }
                SyncOp::Create { .. } | SyncOp::Update { .. } => {}
            }
        }
        ids
    }

    /// Local paths whose content is sent: created and moved subtree roots
    /// plus updated blocks. The flag says whether the whole subtree goes.
    pub fn sent_paths(&self) -> Vec<(&BlockPath, bool)> {
        let mut paths = Vec::new();
        for op in &self.ops {
            match op {
                SyncOp::Create { path, .. } => paths.push((path, true)),
                SyncOp::Update { path, .. } => paths.push((path, false)),
                SyncOp::Reorder { moves, .. } => {
                    paths.extend(moves.iter().map(|m| (&m.path, true)));
                }
                SyncOp::Delete { .. } => {}
            }
        }
        paths
    }

    pub fn summary(&self) -> String {
        let moves: usize = self.reorders().map(|(_, m)| m.len()).sum();
        format!(
            "{} create, {} update, {} delete, {} move",
            self.creates().count(),
            self.updates().count(),
            self.deletes().len(),
            moves
        )
    }
}

/// Plan the edit turning `remote` (the children of `page`) into `local`.
pub fn plan(local: &[FingerprintedBlock<'_>], remote: &[RemoteNode], page: &BlockId) -> SyncPlan {
    let mut plan = SyncPlan::default();
    diff_level(local, remote, page, &[], 0, &mut plan);
    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Identical subtree.
    Same(usize),
    /// Same slot, content to reconcile.
    Positional(usize),
}

impl Link {
    fn remote(self) -> usize {
        match self {
            Link::Same(j) | Link::Positional(j) => j,
        }
    }
}

fn diff_level(
    local: &[FingerprintedBlock<'_>],
    remote: &[RemoteNode],
    parent: &BlockId,
    prefix: &[usize],
    depth: usize,
    plan: &mut SyncPlan,
) {
    let mut links: Vec<Option<Link>> = vec![None; local.len()];
    let mut taken: Vec<Option<usize>> = vec![None; remote.len()];

    let mut by_fingerprint: BTreeMap<Fingerprint, VecDeque<usize>> = BTreeMap::new();
    for (j, node) in remote.iter().enumerate() {
        by_fingerprint.entry(node.fingerprint).or_default().push_back(j);
    }
    for (i, block) in local.iter().enumerate() {
        if let Some(j) = by_fingerprint
            .get_mut(&block.fingerprint)
            .and_then(VecDeque::pop_front)
        {
            links[i] = Some(Link::Same(j));
            taken[j] = Some(i);
        }
    }

    // unmatched blocks, bucketed by the matched local block they follow
    let mut local_gaps: BTreeMap<Option<usize>, Vec<usize>> = BTreeMap::new();
    let mut gap = None;
    for (i, link) in links.iter().enumerate() {
        match link {
            Some(_) => gap = Some(i),
            None => local_gaps.entry(gap).or_default().push(i),
        }
    }
    let mut remote_gaps: BTreeMap<Option<usize>, Vec<usize>> = BTreeMap::new();
    let mut gap = None;
    for (j, owner) in taken.iter().enumerate() {
        match owner {
            Some(i) => gap = Some(*i),
            None => remote_gaps.entry(gap).or_default().push(j),
        }
    }
    for (gap, locals) in &local_gaps {
        let Some(remotes) = remote_gaps.get(gap) else {
            continue;
        };
        for (&i, &j) in locals.iter().zip(remotes) {
            if reconcilable(&local[i], &remote[j]) {
                links[i] = Some(Link::Positional(j));
                taken[j] = Some(i);
            }
        }
    }

    // kept blocks already in remote order stay put
    let kept: Vec<usize> = (0..local.len()).filter(|&i| links[i].is_some()).collect();
    let order: Vec<usize> = kept
        .iter()
        .filter_map(|&i| links[i].map(Link::remote))
        .collect();
    let mut in_place = vec![false; local.len()];
    let first_kept = links.first().is_some_and(Option::is_some);
    for k in staying(&order, first_kept) {
        in_place[kept[k]] = true;
    }

    // nothing can be inserted before the remote's first block, so when the
    // first local block is not in place the first block that is has to move
    // behind the leading ones, which go after it while it still stands
    let mut lead = None;
    if let Some(f) = in_place.iter().position(|&p| p).filter(|&f| f > 0) {
        in_place[f] = false;
        lead = links[f].map(|l| Anchor::AfterRemote(remote[l.remote()].id.clone()));
    }

    for (j, node) in remote.iter().enumerate() {
        if taken[j].is_none() {
            plan.ops.push(SyncOp::Delete {
                id: node.id.clone(),
                depth,
                subtree: node.subtree_ids(),
            });
        }
    }

    let path_of = |i: usize| {
        let mut path = prefix.to_vec();
        path.push(i);
        path
    };

    let mut moves = Vec::new();
    let mut nested = Vec::new();
    for (i, block) in local.iter().enumerate() {
        let path = path_of(i);
        match links[i] {
            Some(link) if !in_place[i] => {
                let node = &remote[link.remote()];
                let anchor = preceding(i, &links, &in_place, remote, &path_of, true)
                    .or_else(|| lead.clone())
                    .unwrap_or(Anchor::End);
                moves.push(Move {
                    id: node.id.clone(),
                    path,
                    anchor,
                    subtree: node.subtree_ids(),
                });
            }
            Some(Link::Same(j)) => {
                plan.unchanged += keep_subtree(block, &remote[j], path, &mut plan.kept);
            }
            Some(Link::Positional(j)) => {
                let node = &remote[j];
                if block.own != node.own {
                    plan.ops.push(SyncOp::Update {
                        id: node.id.clone(),
                        path: path.clone(),
                    });
                }
                plan.kept.push(KeptBlock {
                    path: path.clone(),
                    id: node.id.clone(),
                    fingerprint: block.fingerprint,
                });
                nested.push((i, j, path));
            }
            None => {
                let anchor = preceding(i, &links, &in_place, remote, &path_of, false)
                    .or_else(|| lead.clone())
                    .unwrap_or(Anchor::End);
                plan.ops.push(SyncOp::Create {
                    parent: parent.clone(),
                    path,
                    anchor,
                });
            }
        }
    }

    if !moves.is_empty() {
        let ordered = kept
            .iter()
            .filter_map(|&i| links[i].map(|l| remote[l.remote()].id.clone()))
            .collect();
        plan.ops.push(SyncOp::Reorder {
            parent: parent.clone(),
            ordered,
            moves,
        });
    }

    for (i, j, path) in nested {
        diff_level(
            &local[i].children,
            &remote[j].children,
            &remote[j].id,
            &path,
            depth + 1,
            plan,
        );
    }
}

/// Whether a remote block can be edited into the local one in place.
fn reconcilable(local: &FingerprintedBlock<'_>, remote: &RemoteNode) -> bool {
    remote.decoded.is_some()
        && !remote.is_table()
        && block_type(&local.block.kind) == remote.block_type
}

/// Anchor on the nearest preceding sibling that will exist when block `i` is
/// placed. Creates happen before moves, so only moves may follow a moved
/// sibling.
fn preceding(
    i: usize,
    links: &[Option<Link>],
    in_place: &[bool],
    remote: &[RemoteNode],
    path_of: &impl Fn(usize) -> BlockPath,
    moving: bool,
) -> Option<Anchor> {
    (0..i).rev().find_map(|k| match links[k] {
        None => Some(Anchor::AfterNew(path_of(k))),
        Some(link) if in_place[k] => Some(Anchor::AfterRemote(remote[link.remote()].id.clone())),
        Some(_) if moving => Some(Anchor::AfterNew(path_of(k))),
        Some(_) => None,
    })
}

/// Record an identical subtree as kept, returning how many blocks it holds.
fn keep_subtree(
    local: &FingerprintedBlock<'_>,
    remote: &RemoteNode,
    path: BlockPath,
    kept: &mut Vec<KeptBlock>,
) -> usize {
    let mut count = 1;
    for (idx, (child, remote_child)) in local.children.iter().zip(&remote.children).enumerate() {
        let mut child_path = path.clone();
        child_path.push(idx);
        count += keep_subtree(child, remote_child, child_path, kept);
    }
    kept.push(KeptBlock {
        path,
        id: remote.id.clone(),
        fingerprint: local.fingerprint,
    });
    count
}

/// Positions (into `order`) of the kept blocks that stay where they are.
///
/// That is a longest run already in remote order, except that a run which
/// keeps the first local block wins when it is at most one block shorter:
/// any other run would lose its own first block to the leading-block move.
fn staying(order: &[usize], first_kept: bool) -> Vec<usize> {
    let free = longest_increasing_subsequence(order);
    if !first_kept || free.first() == Some(&0) {
        return free;
    }
    let Some(&first) = order.first() else {
        return free;
    };
    let tail: Vec<usize> = (1..order.len()).filter(|&k| order[k] > first).collect();
    let values: Vec<usize> = tail.iter().map(|&k| order[k]).collect();
    let mut anchored = vec![0];
    anchored.extend(longest_increasing_subsequence(&values).into_iter().map(|p| tail[p]));
    if anchored.len() + 1 >= free.len() {
        anchored
    } else {
        free
    }
}

/// Positions (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    // tails[k]: position of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (pos, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        if k > 0 {
            prev[pos] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(pos);
        } else {
            tails[k] = pos;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        out.push(pos);
        cursor = prev[pos];
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mirror;
    use pagesync_renderer::{Block, BlockKind, InlineRun, TableRow};

    fn page() -> BlockId {
        BlockId::new("page")
    }

    fn diff(local: &[Block], remote: &[RemoteNode]) -> SyncPlan {
        plan(&FingerprintedBlock::forest(local), remote, &page())
    }

    fn paragraphs(texts: &[&str]) -> Vec<Block> {
        texts.iter().map(|t| Block::paragraph(*t)).collect()
    }

    #[test]
    fn identical_trees_plan_nothing() {
        let local = vec![
            Block::heading(1, "Title"),
            Block::bulleted("a").with_children(vec![Block::bulleted("b")]),
        ];
        let plan = diff(&local, &mirror(&local));
        assert!(plan.is_noop());
        assert_eq!(plan.unchanged, 3);
        assert_eq!(plan.kept.len(), 3);
    }

    #[test]
    fn rename_is_one_update() {
        let remote = mirror(&paragraphs(&["Hello"]));
        let plan = diff(&paragraphs(&["Hello, world"]), &remote);
        assert_eq!(
            plan.ops,
            vec![SyncOp::Update {
                id: BlockId::new("r0"),
                path: vec![0]
            }]
        );
    }

    #[test]
    fn rotation_is_one_reorder_keeping_the_first_block() {
        let remote = mirror(&paragraphs(&["A", "B", "C"]));
        let plan = diff(&paragraphs(&["C", "A", "B"]), &remote);
        assert_eq!(plan.ops.len(), 1);
        match &plan.ops[0] {
            SyncOp::Reorder {
                parent,
                ordered,
                moves,
            } => {
                assert_eq!(parent, &page());
                assert_eq!(ordered, &[BlockId::new("r2"), BlockId::new("r0"), BlockId::new("r1")]);
                assert_eq!(
                    moves,
                    &[
                        Move {
                            id: BlockId::new("r0"),
                            path: vec![1],
                            anchor: Anchor::AfterRemote(BlockId::new("r2")),
                            subtree: vec![BlockId::new("r0")],
                        },
                        Move {
                            id: BlockId::new("r1"),
                            path: vec![2],
                            anchor: Anchor::AfterNew(vec![1]),
                            subtree: vec![BlockId::new("r1")],
                        },
                    ]
                );
            }
            other => panic!("expected reorder, got {other:?}"),
        }
    }

    #[test]
    fn swap_is_one_reorder_with_one_move() {
        let remote = mirror(&paragraphs(&["A", "B"]));
        let plan = diff(&paragraphs(&["B", "A"]), &remote);
        assert_eq!(plan.ops.len(), 1);
        let moves: Vec<_> = plan.reorders().flat_map(|(_, m)| m.iter()).collect();
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn insertion_anchors_after_previous_sibling() {
        let remote = mirror(&paragraphs(&["A", "C"]));
        let plan = diff(&paragraphs(&["A", "B", "C"]), &remote);
        assert_eq!(
            plan.ops,
            vec![SyncOp::Create {
                parent: page(),
                path: vec![1],
                anchor: Anchor::AfterRemote(BlockId::new("r0")),
            }]
        );
    }

    #[test]
    fn leading_blocks_go_after_the_displaced_first_block() {
        let remote = mirror(&paragraphs(&["Z", "Y"]));
        let plan = diff(&paragraphs(&["A", "B", "Z", "Y"]), &remote);
        let anchors: Vec<_> = plan.creates().map(|(_, _, a)| a.clone()).collect();
        assert_eq!(
            anchors,
            vec![Anchor::AfterRemote(BlockId::new("r0")), Anchor::AfterNew(vec![0])]
        );
        let moves: Vec<_> = plan.reorders().flat_map(|(_, m)| m.iter()).collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].id, BlockId::new("r0"));
        assert_eq!(moves[0].anchor, Anchor::AfterNew(vec![1]));
        assert!(plan.deletes().is_empty());
    }

    #[test]
    fn leading_move_goes_after_the_displaced_first_block() {
        let remote = mirror(&paragraphs(&["A", "B", "C", "D"]));
        let plan = diff(&paragraphs(&["D", "A", "B", "C"]), &remote);
        let moves: Vec<_> = plan.reorders().flat_map(|(_, m)| m.iter()).collect();
        assert_eq!(
            moves.iter().map(|m| (m.id.as_str(), m.anchor.clone())).collect::<Vec<_>>(),
            vec![
                ("r3", Anchor::AfterRemote(BlockId::new("r0"))),
                ("r0", Anchor::AfterNew(vec![0])),
            ]
        );
    }

    #[test]
    fn empty_page_appends_at_end() {
        let plan = diff(&paragraphs(&["A", "B"]), &[]);
        let anchors: Vec<_> = plan.creates().map(|(_, _, a)| a.clone()).collect();
        assert_eq!(anchors, vec![Anchor::End, Anchor::AfterNew(vec![0])]);
    }

    #[test]
    fn removal_deletes_only_the_block() {
        let remote = mirror(&paragraphs(&["A", "B", "C"]));
        let plan = diff(&paragraphs(&["A", "C"]), &remote);
        assert_eq!(
            plan.ops,
            vec![SyncOp::Delete {
                id: BlockId::new("r1"),
                depth: 0,
                subtree: vec![BlockId::new("r1")],
            }]
        );
    }

    #[test]
    fn type_change_replaces() {
        let remote = mirror(&paragraphs(&["A"]));
        let plan = diff(&[Block::bulleted("A")], &remote);
        assert_eq!(plan.deletes().len(), 1);
        assert_eq!(plan.creates().count(), 1);
        assert_eq!(plan.updates().count(), 0);
    }

    #[test]
    fn nested_edit_updates_only_the_child() {
        let before = vec![Block::bulleted("parent").with_children(vec![
            Block::bulleted("one"),
            Block::bulleted("two"),
        ])];
        let after = vec![Block::bulleted("parent").with_children(vec![
            Block::bulleted("one"),
            Block::bulleted("two!"),
        ])];
        let plan = diff(&after, &mirror(&before));
        assert_eq!(
            plan.ops,
            vec![SyncOp::Update {
                id: BlockId::new("r0.1"),
                path: vec![0, 1]
            }]
        );
    }

    #[test]
    fn changed_table_is_replaced() {
        let table = |cell: &str| {
            Block::new(BlockKind::Table {
                rows: vec![TableRow::plain(&[cell])],
                header_rows: 0,
                stub_columns: 0,
            })
        };
        let plan = diff(&[table("new")], &mirror(&[table("old")]));
        assert_eq!(plan.deletes().len(), 1);
        assert_eq!(plan.creates().count(), 1);
    }

    #[test]
    fn deletes_run_deepest_first() {
        let before = vec![
            Block::bulleted("keep").with_children(vec![Block::bulleted("gone child")]),
            Block::paragraph("gone"),
        ];
        let after = vec![Block::bulleted("keep")];
        let plan = diff(&after, &mirror(&before));
        let depths: Vec<_> = plan.deletes().iter().map(|(_, d)| *d).collect();
        assert_eq!(depths, vec![1, 0]);
    }

    #[test]
    fn destroyed_covers_moved_subtrees() {
        let toggle = Block::new(BlockKind::Toggle)
            .with_runs(vec![InlineRun::plain("a")])
            .with_children(vec![Block::paragraph("inner")]);
        let before = vec![toggle.clone(), Block::paragraph("b"), Block::paragraph("c")];
        let after = vec![Block::paragraph("b"), Block::paragraph("c"), toggle];
        let plan = diff(&after, &mirror(&before));
        assert_eq!(plan.destroyed(), vec![BlockId::new("r0"), BlockId::new("r0.0")]);
        let moves: Vec<_> = plan.reorders().flat_map(|(_, m)| m.iter()).collect();
        assert_eq!(moves[0].anchor, Anchor::AfterRemote(BlockId::new("r2")));
    }

    #[test]
    fn lis_positions() {
        assert_eq!(longest_increasing_subsequence(&[2, 0, 1]), vec![1, 2]);
        assert_eq!(longest_increasing_subsequence(&[0, 1, 2]), vec![0, 1, 2]);
        assert_eq!(longest_increasing_subsequence(&[]), Vec::<usize>::new());
        assert_eq!(longest_increasing_subsequence(&[3, 1, 2, 0]).len(), 2);
    }
}
