//! Control-flow graph (CFG) abstractions and utilities: region membership,
//! traversal, loop nest discovery, and the dominator tree.

use crate::{Block, FuncBody, FxIndexSet};
use itertools::Either;

/// The subgraph under transformation: every block reachable from `entry`
/// that satisfies the membership predicate.
///
/// Owned by the driver; the linearizer only reads membership (and mutates
/// the member blocks themselves, through [`FuncBody`]).
pub struct Region {
    pub entry: Block,

    /// `None` means the whole function is the region.
    pub members: Option<FxIndexSet<Block>>,
}

impl Region {
    pub fn whole_function(func: &FuncBody) -> Self {
        Self { entry: func.entry, members: None }
    }

    pub fn contains(&self, block: Block) -> bool {
        self.members.as_ref().is_none_or(|members| members.contains(&block))
    }
}

// HACK this only serves to disallow accessing `IncomingEdgeCount`'s private field.
mod sealed {
    /// Opaque newtype for the count of incoming edges (into a [`Block`](crate::Block)).
    ///
    /// The private field prevents direct mutation or construction, forcing the
    /// use of [`IncomingEdgeCount::ONE`] and addition operations to produce some
    /// specific count (which would require explicit workarounds for misuse).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IncomingEdgeCount(usize);

    impl IncomingEdgeCount {
        pub const ONE: Self = Self(1);
    }

    impl std::ops::Add for IncomingEdgeCount {
        type Output = Self;
        fn add(self, other: Self) -> Self {
            Self(self.0 + other.0)
        }
    }

    impl std::ops::AddAssign for IncomingEdgeCount {
        fn add_assign(&mut self, other: Self) {
            *self = *self + other;
        }
    }
}
pub use sealed::IncomingEdgeCount;

pub struct TraversalState<PreVisit: FnMut(Block), PostVisit: FnMut(Block)> {
    pub incoming_edge_counts: crate::EntityOrientedDenseMap<Block, IncomingEdgeCount>,
    pub pre_order_visit: PreVisit,
    pub post_order_visit: PostVisit,

    pub reverse_targets: bool,
}

/// Iterate over all of `region`'s blocks, in reverse post-order (RPO).
///
/// RPO iteration over a CFG provides certain guarantees, most importantly
/// that dominators are visited before the entire subgraph they dominate.
pub fn rev_post_order(func: &FuncBody, region: &Region) -> Vec<Block> {
    let mut post_order = vec![];
    traverse(
        func,
        region,
        region.entry,
        &mut TraversalState {
            incoming_edge_counts: crate::EntityOrientedDenseMap::new(),

            pre_order_visit: |_| {},
            post_order_visit: |block| post_order.push(block),

            // NOTE this doesn't impact semantics, but combined with the final
            // reversal, it should keep targets in the original order in the
            // cases when they didn't get deduplicated.
            reverse_targets: true,
        },
    );
    post_order.reverse();
    post_order
}

pub fn traverse(
    func: &FuncBody,
    region: &Region,
    block: Block,
    state: &mut TraversalState<impl FnMut(Block), impl FnMut(Block)>,
) {
    if let Some(existing_count) = state.incoming_edge_counts.get_mut(block) {
        *existing_count += IncomingEdgeCount::ONE;
        return;
    }
    state.incoming_edge_counts.insert(block, IncomingEdgeCount::ONE);

    (state.pre_order_visit)(block);

    let targets = func.blocks[block].terminator.targets.iter().copied();
    let targets = if state.reverse_targets {
        Either::Left(targets.rev())
    } else {
        Either::Right(targets)
    };
    for target in targets {
        if region.contains(target) {
            traverse(func, region, target, state);
        }
    }

    (state.post_order_visit)(block);
}

/// Handle for a [`LoopDef`] in a [`LoopForest`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoopId(u32);

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One natural loop: a maximal CFG SCC with a single header and (asserted)
/// a unique latch.
pub struct LoopDef {
    pub header: Block,

    /// The unique in-loop predecessor of the header. Loops with several
    /// latches are a precondition violation of the whole crate (the
    /// upstream normalization owns that guarantee), detected fatally here.
    pub latch: Block,

    /// All member blocks, header first (then SCC discovery order).
    pub blocks: FxIndexSet<Block>,

    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
}

/// The loop nest of a region, derived from SCCs (innermost loops are found
/// by re-running the SCC search on each loop body with the header and
/// everything outside it sealed off).
pub struct LoopForest {
    loops: Vec<LoopDef>,

    /// Innermost loop containing each block (if any).
    innermost: crate::EntityOrientedDenseMap<Block, LoopId>,
}

impl LoopForest {
    pub fn compute(func: &FuncBody, region: &Region) -> Self {
        let loop_blocks = LoopFinder::new(func, region).find_all_loops_starting_at(region.entry);

        let mut loops: Vec<LoopDef> = loop_blocks
            .into_iter()
            .map(|blocks| {
                let header = blocks[0];
                let latches: Vec<Block> = func
                    .predecessors(header)
                    .into_iter()
                    .filter(|pred| blocks.contains(pred))
                    .collect();
                let &[latch] = &latches[..] else {
                    panic!("loop with header {header} must have exactly one latch, found {latches:?}");
                };
                LoopDef {
                    header,
                    latch,
                    blocks: blocks.into_iter().collect(),
                    parent: None,
                    children: vec![],
                }
            })
            .collect();

        // Loops from the SCC search are pairwise disjoint or strictly nested,
        // so the parent of a loop is the smallest *other* loop containing its
        // header.
        let parent_of: Vec<Option<LoopId>> = (0..loops.len())
            .map(|i| {
                (0..loops.len())
                    .filter(|&j| j != i && loops[j].blocks.contains(&loops[i].header))
                    .min_by_key(|&j| loops[j].blocks.len())
                    .map(|j| LoopId(j as u32))
            })
            .collect();
        for (i, parent) in parent_of.iter().enumerate() {
            loops[i].parent = *parent;
            if let Some(LoopId(p)) = parent {
                let child = LoopId(i as u32);
                loops[*p as usize].children.push(child);
            }
        }

        let mut innermost = crate::EntityOrientedDenseMap::new();
        for (i, def) in loops.iter().enumerate() {
            for &block in &def.blocks {
                let slot = innermost.entry(block);
                let replace = match *slot {
                    Some(LoopId(prev)) => def.blocks.len() < loops[prev as usize].blocks.len(),
                    None => true,
                };
                if replace {
                    *slot = Some(LoopId(i as u32));
                }
            }
        }

        Self { loops, innermost }
    }

    pub fn innermost_loop_of(&self, block: Block) -> Option<LoopId> {
        self.innermost.get(block).copied()
    }

    pub fn loop_def(&self, id: LoopId) -> &LoopDef {
        &self.loops[id.0 as usize]
    }

    pub fn contains(&self, id: LoopId, block: Block) -> bool {
        self.loop_def(id).blocks.contains(&block)
    }

    /// Loops with no parent, i.e. the outermost nesting level.
    pub fn roots(&self) -> impl Iterator<Item = LoopId> + '_ {
        (0..self.loops.len() as u32).map(LoopId).filter(|&id| self.loop_def(id).parent.is_none())
    }

    pub fn all_loops(&self) -> impl Iterator<Item = LoopId> + use<> {
        (0..self.loops.len() as u32).map(LoopId)
    }

    /// All `(exiting block, exit target)` edges leaving the loop, in member
    /// block order (deduplicated).
    pub fn exit_edges(&self, func: &FuncBody, id: LoopId) -> Vec<(Block, Block)> {
        let def = self.loop_def(id);
        let mut edges = vec![];
        for &block in &def.blocks {
            for succ in func.successors(block) {
                if !def.blocks.contains(&succ) && !edges.contains(&(block, succ)) {
                    edges.push((block, succ));
                }
            }
        }
        edges
    }

    /// The distinct exit target blocks of the loop, in exit-edge order.
    pub fn exit_blocks(&self, func: &FuncBody, id: LoopId) -> Vec<Block> {
        let mut exits = vec![];
        for (_, exit) in self.exit_edges(func, id) {
            if !exits.contains(&exit) {
                exits.push(exit);
            }
        }
        exits
    }
}

/// Minimal loop discovery, based on Tarjan's SCC (strongly connected
/// components) algorithm, applied recursively (for every level of loop
/// nesting): each loop is the smallest CFG subgraph containing its backedge,
/// i.e. a CFG SCC.
struct LoopFinder<'a> {
    func: &'a FuncBody,
    region: &'a Region,

    /// Discovered loops, as member-block lists (header first).
    loop_blocks: Vec<Vec<Block>>,

    /// SCC accumulation stack, where CFG nodes collect during the depth-first
    /// traversal, and are only popped when their "SCC root" (loop header) is
    /// (note that multiple SCCs on the stack does *not* indicate SCC nesting,
    /// but rather a path between two SCCs, i.e. a loop *following* another).
    scc_stack: Vec<Block>,
    /// Per-CFG-node traversal state (often just pointing to a `scc_stack` slot).
    scc_state: crate::EntityOrientedDenseMap<Block, SccState>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SccStackIdx(u32);

#[derive(Copy, Clone, PartialEq, Eq)]
enum SccState {
    /// CFG node has been reached and ended up somewhere on the `scc_stack`,
    /// where it will remain until the SCC it's part of will be completed.
    Pending(SccStackIdx),

    /// CFG node had been reached once, but is no longer on the `scc_stack`,
    /// its parent SCC having been completed (or it wasn't in an SCC at all).
    Complete,
}

impl<'a> LoopFinder<'a> {
    fn new(func: &'a FuncBody, region: &'a Region) -> Self {
        Self {
            func,
            region,
            loop_blocks: vec![],
            scc_stack: vec![],
            scc_state: crate::EntityOrientedDenseMap::new(),
        }
    }

    fn find_all_loops_starting_at(mut self, entry: Block) -> Vec<Vec<Block>> {
        self.find_earliest_scc_root_of(entry);
        self.loop_blocks
    }

    /// Tarjan's SCC algorithm works by computing the "earliest" reachable node,
    /// from every node (often using the name `lowlink`), which will be equal
    /// to the origin node itself iff that node is an "SCC root" (loop header),
    /// and always point to an "earlier" node if a cycle (via loop backedge) was
    /// found from somewhere else in the SCC (i.e. from inside the loop body).
    ///
    /// Here we track stack indices (as the stack order is the traversal order),
    /// and distinguish the acyclic case to avoid treating most nodes as self-loops.
    fn find_earliest_scc_root_of(&mut self, node: Block) -> Option<SccStackIdx> {
        let state_entry = self.scc_state.entry(node);
        if let Some(state) = *state_entry {
            return match state {
                SccState::Pending(scc_stack_idx) => Some(scc_stack_idx),
                SccState::Complete => None,
            };
        }
        let scc_stack_idx = SccStackIdx(self.scc_stack.len().try_into().unwrap());
        self.scc_stack.push(node);
        *state_entry = Some(SccState::Pending(scc_stack_idx));

        let targets: Vec<Block> = self
            .func
            .successors(node)
            .filter(|&target| self.region.contains(target))
            .collect();

        let earliest_scc_root =
            targets.into_iter().flat_map(|target| self.find_earliest_scc_root_of(target)).min();

        // If this node has been chosen as the root of an SCC, complete that SCC.
        if earliest_scc_root == Some(scc_stack_idx) {
            let scc_start = scc_stack_idx.0 as usize;

            self.loop_blocks.push(self.scc_stack[scc_start..].to_vec());

            // Find nested loops by marking *only* the loop header as complete,
            // clearing loop body nodes' state, and recursing on them: all the
            // nodes outside the loop (otherwise reachable from within), and the
            // loop header itself, are already marked as complete, meaning that
            // all exits and backedges will be ignored, and the recursion will
            // only find more SCCs within the loop body (i.e. nested loops).
            self.scc_state[node] = SccState::Complete;
            let loop_body_range = scc_start + 1..self.scc_stack.len();
            for &scc_node in &self.scc_stack[loop_body_range.clone()] {
                self.scc_state.remove(scc_node);
            }
            for i in loop_body_range.clone() {
                self.find_earliest_scc_root_of(self.scc_stack[i]);
            }
            assert_eq!(self.scc_stack.len(), loop_body_range.end);

            // Remove the entire SCC from the accumulation stack all at once.
            self.scc_stack.truncate(scc_start);

            return None;
        }

        // Not actually in an SCC at all, just some node outside any CFG cycles.
        if earliest_scc_root.is_none() {
            assert!(self.scc_stack.pop() == Some(node));
            self.scc_state[node] = SccState::Complete;
        }

        earliest_scc_root
    }
}

/// The dominator tree of a region, as an immediate-dominator map.
///
/// Built once up front (iterative data-flow over RPO), then kept consistent
/// *incrementally* by the linearizer via [`DominatorTree::set_idom`]; never
/// recomputed mid-pass. [`DominatorTree::verify`] closes the loop by
/// re-deriving the tree from scratch and comparing.
pub struct DominatorTree {
    entry: Block,

    /// `idom[entry] == entry`; absent entries are unreachable blocks.
    idom: crate::EntityOrientedDenseMap<Block, Block>,
}

impl DominatorTree {
    pub fn compute(func: &FuncBody, region: &Region) -> Self {
        let rpo = rev_post_order(func, region);
        let mut rpo_number = crate::EntityOrientedDenseMap::new();
        for (i, &block) in rpo.iter().enumerate() {
            rpo_number.insert(block, i);
        }

        let mut idom: crate::EntityOrientedDenseMap<Block, Block> =
            crate::EntityOrientedDenseMap::new();
        idom.insert(region.entry, region.entry);

        // Standard iterate-to-fixpoint intersection over RPO; converges in a
        // couple of rounds on reducible graphs.
        let intersect = |idom: &crate::EntityOrientedDenseMap<Block, Block>,
                         rpo_number: &crate::EntityOrientedDenseMap<Block, usize>,
                         mut a: Block,
                         mut b: Block| {
            while a != b {
                while rpo_number[a] > rpo_number[b] {
                    a = idom[a];
                }
                while rpo_number[b] > rpo_number[a] {
                    b = idom[b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for pred in self::preds_in_region(func, region, block) {
                    if !idom.contains_key(pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_number, current, pred),
                    });
                }
                let new_idom =
                    new_idom.expect("unreachable block survived reverse post-order traversal");
                if idom.get(block) != Some(&new_idom) {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        Self { entry: region.entry, idom }
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    pub fn idom(&self, block: Block) -> Option<Block> {
        if block == self.entry {
            return None;
        }
        self.idom.get(block).copied()
    }

    /// Incremental repair: re-point `block`'s immediate dominator.
    pub fn set_idom(&mut self, block: Block, new_idom: Block) {
        assert!(block != self.entry, "the entry block has no immediate dominator");
        self.idom.insert(block, new_idom);
    }

    /// Does `a` dominate `b`? (Reflexive: every block dominates itself.)
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let mut walk = b;
        loop {
            if walk == a {
                return true;
            }
            if walk == self.entry {
                return false;
            }
            walk = self.idom[walk];
        }
    }

    pub fn nearest_common_dominator(&self, a: Block, b: Block) -> Block {
        let depth = |mut block: Block| {
            let mut depth = 0usize;
            while block != self.entry {
                block = self.idom[block];
                depth += 1;
            }
            depth
        };
        let (mut a, mut b) = (a, b);
        let (mut depth_a, mut depth_b) = (depth(a), depth(b));
        while depth_a > depth_b {
            a = self.idom[a];
            depth_a -= 1;
        }
        while depth_b > depth_a {
            b = self.idom[b];
            depth_b -= 1;
        }
        while a != b {
            a = self.idom[a];
            b = self.idom[b];
        }
        a
    }

    /// Recompute the dominator tree of the (rewritten) graph from scratch and
    /// compare every immediate-dominator assignment against the incrementally
    /// repaired one. Fatal on any mismatch.
    pub fn verify(&self, func: &FuncBody, region: &Region) {
        let fresh = Self::compute(func, region);
        for &block in &rev_post_order(func, region) {
            assert!(
                self.idom(block) == fresh.idom(block),
                "dominator tree diverged from a full re-derivation at {}: kept {:?}, derived {:?}",
                block,
                self.idom(block),
                fresh.idom(block),
            );
        }
    }
}

fn preds_in_region(func: &FuncBody, region: &Region, block: Block) -> Vec<Block> {
    func.predecessors(block).into_iter().filter(|&pred| region.contains(pred)).collect()
}
