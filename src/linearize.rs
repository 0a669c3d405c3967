//! Control-flow linearization: divergent CFG -> linear masked schedule.
//!
//! The pass assigns every region block a dense topological index (loops
//! occupy contiguous ranges, header first, latch last), then walks the index
//! range exactly once. Divergent two-way branches are *folded*: both
//! successors are chained, in index order, behind a single physical
//! successor, so that the final schedule visits each of them under its mask.
//! Divergent loops are converted to a single-exit fixed-point form first,
//! with per-iteration tracker joins remembering the last value of every
//! quantity that was live across a removed exit.
//!
//! The chaining runs through *relay* placeholders: a branch that must reach
//! N logical successors in a forced order points at the placeholder of the
//! earliest pending target; when that target's index is finally reached, the
//! placeholder's incoming edges are forwarded to the real block and the
//! relay advances to its `next` pending target.
//!
//! Everything here mutates one graph in place, single-threaded, run to
//! completion: every failure mode is an upstream analysis bug and is treated
//! as a fatal assertion, never a recoverable error.

use crate::cfg::{DominatorTree, LoopForest, LoopId, Region};
use crate::divergence::{DivergenceInfo, LaneShape};
use crate::mask::{Mask, MaskAnalysis};
use crate::{
    Block, ControlInst, ControlInstKind, FuncBody, FxIndexMap, FxIndexSet, Inst, InstDef, InstKind,
    Type, Value,
};

/// Handle into the relay arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct RelayId(u32);

/// Deferred-target descriptor: stands in for one not-yet-emitted block, and
/// links to the relay of the target that must be visited after it.
struct RelayNode {
    /// Topological index of the real target block.
    target: usize,

    /// Placeholder block accumulating incoming edges until the target is
    /// emitted. Never has outgoing edges of its own.
    placeholder: Block,

    /// Relay for the subsequent pending target (strictly larger index:
    /// relays only ever point forward).
    next: Option<RelayId>,
}

/// Relay chains: a flat arena of [`RelayNode`]s (addressed by [`RelayId`])
/// plus the external map from pending target index to its unique node.
///
/// A "chain" is the `next`-linked list starting at some node, sorted by
/// target index. Nodes are shared between chains (one node per target), so
/// two chains that meet at a common target merge from that point on.
#[derive(Default)]
struct RelayChains {
    nodes: Vec<RelayNode>,

    pending: FxIndexMap<usize, RelayId>,
}

impl RelayChains {
    fn node(&self, id: RelayId) -> &RelayNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: RelayId) -> &mut RelayNode {
        &mut self.nodes[id.0 as usize]
    }

    fn get(&self, target: usize) -> Option<RelayId> {
        self.pending.get(&target).copied()
    }

    fn request(&mut self, func: &mut FuncBody, target: usize) -> RelayId {
        if let Some(id) = self.get(target) {
            return id;
        }
        let id = RelayId(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(RelayNode { target, placeholder: func.add_block(), next: None });
        self.pending.insert(target, id);
        id
    }

    /// Insert `target` into the chain headed by `relay`, in increasing index
    /// order, and return the head of the merged chain (which is `target`'s
    /// own node whenever it is, or becomes, the earliest pending target).
    fn add_target(&mut self, func: &mut FuncBody, relay: Option<RelayId>, target: usize) -> RelayId {
        let node = self.request(func, target);
        self.merge(Some(node), relay).unwrap()
    }

    fn merge(&mut self, a: Option<RelayId>, b: Option<RelayId>) -> Option<RelayId> {
        match (a, b) {
            (None, other) | (other, None) => other,
            (Some(x), Some(y)) if x == y => Some(x),
            (Some(x), Some(y)) => {
                assert!(
                    self.node(x).target != self.node(y).target,
                    "relay bookkeeping contradiction: two live nodes for one target"
                );
                let (first, second) =
                    if self.node(x).target < self.node(y).target { (x, y) } else { (y, x) };
                let rest = self.node(first).next;
                let merged = self.merge(rest, Some(second));
                self.node_mut(first).next = merged;
                Some(first)
            }
        }
    }

    /// Consume the pending relay for `target` (the caller is about to emit
    /// the real block): returns its placeholder, and the relay of the next
    /// target still pending on the itinerary.
    fn advance(&mut self, target: usize) -> Option<(Block, Option<RelayId>)> {
        let id = self.pending.shift_remove(&target)?;
        let node = self.node(id);
        Some((node.placeholder, node.next))
    }

    fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Per-loop bookkeeping for divergent-loop conversion: tracker joins in the
/// loop header remember, per lane, the last value of each live-out as of the
/// iteration in which that lane left the loop.
struct LiveValueTracker {
    loop_id: LoopId,

    /// Source of the "no lane has exited yet" undef seed.
    preheader: Block,

    /// Live-out instruction -> its tracker join.
    tracker_phis: FxIndexMap<Inst, Inst>,
}

/// The linearization pass. Borrows everything it mutates for the duration of
/// one [`Linearizer::run`]: the function body, the divergence and mask
/// annotations, and the dominator tree (repaired incrementally, never
/// recomputed mid-pass). The loop forest is read-only: loop membership is
/// unchanged by the rewrite.
pub struct Linearizer<'a> {
    func: &'a mut FuncBody,
    region: &'a Region,
    loops: &'a LoopForest,
    divergence: &'a mut DivergenceInfo,
    masks: &'a mut MaskAnalysis,
    dom_tree: &'a mut DominatorTree,

    /// Dense topological position of every region block; immutable once
    /// assigned, and the sole ordering key for the rest of the pass.
    block_index: crate::EntityOrientedDenseMap<Block, usize>,
    blocks_by_index: Vec<Block>,

    relays: RelayChains,

    /// Per-edge masks recorded while branches are processed; reads fall back
    /// to the mask analysis for edges this pass never touched.
    edge_masks: FxIndexMap<(Block, Block), Mask>,
}

/// Linearize `region` of `func` in place and return the final schedule
/// (every region block, in topological emission order). See [`Linearizer`].
pub fn linearize_region(
    func: &mut FuncBody,
    region: &Region,
    loops: &LoopForest,
    divergence: &mut DivergenceInfo,
    masks: &mut MaskAnalysis,
    dom_tree: &mut DominatorTree,
) -> Vec<Block> {
    Linearizer::new(func, region, loops, divergence, masks, dom_tree).run()
}

impl<'a> Linearizer<'a> {
    pub fn new(
        func: &'a mut FuncBody,
        region: &'a Region,
        loops: &'a LoopForest,
        divergence: &'a mut DivergenceInfo,
        masks: &'a mut MaskAnalysis,
        dom_tree: &'a mut DominatorTree,
    ) -> Self {
        Self {
            func,
            region,
            loops,
            divergence,
            masks,
            dom_tree,
            block_index: crate::EntityOrientedDenseMap::new(),
            blocks_by_index: vec![],
            relays: RelayChains::default(),
            edge_masks: FxIndexMap::default(),
        }
    }

    /// Run the pass to completion; returns the linear schedule (every region
    /// block, in the topological order the rewritten graph executes them).
    pub fn run(mut self) -> Vec<Block> {
        // global topological enumeration, and its integrity check
        self.build_block_index();
        self.verify_block_index();

        // early exit on trivial cases
        if self.num_blocks() <= 1 {
            return self.blocks_by_index;
        }

        // fold divergent branches and convert divergent loops to fixed-point
        // iteration form
        self.linearize_control();

        // simplify terminators whose surviving successors all alias
        self.cleanup();

        // verify control integrity and the incrementally repaired dominance
        self.verify();

        self.blocks_by_index
    }

    fn num_blocks(&self) -> usize {
        self.blocks_by_index.len()
    }

    fn block_at(&self, id: usize) -> Block {
        self.blocks_by_index[id]
    }

    #[track_caller]
    fn index_of(&self, block: Block) -> usize {
        *self
            .block_index
            .get(block)
            .unwrap_or_else(|| panic!("block {block} is not part of the region"))
    }

    // Topological block indexing (loops contiguous, header first, latch last).

    fn assign_index(&mut self, block: Block) {
        let id = self.blocks_by_index.len();
        assert!(self.block_index.insert(block, id).is_none(), "block {block} indexed twice");
        self.blocks_by_index.push(block);
    }

    /// Depth-first with an explicit work stack (not recursive, to bound
    /// stack depth on arbitrary nesting): a block is indexed once all of its
    /// non-loop-carried in-region predecessors are. A loop header seen for
    /// the first time defers the whole loop: the latch goes on the stack
    /// below the header's outside predecessors, so the loop's single entry
    /// point is the last thing scheduled before the loop body.
    fn build_block_index(&mut self) {
        let mut stack: Vec<Block> = vec![];
        let mut pushed_loops: FxIndexSet<LoopId> = FxIndexSet::default();

        // seek unprocessed blocks, in definition order
        let seeds: Vec<Block> = self.func.live_blocks().collect();
        for seed in seeds {
            if !self.region.contains(seed) {
                continue;
            }
            if self.block_index.contains_key(seed) {
                continue;
            }
            stack.push(seed);

            while let Some(&block) = stack.last() {
                if self.block_index.contains_key(block) {
                    stack.pop();
                    continue;
                }

                let loop_of_block = self.loops.innermost_loop_of(block);

                // seeing this loop for the first time: forget how we entered
                // it, then queue the latch below the header's dependencies
                if let Some(l) = loop_of_block {
                    if pushed_loops.insert(l) {
                        stack.pop();
                        let header = self.loops.loop_def(l).header;
                        let latch = self.loops.loop_def(l).latch;
                        stack.push(latch);
                        for pred in self.func.predecessors(header) {
                            if !self.region.contains(pred) {
                                continue;
                            }
                            // do not descend into the latch
                            if self.loops.contains(l, pred) {
                                continue;
                            }
                            if !self.block_index.contains_key(pred) {
                                stack.push(pred);
                            }
                        }
                        continue;
                    }
                }

                // at the loop header, loop-carried dependencies don't count
                let filter_loop =
                    loop_of_block.filter(|&l| self.loops.loop_def(l).header == block);

                let mut all_done = true;
                for pred in self.func.predecessors(block) {
                    if !self.region.contains(pred) {
                        continue;
                    }
                    if let Some(l) = filter_loop {
                        if self.loops.contains(l, pred) {
                            continue;
                        }
                    }
                    if !self.block_index.contains_key(pred) {
                        stack.push(pred);
                        all_done = false;
                    }
                }

                // all dependencies satisfied -> assign the next index
                if all_done {
                    stack.pop();
                    self.assign_index(block);

                    // re-visiting the header: everything outside the loop it
                    // depends on is scheduled, so the remainder of the loop
                    // goes before any other outside block
                    if let Some(l) = filter_loop {
                        let latch = self.loops.loop_def(l).latch;
                        if !self.block_index.contains_key(latch) {
                            stack.push(latch);
                        }
                    }
                }
            }
        }
    }

    fn verify_block_index(&self) {
        let roots: Vec<LoopId> = self.loops.roots().collect();
        for root in roots {
            self.verify_loop_index(root);
        }
    }

    /// Innermost first: the indices of a loop's blocks must be exactly the
    /// unbroken range bounded by its header and latch.
    fn verify_loop_index(&self, l: LoopId) {
        let def = self.loops.loop_def(l);
        for &child in &def.children {
            self.verify_loop_index(child);
        }

        let mut start_id = self.num_blocks();
        let mut end_id = 0;
        for &block in &def.blocks {
            start_id = start_id.min(self.index_of(block));
            end_id = end_id.max(self.index_of(block));
        }

        for id in start_id..=end_id {
            assert!(
                self.loops.contains(l, self.block_at(id)),
                "non-loop block {} in topo range of loop {l}",
                self.block_at(id)
            );
        }

        assert_eq!(start_id, self.index_of(def.header), "loop {l} does not start at its header");
        assert_eq!(end_id, self.index_of(def.latch), "loop {l} does not end at its latch");
    }

    // Divergence / mask queries.

    /// A terminator "needs folding" iff it is conditional and its condition
    /// is not classified uniform.
    fn needs_folding(&self, block: Block) -> bool {
        match self.func.blocks[block].terminator.kind {
            ControlInstKind::Unreachable | ControlInstKind::Return | ControlInstKind::Branch => {
                false
            }
            ControlInstKind::CondBranch => !self.divergence.branch_shape(block).is_uniform(),
        }
    }

    fn set_edge_mask(&mut self, from: Block, to: Block, mask: Mask) {
        self.edge_masks.insert((from, to), mask);
    }

    /// The recorded mask of edge `from -> to`, degrading to the mask
    /// analysis' answer for edges this pass never processed.
    fn edge_mask(&self, from: Block, to: Block) -> Mask {
        self.edge_masks.get(&(from, to)).copied().unwrap_or_else(|| self.masks.exit_mask_to(from, to))
    }

    // SSA repair.

    /// Make `value` (defined in the block at `def_id`) available at the end
    /// of the block at `dest_id`, filling the index range in between with
    /// join nodes where predecessors disagree; predecessors indexed before
    /// the span contribute undef, loop-carried back edges into the span are
    /// ignored.
    fn promote_definition(&mut self, value: Value, def_id: usize, dest_id: usize) -> Value {
        assert!(def_id <= dest_id, "definition promoted backwards");
        if def_id == dest_id {
            return value;
        }

        let ty = self.func.value_type(value);
        let shape = self.divergence.shape_of(value);
        let span = dest_id - def_id + 1;

        let mut defs: Vec<Option<Value>> = vec![None; span];
        defs[0] = Some(value);

        for i in 1..span {
            let block_id = def_id + i;
            let block = self.block_at(block_id);

            // reaching definition per predecessor (collected first; the
            // block is only mutated once the full picture is known)
            let mut incoming: Vec<(Block, Value)> = vec![];
            for pred in self.func.predecessors(block) {
                let pred_id = self.index_of(pred);
                if pred_id >= block_id {
                    continue; // reaching backedge -> ignore
                }
                let in_val = if pred_id < def_id {
                    // predecessor not in span -> undef
                    self.func.undef(ty)
                } else {
                    match defs[pred_id - def_id] {
                        Some(reaching) => reaching,
                        // reaching undef within the block range
                        None => self.func.undef(ty),
                    }
                };
                incoming.push((pred, in_val));
            }

            defs[i] = if incoming.is_empty() {
                None
            } else if incoming.iter().all(|&(_, v)| v == incoming[0].1) {
                Some(incoming[0].1)
            } else {
                let phi = self.func.prepend_phi(
                    block,
                    InstDef { ty, kind: InstKind::Phi { incoming: incoming.into_iter().collect() } },
                );
                self.divergence.set_shape(Value::Inst(phi), shape);
                Some(Value::Inst(phi))
            };
        }

        defs[span - 1].expect("promoted definition did not reach the destination block")
    }

    // Live-value tracking for divergent-loop conversion.

    /// The tracker join for `inst`: seeded undefined on loop entry and
    /// self-fed on the latch, until [`Linearizer::add_tracker_update`]
    /// blends live values in.
    fn request_tracker(&mut self, t: &mut LiveValueTracker, inst: Inst) -> Inst {
        if let Some(&phi) = t.tracker_phis.get(&inst) {
            return phi;
        }
        let header = self.loops.loop_def(t.loop_id).header;
        let latch = self.loops.loop_def(t.loop_id).latch;

        let ty = self.func.insts[inst].ty;
        let undef = self.func.undef(ty);
        let phi = self.func.prepend_phi(
            header,
            InstDef { ty, kind: InstKind::Phi { incoming: [(t.preheader, undef)].into_iter().collect() } },
        );
        let self_feed = Value::Inst(phi);
        match &mut self.func.insts[phi].kind {
            InstKind::Phi { incoming } => incoming.push((latch, self_feed)),
            _ => unreachable!(),
        }
        self.divergence.set_shape(Value::Inst(phi), LaneShape::Varying);

        t.tracker_phis.insert(inst, phi);
        phi
    }

    /// Blend `live_value` into `tracker` at the latch: lanes whose execution
    /// is exiting this iteration take the latest value, all others keep the
    /// previous iteration's.
    fn add_tracker_update(&mut self, t: &LiveValueTracker, tracker: Inst, live_value: Value) {
        let header = self.loops.loop_def(t.loop_id).header;
        let latch = self.loops.loop_def(t.loop_id).latch;

        let (latch_slot, last_state) = {
            let InstKind::Phi { incoming } = &self.func.insts[tracker].kind else { unreachable!() };
            let slot = incoming
                .iter()
                .position(|&(b, _)| b == latch)
                .expect("tracker join lost its latch input");
            (slot, incoming[slot].1)
        };

        let exit_mask = self.masks.combined_loop_exit_mask(header);
        let cond = exit_mask.request_pred_as_value(self.func);
        let ty = self.func.insts[tracker].ty;
        let update = self.func.push_inst(
            latch,
            InstDef { ty, kind: InstKind::Select { cond, on_true: live_value, on_false: last_state } },
        );
        self.divergence.set_shape(Value::Inst(update), LaneShape::Varying);

        match &mut self.func.insts[tracker].kind {
            InstKind::Phi { incoming } => incoming[latch_slot].1 = Value::Inst(update),
            _ => unreachable!(),
        }
    }

    /// The last update of `tracker`, i.e. the value readable after the latch.
    fn last_tracker_state(&self, t: &LiveValueTracker, tracker: Inst) -> Value {
        let latch = self.loops.loop_def(t.loop_id).latch;
        let InstKind::Phi { incoming } = &self.func.insts[tracker].kind else { unreachable!() };
        incoming.iter().find(|&&(b, _)| b == latch).expect("tracker join lost its latch input").1
    }

    /// The unique in-loop predecessor of a loop exit block.
    fn exiting_block_for(&self, loop_id: LoopId, exit_block: Block) -> Block {
        self.func
            .predecessors(exit_block)
            .into_iter()
            .find(|&pred| self.loops.contains(loop_id, pred))
            .expect("loop exit block has no in-loop predecessor")
    }

    /// Create trackers (and latch blends) for every loop-defined value that
    /// is live into `exit_block`, and reroute the exit's loop-closed joins
    /// (plus any other out-of-loop user) through the tracker state.
    ///
    /// Kill exits are skipped entirely: they only fire once no lane remains
    /// active, so every lane observes the final loop-carried values anyway,
    /// and plain dominance repair covers their live-outs.
    fn track_live_outs(&mut self, t: &mut LiveValueTracker, exit_block: Block) {
        assert!(
            !self.loops.contains(t.loop_id, exit_block),
            "loop exit block must lie outside the loop"
        );
        if self.divergence.is_kill_exit(exit_block) {
            return;
        }

        let phis = self.func.block_phis(exit_block);
        for phi in phis {
            let InstKind::Phi { incoming } = &self.func.insts[phi].kind else { unreachable!() };
            assert!(incoming.len() == 1, "not a loop-closed join at a loop exit");
            let (in_block, in_val) = incoming[0];
            assert!(
                self.loops.contains(t.loop_id, in_block),
                "loop-closed join input does not come from the loop"
            );

            // live-out values that aren't loop-carried need no tracking
            let Value::Inst(in_inst) = in_val else { continue };
            let def_block =
                self.func.defining_block(in_inst).expect("live-out instruction has no parent");
            if !self.loops.contains(t.loop_id, def_block) {
                continue;
            }

            let tracker = self.request_tracker(t, in_inst);
            self.add_tracker_update(t, tracker, in_val);

            let live_out = self.last_tracker_state(t, tracker);
            match &mut self.func.insts[phi].kind {
                InstKind::Phi { incoming } => incoming[0].1 = live_out,
                _ => unreachable!(),
            }
            self.replace_uses_outside_loop(t.loop_id, in_val, live_out);
        }
    }

    /// Rewrite out-of-loop uses of `old` to `new` (in-loop users, the
    /// tracker machinery included, keep the original value).
    fn replace_uses_outside_loop(&mut self, loop_id: LoopId, old: Value, new: Value) {
        let insts: Vec<Inst> = self.func.insts.keys().collect();
        for inst in insts {
            let Some(parent) = self.func.defining_block(inst) else { continue };
            if self.loops.contains(loop_id, parent) {
                continue;
            }
            self.func.replace_uses_in_inst(inst, old, new);
        }
        let blocks: Vec<Block> = self.func.live_blocks().collect();
        for block in blocks {
            if self.loops.contains(loop_id, block) {
                continue;
            }
            for input in &mut self.func.blocks[block].terminator.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    // Divergent-loop conversion.

    /// Replace `block`'s multi-way terminator with an unconditional edge to
    /// its successor inside the loop, discarding the exit edge.
    fn drop_loop_exit(&mut self, block: Block, loop_id: LoopId) {
        assert!(
            self.loops.contains(loop_id, block),
            "can not drop loop exit edge from block that is not in loop"
        );
        let term = &self.func.blocks[block].terminator;
        assert!(term.targets.len() > 1, "there must be an edge to drop here");

        let in_loop_succ = term
            .targets
            .iter()
            .copied()
            .find(|&succ| self.loops.contains(loop_id, succ))
            .expect("could not find successor within loop");

        self.func.blocks[block].terminator = ControlInst::branch(in_loop_succ);
        self.divergence.set_branch_shape(block, LaneShape::Uniform);
    }

    /// Convert a divergent loop from "may exit at any of several points, any
    /// iteration" to "iterates until no lane remains active, then takes one
    /// latch-guarded exit". Returns the relay of the retained exit.
    fn convert_to_single_exit_loop(
        &mut self,
        loop_id: LoopId,
        exit_relay: Option<RelayId>,
    ) -> RelayId {
        let header = self.loops.loop_def(loop_id).header;
        let latch = self.loops.loop_def(loop_id).latch;
        let header_id = self.index_of(header);
        let latch_id = self.index_of(latch);

        // the preheader is the lone predecessor of the header's pending relay
        let header_relay = self.relays.get(header_id).expect(
            "divergent loop header has no pending relay (the region entry cannot head a divergent loop)",
        );
        let placeholder = self.relays.node(header_relay).placeholder;
        let preheader = *self
            .func
            .predecessors(placeholder)
            .first()
            .expect("divergent loop has no preheader edge");

        let mut tracker =
            LiveValueTracker { loop_id, preheader, tracker_phis: FxIndexMap::default() };

        // create a relay chain visiting every exit block after the loop;
        // while at it, create trackers and latch blends for all live-outs
        let exit_blocks = self.loops.exit_blocks(self.func, loop_id);
        let mut loop_exit_relay = exit_relay;
        for &exit in &exit_blocks {
            let exit_id = self.index_of(exit);
            loop_exit_relay = Some(self.relays.add_target(self.func, loop_exit_relay, exit_id));

            // only consider exits of the current loop level (inner loops
            // were converted on their own)
            let exiting = self.exiting_block_for(loop_id, exit);
            if self.loops.innermost_loop_of(exiting) == Some(loop_id) {
                self.track_live_outs(&mut tracker, exit);
            }
        }
        let loop_exit_relay = loop_exit_relay.expect("divergent loop has no exits to convert");
        let kept_exit = self.block_at(self.relays.node(loop_exit_relay).target);

        // migrate loop-closed joins off the dropped exits: each join is
        // eliminated in favor of its (single) input, promoted to the latch
        // when its definition does not dominate the old exit
        for &exit in &exit_blocks {
            if exit == kept_exit {
                continue; // the retained exit keeps its joins
            }
            for phi in self.func.block_phis(exit) {
                let InstKind::Phi { incoming } = &self.func.insts[phi].kind else { unreachable!() };
                let incoming = incoming.clone();

                let mut replacements = vec![];
                for &(in_block, in_val) in &incoming {
                    assert!(
                        self.loops.contains(loop_id, in_block),
                        "not a loop-closed join at a dropped exit"
                    );
                    let promoted = match in_val {
                        // globally available, no repair needed
                        Value::Const(_) => in_val,
                        Value::Inst(in_inst) => {
                            let def_block = self
                                .func
                                .defining_block(in_inst)
                                .expect("live-out instruction has no parent");
                            if self.dom_tree.dominates(def_block, exit) {
                                // already dominates, and will keep doing so
                                // after the rewrite
                                in_val
                            } else {
                                let def_id = self.index_of(def_block);
                                assert!(
                                    header_id <= def_id && def_id <= latch_id,
                                    "non-dominating definition escapes its loop"
                                );
                                self.promote_definition(in_val, def_id, latch_id)
                            }
                        }
                    };
                    replacements.push(promoted);
                }
                let replacement = *replacements.first().expect("loop-closed join with no inputs");

                self.func.replace_all_uses(Value::Inst(phi), replacement);
                self.func.remove_inst(exit, phi);
                self.divergence.drop_shape(Value::Inst(phi));
            }
        }

        // drop all loop exiting edges, rerouting them inside the loop
        let mut exiting_blocks = vec![];
        for (exiting, _) in self.loops.exit_edges(self.func, loop_id) {
            if !exiting_blocks.contains(&exiting) {
                exiting_blocks.push(exiting);
            }
        }
        for exiting in exiting_blocks {
            self.drop_loop_exit(exiting, loop_id);
        }

        // the latch must be single-successor now, with the backedge intact
        {
            let latch_term = &self.func.blocks[latch].terminator;
            assert!(
                latch_term.kind == ControlInstKind::Branch && latch_term.targets[..] == [header],
                "converted loop lost its backedge"
            );
        }
        self.divergence.drop_branch_shape(latch);

        // if-any-lane-is-still-live exit branch, gated by a collective
        // reduction over the lanes continuing into the next iteration
        let live_mask = self.masks.exit_mask_to(latch, header);
        let live_pred = live_mask.request_pred_as_value(self.func);
        let any_live = self
            .func
            .push_inst(latch, InstDef { ty: Type::Bool, kind: InstKind::AnyLanes { pred: live_pred } });
        self.divergence.set_shape(Value::Inst(any_live), LaneShape::Uniform);

        let exit_placeholder = self.relays.node(loop_exit_relay).placeholder;
        self.func.blocks[latch].terminator =
            ControlInst::cond_branch(Value::Inst(any_live), header, exit_placeholder);

        // the loop and its latch exit are non-divergent from here on
        self.divergence.set_branch_shape(latch, LaneShape::Uniform);
        self.divergence.set_loop_divergence(header, false);

        // hand the new exit condition back to the mask analysis
        let combined = self.masks.combined_loop_exit_mask(header);
        let continue_mask = Mask::from_predicate(self.func, Value::Inst(any_live));
        self.masks.update_exit_masks(latch, header, kept_exit, continue_mask, combined);

        loop_exit_relay
    }

    // Phi-to-select lowering.

    /// A join "needs folding" if its current physical predecessor set
    /// differs at all from the set of blocks it has explicit inputs for
    /// (relaying can add predecessors the join never knew about, or remove
    /// ones it did).
    fn phi_needs_folding(&self, phi: Inst, block: Block) -> bool {
        let InstKind::Phi { incoming } = &self.func.insts[phi].kind else {
            unreachable!("leading instruction is not a join")
        };
        let preds = self.func.predecessors(block);

        // predecessors that are unknown to the join
        for &pred in &preds {
            if !incoming.iter().any(|&(in_block, _)| in_block == pred) {
                return true;
            }
        }
        // or recorded inputs whose blocks are no longer predecessors
        for &(in_block, _) in incoming {
            if !preds.contains(&in_block) {
                return true;
            }
        }
        false
    }

    /// Rewrite `block`'s joins into left-to-right select chains, each link
    /// gated by the per-edge mask of that predecessor, and redirect all uses
    /// to the final select.
    fn fold_phis(&mut self, block: Block) {
        // no joins, no folding
        let phis = self.func.block_phis(block);
        let Some(&first) = phis.first() else { return };
        if !self.phi_needs_folding(first, block) {
            return;
        }

        for phi in phis {
            let InstKind::Phi { incoming } = &self.func.insts[phi].kind else { unreachable!() };
            let incoming = incoming.clone();
            let ty = self.func.insts[phi].ty;
            let shape = self.divergence.shape_of(Value::Inst(phi));

            // the select chain goes right after the (remaining) joins, ahead
            // of any instruction that may use the join being replaced
            let mut cursor = self.func.blocks[block]
                .insts
                .iter()
                .position(|&inst| !matches!(self.func.insts[inst].kind, InstKind::Phi { .. }))
                .unwrap_or(self.func.blocks[block].insts.len());

            let mut folded = incoming[0].1;
            for &(in_block, in_val) in &incoming[1..] {
                let mask = self.edge_mask(in_block, block);
                let cond = mask.request_pred_as_value(self.func);
                let select = self.func.insts.define(InstDef {
                    ty,
                    kind: InstKind::Select { cond, on_true: in_val, on_false: folded },
                });
                self.func.blocks[block].insts.insert(cursor, select);
                cursor += 1;
                self.divergence.set_shape(Value::Inst(select), shape);
                folded = Value::Inst(select);
            }

            self.func.replace_all_uses(Value::Inst(phi), folded);
            self.func.remove_inst(block, phi);
            self.divergence.drop_shape(Value::Inst(phi));
        }
    }

    /// Attach undef inputs to `block`'s joins for any predecessor the
    /// relaying introduced that they do not record.
    fn add_undef_inputs(&mut self, block: Block) {
        let preds = self.func.predecessors(block);
        for phi in self.func.block_phis(block) {
            for &pred in &preds {
                let known = {
                    let InstKind::Phi { incoming } = &self.func.insts[phi].kind else {
                        unreachable!()
                    };
                    incoming.iter().any(|&(in_block, _)| in_block == pred)
                };
                if known {
                    continue;
                }
                let ty = self.func.insts[phi].ty;
                let undef = self.func.undef(ty);
                match &mut self.func.insts[phi].kind {
                    InstKind::Phi { incoming } => incoming.push((pred, undef)),
                    _ => unreachable!(),
                }
            }
        }
    }

    // The driver state machine.

    /// Forward every branch aimed at the relay placeholder of `target_id` to
    /// the now-ready real block, recompute that block's immediate dominator
    /// as the nearest common dominator of all incoming edges, migrate any
    /// instructions stranded in the placeholder, and delete it. Returns the
    /// relay of whatever still has to be executed after this block.
    fn emit_block(&mut self, target_id: usize) -> Option<RelayId> {
        let target = self.block_at(target_id);

        // advance all relays for the target; no relay means nothing to do
        let (placeholder, advanced) = self.relays.advance(target_id)?;

        // make all predecessors of the placeholder branch to the target instead
        let blocks: Vec<Block> = self.func.live_blocks().collect();
        for block in blocks {
            for slot in &mut self.func.blocks[block].terminator.targets {
                if *slot == placeholder {
                    *slot = target;
                }
            }
        }

        // dominator repair: least common dominator of all incoming branches
        let mut common_dom: Option<Block> = None;
        for pred in self.func.predecessors(target) {
            common_dom = Some(match common_dom {
                None => pred,
                Some(common) => self.dom_tree.nearest_common_dominator(common, pred),
            });
        }
        let common_dom = common_dom.expect("dominator repair did not reach a common dominator");
        self.dom_tree.set_idom(target, common_dom);

        // if any instructions are stranded in the placeholder, move them to
        // the front of the target
        let stranded = std::mem::take(&mut self.func.blocks[placeholder].insts);
        if !stranded.is_empty() {
            self.func.blocks[target].insts.splice(0..0, stranded);
        }

        self.func.detach_block(placeholder);

        // remaining targets to visit after this block
        advanced
    }

    /// Process the branch of an emitted block: extend/merge relay chains so
    /// that each successor (both of them, in topological order, for a folded
    /// divergent branch) is reached through a single physical edge.
    fn process_branch(&mut self, head: Block, exit_relay: Option<RelayId>) {
        let kind = self.func.blocks[head].terminator.kind;
        match kind {
            // a control sink ends processing for this path
            ControlInstKind::Unreachable | ControlInstKind::Return => {}

            ControlInstKind::Branch => {
                let next_block = self.func.blocks[head].terminator.targets[0];
                let next_id = self.index_of(next_block);
                let mask = self.masks.exit_mask(self.func, head, 0);
                self.set_edge_mask(head, next_block, mask);

                let relay = self.relays.add_target(self.func, exit_relay, next_id);
                self.func.blocks[head].terminator.targets[0] = self.relays.node(relay).placeholder;
            }

            ControlInstKind::CondBranch => {
                let targets = self.func.blocks[head].terminator.targets.clone();

                // order successors by global topological order
                let (first_pos, second_pos) =
                    if self.index_of(targets[0]) > self.index_of(targets[1]) {
                        (1, 0)
                    } else {
                        (0, 1)
                    };
                let first_block = targets[first_pos];
                let first_id = self.index_of(first_block);
                let second_block = targets[second_pos];
                let second_id = self.index_of(second_block);
                assert!(first_id > 0 && second_id > 0, "branch leaves the region");

                // whether this branch must be eliminated from the CFG
                let must_fold = self.needs_folding(head);

                // track exit masks
                let first_mask = self.masks.exit_mask(self.func, head, first_pos);
                let second_mask = self.masks.exit_mask(self.func, head, second_pos);
                self.set_edge_mask(head, first_block, first_mask);
                self.set_edge_mask(head, second_block, second_mask);

                // if this branch is folded, the second block is a must-have
                // after the first
                let mut first_relay = self.relays.add_target(self.func, exit_relay, first_id);
                if must_fold {
                    first_relay = self.relays.add_target(self.func, Some(first_relay), second_id);
                    self.func.blocks[head].terminator.targets[second_pos] =
                        self.relays.node(first_relay).placeholder;
                }

                // relay the first edge to the head of the merged chain
                self.func.blocks[head].terminator.targets[first_pos] =
                    self.relays.node(first_relay).placeholder;

                // if there is no relay for the second block yet, every path
                // to it will go through the first one after the
                // transformation: patch its immediate dominator
                if self.dom_tree.dominates(head, second_block)
                    && self.relays.get(second_id).is_none()
                {
                    self.dom_tree.set_idom(second_block, first_block);
                }

                let second_relay = self.relays.add_target(self.func, exit_relay, second_id);
                if !must_fold {
                    self.func.blocks[head].terminator.targets[second_pos] =
                        self.relays.node(second_relay).placeholder;
                }

                // folded branches no longer represent divergent control flow
                self.divergence.set_branch_shape(head, LaneShape::Uniform);
            }
        }
    }

    /// Process one block index: emit, fold joins, extend relays; or, when a
    /// loop starts here, hand the whole index range of that loop off to loop
    /// processing. Returns the next index to process.
    fn process_block(&mut self, head_id: usize, parent_loop: Option<LoopId>) -> usize {
        let head = self.block_at(head_id);

        // descend into a loop, if any
        let loop_of_head = self.loops.innermost_loop_of(head);
        if loop_of_head != parent_loop {
            let entered = loop_of_head.expect("range processing escaped the active loop");
            return self.process_loop(head_id, entered);
        }

        // all dependencies satisfied -> emit this block
        let advanced_exit_relay = self.emit_block(head_id);

        // convert joins to selects
        self.fold_phis(head);

        // materialize all relays
        self.process_branch(head, advanced_exit_relay);

        head_id + 1
    }

    fn process_range(&mut self, start_id: usize, end_id: usize, parent_loop: Option<LoopId>) -> usize {
        let mut i = start_id;
        while i < end_id {
            if let Some(l) = parent_loop {
                assert!(
                    self.loops.contains(l, self.block_at(i)),
                    "range processing escaped the active loop"
                );
            }
            i = self.process_block(i, parent_loop);
        }
        assert_eq!(i, end_id, "block processing overshot its range");
        end_id
    }

    /// Process a whole loop: convert it first if divergent, emit its body
    /// range, then the latch (without descending into its successors), then
    /// re-emit the header to settle the backedge. Returns the index after
    /// the latch.
    fn process_loop(&mut self, head_id: usize, loop_id: LoopId) -> usize {
        let header = self.block_at(head_id);
        assert!(
            self.loops.loop_def(loop_id).header == header,
            "not actually the header of the loop"
        );
        let latch = self.loops.loop_def(loop_id).latch;
        let latch_id = self.index_of(latch);

        if self.divergence.is_divergent_loop(header) {
            // inherited relays from the preheader edge: all pending targets
            // except the loop header itself
            let exit_relay = self.relays.get(head_id).and_then(|relay| self.relays.node(relay).next);

            // convert the loop into a non-divergent form
            self.convert_to_single_exit_loop(loop_id, exit_relay);
        }

        // emit all blocks within the loop (except the latch)
        let latch_node_id = self.process_range(head_id, latch_id, Some(loop_id));

        // now emit the latch (without descending into its successors)
        self.emit_block(latch_id);
        self.fold_phis(latch);

        // emit the loop header again to re-wire the latch to the header
        self.emit_block(head_id);

        // attach undef inputs for all relay-introduced preheader edges
        self.add_undef_inputs(header);

        latch_node_id + 1 // continue after the latch
    }

    fn linearize_control(&mut self) {
        let last_id = self.process_range(0, self.num_blocks(), None);
        assert_eq!(last_id, self.num_blocks(), "linearization did not cover the whole region");
    }

    /// Collapse terminators whose surviving successors all alias the same
    /// target (folding can leave `br cond X, X` behind).
    fn cleanup(&mut self) {
        assert!(self.relays.pending_is_empty(), "unemitted relay targets remain after linearization");

        for id in 0..self.num_blocks() {
            let block = self.block_at(id);
            let term = &self.func.blocks[block].terminator;
            if term.targets.len() <= 1 {
                continue; // already as simple as it gets
            }
            let single_succ = term.targets[0];
            if term.targets.iter().all(|&t| t == single_succ) {
                self.func.blocks[block].terminator = ControlInst::branch(single_succ);
                self.divergence.set_branch_shape(block, LaneShape::Uniform);
            }
        }
    }

    /// Post-pass validation (fatal on violation): every terminator uniform,
    /// no loop still divergent, every join consistent with its predecessors,
    /// and the dominator tree equal to a full re-derivation.
    fn verify(&self) {
        for id in 0..self.num_blocks() {
            let block = self.block_at(id);

            assert!(!self.needs_folding(block), "divergent terminator survived linearization at {block}");

            if let Some(l) = self.loops.innermost_loop_of(block) {
                if self.loops.loop_def(l).header == block {
                    assert!(
                        !self.divergence.is_divergent_loop(block),
                        "loop at {block} is still marked divergent"
                    );
                }
            }

            for phi in self.func.block_phis(block) {
                assert!(
                    !self.phi_needs_folding(phi, block),
                    "join at {block} records inputs inconsistent with its predecessors"
                );
            }
        }

        // check whether the on-the-fly dominator repair worked
        self.dom_tree.verify(self.func, self.region);
    }
}
