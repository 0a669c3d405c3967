//! End-to-end tests over the public API: mask algebra, CFG analyses, and the
//! three canonical linearization scenarios (unconditional chain, divergent
//! diamond, divergent single-latch loop).

use laneflow::cfg::{DominatorTree, LoopForest, Region};
use laneflow::divergence::{DivergenceInfo, LaneShape};
use laneflow::linearize::linearize_region;
use laneflow::mask::{Mask, MaskAnalysis};
use laneflow::print::func_to_string;
use laneflow::{
    BinOp, Block, ConstKind, ControlInst, ControlInstKind, FuncBody, InstDef, InstKind, Type, Value,
};

fn binary(func: &mut FuncBody, block: Block, ty: Type, op: BinOp, lhs: Value, rhs: Value) -> Value {
    Value::Inst(func.push_inst(block, InstDef { ty, kind: InstKind::Binary { op, lhs, rhs } }))
}

fn phi(func: &mut FuncBody, block: Block, ty: Type, incoming: &[(Block, Value)]) -> Value {
    Value::Inst(func.prepend_phi(
        block,
        InstDef { ty, kind: InstKind::Phi { incoming: incoming.iter().copied().collect() } },
    ))
}

/// Pre-pass analyses for a whole-function region.
fn analyses(func: &FuncBody) -> (Region, LoopForest, DominatorTree) {
    let region = Region::whole_function(func);
    let loops = LoopForest::compute(func, &region);
    let dom_tree = DominatorTree::compute(func, &region);
    (region, loops, dom_tree)
}

#[test]
fn mask_algebra() {
    let mut func = FuncBody::new();

    // canonical all-true: both fields absent
    let all_true = Mask::all_true();
    assert!(all_true.known_all_true());
    assert!(all_true.predicate().is_none());
    assert!(all_true.active_length().is_none());

    // materializing the all-true predicate yields a true constant
    let pred = all_true.request_pred_as_value(&mut func);
    assert!(func.is_const_kind(pred, ConstKind::Bool(true)));

    // a zero active length is known-all-false
    let zero = func.const_int(Type::Int32, 0);
    assert!(Mask::from_active_length(zero).known_all_false(&func));
    assert!(Mask::all_false(&mut func).known_all_false(&func));

    // constant-true predicates normalize to the canonical all-true mask
    let true_const = func.const_bool(true);
    assert_eq!(Mask::from_predicate(&func, true_const), Mask::all_true());

    // a real predicate is neither known-all-true nor known-all-false, and
    // equality is structural
    let one = func.const_int(Type::Int32, 1);
    let entry = func.entry;
    let cond = binary(&mut func, entry, Type::Bool, BinOp::CmpLt, zero, one);
    let mask = Mask::from_predicate(&func, cond);
    assert!(!mask.known_all_true());
    assert!(!mask.known_all_false(&func));
    assert_eq!(mask.request_pred_as_value(&mut func), cond);
    assert_eq!(mask, Mask::from_predicate(&func, cond));
    assert_ne!(mask, Mask::all_true());
}

#[test]
fn loop_forest_and_dominators() {
    // a -> h; h -> {b, x}; b -> l; l -> h; the loop is {h, b, l}
    let mut func = FuncBody::new();
    let a = func.entry;
    let h = func.add_block();
    let b = func.add_block();
    let l = func.add_block();
    let x = func.add_block();

    let zero = func.const_int(Type::Int32, 0);
    let one = func.const_int(Type::Int32, 1);
    let cond = binary(&mut func, h, Type::Bool, BinOp::CmpLt, zero, one);

    func.blocks[a].terminator = ControlInst::branch(h);
    func.blocks[h].terminator = ControlInst::cond_branch(cond, b, x);
    func.blocks[b].terminator = ControlInst::branch(l);
    func.blocks[l].terminator = ControlInst::branch(h);
    func.blocks[x].terminator = ControlInst::ret(None);

    let region = Region::whole_function(&func);
    let loops = LoopForest::compute(&func, &region);

    let ids: Vec<_> = loops.all_loops().collect();
    assert_eq!(ids.len(), 1);
    let the_loop = ids[0];
    assert_eq!(loops.loop_def(the_loop).header, h);
    assert_eq!(loops.loop_def(the_loop).latch, l);
    for block in [h, b, l] {
        assert_eq!(loops.innermost_loop_of(block), Some(the_loop));
        assert!(loops.contains(the_loop, block));
    }
    assert_eq!(loops.innermost_loop_of(a), None);
    assert_eq!(loops.innermost_loop_of(x), None);
    assert_eq!(loops.exit_blocks(&func, the_loop), vec![x]);
    assert_eq!(loops.exit_edges(&func, the_loop), vec![(h, x)]);

    let dom_tree = DominatorTree::compute(&func, &region);
    assert_eq!(dom_tree.idom(a), None);
    assert_eq!(dom_tree.idom(h), Some(a));
    assert_eq!(dom_tree.idom(b), Some(h));
    assert_eq!(dom_tree.idom(l), Some(b));
    assert_eq!(dom_tree.idom(x), Some(h));
    assert!(dom_tree.dominates(h, l));
    assert!(dom_tree.dominates(h, h));
    assert!(!dom_tree.dominates(b, x));
    assert_eq!(dom_tree.nearest_common_dominator(l, x), h);
    assert_eq!(dom_tree.nearest_common_dominator(b, l), b);
    dom_tree.verify(&func, &region);
}

#[test]
fn nested_loop_forest() {
    // a -> h1; h1 -> h2; h2 -> b2; b2 -> {h2, l1}; l1 -> {h1, x}; x: return
    let mut func = FuncBody::new();
    let a = func.entry;
    let h1 = func.add_block();
    let h2 = func.add_block();
    let b2 = func.add_block();
    let l1 = func.add_block();
    let x = func.add_block();

    let zero = func.const_int(Type::Int32, 0);
    let one = func.const_int(Type::Int32, 1);
    let inner_cond = binary(&mut func, b2, Type::Bool, BinOp::CmpLt, zero, one);
    let outer_cond = binary(&mut func, l1, Type::Bool, BinOp::CmpLt, zero, one);

    func.blocks[a].terminator = ControlInst::branch(h1);
    func.blocks[h1].terminator = ControlInst::branch(h2);
    func.blocks[h2].terminator = ControlInst::branch(b2);
    func.blocks[b2].terminator = ControlInst::cond_branch(inner_cond, h2, l1);
    func.blocks[l1].terminator = ControlInst::cond_branch(outer_cond, h1, x);
    func.blocks[x].terminator = ControlInst::ret(None);

    let region = Region::whole_function(&func);
    let loops = LoopForest::compute(&func, &region);

    assert_eq!(loops.all_loops().count(), 2);
    let outer = loops.innermost_loop_of(h1).unwrap();
    let inner = loops.innermost_loop_of(h2).unwrap();
    assert_ne!(outer, inner);
    assert_eq!(loops.loop_def(outer).header, h1);
    assert_eq!(loops.loop_def(outer).latch, l1);
    assert_eq!(loops.loop_def(inner).header, h2);
    assert_eq!(loops.loop_def(inner).latch, b2);
    assert_eq!(loops.loop_def(inner).parent, Some(outer));
    assert_eq!(loops.loop_def(outer).children, vec![inner]);
    assert!(loops.contains(outer, b2));
    assert_eq!(loops.roots().collect::<Vec<_>>(), vec![outer]);
}

#[test]
fn unconditional_chain() {
    let mut func = FuncBody::new();
    let a = func.entry;
    let b = func.add_block();
    let c = func.add_block();
    func.blocks[a].terminator = ControlInst::branch(b);
    func.blocks[b].terminator = ControlInst::branch(c);
    func.blocks[c].terminator = ControlInst::ret(None);

    let (region, loops, mut dom_tree) = analyses(&func);
    let mut divergence = DivergenceInfo::new();
    let mut masks = MaskAnalysis::new();

    let order = linearize_region(&mut func, &region, &loops, &mut divergence, &mut masks, &mut dom_tree);
    assert_eq!(order, vec![a, b, c]);

    // the chain comes out structurally unchanged
    assert_eq!(func.blocks[a].terminator.kind, ControlInstKind::Branch);
    assert_eq!(func.blocks[a].terminator.targets[..], [b]);
    assert_eq!(func.blocks[b].terminator.targets[..], [c]);
    assert_eq!(func.blocks[c].terminator.kind, ControlInstKind::Return);
    assert_eq!(dom_tree.idom(b), Some(a));
    assert_eq!(dom_tree.idom(c), Some(b));

    assert_eq!(
        func_to_string(&func),
        "b0: (entry)\n  br b1\nb1:\n  br b2\nb2:\n  return\n"
    );
}

/// Builds `a -> {b, c} -> d` with a per-lane branch condition, plus edge
/// masks for all four edges. Returns the blocks and the values of interest.
struct Diamond {
    func: FuncBody,
    a: Block,
    b: Block,
    c: Block,
    d: Block,
    cond: Value,
    vb: Value,
    vc: Value,
    join: Value,
    masks: MaskAnalysis,
}

fn build_diamond() -> Diamond {
    let mut func = FuncBody::new();
    let a = func.entry;
    let b = func.add_block();
    let c = func.add_block();
    let d = func.add_block();

    let zero = func.const_int(Type::Int32, 0);
    let one = func.const_int(Type::Int32, 1);
    let true_const = func.const_bool(true);

    let cond = binary(&mut func, a, Type::Bool, BinOp::CmpLt, zero, one);
    let not_cond = binary(&mut func, a, Type::Bool, BinOp::Xor, cond, true_const);
    let vb = binary(&mut func, b, Type::Int32, BinOp::Add, zero, one);
    let vc = binary(&mut func, c, Type::Int32, BinOp::Mul, one, one);
    let join = phi(&mut func, d, Type::Int32, &[(c, vc), (b, vb)]);

    func.blocks[a].terminator = ControlInst::cond_branch(cond, b, c);
    func.blocks[b].terminator = ControlInst::branch(d);
    func.blocks[c].terminator = ControlInst::branch(d);
    func.blocks[d].terminator = ControlInst::ret(Some(join));

    let mut masks = MaskAnalysis::new();
    masks.set_edge_mask(a, b, Mask::from_predicate(&func, cond));
    masks.set_edge_mask(a, c, Mask::from_predicate(&func, not_cond));
    masks.set_edge_mask(b, d, Mask::from_predicate(&func, cond));
    masks.set_edge_mask(c, d, Mask::from_predicate(&func, not_cond));

    Diamond { func, a, b, c, d, cond, vb, vc, join, masks }
}

#[test]
fn divergent_diamond() {
    let Diamond { mut func, a, b, c, d, cond, vb, vc, join, mut masks } = build_diamond();

    let mut divergence = DivergenceInfo::new();
    divergence.set_shape(cond, LaneShape::Varying);
    divergence.set_shape(join, LaneShape::Varying);
    divergence.set_branch_shape(a, LaneShape::Varying);

    let (region, loops, mut dom_tree) = analyses(&func);
    let order = linearize_region(&mut func, &region, &loops, &mut divergence, &mut masks, &mut dom_tree);

    // both arms are visited strictly between the branch and the join
    assert_eq!(order, vec![a, b, c, d]);
    assert_eq!(func.blocks[a].terminator.kind, ControlInstKind::Branch);
    assert_eq!(func.blocks[a].terminator.targets[..], [b]);
    assert_eq!(func.blocks[b].terminator.targets[..], [c]);
    assert_eq!(func.blocks[c].terminator.targets[..], [d]);
    assert!(divergence.branch_shape(a).is_uniform());

    // the join became a single select gated by b's edge mask, carrying the
    // join's divergence shape
    assert_eq!(func.blocks[d].insts.len(), 1);
    let select = func.blocks[d].insts[0];
    match &func.insts[select].kind {
        InstKind::Select { cond: sel_cond, on_true, on_false } => {
            assert_eq!(*sel_cond, cond);
            assert_eq!(*on_true, vb);
            assert_eq!(*on_false, vc);
        }
        _ => panic!("join was not lowered to a select"),
    }
    assert_eq!(divergence.shape_of(Value::Inst(select)), LaneShape::Varying);
    assert_eq!(func.blocks[d].terminator.inputs[0], Value::Inst(select));

    // dominance follows the linear schedule, and the incremental repair
    // matches a from-scratch recomputation
    assert_eq!(dom_tree.idom(b), Some(a));
    assert_eq!(dom_tree.idom(c), Some(b));
    assert_eq!(dom_tree.idom(d), Some(c));
    let fresh = DominatorTree::compute(&func, &region);
    for &block in &order {
        assert_eq!(dom_tree.idom(block), fresh.idom(block));
    }
}

#[test]
fn uniform_diamond_keeps_its_branch() {
    let Diamond { mut func, a, b, c, d, cond, join, mut masks, .. } = build_diamond();

    // no divergence anywhere: the conditional keeps its semantics
    let mut divergence = DivergenceInfo::new();
    let (region, loops, mut dom_tree) = analyses(&func);
    let order = linearize_region(&mut func, &region, &loops, &mut divergence, &mut masks, &mut dom_tree);

    assert_eq!(order, vec![a, b, c, d]);
    assert_eq!(func.blocks[a].terminator.kind, ControlInstKind::CondBranch);
    assert_eq!(func.blocks[a].terminator.inputs[0], cond);
    assert_eq!(func.blocks[a].terminator.targets[..], [b, c]);

    // the join survives, still consistent with its (unchanged) predecessors
    let Value::Inst(join_inst) = join else { unreachable!() };
    assert!(matches!(func.insts[join_inst].kind, InstKind::Phi { .. }));
    assert_eq!(func.blocks[d].insts[..], [join_inst]);
    assert_eq!(dom_tree.idom(d), Some(a));
}

#[test]
fn index_validity_and_loop_contiguity() {
    // nested uniform loops: the index must keep each loop contiguous
    // (header first, latch last) and topological outside of backedges
    let mut func = FuncBody::new();
    let a = func.entry;
    let h1 = func.add_block();
    let h2 = func.add_block();
    let b2 = func.add_block();
    let l1 = func.add_block();
    let x = func.add_block();

    let zero = func.const_int(Type::Int32, 0);
    let one = func.const_int(Type::Int32, 1);
    let inner_cond = binary(&mut func, b2, Type::Bool, BinOp::CmpLt, zero, one);
    let outer_cond = binary(&mut func, l1, Type::Bool, BinOp::CmpLt, zero, one);

    func.blocks[a].terminator = ControlInst::branch(h1);
    func.blocks[h1].terminator = ControlInst::branch(h2);
    func.blocks[h2].terminator = ControlInst::branch(b2);
    func.blocks[b2].terminator = ControlInst::cond_branch(inner_cond, h2, l1);
    func.blocks[l1].terminator = ControlInst::cond_branch(outer_cond, h1, x);
    func.blocks[x].terminator = ControlInst::ret(None);

    // capture the original edges before the pass rewires anything
    let blocks = [a, h1, h2, b2, l1, x];
    let mut orig_edges = vec![];
    for &block in &blocks {
        for succ in func.successors(block) {
            orig_edges.push((block, succ));
        }
    }

    let (region, loops, mut dom_tree) = analyses(&func);
    let mut divergence = DivergenceInfo::new();
    let mut masks = MaskAnalysis::new();
    let order = linearize_region(&mut func, &region, &loops, &mut divergence, &mut masks, &mut dom_tree);

    assert_eq!(order, vec![a, h1, h2, b2, l1, x]);
    let pos = |block: Block| order.iter().position(|&o| o == block).unwrap();

    // index validity: every original edge goes forward, except backedges
    // into a loop header
    for (from, to) in orig_edges {
        let is_backedge = loops
            .innermost_loop_of(to)
            .is_some_and(|l| loops.loop_def(l).header == to && loops.contains(l, from));
        if is_backedge {
            assert!(pos(from) >= pos(to));
        } else {
            assert!(pos(from) < pos(to), "edge {from} -> {to} goes backwards");
        }
    }

    // loop contiguity: exactly the range [header, latch], nothing else
    for l in loops.all_loops() {
        let def = loops.loop_def(l);
        let ids: Vec<usize> = def.blocks.iter().map(|&block| pos(block)).collect();
        let start = *ids.iter().min().unwrap();
        let end = *ids.iter().max().unwrap();
        assert_eq!(start, pos(def.header));
        assert_eq!(end, pos(def.latch));
        assert_eq!(end - start + 1, def.blocks.len());
    }
}

#[test]
fn divergent_single_latch_loop() {
    // loop {h, b, l} with two exits: h -> k (kill: only taken once no lanes
    // remain) and b -> e (interior divergent exit, with a live-out value)
    //
    //   a -> h
    //   h:  i = phi [a: 0], [l: i_next];  c1 = i < 10;  br c1 ? b : k
    //   b:  v = i * 2;  c2 = v == 42;  (cm, ln defined here too)  br c2 ? e : l
    //   l:  i_next = i + 1;  br h
    //   k:  br r
    //   e:  lcv = phi [b: v];  br r
    //   r:  return lcv
    let mut func = FuncBody::new();
    let a = func.entry;
    let h = func.add_block();
    let b = func.add_block();
    let l = func.add_block();
    let k = func.add_block();
    let e = func.add_block();
    let r = func.add_block();

    let zero = func.const_int(Type::Int32, 0);
    let one = func.const_int(Type::Int32, 1);
    let two = func.const_int(Type::Int32, 2);
    let ten = func.const_int(Type::Int32, 10);
    let forty_two = func.const_int(Type::Int32, 42);
    let true_const = func.const_bool(true);

    let i = phi(&mut func, h, Type::Int32, &[(a, zero)]);
    let c1 = binary(&mut func, h, Type::Bool, BinOp::CmpLt, i, ten);

    let v = binary(&mut func, b, Type::Int32, BinOp::Mul, i, two);
    let c2 = binary(&mut func, b, Type::Bool, BinOp::CmpEq, v, forty_two);
    // combined exit condition (either exit fires) and its complement
    let not_c1 = binary(&mut func, b, Type::Bool, BinOp::Xor, c1, true_const);
    let cm = binary(&mut func, b, Type::Bool, BinOp::Or, c2, not_c1);
    let ln = binary(&mut func, b, Type::Bool, BinOp::Xor, cm, true_const);

    let i_next = binary(&mut func, l, Type::Int32, BinOp::Add, i, one);
    let Value::Inst(i_phi) = i else { unreachable!() };
    match &mut func.insts[i_phi].kind {
        InstKind::Phi { incoming } => incoming.push((l, i_next)),
        _ => unreachable!(),
    }

    let lcv = phi(&mut func, e, Type::Int32, &[(b, v)]);

    func.blocks[a].terminator = ControlInst::branch(h);
    func.blocks[h].terminator = ControlInst::cond_branch(c1, b, k);
    func.blocks[b].terminator = ControlInst::cond_branch(c2, e, l);
    func.blocks[l].terminator = ControlInst::branch(h);
    func.blocks[k].terminator = ControlInst::branch(r);
    func.blocks[e].terminator = ControlInst::branch(r);
    func.blocks[r].terminator = ControlInst::ret(Some(lcv));

    let mut divergence = DivergenceInfo::new();
    divergence.set_shape(i, LaneShape::Varying);
    divergence.set_shape(v, LaneShape::Varying);
    divergence.set_shape(c2, LaneShape::Varying);
    divergence.set_shape(cm, LaneShape::Varying);
    divergence.set_shape(ln, LaneShape::Varying);
    divergence.set_shape(lcv, LaneShape::Varying);
    divergence.set_branch_shape(h, LaneShape::Varying);
    divergence.set_branch_shape(b, LaneShape::Varying);
    divergence.set_loop_divergence(h, true);
    divergence.add_divergent_loop_exit(e); // k stays a kill exit

    let mut masks = MaskAnalysis::new();
    masks.set_combined_loop_exit_mask(h, Mask::from_predicate(&func, cm));
    masks.set_edge_mask(l, h, Mask::from_predicate(&func, ln));
    masks.set_edge_mask(b, e, Mask::from_predicate(&func, c2));

    let (region, loops, mut dom_tree) = analyses(&func);
    let the_loop = loops.innermost_loop_of(h).unwrap();
    assert_eq!(loops.loop_def(the_loop).latch, l);

    let order = linearize_region(&mut func, &region, &loops, &mut divergence, &mut masks, &mut dom_tree);
    assert_eq!(order, vec![a, h, b, l, k, e, r]);

    // exactly one exit left, guarded at the latch by the "any lane still
    // live" reduction
    assert_eq!(func.blocks[l].terminator.kind, ControlInstKind::CondBranch);
    assert_eq!(func.blocks[l].terminator.targets[..], [h, k]);
    let Value::Inst(latch_cond) = func.blocks[l].terminator.inputs[0] else {
        panic!("latch branch lost its condition")
    };
    match &func.insts[latch_cond].kind {
        InstKind::AnyLanes { pred } => assert_eq!(*pred, ln),
        _ => panic!("latch exit is not gated by the collective reduction"),
    }
    assert_eq!(divergence.shape_of(Value::Inst(latch_cond)), LaneShape::Uniform);

    // the loop (and every terminator) is non-divergent now
    assert!(!divergence.is_divergent_loop(h));
    assert!(divergence.branch_shape(h).is_uniform());
    assert!(divergence.branch_shape(b).is_uniform());
    assert!(divergence.branch_shape(l).is_uniform());

    // the old in-loop exits were redirected inside the loop
    assert_eq!(func.blocks[h].terminator.targets[..], [b]);
    assert_eq!(func.blocks[b].terminator.targets[..], [l]);

    // the dropped divergent exit is still visited, between the kept exit
    // and the rest of the schedule
    assert_eq!(func.blocks[k].terminator.targets[..], [e]);
    assert_eq!(func.blocks[e].terminator.targets[..], [r]);

    // the loop-closed join at the dropped exit is gone; its value is
    // readable through the tracker's latch blend instead
    assert!(func.blocks[e].insts.is_empty());
    let Value::Inst(ret_val) = func.blocks[r].terminator.inputs[0] else {
        panic!("return lost its operand")
    };
    let (update_on_true, update_on_false) = match &func.insts[ret_val].kind {
        InstKind::Select { cond, on_true, on_false } => {
            assert_eq!(*cond, cm);
            (*on_true, *on_false)
        }
        _ => panic!("live-out was not rerouted through a tracker blend"),
    };
    assert_eq!(update_on_true, v);

    // the tracker join sits in the header: seeded undef from the preheader,
    // fed by the latch blend on the backedge
    let header_phis = func.block_phis(h);
    assert_eq!(header_phis.len(), 2);
    let tracker = header_phis[0]; // prepended ahead of the `i` join
    let InstKind::Phi { incoming } = &func.insts[tracker].kind else { unreachable!() };
    assert_eq!(incoming.len(), 2);
    assert_eq!(incoming[0].0, a);
    assert!(func.is_const_kind(incoming[0].1, ConstKind::Undef));
    assert_eq!(incoming[1], (l, Value::Inst(ret_val)));
    assert_eq!(update_on_false, Value::Inst(tracker));

    // the `i` join is untouched
    assert_eq!(header_phis[1], i_phi);

    // dominance is the linear chain, and survives a full recomputation
    let expected = [(h, a), (b, h), (l, b), (k, l), (e, k), (r, e)];
    for (block, idom) in expected {
        assert_eq!(dom_tree.idom(block), Some(idom), "idom of {block}");
    }
    let fresh = DominatorTree::compute(&func, &region);
    for &block in &order {
        assert_eq!(dom_tree.idom(block), fresh.idom(block));
    }

    // join consistency: the header joins record exactly their predecessors
    let preds = func.predecessors(h);
    for phi in func.block_phis(h) {
        let InstKind::Phi { incoming } = &func.insts[phi].kind else { unreachable!() };
        let mut input_blocks: Vec<Block> = incoming.iter().map(|&(block, _)| block).collect();
        input_blocks.sort();
        let mut sorted_preds = preds.clone();
        sorted_preds.sort();
        assert_eq!(input_blocks, sorted_preds);
    }
}
