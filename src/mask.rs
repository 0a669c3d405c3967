//! Masks (per-edge execution predicates) and the mask-analysis service the
//! linearizer consumes and updates.

use crate::{Block, ConstKind, FuncBody, FxIndexMap, Type, Value};

/// The condition under which a lane executes a given block/edge: an optional
/// boolean predicate paired with an optional active-length bound.
///
/// Both fields absent is the canonical all-true mask. Equality is structural
/// (same underlying values).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mask {
    predicate: Option<Value>,
    active_length: Option<Value>,
}

impl Mask {
    /// The canonical all-true mask: no predicate, no length bound.
    pub fn all_true() -> Self {
        Self { predicate: None, active_length: None }
    }

    /// Mask from a predicate value, normalized so that a constant-true
    /// predicate becomes the canonical all-true mask.
    pub fn from_predicate(func: &FuncBody, pred: Value) -> Self {
        if func.is_const_kind(pred, ConstKind::Bool(true)) {
            return Self::all_true();
        }
        Self { predicate: Some(pred), active_length: None }
    }

    pub fn from_active_length(len: Value) -> Self {
        Self { predicate: None, active_length: Some(len) }
    }

    /// All-false, canonically expressed as a zero active length.
    pub fn all_false(func: &mut FuncBody) -> Self {
        let zero = func.const_int(Type::Int32, 0);
        Self::from_active_length(zero)
    }

    pub fn predicate(&self) -> Option<Value> {
        self.predicate
    }

    pub fn active_length(&self) -> Option<Value> {
        self.active_length
    }

    pub fn known_all_true(&self) -> bool {
        self.predicate.is_none() && self.active_length.is_none()
    }

    pub fn known_all_false(&self, func: &FuncBody) -> bool {
        if let Some(len) = self.active_length {
            if func.is_const_kind(len, ConstKind::Int(0)) {
                return true;
            }
        }
        if let Some(pred) = self.predicate {
            if func.is_const_kind(pred, ConstKind::Bool(false)) {
                return true;
            }
        }
        // Don't know.
        false
    }

    /// The predicate as an explicit value (constant true when absent).
    pub fn request_pred_as_value(&self, func: &mut FuncBody) -> Value {
        match self.predicate {
            Some(pred) => pred,
            None => func.const_bool(true),
        }
    }

    /// The active length as an explicit value (-1, i.e. "whole vector", when
    /// absent).
    pub fn request_len_as_value(&self, func: &mut FuncBody) -> Value {
        match self.active_length {
            Some(len) => len,
            None => func.const_int(Type::Int32, -1),
        }
    }
}

/// Per-edge and per-loop mask information.
///
/// Populated by the (external) mask analysis before linearization; keyed by
/// `(source, destination)` block pairs so lookups stay valid while the
/// linearizer rewrites terminators in place. The linearizer pushes the new
/// single-exit loop masks back in via [`MaskAnalysis::update_exit_masks`].
#[derive(Default)]
pub struct MaskAnalysis {
    edge_masks: FxIndexMap<(Block, Block), Mask>,

    /// Disjunction of all original exit predicates of a loop, keyed by
    /// header: true in every lane that leaves the loop this iteration.
    combined_loop_exit: FxIndexMap<Block, Mask>,
}

impl MaskAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_edge_mask(&mut self, from: Block, to: Block, mask: Mask) {
        self.edge_masks.insert((from, to), mask);
    }

    /// Mask of the edge from `block` to its `succ_idx`-th successor.
    /// Unannotated edges degrade to the all-true mask (the unconditional
    /// exit of the block).
    pub fn exit_mask(&self, func: &FuncBody, block: Block, succ_idx: usize) -> Mask {
        let target = func.blocks[block].terminator.targets[succ_idx];
        self.exit_mask_to(block, target)
    }

    pub fn exit_mask_to(&self, from: Block, to: Block) -> Mask {
        self.edge_masks.get(&(from, to)).copied().unwrap_or_else(Mask::all_true)
    }

    pub fn set_combined_loop_exit_mask(&mut self, header: Block, mask: Mask) {
        self.combined_loop_exit.insert(header, mask);
    }

    /// The combined ("any lane leaves this iteration") exit mask of the loop
    /// headed by `header`. Required for every divergent loop; its absence is
    /// an upstream analysis bug.
    pub fn combined_loop_exit_mask(&self, header: Block) -> Mask {
        *self
            .combined_loop_exit
            .get(&header)
            .unwrap_or_else(|| panic!("mask analysis has no combined exit mask for loop at {header}"))
    }

    /// Record the masks of the rewritten latch of a converted loop: the
    /// backedge now carries the uniform "any lane still live" condition, and
    /// the unique exit carries the combined exit mask.
    pub fn update_exit_masks(
        &mut self,
        latch: Block,
        header: Block,
        exit: Block,
        continue_mask: Mask,
        exit_mask: Mask,
    ) {
        self.set_edge_mask(latch, header, continue_mask);
        self.set_edge_mask(latch, exit, exit_mask);
    }
}
