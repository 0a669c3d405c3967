//! Lane-divergence annotations, supplied by an external divergence analysis
//! and treated as authoritative by the linearizer.

use crate::{Block, EntityOrientedDenseMap, FxIndexMap, FxIndexSet, Value};

/// How a value varies across SIMD lanes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LaneShape {
    /// Guaranteed identical across all lanes (the "safe" classification).
    Uniform,

    /// `base + lane * stride` for the given stride; still divergent for
    /// control purposes, but affine enough for downstream addressing.
    Strided(i64),

    /// No known relation between lanes.
    Varying,
}

impl LaneShape {
    pub fn is_uniform(self) -> bool {
        matches!(self, Self::Uniform)
    }
}

/// Per-value / per-block divergence classification for one region.
///
/// The linearizer reads this as ground truth (a branch "needs folding" iff
/// its condition is not classified uniform), and writes back the uniformity
/// it establishes (folded branches, converted loops).
#[derive(Default)]
pub struct DivergenceInfo {
    /// Value shapes; unannotated values (constants in particular) default to
    /// [`LaneShape::Uniform`].
    shapes: FxIndexMap<Value, LaneShape>,

    /// Shape of each block's terminator (the branch condition as observed
    /// across lanes).
    branch_shapes: EntityOrientedDenseMap<Block, LaneShape>,

    /// Headers of loops with lane-dependent trip counts.
    divergent_loops: FxIndexSet<Block>,

    /// Exit blocks of divergent loops that individual lanes can take while
    /// others keep iterating. An exit of a divergent loop *not* in this set
    /// is a "kill" exit: it only fires once no lanes remain active.
    divergent_loop_exits: FxIndexSet<Block>,
}

impl DivergenceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shape_of(&self, value: Value) -> LaneShape {
        self.shapes.get(&value).copied().unwrap_or(LaneShape::Uniform)
    }

    pub fn set_shape(&mut self, value: Value, shape: LaneShape) {
        self.shapes.insert(value, shape);
    }

    pub fn drop_shape(&mut self, value: Value) {
        self.shapes.shift_remove(&value);
    }

    pub fn branch_shape(&self, block: Block) -> LaneShape {
        self.branch_shapes.get(block).copied().unwrap_or(LaneShape::Uniform)
    }

    pub fn set_branch_shape(&mut self, block: Block, shape: LaneShape) {
        self.branch_shapes.insert(block, shape);
    }

    pub fn drop_branch_shape(&mut self, block: Block) {
        self.branch_shapes.remove(block);
    }

    /// Is the loop headed by `header` divergent (lane-dependent trip count)?
    pub fn is_divergent_loop(&self, header: Block) -> bool {
        self.divergent_loops.contains(&header)
    }

    pub fn set_loop_divergence(&mut self, header: Block, divergent: bool) {
        if divergent {
            self.divergent_loops.insert(header);
        } else {
            self.divergent_loops.shift_remove(&header);
        }
    }

    pub fn add_divergent_loop_exit(&mut self, exit_block: Block) {
        self.divergent_loop_exits.insert(exit_block);
    }

    pub fn is_divergent_loop_exit(&self, exit_block: Block) -> bool {
        self.divergent_loop_exits.contains(&exit_block)
    }

    /// A kill exit only fires once every lane has already left the loop, so
    /// no per-lane live-value tracking is needed across it.
    pub fn is_kill_exit(&self, exit_block: Block) -> bool {
        !self.is_divergent_loop_exit(exit_block)
    }
}
