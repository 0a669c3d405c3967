//! **`laneflow`** converts control-flow graphs containing data-dependent
//! ("divergent") branches and loops into a single, topologically linear
//! schedule of blocks, suitable for predicated/masked execution on a
//! SIMD-style target.
//!
//! The input is an unstructured CFG over [`Block`]s, annotated by two
//! external analyses the caller supplies as authoritative:
//! * [`divergence::DivergenceInfo`]: which values/branches/loops are uniform
//!   across all lanes, and which may diverge
//! * [`mask::MaskAnalysis`]: the boolean execution condition (and optional
//!   active-length bound) attached to every control edge
//!
//! The output of [`linearize::Linearizer`] is the same function body,
//! rewritten in place so that no divergent terminator remains: divergent
//! branches are folded into straight-line code (both successors always
//! visited, in topological order), join-point phis become predicated select
//! chains, and divergent loops iterate until a collective "any lane still
//! live" condition goes false, with one latch-guarded exit.
//!
//! #### Notable types/modules
//! * [`FuncBody`]: owns [`Block`]s, [`Inst`]s and [`Const`]s of one function
//! * [`cfg`]: traversal, loop forest ([`cfg::LoopForest`]) and
//!   [`cfg::DominatorTree`]
//! * [`linearize::Linearizer`]: the linearization pass itself
//! * [`print`]: plain-text rendering of function bodies

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(
    // NOTE ignored for readability (`match` used when `if let` is too long).
    clippy::single_match_else,
)]
#![forbid(unsafe_code)]

pub mod cfg;
pub mod divergence;
mod entity;
pub mod linearize;
pub mod mask;
pub mod print;

use smallvec::SmallVec;

// HACK work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

pub use entity::{Block, Const, EntityDefs, EntityHandle, EntityOrientedDenseMap, Inst};

/// Scalar value types. Just enough of a type universe to give every value a
/// type, and to materialize typed undef/boolean constants during rewriting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Int32,
    Int64,
    Float32,
}

/// Definition for a [`Const`]: a constant value.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Bool(bool),
    Int(i64),

    /// An unspecified value of the given type. Produced wherever the
    /// linearizer must complete a join whose value is never observed on
    /// that path (tracker seeds, non-dominating-predecessor fill-ins).
    Undef,
}

/// Definition for an [`Inst`]: one (non-control-flow) instruction, owned by
/// the `insts` list of exactly one live [`BlockDef`].
#[derive(Clone)]
pub struct InstDef {
    pub ty: Type,
    pub kind: InstKind,
}

#[derive(Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Join node: merges one value per (recorded) predecessor block.
    ///
    /// Kept in LLVM-style per-edge form (not "block argument" form) because
    /// the whole point of this crate is rewriting joins whose predecessor
    /// sets drift away from their recorded inputs.
    Phi {
        incoming: SmallVec<[(Block, Value); 2]>,
    },

    /// `if cond { on_true } else { on_false }`, per lane.
    Select {
        cond: Value,
        on_true: Value,
        on_false: Value,
    },

    /// Collective reduction: true iff `pred` is true in at least one lane
    /// still executing. Uniform, side-effect-free, non-throwing,
    /// non-recursing, and convergent (requires lockstep execution); it is
    /// false-preserving (`any_lanes(false) == false`) and true-absorbing.
    AnyLanes {
        pred: Value,
    },

    /// Generic two-operand computation; the payload the surrounding
    /// compiler actually schedules. The linearizer never inspects these
    /// beyond operand rewriting.
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    CmpEq,
    CmpLt,
}

/// Any usable value: a constant, or the output of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, derive_more::From)]
pub enum Value {
    Const(Const),
    Inst(Inst),
}

/// A block's terminator: the single control transfer at its end.
///
/// `targets` order is significant: for `CondBranch`, `targets[0]` is taken
/// when `inputs[0]` is true and `targets[1]` otherwise.
#[derive(Clone)]
pub struct ControlInst {
    pub kind: ControlInstKind,

    pub inputs: SmallVec<[Value; 1]>,

    pub targets: SmallVec<[Block; 2]>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlInstKind {
    /// Reaching this point in the control-flow is undefined behavior.
    Unreachable,

    /// Leave the function, optionally returning `inputs[0]`. A control sink
    /// for the linearizer: no successors, nothing to fold.
    Return,

    /// Unconditional branch to `targets[0]`.
    Branch,

    /// Two-way branch on `inputs[0]`: `targets[0]` if true, else `targets[1]`.
    CondBranch,
}

impl ControlInst {
    pub fn unreachable() -> Self {
        Self { kind: ControlInstKind::Unreachable, inputs: SmallVec::new(), targets: SmallVec::new() }
    }

    pub fn ret(value: Option<Value>) -> Self {
        Self {
            kind: ControlInstKind::Return,
            inputs: value.into_iter().collect(),
            targets: SmallVec::new(),
        }
    }

    pub fn branch(target: Block) -> Self {
        Self {
            kind: ControlInstKind::Branch,
            inputs: SmallVec::new(),
            targets: [target].into_iter().collect(),
        }
    }

    pub fn cond_branch(cond: Value, on_true: Block, on_false: Block) -> Self {
        Self {
            kind: ControlInstKind::CondBranch,
            inputs: [cond].into_iter().collect(),
            targets: [on_true, on_false].into_iter().collect(),
        }
    }
}

/// Definition for a [`Block`]: a straight-line run of instructions (phis
/// first) ending in one [`ControlInst`].
#[derive(Clone)]
pub struct BlockDef {
    pub insts: Vec<Inst>,
    pub terminator: ControlInst,

    /// Set by [`FuncBody::detach_block`]; a detached block is dead weight in
    /// the arena, excluded from every query, and must not be referenced by
    /// any live terminator.
    detached: bool,
}

/// One function's body: the arenas for blocks, instructions and constants,
/// plus the entry block.
pub struct FuncBody {
    pub blocks: EntityDefs<Block, BlockDef>,
    pub insts: EntityDefs<Inst, InstDef>,
    pub consts: EntityDefs<Const, ConstDef>,

    pub entry: Block,
}

impl FuncBody {
    /// New function body with a single (empty, unreachable-terminated)
    /// entry block.
    pub fn new() -> Self {
        let mut blocks = EntityDefs::new();
        let entry = blocks
            .define(BlockDef { insts: vec![], terminator: ControlInst::unreachable(), detached: false });
        Self { blocks, insts: EntityDefs::new(), consts: EntityDefs::new(), entry }
    }

    pub fn add_block(&mut self) -> Block {
        self.blocks.define(BlockDef {
            insts: vec![],
            terminator: ControlInst::unreachable(),
            detached: false,
        })
    }

    pub fn is_detached(&self, block: Block) -> bool {
        self.blocks[block].detached
    }

    /// All live blocks, in definition order.
    pub fn live_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().filter(|(_, def)| !def.detached).map(|(block, _)| block)
    }

    fn intern_const(&mut self, def: ConstDef) -> Const {
        // The constant pool stays tiny (bools, undefs, a few test literals),
        // so a linear scan beats carrying an interner around.
        for (c, existing) in self.consts.iter() {
            if *existing == def {
                return c;
            }
        }
        self.consts.define(def)
    }

    pub fn const_bool(&mut self, value: bool) -> Value {
        Value::Const(self.intern_const(ConstDef { ty: Type::Bool, kind: ConstKind::Bool(value) }))
    }

    pub fn const_int(&mut self, ty: Type, value: i64) -> Value {
        Value::Const(self.intern_const(ConstDef { ty, kind: ConstKind::Int(value) }))
    }

    pub fn undef(&mut self, ty: Type) -> Value {
        Value::Const(self.intern_const(ConstDef { ty, kind: ConstKind::Undef }))
    }

    pub fn value_type(&self, value: Value) -> Type {
        match value {
            Value::Const(c) => self.consts[c].ty,
            Value::Inst(i) => self.insts[i].ty,
        }
    }

    /// Is `value` a constant with the given kind?
    pub fn is_const_kind(&self, value: Value, kind: ConstKind) -> bool {
        match value {
            Value::Const(c) => self.consts[c].kind == kind,
            Value::Inst(_) => false,
        }
    }

    /// Append `def` at the end of `block`'s instruction list (i.e. just
    /// before the terminator).
    pub fn push_inst(&mut self, block: Block, def: InstDef) -> Inst {
        let inst = self.insts.define(def);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Insert `def` at the front of `block` (the phi zone). Asserted to be a
    /// phi: non-phi instructions never legitimately lead a block here.
    pub fn prepend_phi(&mut self, block: Block, def: InstDef) -> Inst {
        assert!(
            matches!(def.kind, InstKind::Phi { .. }),
            "only phis may be inserted at the front of a block"
        );
        let inst = self.insts.define(def);
        self.blocks[block].insts.insert(0, inst);
        inst
    }

    /// The phis leading `block`, in order.
    pub fn block_phis(&self, block: Block) -> Vec<Inst> {
        self.blocks[block]
            .insts
            .iter()
            .copied()
            .take_while(|&inst| matches!(self.insts[inst].kind, InstKind::Phi { .. }))
            .collect()
    }

    pub fn successors(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.blocks[block].terminator.targets.iter().copied()
    }

    /// Predecessors of `block` among live blocks, deduplicated, in block
    /// definition order. Recomputed on demand: terminators are rewritten
    /// throughout linearization and a cache would go stale under it.
    pub fn predecessors(&self, block: Block) -> Vec<Block> {
        let mut preds = vec![];
        for (pred, def) in self.blocks.iter() {
            if def.detached {
                continue;
            }
            if def.terminator.targets.contains(&block) && !preds.contains(&pred) {
                preds.push(pred);
            }
        }
        preds
    }

    /// Rewrite every use of `old` (instruction operands and terminator
    /// inputs; phi incoming values included) to `new`.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        assert!(old != new, "trivial use replacement");
        for inst in self.insts.keys() {
            self.replace_uses_in_inst(inst, old, new);
        }
        for block in self.blocks.keys() {
            for input in &mut self.blocks[block].terminator.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    /// The live block whose instruction list contains `inst`, if any.
    pub fn defining_block(&self, inst: Inst) -> Option<Block> {
        self.blocks
            .iter()
            .find(|(_, def)| !def.detached && def.insts.contains(&inst))
            .map(|(block, _)| block)
    }

    /// Rewrite uses of `old` to `new` within a single instruction.
    pub fn replace_uses_in_inst(&mut self, inst: Inst, old: Value, new: Value) {
        match &mut self.insts[inst].kind {
            InstKind::Phi { incoming } => {
                for (_, value) in incoming {
                    if *value == old {
                        *value = new;
                    }
                }
            }
            InstKind::Select { cond, on_true, on_false } => {
                for value in [cond, on_true, on_false] {
                    if *value == old {
                        *value = new;
                    }
                }
            }
            InstKind::AnyLanes { pred } => {
                if *pred == old {
                    *pred = new;
                }
            }
            InstKind::Binary { lhs, rhs, .. } => {
                for value in [lhs, rhs] {
                    if *value == old {
                        *value = new;
                    }
                }
            }
        }
    }

    /// Remove `inst` from `block`'s instruction list (its arena slot stays,
    /// unreferenced).
    pub fn remove_inst(&mut self, block: Block, inst: Inst) {
        let insts = &mut self.blocks[block].insts;
        let pos = insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not found in its supposed parent block");
        insts.remove(pos);
    }

    /// Detach `block` from the function. The caller must already have
    /// forwarded every edge into it; a dangling reference is a fatal
    /// bookkeeping contradiction.
    pub fn detach_block(&mut self, block: Block) {
        assert!(block != self.entry, "cannot detach the entry block");
        for (other, def) in self.blocks.iter() {
            assert!(
                def.detached || !def.terminator.targets.contains(&block),
                "detaching {block} which is still targeted by {other}"
            );
        }
        let def = &mut self.blocks[block];
        def.insts.clear();
        def.terminator = ControlInst::unreachable();
        def.detached = true;
    }
}

impl Default for FuncBody {
    fn default() -> Self {
        Self::new()
    }
}
