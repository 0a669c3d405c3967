//! Plain-text rendering of function bodies, used by tests, assertions and
//! general debugging.

use crate::{BinOp, Block, ConstKind, ControlInstKind, FuncBody, Inst, InstKind, Value};
use std::fmt::Write as _;

/// Render a value compactly: constants inline, instructions by handle.
pub fn value_to_string(func: &FuncBody, value: Value) -> String {
    match value {
        Value::Const(c) => match func.consts[c].kind {
            ConstKind::Bool(b) => b.to_string(),
            ConstKind::Int(i) => i.to_string(),
            ConstKind::Undef => "undef".into(),
        },
        Value::Inst(inst) => inst.to_string(),
    }
}

fn inst_to_string(func: &FuncBody, inst: Inst) -> String {
    let v = |value| value_to_string(func, value);
    let def = &func.insts[inst];
    let rhs = match &def.kind {
        InstKind::Phi { incoming } => {
            let inputs: Vec<String> =
                incoming.iter().map(|&(block, value)| format!("[{block}: {}]", v(value))).collect();
            format!("phi {}", inputs.join(", "))
        }
        InstKind::Select { cond, on_true, on_false } => {
            format!("select {} ? {} : {}", v(*cond), v(*on_true), v(*on_false))
        }
        InstKind::AnyLanes { pred } => format!("any_lanes {}", v(*pred)),
        InstKind::Binary { op, lhs, rhs } => {
            let op = match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "mul",
                BinOp::And => "and",
                BinOp::Or => "or",
                BinOp::Xor => "xor",
                BinOp::CmpEq => "cmp_eq",
                BinOp::CmpLt => "cmp_lt",
            };
            format!("{op} {}, {}", v(*lhs), v(*rhs))
        }
    };
    format!("{inst} = {rhs}")
}

fn block_to_string(func: &FuncBody, block: Block) -> String {
    let mut out = String::new();
    let marker = if block == func.entry { " (entry)" } else { "" };
    let _ = writeln!(out, "{block}:{marker}");
    for &inst in &func.blocks[block].insts {
        let _ = writeln!(out, "  {}", inst_to_string(func, inst));
    }
    let term = &func.blocks[block].terminator;
    let line = match term.kind {
        ControlInstKind::Unreachable => "unreachable".into(),
        ControlInstKind::Return => match term.inputs.first() {
            Some(&value) => format!("return {}", value_to_string(func, value)),
            None => "return".into(),
        },
        ControlInstKind::Branch => format!("br {}", term.targets[0]),
        ControlInstKind::CondBranch => format!(
            "br {} ? {} : {}",
            value_to_string(func, term.inputs[0]),
            term.targets[0],
            term.targets[1],
        ),
    };
    let _ = writeln!(out, "  {line}");
    out
}

/// Render every live block of `func`, in definition order.
pub fn func_to_string(func: &FuncBody) -> String {
    let mut out = String::new();
    for block in func.live_blocks() {
        out += &block_to_string(func, block);
    }
    out
}
