//! Shared helpers for the pass-level tests: a minimal function builder
//! and an interpreter for straight-line entry blocks, used to check
//! that rewritten memory access sequences still compute the same
//! values.

use rustc_hash::FxHashMap;

use veld_ir::{
    BinOp, Block, Function, Instr, InstrId, InstrKind, Operand, Param, Terminator, TyIdx, TyKind,
    TypePool,
};

/// A function with one empty entry block, ready for [`push`].
pub fn function(name: &str, ty: TyIdx, pool: &TypePool) -> Function {
    let TyKind::Func { params, .. } = pool.kind(ty) else {
        panic!("function() with non-function type")
    };
    Function {
        name: name.to_owned(),
        ty,
        params: params.iter().map(|&t| Param::new(t)).collect(),
        instrs: Vec::new(),
        blocks: vec![Block { instrs: Vec::new(), term: Terminator::Ret(None) }],
        intrinsic: None,
        dead: false,
    }
}

/// Append an instruction to the entry block.
pub fn push(func: &mut Function, instr: Instr) -> InstrId {
    let id = func.add_instr(instr);
    func.blocks[0].instrs.push(id);
    id
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Addr {
    root: InstrId,
    path: Vec<u64>,
}

#[derive(Clone, Debug)]
enum Val {
    Int(u64),
    Ptr(Addr),
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Execute the entry block of a straight-line function and return the
/// integer it returns. Memory is addressed structurally: every alloca
/// is a root object and address computations extend the path below it.
pub fn eval_entry(func: &Function, pool: &TypePool) -> u64 {
    let mut vals: FxHashMap<InstrId, Val> = FxHashMap::default();
    let mut mem: FxHashMap<Addr, u64> = FxHashMap::default();

    let read = |vals: &FxHashMap<InstrId, Val>, op: &Operand| -> Val {
        match op {
            Operand::Value(id) => vals[id].clone(),
            Operand::Const(c) => Val::Int(c.as_int().expect("non-integer constant operand")),
            Operand::Arg(_) => panic!("eval_entry() does not take arguments"),
        }
    };
    let read_int = |vals: &FxHashMap<InstrId, Val>, op: &Operand| -> u64 {
        match read(vals, op) {
            Val::Int(v) => v,
            Val::Ptr(_) => panic!("expected an integer operand"),
        }
    };
    let read_ptr = |vals: &FxHashMap<InstrId, Val>, op: &Operand| -> Addr {
        match read(vals, op) {
            Val::Ptr(a) => a,
            Val::Int(_) => panic!("expected a pointer operand"),
        }
    };

    for &id in &func.blocks[0].instrs {
        let instr = func.instr(id);
        let value = match &instr.kind {
            InstrKind::Alloca { .. } => Val::Ptr(Addr { root: id, path: Vec::new() }),
            InstrKind::Gep { base, indices, .. } => {
                let mut addr = read_ptr(&vals, base);
                let steps: Vec<u64> = indices
                    .iter()
                    .map(|op| op.as_const_int().expect("non-constant address index"))
                    .collect();
                assert_eq!(steps[0], 0, "eval_entry() roots are single objects");
                addr.path.extend(&steps[1..]);
                Val::Ptr(addr)
            }
            InstrKind::Load { ptr } => {
                let addr = read_ptr(&vals, ptr);
                Val::Int(mem.get(&addr).copied().unwrap_or(0))
            }
            InstrKind::Store { value, ptr } => {
                let bits = pool.int_width(func.operand_ty(value));
                let addr = read_ptr(&vals, ptr);
                mem.insert(addr, read_int(&vals, value) & mask(bits));
                continue;
            }
            InstrKind::Binary { op, lhs, rhs } => {
                let bits = pool.int_width(instr.ty);
                let a = read_int(&vals, lhs);
                let b = read_int(&vals, rhs);
                let raw = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Shl => a << b,
                    BinOp::AShr => {
                        // sign-extend from the operand width first
                        let sign = 1u64 << (bits - 1);
                        let extended = (a ^ sign).wrapping_sub(sign) as i64;
                        (extended >> b) as u64
                    }
                };
                Val::Int(raw & mask(bits))
            }
            InstrKind::ZExt { value } => {
                let bits = pool.int_width(func.operand_ty(value));
                Val::Int(read_int(&vals, value) & mask(bits))
            }
            InstrKind::Trunc { value } => {
                let bits = pool.int_width(instr.ty);
                Val::Int(read_int(&vals, value) & mask(bits))
            }
            kind => panic!("eval_entry() cannot execute {kind:?}"),
        };
        vals.insert(id, value);
    }

    match &func.blocks[0].term {
        Terminator::Ret(Some(op)) => read_int(&vals, op),
        term => panic!("entry block does not return a value: {term:?}"),
    }
}
