//! Pass-level tests driving [`run_type_optimization`] over small
//! modules and checking both the rewritten structure and, for memory
//! traffic, the computed values.

use pretty_assertions::assert_eq;
use proptest::proptest;

use veld_ir::{
    Callee, ConstKind, Constant, FuncId, Function, GlobalVar, Instr, InstrKind, Intrinsic, Module,
    Operand, Param, StructFlags, TargetLayout, Terminator, TyIdx,
};

use crate::test_helpers::{eval_entry, function, push};
use crate::run_type_optimization;

fn gep(ty: TyIdx, base: Operand, indices: &[u64]) -> Instr {
    Instr::new(
        ty,
        InstrKind::Gep {
            base,
            indices: indices.iter().map(|&i| Operand::index(i)).collect(),
            inbounds: true,
        },
    )
}

/// `struct S { i16 a; i16 b; i32 c[2]; }` with `a` and `b` packed into
/// one 32-bit slot; the entry block stores both and recombines them.
fn packed_module(a: u64, b: u64) -> (Module, FuncId) {
    let mut module = Module::new();
    let arr = module.types.array(TyIdx::I32, 2);
    let st = module.types.named_struct(
        "S",
        vec![TyIdx::I16, TyIdx::I16, arr],
        StructFlags::empty(),
    );
    let ptr_st = module.types.pointer(st);
    let ptr_i16 = module.types.pointer(TyIdx::I16);
    let fn_ty = module.types.func(TyIdx::I32, &[], false);

    let mut f = function("f", fn_ty, &module.types);
    let obj = push(&mut f, Instr::new(ptr_st, InstrKind::Alloca { allocated: st }));
    let pa = push(&mut f, gep(ptr_i16, Operand::Value(obj), &[0, 0]));
    let pb = push(&mut f, gep(ptr_i16, Operand::Value(obj), &[0, 1]));
    push(
        &mut f,
        Instr::new(
            TyIdx::VOID,
            InstrKind::Store {
                value: Operand::Const(Constant::int(TyIdx::I16, a)),
                ptr: Operand::Value(pa),
            },
        ),
    );
    push(
        &mut f,
        Instr::new(
            TyIdx::VOID,
            InstrKind::Store {
                value: Operand::Const(Constant::int(TyIdx::I16, b)),
                ptr: Operand::Value(pb),
            },
        ),
    );
    let la = push(&mut f, Instr::new(TyIdx::I16, InstrKind::Load { ptr: Operand::Value(pa) }));
    let lb = push(&mut f, Instr::new(TyIdx::I16, InstrKind::Load { ptr: Operand::Value(pb) }));
    let za = push(&mut f, Instr::new(TyIdx::I32, InstrKind::ZExt { value: Operand::Value(la) }));
    let zb = push(&mut f, Instr::new(TyIdx::I32, InstrKind::ZExt { value: Operand::Value(lb) }));
    let sh = push(
        &mut f,
        Instr::new(
            TyIdx::I32,
            InstrKind::Binary {
                op: veld_ir::BinOp::Shl,
                lhs: Operand::Value(zb),
                rhs: Operand::Const(Constant::int(TyIdx::I32, 16)),
            },
        ),
    );
    let or = push(
        &mut f,
        Instr::new(
            TyIdx::I32,
            InstrKind::Binary {
                op: veld_ir::BinOp::Or,
                lhs: Operand::Value(za),
                rhs: Operand::Value(sh),
            },
        ),
    );
    f.blocks[0].term = Terminator::Ret(Some(Operand::Value(or)));
    let fid = module.add_function(f);
    (module, fid)
}

#[test]
fn packed_fields_share_one_slot() {
    let (mut module, fid) = packed_module(0x1234, 0x5678);
    let layout = TargetLayout::default();
    assert!(run_type_optimization(&mut module, &layout));

    let func = module.func(fid);
    let obj = func.blocks[0].instrs[0];
    let InstrKind::Alloca { allocated } = func.instr(obj).kind else {
        panic!("entry does not start with the alloca")
    };
    assert_eq!(module.types.num_fields(allocated), 2);
    assert_eq!(module.types.int_width(module.types.field(allocated, 0)), 32);
    assert_eq!(module.types.array_len(module.types.field(allocated, 1)), 2);
}

proptest! {
    #[test]
    fn packed_stores_and_loads_round_trip(a in 0u64..=0xFFFF, b in 0u64..=0xFFFF) {
        let (mut module, fid) = packed_module(a, b);
        let layout = TargetLayout::default();
        run_type_optimization(&mut module, &layout);
        let result = eval_entry(module.func(fid), &module.types);
        assert_eq!(result, (b << 16) | a);
    }
}

#[test]
fn rewriting_is_deterministic() {
    let layout = TargetLayout::default();
    let (mut first, _) = packed_module(1, 2);
    let (mut second, _) = packed_module(1, 2);
    run_type_optimization(&mut first, &layout);
    run_type_optimization(&mut second, &layout);
    assert_eq!(format!("{first:?}"), format!("{second:?}"));
}

#[test]
fn collapsed_struct_disappears_from_a_function_body() {
    let mut module = Module::new();
    let wrap = module.types.named_struct("Wrap", vec![TyIdx::F64], StructFlags::empty());
    let ptr_wrap = module.types.pointer(wrap);
    let ptr_f64 = module.types.pointer(TyIdx::F64);
    let fn_ty = module.types.func(TyIdx::F64, &[], false);

    let mut f = function("f", fn_ty, &module.types);
    let obj = push(&mut f, Instr::new(ptr_wrap, InstrKind::Alloca { allocated: wrap }));
    let field = push(&mut f, gep(ptr_f64, Operand::Value(obj), &[0, 0]));
    push(
        &mut f,
        Instr::new(
            TyIdx::VOID,
            InstrKind::Store {
                value: Operand::Const(Constant { ty: TyIdx::F64, kind: ConstKind::Float(1) }),
                ptr: Operand::Value(field),
            },
        ),
    );
    let load = push(&mut f, Instr::new(TyIdx::F64, InstrKind::Load { ptr: Operand::Value(field) }));
    f.blocks[0].term = Terminator::Ret(Some(Operand::Value(load)));
    let fid = module.add_function(f);

    let layout = TargetLayout::default();
    assert!(run_type_optimization(&mut module, &layout));

    let func = module.func(fid);
    let InstrKind::Alloca { allocated } = func.instr(func.blocks[0].instrs[0]).kind else {
        panic!("entry does not start with the alloca")
    };
    assert_eq!(allocated, TyIdx::F64);
    // the old address computation was superseded by one with a single
    // index, straight to the sole member
    let new_gep = func.blocks[0].instrs[1];
    let InstrKind::Gep { indices, .. } = &func.instr(new_gep).kind else {
        panic!("expected the regenerated address computation")
    };
    assert_eq!(indices.len(), 1);
    assert_eq!(func.instr(new_gep).ty, ptr_f64);
}

#[test]
fn global_array_of_arrays_flattens_with_its_initializer() {
    let mut module = Module::new();
    let row = module.types.array(TyIdx::I32, 2);
    let grid = module.types.array(row, 2);
    let row_const = |a: u64, b: u64| Constant {
        ty: row,
        kind: ConstKind::Array(vec![
            Constant::int(TyIdx::I32, a),
            Constant::int(TyIdx::I32, b),
        ]),
    };
    let gid = module.add_global(GlobalVar {
        name: "grid".to_owned(),
        value_ty: grid,
        init: Some(Constant {
            ty: grid,
            kind: ConstKind::Array(vec![row_const(1, 2), row_const(3, 4)]),
        }),
        is_const: true,
    });

    let layout = TargetLayout::default();
    run_type_optimization(&mut module, &layout);

    let global = module.global(gid);
    assert_eq!(module.types.array_len(global.value_ty), 4);
    assert_eq!(module.types.array_elem(global.value_ty), TyIdx::I32);
    let ConstKind::Array(elems) = &global.init.as_ref().unwrap().kind else {
        panic!("expected an array initializer")
    };
    let values: Vec<u64> = elems.iter().map(|c| c.as_int().unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
}

#[test]
fn global_addresses_decay_in_other_initializers() {
    let mut module = Module::new();
    let arr = module.types.array(TyIdx::F64, 2);
    let ptr_arr = module.types.pointer(arr);
    let buf = module.add_global(GlobalVar {
        name: "buf".to_owned(),
        value_ty: arr,
        init: Some(Constant { ty: arr, kind: ConstKind::Zero }),
        is_const: false,
    });
    let holder_ty = module.types.named_struct("Holder", vec![ptr_arr], StructFlags::empty());
    let holder = module.add_global(GlobalVar {
        name: "holder".to_owned(),
        value_ty: holder_ty,
        init: Some(Constant {
            ty: holder_ty,
            kind: ConstKind::Struct(vec![Constant { ty: ptr_arr, kind: ConstKind::Global(buf) }]),
        }),
        is_const: true,
    });

    let layout = TargetLayout::default();
    run_type_optimization(&mut module, &layout);

    // the array global keeps its shape; its address became a constant
    // zero-index computation yielding the element pointer
    assert_eq!(module.global(buf).value_ty, arr);
    let ptr_f64 = module.types.pointer(TyIdx::F64);
    let ConstKind::Struct(fields) = &module.global(holder).init.as_ref().unwrap().kind else {
        panic!("expected a struct initializer")
    };
    assert_eq!(fields[0].ty, ptr_f64);
    let ConstKind::Gep { base, indices } = &fields[0].kind else {
        panic!("expected a constant address computation")
    };
    assert_eq!(base.kind, ConstKind::Global(buf));
    assert_eq!(indices.len(), 2);
}

#[test]
fn upcast_into_a_collapsed_base_becomes_a_field_address() {
    let mut module = Module::new();
    let base = module.types.named_struct("Base", vec![TyIdx::F64], StructFlags::empty());
    let derived = module.types.named_struct("Derived", vec![base, TyIdx::I32], StructFlags::empty());
    let ptr_base = module.types.pointer(base);
    let ptr_derived = module.types.pointer(derived);
    let up_ty = module.types.func(ptr_base, &[ptr_derived], false);
    let up = module.declare_intrinsic(Intrinsic::UpcastCollapsed, up_ty);

    let fn_ty = module.types.func(ptr_base, &[ptr_derived], false);
    let mut f = function("h", fn_ty, &module.types);
    let call = push(
        &mut f,
        Instr::new(
            ptr_base,
            InstrKind::Call {
                callee: Callee::Func(up),
                args: vec![Operand::Arg(0)],
                byval: Vec::new(),
            },
        ),
    );
    f.blocks[0].term = Terminator::Ret(Some(Operand::Value(call)));
    let fid = module.add_function(f);

    let layout = TargetLayout::default();
    run_type_optimization(&mut module, &layout);

    let ptr_f64 = module.types.pointer(TyIdx::F64);
    let func = module.func(fid);
    assert_eq!(func.blocks[0].instrs.len(), 1);
    let replacement = func.blocks[0].instrs[0];
    let InstrKind::Gep { base, indices, .. } = &func.instr(replacement).kind else {
        panic!("expected a zero-index address computation")
    };
    assert_eq!(*base, Operand::Arg(0));
    assert_eq!(indices.len(), 2);
    assert_eq!(func.instr(replacement).ty, ptr_f64);
    assert_eq!(func.blocks[0].term, Terminator::Ret(Some(Operand::Value(replacement))));
    // nothing calls the intrinsic anymore
    assert!(module.func(up).dead);
}

#[test]
fn intrinsic_call_sites_move_to_the_rewritten_overload() {
    let mut module = Module::new();
    let wrap = module.types.named_struct("W", vec![TyIdx::I64], StructFlags::empty());
    let ptr_wrap = module.types.pointer(wrap);
    let lt_ty = module.types.func(TyIdx::VOID, &[TyIdx::I32, ptr_wrap], false);
    let lt = module.declare_intrinsic(Intrinsic::LifetimeStart, lt_ty);

    let fn_ty = module.types.func(TyIdx::VOID, &[], false);
    let mut f = function("f", fn_ty, &module.types);
    let obj = push(&mut f, Instr::new(ptr_wrap, InstrKind::Alloca { allocated: wrap }));
    let call = push(
        &mut f,
        Instr::new(
            TyIdx::VOID,
            InstrKind::Call {
                callee: Callee::Func(lt),
                args: vec![
                    Operand::Const(Constant::int(TyIdx::I32, 8)),
                    Operand::Value(obj),
                ],
                byval: Vec::new(),
            },
        ),
    );
    f.blocks[0].term = Terminator::Ret(None);
    let fid = module.add_function(f);

    let layout = TargetLayout::default();
    run_type_optimization(&mut module, &layout);

    let ptr_i64 = module.types.pointer(TyIdx::I64);
    let target = module
        .find_intrinsic(Intrinsic::LifetimeStart, &[ptr_i64])
        .expect("rewritten overload declared");
    let InstrKind::Call { callee, .. } = &module.func(fid).instr(call).kind else {
        panic!("call disappeared")
    };
    assert_eq!(*callee, Callee::Func(target));
    assert!(module.func(lt).dead);
}

#[test]
fn byval_argument_of_an_array_ified_object_gets_an_explicit_copy() {
    let mut module = Module::new();
    let arr = module.types.array(TyIdx::I32, 4);
    let st = module.types.named_struct("S", vec![arr], StructFlags::empty());
    let ptr_st = module.types.pointer(st);
    let callee_ty = module.types.func(TyIdx::VOID, &[ptr_st], false);
    let callee_id = module.add_function(Function {
        name: "consume".to_owned(),
        ty: callee_ty,
        params: vec![Param { ty: ptr_st, byval: true, readonly: false }],
        instrs: Vec::new(),
        blocks: Vec::new(),
        intrinsic: None,
        dead: false,
    });

    let caller_ty = module.types.func(TyIdx::VOID, &[ptr_st], false);
    let mut f = function("produce", caller_ty, &module.types);
    let call = push(
        &mut f,
        Instr::new(
            TyIdx::VOID,
            InstrKind::Call {
                callee: Callee::Func(callee_id),
                args: vec![Operand::Arg(0)],
                byval: vec![true],
            },
        ),
    );
    f.blocks[0].term = Terminator::Ret(None);
    let caller_id = module.add_function(f);

    let layout = TargetLayout::default();
    run_type_optimization(&mut module, &layout);

    // the collapsed struct left a bare array behind the pointer, so the
    // attribute is gone on both sides and the caller copies explicitly
    let ptr_i32 = module.types.pointer(TyIdx::I32);
    assert!(!module.func(callee_id).params[0].byval);
    assert_eq!(module.func(callee_id).params[0].ty, ptr_i32);

    let func = module.func(caller_id);
    let entry = &func.blocks[0].instrs;
    assert_eq!(entry.len(), 4);
    let InstrKind::Alloca { allocated } = func.instr(entry[0]).kind else {
        panic!("expected the copy alloca first")
    };
    assert_eq!(allocated, arr);
    assert!(matches!(func.instr(entry[1]).kind, InstrKind::Gep { .. }));
    let InstrKind::Call { callee: copy_callee, args, .. } = &func.instr(entry[2]).kind else {
        panic!("expected the copy call")
    };
    let Callee::Func(copy_fn) = copy_callee else { panic!("expected a direct call") };
    assert_eq!(module.func(*copy_fn).intrinsic, Some(Intrinsic::MemCpy));
    assert_eq!(args[2], Operand::Const(Constant::int(TyIdx::I32, 16)));
    assert_eq!(entry[3], call);
    let InstrKind::Call { args, byval, .. } = &func.instr(call).kind else {
        panic!("call disappeared")
    };
    assert_eq!(args[0], Operand::Value(entry[1]));
    assert_eq!(byval, &vec![false]);
}
