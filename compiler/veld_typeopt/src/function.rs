//! Function body rewriting.
//!
//! A function is rewritten in one deterministic walk: blocks in
//! reachable order (successors appended as discovered, unreached blocks
//! last), instructions in block order. Most instructions just get their
//! result type and operands remapped in place. The interesting cases
//! produce replacement values on the side:
//!
//! - address computations are regenerated from scratch through the
//!   index rewriter, with any needed arithmetic placed in front of the
//!   anchor and the new computation right after it,
//! - loads and stores of fields packed into shared integers grow the
//!   read-modify-write sequences that extract or deposit the sub-word,
//! - upcasts whose destination struct collapsed become zero-index
//!   address computations,
//! - by-value call arguments whose copied object became an array get an
//!   explicit stack copy, since the length is no longer part of the
//!   pointer's type.
//!
//! Replacements are recorded in a side table and spliced into the
//! blocks at the end; superseded instructions are dropped then, except
//! allocas and loads, which replacement values still reference.

use rustc_hash::{FxHashMap, FxHashSet};

use veld_ir::{
    BinOp, Callee, Constant, FuncId, Function, Instr, InstrId, InstrKind, Intrinsic, Operand,
    TyIdx, TyKind,
};

use crate::indices::InstrIndexBuilder;
use crate::mapping::MappingKind;
use crate::{GlobalValueRef, TypeOptimizer};

/// Key for the original-type side table: retyped values keep their old
/// type here so later uses can still ask what they used to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum LocalKey {
    Instr(InstrId),
    Arg(u32),
}

/// Per-function rewriting state.
#[derive(Default)]
struct LocalState {
    /// Superseded values: old instruction to replacement operand plus
    /// the residual bit offset of packed-integer addresses.
    mapped: FxHashMap<InstrId, (Operand, u32)>,
    /// Original types of values retyped in place.
    original_tys: FxHashMap<LocalKey, TyIdx>,
    inserts_before: FxHashMap<InstrId, Vec<InstrId>>,
    inserts_after: FxHashMap<InstrId, Vec<InstrId>>,
    /// Pointer/integer phis whose operands are resolved only after
    /// every producer has been rewritten.
    delayed_phis: Vec<InstrId>,
}

impl TypeOptimizer<'_> {
    /// Rewrite one function: signature first, then the body if there is
    /// one. The function must be on the pending worklist.
    pub(crate) fn rewrite_function(&mut self, fid: FuncId) {
        let was_pending = self.pending_functions.remove(&fid);
        debug_assert!(was_pending, "function rewritten twice");
        tracing::trace!(function = %self.module.func(fid).name, "rewriting function");

        let old_fn_ty = self.module.func(fid).ty;
        let old_ptr_ty = self.module.types.pointer(old_fn_ty);
        self.global_types.insert(GlobalValueRef::Func(fid), old_ptr_ty);

        let mut local = LocalState::default();
        let new_fn_ty = self.rewrite_type(old_fn_ty).mapped;
        if new_fn_ty != old_fn_ty {
            let mutated = if self.module.func(fid).intrinsic.is_some() {
                self.rewrite_intrinsic(fid, new_fn_ty)
            } else {
                self.module.func_mut(fid).ty = new_fn_ty;
                true
            };
            if mutated {
                let TyKind::Func { params, .. } = self.module.types.kind(new_fn_ty).clone() else {
                    unreachable!("function type rewritten to a non-function type")
                };
                for (i, &new_ty) in params.iter().enumerate() {
                    let param = &mut self.module.functions[fid.index()].params[i];
                    if param.ty != new_ty {
                        local.original_tys.insert(LocalKey::Arg(i as u32), param.ty);
                        param.ty = new_ty;
                    }
                }
            }
        }

        // by-value parameters of array-ified objects lose the attribute;
        // the callers materialize explicit copies instead
        for i in 0..self.module.func(fid).params.len() {
            if !self.module.func(fid).params[i].byval {
                continue;
            }
            let cur_ty = self.module.func(fid).params[i].ty;
            let orig_ty =
                local.original_tys.get(&LocalKey::Arg(i as u32)).copied().unwrap_or(cur_ty);
            let pointee = self.module.types.pointee(orig_ty);
            let mapped = self.rewrite_type(pointee).mapped;
            if self.module.types.is_array(mapped) {
                self.module.functions[fid.index()].params[i].byval = false;
            }
        }

        if self.module.func(fid).is_declaration() {
            return;
        }
        let mut func = std::mem::take(&mut self.module.functions[fid.index()]);
        self.rewrite_body(&mut func, &mut local);
        self.module.functions[fid.index()] = func;
    }

    /// An intrinsic declaration is overloaded on (a subset of) its
    /// signature types; rewriting the types may land on a different
    /// overload. Returns `true` when the declaration was retyped in
    /// place, `false` when call sites were redirected to another
    /// declaration instead.
    fn rewrite_intrinsic(&mut self, fid: FuncId, new_fn_ty: TyIdx) -> bool {
        let intr = self.module.func(fid).intrinsic.expect("intrinsic tag");
        let new_tys = intr.overload_tys(&self.module.types, new_fn_ty);
        let new_name = self.module.intrinsic_name(intr, &new_tys);
        if new_name == self.module.func(fid).name {
            // same overload after rewriting; just retype
            self.module.func_mut(fid).ty = new_fn_ty;
            return true;
        }
        // another declaration owns the target overload; if it is still
        // pending, rewrite it first so both settle on final overloads
        if let Some(existing) = self.module.find_intrinsic(intr, &new_tys) {
            if existing != fid && self.pending_functions.contains(&existing) {
                self.rewrite_function(existing);
            }
        }
        let target = match self.module.find_intrinsic(intr, &new_tys) {
            Some(f) if f != fid => f,
            _ => self.module.declare_intrinsic(intr, new_fn_ty),
        };
        self.redirect_calls(fid, target);
        false
    }

    fn redirect_calls(&mut self, from: FuncId, to: FuncId) {
        for func in &mut self.module.functions {
            for instr in &mut func.instrs {
                if let InstrKind::Call { callee, .. } = &mut instr.kind {
                    if *callee == Callee::Func(from) {
                        *callee = Callee::Func(to);
                    }
                }
            }
        }
    }

    fn rewrite_body(&mut self, func: &mut Function, local: &mut LocalState) {
        let order = block_order(func);
        for &bid in &order {
            let instr_ids = func.blocks[bid.index()].instrs.clone();
            for id in instr_ids {
                self.rewrite_instr(func, local, id);
            }
            let mut term = func.blocks[bid.index()].term.clone();
            let mut ops = Vec::new();
            term.for_each_operand_mut(|op| ops.push(op.clone()));
            let mapped: Vec<Operand> =
                ops.iter().map(|op| self.get_mapped_operand(local, op).0).collect();
            let mut it = mapped.into_iter();
            term.for_each_operand_mut(|op| *op = it.next().unwrap());
            func.blocks[bid.index()].term = term;
        }

        // phis see their producers' final values only now
        let phis = std::mem::take(&mut local.delayed_phis);
        for id in phis {
            let InstrKind::Phi { incoming } = &func.instr(id).kind else {
                unreachable!("delayed non-phi")
            };
            let mut incoming = incoming.clone();
            for (_, op) in &mut incoming {
                let (mapped, offset) = self.get_mapped_operand(local, op);
                debug_assert_eq!(offset, 0, "packed-integer address flowed into a phi");
                *op = mapped;
            }
            func.instr_mut(id).kind = InstrKind::Phi { incoming };
        }

        splice_blocks(func, local);
    }

    fn rewrite_instr(&mut self, func: &mut Function, local: &mut LocalState, id: InstrId) {
        let snapshot = func.instr(id).kind.clone();
        let mut needs_default = true;

        match &snapshot {
            InstrKind::Gep { base, indices, inbounds } => {
                let ptr_ty = self.original_operand_ty(local, func, base);
                let result_ty = func.instr(id).ty;
                if self.rewrite_type(ptr_ty).mapped != ptr_ty
                    || self.rewrite_type(result_ty).mapped != result_ty
                {
                    let old_pointee = self.module.types.pointee(result_ty);
                    let target = self.rewrite_type(old_pointee).mapped;
                    let mut before = Vec::new();
                    let gep = {
                        let mut builder = InstrIndexBuilder { func, before: &mut before };
                        self.rewrite_gep_indices(&mut builder, ptr_ty, indices, target)
                    };
                    let (mapped_base, base_offset) = self.get_mapped_operand(local, base);
                    debug_assert_eq!(base_offset, 0, "address base inside a packed integer");
                    let new_ty = self.module.types.pointer(gep.pointee);
                    let new_id = func.add_instr(Instr::new(
                        new_ty,
                        InstrKind::Gep {
                            base: mapped_base,
                            indices: gep.indices.into_vec(),
                            inbounds: *inbounds,
                        },
                    ));
                    local.inserts_before.entry(id).or_default().extend(before);
                    local.inserts_after.entry(id).or_default().push(new_id);
                    local.mapped.insert(id, (Operand::Value(new_id), gep.bit_offset));
                    needs_default = false;
                }
            }
            InstrKind::Call { callee, args, byval } => {
                let intrinsic = match callee {
                    Callee::Func(f) => self.module.func(*f).intrinsic,
                    Callee::Indirect(_) => None,
                };
                if intrinsic == Some(Intrinsic::UpcastCollapsed) {
                    if self.rewrite_upcast_collapsed(func, local, id, &args[0]) {
                        needs_default = false;
                    }
                } else if intrinsic.is_none() && byval.iter().any(|&b| b) {
                    self.rewrite_byval_args(func, local, id, callee, args, byval);
                }
            }
            InstrKind::Store { value, ptr } => {
                if self.module.types.is_integer(func.operand_ty(value)) {
                    self.rewrite_merged_store(func, local, id, value, ptr);
                    // void result either way; nothing to retype
                }
            }
            InstrKind::Load { ptr } => {
                if self.module.types.is_integer(func.instr(id).ty)
                    && self.rewrite_merged_load(func, local, id, ptr)
                {
                    needs_default = false;
                }
            }
            _ => {}
        }

        if needs_default {
            self.retype_in_place(func, local, id);
        }

        if let InstrKind::Phi { .. } = func.instr(id).kind {
            let ty = func.instr(id).ty;
            if self.module.types.is_pointer(ty) || self.module.types.is_integer(ty) {
                local.delayed_phis.push(id);
                return;
            }
        }
        self.substitute_operands(func, local, id);
    }

    /// Default handling: the value keeps its place, only its type is
    /// remapped. An alloca whose pointer degraded to pointer-from-array
    /// still allocates the array; a zero-index address computation
    /// produces the decayed pointer for its users.
    fn retype_in_place(&mut self, func: &mut Function, local: &mut LocalState, id: InstrId) {
        let old_ty = func.instr(id).ty;
        if self.module.types.is_void(old_ty) {
            return;
        }
        let info = self.rewrite_type(old_ty);
        if info.mapped == old_ty {
            return;
        }
        local.original_tys.insert(LocalKey::Instr(id), old_ty);

        let is_alloca = matches!(func.instr(id).kind, InstrKind::Alloca { .. });
        if is_alloca && matches!(info.kind, MappingKind::PointerFromArray) {
            let array_ty = self.rewrite_type(self.module.types.pointee(old_ty)).mapped;
            let array_ptr = self.module.types.pointer(array_ty);
            {
                let instr = func.instr_mut(id);
                instr.ty = array_ptr;
                if let InstrKind::Alloca { allocated } = &mut instr.kind {
                    *allocated = array_ty;
                }
            }
            let decay = func.add_instr(Instr::new(
                info.mapped,
                InstrKind::Gep {
                    base: Operand::Value(id),
                    indices: vec![Operand::index(0), Operand::index(0)],
                    inbounds: true,
                },
            ));
            local.inserts_after.entry(id).or_default().push(decay);
            local.mapped.insert(id, (Operand::Value(decay), 0));
            return;
        }

        let new_allocated =
            is_alloca.then(|| self.module.types.pointee(info.mapped));
        let instr = func.instr_mut(id);
        instr.ty = info.mapped;
        if let (InstrKind::Alloca { allocated }, Some(new_allocated)) =
            (&mut instr.kind, new_allocated)
        {
            *allocated = new_allocated;
        }
    }

    /// An upcast into a collapsed struct is just the address of the
    /// first (transitively first) member.
    fn rewrite_upcast_collapsed(
        &mut self,
        func: &mut Function,
        local: &mut LocalState,
        id: InstrId,
        object: &Operand,
    ) -> bool {
        let ret_pointee = self.module.types.pointee(func.instr(id).ty);
        let ret_kind = self.rewrite_type(ret_pointee).kind;
        let op_ty = self.original_operand_ty(local, func, object);
        let op_kind = self.rewrite_type(self.module.types.pointee(op_ty)).kind;
        if !ret_kind.is_collapsed_struct() || op_kind.is_collapsed_struct() {
            // both sides collapsed (or neither): the operand already is
            // the right value after plain remapping
            return false;
        }
        let (mapped_op, offset) = self.get_mapped_operand(local, object);
        debug_assert_eq!(offset, 0);
        let mapped_ty = func.operand_ty(&mapped_op);
        let through_two = {
            let one = self.module.types.element_at(mapped_ty, 0);
            self.module.types.element_at(one, 0)
        };
        let (depth, pointee) = if self.module.types.is_array(through_two) {
            (3, self.module.types.array_elem(through_two))
        } else {
            (2, through_two)
        };
        let gep_ty = self.module.types.pointer(pointee);
        let new_id = func.add_instr(Instr::new(
            gep_ty,
            InstrKind::Gep {
                base: mapped_op,
                indices: (0..depth).map(|_| Operand::index(0)).collect(),
                inbounds: true,
            },
        ));
        local.inserts_after.entry(id).or_default().push(new_id);
        local.mapped.insert(id, (Operand::Value(new_id), 0));
        true
    }

    /// A by-value argument passes a copy of the pointee. When the
    /// pointee became an array the copy must be spelled out: allocate,
    /// copy the bytes, pass the decayed pointer. Callees that only read
    /// the argument skip the copy.
    fn rewrite_byval_args(
        &mut self,
        func: &mut Function,
        local: &mut LocalState,
        id: InstrId,
        callee: &Callee,
        args: &[Operand],
        byval: &[bool],
    ) {
        for (i, _) in byval.iter().enumerate().filter(|&(_, &b)| b) {
            let arg_ty = self.original_operand_ty(local, func, &args[i]);
            let new_pointee = self.rewrite_type(self.module.types.pointee(arg_ty)).mapped;
            if !self.module.types.is_array(new_pointee) {
                continue;
            }
            let callee_readonly = match callee {
                Callee::Func(f) => {
                    self.module.func(*f).params.get(i).is_some_and(|p| p.readonly)
                }
                Callee::Indirect(_) => false,
            };
            if !callee_readonly {
                let (mapped_arg, offset) = self.get_mapped_operand(local, &args[i]);
                debug_assert_eq!(offset, 0);
                let elem_ptr = {
                    let elem = self.module.types.array_elem(new_pointee);
                    self.module.types.pointer(elem)
                };
                let array_ptr = self.module.types.pointer(new_pointee);
                let alloca_id = func
                    .add_instr(Instr::new(array_ptr, InstrKind::Alloca { allocated: new_pointee }));
                let decay_id = func.add_instr(Instr::new(
                    elem_ptr,
                    InstrKind::Gep {
                        base: Operand::Value(alloca_id),
                        indices: vec![Operand::index(0), Operand::index(0)],
                        inbounds: true,
                    },
                ));
                let byte_len = self.layout.alloc_size(&self.module.types, new_pointee);
                let memcpy = self.get_or_declare_memcpy(elem_ptr);
                let copy_id = func.add_instr(Instr::new(
                    TyIdx::VOID,
                    InstrKind::Call {
                        callee: Callee::Func(memcpy),
                        args: vec![
                            Operand::Value(decay_id),
                            mapped_arg,
                            Operand::Const(Constant::int(TyIdx::I32, u64::from(byte_len))),
                        ],
                        byval: Vec::new(),
                    },
                ));
                local
                    .inserts_before
                    .entry(id)
                    .or_default()
                    .extend([alloca_id, decay_id, copy_id]);
                if let InstrKind::Call { args, .. } = &mut func.instr_mut(id).kind {
                    args[i] = Operand::Value(decay_id);
                }
            }
            if let InstrKind::Call { byval, .. } = &mut func.instr_mut(id).kind {
                byval[i] = false;
            }
        }
    }

    fn get_or_declare_memcpy(&mut self, elem_ptr: TyIdx) -> FuncId {
        let overload = [elem_ptr, elem_ptr, TyIdx::I32];
        if let Some(f) = self.module.find_intrinsic(Intrinsic::MemCpy, &overload) {
            return f;
        }
        let fn_ty = self.module.types.func(TyIdx::VOID, &overload, false);
        self.module.declare_intrinsic(Intrinsic::MemCpy, fn_ty)
    }

    /// A store of a narrow integer whose storage was packed into a
    /// shared slot becomes read, mask, deposit, write-back.
    fn rewrite_merged_store(
        &mut self,
        func: &mut Function,
        local: &mut LocalState,
        id: InstrId,
        value: &Operand,
        ptr: &Operand,
    ) {
        let (mapped_ptr, offset) = self.get_mapped_operand(local, ptr);
        let mapped_ptr_ty = func.operand_ty(&mapped_ptr);
        if mapped_ptr_ty == func.operand_ty(ptr) {
            return;
        }
        let wide_ty = self.module.types.pointee(mapped_ptr_ty);
        let wide_bits = self.module.types.int_width(wide_ty);
        let (mapped_value, value_offset) = self.get_mapped_operand(local, value);
        debug_assert_eq!(value_offset, 0);
        let width = self.module.types.int_width(func.operand_ty(&mapped_value));

        let load_id =
            func.add_instr(Instr::new(wide_ty, InstrKind::Load { ptr: mapped_ptr.clone() }));
        let mask = !(((1u64 << width) - 1) << offset) & ((1u64 << wide_bits) - 1);
        let and_id = func.add_instr(Instr::new(
            wide_ty,
            InstrKind::Binary {
                op: BinOp::And,
                lhs: Operand::Value(load_id),
                rhs: Operand::Const(Constant::int(wide_ty, mask)),
            },
        ));
        let zext_id =
            func.add_instr(Instr::new(wide_ty, InstrKind::ZExt { value: mapped_value }));
        let mut sequence = vec![load_id, and_id, zext_id];
        let mut deposit = Operand::Value(zext_id);
        if offset != 0 {
            let shl_id = func.add_instr(Instr::new(
                wide_ty,
                InstrKind::Binary {
                    op: BinOp::Shl,
                    lhs: deposit,
                    rhs: Operand::Const(Constant::int(wide_ty, u64::from(offset))),
                },
            ));
            sequence.push(shl_id);
            deposit = Operand::Value(shl_id);
        }
        let or_id = func.add_instr(Instr::new(
            wide_ty,
            InstrKind::Binary { op: BinOp::Or, lhs: Operand::Value(and_id), rhs: deposit },
        ));
        sequence.push(or_id);
        local.inserts_before.entry(id).or_default().extend(sequence);
        // the store now writes the whole slot; the pointer operand is
        // remapped by the generic substitution
        if let InstrKind::Store { value, .. } = &mut func.instr_mut(id).kind {
            *value = Operand::Value(or_id);
        }
    }

    /// A load of a packed field widens to the whole slot, then shifts
    /// and truncates back down; consumers see the truncated value.
    fn rewrite_merged_load(
        &mut self,
        func: &mut Function,
        local: &mut LocalState,
        id: InstrId,
        ptr: &Operand,
    ) -> bool {
        let (mapped_ptr, offset) = self.get_mapped_operand(local, ptr);
        let mapped_ptr_ty = func.operand_ty(&mapped_ptr);
        if mapped_ptr_ty == func.operand_ty(ptr) {
            return false;
        }
        let wide_ty = self.module.types.pointee(mapped_ptr_ty);
        let old_ty = func.instr(id).ty;
        local.original_tys.insert(LocalKey::Instr(id), old_ty);
        func.instr_mut(id).ty = wide_ty;

        let mut source = Operand::Value(id);
        let mut sequence = Vec::new();
        if offset != 0 {
            let ashr_id = func.add_instr(Instr::new(
                wide_ty,
                InstrKind::Binary {
                    op: BinOp::AShr,
                    lhs: source,
                    rhs: Operand::Const(Constant::int(wide_ty, u64::from(offset))),
                },
            ));
            sequence.push(ashr_id);
            source = Operand::Value(ashr_id);
        }
        let trunc_id = func.add_instr(Instr::new(old_ty, InstrKind::Trunc { value: source }));
        sequence.push(trunc_id);
        local.inserts_after.entry(id).or_default().extend(sequence);
        local.mapped.insert(id, (Operand::Value(trunc_id), 0));
        true
    }

    fn substitute_operands(&mut self, func: &mut Function, local: &LocalState, id: InstrId) {
        let mut ops = Vec::new();
        func.instr(id).for_each_operand(|op| ops.push(op.clone()));
        // residual offsets were consumed by the load/store handling;
        // plain uses take the value as-is
        let mapped: Vec<Operand> =
            ops.iter().map(|op| self.get_mapped_operand(local, op).0).collect();
        let mut it = mapped.into_iter();
        func.instr_mut(id).for_each_operand_mut(|op| *op = it.next().unwrap());
    }

    fn get_mapped_operand(&mut self, local: &LocalState, op: &Operand) -> (Operand, u32) {
        match op {
            Operand::Value(id) => {
                local.mapped.get(id).cloned().unwrap_or_else(|| (op.clone(), 0))
            }
            Operand::Arg(_) => (op.clone(), 0),
            Operand::Const(c) => {
                let (rewritten, offset) = self.rewrite_constant(c);
                (Operand::Const(rewritten), offset)
            }
        }
    }

    /// The type an operand had before this pass touched it.
    fn original_operand_ty(
        &mut self,
        local: &LocalState,
        func: &Function,
        op: &Operand,
    ) -> TyIdx {
        match op {
            Operand::Value(id) => local
                .original_tys
                .get(&LocalKey::Instr(*id))
                .copied()
                .unwrap_or_else(|| func.instr(*id).ty),
            Operand::Arg(i) => local
                .original_tys
                .get(&LocalKey::Arg(*i))
                .copied()
                .unwrap_or_else(|| func.params[*i as usize].ty),
            Operand::Const(c) => self.original_constant_ty(c),
        }
    }
}

/// Deterministic traversal: entry first, then successors in branch
/// order as they are discovered, then any unreached blocks.
fn block_order(func: &Function) -> Vec<veld_ir::BlockId> {
    use veld_ir::BlockId;
    let mut order = vec![BlockId::new(0)];
    let mut seen: FxHashSet<BlockId> = order.iter().copied().collect();
    let mut i = 0;
    while i < order.len() {
        for succ in func.blocks[order[i].index()].term.successors() {
            if seen.insert(succ) {
                order.push(succ);
            }
        }
        i += 1;
    }
    for b in 0..func.blocks.len() {
        let id = BlockId::new(b as u32);
        if seen.insert(id) {
            order.push(id);
        }
    }
    order
}

/// Weave the recorded insertions into the block bodies and drop the
/// superseded instructions. Allocas and loads survive replacement:
/// their replacement values read through them.
fn splice_blocks(func: &mut Function, local: &mut LocalState) {
    let mut erased: FxHashSet<InstrId> = FxHashSet::default();
    for b in 0..func.blocks.len() {
        let old = std::mem::take(&mut func.blocks[b].instrs);
        let mut rebuilt = Vec::with_capacity(old.len());
        for id in old {
            if let Some(before) = local.inserts_before.remove(&id) {
                rebuilt.extend(before);
            }
            let keep = !local.mapped.contains_key(&id)
                || matches!(
                    func.instrs[id.index()].kind,
                    InstrKind::Alloca { .. } | InstrKind::Load { .. }
                );
            if keep {
                rebuilt.push(id);
            } else {
                erased.insert(id);
            }
            if let Some(after) = local.inserts_after.remove(&id) {
                rebuilt.extend(after);
            }
        }
        func.blocks[b].instrs = rebuilt;
    }
    debug_assert!(local.inserts_before.is_empty(), "insertion anchor not found in any block");
    debug_assert!(local.inserts_after.is_empty(), "insertion anchor not found in any block");

    if cfg!(debug_assertions) {
        for block in &func.blocks {
            for &id in &block.instrs {
                func.instr(id).for_each_operand(|op| {
                    if let Operand::Value(used) = op {
                        debug_assert!(
                            !erased.contains(used),
                            "dangling reference to a superseded instruction"
                        );
                    }
                });
            }
        }
    }
}
