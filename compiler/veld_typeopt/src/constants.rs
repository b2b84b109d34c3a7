//! Constant rewriting.
//!
//! Constants are rebuilt as trees in the rewritten type system. Like
//! addresses, a rewritten constant carries a residual bit offset: a
//! constant address of a field packed into a shared integer points at
//! the whole slot, offset by the field's bit position.

use veld_ir::{ConstKind, Constant, TyIdx, TypePool};

use crate::indices::ConstIndexBuilder;
use crate::mapping::{MappingKind, TypeMapping};
use crate::{GlobalValueRef, TypeOptimizer};

impl TypeOptimizer<'_> {
    /// Rewrite a constant, returning the replacement and the residual
    /// bit offset of packed-integer addresses.
    pub(crate) fn rewrite_constant(&mut self, c: &Constant) -> (Constant, u32) {
        match &c.kind {
            ConstKind::Global(id) => {
                let mapped = self
                    .globals_map
                    .get(id)
                    .cloned()
                    .expect("global referenced before being rewritten");
                (mapped, 0)
            }
            ConstKind::Func(id) => {
                let orig_ty = self.original_constant_ty(c);
                let mapped_ty = self.rewrite_type(orig_ty).mapped;
                (Constant { ty: mapped_ty, kind: ConstKind::Func(*id) }, 0)
            }
            ConstKind::Gep { base, indices } => {
                let base_ty = self.original_constant_ty(base);
                let (new_base, base_offset) = self.rewrite_constant(base);
                debug_assert_eq!(base_offset, 0, "constant address base inside a packed integer");
                let old_pointee = self.module.types.pointee(c.ty);
                let target = self.rewrite_type(old_pointee).mapped;
                let gep =
                    self.rewrite_gep_indices(&mut ConstIndexBuilder, base_ty, indices, target);
                let ty = self.module.types.pointer(gep.pointee);
                let kind = ConstKind::Gep {
                    base: Box::new(new_base),
                    indices: gep.indices.into_vec(),
                };
                (Constant { ty, kind }, gep.bit_offset)
            }
            ConstKind::PtrCast(inner) => {
                let (new_inner, offset) = self.rewrite_constant(inner);
                debug_assert_eq!(offset, 0, "packed-integer address under a pointer cast");
                let mapped = self.rewrite_type(c.ty).mapped;
                (Constant { ty: mapped, kind: ConstKind::PtrCast(Box::new(new_inner)) }, 0)
            }
            ConstKind::IntToPtr(inner) => {
                let mapped = self.rewrite_type(c.ty).mapped;
                (Constant { ty: mapped, kind: ConstKind::IntToPtr(inner.clone()) }, 0)
            }
            _ => {
                let info = self.rewrite_type(c.ty);
                if info.mapped == c.ty {
                    return (c.clone(), 0);
                }
                let rewritten = match &c.kind {
                    ConstKind::Zero => Constant::null_value(&self.module.types, info.mapped),
                    ConstKind::Null => Constant { ty: info.mapped, kind: ConstKind::Null },
                    ConstKind::Undef => Constant::undef(info.mapped),
                    ConstKind::Struct(elems) => {
                        let elems = elems.clone();
                        return self.rewrite_struct_constant(&elems, &info);
                    }
                    ConstKind::Array(elems) => {
                        let elems = elems.clone();
                        self.rewrite_array_constant(c.ty, &elems, info.mapped)
                    }
                    kind => unreachable!("scalar constant changed type: {kind:?}"),
                };
                (rewritten, 0)
            }
        }
    }

    /// The pointer type a global-value constant had before the pass, or
    /// the constant's own type for anything else.
    pub(crate) fn original_constant_ty(&mut self, c: &Constant) -> TyIdx {
        match c.kind {
            ConstKind::Global(id) => match self.global_types.get(&GlobalValueRef::Global(id)) {
                Some(&ty) => ty,
                None => {
                    let value_ty = self.module.global(id).value_ty;
                    self.module.types.pointer(value_ty)
                }
            },
            ConstKind::Func(id) => match self.global_types.get(&GlobalValueRef::Func(id)) {
                Some(&ty) => ty,
                None => {
                    let fn_ty = self.module.func(id).ty;
                    self.module.types.pointer(fn_ty)
                }
            },
            _ => c.ty,
        }
    }

    fn rewrite_struct_constant(
        &mut self,
        elems: &[Constant],
        info: &TypeMapping,
    ) -> (Constant, u32) {
        match &info.kind {
            MappingKind::ByteLayoutToArray => {
                let base = if self.module.types.is_array(info.mapped) {
                    self.module.types.array_elem(info.mapped)
                } else {
                    info.mapped
                };
                let mut leaves = Vec::new();
                for elem in elems {
                    push_base_leaves(&self.module.types, &mut leaves, elem, base);
                }
                if self.module.types.is_array(info.mapped) {
                    debug_assert_eq!(
                        leaves.len() as u32,
                        self.module.types.array_len(info.mapped)
                    );
                    (Constant { ty: info.mapped, kind: ConstKind::Array(leaves) }, 0)
                } else {
                    assert_eq!(leaves.len(), 1);
                    (leaves.pop().unwrap(), 0)
                }
            }
            MappingKind::Collapsed => {
                assert_eq!(elems.len(), 1);
                self.rewrite_constant(&elems[0])
            }
            MappingKind::MergedMembers { members }
            | MappingKind::MergedMembersCollapsed { members } => {
                let members = members.clone();
                let collapsed = info.kind.is_collapsed_struct();
                let mut new_elems: Vec<Constant> = Vec::new();
                for (i, elem) in elems.iter().enumerate() {
                    let (rewritten, offset) = self.rewrite_constant(elem);
                    debug_assert_eq!(offset, 0);
                    let slot = members[i];
                    let slot_idx = slot.index as usize;
                    if slot_idx == new_elems.len() {
                        new_elems.push(rewritten);
                        continue;
                    }
                    // merged with the previous member: splice arrays,
                    // OR packed integers into place
                    let occupant = new_elems[slot_idx].clone();
                    let merged = if self.module.types.is_array(occupant.ty) {
                        let elem_ty = self.module.types.array_elem(occupant.ty);
                        let mut parts = Vec::new();
                        push_array_parts(&self.module.types, &mut parts, &occupant);
                        push_array_parts(&self.module.types, &mut parts, &rewritten);
                        let ty = self.module.types.array(elem_ty, parts.len() as u32);
                        Constant { ty, kind: ConstKind::Array(parts) }
                    } else {
                        let old = occupant.as_int().expect("packed member must be an integer");
                        let new = rewritten.as_int().expect("packed member must be an integer");
                        let slot_ty = if collapsed {
                            info.mapped
                        } else {
                            self.module.types.field(info.mapped, slot.index)
                        };
                        Constant::int(slot_ty, old | (new << slot.offset))
                    };
                    new_elems[slot_idx] = merged;
                }
                if collapsed {
                    assert_eq!(new_elems.len(), 1);
                    (new_elems.pop().unwrap(), 0)
                } else {
                    (Constant { ty: info.mapped, kind: ConstKind::Struct(new_elems) }, 0)
                }
            }
            MappingKind::Identical => {
                let mut new_elems = Vec::with_capacity(elems.len());
                for elem in elems {
                    let (rewritten, offset) = self.rewrite_constant(elem);
                    debug_assert_eq!(offset, 0);
                    new_elems.push(rewritten);
                }
                (Constant { ty: info.mapped, kind: ConstKind::Struct(new_elems) }, 0)
            }
            kind => unreachable!("struct constant mapped through {kind:?}"),
        }
    }

    fn rewrite_array_constant(
        &mut self,
        old_ty: TyIdx,
        elems: &[Constant],
        mapped: TyIdx,
    ) -> Constant {
        // rows are spliced whenever the element lands on an array, not
        // only when the element itself flattened: a row of scalars maps
        // identically yet the outer array still fuses
        let old_elem = self.module.types.array_elem(old_ty);
        let elem_mapped = self.rewrite_type(old_elem).mapped;
        let flattened = self.module.types.is_array(elem_mapped);
        let mut new_elems = Vec::with_capacity(elems.len());
        for elem in elems {
            let (rewritten, offset) = self.rewrite_constant(elem);
            debug_assert_eq!(offset, 0);
            if flattened {
                push_array_parts(&self.module.types, &mut new_elems, &rewritten);
            } else {
                new_elems.push(rewritten);
            }
        }
        debug_assert_eq!(new_elems.len() as u32, self.module.types.array_len(mapped));
        Constant { ty: mapped, kind: ConstKind::Array(new_elems) }
    }
}

/// Flatten a byte-layout initializer to its base-element leaves.
fn push_base_leaves(pool: &TypePool, out: &mut Vec<Constant>, c: &Constant, base: TyIdx) {
    if c.ty == base {
        out.push(c.clone());
        return;
    }
    match &c.kind {
        ConstKind::Struct(elems) | ConstKind::Array(elems) => {
            for elem in elems {
                push_base_leaves(pool, out, elem, base);
            }
        }
        ConstKind::Zero => {
            if pool.is_array(c.ty) {
                let elem = pool.array_elem(c.ty);
                for _ in 0..pool.array_len(c.ty) {
                    push_base_leaves(pool, out, &Constant::null_value(pool, elem), base);
                }
            } else {
                let fields = pool.struct_data(c.ty).fields.clone();
                for field in fields {
                    push_base_leaves(pool, out, &Constant::null_value(pool, field), base);
                }
            }
        }
        _ => panic!("byte-layout initializer does not decompose to the element type"),
    }
}

/// Append the elements of an array constant, expanding zero and undef
/// fillers.
fn push_array_parts(pool: &TypePool, out: &mut Vec<Constant>, c: &Constant) {
    match &c.kind {
        ConstKind::Array(elems) => out.extend(elems.iter().cloned()),
        ConstKind::Zero => {
            let elem = pool.array_elem(c.ty);
            for _ in 0..pool.array_len(c.ty) {
                out.push(Constant::null_value(pool, elem));
            }
        }
        ConstKind::Undef => {
            let elem = pool.array_elem(c.ty);
            for _ in 0..pool.array_len(c.ty) {
                out.push(Constant::undef(elem));
            }
        }
        _ => panic!("expected an array constant"),
    }
}
