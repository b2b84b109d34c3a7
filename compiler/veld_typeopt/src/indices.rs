//! Address-index rewriting.
//!
//! An address computation walks from a pointer through a chain of
//! member/element indices. After types are rewritten the same logical
//! path needs different indices: collapsed levels drop out, merged
//! members substitute their slot (arrays also add an element offset,
//! packed integers turn into a residual bit offset), flattened levels
//! fold a scaled index into the previous one, and byte-layout regions
//! switch to byte arithmetic.
//!
//! The walk itself is shared between instruction and constant contexts
//! through [`IndexBuilder`]: the instruction builder materializes add
//! and multiply instructions in front of the anchor, the constant
//! builder folds them.

use smallvec::SmallVec;

use veld_ir::{BinOp, Constant, Function, Instr, InstrId, InstrKind, Operand, TyIdx};

use crate::mapping::MappingKind;
use crate::TypeOptimizer;

/// Index arithmetic over either operands or constants.
pub(crate) trait IndexBuilder {
    type Index: Clone;

    fn const_index(&mut self, value: u64) -> Self::Index;
    fn add(&mut self, a: Self::Index, b: Self::Index) -> Self::Index;
    fn mul(&mut self, a: Self::Index, multiplier: u32) -> Self::Index;
    /// The value, if the index is an integer constant.
    fn const_value(&self, index: &Self::Index) -> Option<u64>;
}

/// Folds index arithmetic at compile time.
pub(crate) struct ConstIndexBuilder;

impl IndexBuilder for ConstIndexBuilder {
    type Index = Constant;

    fn const_index(&mut self, value: u64) -> Constant {
        Constant::index(value)
    }

    fn add(&mut self, a: Constant, b: Constant) -> Constant {
        Constant::add(a, b)
    }

    fn mul(&mut self, a: Constant, multiplier: u32) -> Constant {
        Constant::mul(a, multiplier)
    }

    fn const_value(&self, index: &Constant) -> Option<u64> {
        index.as_int()
    }
}

/// Materializes index arithmetic as instructions, recorded for
/// insertion in front of the anchor instruction.
pub(crate) struct InstrIndexBuilder<'f> {
    pub func: &'f mut Function,
    pub before: &'f mut Vec<InstrId>,
}

impl IndexBuilder for InstrIndexBuilder<'_> {
    type Index = Operand;

    fn const_index(&mut self, value: u64) -> Operand {
        Operand::index(value)
    }

    fn add(&mut self, a: Operand, b: Operand) -> Operand {
        let ty = self.func.operand_ty(&a);
        let id = self
            .func
            .add_instr(Instr::new(ty, InstrKind::Binary { op: BinOp::Add, lhs: a, rhs: b }));
        self.before.push(id);
        Operand::Value(id)
    }

    fn mul(&mut self, a: Operand, multiplier: u32) -> Operand {
        let ty = self.func.operand_ty(&a);
        let rhs = Operand::Const(Constant::int(ty, u64::from(multiplier)));
        let id = self
            .func
            .add_instr(Instr::new(ty, InstrKind::Binary { op: BinOp::Mul, lhs: a, rhs }));
        self.before.push(id);
        Operand::Value(id)
    }

    fn const_value(&self, index: &Operand) -> Option<u64> {
        index.as_const_int()
    }
}

/// Result of rewriting one index chain.
pub(crate) struct RewrittenGep<I> {
    pub indices: SmallVec<[I; 4]>,
    /// Residual bit offset from fields packed into shared integers.
    /// Non-zero means the address selects a sub-word; the consumer
    /// must shift and mask.
    pub bit_offset: u32,
    /// The type the rewritten indices actually reach. Wider than the
    /// rewritten pointee when the walk ends inside a packed integer.
    pub pointee: TyIdx,
}

/// Append `index`, or fold it into the last one when the previous level
/// was flattened away.
fn push_index<B: IndexBuilder>(
    builder: &mut B,
    out: &mut SmallVec<[B::Index; 4]>,
    add_to_last: &mut bool,
    index: B::Index,
) {
    if *add_to_last {
        let last = out.pop().unwrap();
        out.push(builder.add(last, index));
    } else {
        out.push(index);
    }
    *add_to_last = false;
}

impl TypeOptimizer<'_> {
    /// Rewrite the index chain of an address computation rooted at a
    /// pointer of (original) type `ptr_ty`. `target_ty` is the rewrite
    /// of the original pointee; walking the rewritten indices from the
    /// rewritten pointer reaches it, except that a walk ending inside a
    /// packed integer reaches the whole shared slot instead.
    pub(crate) fn rewrite_gep_indices<B: IndexBuilder>(
        &mut self,
        builder: &mut B,
        ptr_ty: TyIdx,
        indices: &[B::Index],
        target_ty: TyIdx,
    ) -> RewrittenGep<B::Index> {
        let mut out: SmallVec<[B::Index; 4]> = SmallVec::new();
        let mut add_to_last = false;
        let mut bit_offset = 0u32;
        // set when the final level lands in a packed integer slot
        let mut packed_slot: Option<TyIdx> = None;
        let mut cur = ptr_ty;

        for (pos, index) in indices.iter().enumerate() {
            let info = self.rewrite_type(cur);
            match info.kind {
                MappingKind::Identical => {
                    push_index(builder, &mut out, &mut add_to_last, index.clone());
                }
                MappingKind::Collapsed => {
                    // this level no longer exists; the sole member is
                    // addressed by whatever indices remain
                }
                MappingKind::ByteLayoutToArray => {
                    assert_eq!(
                        bit_offset, 0,
                        "packed-integer offset reached a byte-layout region"
                    );
                    debug_assert!(self.module.types.is_struct(cur));
                    return self.rewrite_byte_layout_indices(
                        builder,
                        cur,
                        info.mapped,
                        &indices[pos..],
                        target_ty,
                        out,
                        add_to_last,
                    );
                }
                MappingKind::PointerFromArray | MappingKind::FlattenedArray => {
                    debug_assert!(
                        pos == 0 || matches!(info.kind, MappingKind::FlattenedArray),
                        "pointer level past the first index"
                    );
                    // scale by how many new elements one old element spans
                    let old_elem = self.module.types.seq_elem(cur);
                    let old_mapped = self.rewrite_type(old_elem).mapped;
                    let old_size = self.layout.alloc_size(&self.module.types, old_mapped);
                    let new_elem = self.module.types.seq_elem(info.mapped);
                    let new_size = self.layout.alloc_size(&self.module.types, new_elem);
                    assert!(
                        old_size.is_multiple_of(new_size),
                        "flattened element size does not divide the old element size"
                    );
                    let scaled = builder.mul(index.clone(), old_size / new_size);
                    push_index(builder, &mut out, &mut add_to_last, scaled);
                    // deeper levels of the same flattened array keep
                    // folding into this index
                    add_to_last = true;
                }
                MappingKind::MergedMembers { ref members }
                | MappingKind::MergedMembersCollapsed { ref members } => {
                    debug_assert!(self.module.types.is_struct(cur));
                    let field = builder
                        .const_value(index)
                        .expect("struct member index must be constant")
                        as u32;
                    let slot = members[field as usize];
                    let slot_ty = if let MappingKind::MergedMembers { .. } = info.kind {
                        let slot_index = builder.const_index(u64::from(slot.index));
                        push_index(builder, &mut out, &mut add_to_last, slot_index);
                        self.module.types.field(info.mapped, slot.index)
                    } else {
                        // the merged member then collapsed; no index
                        // selects it
                        debug_assert_eq!(slot.index, 0);
                        info.mapped
                    };
                    let field_ty = self.module.types.field(cur, field);
                    let mapped_field = self.rewrite_type(field_ty).mapped;
                    if self.module.types.is_integer(mapped_field) {
                        // packed into a shared integer; surface the bit
                        // position instead of an index
                        bit_offset += slot.offset;
                        packed_slot = Some(slot_ty);
                    } else if slot.offset != 0 {
                        let elem_offset = builder.const_index(u64::from(slot.offset));
                        push_index(builder, &mut out, &mut add_to_last, elem_offset);
                        // the offset selects the start element; the next
                        // index lands relative to it
                        add_to_last = true;
                    }
                }
                MappingKind::Collapsing | MappingKind::CollapsingButUsed => {
                    unreachable!("transient mapping kind escaped the classifier")
                }
            }

            cur = if self.module.types.is_struct(cur) {
                let field = builder
                    .const_value(index)
                    .expect("struct member index must be constant")
                    as u32;
                self.module.types.field(cur, field)
            } else {
                self.module.types.seq_elem(cur)
            };
        }

        assert_eq!(
            self.rewrite_type(cur).mapped,
            target_ty,
            "rewritten address walk does not reach the rewritten pointee"
        );
        let pointee = match packed_slot {
            Some(slot_ty) => slot_ty,
            None if self.module.types.is_array(target_ty) => {
                let zero = builder.const_index(0);
                push_index(builder, &mut out, &mut add_to_last, zero);
                self.module.types.array_elem(target_ty)
            }
            None => target_ty,
        };
        RewrittenGep { indices: out, bit_offset, pointee }
    }

    /// Inside a byte-layout region all remaining levels address bytes
    /// of one flat array; convert member offsets and element strides to
    /// multiples of the array element size.
    #[allow(clippy::too_many_arguments)]
    fn rewrite_byte_layout_indices<B: IndexBuilder>(
        &mut self,
        builder: &mut B,
        start: TyIdx,
        mapped: TyIdx,
        indices: &[B::Index],
        target_ty: TyIdx,
        mut out: SmallVec<[B::Index; 4]>,
        mut add_to_last: bool,
    ) -> RewrittenGep<B::Index> {
        if mapped == target_ty {
            // the whole region is the target; stop at its start
            let pointee = if self.module.types.is_array(target_ty) {
                let zero = builder.const_index(0);
                push_index(builder, &mut out, &mut add_to_last, zero);
                self.module.types.array_elem(target_ty)
            } else {
                target_ty
            };
            return RewrittenGep { indices: out, bit_offset: 0, pointee };
        }
        if !self.module.types.is_array(mapped) {
            // degenerate single-element region
            debug_assert_eq!(self.rewrite_type(mapped).mapped, target_ty);
            return RewrittenGep { indices: out, bit_offset: 0, pointee: target_ty };
        }
        let elem = self.module.types.array_elem(mapped);
        let elem_size = self.layout.alloc_size(&self.module.types, elem);

        let mut cur = start;
        for index in indices {
            if self.module.types.is_struct(cur) {
                let field = builder
                    .const_value(index)
                    .expect("struct member index must be constant")
                    as u32;
                let byte_offset = self.layout.field_offset(&self.module.types, cur, field);
                assert!(
                    byte_offset.is_multiple_of(elem_size),
                    "byte-layout member offset not aligned to the element size"
                );
                let scaled = builder.const_index(u64::from(byte_offset / elem_size));
                push_index(builder, &mut out, &mut add_to_last, scaled);
                cur = self.module.types.field(cur, field);
            } else {
                let step = self.module.types.seq_elem(cur);
                let step_size = self.layout.alloc_size(&self.module.types, step);
                assert!(
                    step_size.is_multiple_of(elem_size),
                    "byte-layout element stride not aligned to the element size"
                );
                let scaled = builder.mul(index.clone(), step_size / elem_size);
                push_index(builder, &mut out, &mut add_to_last, scaled);
                cur = step;
            }
            // everything below lives in the same flat array
            add_to_last = true;
        }
        debug_assert_eq!(self.rewrite_type(cur).mapped, target_ty);
        let pointee = if self.module.types.is_array(target_ty) {
            let zero = builder.const_index(0);
            push_index(builder, &mut out, &mut add_to_last, zero);
            self.module.types.array_elem(target_ty)
        } else {
            target_ty
        };
        RewrittenGep { indices: out, bit_offset: 0, pointee }
    }
}
