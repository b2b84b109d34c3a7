//! Type classification and rewriting.
//!
//! [`TypeOptimizer::rewrite_type`] maps every old type descriptor to
//! its replacement plus a [`MappingKind`], memoizing the result. Struct
//! rewriting is where all the real decisions happen: byte-layout
//! structs may become arrays, adjacent array members and narrow
//! non-escaping integers merge into shared slots, and single-member
//! structs collapse into the member itself when no downcast or export
//! needs their identity.
//!
//! Recursion through self-referential types is broken in two ways:
//! a replacement struct is reserved and tentatively mapped before its
//! members are rewritten, and a collapse in progress is marked with the
//! transient `Collapsing` kind. A cycle that reaches the marker through
//! a struct member resolves against the member's replacement; one that
//! reaches it through anything else proves the type is still used as
//! itself and degrades the marker to `CollapsingButUsed`, which aborts
//! the collapse.

use veld_ir::{StructFlags, TyIdx, TyKind};

use crate::mapping::{MappingKind, MemberSlot, TypeMapping};
use crate::TypeOptimizer;

impl TypeOptimizer<'_> {
    /// Resolve the mapping for `ty`, computing and memoizing it on
    /// first use.
    pub fn rewrite_type(&mut self, ty: TyIdx) -> TypeMapping {
        if let Some(entry) = self.types_mapping.get_mut(&ty) {
            if matches!(entry.kind, MappingKind::Collapsing) {
                let mapped = entry.mapped;
                if self.module.types.is_struct(mapped) {
                    // a struct member reached the marker; resolve
                    // against the member's own replacement
                    debug_assert_ne!(mapped, ty);
                    return self.rewrite_type(mapped);
                }
                // a non-struct consumer needs the type as-is
                entry.kind = MappingKind::CollapsingButUsed;
            }
            return self.types_mapping[&ty].clone();
        }
        let mapping = self.compute_mapping(ty);
        self.types_mapping.insert(ty, mapping.clone());
        mapping
    }

    fn compute_mapping(&mut self, ty: TyIdx) -> TypeMapping {
        if self.module.types.is_struct(ty) {
            return self.rewrite_struct(ty);
        }
        match self.module.types.kind(ty).clone() {
            TyKind::Func { ret, params, vararg } => {
                // function types are rebuilt member-wise, never collapsed
                let new_ret = self.rewrite_type(ret).mapped;
                let new_params: Vec<TyIdx> =
                    params.iter().map(|&p| self.rewrite_type(p).mapped).collect();
                let mapped = self.module.types.func(new_ret, &new_params, vararg);
                TypeMapping::identical(mapped)
            }
            TyKind::Pointer(pointee) => {
                let info = self.rewrite_type(pointee);
                if self.module.types.is_array(info.mapped) {
                    // the pointee became an array; point at its element
                    // and let the length become implicit
                    let elem = self.module.types.array_elem(info.mapped);
                    let mapped = self.module.types.pointer(elem);
                    TypeMapping::new(mapped, MappingKind::PointerFromArray)
                } else if info.mapped == pointee {
                    TypeMapping::identical(ty)
                } else {
                    let mapped = self.module.types.pointer(info.mapped);
                    TypeMapping::identical(mapped)
                }
            }
            TyKind::Array { elem, len } => {
                let info = self.rewrite_type(elem);
                if self.module.types.is_array(info.mapped) {
                    let inner_elem = self.module.types.array_elem(info.mapped);
                    let inner_len = self.module.types.array_len(info.mapped);
                    let mapped = self.module.types.array(inner_elem, len * inner_len);
                    TypeMapping::new(mapped, MappingKind::FlattenedArray)
                } else if info.mapped == elem {
                    TypeMapping::identical(ty)
                } else {
                    let mapped = self.module.types.array(info.mapped, len);
                    TypeMapping::identical(mapped)
                }
            }
            TyKind::Void | TyKind::Int(_) | TyKind::Float(_) | TyKind::Host(_) => {
                TypeMapping::identical(ty)
            }
        }
    }

    fn rewrite_struct(&mut self, st: TyIdx) -> TypeMapping {
        if self.module.types.is_opaque_struct(st) {
            return TypeMapping::identical(st);
        }
        let flags = self.module.types.struct_flags(st);
        let byte_layout = flags.contains(StructFlags::BYTE_LAYOUT);
        let fixed_layout = flags.contains(StructFlags::FIXED_LAYOUT);

        if byte_layout {
            if let Some(mapping) = self.try_byte_layout_to_array(st) {
                return mapping;
            }
        }

        // Reserve the replacement struct and move the name over; the
        // obsolete node keeps a placeholder name so metadata keyed by
        // name resolves to the replacement.
        let name = self.module.types.struct_data(st).name.clone();
        self.module.types.rename_struct(st, "struct.obsolete");
        let new_st = self.module.types.reserve_struct(&name, flags);
        // Tentative self mapping, so recursion through pointers to this
        // struct resolves while the body is still being built.
        self.types_mapping.insert(st, TypeMapping::identical(new_st));
        self.types_mapping.insert(new_st, TypeMapping::identical(new_st));

        let num_fields = self.module.types.num_fields(st);
        let mut new_types: Vec<TyIdx> = Vec::with_capacity(num_fields as usize);
        let mut merged_members: Option<Vec<MemberSlot>> = None;

        if byte_layout || fixed_layout {
            // layout is frozen; rewrite each member in place
            for i in 0..num_fields {
                let field = self.module.types.field(st, i);
                let mapped = self.rewrite_type(field).mapped;
                new_types.push(mapped);
            }
        } else if num_fields > 1 {
            merged_members = self.rewrite_struct_members(st, &name, &mut new_types);
        } else if num_fields == 1 {
            // keep the original member type: the collapse check below
            // wants to look at it before it is rewritten
            new_types.push(self.module.types.field(st, 0));
        }

        if new_types.len() == 1 && !byte_layout && !fixed_layout {
            if let Some(mapping) = self.try_collapse(st, new_st, new_types[0], &merged_members) {
                return mapping;
            }
            // can't collapse; rewrite the surviving member now
            new_types[0] = self.rewrite_type(new_types[0]).mapped;
        }

        // carry the base link when the base survived as a struct; a
        // collapsed or array-ified base leaves no subobject to link
        let direct_base = self.module.types.direct_base(st).and_then(|base| {
            let mapped = self.rewrite_type(base).mapped;
            self.module.types.is_struct(mapped).then_some(mapped)
        });
        self.module.types.set_struct_body(new_st, new_types, direct_base);
        let kind = match merged_members {
            Some(members) => {
                let members: std::rc::Rc<[MemberSlot]> = members.into();
                self.members_mapping.insert(st, std::rc::Rc::clone(&members));
                MappingKind::MergedMembers { members }
            }
            None => MappingKind::Identical,
        };
        let mapping = TypeMapping::new(new_st, kind);
        self.types_mapping.insert(st, mapping.clone());
        mapping
    }

    /// Rewrite the members of a normal struct, merging adjacent arrays
    /// of the same element type and packing narrow non-escaping
    /// integers into shared 32-bit slots. Returns the member remap
    /// table when anything merged.
    fn rewrite_struct_members(
        &mut self,
        st: TyIdx,
        name: &str,
        new_types: &mut Vec<TyIdx>,
    ) -> Option<Vec<MemberSlot>> {
        let num_fields = self.module.types.num_fields(st);
        let mut members: Vec<MemberSlot> = Vec::with_capacity(num_fields as usize);
        let mut merged = false;

        // merge state never crosses an inheritance segment boundary
        let mut segment_limit = 0u32;
        let mut segment_owner = st;
        // per element type, the slot holding the open merged array
        let mut arrays_found: rustc_hash::FxHashMap<TyIdx, usize> = rustc_hash::FxHashMap::default();
        // open integer slots: (slot, bits still free out of 32)
        let mut merged_ints: Vec<(usize, u32)> = Vec::new();

        // first-base start index, shifted down as earlier members merge
        let orig_base_begin = self.module.bases_ranges.get(name).map(|v| v[0]);
        let mut base_begin = orig_base_begin;

        for i in 0..num_fields {
            if i == segment_limit {
                arrays_found.clear();
                merged_ints.clear();
                let mut owner = st;
                while let Some(base) = self.module.types.direct_base(owner) {
                    if self.module.types.num_fields(base) > i {
                        owner = base;
                    } else {
                        break;
                    }
                }
                segment_owner = owner;
                segment_limit = if segment_owner == st {
                    num_fields
                } else {
                    self.module.types.num_fields(segment_owner)
                };
            }

            let field = self.module.types.field(st, i);
            let rewritten = self.rewrite_type(field).mapped;

            if self.module.types.is_array(rewritten) {
                let elem = self.module.types.array_elem(rewritten);
                if let Some(&slot) = arrays_found.get(&elem) {
                    // append onto the open array of the same element
                    let prev_len = self.module.types.array_len(new_types[slot]);
                    let added = self.module.types.array_len(rewritten);
                    new_types[slot] = self.module.types.array(elem, prev_len + added);
                    members.push(MemberSlot { index: slot as u32, offset: prev_len });
                    if let (Some(b), Some(orig)) = (&mut base_begin, orig_base_begin) {
                        if i < orig {
                            *b -= 1;
                        }
                    }
                    merged = true;
                    continue;
                }
                arrays_found.insert(elem, new_types.len());
            } else if self.module.types.is_integer(rewritten) {
                let width = self.module.types.int_width(rewritten);
                let escapes = self.facts.escaping_fields.contains(&(segment_owner, i));
                if !escapes && width < 32 {
                    let mut packed = false;
                    let mut slot_idx = 0;
                    while slot_idx < merged_ints.len() {
                        let (slot, free) = merged_ints[slot_idx];
                        if free < width {
                            slot_idx += 1;
                            continue;
                        }
                        let prev_width = self.module.types.int_width(new_types[slot]);
                        new_types[slot] = self.module.types.int(prev_width + width);
                        members.push(MemberSlot { index: slot as u32, offset: 32 - free });
                        merged_ints[slot_idx].1 -= width;
                        if merged_ints[slot_idx].1 == 0 {
                            merged_ints.remove(slot_idx);
                        }
                        if let (Some(b), Some(orig)) = (&mut base_begin, orig_base_begin) {
                            if i < orig {
                                *b -= 1;
                            }
                        }
                        merged = true;
                        packed = true;
                        break;
                    }
                    if packed {
                        continue;
                    }
                    merged_ints.push((new_types.len(), 32 - width));
                }
            }

            members.push(MemberSlot { index: new_types.len() as u32, offset: 0 });
            new_types.push(rewritten);
        }
        debug_assert_eq!(members.len() as u32, num_fields);

        if !merged {
            return None;
        }
        if let (Some(entries), Some(b)) = (self.module.bases_ranges.get_mut(name), base_begin) {
            // the frontend duplicates entries; update all of them
            for entry in entries.iter_mut() {
                *entry = b;
            }
        }
        Some(members)
    }

    /// Try to replace `st`, whose rewritten body is the single member
    /// `sole` (unrewritten when the struct had one field), with the
    /// member itself.
    fn try_collapse(
        &mut self,
        st: TyIdx,
        new_st: TyIdx,
        sole: TyIdx,
        merged_members: &Option<Vec<MemberSlot>>,
    ) -> Option<TypeMapping> {
        let pool = &self.module.types;
        // Pointers keep the struct wrapper so the pointed-to object
        // stays addressable as an object, except pointers to host
        // types, which are opaque handles anyway. i8 members stay
        // wrapped because raw byte storage is addressed differently.
        let pointer_to_host = pool.is_pointer(sole) && pool.is_host(pool.pointee(sole));
        let plain_ok = sole != TyIdx::I8
            && !pool.is_pointer(sole)
            && !pool.is_exported(new_st)
            && !pool.has_byte_layout(st);
        if !(pointer_to_host || plain_ok) {
            return None;
        }
        if self.is_unsafe_downcast_source(st) {
            return None;
        }

        // mark the collapse in progress and resolve the member; the
        // marker degrades if anything still needs the struct itself
        self.types_mapping.insert(st, TypeMapping::new(sole, MappingKind::Collapsing));
        let collapsed = self.rewrite_type(sole);
        let marker = self.types_mapping[&st].kind.clone();
        if matches!(marker, MappingKind::CollapsingButUsed) {
            self.types_mapping.insert(st, TypeMapping::identical(new_st));
            return None;
        }
        debug_assert!(matches!(marker, MappingKind::Collapsing));
        let kind = match merged_members {
            Some(members) => {
                let members: std::rc::Rc<[MemberSlot]> = members.clone().into();
                self.members_mapping.insert(st, std::rc::Rc::clone(&members));
                MappingKind::MergedMembersCollapsed { members }
            }
            None => MappingKind::Collapsed,
        };
        let mapping = TypeMapping::new(collapsed.mapped, kind);
        self.types_mapping.insert(st, mapping.clone());
        Some(mapping)
    }

    /// A struct that is downcast to anything which keeps its identity
    /// must keep its own identity too.
    fn is_unsafe_downcast_source(&mut self, st: TyIdx) -> bool {
        let Some(dests) = self.facts.downcast_dests.get(&st) else {
            return false;
        };
        if dests.is_empty() {
            // poisoned by an unsafe downcast
            return true;
        }
        let mut dests: Vec<TyIdx> = dests.iter().copied().collect();
        dests.sort_unstable();
        dests.into_iter().any(|dest| {
            let kind = self.rewrite_type(dest).kind;
            !matches!(kind, MappingKind::Collapsed)
        })
    }

    /// Byte-layout structs whose storage is only ever viewed as one
    /// scalar type become arrays of that scalar.
    fn try_byte_layout_to_array(&mut self, st: TyIdx) -> Option<TypeMapping> {
        // the struct's own fields count as views over its bytes
        self.facts.add_base_types(&self.module.types, st, st);
        let base = (*self.facts.byte_layout_bases.get(&st)?)?;
        let struct_size = self.layout.alloc_size(&self.module.types, st);
        let elem_size = self.layout.alloc_size(&self.module.types, base);
        if !struct_size.is_multiple_of(elem_size) {
            return None;
        }
        // nested structs must themselves flatten to the same base
        for i in 0..self.module.types.num_fields(st) {
            let field = self.module.types.field(st, i);
            if !self.module.types.is_struct(field) {
                continue;
            }
            if !self.module.types.has_byte_layout(field) {
                return None;
            }
            let sub = self.rewrite_type(field);
            if !matches!(sub.kind, MappingKind::ByteLayoutToArray) {
                return None;
            }
        }
        let len = struct_size / elem_size;
        let mapped = if len == 1 { base } else { self.module.types.array(base, len) };
        let mapping = TypeMapping::new(mapped, MappingKind::ByteLayoutToArray);
        self.types_mapping.insert(st, mapping.clone());
        Some(mapping)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use veld_ir::{Module, StructFlags, TargetLayout, TyIdx};

    use crate::mapping::{MappingKind, MemberSlot};
    use crate::TypeOptimizer;

    #[test]
    fn scalars_map_to_themselves() {
        let mut module = Module::new();
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(TyIdx::I32);
        assert_eq!(info.mapped, TyIdx::I32);
        assert_eq!(info.kind, MappingKind::Identical);
    }

    #[test]
    fn mapping_is_memoized() {
        let mut module = Module::new();
        let st = module.types.named_struct("S", vec![TyIdx::F64], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let first = opt.rewrite_type(st);
        let second = opt.rewrite_type(st);
        assert_eq!(first, second);
    }

    #[test]
    fn single_member_struct_collapses() {
        let mut module = Module::new();
        let st = module.types.named_struct("S", vec![TyIdx::F64], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::Collapsed);
        assert_eq!(info.mapped, TyIdx::F64);
    }

    #[test]
    fn i8_member_blocks_collapse() {
        let mut module = Module::new();
        let st = module.types.named_struct("S", vec![TyIdx::I8], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::Identical);
        assert!(module.types.is_struct(info.mapped));
    }

    #[test]
    fn pointer_member_blocks_collapse_unless_host() {
        let mut module = Module::new();
        let i32_ptr = module.types.pointer(TyIdx::I32);
        let plain = module.types.named_struct("P", vec![i32_ptr], StructFlags::empty());
        let host = module.types.host("Window");
        let host_ptr = module.types.pointer(host);
        let handle = module.types.named_struct("H", vec![host_ptr], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        assert_eq!(opt.rewrite_type(plain).kind, MappingKind::Identical);
        let info = opt.rewrite_type(handle);
        assert_eq!(info.kind, MappingKind::Collapsed);
        assert_eq!(info.mapped, host_ptr);
    }

    #[test]
    fn exported_struct_never_collapses() {
        let mut module = Module::new();
        let st = module.types.named_struct("E", vec![TyIdx::F64], StructFlags::EXPORTED);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        assert_eq!(opt.rewrite_type(st).kind, MappingKind::Identical);
    }

    #[test]
    fn collapse_through_self_pointer_chain() {
        // A { B }, B { A* }: A collapses into B, whose pointer member
        // retargets to B's replacement.
        let mut module = Module::new();
        let a = module.types.reserve_struct("A", StructFlags::empty());
        let a_ptr = module.types.pointer(a);
        let b = module.types.named_struct("B", vec![a_ptr, TyIdx::I32], StructFlags::empty());
        module.types.set_struct_body(a, vec![b], None);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(a);
        assert_eq!(info.kind, MappingKind::Collapsed);
        let new_b = info.mapped;
        assert!(module.types.is_struct(new_b));
        assert_eq!(module.types.struct_data(new_b).name, "B");
        // the pointer to A now points at B's replacement
        assert_eq!(module.types.pointee(module.types.field(new_b, 0)), new_b);
    }

    #[test]
    fn collapse_aborts_when_the_struct_is_still_used() {
        // A { [2 x A*] }: flattening the member array reaches A while
        // the collapse marker is set, through a non-struct type.
        let mut module = Module::new();
        let a = module.types.reserve_struct("A", StructFlags::empty());
        let a_ptr = module.types.pointer(a);
        let arr = module.types.array(a_ptr, 2);
        module.types.set_struct_body(a, vec![arr], None);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(a);
        assert_eq!(info.kind, MappingKind::Identical);
        assert!(module.types.is_struct(info.mapped));
    }

    #[test]
    fn adjacent_same_element_arrays_merge() {
        let mut module = Module::new();
        let a2 = module.types.array(TyIdx::F32, 2);
        let a3 = module.types.array(TyIdx::F32, 3);
        let st = module.types.named_struct("S", vec![a2, a3, TyIdx::I64], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        let MappingKind::MergedMembers { members } = &info.kind else {
            panic!("expected merged members, got {:?}", info.kind);
        };
        assert_eq!(
            members.as_ref(),
            &[
                MemberSlot { index: 0, offset: 0 },
                MemberSlot { index: 0, offset: 2 },
                MemberSlot { index: 1, offset: 0 },
            ]
        );
        let new_st = info.mapped;
        assert_eq!(module.types.num_fields(new_st), 2);
        let merged = module.types.field(new_st, 0);
        assert_eq!(module.types.array_len(merged), 5);
        assert_eq!(module.types.array_elem(merged), TyIdx::F32);
    }

    #[test]
    fn narrow_integers_pack_into_a_shared_slot() {
        let mut module = Module::new();
        let st = module.types.named_struct(
            "S",
            vec![TyIdx::I8, TyIdx::I16, TyIdx::I64],
            StructFlags::empty(),
        );
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        let MappingKind::MergedMembers { members } = &info.kind else {
            panic!("expected merged members, got {:?}", info.kind);
        };
        assert_eq!(
            members.as_ref(),
            &[
                MemberSlot { index: 0, offset: 0 },
                MemberSlot { index: 0, offset: 8 },
                MemberSlot { index: 1, offset: 0 },
            ]
        );
        let new_st = info.mapped;
        assert_eq!(module.types.num_fields(new_st), 2);
        assert_eq!(module.types.int_width(module.types.field(new_st, 0)), 24);
        assert_eq!(module.types.field(new_st, 1), TyIdx::I64);
    }

    #[test]
    fn escaping_field_is_not_packed() {
        let mut module = Module::new();
        let st = module.types.named_struct(
            "S",
            vec![TyIdx::I8, TyIdx::I8, TyIdx::I64],
            StructFlags::empty(),
        );
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        opt.facts.escaping_fields.insert((st, 1));
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::Identical);
        assert_eq!(module.types.num_fields(info.mapped), 3);
    }

    #[test]
    fn fixed_layout_struct_keeps_every_member() {
        let mut module = Module::new();
        let st = module.types.named_struct(
            "S",
            vec![TyIdx::I8, TyIdx::I8],
            StructFlags::FIXED_LAYOUT,
        );
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::Identical);
        assert_eq!(module.types.num_fields(info.mapped), 2);
    }

    #[test]
    fn byte_layout_struct_becomes_array() {
        let mut module = Module::new();
        let st = module.types.named_struct(
            "V",
            vec![TyIdx::F64, TyIdx::F64, TyIdx::F64],
            StructFlags::BYTE_LAYOUT,
        );
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::ByteLayoutToArray);
        assert_eq!(info.mapped, module.types.array(TyIdx::F64, 3));
    }

    #[test]
    fn byte_layout_single_element_degenerates_to_scalar() {
        let mut module = Module::new();
        let st = module.types.named_struct("W", vec![TyIdx::F64], StructFlags::BYTE_LAYOUT);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::ByteLayoutToArray);
        assert_eq!(info.mapped, TyIdx::F64);
    }

    #[test]
    fn byte_layout_with_conflicting_views_stays_a_struct() {
        let mut module = Module::new();
        let st = module.types.named_struct(
            "U",
            vec![TyIdx::F64, TyIdx::I32, TyIdx::I32],
            StructFlags::BYTE_LAYOUT,
        );
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert_eq!(info.kind, MappingKind::Identical);
        assert!(module.types.is_struct(info.mapped));
    }

    #[test]
    fn downcast_to_uncollapsed_destination_blocks_collapse() {
        let mut module = Module::new();
        let src = module.types.named_struct("Src", vec![TyIdx::F64], StructFlags::empty());
        let dest =
            module.types.named_struct("Dst", vec![TyIdx::F64, TyIdx::I32], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        opt.facts.downcast_dests.entry(src).or_default().insert(dest);
        assert_eq!(opt.rewrite_type(src).kind, MappingKind::Identical);
    }

    #[test]
    fn downcast_to_collapsed_destination_allows_collapse() {
        let mut module = Module::new();
        let src = module.types.named_struct("Src", vec![TyIdx::F64], StructFlags::empty());
        let dest = module.types.named_struct("Dst", vec![TyIdx::F64], StructFlags::empty());
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        opt.facts.downcast_dests.entry(src).or_default().insert(dest);
        assert_eq!(opt.rewrite_type(src).kind, MappingKind::Collapsed);
    }

    #[test]
    fn arrays_of_arrays_flatten() {
        let mut module = Module::new();
        let inner = module.types.array(TyIdx::I32, 3);
        let outer = module.types.array(inner, 2);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(outer);
        assert_eq!(info.kind, MappingKind::FlattenedArray);
        assert_eq!(info.mapped, module.types.array(TyIdx::I32, 6));
    }

    #[test]
    fn pointer_to_array_drops_the_length() {
        let mut module = Module::new();
        let arr = module.types.array(TyIdx::I32, 4);
        let ptr = module.types.pointer(arr);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(ptr);
        assert_eq!(info.kind, MappingKind::PointerFromArray);
        assert_eq!(info.mapped, module.types.pointer(TyIdx::I32));
    }

    #[test]
    fn merge_state_resets_at_inheritance_boundaries() {
        // Base { i8 }, Derived { i8 (inherited), i8 }: the two bytes
        // sit in different segments and must not pack together.
        let mut module = Module::new();
        let base = module.types.named_struct("Base", vec![TyIdx::I8], StructFlags::empty());
        let derived = module.types.reserve_struct("Derived", StructFlags::empty());
        module.types.set_struct_body(derived, vec![TyIdx::I8, TyIdx::I8], Some(base));
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(derived);
        assert_eq!(info.kind, MappingKind::Identical);
        assert_eq!(module.types.num_fields(info.mapped), 2);
    }

    #[test]
    fn bases_ranges_shift_when_members_before_the_base_merge() {
        let mut module = Module::new();
        let a2 = module.types.array(TyIdx::F32, 2);
        let st =
            module.types.named_struct("D", vec![a2, a2, TyIdx::I64, TyIdx::I64], StructFlags::empty());
        module.bases_ranges.insert("D".to_owned(), vec![2, 2]);
        let layout = TargetLayout::default();
        let mut opt = TypeOptimizer::new(&mut module, &layout);
        let info = opt.rewrite_type(st);
        assert!(matches!(info.kind, MappingKind::MergedMembers { .. }));
        assert_eq!(module.bases_ranges["D"], vec![1, 1]);
    }
}
