//! Target size and offset oracle.
//!
//! [`TargetLayout`] answers the only byte-level questions the lowering
//! passes are allowed to ask: how big is a type when allocated, how is
//! it aligned, and at which offset does a struct field live. Struct
//! layouts are cached; the cache uses interior mutability because every
//! query takes `&self`.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ty::{TyIdx, TyKind, TypePool};

/// Computed layout of one struct type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructLayout {
    /// Byte offset of each field.
    pub offsets: Box<[u32]>,
    /// Allocated size, padded to the struct's alignment.
    pub size: u32,
    pub align: u32,
}

/// Size/offset/alignment rules for one target.
#[derive(Debug)]
pub struct TargetLayout {
    pointer_size: u32,
    struct_cache: RefCell<FxHashMap<TyIdx, Rc<StructLayout>>>,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TargetLayout {
    pub fn new(pointer_size: u32) -> Self {
        Self { pointer_size, struct_cache: RefCell::new(FxHashMap::default()) }
    }

    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    /// Allocated size of a type in bytes (includes tail padding).
    pub fn alloc_size(&self, pool: &TypePool, ty: TyIdx) -> u32 {
        if pool.is_struct(ty) {
            return self.struct_layout(pool, ty).size;
        }
        match pool.kind(ty) {
            TyKind::Void => 0,
            TyKind::Int(bits) => int_size(*bits),
            TyKind::Float(bits) => bits / 8,
            TyKind::Pointer(_) => self.pointer_size,
            TyKind::Array { elem, len } => self.alloc_size(pool, *elem) * len,
            k @ (TyKind::Func { .. } | TyKind::Host(_)) => {
                panic!("alloc_size() on unsized type {k:?}")
            }
        }
    }

    /// ABI alignment of a type in bytes.
    pub fn align(&self, pool: &TypePool, ty: TyIdx) -> u32 {
        if pool.is_struct(ty) {
            return self.struct_layout(pool, ty).align;
        }
        match pool.kind(ty) {
            TyKind::Void => 1,
            TyKind::Int(bits) => int_size(*bits),
            TyKind::Float(bits) => bits / 8,
            TyKind::Pointer(_) => self.pointer_size,
            TyKind::Array { elem, .. } => self.align(pool, *elem),
            k @ (TyKind::Func { .. } | TyKind::Host(_)) => {
                panic!("align() on unsized type {k:?}")
            }
        }
    }

    /// Full layout of a struct type.
    pub fn struct_layout(&self, pool: &TypePool, ty: TyIdx) -> Rc<StructLayout> {
        if let Some(cached) = self.struct_cache.borrow().get(&ty) {
            return Rc::clone(cached);
        }
        let data = pool.struct_data(ty);
        assert!(!data.opaque, "struct_layout() on opaque struct {}", data.name);
        let packed = data.flags.contains(crate::ty::StructFlags::PACKED);

        let mut offsets = Vec::with_capacity(data.fields.len());
        let mut offset = 0u32;
        let mut align = 1u32;
        for &field in &data.fields {
            let field_align = if packed { 1 } else { self.align(pool, field) };
            align = align.max(field_align);
            offset = round_up(offset, field_align);
            offsets.push(offset);
            offset += self.alloc_size(pool, field);
        }
        let layout = Rc::new(StructLayout {
            offsets: offsets.into_boxed_slice(),
            size: round_up(offset, align),
            align,
        });
        self.struct_cache.borrow_mut().insert(ty, Rc::clone(&layout));
        layout
    }

    /// Byte offset of struct field `i`.
    pub fn field_offset(&self, pool: &TypePool, ty: TyIdx, i: u32) -> u32 {
        self.struct_layout(pool, ty).offsets[i as usize]
    }
}

/// Allocated size of an `iN`: the width rounded up to a whole
/// power-of-two number of bytes.
fn int_size(bits: u32) -> u32 {
    let bytes = bits.div_ceil(8);
    bytes.next_power_of_two()
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two() || align == 1);
    value.div_ceil(align) * align
}
