//! Interned type descriptors.
//!
//! All types live in a [`TypePool`] and are addressed by [`TyIdx`].
//! Scalars, pointers, arrays, function types, and host types are
//! hash-consed, so two structurally equal descriptors always share one
//! index and type equality is index equality. Struct types are nominal:
//! every [`TypePool::reserve_struct`] call creates a distinct node, and
//! the body is attached later with [`TypePool::set_struct_body`]. The
//! two-phase protocol is what lets a pass forge a struct that contains
//! a pointer back to itself.

use bitflags::bitflags;
use rustc_hash::FxHashMap;

/// Index of a type descriptor in a [`TypePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TyIdx(u32);

impl TyIdx {
    /// Pre-interned `void`.
    pub const VOID: TyIdx = TyIdx(0);
    /// Pre-interned `i1`.
    pub const I1: TyIdx = TyIdx(1);
    /// Pre-interned `i8`.
    pub const I8: TyIdx = TyIdx(2);
    /// Pre-interned `i16`.
    pub const I16: TyIdx = TyIdx(3);
    /// Pre-interned `i32`.
    pub const I32: TyIdx = TyIdx(4);
    /// Pre-interned `i64`.
    pub const I64: TyIdx = TyIdx(5);
    /// Pre-interned `f32`.
    pub const F32: TyIdx = TyIdx(6);
    /// Pre-interned `f64`.
    pub const F64: TyIdx = TyIdx(7);

    /// Create an index from a raw value.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Properties of a struct type that constrain how it may be rewritten.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct StructFlags: u8 {
        /// Union-like storage: fields are views over the same bytes and
        /// accesses go through pointer casts. Field positions never move.
        const BYTE_LAYOUT = 1 << 0;
        /// Layout is frozen for linear-memory interop. Fields are never
        /// merged and the struct never collapses.
        const FIXED_LAYOUT = 1 << 1;
        /// Visible to the host environment by name. Never collapses.
        const EXPORTED = 1 << 2;
        /// No padding between fields.
        const PACKED = 1 << 3;
    }
}

/// Body of a struct type node.
///
/// `fields` includes the inherited prefix: when `direct_base` is set,
/// the first `num_fields(direct_base)` entries are the base's fields.
#[derive(Clone, Debug, PartialEq)]
pub struct StructData {
    pub name: String,
    pub fields: Vec<TyIdx>,
    /// First (primary) base class, whose fields prefix `fields`.
    pub direct_base: Option<TyIdx>,
    pub flags: StructFlags,
    /// `true` until [`TypePool::set_struct_body`] runs.
    pub opaque: bool,
}

/// A type descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TyKind {
    Void,
    /// Integer of the given bit width.
    Int(u32),
    /// Floating point of the given bit width (32 or 64).
    Float(u32),
    Pointer(TyIdx),
    Array { elem: TyIdx, len: u32 },
    Func { ret: TyIdx, params: Vec<TyIdx>, vararg: bool },
    /// Opaque host-environment type, identified by name. Values of host
    /// types are only ever handled by reference and are never rewritten.
    Host(String),
}

/// Arena entry: either a hash-consed [`TyKind`] or a nominal struct node.
#[derive(Clone, Debug)]
enum TyData {
    Kind(TyKind),
    Struct(StructData),
}

/// The type arena.
#[derive(Debug, Default)]
pub struct TypePool {
    entries: Vec<TyData>,
    interned: FxHashMap<TyKind, TyIdx>,
}

impl TypePool {
    /// Create a pool with the primitive types pre-interned at their
    /// `TyIdx` constants.
    pub fn new() -> Self {
        let mut pool = Self { entries: Vec::new(), interned: FxHashMap::default() };
        let prims = [
            TyKind::Void,
            TyKind::Int(1),
            TyKind::Int(8),
            TyKind::Int(16),
            TyKind::Int(32),
            TyKind::Int(64),
            TyKind::Float(32),
            TyKind::Float(64),
        ];
        for kind in prims {
            pool.intern(kind);
        }
        debug_assert_eq!(pool.intern(TyKind::Float(64)), TyIdx::F64);
        pool
    }

    fn intern(&mut self, kind: TyKind) -> TyIdx {
        if let Some(&idx) = self.interned.get(&kind) {
            return idx;
        }
        let idx = TyIdx::new(self.entries.len() as u32);
        self.interned.insert(kind.clone(), idx);
        self.entries.push(TyData::Kind(kind));
        idx
    }

    // === Constructors ===

    /// Intern an integer type of the given bit width.
    pub fn int(&mut self, bits: u32) -> TyIdx {
        self.intern(TyKind::Int(bits))
    }

    /// Intern a pointer type.
    pub fn pointer(&mut self, pointee: TyIdx) -> TyIdx {
        self.intern(TyKind::Pointer(pointee))
    }

    /// Intern an array type.
    pub fn array(&mut self, elem: TyIdx, len: u32) -> TyIdx {
        self.intern(TyKind::Array { elem, len })
    }

    /// Intern a function type.
    pub fn func(&mut self, ret: TyIdx, params: &[TyIdx], vararg: bool) -> TyIdx {
        self.intern(TyKind::Func { ret, params: params.to_vec(), vararg })
    }

    /// Intern an opaque host type.
    pub fn host(&mut self, name: &str) -> TyIdx {
        self.intern(TyKind::Host(name.to_owned()))
    }

    /// Reserve a struct node with no body yet. The returned index is
    /// final and may be referenced (e.g. through pointers) before the
    /// body is attached.
    pub fn reserve_struct(&mut self, name: &str, flags: StructFlags) -> TyIdx {
        let idx = TyIdx::new(self.entries.len() as u32);
        self.entries.push(TyData::Struct(StructData {
            name: name.to_owned(),
            fields: Vec::new(),
            direct_base: None,
            flags,
            opaque: true,
        }));
        idx
    }

    /// Attach the body of a reserved struct. May only be called once.
    pub fn set_struct_body(&mut self, idx: TyIdx, fields: Vec<TyIdx>, direct_base: Option<TyIdx>) {
        let data = self.struct_data_mut(idx);
        assert!(data.opaque, "struct body set twice: {}", data.name);
        data.fields = fields;
        data.direct_base = direct_base;
        data.opaque = false;
    }

    /// Convenience: reserve and immediately populate a struct.
    pub fn named_struct(
        &mut self,
        name: &str,
        fields: Vec<TyIdx>,
        flags: StructFlags,
    ) -> TyIdx {
        let idx = self.reserve_struct(name, flags);
        self.set_struct_body(idx, fields, None);
        idx
    }

    /// Rename a struct node (used to move a name onto a replacement
    /// struct while the obsolete one keeps a placeholder name).
    pub fn rename_struct(&mut self, idx: TyIdx, name: &str) {
        self.struct_data_mut(idx).name = name.to_owned();
    }

    // === Queries ===

    /// The kind of a non-struct type. Panics on struct indices; use
    /// [`Self::struct_data`] for those.
    pub fn kind(&self, idx: TyIdx) -> &TyKind {
        match &self.entries[idx.index()] {
            TyData::Kind(k) => k,
            TyData::Struct(data) => panic!("kind() on struct type {}", data.name),
        }
    }

    pub fn is_struct(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Struct(_))
    }

    pub fn is_pointer(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Kind(TyKind::Pointer(_)))
    }

    pub fn is_array(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Kind(TyKind::Array { .. }))
    }

    pub fn is_integer(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Kind(TyKind::Int(_)))
    }

    pub fn is_func(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Kind(TyKind::Func { .. }))
    }

    pub fn is_host(&self, idx: TyIdx) -> bool {
        matches!(self.entries[idx.index()], TyData::Kind(TyKind::Host(_)))
    }

    pub fn is_void(&self, idx: TyIdx) -> bool {
        idx == TyIdx::VOID
    }

    /// Bit width of an integer type.
    pub fn int_width(&self, idx: TyIdx) -> u32 {
        match self.kind(idx) {
            TyKind::Int(bits) => *bits,
            k => panic!("int_width() on non-integer type {k:?}"),
        }
    }

    /// Pointee of a pointer type.
    pub fn pointee(&self, idx: TyIdx) -> TyIdx {
        match self.kind(idx) {
            TyKind::Pointer(p) => *p,
            k => panic!("pointee() on non-pointer type {k:?}"),
        }
    }

    pub fn array_elem(&self, idx: TyIdx) -> TyIdx {
        match self.kind(idx) {
            TyKind::Array { elem, .. } => *elem,
            k => panic!("array_elem() on non-array type {k:?}"),
        }
    }

    pub fn array_len(&self, idx: TyIdx) -> u32 {
        match self.kind(idx) {
            TyKind::Array { len, .. } => *len,
            k => panic!("array_len() on non-array type {k:?}"),
        }
    }

    /// The element type reached through one sequential step: an array's
    /// element or a pointer's pointee.
    pub fn seq_elem(&self, idx: TyIdx) -> TyIdx {
        match self.kind(idx) {
            TyKind::Array { elem, .. } => *elem,
            TyKind::Pointer(p) => *p,
            k => panic!("seq_elem() on non-sequential type {k:?}"),
        }
    }

    pub fn struct_data(&self, idx: TyIdx) -> &StructData {
        match &self.entries[idx.index()] {
            TyData::Struct(data) => data,
            TyData::Kind(k) => panic!("struct_data() on non-struct type {k:?}"),
        }
    }

    fn struct_data_mut(&mut self, idx: TyIdx) -> &mut StructData {
        match &mut self.entries[idx.index()] {
            TyData::Struct(data) => data,
            TyData::Kind(k) => panic!("struct_data() on non-struct type {k:?}"),
        }
    }

    pub fn num_fields(&self, idx: TyIdx) -> u32 {
        self.struct_data(idx).fields.len() as u32
    }

    pub fn field(&self, idx: TyIdx, i: u32) -> TyIdx {
        self.struct_data(idx).fields[i as usize]
    }

    pub fn direct_base(&self, idx: TyIdx) -> Option<TyIdx> {
        self.struct_data(idx).direct_base
    }

    pub fn struct_flags(&self, idx: TyIdx) -> StructFlags {
        if self.is_struct(idx) {
            self.struct_data(idx).flags
        } else {
            StructFlags::empty()
        }
    }

    pub fn has_byte_layout(&self, idx: TyIdx) -> bool {
        self.struct_flags(idx).contains(StructFlags::BYTE_LAYOUT)
    }

    pub fn has_fixed_layout(&self, idx: TyIdx) -> bool {
        self.struct_flags(idx).contains(StructFlags::FIXED_LAYOUT)
    }

    pub fn is_exported(&self, idx: TyIdx) -> bool {
        self.struct_flags(idx).contains(StructFlags::EXPORTED)
    }

    pub fn is_opaque_struct(&self, idx: TyIdx) -> bool {
        self.is_struct(idx) && self.struct_data(idx).opaque
    }

    /// One step of an address-computation walk: struct member `i`,
    /// array element, or pointee.
    pub fn element_at(&self, idx: TyIdx, i: u32) -> TyIdx {
        match &self.entries[idx.index()] {
            TyData::Struct(data) => data.fields[i as usize],
            TyData::Kind(TyKind::Array { elem, .. }) => *elem,
            TyData::Kind(TyKind::Pointer(p)) => *p,
            TyData::Kind(k) => panic!("element_at() on non-composite type {k:?}"),
        }
    }

    /// The type addressed by applying `indices` to a pointer of type
    /// `ptr_ty` (the first index steps through the pointer itself).
    pub fn indexed_type(&self, ptr_ty: TyIdx, indices: &[u32]) -> TyIdx {
        let mut cur = ptr_ty;
        for &i in indices {
            cur = self.element_at(cur, i);
        }
        cur
    }

    /// Stable name component for intrinsic overloads, derived from the
    /// type structure.
    pub fn mangle(&self, idx: TyIdx) -> String {
        match &self.entries[idx.index()] {
            TyData::Struct(data) => format!("s_{}", data.name),
            TyData::Kind(TyKind::Void) => "void".to_owned(),
            TyData::Kind(TyKind::Int(bits)) => format!("i{bits}"),
            TyData::Kind(TyKind::Float(bits)) => format!("f{bits}"),
            TyData::Kind(TyKind::Pointer(p)) => format!("p0{}", self.mangle(*p)),
            TyData::Kind(TyKind::Array { elem, len }) => {
                format!("a{}{}", len, self.mangle(*elem))
            }
            TyData::Kind(TyKind::Func { ret, params, .. }) => {
                let mut out = format!("f_{}", self.mangle(*ret));
                for p in params {
                    out.push_str(&self.mangle(*p));
                }
                out
            }
            TyData::Kind(TyKind::Host(name)) => format!("h_{name}"),
        }
    }

    /// Number of type descriptors in the pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
