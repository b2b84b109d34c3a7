//! Whole-program usage analysis.
//!
//! One scan over every function body, every constant expression, and
//! every global initializer collects the three fact tables the
//! classifier consults:
//!
//! - the unified element type of each byte-layout struct, learned from
//!   the pointer casts its storage flows through,
//! - the set of struct fields whose address escapes (anything other
//!   than a direct load or store), which blocks integer packing,
//! - for each struct, the destination types of the checked downcasts
//!   performed on it, which gate collapsing.
//!
//! The tables are conservative: a fact that cannot be proven safe is
//! recorded as unsafe and never revisited.

use rustc_hash::{FxHashMap, FxHashSet};

use veld_ir::{
    Callee, ConstKind, Constant, Function, InstrId, InstrKind, Intrinsic, Module, Operand, TyIdx,
    TypePool,
};

/// The analysis output consumed by the classifier.
#[derive(Debug, Default)]
pub(crate) struct TypeFacts {
    /// Per byte-layout struct, the unified element type its storage is
    /// viewed as. `Some(None)` records a contradiction: two casts
    /// disagreed, and the struct can never become an array.
    pub byte_layout_bases: FxHashMap<TyIdx, Option<TyIdx>>,
    /// `(owner struct, field index)` pairs whose address escapes.
    pub escaping_fields: FxHashSet<(TyIdx, u32)>,
    /// Per struct, the destination types of the downcasts performed on
    /// it. An empty set records an unsafe downcast; the struct must
    /// keep its full identity.
    pub downcast_dests: FxHashMap<TyIdx, FxHashSet<TyIdx>>,
}

impl TypeFacts {
    /// Record that `base_ty`'s scalar leaves are viewed over the bytes
    /// of the byte-layout struct `st`. The first recorded leaf type
    /// wins; any later disagreement poisons the entry.
    ///
    /// Nested structs contribute their own leaves. Unions of unions
    /// where only an inner member is ever cast are out of reach here;
    /// the entry stays unset and the struct keeps its layout.
    pub fn add_base_types(&mut self, pool: &TypePool, st: TyIdx, base_ty: TyIdx) {
        if pool.is_array(base_ty) {
            self.add_base_types(pool, st, pool.array_elem(base_ty));
        } else if pool.is_struct(base_ty) {
            for i in 0..pool.num_fields(base_ty) {
                self.add_base_types(pool, st, pool.field(base_ty, i));
            }
        } else {
            match self.byte_layout_bases.entry(st) {
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(Some(base_ty));
                }
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    if *e.get() != Some(base_ty) {
                        e.insert(None);
                    }
                }
            }
        }
    }
}

/// Scan the whole module and build the fact tables.
pub(crate) fn gather_types_info(module: &Module) -> TypeFacts {
    let mut gatherer = Gatherer {
        pool: &module.types,
        facts: TypeFacts::default(),
        poisoned: FxHashSet::default(),
    };
    for func in module.functions.iter().filter(|f| !f.dead) {
        gatherer.scan_function(module, func);
    }
    for global in &module.globals {
        if let Some(init) = &global.init {
            gatherer.scan_constant(init, false);
        }
    }
    gatherer.facts
}

struct Gatherer<'a> {
    pool: &'a TypePool,
    facts: TypeFacts,
    /// Structs whose downcast set was cleared by an unsafe cast; the
    /// set must stay empty no matter what is seen later.
    poisoned: FxHashSet<TyIdx>,
}

impl Gatherer<'_> {
    fn scan_function(&mut self, module: &Module, func: &Function) {
        let escaping = escaping_values(func);
        for block in &func.blocks {
            for &id in &block.instrs {
                self.scan_instr(module, func, id, &escaping);
            }
        }
    }

    fn scan_instr(
        &mut self,
        module: &Module,
        func: &Function,
        id: InstrId,
        escaping: &FxHashSet<InstrId>,
    ) {
        let instr = func.instr(id);
        match &instr.kind {
            InstrKind::Call { callee: Callee::Func(target), args, .. } => {
                match module.func(*target).intrinsic {
                    Some(Intrinsic::Downcast) => {
                        if let Some(src) = self.pointee_struct(func.operand_ty(&args[0])) {
                            match args[1].as_const_int() {
                                Some(0) => {
                                    if let Some(dest) = self.pointee_struct(instr.ty) {
                                        self.record_safe_downcast(src, dest);
                                    }
                                }
                                // unknown or non-zero offset: the object
                                // is addressed below its own start
                                _ => self.poison_downcasts(src),
                            }
                        }
                    }
                    Some(Intrinsic::VirtualCast) => {
                        if let Some(src) = self.pointee_struct(func.operand_ty(&args[0])) {
                            self.poison_downcasts(src);
                        }
                    }
                    _ => {}
                }
            }
            InstrKind::PtrCast { value } => {
                let src_ty = func.operand_ty(value);
                if self.pool.is_pointer(src_ty) && self.pool.is_pointer(instr.ty) {
                    let src = self.pool.pointee(src_ty);
                    if self.pool.is_struct(src) && self.pool.has_byte_layout(src) {
                        self.facts.add_base_types(self.pool, src, self.pool.pointee(instr.ty));
                    }
                }
            }
            InstrKind::Gep { base, indices, .. } => {
                if indices.len() >= 2 && escaping.contains(&id) {
                    self.record_escaping_gep(func.operand_ty(base), indices);
                }
            }
            _ => {}
        }
        // constant expressions reach the tables through operands too
        instr.for_each_operand(|op| {
            if let Operand::Const(c) = op {
                self.scan_constant(c, is_simple_position(&instr.kind, op));
            }
        });
    }

    /// Walk a constant tree looking for address computations. `simple`
    /// is true only for the top-level constant in the pointer position
    /// of a load or store; any deeper constant use escapes.
    fn scan_constant(&mut self, c: &Constant, simple: bool) {
        match &c.kind {
            ConstKind::Gep { base, indices } => {
                if !simple && indices.len() >= 2 {
                    if let Some(path) = const_index_path(indices) {
                        self.record_escaping_path(base.ty, &path);
                    }
                }
                self.scan_constant(base, false);
                for index in indices {
                    self.scan_constant(index, false);
                }
            }
            ConstKind::Struct(elems) | ConstKind::Array(elems) => {
                for elem in elems {
                    self.scan_constant(elem, false);
                }
            }
            ConstKind::PtrCast(inner) | ConstKind::IntToPtr(inner) => {
                self.scan_constant(inner, false);
            }
            ConstKind::Add(a, b) | ConstKind::Mul(a, b) => {
                self.scan_constant(a, false);
                self.scan_constant(b, false);
            }
            _ => {}
        }
    }

    /// An address computation whose result is used outside plain
    /// loads/stores pins the deepest field it addresses. Array steps
    /// may be variable; the walk never needs their values. Only a step
    /// into a struct, and the final index, must be constant.
    fn record_escaping_gep(&mut self, ptr_ty: TyIdx, indices: &[Operand]) {
        if !self.pool.is_pointer(ptr_ty) || indices.len() < 2 {
            return;
        }
        let mut container = self.pool.pointee(ptr_ty);
        for op in &indices[1..indices.len() - 1] {
            if self.pool.is_struct(container) {
                let Some(i) = op.as_const_int() else { return };
                container = self.pool.field(container, i as u32);
            } else {
                container = self.pool.seq_elem(container);
            }
        }
        if !self.pool.is_struct(container) {
            return;
        }
        let Some(field) = indices.last().unwrap().as_const_int() else { return };
        self.charge_escaping_field(container, field as u32);
    }

    fn record_escaping_path(&mut self, ptr_ty: TyIdx, path: &[u64]) {
        if !self.pool.is_pointer(ptr_ty) || path.len() < 2 {
            return;
        }
        // walk to the container of the last index
        let mut container = self.pool.pointee(ptr_ty);
        for &i in &path[1..path.len() - 1] {
            container = self.pool.element_at(container, i as u32);
        }
        if !self.pool.is_struct(container) {
            return;
        }
        self.charge_escaping_field(container, *path.last().unwrap() as u32);
    }

    /// The field may live in the inherited prefix; charge the escape
    /// to the deepest base that still contains it.
    fn charge_escaping_field(&mut self, container: TyIdx, field: u32) {
        let mut owner = container;
        while let Some(base) = self.pool.direct_base(owner) {
            if self.pool.num_fields(base) > field {
                owner = base;
            } else {
                break;
            }
        }
        self.facts.escaping_fields.insert((owner, field));
    }

    fn record_safe_downcast(&mut self, src: TyIdx, dest: TyIdx) {
        if !self.poisoned.contains(&src) {
            self.facts.downcast_dests.entry(src).or_default().insert(dest);
        }
    }

    fn poison_downcasts(&mut self, src: TyIdx) {
        self.poisoned.insert(src);
        self.facts.downcast_dests.entry(src).or_default().clear();
    }

    fn pointee_struct(&self, ty: TyIdx) -> Option<TyIdx> {
        if !self.pool.is_pointer(ty) {
            return None;
        }
        let pointee = self.pool.pointee(ty);
        self.pool.is_struct(pointee).then_some(pointee)
    }
}

/// Instruction results used by anything other than a direct load or the
/// pointer position of a store.
fn escaping_values(func: &Function) -> FxHashSet<InstrId> {
    let mut escaping = FxHashSet::default();
    for block in &func.blocks {
        for &id in &block.instrs {
            let instr = func.instr(id);
            instr.for_each_operand(|op| {
                let Operand::Value(used) = op else { return };
                if !is_simple_position(&instr.kind, op) {
                    escaping.insert(*used);
                }
            });
        }
        let mut term = block.term.clone();
        term.for_each_operand_mut(|op| {
            if let Operand::Value(used) = op {
                escaping.insert(*used);
            }
        });
    }
    escaping
}

/// Whether `op` sits in the pointer position of a load or store, the
/// one place an address may appear without escaping.
fn is_simple_position(kind: &InstrKind, op: &Operand) -> bool {
    match kind {
        InstrKind::Load { ptr } => std::ptr::eq(ptr, op),
        InstrKind::Store { ptr, .. } => std::ptr::eq(ptr, op),
        _ => false,
    }
}

/// Constant index operands as a `u64` path, if all are constant.
fn const_index_path(indices: &[Constant]) -> Option<Vec<u64>> {
    indices.iter().map(Constant::as_int).collect()
}
