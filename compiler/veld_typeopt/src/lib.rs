//! Whole-program aggregate type rewriting.
//!
//! This pass runs once over a finalized [`Module`] and rebuilds its
//! aggregate types into the cheapest shapes the backend can lower:
//! single-member structs collapse into their member, arrays of arrays
//! flatten, adjacent same-typed member arrays merge, narrow integer
//! members pack into shared 32-bit slots, and byte-layout (union-like)
//! structs become arrays of their unified element type. Everything that
//! mentions a type follows: function signatures, instruction results,
//! address computations, constants, global initializers, and intrinsic
//! overloads.
//!
//! The entry point is [`run_type_optimization`]. All state lives in a
//! [`TypeOptimizer`] borrowing the module for the duration of the run:
//! the usage facts gathered up front, the memoized type mappings, the
//! global replacement table, and the worklist of functions still to
//! rewrite.
//!
//! ```
//! use veld_ir::{Module, TargetLayout};
//! use veld_typeopt::run_type_optimization;
//!
//! let mut module = Module::new();
//! let layout = TargetLayout::default();
//! run_type_optimization(&mut module, &layout);
//! ```

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use veld_ir::{
    Callee, ConstKind, Constant, FuncId, GlobalId, InstrKind, Module, Operand, TargetLayout,
    TyIdx,
};

mod analysis;
mod classify;
mod constants;
mod function;
mod indices;
mod mapping;

pub use mapping::{MappingKind, MemberSlot, TypeMapping};

use analysis::TypeFacts;

/// A module-level value: the two namespaces share the side tables that
/// remember pre-rewrite pointer types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum GlobalValueRef {
    Global(GlobalId),
    Func(FuncId),
}

/// The pass context. Owns every side table of one rewriting run.
pub struct TypeOptimizer<'m> {
    pub(crate) module: &'m mut Module,
    pub(crate) layout: &'m TargetLayout,
    /// Usage facts gathered before any type is touched.
    pub(crate) facts: TypeFacts,
    /// Memoized type mappings. An entry is final once inserted, except
    /// for the transient collapse markers managed by the classifier.
    pub(crate) types_mapping: FxHashMap<TyIdx, TypeMapping>,
    /// Member-remap tables of structs whose members were merged, keyed
    /// by the old struct.
    pub(crate) members_mapping: FxHashMap<TyIdx, std::rc::Rc<[MemberSlot]>>,
    /// Replacement constant for every global's address.
    pub(crate) globals_map: FxHashMap<GlobalId, Constant>,
    /// Pre-rewrite pointer types of globals and functions, recorded as
    /// each is first touched.
    pub(crate) global_types: FxHashMap<GlobalValueRef, TyIdx>,
    /// Functions not yet rewritten. Ordered so the run is deterministic
    /// regardless of hash state.
    pub(crate) pending_functions: BTreeSet<FuncId>,
}

impl<'m> TypeOptimizer<'m> {
    pub fn new(module: &'m mut Module, layout: &'m TargetLayout) -> Self {
        Self {
            module,
            layout,
            facts: TypeFacts::default(),
            types_mapping: FxHashMap::default(),
            members_mapping: FxHashMap::default(),
            globals_map: FxHashMap::default(),
            global_types: FxHashMap::default(),
            pending_functions: BTreeSet::new(),
        }
    }

    /// Run the pass over the whole module. Returns `true` when any type
    /// was rewritten.
    pub fn run(&mut self) -> bool {
        tracing::debug!(
            globals = self.module.globals.len(),
            functions = self.module.functions.len(),
            "rewriting aggregate types"
        );
        self.facts = analysis::gather_types_info(self.module);

        let globals: Vec<GlobalId> = self.module.global_ids().collect();
        for &gid in &globals {
            self.rewrite_global(gid);
        }
        self.pending_functions = self.module.function_ids().collect();
        while let Some(&fid) = self.pending_functions.iter().next() {
            self.rewrite_function(fid);
        }
        // initializers last: they may address any global or function
        for &gid in &globals {
            self.rewrite_global_init(gid);
        }
        self.sweep_unused_intrinsics();

        let changed = self
            .types_mapping
            .iter()
            .any(|(&old, m)| m.mapped != old || !matches!(m.kind, MappingKind::Identical));
        tracing::debug!(changed, types = self.types_mapping.len(), "type rewriting done");
        changed
    }

    /// The mapping resolved for `ty`, if the run reached it.
    pub fn mapping(&self, ty: TyIdx) -> Option<&TypeMapping> {
        self.types_mapping.get(&ty)
    }

    /// Retype a global variable and record the replacement for its
    /// address. A global whose pointer degraded to pointer-from-array
    /// keeps allocating the array; its address becomes a constant
    /// zero-index computation.
    fn rewrite_global(&mut self, gid: GlobalId) {
        let value_ty = self.module.global(gid).value_ty;
        let ptr_ty = self.module.types.pointer(value_ty);
        self.global_types.insert(GlobalValueRef::Global(gid), ptr_ty);

        let info = self.rewrite_type(ptr_ty);
        if info.mapped == ptr_ty {
            debug_assert!(!self.module.types.is_array(value_ty));
            self.globals_map
                .insert(gid, Constant { ty: ptr_ty, kind: ConstKind::Global(gid) });
            return;
        }
        if matches!(info.kind, MappingKind::PointerFromArray) {
            let new_value_ty = self.rewrite_type(value_ty).mapped;
            self.module.globals[gid.index()].value_ty = new_value_ty;
            let base = Constant {
                ty: self.module.types.pointer(new_value_ty),
                kind: ConstKind::Global(gid),
            };
            let decay = Constant {
                ty: info.mapped,
                kind: ConstKind::Gep {
                    base: Box::new(base),
                    indices: vec![Constant::index(0), Constant::index(0)],
                },
            };
            self.globals_map.insert(gid, decay);
            return;
        }
        let new_value_ty = self.module.types.pointee(info.mapped);
        self.module.globals[gid.index()].value_ty = new_value_ty;
        self.globals_map.insert(gid, Constant { ty: info.mapped, kind: ConstKind::Global(gid) });
    }

    fn rewrite_global_init(&mut self, gid: GlobalId) {
        let Some(init) = self.module.global(gid).init.clone() else {
            return;
        };
        let (new_init, offset) = self.rewrite_constant(&init);
        debug_assert_eq!(offset, 0, "global initializer inside a packed integer");
        self.module.globals[gid.index()].init = Some(new_init);
    }

    /// Overload redirection leaves behind intrinsic declarations with no
    /// remaining call sites; mark them dead.
    fn sweep_unused_intrinsics(&mut self) {
        let mut used: rustc_hash::FxHashSet<FuncId> = rustc_hash::FxHashSet::default();
        for func in self.module.functions.iter().filter(|f| !f.dead) {
            for block in &func.blocks {
                for &id in &block.instrs {
                    let instr = func.instr(id);
                    if let InstrKind::Call { callee: Callee::Func(f), .. } = &instr.kind {
                        used.insert(*f);
                    }
                    instr.for_each_operand(|op| {
                        if let Operand::Const(c) = op {
                            collect_func_refs(c, &mut used);
                        }
                    });
                }
                let mut term = block.term.clone();
                term.for_each_operand_mut(|op| {
                    if let Operand::Const(c) = op {
                        collect_func_refs(c, &mut used);
                    }
                });
            }
        }
        for global in &self.module.globals {
            if let Some(init) = &global.init {
                collect_func_refs(init, &mut used);
            }
        }
        for (i, func) in self.module.functions.iter_mut().enumerate() {
            if !func.dead
                && func.intrinsic.is_some()
                && !used.contains(&FuncId::new(i as u32))
            {
                tracing::trace!(name = %func.name, "dropping unused intrinsic overload");
                func.dead = true;
            }
        }
    }
}

fn collect_func_refs(c: &Constant, used: &mut rustc_hash::FxHashSet<FuncId>) {
    match &c.kind {
        ConstKind::Func(id) => {
            used.insert(*id);
        }
        ConstKind::Struct(elems) | ConstKind::Array(elems) => {
            for elem in elems {
                collect_func_refs(elem, used);
            }
        }
        ConstKind::Gep { base, indices } => {
            collect_func_refs(base, used);
            for index in indices {
                collect_func_refs(index, used);
            }
        }
        ConstKind::PtrCast(inner) | ConstKind::IntToPtr(inner) => collect_func_refs(inner, used),
        ConstKind::Add(a, b) | ConstKind::Mul(a, b) => {
            collect_func_refs(a, used);
            collect_func_refs(b, used);
        }
        ConstKind::Int(_)
        | ConstKind::Float(_)
        | ConstKind::Null
        | ConstKind::Zero
        | ConstKind::Undef
        | ConstKind::Global(_) => {}
    }
}

/// Rewrite every aggregate type in `module`.
///
/// Returns `true` when any type mapping differs from the identity. A
/// module whose aggregates are already in their cheapest shapes reports
/// `false`, even though the pass still walks every body; callers must
/// not treat the flag as "the pass ran".
pub fn run_type_optimization(module: &mut Module, layout: &TargetLayout) -> bool {
    TypeOptimizer::new(module, layout).run()
}

#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod tests;
