//! Functions, basic blocks, instructions, and the program module.
//!
//! The function IR is a conventional basic-block representation: a
//! [`Function`] owns an instruction arena and a list of
//! [`Block`]s whose bodies reference instructions by [`InstrId`].
//! Operands name function-local values ([`Operand::Value`] /
//! [`Operand::Arg`]) or carry a [`Constant`] inline.
//!
//! Intrinsics are module-level declarations (functions without blocks)
//! carrying an [`Intrinsic`] tag; one declaration exists per overload,
//! where the overload is identified by a subset of the signature types.

use smallvec::{smallvec, SmallVec};

use rustc_hash::FxHashMap;

use crate::constant::Constant;
use crate::ty::{TyIdx, TyKind, TypePool};

/// Instruction ID within a [`Function`]'s instruction arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct InstrId(u32);

impl InstrId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Basic block ID within a [`Function`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Function ID within a [`Module`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FuncId(u32);

impl FuncId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Global variable ID within a [`Module`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GlobalId(u32);

impl GlobalId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An instruction operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Result of another instruction in the same function.
    Value(InstrId),
    /// Function argument by position.
    Arg(u32),
    Const(Constant),
}

impl Operand {
    pub fn index(value: u64) -> Self {
        Operand::Const(Constant::index(value))
    }

    /// The integer payload, if this operand is an integer constant.
    pub fn as_const_int(&self) -> Option<u64> {
        match self {
            Operand::Const(c) => c.as_int(),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Mul,
    And,
    Or,
    Shl,
    AShr,
}

/// Call target.
#[derive(Clone, Debug, PartialEq)]
pub enum Callee {
    Func(FuncId),
    Indirect(Operand),
}

/// Module-recognized intrinsic operations.
///
/// Each intrinsic declaration is overloaded on a subset of its
/// signature types (see [`Intrinsic::overload_tys`]); one declaration
/// exists per distinct overload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Checked base-to-derived pointer conversion; operand 1 is the
    /// byte offset of the base subobject inside the derived object.
    Downcast,
    DowncastCurrent,
    /// Unchecked cast through a virtual base; defeats collapsing.
    VirtualCast,
    /// Derived-to-base conversion that expects the base to have been
    /// collapsed away.
    UpcastCollapsed,
    /// Conversion involving an opaque host type.
    CastHost,
    Allocate,
    AllocateArray,
    Reallocate,
    Deallocate,
    GetArrayLen,
    PointerKind,
    MakeCompleteObject,
    CreateClosure,
    MemCpy,
    MemMove,
    MemSet,
    LifetimeStart,
    LifetimeEnd,
}

impl Intrinsic {
    pub fn base_name(self) -> &'static str {
        match self {
            Intrinsic::Downcast => "downcast",
            Intrinsic::DowncastCurrent => "downcast.current",
            Intrinsic::VirtualCast => "virtualcast",
            Intrinsic::UpcastCollapsed => "upcast.collapsed",
            Intrinsic::CastHost => "cast.host",
            Intrinsic::Allocate => "allocate",
            Intrinsic::AllocateArray => "allocate.array",
            Intrinsic::Reallocate => "reallocate",
            Intrinsic::Deallocate => "deallocate",
            Intrinsic::GetArrayLen => "get.array.len",
            Intrinsic::PointerKind => "pointer.kind",
            Intrinsic::MakeCompleteObject => "make.complete.object",
            Intrinsic::CreateClosure => "create.closure",
            Intrinsic::MemCpy => "memcpy",
            Intrinsic::MemMove => "memmove",
            Intrinsic::MemSet => "memset",
            Intrinsic::LifetimeStart => "lifetime.start",
            Intrinsic::LifetimeEnd => "lifetime.end",
        }
    }

    /// The signature types this intrinsic is overloaded on, extracted
    /// from a concrete function type.
    pub fn overload_tys(self, pool: &TypePool, fn_ty: TyIdx) -> SmallVec<[TyIdx; 3]> {
        let TyKind::Func { ret, params, .. } = pool.kind(fn_ty) else {
            panic!("overload_tys() on non-function type");
        };
        match self {
            Intrinsic::Downcast
            | Intrinsic::VirtualCast
            | Intrinsic::UpcastCollapsed
            | Intrinsic::CastHost
            | Intrinsic::Reallocate
            | Intrinsic::MakeCompleteObject => smallvec![*ret, params[0]],
            Intrinsic::DowncastCurrent
            | Intrinsic::GetArrayLen
            | Intrinsic::Deallocate
            | Intrinsic::PointerKind => smallvec![params[0]],
            Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd => smallvec![params[1]],
            Intrinsic::Allocate | Intrinsic::AllocateArray => smallvec![*ret],
            Intrinsic::CreateClosure => smallvec![*ret, params[0], params[1]],
            Intrinsic::MemCpy | Intrinsic::MemMove => {
                smallvec![params[0], params[1], params[2]]
            }
            Intrinsic::MemSet => smallvec![params[0], params[2]],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstrKind {
    /// Stack allocation; result type is pointer-to-`allocated`.
    Alloca { allocated: TyIdx },
    Load { ptr: Operand },
    Store { value: Operand, ptr: Operand },
    /// Address computation from `base` through member/element `indices`.
    Gep { base: Operand, indices: Vec<Operand>, inbounds: bool },
    /// `byval` runs parallel to `args` when non-empty: a `true` entry
    /// means the callee receives a fresh copy of the pointee.
    Call { callee: Callee, args: Vec<Operand>, byval: Vec<bool> },
    PtrCast { value: Operand },
    IntToPtr { value: Operand },
    Binary { op: BinOp, lhs: Operand, rhs: Operand },
    ZExt { value: Operand },
    Trunc { value: Operand },
    Phi { incoming: Vec<(BlockId, Operand)> },
    Select { cond: Operand, if_true: Operand, if_false: Operand },
    ExtractValue { agg: Operand, indices: Vec<u32> },
    InsertValue { agg: Operand, value: Operand, indices: Vec<u32> },
    VaArg { list: Operand },
}

/// A single instruction: its result type plus the operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    pub ty: TyIdx,
    pub kind: InstrKind,
}

impl Instr {
    pub fn new(ty: TyIdx, kind: InstrKind) -> Self {
        Self { ty, kind }
    }

    /// Visit every operand.
    pub fn for_each_operand(&self, mut f: impl FnMut(&Operand)) {
        self.kind.for_each_operand_impl(&mut |op| f(op));
    }

    /// Visit every operand mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        self.kind.for_each_operand_mut_impl(&mut |op| f(op));
    }
}

impl InstrKind {
    fn for_each_operand_impl(&self, f: &mut dyn FnMut(&Operand)) {
        match self {
            InstrKind::Alloca { .. } => {}
            InstrKind::Load { ptr } => f(ptr),
            InstrKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstrKind::Gep { base, indices, .. } => {
                f(base);
                indices.iter().for_each(&mut *f);
            }
            InstrKind::Call { callee, args, .. } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter().for_each(&mut *f);
            }
            InstrKind::PtrCast { value }
            | InstrKind::IntToPtr { value }
            | InstrKind::ZExt { value }
            | InstrKind::Trunc { value }
            | InstrKind::VaArg { list: value } => f(value),
            InstrKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstrKind::Phi { incoming } => incoming.iter().for_each(|(_, op)| f(op)),
            InstrKind::Select { cond, if_true, if_false } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            InstrKind::ExtractValue { agg, .. } => f(agg),
            InstrKind::InsertValue { agg, value, .. } => {
                f(agg);
                f(value);
            }
        }
    }

    fn for_each_operand_mut_impl(&mut self, f: &mut dyn FnMut(&mut Operand)) {
        match self {
            InstrKind::Alloca { .. } => {}
            InstrKind::Load { ptr } => f(ptr),
            InstrKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstrKind::Gep { base, indices, .. } => {
                f(base);
                indices.iter_mut().for_each(&mut *f);
            }
            InstrKind::Call { callee, args, .. } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter_mut().for_each(&mut *f);
            }
            InstrKind::PtrCast { value }
            | InstrKind::IntToPtr { value }
            | InstrKind::ZExt { value }
            | InstrKind::Trunc { value }
            | InstrKind::VaArg { list: value } => f(value),
            InstrKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstrKind::Phi { incoming } => incoming.iter_mut().for_each(|(_, op)| f(op)),
            InstrKind::Select { cond, if_true, if_false } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            InstrKind::ExtractValue { agg, .. } => f(agg),
            InstrKind::InsertValue { agg, value, .. } => {
                f(agg);
                f(value);
            }
        }
    }
}

/// Block exit.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr { cond: Operand, if_true: BlockId, if_false: BlockId },
    Switch { value: Operand, default: BlockId, cases: Vec<(u64, BlockId)> },
    Unreachable,
}

impl Terminator {
    /// Successor block IDs, in branch order.
    pub fn successors(&self) -> SmallVec<[BlockId; 4]> {
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => SmallVec::new(),
            Terminator::Br(target) => smallvec![*target],
            Terminator::CondBr { if_true, if_false, .. } => smallvec![*if_true, *if_false],
            Terminator::Switch { default, cases, .. } => {
                let mut out = SmallVec::with_capacity(cases.len() + 1);
                for &(_, b) in cases {
                    out.push(b);
                }
                out.push(*default);
                out
            }
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            Terminator::Ret(Some(value)) => f(value),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    /// Instruction ids in execution order.
    pub instrs: Vec<InstrId>,
    pub term: Terminator,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub ty: TyIdx,
    /// The callee receives a fresh copy of the pointee.
    pub byval: bool,
    /// The callee only reads through this pointer.
    pub readonly: bool,
}

impl Param {
    pub fn new(ty: TyIdx) -> Self {
        Self { ty, byval: false, readonly: false }
    }
}

/// A function definition or declaration (no blocks).
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// The function type. Kept in sync with `params` when either is
    /// rewritten.
    pub ty: TyIdx,
    pub params: Vec<Param>,
    /// Instruction arena; blocks reference entries by [`InstrId`].
    pub instrs: Vec<Instr>,
    /// Basic blocks; entry is block 0. Empty for declarations.
    pub blocks: Vec<Block>,
    pub intrinsic: Option<Intrinsic>,
    /// Scheduled for removal; skipped by module iteration.
    pub dead: bool,
}

impl Default for Function {
    fn default() -> Self {
        Self {
            name: String::new(),
            ty: TyIdx::VOID,
            params: Vec::new(),
            instrs: Vec::new(),
            blocks: Vec::new(),
            intrinsic: None,
            dead: true,
        }
    }
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    /// Append an instruction to the arena (not yet in any block).
    pub fn add_instr(&mut self, instr: Instr) -> InstrId {
        let id = InstrId::new(self.instrs.len() as u32);
        self.instrs.push(instr);
        id
    }

    /// Current type of an operand.
    pub fn operand_ty(&self, op: &Operand) -> TyIdx {
        match op {
            Operand::Value(id) => self.instr(*id).ty,
            Operand::Arg(i) => self.params[*i as usize].ty,
            Operand::Const(c) => c.ty,
        }
    }
}

/// A global variable. Its address has type pointer-to-`value_ty`.
#[derive(Clone, Debug)]
pub struct GlobalVar {
    pub name: String,
    pub value_ty: TyIdx,
    pub init: Option<Constant>,
    pub is_const: bool,
}

/// One program unit: types, globals, functions, and the struct
/// inheritance metadata the backend needs.
#[derive(Debug, Default)]
pub struct Module {
    pub types: TypePool,
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<Function>,
    /// Per struct name, the recorded first-base field ranges. The
    /// frontend emits duplicated entries; they are updated uniformly
    /// and never deduplicated.
    pub bases_ranges: FxHashMap<String, Vec<u32>>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            types: TypePool::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            bases_ranges: FxHashMap::default(),
        }
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId::new(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    pub fn add_global(&mut self, global: GlobalVar) -> GlobalId {
        let id = GlobalId::new(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.globals[id.index()]
    }

    /// All live function ids in declaration order.
    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.dead)
            .map(|(i, _)| FuncId::new(i as u32))
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId::new)
    }

    /// Overload-mangled display name of an intrinsic declaration.
    pub fn intrinsic_name(&self, intr: Intrinsic, tys: &[TyIdx]) -> String {
        let mut name = format!("veld.{}", intr.base_name());
        for &ty in tys {
            name.push('.');
            name.push_str(&self.types.mangle(ty));
        }
        name
    }

    /// Find the live declaration for an intrinsic overload.
    pub fn find_intrinsic(&self, intr: Intrinsic, tys: &[TyIdx]) -> Option<FuncId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.dead && f.intrinsic == Some(intr))
            .find(|(_, f)| intr.overload_tys(&self.types, f.ty).as_slice() == tys)
            .map(|(i, _)| FuncId::new(i as u32))
    }

    /// Create a declaration for an intrinsic overload.
    pub fn declare_intrinsic(&mut self, intr: Intrinsic, fn_ty: TyIdx) -> FuncId {
        let tys = intr.overload_tys(&self.types, fn_ty);
        let name = self.intrinsic_name(intr, &tys);
        let TyKind::Func { params, .. } = self.types.kind(fn_ty) else {
            panic!("declare_intrinsic() with non-function type");
        };
        let params = params.iter().map(|&ty| Param::new(ty)).collect();
        self.add_function(Function {
            name,
            ty: fn_ty,
            params,
            instrs: Vec::new(),
            blocks: Vec::new(),
            intrinsic: Some(intr),
            dead: false,
        })
    }
}
