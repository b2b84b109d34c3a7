//! Intermediate representation for the Veld compiler backend.
//!
//! This crate provides the whole-program IR that the lowering passes
//! operate on:
//!
//! - **[`TypePool`]**: interned, index-addressed type descriptors
//!   ([`TyIdx`]). Scalar, pointer, array, and function types are
//!   hash-consed; struct types are nominal arena nodes that support
//!   two-phase construction ([`TypePool::reserve_struct`] then
//!   [`TypePool::set_struct_body`]) so recursive types can be built.
//! - **[`TargetLayout`]**: the size/offset/alignment oracle for the
//!   target. Consumers treat it as opaque; it is the only place byte
//!   arithmetic on types happens.
//! - **[`Constant`]**: tree-shaped constant values, including constant
//!   address-computation expressions, rebuildable without touching any
//!   use list.
//! - **[`Module`]**, **[`Function`]**, **[`Block`]**, **[`Instr`]**,
//!   **[`Terminator`]**: a conventional basic-block function IR.
//!   Values are function-local and referenced by
//!   [`InstrId`]/argument index through [`Operand`].
//!
//! The IR is deliberately mutable in place: passes retype instructions
//! and swap operands directly, and structurally replaced instructions
//! are superseded through side tables owned by the pass.

pub mod constant;
pub mod func;
pub mod layout;
pub mod ty;

pub use constant::{ConstKind, Constant};
pub use func::{
    BinOp, Block, BlockId, Callee, FuncId, Function, GlobalId, GlobalVar, Instr, InstrId,
    InstrKind, Intrinsic, Module, Operand, Param, Terminator,
};
pub use layout::{StructLayout, TargetLayout};
pub use ty::{StructData, StructFlags, TyIdx, TyKind, TypePool};
