//! Constant values and constant expressions.
//!
//! Constants are trees, not interned: a pass that needs a constant with
//! a different type rebuilds the tree. `Add` and `Mul` only appear as
//! folded leftovers of constant index arithmetic.

use crate::func::{FuncId, GlobalId};
use crate::ty::{TyIdx, TyKind, TypePool};

/// A constant value together with its type.
#[derive(Clone, Debug, PartialEq)]
pub struct Constant {
    pub ty: TyIdx,
    pub kind: ConstKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConstKind {
    Int(u64),
    /// Bit pattern of the floating-point value.
    Float(u64),
    /// Null pointer.
    Null,
    /// Zero of an aggregate type.
    Zero,
    Undef,
    Struct(Vec<Constant>),
    Array(Vec<Constant>),
    Global(GlobalId),
    Func(FuncId),
    /// Constant address computation.
    Gep { base: Box<Constant>, indices: Vec<Constant> },
    PtrCast(Box<Constant>),
    IntToPtr(Box<Constant>),
    Add(Box<Constant>, Box<Constant>),
    Mul(Box<Constant>, Box<Constant>),
}

impl Constant {
    pub fn int(ty: TyIdx, value: u64) -> Self {
        Self { ty, kind: ConstKind::Int(value) }
    }

    /// The canonical `i32` constant used for address indices.
    pub fn index(value: u64) -> Self {
        Self::int(TyIdx::I32, value)
    }

    pub fn undef(ty: TyIdx) -> Self {
        Self { ty, kind: ConstKind::Undef }
    }

    /// Zero value of any type: `0`/`0.0` for scalars, null for
    /// pointers, aggregate zero for structs and arrays.
    pub fn null_value(pool: &TypePool, ty: TyIdx) -> Self {
        if pool.is_struct(ty) {
            return Self { ty, kind: ConstKind::Zero };
        }
        let kind = match pool.kind(ty) {
            TyKind::Int(_) => ConstKind::Int(0),
            TyKind::Float(_) => ConstKind::Float(0),
            TyKind::Pointer(_) => ConstKind::Null,
            TyKind::Array { .. } => ConstKind::Zero,
            k => panic!("null_value() of {k:?}"),
        };
        Self { ty, kind }
    }

    /// The integer payload, if this is an integer constant.
    pub fn as_int(&self) -> Option<u64> {
        match self.kind {
            ConstKind::Int(v) => Some(v),
            _ => None,
        }
    }

    /// `a + b`, folded when both sides are integer constants.
    pub fn add(a: Constant, b: Constant) -> Constant {
        let ty = a.ty;
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Constant::int(ty, x.wrapping_add(y)),
            _ => Constant { ty, kind: ConstKind::Add(Box::new(a), Box::new(b)) },
        }
    }

    /// `a * multiplier`, folded when `a` is an integer constant.
    pub fn mul(a: Constant, multiplier: u32) -> Constant {
        let ty = a.ty;
        match a.as_int() {
            Some(x) => Constant::int(ty, x.wrapping_mul(u64::from(multiplier))),
            None => Constant {
                ty,
                kind: ConstKind::Mul(Box::new(a), Box::new(Constant::int(ty, u64::from(multiplier)))),
            },
        }
    }
}
