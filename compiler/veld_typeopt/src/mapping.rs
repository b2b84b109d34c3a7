//! Type mapping entries.
//!
//! Every old type descriptor resolves to exactly one [`TypeMapping`]:
//! the replacement type plus a [`MappingKind`] describing how values of
//! the old type must be transcoded. Entries are memoized by the
//! classifier and never change once resolved, with one exception: the
//! transient [`MappingKind::Collapsing`] marker used to break recursive
//! cycles, which either resolves to a final kind or degrades to
//! [`MappingKind::CollapsingButUsed`] before the classifier returns.

use std::rc::Rc;

use veld_ir::TyIdx;

/// Where an original struct field ended up after member merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberSlot {
    /// Field index in the rewritten struct.
    pub index: u32,
    /// Element offset inside a merged array, or bit offset inside a
    /// merged integer. Zero for unmerged fields.
    pub offset: u32,
}

/// How values of a rewritten type must be transcoded.
///
/// A closed sum: each variant carries exactly the payload its consumers
/// need. Only the two merged variants reference a member-remap table.
#[derive(Clone, Debug, PartialEq)]
pub enum MappingKind {
    /// Same shape; values carry over unchanged (the type descriptor
    /// itself may still be a fresh struct node).
    Identical,
    /// Single-member struct replaced by its member's rewritten type
    /// everywhere.
    Collapsed,
    /// Byte-layout struct replaced by an array of its unified base
    /// element type (or the bare element when one fits exactly).
    ByteLayoutToArray,
    /// Array-of-array replaced by one array of the innermost element.
    FlattenedArray,
    /// Pointer-to-array replaced by pointer-to-element; the length
    /// became implicit.
    PointerFromArray,
    /// Struct with adjacent arrays and/or narrow integers merged into
    /// shared members.
    MergedMembers { members: Rc<[MemberSlot]> },
    /// Members merged down to a single one, which then collapsed.
    MergedMembersCollapsed { members: Rc<[MemberSlot]> },
    /// Transient: collapse in progress, cycle not yet resolved. Never
    /// observed outside the classifier.
    Collapsing,
    /// Transient: a non-struct consumer reached the type while it was
    /// collapsing; the collapse must be abandoned.
    CollapsingButUsed,
}

impl MappingKind {
    /// `true` for the kinds under which a struct reference degenerates
    /// to a direct reference to the sole member.
    pub fn is_collapsed_struct(&self) -> bool {
        matches!(self, MappingKind::Collapsed | MappingKind::MergedMembersCollapsed { .. })
    }

    /// The member-remap table, for the merged variants.
    pub fn members(&self) -> Option<&Rc<[MemberSlot]>> {
        match self {
            MappingKind::MergedMembers { members }
            | MappingKind::MergedMembersCollapsed { members } => Some(members),
            _ => None,
        }
    }
}

/// Resolved mapping for one old type descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeMapping {
    pub mapped: TyIdx,
    pub kind: MappingKind,
}

impl TypeMapping {
    pub fn identical(ty: TyIdx) -> Self {
        Self { mapped: ty, kind: MappingKind::Identical }
    }

    pub fn new(mapped: TyIdx, kind: MappingKind) -> Self {
        Self { mapped, kind }
    }
}
