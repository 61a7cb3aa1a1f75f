//! Access-path walking shared by the matcher and the resolver.

use std::collections::{HashSet, VecDeque};

use smallvec::SmallVec;

use super::{AccessPath, AccessStep};
use crate::btf::{Member, TypeGraph, TypeId, TypeKind};

/// Where an access path ends up inside its root type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldLocation
{
    /// Cumulative offset from the root, in bits
    pub(crate) bit_offset: u64,
    /// Set when the leaf is a bit-field member
    pub(crate) bitfield_size: Option<u32>,
    /// Declared type of the leaf
    pub(crate) ty: TypeId,
    /// Type reached after each step (qualifiers and typedefs stripped)
    pub(crate) trail: SmallVec<[TypeId; 4]>,
}

/// Why a path could not be followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalkError
{
    MissingMember
    {
        step: usize, name: String, container: String
    },
    NotComposite
    {
        step: usize, found: String
    },
    IndexOutOfBounds
    {
        step: usize, index: u32, len: u32
    },
    NoSize
    {
        step: usize, ty: String
    },
    OffsetOverflow
    {
        step: usize
    },
}

impl WalkError
{
    pub(crate) fn is_missing_member(&self) -> bool
    {
        matches!(self, WalkError::MissingMember { .. })
    }

    pub(crate) fn describe(&self) -> String
    {
        match self {
            WalkError::MissingMember { step, name, container } => {
                format!("step {step}: `{name}` is not a member of {container}")
            }
            WalkError::NotComposite { step, found } => format!("step {step}: {found} has no members"),
            WalkError::IndexOutOfBounds { step, index, len } => {
                format!("step {step}: index {index} out of bounds for array of {len}")
            }
            WalkError::NoSize { step, ty } => format!("step {step}: {ty} has no size"),
            WalkError::OffsetOverflow { step } => format!("step {step}: offset does not fit in 64 bits"),
        }
    }
}

/// Follow `path` from `root` through `graph`.
///
/// Members are looked up by name, transparently descending into anonymous
/// struct/union members. Members of a union contribute no offset. An index on
/// a non-array root is pointer arithmetic over the root type.
pub(crate) fn walk(graph: &TypeGraph, root: TypeId, path: &AccessPath) -> Result<FieldLocation, WalkError>
{
    let mut current = graph.skip_mods_and_typedefs(root);
    let mut declared = root;
    let mut bit_offset: u64 = 0;
    let mut bitfield_size = None;
    let mut trail = SmallVec::new();

    for (step, access) in path.steps().iter().enumerate() {
        match access {
            AccessStep::Member(name) => {
                if !graph.get(current).is_some_and(|node| node.is_composite()) {
                    return Err(WalkError::NotComposite {
                        step,
                        found: graph.describe(current),
                    });
                }
                let (relative, member) = find_member(graph, current, name).ok_or_else(|| WalkError::MissingMember {
                    step,
                    name: name.clone(),
                    container: graph.describe(current),
                })?;
                bit_offset = bit_offset
                    .checked_add(relative)
                    .ok_or(WalkError::OffsetOverflow { step })?;
                bitfield_size = member.bitfield_size;
                declared = member.ty;
            }
            AccessStep::Index(index) => {
                let (element, len) = match graph.get(current).map(|node| &node.kind) {
                    Some(TypeKind::Array { element, len, .. }) => (*element, Some(*len)),
                    _ if step == 0 => (current, None),
                    _ => {
                        return Err(WalkError::NotComposite {
                            step,
                            found: graph.describe(current),
                        })
                    }
                };
                // Zero-length arrays are flexible array members.
                if let Some(len) = len.filter(|len| *len > 0 && index >= len) {
                    return Err(WalkError::IndexOutOfBounds {
                        step,
                        index: *index,
                        len,
                    });
                }
                let element_size = graph.size_of(element).map_err(|_| WalkError::NoSize {
                    step,
                    ty: graph.describe(element),
                })?;
                bit_offset = u64::from(*index)
                    .checked_mul(u64::from(element_size))
                    .and_then(|bytes| bytes.checked_mul(8))
                    .and_then(|bits| bit_offset.checked_add(bits))
                    .ok_or(WalkError::OffsetOverflow { step })?;
                bitfield_size = None;
                declared = if len.is_some() { element } else { declared };
            }
        }
        current = graph.skip_mods_and_typedefs(declared);
        trail.push(current);
    }

    Ok(FieldLocation {
        bit_offset,
        bitfield_size,
        ty: declared,
        trail,
    })
}

/// Breadth-first member lookup so direct members win over members of
/// anonymous children. Returns the member and its bit offset relative to
/// `container`.
pub(crate) fn find_member(graph: &TypeGraph, container: TypeId, name: &str) -> Option<(u64, Member)>
{
    let mut queue = VecDeque::from([(container, 0u64)]);
    let mut visited = HashSet::new();

    while let Some((id, base)) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = graph.get(id) else {
            continue;
        };
        let Some(members) = node.members() else {
            continue;
        };
        let union = node.is_union();
        let offset_of = |member: &Member| if union { 0 } else { u64::from(member.bit_offset) };

        if let Some(member) = members.iter().find(|member| member.name.as_deref() == Some(name)) {
            return Some((base.saturating_add(offset_of(member)), member.clone()));
        }
        for member in members.iter().filter(|member| member.name.is_none()) {
            let anonymous = graph.skip_mods_and_typedefs(member.ty);
            if graph.get(anonymous).is_some_and(|node| node.is_composite()) {
                queue.push_back((anonymous, base.saturating_add(offset_of(member))));
            }
        }
    }
    None
}

/// Whether two leaf types are layout-compatible for relocation purposes.
///
/// Composites match composites, integers match integers regardless of width,
/// enums match enums, pointers match pointers and arrays match when their
/// element types do.
pub(crate) fn kinds_compatible(local: &TypeGraph, local_id: TypeId, target: &TypeGraph, target_id: TypeId) -> bool
{
    let mut local_id = local.skip_mods_and_typedefs(local_id);
    let mut target_id = target.skip_mods_and_typedefs(target_id);
    let mut visited = HashSet::new();

    while visited.insert((local_id, target_id)) {
        let (Some(local_node), Some(target_node)) = (local.get(local_id), target.get(target_id)) else {
            return false;
        };
        match (&local_node.kind, &target_node.kind) {
            (TypeKind::Array { element: l, .. }, TypeKind::Array { element: t, .. }) => {
                local_id = local.skip_mods_and_typedefs(*l);
                target_id = target.skip_mods_and_typedefs(*t);
            }
            (
                TypeKind::Struct { .. } | TypeKind::Union { .. } | TypeKind::Fwd { .. },
                TypeKind::Struct { .. } | TypeKind::Union { .. } | TypeKind::Fwd { .. },
            ) => return true,
            (TypeKind::Int { .. }, TypeKind::Int { .. })
            | (TypeKind::Enum { .. }, TypeKind::Enum { .. })
            | (TypeKind::Ptr { .. }, TypeKind::Ptr { .. })
            | (TypeKind::Float { .. }, TypeKind::Float { .. })
            | (TypeKind::Void, TypeKind::Void) => return true,
            _ => return false,
        }
    }
    true
}
