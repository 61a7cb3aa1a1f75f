//! # Type Matcher
//!
//! Finds the target type that corresponds to a local type.
//!
//! Candidates are first filtered by kind and, for named types, by *essential
//! name*: the local name with any `___flavor` suffix removed, so a program can
//! carry several local definitions (`task_struct___old`,
//! `task_struct___new`) that all match the target's `task_struct`.
//!
//! Matching is deliberately partial. Only the members named by the
//! relocation's access path are compared, because target layouts add, drop
//! and reorder unrelated fields between versions. Enums compare by enumerator
//! name, never by value.
//!
//! ## Ambiguity
//!
//! With a single name candidate the matcher returns it even if the path does
//! not fit (the resolver then reports the missing member). With several, the
//! ones whose shape fits the path win; if more than one fits and they disagree
//! on the resulting value, the match is ambiguous.

use std::collections::HashMap;
use std::mem::discriminant;

use smallvec::SmallVec;
use tracing::trace;

use super::access::{find_member, kinds_compatible, walk};
use super::{AccessPath, RelocationKind};
use crate::btf::{TypeGraph, TypeId, TypeNode};

/// Why no single target type could be chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchError
{
    /// No target type of the right kind and name
    NoMatch,
    /// Several equally good candidates
    Ambiguous(Vec<TypeId>),
}

/// Strip a `___flavor` suffix from a type name.
#[must_use]
pub fn essential_name(name: &str) -> &str
{
    match name.find("___") {
        Some(end) if end > 0 => &name[..end],
        _ => name,
    }
}

/// Match a local type against a target graph by kind and name alone.
///
/// Returns `None` when there is no candidate or the choice is ambiguous.
#[must_use]
pub fn match_type(local: &TypeGraph, local_id: TypeId, target: &TypeGraph) -> Option<TypeId>
{
    TypeMatcher::new(local, target)
        .find(local_id, &AccessPath::new(), RelocationKind::TypeExists)
        .ok()
}

/// Local-to-target type matcher with a per-root candidate cache.
pub struct TypeMatcher<'a>
{
    local: &'a TypeGraph,
    target: &'a TypeGraph,
    candidates: HashMap<TypeId, SmallVec<[TypeId; 4]>>,
}

impl<'a> TypeMatcher<'a>
{
    #[must_use]
    pub fn new(local: &'a TypeGraph, target: &'a TypeGraph) -> Self
    {
        Self {
            local,
            target,
            candidates: HashMap::new(),
        }
    }

    /// Find the target type for `local_id` as used by one relocation.
    ///
    /// ## Errors
    ///
    /// `MatchError::NoMatch` or `MatchError::Ambiguous`.
    pub fn find(&mut self, local_id: TypeId, path: &AccessPath, kind: RelocationKind) -> Result<TypeId, MatchError>
    {
        let root = self.local.skip_qualifiers(local_id);
        let named = self.local.get(root).is_some_and(|node| node.name.is_some());
        let candidates = self.candidates_for(root);
        trace!(local = %root, count = candidates.len(), "type match candidates");

        if candidates.is_empty() {
            return Err(MatchError::NoMatch);
        }
        if named && candidates.len() == 1 {
            return Ok(candidates[0]);
        }

        let fitting: Vec<TypeId> = candidates
            .iter()
            .copied()
            .filter(|candidate| self.shape_matches(root, *candidate, path, kind))
            .collect();

        match fitting.as_slice() {
            [] if named => Err(MatchError::Ambiguous(candidates.to_vec())),
            [] => Err(MatchError::NoMatch),
            [single] => Ok(*single),
            [first, rest @ ..] => {
                let expected = self.fingerprint(*first, path, kind);
                if expected.is_some() && rest.iter().all(|other| self.fingerprint(*other, path, kind) == expected) {
                    Ok(*first)
                } else {
                    Err(MatchError::Ambiguous(fitting))
                }
            }
        }
    }

    fn candidates_for(&mut self, root: TypeId) -> SmallVec<[TypeId; 4]>
    {
        if let Some(cached) = self.candidates.get(&root) {
            return cached.clone();
        }
        let found = match self.local.get(root) {
            None => SmallVec::new(),
            Some(local_node) => match local_node.name.as_deref() {
                Some(name) => self
                    .target
                    .ids_named(essential_name(name))
                    .iter()
                    .copied()
                    .filter(|id| self.target.get(*id).is_some_and(|node| same_kind(local_node, node)))
                    .collect(),
                None => self
                    .target
                    .iter()
                    .filter(|(_, node)| node.name.is_none() && same_kind(local_node, node))
                    .map(|(id, _)| id)
                    .collect(),
            },
        };
        self.candidates.insert(root, found.clone());
        found
    }

    fn shape_matches(&self, local_root: TypeId, candidate: TypeId, path: &AccessPath, kind: RelocationKind) -> bool
    {
        if kind.is_enum() {
            let Some(name) = path.last_name() else {
                return false;
            };
            return self
                .target
                .get(candidate)
                .and_then(TypeNode::enumerators)
                .is_some_and(|values| values.iter().any(|value| value.name == name));
        }

        if kind.is_field() {
            let (Ok(local_location), Ok(target_location)) =
                (walk(self.local, local_root, path), walk(self.target, candidate, path))
            else {
                return false;
            };
            return local_location.trail.len() == target_location.trail.len()
                && local_location
                    .trail
                    .iter()
                    .zip(target_location.trail.iter())
                    .all(|(local_step, target_step)| kinds_compatible(self.local, *local_step, self.target, *target_step));
        }

        self.names_covered(local_root, candidate)
    }

    /// Every member or enumerator name of the local type exists in the target.
    fn names_covered(&self, local_root: TypeId, candidate: TypeId) -> bool
    {
        let (Some(local_node), Some(target_node)) = (self.local.get(local_root), self.target.get(candidate)) else {
            return false;
        };
        if let Some(values) = local_node.enumerators() {
            let target_values = target_node.enumerators().unwrap_or_default();
            return values
                .iter()
                .all(|value| target_values.iter().any(|other| other.name == value.name));
        }
        if let Some(members) = local_node.members() {
            return members
                .iter()
                .filter_map(|member| member.name.as_deref())
                .all(|name| find_member(self.target, candidate, name).is_some());
        }
        true
    }

    /// Value a candidate would produce, used to collapse equivalent candidates.
    fn fingerprint(&self, candidate: TypeId, path: &AccessPath, kind: RelocationKind) -> Option<(u64, Option<u32>, i64)>
    {
        if kind.is_enum() {
            let name = path.last_name()?;
            let value = self
                .target
                .get(candidate)?
                .enumerators()?
                .iter()
                .find(|value| value.name == name)?
                .value;
            return Some((0, None, value));
        }
        if kind.is_field() {
            let location = walk(self.target, candidate, path).ok()?;
            let size = self.target.size_of(location.ty).ok()?;
            return Some((location.bit_offset, location.bitfield_size, i64::from(size)));
        }
        let size = self.target.size_of(candidate).ok()?;
        Some((0, None, i64::from(size)))
    }
}

fn same_kind(local: &TypeNode, target: &TypeNode) -> bool
{
    discriminant(&local.kind) == discriminant(&target.kind)
}
