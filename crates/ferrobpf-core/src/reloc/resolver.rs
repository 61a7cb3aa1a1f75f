//! # Relocation Resolver
//!
//! Turns a matched relocation into the concrete value for the target.
//!
//! Field paths are always walked through the *target* graph, by name, one
//! step at a time. A missing intermediate member fails the whole path.
//! Missing targets are handled according to the relocation's [`Policy`]:
//! strict records fail the load, best-effort records resolve to a zero/false
//! sentinel and are reported as [`Resolution::Defaulted`].
//!
//! Field-exists records are the exception: a missing field is a legitimate
//! answer (`0`), not a degradation.

use super::access::{walk, WalkError};
use super::{MatchError, Policy, PolicyTable, RelocationKind, RelocationRecord};
use crate::btf::{TypeGraph, TypeId};
use crate::error::{LoaderError, LoaderResult};

/// Concrete value computed for a relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedValue
{
    /// Byte offset of a field; bit-field position kept alongside
    FieldOffset
    {
        byte_offset: u32,
        bit_offset: u64,
        bitfield_size: Option<u32>,
    },
    FieldSize(u32),
    Exists(bool),
    TypeSize(u32),
    EnumValue(i64),
}

impl ResolvedValue
{
    /// Zero/false value patched when a best-effort relocation cannot resolve.
    #[must_use]
    pub const fn sentinel(kind: RelocationKind) -> Self
    {
        match kind {
            RelocationKind::FieldOffset => ResolvedValue::FieldOffset {
                byte_offset: 0,
                bit_offset: 0,
                bitfield_size: None,
            },
            RelocationKind::FieldSize => ResolvedValue::FieldSize(0),
            RelocationKind::TypeSize => ResolvedValue::TypeSize(0),
            RelocationKind::EnumValue => ResolvedValue::EnumValue(0),
            RelocationKind::FieldExists | RelocationKind::TypeExists | RelocationKind::EnumExists => {
                ResolvedValue::Exists(false)
            }
        }
    }

    /// Value to place in the instruction operand.
    #[must_use]
    pub const fn as_imm(&self) -> i64
    {
        match self {
            ResolvedValue::FieldOffset { byte_offset, .. } => *byte_offset as i64,
            ResolvedValue::FieldSize(size) | ResolvedValue::TypeSize(size) => *size as i64,
            ResolvedValue::Exists(exists) => *exists as i64,
            ResolvedValue::EnumValue(value) => *value,
        }
    }
}

/// Outcome of resolving one relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution
{
    /// The target supplied the value
    Resolved(ResolvedValue),
    /// Best-effort policy substituted the sentinel
    Defaulted
    {
        value: ResolvedValue,
        reason: String,
    },
}

impl Resolution
{
    #[must_use]
    pub fn value(&self) -> ResolvedValue
    {
        match self {
            Resolution::Resolved(value) | Resolution::Defaulted { value, .. } => *value,
        }
    }
}

/// Computes target values for relocation records.
pub struct RelocationResolver<'a>
{
    local: &'a TypeGraph,
    target: &'a TypeGraph,
    policies: &'a PolicyTable,
}

impl<'a> RelocationResolver<'a>
{
    #[must_use]
    pub fn new(local: &'a TypeGraph, target: &'a TypeGraph, policies: &'a PolicyTable) -> Self
    {
        Self {
            local,
            target,
            policies,
        }
    }

    /// Resolve `record` given the matcher's verdict.
    ///
    /// ## Errors
    ///
    /// Under strict policy: `NoMatch`, `AmbiguousMatch` or `Unresolvable`.
    pub fn resolve(&self, record: &RelocationRecord, matched: Result<TypeId, MatchError>) -> LoaderResult<Resolution>
    {
        let policy = self.policies.effective(record);
        let target_id = match matched {
            Ok(id) => id,
            Err(err) => {
                let name = self.local.describe(record.local_type);
                let failure = match err {
                    MatchError::NoMatch => LoaderError::NoMatch {
                        insn: record.insn,
                        local_type: record.local_type,
                        name,
                    },
                    MatchError::Ambiguous(candidates) => LoaderError::AmbiguousMatch {
                        insn: record.insn,
                        local_type: record.local_type,
                        name,
                        candidates,
                    },
                };
                return degrade(record.kind, policy, failure);
            }
        };

        match record.kind {
            RelocationKind::FieldOffset | RelocationKind::FieldSize => match walk(self.target, target_id, &record.path) {
                Ok(location) => match self.field_value(record, &location, self.target) {
                    Ok(value) => Ok(Resolution::Resolved(value)),
                    Err(err @ LoaderError::Unresolvable { .. }) => degrade(record.kind, policy, err),
                    Err(err) => Err(err),
                },
                Err(err) => degrade(record.kind, policy, unresolvable(record, &err)),
            },
            RelocationKind::FieldExists => match walk(self.target, target_id, &record.path) {
                Ok(_) => Ok(Resolution::Resolved(ResolvedValue::Exists(true))),
                Err(err) if err.is_missing_member() => Ok(Resolution::Resolved(ResolvedValue::Exists(false))),
                Err(err) => degrade(record.kind, policy, unresolvable(record, &err)),
            },
            RelocationKind::TypeExists => Ok(Resolution::Resolved(ResolvedValue::Exists(true))),
            RelocationKind::TypeSize => match self.target.size_of(target_id) {
                Ok(size) => Ok(Resolution::Resolved(ResolvedValue::TypeSize(size))),
                Err(err) => degrade(
                    record.kind,
                    policy,
                    LoaderError::Unresolvable {
                        insn: record.insn,
                        kind: record.kind,
                        reason: err.to_string(),
                    },
                ),
            },
            RelocationKind::EnumValue | RelocationKind::EnumExists => {
                match enumerator_value(self.target, target_id, record) {
                    Some(value) if record.kind == RelocationKind::EnumValue => {
                        Ok(Resolution::Resolved(ResolvedValue::EnumValue(value)))
                    }
                    Some(_) => Ok(Resolution::Resolved(ResolvedValue::Exists(true))),
                    None => degrade(
                        record.kind,
                        policy,
                        LoaderError::Unresolvable {
                            insn: record.insn,
                            kind: record.kind,
                            reason: format!(
                                "enumerator `{}` not found in {}",
                                record.path.last_name().unwrap_or("<none>"),
                                self.target.describe(target_id)
                            ),
                        },
                    ),
                }
            }
        }
    }

    /// Value the compiler baked into the instruction, computed against the
    /// local graph.
    ///
    /// ## Errors
    ///
    /// `Unresolvable` if the record does not describe a valid access in its
    /// own local graph.
    pub fn local_value(&self, record: &RelocationRecord) -> LoaderResult<i64>
    {
        let invalid = |reason: String| LoaderError::Unresolvable {
            insn: record.insn,
            kind: record.kind,
            reason: format!("invalid in local type {}: {reason}", self.local.describe(record.local_type)),
        };
        match record.kind {
            RelocationKind::FieldExists | RelocationKind::TypeExists | RelocationKind::EnumExists => Ok(1),
            RelocationKind::FieldOffset | RelocationKind::FieldSize => {
                let location = walk(self.local, record.local_type, &record.path).map_err(|err| invalid(err.describe()))?;
                Ok(self.field_value(record, &location, self.local)?.as_imm())
            }
            RelocationKind::TypeSize => self
                .local
                .size_of(record.local_type)
                .map(i64::from)
                .map_err(|err| invalid(err.to_string())),
            RelocationKind::EnumValue => {
                let root = self.local.skip_qualifiers(record.local_type);
                enumerator_value(self.local, root, record)
                    .ok_or_else(|| invalid(format!("no enumerator `{}`", record.path.last_name().unwrap_or("<none>"))))
            }
        }
    }

    fn field_value(
        &self,
        record: &RelocationRecord,
        location: &super::access::FieldLocation,
        graph: &TypeGraph,
    ) -> LoaderResult<ResolvedValue>
    {
        let byte_size = graph.size_of(location.ty).map_err(|err| LoaderError::Unresolvable {
            insn: record.insn,
            kind: record.kind,
            reason: err.to_string(),
        })?;

        if record.kind == RelocationKind::FieldSize {
            return Ok(ResolvedValue::FieldSize(byte_size));
        }

        // Bit-fields are read through a load of the underlying integer, so the
        // byte offset is aligned down to that integer's size.
        let byte_offset = match location.bitfield_size {
            Some(_) if byte_size > 0 => (location.bit_offset / 8) / u64::from(byte_size) * u64::from(byte_size),
            _ => location.bit_offset / 8,
        };
        let byte_offset = u32::try_from(byte_offset).map_err(|_| LoaderError::ValueOverflow {
            insn: record.insn,
            value: byte_offset as i64,
        })?;

        Ok(ResolvedValue::FieldOffset {
            byte_offset,
            bit_offset: location.bit_offset,
            bitfield_size: location.bitfield_size,
        })
    }
}

fn enumerator_value(graph: &TypeGraph, enum_id: TypeId, record: &RelocationRecord) -> Option<i64>
{
    let name = record.path.last_name()?;
    graph
        .get(graph.skip_mods_and_typedefs(enum_id))?
        .enumerators()?
        .iter()
        .find(|value| value.name == name)
        .map(|value| value.value)
}

fn unresolvable(record: &RelocationRecord, err: &WalkError) -> LoaderError
{
    LoaderError::Unresolvable {
        insn: record.insn,
        kind: record.kind,
        reason: format!("access `{}`: {}", record.path, err.describe()),
    }
}

fn degrade(kind: RelocationKind, policy: Policy, failure: LoaderError) -> LoaderResult<Resolution>
{
    match policy {
        Policy::Strict => Err(failure),
        Policy::BestEffort => Ok(Resolution::Defaulted {
            value: ResolvedValue::sentinel(kind),
            reason: failure.to_string(),
        }),
    }
}
