//! # Portable Relocations
//!
//! Compile-once/run-everywhere support: the compiler records every field
//! offset, field size, type size and enum constant a program depends on as a
//! [`RelocationRecord`]. At load time each record is matched against the
//! target's type graph and the instruction it points at is rewritten with the
//! target's value.
//!
//! The pipeline for one program is:
//!
//! ```text
//! RelocationRecord ──▶ TypeMatcher ──▶ RelocationResolver ──▶ patcher
//!                      (local → target     (target value,        (rewrite imm/off
//!                       candidate)          policy)               in place)
//! ```
//!
//! Records are processed in instruction order, and each one patches exactly
//! one instruction.

pub(crate) mod access;
pub mod matcher;
pub mod patcher;
pub mod resolver;

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use tracing::{debug, warn};

pub use matcher::{match_type, MatchError, TypeMatcher};
pub use resolver::{Resolution, ResolvedValue, RelocationResolver};

use crate::btf::{TypeGraph, TypeId};
use crate::error::{LoaderError, LoaderResult};
use crate::program::ProgramImage;

/// What a relocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind
{
    /// Byte offset of a field
    FieldOffset,
    /// Byte size of a field
    FieldSize,
    /// Whether a field exists (1/0)
    FieldExists,
    /// Byte size of a type
    TypeSize,
    /// Whether a type exists (1/0)
    TypeExists,
    /// Integer value of an enumerator
    EnumValue,
    /// Whether an enumerator exists (1/0)
    EnumExists,
}

impl RelocationKind
{
    pub const ALL: [RelocationKind; 7] = [
        RelocationKind::FieldOffset,
        RelocationKind::FieldSize,
        RelocationKind::FieldExists,
        RelocationKind::TypeSize,
        RelocationKind::TypeExists,
        RelocationKind::EnumValue,
        RelocationKind::EnumExists,
    ];

    /// Existence probes answer yes/no instead of producing a layout value.
    #[must_use]
    pub const fn is_existence(self) -> bool
    {
        matches!(
            self,
            RelocationKind::FieldExists | RelocationKind::TypeExists | RelocationKind::EnumExists
        )
    }

    #[must_use]
    pub const fn is_field(self) -> bool
    {
        matches!(
            self,
            RelocationKind::FieldOffset | RelocationKind::FieldSize | RelocationKind::FieldExists
        )
    }

    #[must_use]
    pub const fn is_enum(self) -> bool
    {
        matches!(self, RelocationKind::EnumValue | RelocationKind::EnumExists)
    }

    /// Policy applied when neither the record nor the options say otherwise.
    #[must_use]
    pub const fn default_policy(self) -> Policy
    {
        if self.is_existence() {
            Policy::BestEffort
        } else {
            Policy::Strict
        }
    }

    /// Decode the `kind` field of a `.BTF.ext` CO-RE record.
    ///
    /// Kinds this loader does not implement (signedness, shifts, type ids,
    /// type matching) return `None`.
    #[must_use]
    pub const fn from_btf_ext(raw: u32) -> Option<Self>
    {
        match raw {
            0 => Some(RelocationKind::FieldOffset),
            1 => Some(RelocationKind::FieldSize),
            2 => Some(RelocationKind::FieldExists),
            8 => Some(RelocationKind::TypeExists),
            9 => Some(RelocationKind::TypeSize),
            10 => Some(RelocationKind::EnumExists),
            11 => Some(RelocationKind::EnumValue),
            _ => None,
        }
    }

    const fn index(self) -> usize
    {
        match self {
            RelocationKind::FieldOffset => 0,
            RelocationKind::FieldSize => 1,
            RelocationKind::FieldExists => 2,
            RelocationKind::TypeSize => 3,
            RelocationKind::TypeExists => 4,
            RelocationKind::EnumValue => 5,
            RelocationKind::EnumExists => 6,
        }
    }
}

impl fmt::Display for RelocationKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            RelocationKind::FieldOffset => "field-offset",
            RelocationKind::FieldSize => "field-size",
            RelocationKind::FieldExists => "field-exists",
            RelocationKind::TypeSize => "type-size",
            RelocationKind::TypeExists => "type-exists",
            RelocationKind::EnumValue => "enum-value",
            RelocationKind::EnumExists => "enum-exists",
        };
        write!(f, "{label}")
    }
}

/// What to do when the target lacks what a relocation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy
{
    /// Fail the load
    Strict,
    /// Patch the zero/false sentinel and keep going
    BestEffort,
}

/// Per-kind policy defaults, overridable per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyTable
{
    policies: [Policy; 7],
}

impl Default for PolicyTable
{
    fn default() -> Self
    {
        let mut policies = [Policy::Strict; 7];
        for kind in RelocationKind::ALL {
            policies[kind.index()] = kind.default_policy();
        }
        Self { policies }
    }
}

impl PolicyTable
{
    #[must_use]
    pub fn get(&self, kind: RelocationKind) -> Policy
    {
        self.policies[kind.index()]
    }

    pub fn set(&mut self, kind: RelocationKind, policy: Policy)
    {
        self.policies[kind.index()] = policy;
    }

    /// Policy for one record: its own override, else the table entry.
    #[must_use]
    pub fn effective(&self, record: &RelocationRecord) -> Policy
    {
        record.policy.unwrap_or_else(|| self.get(record.kind))
    }
}

/// One step of a field access path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessStep
{
    /// Struct/union member or enumerator, by name
    Member(String),
    /// Array element (or pointer arithmetic when applied to a non-array root)
    Index(u32),
}

/// Ordered member/index steps from a root type down to the accessed field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AccessPath(SmallVec<[AccessStep; 4]>);

impl AccessPath
{
    #[must_use]
    pub fn new() -> Self
    {
        Self(SmallVec::new())
    }

    #[must_use]
    pub fn steps(&self) -> &[AccessStep]
    {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.0.is_empty()
    }

    pub fn push(&mut self, step: AccessStep)
    {
        self.0.push(step);
    }

    /// Name of the last member step, used for enumerator lookups.
    #[must_use]
    pub fn last_name(&self) -> Option<&str>
    {
        self.0.iter().rev().find_map(|step| match step {
            AccessStep::Member(name) => Some(name.as_str()),
            AccessStep::Index(_) => None,
        })
    }
}

impl FromStr for AccessPath
{
    type Err = LoaderError;

    /// Parse C-like accessors: `a.b[2].c`.
    fn from_str(text: &str) -> Result<Self, Self::Err>
    {
        let mut path = AccessPath::new();
        for segment in text.split('.').filter(|segment| !segment.is_empty()) {
            let (name, mut rest) = match segment.find('[') {
                Some(bracket) => (&segment[..bracket], &segment[bracket..]),
                None => (segment, ""),
            };
            if !name.is_empty() {
                path.push(AccessStep::Member(name.to_string()));
            }
            while let Some(open) = rest.strip_prefix('[') {
                let close = open
                    .find(']')
                    .ok_or_else(|| LoaderError::InvalidArgument(format!("unterminated index in `{text}`")))?;
                let index = open[..close]
                    .trim()
                    .parse::<u32>()
                    .map_err(|err| LoaderError::InvalidArgument(format!("bad index in `{text}`: {err}")))?;
                path.push(AccessStep::Index(index));
                rest = &open[close + 1..];
            }
            if !rest.is_empty() {
                return Err(LoaderError::InvalidArgument(format!("unexpected `{rest}` in `{text}`")));
            }
        }
        Ok(path)
    }
}

impl fmt::Display for AccessPath
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (position, step) in self.0.iter().enumerate() {
            match step {
                AccessStep::Member(name) if position == 0 => write!(f, "{name}")?,
                AccessStep::Member(name) => write!(f, ".{name}")?,
                AccessStep::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// One recorded dependency of an instruction on the target's type layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRecord
{
    /// Instruction index within the program
    pub insn: usize,
    pub kind: RelocationKind,
    /// Root type in the local (compile-time) graph
    pub local_type: TypeId,
    /// Member/index path below the root; for enum kinds the enumerator name
    pub path: AccessPath,
    /// Per-record override of the policy table
    pub policy: Option<Policy>,
}

impl RelocationRecord
{
    #[must_use]
    pub fn new(insn: usize, kind: RelocationKind, local_type: TypeId, path: AccessPath) -> Self
    {
        Self {
            insn,
            kind,
            local_type,
            path,
            policy: None,
        }
    }

    /// Convenience constructor parsing a C-like accessor (`a.b[1]`).
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the accessor is malformed.
    pub fn parse(insn: usize, kind: RelocationKind, local_type: TypeId, accessor: &str) -> LoaderResult<Self>
    {
        Ok(Self::new(insn, kind, local_type, accessor.parse()?))
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Policy) -> Self
    {
        self.policy = Some(policy);
        self
    }
}

/// What happened to one relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationOutcome
{
    pub insn: usize,
    pub kind: RelocationKind,
    pub local_type: TypeId,
    /// Matched target type, if any
    pub target_type: Option<TypeId>,
    pub resolution: Resolution,
}

impl RelocationOutcome
{
    /// `true` when a best-effort sentinel was patched instead of a real value.
    #[must_use]
    pub fn is_defaulted(&self) -> bool
    {
        matches!(self.resolution, Resolution::Defaulted { .. })
    }

    /// The value written into the instruction.
    #[must_use]
    pub fn value(&self) -> i64
    {
        self.resolution.value().as_imm()
    }
}

/// Resolve and patch every relocation of one program.
///
/// Records are handled in instruction order; two records aimed at the same
/// instruction are rejected. On the first fatal error the image may be
/// partially patched, so callers must discard it.
///
/// ## Errors
///
/// Any strict-policy failure (`NoMatch`, `AmbiguousMatch`, `Unresolvable`)
/// and any patching failure.
pub fn relocate_program(
    image: &mut ProgramImage,
    records: &[RelocationRecord],
    local: &TypeGraph,
    target: &TypeGraph,
    policies: &PolicyTable,
    verify_local_values: bool,
) -> LoaderResult<Vec<RelocationOutcome>>
{
    let mut ordered: Vec<&RelocationRecord> = records.iter().collect();
    ordered.sort_by_key(|record| record.insn);
    if let Some(pair) = ordered.windows(2).find(|pair| pair[0].insn == pair[1].insn) {
        return Err(LoaderError::InvalidInstruction {
            index: pair[0].insn,
            reason: format!("targeted by both a {} and a {} relocation", pair[0].kind, pair[1].kind),
        });
    }

    let mut matcher = TypeMatcher::new(local, target);
    let resolver = RelocationResolver::new(local, target, policies);
    let mut outcomes = Vec::with_capacity(ordered.len());

    for record in ordered {
        let matched = matcher.find(record.local_type, &record.path, record.kind);
        let target_type = matched.as_ref().ok().copied();
        let resolution = resolver.resolve(record, matched)?;
        let expected = if verify_local_values {
            Some(resolver.local_value(record)?)
        } else {
            None
        };
        let value = resolution.value().as_imm();
        patcher::patch(image, record.insn, value, expected)?;

        match &resolution {
            Resolution::Resolved(_) => debug!(
                insn = record.insn,
                kind = %record.kind,
                path = %record.path,
                value,
                "relocation resolved"
            ),
            Resolution::Defaulted { reason, .. } => warn!(
                insn = record.insn,
                kind = %record.kind,
                path = %record.path,
                "relocation defaulted to {value}: {reason}"
            ),
        }

        outcomes.push(RelocationOutcome {
            insn: record.insn,
            kind: record.kind,
            local_type: record.local_type,
            target_type,
            resolution,
        });
    }

    Ok(outcomes)
}
