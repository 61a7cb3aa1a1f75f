//! # Error Types
//!
//! General error handling for the loader.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::btf::TypeId;
use crate::program::ProgramImage;
use crate::reloc::RelocationKind;

/// Main error type for loader operations
///
/// Every variant that can abort a program load carries enough context
/// (instruction index, type id, map or helper name) to diagnose the failure
/// without re-running the load.
///
/// ## Error Categories
///
/// 1. **Input errors**: Parse, InvalidInstruction, InvalidArgument
/// 2. **Type resolution errors**: NoMatch, AmbiguousMatch
/// 3. **Relocation errors**: Unresolvable, ValueOverflow, UnexpectedValue
/// 4. **Map errors**: CyclicMapDependency, Map
/// 5. **Binding errors**: UnboundHelper, UnknownMap, AmbiguousSignature
/// 6. **Lifecycle errors**: InvalidState, ProgramFailed
/// 7. **I/O errors**: Io
#[derive(Error, Debug)]
pub enum LoaderError
{
    /// Malformed type graph, object file or metadata section
    ///
    /// Parsing never produces a partial result: a graph or object either
    /// loads completely or not at all.
    #[error("Parse error in {context}: {reason}")]
    Parse
    {
        /// What was being parsed (e.g. "BTF header", ".BTF.ext")
        context: String,
        /// What was wrong with it
        reason: String,
    },

    /// No target type has the same kind and essential name as the local type
    #[error("No target type matches local type {local_type} ({name}) for relocation at insn #{insn}")]
    NoMatch
    {
        /// Instruction index of the relocation
        insn: usize,
        /// Local type id referenced by the relocation
        local_type: TypeId,
        /// Canonical description of the local type
        name: String,
    },

    /// Several target types match and none of them is a better fit
    #[error("Ambiguous target match for local type {local_type} ({name}) at insn #{insn}: candidates {candidates:?}")]
    AmbiguousMatch
    {
        /// Instruction index of the relocation
        insn: usize,
        /// Local type id referenced by the relocation
        local_type: TypeId,
        /// Canonical description of the local type
        name: String,
        /// Target type ids that could not be told apart
        candidates: Vec<TypeId>,
    },

    /// A relocation could not be computed against the target graph
    ///
    /// Only fatal under strict policy. Under best-effort policy the same
    /// condition is recorded as a defaulted outcome instead.
    #[error("Unresolvable {kind} relocation at insn #{insn}: {reason}")]
    Unresolvable
    {
        /// Instruction index of the relocation
        insn: usize,
        /// Relocation kind
        kind: RelocationKind,
        /// Which step of the access path failed and why
        reason: String,
    },

    /// The resolved value does not fit the operand being patched
    #[error("Value {value} does not fit the operand of insn #{insn}")]
    ValueOverflow
    {
        /// Instruction index
        insn: usize,
        /// Value that was going to be written
        value: i64,
    },

    /// The instruction does not carry the compile-time value the relocation expects
    #[error("Insn #{insn} holds {found}, expected compile-time value {expected}")]
    UnexpectedValue
    {
        /// Instruction index
        insn: usize,
        /// Value computed against the local graph
        expected: i64,
        /// Value found in the instruction
        found: i64,
    },

    /// The referenced instruction cannot be patched the requested way
    #[error("Invalid instruction #{index}: {reason}")]
    InvalidInstruction
    {
        /// Instruction index
        index: usize,
        /// Why it can't be patched
        reason: String,
    },

    /// The inner-map-of relation contains a cycle
    #[error("Cyclic map dependency: {}", cycle.join(" -> "))]
    CyclicMapDependency
    {
        /// Map names along the cycle, first name repeated at the end
        cycle: Vec<String>,
    },

    /// Map validation or creation failed
    #[error(transparent)]
    Map(#[from] MapError),

    /// A call references a helper that is not available and not guarded
    #[error("Unbound helper `{name}` referenced at insn #{insn}: {reason}")]
    UnboundHelper
    {
        /// Helper symbol name
        name: String,
        /// First instruction referencing it
        insn: usize,
        /// Why it could not be bound
        reason: String,
    },

    /// A map load names a map that is not part of the load's map table
    #[error("Unknown map `{name}` referenced at insn #{insn}")]
    UnknownMap
    {
        /// Map name
        name: String,
        /// Instruction index of the map load
        insn: usize,
    },

    /// The signature recorded by the compiler differs from the fixed helper table
    #[error("Helper `{name}` declared as {recorded} but the helper table defines {expected}")]
    AmbiguousSignature
    {
        /// Helper symbol name
        name: String,
        /// Signature recorded in the compiled object
        recorded: String,
        /// Signature from the helper table
        expected: String,
    },

    /// A program image was driven through an illegal state transition
    #[error("Program `{program}` cannot move from {from} to {to}")]
    InvalidState
    {
        /// Program name
        program: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Invalid argument passed to a loader function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A single program of a load failed; wraps the underlying cause
    #[error("Loading program `{program}` failed during {stage}: {source}")]
    ProgramFailed
    {
        /// Program name
        program: String,
        /// Pipeline stage that failed
        stage: &'static str,
        /// The program's private image, left in the `Failed` state
        image: Box<ProgramImage>,
        /// Underlying error
        #[source]
        source: Box<LoaderError>,
    },

    /// I/O error (reading object files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError
{
    pub(crate) fn parse(context: impl Into<String>, reason: impl Into<String>) -> Self
    {
        Self::Parse {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Image of the program whose load failed, in its `Failed` state.
    ///
    /// It may be partially patched and must not be executed.
    #[must_use]
    pub fn failed_image(&self) -> Option<&ProgramImage>
    {
        match self {
            Self::ProgramFailed { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Strip `ProgramFailed` wrappers and return the underlying cause.
    #[must_use]
    pub fn root_cause(&self) -> &LoaderError
    {
        match self {
            Self::ProgramFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Map validation and creation errors
///
/// `Clone` so that every loader waiting on the same in-flight creation can
/// observe the identical failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError
{
    /// The definition is inconsistent (sizes, inner map, kind)
    #[error("Invalid map definition `{name}`: {reason}")]
    InvalidDefinition
    {
        /// Map name
        name: String,
        /// What is wrong
        reason: String,
    },

    /// An outer map names an inner map that is not part of the load
    #[error("Map `{name}` references unknown inner map `{inner}`")]
    UnknownInner
    {
        /// Outer map name
        name: String,
        /// Missing inner map name
        inner: String,
    },

    /// Two definitions share a name but differ in content
    #[error("Map `{name}` is defined twice with different parameters")]
    ConflictingDefinition
    {
        /// Map name
        name: String,
    },

    /// The backend refused to create the map
    #[error("Creating map `{name}` failed: {reason}")]
    CreateFailed
    {
        /// Map name
        name: String,
        /// Backend-specific reason (errno text, resource exhaustion, ...)
        reason: String,
    },

    /// The backend ran out of map slots or memory
    #[error("Creating map `{name}` failed: resources exhausted")]
    ResourceExhausted
    {
        /// Map name
        name: String,
    },
}

impl MapError
{
    /// Name of the map definition the error refers to.
    #[must_use]
    pub fn map_name(&self) -> &str
    {
        match self {
            Self::InvalidDefinition { name, .. }
            | Self::UnknownInner { name, .. }
            | Self::ConflictingDefinition { name }
            | Self::CreateFailed { name, .. }
            | Self::ResourceExhausted { name } => name,
        }
    }
}

/// Convenience type alias for `Result<T, LoaderError>`
///
/// ```rust
/// use ferrobpf_core::error::LoaderResult;
/// fn foo() -> LoaderResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
