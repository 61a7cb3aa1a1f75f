//! Common module for library exports

pub use crate::btf::{Member, TypeGraph, TypeGraphBuilder, TypeId, TypeKind, TypeNode};
pub use crate::error::{LoaderError, LoaderResult, MapError};
pub use crate::helpers::{DeclaredHelper, HelperAvailability, HelperPresence, HelperTable, POISON_CALL_ID};
pub use crate::insn::Instruction;
#[cfg(target_os = "linux")]
pub use crate::platform::linux::SyscallBackend;
pub use crate::loader::{LoadedObject, Loader, ProgramReport};
pub use crate::maps::{InMemoryBackend, MapBackend, MapDefinition, MapHandle, MapKind, MapManager, MapTable};
pub use crate::object_file::CompiledObject;
pub use crate::options::LoaderOptions;
pub use crate::program::{ProgramImage, ProgramState};
pub use crate::reloc::{Policy, PolicyTable, RelocationKind, RelocationOutcome, RelocationRecord, Resolution};
