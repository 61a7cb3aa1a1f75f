//! # ferrobpf-core
//!
//! Load-time preparation of compiled BPF programs.
//!
//! This crate takes a compiled object (instructions, its own type graph,
//! relocation records, map definitions and helper references) and prepares
//! it for one concrete target environment:
//! - Relocations are matched against the target type graph and the affected
//!   instructions are patched in place
//! - Maps are created once per unique definition, inner maps first
//! - Helper calls are bound to fixed numeric ids and existence probes to
//!   `0`/`1`
//!
//! ## Modules
//!
//! | Module          | Role                                             |
//! |-----------------|--------------------------------------------------|
//! | [`btf`]         | type graph model, BTF and `.BTF.ext` parsing     |
//! | [`reloc`]       | type matcher, relocation resolver, patcher       |
//! | [`maps`]        | map definitions and the map lifecycle manager    |
//! | [`helpers`]     | helper table and binder                          |
//! | [`loader`]      | orchestration over one or more objects           |
//! | [`object_file`] | reading compiled ELF objects                     |
//!
//! ## Why unsafe code is needed
//!
//! Creating kernel maps goes through the raw `bpf(2)` system call
//! ([`platform::linux`]). Everything above the backend is safe code.

#![allow(unsafe_code)] // Required for the bpf(2) syscall backend

pub mod btf;
mod bytes;
pub mod error;
pub mod helpers;
pub mod insn;
pub mod loader;
pub mod maps;
pub mod object_file;
pub mod options;
pub mod platform;
pub mod prelude;
pub mod program;
pub mod reloc;

// Re-export commonly used types
pub use btf::{TypeGraph, TypeId};
pub use error::{LoaderError, LoaderResult, MapError};
pub use loader::{LoadedObject, Loader};
pub use object_file::CompiledObject;
pub use options::LoaderOptions;
pub use program::{ProgramImage, ProgramState};
