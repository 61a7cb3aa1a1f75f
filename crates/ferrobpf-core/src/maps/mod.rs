//! # Maps
//!
//! Map definitions, their binary record layout, and the lifecycle manager
//! that turns definitions into live handles.
//!
//! ## Record layout
//!
//! Definitions are stored in the object's `maps` section as consecutive
//! fixed-size records of native-endian `u32` fields:
//!
//! ```text
//! offset  field
//!      0  type
//!      4  key_size
//!      8  value_size
//!     12  max_entries
//!     16  map_flags
//!     20  inner_map_idx   (24-byte records only, u32::MAX = none)
//! ```
//!
//! The 20-byte form is the legacy `bpf_map_def`. The 24-byte form adds the
//! index of the inner map's record, used by map-of-maps kinds.

pub mod backend;
pub mod manager;

use std::fmt;

use object::{Endian, Endianness};

pub use backend::{InMemoryBackend, MapBackend};
pub use manager::{MapManager, MapTable};

use crate::bytes::ByteReader;
use crate::error::{LoaderError, LoaderResult, MapError};

/// Size of a legacy `bpf_map_def` record.
pub const LEGACY_RECORD_SIZE: usize = 20;
/// Size of a record carrying an inner map index.
pub const NESTED_RECORD_SIZE: usize = 24;
/// `inner_map_idx` value meaning "no inner map".
pub const NO_INNER_MAP: u32 = u32::MAX;

/// Do not pre-allocate hash table entries.
pub const BPF_F_NO_PREALLOC: u32 = 1 << 0;

/// Kind of map, as encoded in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKind
{
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    ArrayOfMaps,
    HashOfMaps,
    /// Any kind this loader has no special rules for
    Other(u32),
}

impl MapKind
{
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self
    {
        match raw {
            1 => MapKind::Hash,
            2 => MapKind::Array,
            3 => MapKind::ProgArray,
            4 => MapKind::PerfEventArray,
            12 => MapKind::ArrayOfMaps,
            13 => MapKind::HashOfMaps,
            other => MapKind::Other(other),
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32
    {
        match self {
            MapKind::Hash => 1,
            MapKind::Array => 2,
            MapKind::ProgArray => 3,
            MapKind::PerfEventArray => 4,
            MapKind::ArrayOfMaps => 12,
            MapKind::HashOfMaps => 13,
            MapKind::Other(raw) => raw,
        }
    }

    /// Values of these maps are other maps.
    #[must_use]
    pub const fn is_map_of_maps(self) -> bool
    {
        matches!(self, MapKind::ArrayOfMaps | MapKind::HashOfMaps)
    }

    /// Indexed by a `u32` position rather than an arbitrary key.
    #[must_use]
    pub const fn is_array_like(self) -> bool
    {
        matches!(
            self,
            MapKind::Array | MapKind::ProgArray | MapKind::PerfEventArray | MapKind::ArrayOfMaps
        )
    }

    /// Values are file descriptors (programs, perf events, maps).
    const fn holds_fds(self) -> bool
    {
        matches!(
            self,
            MapKind::ProgArray | MapKind::PerfEventArray | MapKind::ArrayOfMaps | MapKind::HashOfMaps
        )
    }
}

impl fmt::Display for MapKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            MapKind::Hash => write!(f, "hash"),
            MapKind::Array => write!(f, "array"),
            MapKind::ProgArray => write!(f, "prog-array"),
            MapKind::PerfEventArray => write!(f, "perf-event-array"),
            MapKind::ArrayOfMaps => write!(f, "array-of-maps"),
            MapKind::HashOfMaps => write!(f, "hash-of-maps"),
            MapKind::Other(raw) => write!(f, "map-type-{raw}"),
        }
    }
}

/// Runtime identity of a created map.
///
/// For the syscall backend this is the map's file descriptor; other backends
/// issue their own ids. Handles are only ever issued by a [`MapManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapHandle(u32);

impl MapHandle
{
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self
    {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

impl fmt::Display for MapHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "map#{}", self.0)
    }
}

/// A declared map.
///
/// `inner` names the inner map definition for map-of-maps kinds. Flags are
/// carried verbatim to creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapDefinition
{
    pub name: String,
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub inner: Option<String>,
}

impl MapDefinition
{
    #[must_use]
    pub fn new(name: impl Into<String>, kind: MapKind, key_size: u32, value_size: u32, max_entries: u32) -> Self
    {
        Self {
            name: name.into(),
            kind,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            inner: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self
    {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_inner(mut self, inner: impl Into<String>) -> Self
    {
        self.inner = Some(inner.into());
        self
    }

    /// Check the definition and fill in defaults.
    ///
    /// Perf-event arrays declared with `max_entries == 0` get one slot per
    /// possible CPU.
    ///
    /// ## Errors
    ///
    /// `MapError::InvalidDefinition` naming the offending field.
    pub fn validate(&self, possible_cpus: u32) -> Result<MapDefinition, MapError>
    {
        let invalid = |reason: String| MapError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("map has no name".to_string()));
        }
        match (self.kind.is_map_of_maps(), &self.inner) {
            (true, None) => return Err(invalid(format!("{} requires an inner map", self.kind))),
            (false, Some(inner)) => {
                return Err(invalid(format!("{} cannot have inner map `{inner}`", self.kind)));
            }
            _ => {}
        }
        if self.kind.is_array_like() && self.key_size != 4 {
            return Err(invalid(format!("{} needs 4-byte keys, got {}", self.kind, self.key_size)));
        }
        if self.kind.holds_fds() && self.value_size != 4 {
            return Err(invalid(format!("{} needs 4-byte values, got {}", self.kind, self.value_size)));
        }
        if self.kind == MapKind::Hash && (self.key_size == 0 || self.value_size == 0) {
            return Err(invalid("hash maps need non-zero key and value sizes".to_string()));
        }

        let mut normalised = self.clone();
        if self.max_entries == 0 {
            if self.kind == MapKind::PerfEventArray {
                normalised.max_entries = possible_cpus;
            } else {
                return Err(invalid("max_entries must be non-zero".to_string()));
            }
        }
        Ok(normalised)
    }
}

impl fmt::Display for MapDefinition
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{} ({}, key {}, value {}, {} entries, flags 0x{:x}",
            self.name, self.kind, self.key_size, self.value_size, self.max_entries, self.flags
        )?;
        if let Some(inner) = &self.inner {
            write!(f, ", inner {inner}")?;
        }
        write!(f, ")")
    }
}

/// One raw record from the `maps` section, before names are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRecord
{
    pub kind: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    /// Record index of the inner map, if any
    pub inner_index: Option<u32>,
}

impl MapRecord
{
    /// Decode one record. `bytes` must be exactly 20 or 24 bytes long.
    ///
    /// ## Errors
    ///
    /// `Parse` on any other length.
    pub fn decode(bytes: &[u8], endian: Endianness) -> LoaderResult<Self>
    {
        if bytes.len() != LEGACY_RECORD_SIZE && bytes.len() != NESTED_RECORD_SIZE {
            return Err(LoaderError::parse(
                "map definition",
                format!(
                    "record is {} bytes, expected {LEGACY_RECORD_SIZE} or {NESTED_RECORD_SIZE}",
                    bytes.len()
                ),
            ));
        }
        let mut reader = ByteReader::new(bytes, endian, "map definition");
        let mut record = Self {
            kind: reader.u32()?,
            key_size: reader.u32()?,
            value_size: reader.u32()?,
            max_entries: reader.u32()?,
            flags: reader.u32()?,
            inner_index: None,
        };
        if !reader.is_empty() {
            record.inner_index = Some(reader.u32()?).filter(|index| *index != NO_INNER_MAP);
        }
        Ok(record)
    }

    /// Encode as a 24-byte record.
    #[must_use]
    pub fn encode(&self, endian: Endianness) -> Vec<u8>
    {
        let fields = [
            self.kind,
            self.key_size,
            self.value_size,
            self.max_entries,
            self.flags,
            self.inner_index.unwrap_or(NO_INNER_MAP),
        ];
        fields.iter().flat_map(|field| endian.write_u32_bytes(*field)).collect()
    }

    /// Attach a name and a resolved inner map name.
    #[must_use]
    pub fn into_definition(self, name: impl Into<String>, inner: Option<String>) -> MapDefinition
    {
        MapDefinition {
            name: name.into(),
            kind: MapKind::from_raw(self.kind),
            key_size: self.key_size,
            value_size: self.value_size,
            max_entries: self.max_entries,
            flags: self.flags,
            inner,
        }
    }
}
