//! # Helpers
//!
//! Helpers are the fixed, numbered entry points a program may call. Programs
//! refer to them by symbol; at load time every call is rewritten to carry the
//! helper's numeric id.
//!
//! The [`HelperTable`] is built once per process and only read afterwards.
//! Whether a helper may be missing on the target is decided once per load
//! and recorded as a [`HelperPresence`].

pub mod binder;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use smallvec::SmallVec;

pub use binder::{bind, BindReport, HelperBinding, POISON_CALL_ID};

/// Shape of one helper argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind
{
    /// Any value, pointer or scalar
    Anything,
    Scalar,
    /// Pointer to a map
    Map,
    /// Pointer to a key of the map argument
    MapKey,
    /// Pointer to a value of the map argument
    MapValue,
    /// Pointer to a memory region
    Memory,
    /// Size of the preceding memory argument
    Size,
    /// Program context pointer
    Context,
    /// BPF function used as a callback
    Callback,
}

impl ArgKind
{
    const fn is_pointer(self) -> Option<bool>
    {
        match self {
            ArgKind::Anything => None,
            ArgKind::Scalar | ArgKind::Size => Some(false),
            ArgKind::Map
            | ArgKind::MapKey
            | ArgKind::MapValue
            | ArgKind::Memory
            | ArgKind::Context
            | ArgKind::Callback => Some(true),
        }
    }

    fn compatible(self, other: ArgKind) -> bool
    {
        match (self.is_pointer(), other.is_pointer()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    const fn label(self) -> &'static str
    {
        match self {
            ArgKind::Anything => "any",
            ArgKind::Scalar => "scalar",
            ArgKind::Map => "map",
            ArgKind::MapKey => "key",
            ArgKind::MapValue => "value",
            ArgKind::Memory => "mem",
            ArgKind::Size => "size",
            ArgKind::Context => "ctx",
            ArgKind::Callback => "callback",
        }
    }
}

/// Shape of a helper's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind
{
    Integer,
    Void,
    /// Pointer into a map value, or null
    MapValueOrNull,
    Pointer,
}

impl ReturnKind
{
    fn compatible(self, other: ReturnKind) -> bool
    {
        let pointer = |kind: ReturnKind| matches!(kind, ReturnKind::MapValueOrNull | ReturnKind::Pointer);
        match (self, other) {
            (ReturnKind::Void, ReturnKind::Void) => true,
            (ReturnKind::Void, _) | (_, ReturnKind::Void) => false,
            (a, b) => pointer(a) == pointer(b),
        }
    }

    const fn label(self) -> &'static str
    {
        match self {
            ReturnKind::Integer => "int",
            ReturnKind::Void => "void",
            ReturnKind::MapValueOrNull => "map_value_or_null",
            ReturnKind::Pointer => "ptr",
        }
    }
}

/// Arity and argument/return shapes of a helper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelperSignature
{
    pub ret: ReturnKind,
    pub args: SmallVec<[ArgKind; 5]>,
    /// Accepts extra trailing arguments
    pub variadic: bool,
}

impl HelperSignature
{
    #[must_use]
    pub fn new(ret: ReturnKind, args: &[ArgKind]) -> Self
    {
        Self {
            ret,
            args: SmallVec::from_slice(args),
            variadic: false,
        }
    }

    #[must_use]
    pub fn variadic(mut self) -> Self
    {
        self.variadic = true;
        self
    }

    /// Whether a signature recorded by the compiler agrees with this one.
    ///
    /// Debug info only distinguishes pointers from scalars, so arguments are
    /// compared at that granularity. A variadic signature accepts extra
    /// recorded arguments.
    #[must_use]
    pub fn accepts(&self, recorded: &HelperSignature) -> bool
    {
        let arity_ok = match (self.variadic, recorded.variadic) {
            (false, false) => recorded.args.len() == self.args.len(),
            (true, _) => recorded.args.len() >= self.args.len(),
            (false, true) => recorded.args.len() <= self.args.len(),
        };
        arity_ok
            && self.ret.compatible(recorded.ret)
            && self
                .args
                .iter()
                .zip(recorded.args.iter())
                .all(|(expected, found)| expected.compatible(*found))
    }
}

impl fmt::Display for HelperSignature
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "(")?;
        for (position, arg) in self.args.iter().enumerate() {
            if position > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg.label())?;
        }
        if self.variadic {
            write!(f, "{}...", if self.args.is_empty() { "" } else { ", " })?;
        }
        write!(f, ") -> {}", self.ret.label())
    }
}

/// One entry of the helper table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec
{
    pub name: &'static str,
    pub id: u32,
    pub signature: HelperSignature,
}

/// Immutable name → (id, signature) table.
#[derive(Debug)]
pub struct HelperTable
{
    by_name: HashMap<&'static str, HelperSpec>,
}

static HELPERS: Lazy<HelperTable> = Lazy::new(|| {
    use ArgKind::{Anything, Callback, Context, Map, MapKey, MapValue, Memory, Scalar, Size};
    use ReturnKind::{Integer, MapValueOrNull, Pointer};

    HelperTable::from_specs([
        ("bpf_map_lookup_elem", 1, HelperSignature::new(MapValueOrNull, &[Map, MapKey])),
        ("bpf_map_update_elem", 2, HelperSignature::new(Integer, &[Map, MapKey, MapValue, Scalar])),
        ("bpf_map_delete_elem", 3, HelperSignature::new(Integer, &[Map, MapKey])),
        ("bpf_ktime_get_ns", 5, HelperSignature::new(Integer, &[])),
        ("bpf_trace_printk", 6, HelperSignature::new(Integer, &[Memory, Size]).variadic()),
        ("bpf_get_smp_processor_id", 8, HelperSignature::new(Integer, &[])),
        ("bpf_tail_call", 12, HelperSignature::new(Integer, &[Context, Map, Scalar])),
        ("bpf_get_current_pid_tgid", 14, HelperSignature::new(Integer, &[])),
        (
            "bpf_perf_event_output",
            25,
            HelperSignature::new(Integer, &[Context, Map, Scalar, Memory, Size]),
        ),
        ("bpf_get_current_task", 35, HelperSignature::new(Pointer, &[])),
        ("bpf_probe_read_kernel", 113, HelperSignature::new(Integer, &[Memory, Size, Anything])),
        (
            "bpf_for_each_map_elem",
            164,
            HelperSignature::new(Integer, &[Map, Callback, Anything, Scalar]),
        ),
    ])
});

impl HelperTable
{
    /// The process-wide table.
    #[must_use]
    pub fn global() -> &'static HelperTable
    {
        &HELPERS
    }

    fn from_specs<const N: usize>(specs: [(&'static str, u32, HelperSignature); N]) -> Self
    {
        let by_name = specs
            .into_iter()
            .map(|(name, id, signature)| (name, HelperSpec { name, id, signature }))
            .collect();
        Self { by_name }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HelperSpec>
    {
        self.by_name.get(name)
    }

    /// Numeric call id of `name`.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<u32>
    {
        self.get(name).map(|spec| spec.id)
    }

    /// Every helper, ordered by id.
    #[must_use]
    pub fn specs(&self) -> Vec<&HelperSpec>
    {
        let mut specs: Vec<&HelperSpec> = self.by_name.values().collect();
        specs.sort_by_key(|spec| spec.id);
        specs
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_name.is_empty()
    }
}

/// How a program declared a helper symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage
{
    /// Assumed present; absence fails the load
    Strong,
    /// May be absent; must be guarded by an existence check
    Weak,
}

/// A helper symbol as declared by a compiled program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredHelper
{
    pub name: String,
    pub linkage: Linkage,
    /// Signature recorded in the object's debug info, if any
    pub recorded: Option<HelperSignature>,
}

impl DeclaredHelper
{
    #[must_use]
    pub fn strong(name: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            linkage: Linkage::Strong,
            recorded: None,
        }
    }

    #[must_use]
    pub fn weak(name: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            linkage: Linkage::Weak,
            recorded: None,
        }
    }

    #[must_use]
    pub fn with_signature(mut self, signature: HelperSignature) -> Self
    {
        self.recorded = Some(signature);
        self
    }
}

/// Whether a declared helper is usable on the target, decided at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperPresence
{
    /// Strongly declared; must be present
    Required,
    /// Weakly declared and present
    OptionalPresent,
    /// Weakly declared and absent; existence probes resolve to false
    OptionalAbsent,
}

/// Helper ids the target environment implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperAvailability
{
    ids: BTreeSet<u32>,
}

impl Default for HelperAvailability
{
    fn default() -> Self
    {
        Self::all()
    }
}

impl HelperAvailability
{
    /// Every helper in the table.
    #[must_use]
    pub fn all() -> Self
    {
        Self {
            ids: HelperTable::global().specs().iter().map(|spec| spec.id).collect(),
        }
    }

    /// Exactly the given ids.
    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self
    {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Remove a helper by name.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self
    {
        if let Some(id) = HelperTable::global().id_of(name) {
            self.ids.remove(&id);
        }
        self
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool
    {
        self.ids.contains(&id)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_table_ids_match_header()
    {
        let table = HelperTable::global();
        assert_eq!(table.id_of("bpf_map_lookup_elem"), Some(1));
        assert_eq!(table.id_of("bpf_map_update_elem"), Some(2));
        assert_eq!(table.id_of("bpf_trace_printk"), Some(6));
        assert_eq!(table.id_of("bpf_get_smp_processor_id"), Some(8));
        assert_eq!(table.id_of("bpf_tail_call"), Some(12));
        assert_eq!(table.id_of("bpf_perf_event_output"), Some(25));
        assert_eq!(table.id_of("bpf_get_current_task"), Some(35));
        assert_eq!(table.id_of("bpf_probe_read_kernel"), Some(113));
        assert_eq!(table.id_of("bpf_for_each_map_elem"), Some(164));
        assert_eq!(table.id_of("bpf_nonexistent"), None);
        assert!(table.specs().windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn test_signature_compatibility()
    {
        let lookup = &HelperTable::global().get("bpf_map_lookup_elem").unwrap().signature;
        let recorded = HelperSignature::new(ReturnKind::Pointer, &[ArgKind::Memory, ArgKind::Memory]);
        assert!(lookup.accepts(&recorded));

        let wrong_arity = HelperSignature::new(ReturnKind::Pointer, &[ArgKind::Memory]);
        assert!(!lookup.accepts(&wrong_arity));

        let scalar_key = HelperSignature::new(ReturnKind::Pointer, &[ArgKind::Memory, ArgKind::Scalar]);
        assert!(!lookup.accepts(&scalar_key));

        let printk = &HelperTable::global().get("bpf_trace_printk").unwrap().signature;
        let with_args = HelperSignature::new(
            ReturnKind::Integer,
            &[ArgKind::Memory, ArgKind::Scalar, ArgKind::Scalar, ArgKind::Scalar],
        );
        assert!(printk.accepts(&with_args));
        assert_eq!(printk.to_string(), "(mem, size, ...) -> int");
    }

    #[test]
    fn test_availability()
    {
        let available = HelperAvailability::all().without("bpf_get_current_task");
        assert!(available.contains(1));
        assert!(!available.contains(35));
        assert!(!HelperAvailability::from_ids([1, 2]).contains(6));
    }
}
