//! # Type Graph
//!
//! In-memory model of a BTF type universe.
//!
//! A [`TypeGraph`] owns an arena of [`TypeNode`]s addressed by [`TypeId`].
//! Id `0` is always `void`. Nodes refer to each other only through ids, so a
//! struct that points to itself is just an index cycle; every traversal in
//! this crate carries a visited set keyed by id instead of relying on
//! recursion depth.
//!
//! Graphs are immutable once built. They come from two places:
//!
//! - [`TypeGraph::load`] parses raw BTF (the `.BTF` ELF section, or
//!   `/sys/kernel/btf/vmlinux` on a running kernel).
//! - [`TypeGraphBuilder`] assembles one programmatically.
//!
//! ## Example
//!
//! ```rust
//! use ferrobpf_core::btf::{Member, TypeGraphBuilder};
//!
//! let mut builder = TypeGraphBuilder::new();
//! let int = builder.int("int", 4, true);
//! let node = builder.reserve();
//! let next = builder.ptr(node);
//! builder.define_struct(node, Some("node"), 16, vec![Member::new("value", int, 0), Member::new("next", next, 64)]);
//! let graph = builder.build()?;
//!
//! assert_eq!(graph.describe(node), "struct node");
//! assert_eq!(graph.size_of(node)?, 16);
//! # Ok::<(), ferrobpf_core::error::LoaderError>(())
//! ```

pub mod ext;
mod parse;

use std::collections::{HashMap, HashSet};
use std::fmt;

use smallvec::SmallVec;

pub use ext::{access_path, parse_core_relocations, SectionRelocation};

use crate::error::{LoaderError, LoaderResult};

/// Index of a type within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId
{
    /// The implicit `void` type present in every graph.
    pub const VOID: Self = TypeId(0);

    /// Create an id from its raw index.
    #[must_use]
    pub const fn new(raw: u32) -> Self
    {
        TypeId(raw)
    }

    /// Raw index into the graph.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }

    fn index(self) -> usize
    {
        self.0 as usize
    }
}

impl fmt::Display for TypeId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "[{}]", self.0)
    }
}

/// Integer encoding bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntEncoding
{
    Unsigned,
    Signed,
    Char,
    Bool,
}

/// Member of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member
{
    /// `None` for anonymous members (embedded unions/structs)
    pub name: Option<String>,
    pub ty: TypeId,
    /// Offset from the start of the containing type, in bits
    pub bit_offset: u32,
    /// Width for bit-field members
    pub bitfield_size: Option<u32>,
}

impl Member
{
    /// Named, byte-addressed member.
    #[must_use]
    pub fn new(name: &str, ty: TypeId, bit_offset: u32) -> Self
    {
        Self {
            name: Some(name.to_string()),
            ty,
            bit_offset,
            bitfield_size: None,
        }
    }

    /// Anonymous member (typically an embedded union).
    #[must_use]
    pub fn anonymous(ty: TypeId, bit_offset: u32) -> Self
    {
        Self {
            name: None,
            ty,
            bit_offset,
            bitfield_size: None,
        }
    }

    /// Bit-field member.
    #[must_use]
    pub fn bitfield(name: &str, ty: TypeId, bit_offset: u32, bits: u32) -> Self
    {
        Self {
            name: Some(name.to_string()),
            ty,
            bit_offset,
            bitfield_size: Some(bits),
        }
    }
}

/// One named constant of an enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator
{
    pub name: String,
    pub value: i64,
}

/// Function prototype parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param
{
    pub name: Option<String>,
    pub ty: TypeId,
}

/// Variable placed in a data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionVar
{
    pub ty: TypeId,
    pub offset: u32,
    pub size: u32,
}

/// Kind-specific payload of a type node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind
{
    Void,
    Int
    {
        size: u32,
        bits: u32,
        offset: u32,
        encoding: IntEncoding,
    },
    Ptr
    {
        target: TypeId
    },
    Array
    {
        element: TypeId,
        index: TypeId,
        len: u32,
    },
    Struct
    {
        size: u32,
        members: Vec<Member>,
    },
    Union
    {
        size: u32,
        members: Vec<Member>,
    },
    /// Covers both 32-bit and 64-bit BTF enums
    Enum
    {
        size: u32,
        signed: bool,
        values: Vec<Enumerator>,
    },
    Fwd
    {
        union: bool
    },
    Typedef
    {
        target: TypeId
    },
    Volatile
    {
        target: TypeId
    },
    Const
    {
        target: TypeId
    },
    Restrict
    {
        target: TypeId
    },
    TypeTag
    {
        target: TypeId
    },
    Func
    {
        proto: TypeId,
        linkage: u32,
    },
    FuncProto
    {
        ret: TypeId,
        params: Vec<Param>,
    },
    Var
    {
        ty: TypeId,
        linkage: u32,
    },
    Datasec
    {
        size: u32,
        vars: Vec<SectionVar>,
    },
    Float
    {
        size: u32
    },
    DeclTag
    {
        target: TypeId,
        component: i32,
    },
}

impl TypeKind
{
    /// Short lowercase label used in diagnostics.
    #[must_use]
    pub fn label(&self) -> &'static str
    {
        match self {
            TypeKind::Void => "void",
            TypeKind::Int { .. } => "int",
            TypeKind::Ptr { .. } => "ptr",
            TypeKind::Array { .. } => "array",
            TypeKind::Struct { .. } => "struct",
            TypeKind::Union { .. } => "union",
            TypeKind::Enum { .. } => "enum",
            TypeKind::Fwd { .. } => "fwd",
            TypeKind::Typedef { .. } => "typedef",
            TypeKind::Volatile { .. } => "volatile",
            TypeKind::Const { .. } => "const",
            TypeKind::Restrict { .. } => "restrict",
            TypeKind::TypeTag { .. } => "type_tag",
            TypeKind::Func { .. } => "func",
            TypeKind::FuncProto { .. } => "func_proto",
            TypeKind::Var { .. } => "var",
            TypeKind::Datasec { .. } => "datasec",
            TypeKind::Float { .. } => "float",
            TypeKind::DeclTag { .. } => "decl_tag",
        }
    }

    /// Ids this node refers to.
    fn references(&self) -> SmallVec<[TypeId; 4]>
    {
        let mut refs = SmallVec::new();
        match self {
            TypeKind::Ptr { target }
            | TypeKind::Typedef { target }
            | TypeKind::Volatile { target }
            | TypeKind::Const { target }
            | TypeKind::Restrict { target }
            | TypeKind::TypeTag { target }
            | TypeKind::DeclTag { target, .. } => refs.push(*target),
            TypeKind::Array { element, index, .. } => {
                refs.push(*element);
                refs.push(*index);
            }
            TypeKind::Struct { members, .. } | TypeKind::Union { members, .. } => {
                refs.extend(members.iter().map(|member| member.ty));
            }
            TypeKind::Func { proto, .. } => refs.push(*proto),
            TypeKind::FuncProto { ret, params } => {
                refs.push(*ret);
                refs.extend(params.iter().map(|param| param.ty));
            }
            TypeKind::Var { ty, .. } => refs.push(*ty),
            TypeKind::Datasec { vars, .. } => refs.extend(vars.iter().map(|var| var.ty)),
            TypeKind::Void | TypeKind::Int { .. } | TypeKind::Enum { .. } | TypeKind::Fwd { .. } | TypeKind::Float { .. } => {}
        }
        refs
    }
}

/// A single type: optional name plus kind payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNode
{
    pub name: Option<String>,
    pub kind: TypeKind,
}

impl TypeNode
{
    #[must_use]
    pub fn new(name: Option<&str>, kind: TypeKind) -> Self
    {
        Self {
            name: name.filter(|name| !name.is_empty()).map(str::to_string),
            kind,
        }
    }

    /// Members of a struct or union, `None` for every other kind.
    #[must_use]
    pub fn members(&self) -> Option<&[Member]>
    {
        match &self.kind {
            TypeKind::Struct { members, .. } | TypeKind::Union { members, .. } => Some(members),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_composite(&self) -> bool
    {
        matches!(self.kind, TypeKind::Struct { .. } | TypeKind::Union { .. })
    }

    #[must_use]
    pub fn is_union(&self) -> bool
    {
        matches!(self.kind, TypeKind::Union { .. })
    }

    /// Enumerators of an enum, `None` for every other kind.
    #[must_use]
    pub fn enumerators(&self) -> Option<&[Enumerator]>
    {
        match &self.kind {
            TypeKind::Enum { values, .. } => Some(values),
            _ => None,
        }
    }
}

/// Immutable arena of types.
#[derive(Debug, Clone)]
pub struct TypeGraph
{
    nodes: Vec<TypeNode>,
    strings: Vec<u8>,
    by_name: HashMap<String, SmallVec<[TypeId; 2]>>,
    pointer_size: u32,
}

impl TypeGraph
{
    /// Parse raw BTF bytes.
    ///
    /// ## Errors
    ///
    /// Returns `LoaderError::Parse` for a bad header, truncated sections,
    /// unknown kinds or references to ids outside the graph. No partial
    /// graph is ever returned.
    pub fn load(raw: &[u8]) -> LoaderResult<Self>
    {
        let parsed = parse::parse_btf(raw)?;
        Self::from_parts(parsed.nodes, parsed.strings)
    }

    /// Graph holding only `void`.
    #[must_use]
    pub fn empty() -> Self
    {
        Self {
            nodes: vec![TypeNode::new(None, TypeKind::Void)],
            strings: Vec::new(),
            by_name: HashMap::new(),
            pointer_size: 8,
        }
    }

    fn from_parts(nodes: Vec<TypeNode>, strings: Vec<u8>) -> LoaderResult<Self>
    {
        let count = nodes.len();
        for (index, node) in nodes.iter().enumerate() {
            if let Some(bad) = node.kind.references().into_iter().find(|id| id.index() >= count) {
                return Err(LoaderError::parse(
                    "type graph",
                    format!("type [{index}] ({}) references {bad}, graph has {count} types", node.kind.label()),
                ));
            }
        }

        let mut by_name: HashMap<String, SmallVec<[TypeId; 2]>> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if let Some(name) = &node.name {
                by_name.entry(name.clone()).or_default().push(TypeId(index as u32));
            }
        }

        Ok(Self {
            nodes,
            strings,
            by_name,
            pointer_size: 8,
        })
    }

    /// Override the pointer width (bytes) used by [`TypeGraph::size_of`].
    #[must_use]
    pub fn with_pointer_size(mut self, bytes: u32) -> Self
    {
        self.pointer_size = bytes;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.nodes.len() <= 1
    }

    /// Look up a node.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `id` is not part of this graph.
    pub fn resolve(&self, id: TypeId) -> LoaderResult<&TypeNode>
    {
        self.get(id)
            .ok_or_else(|| LoaderError::InvalidArgument(format!("type {id} is outside a graph of {} types", self.len())))
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<&TypeNode>
    {
        self.nodes.get(id.index())
    }

    /// Iterate `(id, node)` pairs, `void` included.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeNode)>
    {
        self.nodes.iter().enumerate().map(|(index, node)| (TypeId(index as u32), node))
    }

    /// All ids carrying exactly this name.
    #[must_use]
    pub fn ids_named(&self, name: &str) -> &[TypeId]
    {
        self.by_name.get(name).map_or(&[], |ids| ids.as_slice())
    }

    /// String from the BTF string section the graph was loaded from.
    #[must_use]
    pub fn string_at(&self, offset: u32) -> Option<&str>
    {
        crate::bytes::c_str_at(&self.strings, offset as usize)
    }

    /// Follow const/volatile/restrict/type-tag wrappers.
    #[must_use]
    pub fn skip_qualifiers(&self, id: TypeId) -> TypeId
    {
        self.skip_while(id, false)
    }

    /// Follow qualifiers and typedefs down to the underlying type.
    #[must_use]
    pub fn skip_mods_and_typedefs(&self, id: TypeId) -> TypeId
    {
        self.skip_while(id, true)
    }

    fn skip_while(&self, mut id: TypeId, typedefs: bool) -> TypeId
    {
        let mut visited = HashSet::new();
        while visited.insert(id) {
            match self.get(id).map(|node| &node.kind) {
                Some(
                    TypeKind::Const { target }
                    | TypeKind::Volatile { target }
                    | TypeKind::Restrict { target }
                    | TypeKind::TypeTag { target },
                ) => id = *target,
                Some(TypeKind::Typedef { target }) if typedefs => id = *target,
                _ => break,
            }
        }
        id
    }

    /// Size of a type in bytes.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for kinds without a size (functions, forward
    /// declarations, void) or for a typedef cycle.
    pub fn size_of(&self, id: TypeId) -> LoaderResult<u32>
    {
        let mut multiplier: u64 = 1;
        let mut current = id;
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(current) {
                return Err(LoaderError::InvalidArgument(format!("type {id} has a reference cycle without a size")));
            }
            let node = self.resolve(current)?;
            let size = match &node.kind {
                TypeKind::Int { size, .. }
                | TypeKind::Struct { size, .. }
                | TypeKind::Union { size, .. }
                | TypeKind::Enum { size, .. }
                | TypeKind::Datasec { size, .. }
                | TypeKind::Float { size } => *size,
                TypeKind::Ptr { .. } => self.pointer_size,
                TypeKind::Array { element, len, .. } => {
                    multiplier = multiplier.saturating_mul(u64::from(*len));
                    current = *element;
                    continue;
                }
                TypeKind::Typedef { target }
                | TypeKind::Const { target }
                | TypeKind::Volatile { target }
                | TypeKind::Restrict { target }
                | TypeKind::TypeTag { target } => {
                    current = *target;
                    continue;
                }
                TypeKind::Var { ty, .. } => {
                    current = *ty;
                    continue;
                }
                other => {
                    return Err(LoaderError::InvalidArgument(format!(
                        "type {id} ({}) has no size",
                        other.label()
                    )))
                }
            };
            let total = multiplier.saturating_mul(u64::from(size));
            return u32::try_from(total)
                .map_err(|_| LoaderError::InvalidArgument(format!("size of type {id} overflows u32: {total}")));
        }
    }

    /// Canonical, human-readable name of a type.
    ///
    /// Named types render as their C spelling (`struct task_struct`); anonymous
    /// composites render as a structural signature listing their members.
    #[must_use]
    pub fn describe(&self, id: TypeId) -> String
    {
        let mut visited = HashSet::new();
        self.describe_inner(id, &mut visited)
    }

    /// `visited` holds the ids on the current path; a repeat is a cycle.
    fn describe_inner(&self, id: TypeId, visited: &mut HashSet<TypeId>) -> String
    {
        let Some(node) = self.get(id) else {
            return format!("<invalid {id}>");
        };
        if !visited.insert(id) {
            return match &node.kind {
                TypeKind::Struct { .. } | TypeKind::Union { .. } => format!("{} {{...}}", node.kind.label()),
                _ => format!("<cycle {id}>"),
            };
        }
        let text = self.describe_node(node, visited);
        visited.remove(&id);
        text
    }

    fn describe_node(&self, node: &TypeNode, visited: &mut HashSet<TypeId>) -> String
    {
        let name = node.name.as_deref();
        match &node.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Int { .. } | TypeKind::Float { .. } | TypeKind::Typedef { .. } => {
                name.map_or_else(|| format!("<anon {}>", node.kind.label()), str::to_string)
            }
            TypeKind::Ptr { target } => format!("{} *", self.describe_inner(*target, visited)),
            TypeKind::Const { target } => format!("const {}", self.describe_inner(*target, visited)),
            TypeKind::Volatile { target } => format!("volatile {}", self.describe_inner(*target, visited)),
            TypeKind::Restrict { target } => format!("{} restrict", self.describe_inner(*target, visited)),
            TypeKind::TypeTag { target } | TypeKind::DeclTag { target, .. } => {
                format!("{} __tag({})", self.describe_inner(*target, visited), name.unwrap_or(""))
            }
            TypeKind::Array { element, len, .. } => format!("{}[{len}]", self.describe_inner(*element, visited)),
            TypeKind::Struct { members, .. } | TypeKind::Union { members, .. } => {
                let keyword = node.kind.label();
                if let Some(name) = name {
                    return format!("{keyword} {name}");
                }
                let fields: Vec<String> = members
                    .iter()
                    .map(|member| {
                        format!(
                            "{}: {}",
                            member.name.as_deref().unwrap_or("_"),
                            self.describe_inner(member.ty, visited)
                        )
                    })
                    .collect();
                format!("{keyword} {{{}}}", fields.join(", "))
            }
            TypeKind::Enum { values, .. } => match name {
                Some(name) => format!("enum {name}"),
                None => {
                    let names: Vec<&str> = values.iter().map(|value| value.name.as_str()).collect();
                    format!("enum {{{}}}", names.join(", "))
                }
            },
            TypeKind::Fwd { union } => {
                format!("{} {}", if *union { "union" } else { "struct" }, name.unwrap_or("<anon>"))
            }
            TypeKind::Func { proto, .. } => {
                format!("{} {}", name.unwrap_or("<anon>"), self.describe_inner(*proto, visited))
            }
            TypeKind::FuncProto { ret, params } => {
                let params: Vec<String> = params.iter().map(|param| self.describe_inner(param.ty, visited)).collect();
                format!("fn({}) -> {}", params.join(", "), self.describe_inner(*ret, visited))
            }
            TypeKind::Var { ty, .. } => format!("{} {}", self.describe_inner(*ty, visited), name.unwrap_or("<anon>")),
            TypeKind::Datasec { .. } => format!("section {}", name.unwrap_or("<anon>")),
        }
    }
}

/// Incremental constructor for [`TypeGraph`].
///
/// Use [`TypeGraphBuilder::reserve`] to obtain an id before its node exists,
/// which is how self-referential and mutually-referential types are built.
#[derive(Debug)]
pub struct TypeGraphBuilder
{
    nodes: Vec<Option<TypeNode>>,
}

impl Default for TypeGraphBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl TypeGraphBuilder
{
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            nodes: vec![Some(TypeNode::new(None, TypeKind::Void))],
        }
    }

    /// Append a node and return its id.
    pub fn add(&mut self, node: TypeNode) -> TypeId
    {
        self.nodes.push(Some(node));
        TypeId((self.nodes.len() - 1) as u32)
    }

    /// Reserve an id to be filled later with [`TypeGraphBuilder::define`].
    pub fn reserve(&mut self) -> TypeId
    {
        self.nodes.push(None);
        TypeId((self.nodes.len() - 1) as u32)
    }

    /// Fill a reserved id.
    pub fn define(&mut self, id: TypeId, node: TypeNode)
    {
        if let Some(slot) = self.nodes.get_mut(id.index()) {
            *slot = Some(node);
        }
    }

    pub fn int(&mut self, name: &str, size: u32, signed: bool) -> TypeId
    {
        let encoding = if signed { IntEncoding::Signed } else { IntEncoding::Unsigned };
        self.add(TypeNode::new(
            Some(name),
            TypeKind::Int {
                size,
                bits: size * 8,
                offset: 0,
                encoding,
            },
        ))
    }

    pub fn ptr(&mut self, target: TypeId) -> TypeId
    {
        self.add(TypeNode::new(None, TypeKind::Ptr { target }))
    }

    pub fn array(&mut self, element: TypeId, len: u32) -> TypeId
    {
        self.add(TypeNode::new(
            None,
            TypeKind::Array {
                element,
                index: TypeId::VOID,
                len,
            },
        ))
    }

    pub fn struct_type(&mut self, name: Option<&str>, size: u32, members: Vec<Member>) -> TypeId
    {
        self.add(TypeNode::new(name, TypeKind::Struct { size, members }))
    }

    pub fn union_type(&mut self, name: Option<&str>, size: u32, members: Vec<Member>) -> TypeId
    {
        self.add(TypeNode::new(name, TypeKind::Union { size, members }))
    }

    /// Fill a reserved id with a struct.
    pub fn define_struct(&mut self, id: TypeId, name: Option<&str>, size: u32, members: Vec<Member>)
    {
        self.define(id, TypeNode::new(name, TypeKind::Struct { size, members }));
    }

    pub fn enum_type(&mut self, name: Option<&str>, size: u32, values: &[(&str, i64)]) -> TypeId
    {
        let values = values
            .iter()
            .map(|(name, value)| Enumerator {
                name: (*name).to_string(),
                value: *value,
            })
            .collect();
        self.add(TypeNode::new(
            name,
            TypeKind::Enum {
                size,
                signed: false,
                values,
            },
        ))
    }

    pub fn typedef(&mut self, name: &str, target: TypeId) -> TypeId
    {
        self.add(TypeNode::new(Some(name), TypeKind::Typedef { target }))
    }

    pub fn const_of(&mut self, target: TypeId) -> TypeId
    {
        self.add(TypeNode::new(None, TypeKind::Const { target }))
    }

    pub fn volatile_of(&mut self, target: TypeId) -> TypeId
    {
        self.add(TypeNode::new(None, TypeKind::Volatile { target }))
    }

    pub fn fwd(&mut self, name: &str, union: bool) -> TypeId
    {
        self.add(TypeNode::new(Some(name), TypeKind::Fwd { union }))
    }

    pub fn func_proto(&mut self, ret: TypeId, params: &[TypeId]) -> TypeId
    {
        let params = params.iter().map(|ty| Param { name: None, ty: *ty }).collect();
        self.add(TypeNode::new(None, TypeKind::FuncProto { ret, params }))
    }

    pub fn func(&mut self, name: &str, proto: TypeId) -> TypeId
    {
        self.add(TypeNode::new(Some(name), TypeKind::Func { proto, linkage: 1 }))
    }

    /// Finish the graph.
    ///
    /// ## Errors
    ///
    /// `Parse` if a reserved id was never defined or a node references an id
    /// outside the graph.
    pub fn build(self) -> LoaderResult<TypeGraph>
    {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (index, slot) in self.nodes.into_iter().enumerate() {
            let node = slot.ok_or_else(|| LoaderError::parse("type graph", format!("type [{index}] reserved but never defined")))?;
            nodes.push(node);
        }
        TypeGraph::from_parts(nodes, Vec::new())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn list_graph() -> (TypeGraph, TypeId, TypeId)
    {
        let mut builder = TypeGraphBuilder::new();
        let int = builder.int("int", 4, true);
        let head = builder.reserve();
        let next = builder.ptr(head);
        builder.define_struct(head, Some("list_head"), 16, vec![Member::new("next", next, 0), Member::new("len", int, 64)]);
        (builder.build().unwrap(), head, int)
    }

    #[test]
    fn test_self_referential_struct_describes_and_sizes()
    {
        let (graph, head, _) = list_graph();
        assert_eq!(graph.describe(head), "struct list_head");
        assert_eq!(graph.size_of(head).unwrap(), 16);
        let next = graph.resolve(head).unwrap().members().unwrap()[0].ty;
        assert_eq!(graph.describe(next), "struct list_head *");
        assert_eq!(graph.size_of(next).unwrap(), 8);
    }

    #[test]
    fn test_anonymous_composite_gets_structural_signature()
    {
        let mut builder = TypeGraphBuilder::new();
        let u8_ty = builder.int("u8", 1, false);
        let u32_ty = builder.int("u32", 4, false);
        let inner = builder.union_type(None, 4, vec![Member::new("a", u8_ty, 0), Member::new("b", u32_ty, 0)]);
        let outer = builder.struct_type(None, 4, vec![Member::anonymous(inner, 0)]);
        let graph = builder.build().unwrap();
        assert_eq!(graph.describe(outer), "struct {_: union {a: u8, b: u32}}");
    }

    #[test]
    fn test_anonymous_cycle_terminates()
    {
        let mut builder = TypeGraphBuilder::new();
        let anon = builder.reserve();
        let ptr = builder.ptr(anon);
        builder.define_struct(anon, None, 8, vec![Member::new("me", ptr, 0)]);
        let graph = builder.build().unwrap();
        assert_eq!(graph.describe(anon), "struct {me: struct {...} *}");
    }

    #[test]
    fn test_array_and_typedef_sizes()
    {
        let mut builder = TypeGraphBuilder::new();
        let int = builder.int("int", 4, true);
        let arr = builder.array(int, 4);
        let matrix = builder.array(arr, 3);
        let alias = builder.typedef("matrix_t", matrix);
        let konst = builder.const_of(alias);
        let graph = builder.build().unwrap();
        assert_eq!(graph.size_of(arr).unwrap(), 16);
        assert_eq!(graph.size_of(konst).unwrap(), 48);
        assert_eq!(graph.skip_qualifiers(konst), alias);
        assert_eq!(graph.skip_mods_and_typedefs(konst), matrix);
        assert_eq!(graph.describe(matrix), "int[4][3]");
    }

    #[test]
    fn test_typedef_cycle_is_reported_not_looped()
    {
        let mut builder = TypeGraphBuilder::new();
        let a = builder.reserve();
        let b = builder.typedef("b_t", a);
        builder.define(a, TypeNode::new(Some("a_t"), TypeKind::Typedef { target: b }));
        let graph = builder.build().unwrap();
        assert!(graph.size_of(a).is_err());
        assert_eq!(graph.skip_mods_and_typedefs(a), a);
    }

    #[test]
    fn test_dangling_reference_rejected()
    {
        let mut builder = TypeGraphBuilder::new();
        builder.ptr(TypeId::new(42));
        let err = builder.build().unwrap_err();
        assert!(matches!(err, LoaderError::Parse { .. }));
    }

    #[test]
    fn test_undefined_reservation_rejected()
    {
        let mut builder = TypeGraphBuilder::new();
        builder.reserve();
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_name_index()
    {
        let (graph, head, int) = list_graph();
        assert_eq!(graph.ids_named("list_head"), &[head]);
        assert_eq!(graph.ids_named("int"), &[int]);
        assert!(graph.ids_named("missing").is_empty());
        assert!(graph.resolve(TypeId::new(99)).is_err());
    }
}
