//! Shared fixtures for integration tests: raw BTF / `.BTF.ext` encoders and
//! small type graphs.

#![allow(dead_code)]

use ferrobpf_core::btf::{Member, TypeGraph, TypeGraphBuilder, TypeId};

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_TYPEDEF: u32 = 8;
const KIND_CONST: u32 = 10;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;

pub const CORE_FIELD_OFFSET: u32 = 0;
pub const CORE_FIELD_EXISTS: u32 = 2;
pub const CORE_TYPE_SIZE: u32 = 9;
pub const CORE_ENUM_VALUE: u32 = 11;

/// Little-endian BTF writer. Ids are assigned in call order starting at 1.
#[derive(Debug)]
pub struct BtfEncoder
{
    types: Vec<u8>,
    strings: Vec<u8>,
    next_id: u32,
}

impl Default for BtfEncoder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl BtfEncoder
{
    pub fn new() -> Self
    {
        Self {
            types: Vec::new(),
            strings: vec![0],
            next_id: 1,
        }
    }

    /// Add a string and return its offset.
    pub fn string(&mut self, value: &str) -> u32
    {
        if value.is_empty() {
            return 0;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(value.as_bytes());
        self.strings.push(0);
        offset
    }

    fn u32(&mut self, value: u32)
    {
        self.types.extend_from_slice(&value.to_le_bytes());
    }

    fn header(&mut self, name: &str, kind: u32, vlen: u32, kind_flag: bool, size_or_type: u32) -> u32
    {
        let name_off = self.string(name);
        self.u32(name_off);
        self.u32((u32::from(kind_flag) << 31) | (kind << 24) | vlen);
        self.u32(size_or_type);
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Id the next type will get; for forward references.
    pub fn next_id(&self) -> u32
    {
        self.next_id
    }

    pub fn int(&mut self, name: &str, size: u32, signed: bool) -> u32
    {
        let id = self.header(name, KIND_INT, 0, false, size);
        self.u32((u32::from(signed) << 24) | (size * 8));
        id
    }

    pub fn ptr(&mut self, target: u32) -> u32
    {
        self.header("", KIND_PTR, 0, false, target)
    }

    pub fn array(&mut self, element: u32, index: u32, len: u32) -> u32
    {
        let id = self.header("", KIND_ARRAY, 0, false, 0);
        self.u32(element);
        self.u32(index);
        self.u32(len);
        id
    }

    /// Members as `(name, type, bit offset)`.
    pub fn struct_type(&mut self, name: &str, size: u32, members: &[(&str, u32, u32)]) -> u32
    {
        self.composite(KIND_STRUCT, name, size, members, false)
    }

    pub fn union_type(&mut self, name: &str, size: u32, members: &[(&str, u32, u32)]) -> u32
    {
        self.composite(KIND_UNION, name, size, members, false)
    }

    /// Struct whose members carry `(bit size << 24) | bit offset`.
    pub fn bitfield_struct(&mut self, name: &str, size: u32, members: &[(&str, u32, u32, u32)]) -> u32
    {
        let id = self.header(name, KIND_STRUCT, members.len() as u32, true, size);
        for (member, ty, offset, bits) in members {
            let name_off = self.string(member);
            self.u32(name_off);
            self.u32(*ty);
            self.u32((bits << 24) | offset);
        }
        id
    }

    fn composite(&mut self, kind: u32, name: &str, size: u32, members: &[(&str, u32, u32)], kind_flag: bool) -> u32
    {
        let id = self.header(name, kind, members.len() as u32, kind_flag, size);
        for (member, ty, offset) in members {
            let name_off = self.string(member);
            self.u32(name_off);
            self.u32(*ty);
            self.u32(*offset);
        }
        id
    }

    pub fn enum_type(&mut self, name: &str, values: &[(&str, i32)]) -> u32
    {
        let id = self.header(name, KIND_ENUM, values.len() as u32, true, 4);
        for (value_name, value) in values {
            let name_off = self.string(value_name);
            self.u32(name_off);
            self.u32(*value as u32);
        }
        id
    }

    pub fn typedef(&mut self, name: &str, target: u32) -> u32
    {
        self.header(name, KIND_TYPEDEF, 0, false, target)
    }

    pub fn const_of(&mut self, target: u32) -> u32
    {
        self.header("", KIND_CONST, 0, false, target)
    }

    pub fn func_proto(&mut self, ret: u32, params: &[u32]) -> u32
    {
        let id = self.header("", KIND_FUNC_PROTO, params.len() as u32, false, ret);
        for param in params {
            self.u32(0);
            self.u32(*param);
        }
        id
    }

    /// Extern function (linkage 2).
    pub fn extern_func(&mut self, name: &str, proto: u32) -> u32
    {
        self.header(name, KIND_FUNC, 2, false, proto)
    }

    /// Raw type-section bytes, for corrupting in tests.
    pub fn type_bytes(&self) -> &[u8]
    {
        &self.types
    }

    pub fn finish(&self) -> Vec<u8>
    {
        let mut out = Vec::new();
        out.extend_from_slice(&0xEB9Fu16.to_le_bytes());
        out.push(1);
        out.push(0);
        out.extend_from_slice(&24u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(self.types.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.types.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.types);
        out.extend_from_slice(&self.strings);
        out
    }
}

/// One CO-RE record for [`btf_ext`]: `(insn byte offset, type id, access
/// string offset, kind)`.
pub type CoreRecord = (u32, u32, u32, u32);

/// Little-endian `.BTF.ext` with only a CO-RE subsection.
pub fn btf_ext(sections: &[(u32, Vec<CoreRecord>)]) -> Vec<u8>
{
    let mut core = Vec::new();
    core.extend_from_slice(&16u32.to_le_bytes());
    for (name_off, records) in sections {
        core.extend_from_slice(&name_off.to_le_bytes());
        core.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for (insn_off, type_id, access_off, kind) in records {
            for value in [insn_off, type_id, access_off, kind] {
                core.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xEB9Fu16.to_le_bytes());
    out.push(1);
    out.push(0);
    out.extend_from_slice(&32u32.to_le_bytes());
    for _ in 0..4 {
        out.extend_from_slice(&0u32.to_le_bytes());
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(core.len() as u32).to_le_bytes());
    out.extend_from_slice(&core);
    out
}

/// `struct task { int flags; int pid; ... }` with `pid` at `pid_offset` bytes.
/// Returns the graph and the struct id.
pub fn task_graph(pid_offset: u32) -> (TypeGraph, TypeId)
{
    let mut builder = TypeGraphBuilder::new();
    let int = builder.int("int", 4, true);
    let task = builder.struct_type(
        Some("task"),
        pid_offset + 8,
        vec![Member::new("flags", int, 0), Member::new("pid", int, pid_offset * 8)],
    );
    (builder.build().expect("task graph"), task)
}

/// Graph with just `int`, for targets lacking everything interesting.
pub fn bare_graph() -> TypeGraph
{
    let mut builder = TypeGraphBuilder::new();
    builder.int("int", 4, true);
    builder.build().expect("bare graph")
}
