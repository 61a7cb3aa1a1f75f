//! `.BTF.ext` decoder, limited to the CO-RE relocation subsection.
//!
//! ```text
//! u16 magic | u8 version | u8 flags | u32 hdr_len
//! u32 func_info_off | u32 func_info_len
//! u32 line_info_off | u32 line_info_len
//! u32 core_relo_off | u32 core_relo_len      (hdr_len >= 32)
//! ```
//!
//! The CO-RE subsection starts with a `u32` record size and is followed by
//! per-section blocks: `u32 sec_name_off`, `u32 num_info`, then `num_info`
//! records of `{ insn_off, type_id, access_str_off, kind }`.
//!
//! Access strings are colon-separated indices (`0:1:2`): the first is an
//! array index applied to the root, the rest are member or element indices.
//! They are turned into name-based [`AccessPath`]s against the local graph.

use super::parse::detect_endianness;
use super::{TypeGraph, TypeId, TypeKind};
use crate::bytes::{sub_slice, ByteReader};
use crate::error::{LoaderError, LoaderResult};
use crate::insn::INSN_SIZE;
use crate::reloc::{AccessPath, AccessStep, RelocationKind, RelocationRecord};

const CORE_RELO_HEADER_LEN: u32 = 32;
const CORE_RELO_RECORD_LEN: usize = 16;

/// A CO-RE relocation decoded from `.BTF.ext`, attributed to a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRelocation
{
    /// Name of the program section the instruction belongs to
    pub section: String,
    pub record: RelocationRecord,
}

/// Decode every CO-RE relocation in `raw`.
///
/// Strings (section names and access strings) are looked up in `local`'s
/// string table, so `local` must be the graph loaded from the same object.
///
/// ## Errors
///
/// `Parse` for malformed headers, truncated blocks, unknown relocation kinds
/// or access strings that do not fit the local types.
pub fn parse_core_relocations(raw: &[u8], local: &TypeGraph) -> LoaderResult<Vec<SectionRelocation>>
{
    const CONTEXT: &str = ".BTF.ext";

    let endian = detect_endianness(raw, CONTEXT)?;
    let mut header = ByteReader::new(raw, endian, CONTEXT);
    header.skip(4)?;
    let hdr_len = header.u32()?;
    if hdr_len < CORE_RELO_HEADER_LEN {
        return Ok(Vec::new());
    }
    header.skip(16)?;
    let core_off = header.u32()? as usize;
    let core_len = header.u32()? as usize;
    if core_len == 0 {
        return Ok(Vec::new());
    }

    let body = raw
        .get(hdr_len as usize..)
        .ok_or_else(|| LoaderError::parse(CONTEXT, format!("header length {hdr_len} exceeds data")))?;
    let core = sub_slice(body, core_off, core_len, "CO-RE relocation section")?;
    let mut reader = ByteReader::new(core, endian, "CO-RE relocation section");
    let record_len = reader.u32()? as usize;
    if record_len < CORE_RELO_RECORD_LEN {
        return Err(LoaderError::parse(
            "CO-RE relocation section",
            format!("record size {record_len} is smaller than {CORE_RELO_RECORD_LEN}"),
        ));
    }

    let mut relocations = Vec::new();
    while !reader.is_empty() {
        let name_off = reader.u32()?;
        let count = reader.u32()?;
        let section = string(local, name_off)?.to_string();

        for _ in 0..count {
            let record = reader.take(record_len)?;
            let mut fields = ByteReader::new(record, endian, "CO-RE relocation record");
            let insn_off = fields.u32()? as usize;
            let type_id = TypeId::new(fields.u32()?);
            let access = string(local, fields.u32()?)?;
            let raw_kind = fields.u32()?;

            let kind = RelocationKind::from_btf_ext(raw_kind).ok_or_else(|| {
                LoaderError::parse(
                    "CO-RE relocation record",
                    format!("unsupported relocation kind {raw_kind} in {section}"),
                )
            })?;
            if insn_off % INSN_SIZE != 0 {
                return Err(LoaderError::parse(
                    "CO-RE relocation record",
                    format!("instruction offset {insn_off} is not aligned"),
                ));
            }
            let path = access_path(local, type_id, kind, access)?;
            relocations.push(SectionRelocation {
                section: section.clone(),
                record: RelocationRecord::new(insn_off / INSN_SIZE, kind, type_id, path),
            });
        }
    }
    Ok(relocations)
}

fn string(graph: &TypeGraph, offset: u32) -> LoaderResult<&str>
{
    graph
        .string_at(offset)
        .ok_or_else(|| LoaderError::parse(".BTF.ext", format!("invalid string offset {offset}")))
}

/// Convert a numeric access string into a name path through `graph`.
///
/// Anonymous members contribute no step; name lookup descends into them.
///
/// ## Errors
///
/// `Parse` if an index does not exist in the type it is applied to.
pub fn access_path(graph: &TypeGraph, root: TypeId, kind: RelocationKind, spec: &str) -> LoaderResult<AccessPath>
{
    let invalid = |reason: String| LoaderError::parse("CO-RE access string", format!("`{spec}` on {root}: {reason}"));
    let indices = spec
        .split(':')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<u32>, _>>()
        .map_err(|err| invalid(err.to_string()))?;
    let Some((&first, rest)) = indices.split_first() else {
        return Err(invalid("empty access string".to_string()));
    };

    let mut path = AccessPath::new();
    if !kind.is_field() {
        if kind.is_enum() {
            let enumerators = graph
                .get(graph.skip_mods_and_typedefs(root))
                .and_then(|node| node.enumerators())
                .ok_or_else(|| invalid("root is not an enum".to_string()))?;
            let value = enumerators
                .get(first as usize)
                .ok_or_else(|| invalid(format!("no enumerator #{first}")))?;
            path.push(AccessStep::Member(value.name.clone()));
        }
        return Ok(path);
    }

    if first != 0 {
        path.push(AccessStep::Index(first));
    }
    let mut current = graph.skip_mods_and_typedefs(root);
    for &index in rest {
        let node = graph.resolve(current).map_err(|err| invalid(err.to_string()))?;
        current = match &node.kind {
            TypeKind::Struct { members, .. } | TypeKind::Union { members, .. } => {
                let member = members
                    .get(index as usize)
                    .ok_or_else(|| invalid(format!("no member #{index} in {}", graph.describe(current))))?;
                if let Some(name) = &member.name {
                    path.push(AccessStep::Member(name.clone()));
                }
                member.ty
            }
            TypeKind::Array { element, .. } => {
                path.push(AccessStep::Index(index));
                *element
            }
            _ => return Err(invalid(format!("cannot index into {}", graph.describe(current)))),
        };
        current = graph.skip_mods_and_typedefs(current);
    }
    Ok(path)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::btf::{Member, TypeGraphBuilder};

    #[test]
    fn test_access_string_to_names()
    {
        let mut builder = TypeGraphBuilder::new();
        let int = builder.int("int", 4, true);
        let arr = builder.array(int, 4);
        let anon = builder.struct_type(None, 4, vec![Member::new("inner", int, 0)]);
        let outer = builder.struct_type(
            Some("outer"),
            24,
            vec![Member::new("a", int, 0), Member::anonymous(anon, 32), Member::new("vals", arr, 64)],
        );
        let typedef = builder.typedef("outer_t", outer);
        let graph = builder.build().unwrap();

        let path = access_path(&graph, typedef, RelocationKind::FieldOffset, "0:2:3").unwrap();
        assert_eq!(path.to_string(), "vals[3]");
        let path = access_path(&graph, outer, RelocationKind::FieldOffset, "1:1:0").unwrap();
        assert_eq!(path.to_string(), "[1].inner");
        assert!(access_path(&graph, outer, RelocationKind::FieldOffset, "0:7").is_err());
        assert!(access_path(&graph, outer, RelocationKind::TypeSize, "0").unwrap().is_empty());
    }

    #[test]
    fn test_enum_access_string()
    {
        let mut builder = TypeGraphBuilder::new();
        let state = builder.enum_type(Some("state"), 4, &[("IDLE", 0), ("BUSY", 1)]);
        let graph = builder.build().unwrap();

        let path = access_path(&graph, state, RelocationKind::EnumValue, "1").unwrap();
        assert_eq!(path.last_name(), Some("BUSY"));
        assert!(access_path(&graph, state, RelocationKind::EnumExists, "5").is_err());
    }
}
