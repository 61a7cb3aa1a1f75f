//! BTF wire-format decoder.
//!
//! Layout (all offsets of the type and string sections are relative to the
//! end of the header):
//!
//! ```text
//! u16 magic (0xEB9F) | u8 version (1) | u8 flags | u32 hdr_len
//! u32 type_off | u32 type_len | u32 str_off | u32 str_len
//! ```
//!
//! Each type record is a 12-byte `btf_type` followed by kind-specific data.

use object::Endianness;

use super::{Enumerator, IntEncoding, Member, Param, SectionVar, TypeId, TypeKind, TypeNode};
use crate::bytes::{c_str_at, sub_slice, ByteReader};
use crate::error::{LoaderError, LoaderResult};

pub(crate) const BTF_MAGIC: u16 = 0xEB9F;
const BTF_VERSION: u8 = 1;
const MIN_HEADER_LEN: u32 = 24;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

const INT_SIGNED: u32 = 1 << 0;
const INT_CHAR: u32 = 1 << 1;
const INT_BOOL: u32 = 1 << 2;

pub(crate) struct ParsedBtf
{
    pub(crate) nodes: Vec<TypeNode>,
    pub(crate) strings: Vec<u8>,
}

/// Detect byte order from the magic number.
pub(crate) fn detect_endianness(raw: &[u8], context: &str) -> LoaderResult<Endianness>
{
    match raw.get(..2) {
        Some([0x9F, 0xEB]) => Ok(Endianness::Little),
        Some([0xEB, 0x9F]) => Ok(Endianness::Big),
        Some(other) => Err(LoaderError::parse(context, format!("bad magic {:02x}{:02x}", other[0], other[1]))),
        None => Err(LoaderError::parse(context, "missing magic")),
    }
}

pub(crate) fn parse_btf(raw: &[u8]) -> LoaderResult<ParsedBtf>
{
    let endian = detect_endianness(raw, "BTF header")?;
    let mut header = ByteReader::new(raw, endian, "BTF header");
    let magic = header.u16()?;
    debug_assert_eq!(magic, BTF_MAGIC);
    let version = header.u8()?;
    if version != BTF_VERSION {
        return Err(LoaderError::parse("BTF header", format!("unsupported version {version}")));
    }
    let _flags = header.u8()?;
    let hdr_len = header.u32()?;
    if hdr_len < MIN_HEADER_LEN {
        return Err(LoaderError::parse("BTF header", format!("header length {hdr_len} is too short")));
    }
    let type_off = header.u32()? as usize;
    let type_len = header.u32()? as usize;
    let str_off = header.u32()? as usize;
    let str_len = header.u32()? as usize;

    let body = raw
        .get(hdr_len as usize..)
        .ok_or_else(|| LoaderError::parse("BTF header", format!("header length {hdr_len} exceeds data")))?;
    let types = sub_slice(body, type_off, type_len, "BTF type section")?;
    let strings = sub_slice(body, str_off, str_len, "BTF string section")?;
    if !strings.is_empty() && strings[0] != 0 {
        return Err(LoaderError::parse("BTF string section", "first string must be empty"));
    }

    let mut nodes = vec![TypeNode::new(None, TypeKind::Void)];
    let mut reader = ByteReader::new(types, endian, "BTF type section");
    while !reader.is_empty() {
        let id = nodes.len();
        let node = parse_type(&mut reader, strings).map_err(|err| match err {
            LoaderError::Parse { context, reason } => LoaderError::parse(context, format!("type [{id}]: {reason}")),
            other => other,
        })?;
        nodes.push(node);
    }

    Ok(ParsedBtf {
        nodes,
        strings: strings.to_vec(),
    })
}

fn name_at(strings: &[u8], offset: u32) -> LoaderResult<Option<String>>
{
    if offset == 0 {
        return Ok(None);
    }
    c_str_at(strings, offset as usize)
        .map(|name| Some(name.to_string()))
        .ok_or_else(|| LoaderError::parse("BTF string section", format!("invalid string offset {offset}")))
}

fn parse_type(reader: &mut ByteReader<'_>, strings: &[u8]) -> LoaderResult<TypeNode>
{
    let name_off = reader.u32()?;
    let info = reader.u32()?;
    let size_or_type = reader.u32()?;

    let vlen = info & 0xffff;
    let kind = (info >> 24) & 0x1f;
    let kind_flag = info >> 31 == 1;
    let name = name_at(strings, name_off)?;
    let target = TypeId::new(size_or_type);

    let kind = match kind {
        KIND_INT => {
            let data = reader.u32()?;
            let encoding_bits = (data >> 24) & 0x0f;
            let encoding = if encoding_bits & INT_BOOL != 0 {
                IntEncoding::Bool
            } else if encoding_bits & INT_CHAR != 0 {
                IntEncoding::Char
            } else if encoding_bits & INT_SIGNED != 0 {
                IntEncoding::Signed
            } else {
                IntEncoding::Unsigned
            };
            TypeKind::Int {
                size: size_or_type,
                bits: data & 0xff,
                offset: (data >> 16) & 0xff,
                encoding,
            }
        }
        KIND_PTR => TypeKind::Ptr { target },
        KIND_ARRAY => {
            let element = TypeId::new(reader.u32()?);
            let index = TypeId::new(reader.u32()?);
            let len = reader.u32()?;
            TypeKind::Array { element, index, len }
        }
        KIND_STRUCT | KIND_UNION => {
            let mut members = Vec::with_capacity(vlen as usize);
            for _ in 0..vlen {
                let member_name = name_at(strings, reader.u32()?)?;
                let ty = TypeId::new(reader.u32()?);
                let offset = reader.u32()?;
                let (bit_offset, bitfield_size) = if kind_flag {
                    let bits = offset >> 24;
                    (offset & 0x00ff_ffff, (bits != 0).then_some(bits))
                } else {
                    (offset, None)
                };
                members.push(Member {
                    name: member_name,
                    ty,
                    bit_offset,
                    bitfield_size,
                });
            }
            if kind == KIND_STRUCT {
                TypeKind::Struct {
                    size: size_or_type,
                    members,
                }
            } else {
                TypeKind::Union {
                    size: size_or_type,
                    members,
                }
            }
        }
        KIND_ENUM => {
            let mut values = Vec::with_capacity(vlen as usize);
            for _ in 0..vlen {
                let value_name = name_at(strings, reader.u32()?)?.unwrap_or_default();
                let raw = reader.u32()?;
                let value = if kind_flag { i64::from(raw as i32) } else { i64::from(raw) };
                values.push(Enumerator { name: value_name, value });
            }
            TypeKind::Enum {
                size: size_or_type,
                signed: kind_flag,
                values,
            }
        }
        KIND_ENUM64 => {
            let mut values = Vec::with_capacity(vlen as usize);
            for _ in 0..vlen {
                let value_name = name_at(strings, reader.u32()?)?.unwrap_or_default();
                let lo = u64::from(reader.u32()?);
                let hi = u64::from(reader.u32()?);
                values.push(Enumerator {
                    name: value_name,
                    value: ((hi << 32) | lo) as i64,
                });
            }
            TypeKind::Enum {
                size: size_or_type,
                signed: kind_flag,
                values,
            }
        }
        KIND_FWD => TypeKind::Fwd { union: kind_flag },
        KIND_TYPEDEF => TypeKind::Typedef { target },
        KIND_VOLATILE => TypeKind::Volatile { target },
        KIND_CONST => TypeKind::Const { target },
        KIND_RESTRICT => TypeKind::Restrict { target },
        KIND_TYPE_TAG => TypeKind::TypeTag { target },
        KIND_FUNC => TypeKind::Func {
            proto: target,
            linkage: vlen,
        },
        KIND_FUNC_PROTO => {
            let mut params = Vec::with_capacity(vlen as usize);
            for _ in 0..vlen {
                let param_name = name_at(strings, reader.u32()?)?;
                let ty = TypeId::new(reader.u32()?);
                params.push(Param { name: param_name, ty });
            }
            TypeKind::FuncProto { ret: target, params }
        }
        KIND_VAR => TypeKind::Var {
            ty: target,
            linkage: reader.u32()?,
        },
        KIND_DATASEC => {
            let mut vars = Vec::with_capacity(vlen as usize);
            for _ in 0..vlen {
                let ty = TypeId::new(reader.u32()?);
                let offset = reader.u32()?;
                let size = reader.u32()?;
                vars.push(SectionVar { ty, offset, size });
            }
            TypeKind::Datasec {
                size: size_or_type,
                vars,
            }
        }
        KIND_FLOAT => TypeKind::Float { size: size_or_type },
        KIND_DECL_TAG => TypeKind::DeclTag {
            target,
            component: reader.i32()?,
        },
        unknown => {
            return Err(LoaderError::parse(
                "BTF type section",
                format!("unknown kind {unknown} at offset {}", reader.position().saturating_sub(12)),
            ))
        }
    };

    Ok(TypeNode { name, kind })
}
