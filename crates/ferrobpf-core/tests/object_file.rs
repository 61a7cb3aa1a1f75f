//! Tests for reading compiled BPF ELF objects and loading them

mod common;

use std::sync::Arc;

use common::{btf_ext, task_graph, BtfEncoder, CORE_FIELD_OFFSET};
use ferrobpf_core::error::LoaderError;
use ferrobpf_core::helpers::{Linkage, ReturnKind};
use ferrobpf_core::insn::{encode_all, Instruction, BPF_LDX, BPF_MEM, BPF_PSEUDO_MAP_FD, BPF_W};
use ferrobpf_core::loader::Loader;
use ferrobpf_core::maps::{InMemoryBackend, MapKind, MapRecord};
use ferrobpf_core::object_file::CompiledObject;
use ferrobpf_core::options::LoaderOptions;
use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

const R_BPF_64_64: u32 = 1;
const R_BPF_64_32: u32 = 10;
const JEQ_IMM: u8 = 0x15;
const SECTION: &str = "kprobe/do_exit";

fn program() -> Vec<Instruction>
{
    let [probe_low, probe_high] = Instruction::ld_imm64(1, 0, 0);
    let [map_low, map_high] = Instruction::ld_imm64(1, 0, 0);
    vec![
        // r1 = task->pid
        Instruction::new(BPF_LDX | BPF_MEM | BPF_W, 1, 2, 4, 0),
        // r1 = &bpf_ktime_get_ns
        probe_low,
        probe_high,
        Instruction::new(JEQ_IMM, 1, 0, 1, 0),
        Instruction::call(-1),
        // r1 = &counts
        map_low,
        map_high,
        // pre-resolved helper id
        Instruction::call(1),
        Instruction::exit(),
    ]
}

fn symbol(name: &str, value: u64, size: u64, kind: SymbolKind, section: SymbolSection, weak: bool) -> Symbol
{
    Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind,
        scope: SymbolScope::Dynamic,
        weak,
        section,
        flags: SymbolFlags::None,
    }
}

/// A BPF object with one program, three maps (one map-of-maps), local BTF,
/// a CO-RE relocation and a weak extern helper.
fn build_object() -> Vec<u8>
{
    let mut btf = BtfEncoder::new();
    let int = btf.int("int", 4, true);
    let task = btf.struct_type("task", 8, &[("flags", int, 0), ("pid", int, 32)]);
    let long = btf.int("long long unsigned int", 8, false);
    let proto = btf.func_proto(long, &[]);
    btf.extern_func("bpf_ktime_get_ns", proto);
    let section_name = btf.string(SECTION);
    let access = btf.string("0:1");

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);

    let text = obj.add_section(Vec::new(), SECTION.as_bytes().to_vec(), SectionKind::Text);
    let code = encode_all(&program(), Endianness::Little);
    obj.append_section_data(text, &code, 8);
    obj.add_symbol(symbol(
        "trace_exit",
        0,
        code.len() as u64,
        SymbolKind::Text,
        SymbolSection::Section(text),
        false,
    ));

    let maps = obj.add_section(Vec::new(), b"maps".to_vec(), SectionKind::Data);
    let records = [
        ("counts", MapRecord { kind: 1, key_size: 4, value_size: 8, max_entries: 64, flags: 0, inner_index: None }),
        ("inner", MapRecord { kind: 2, key_size: 4, value_size: 16, max_entries: 4, flags: 0, inner_index: None }),
        ("outer", MapRecord { kind: 12, key_size: 4, value_size: 4, max_entries: 4, flags: 0, inner_index: Some(1) }),
    ];
    let mut map_symbols = Vec::new();
    for (index, (name, record)) in records.iter().enumerate() {
        obj.append_section_data(maps, &record.encode(Endianness::Little), 4);
        map_symbols.push(obj.add_symbol(symbol(
            name,
            index as u64 * 24,
            24,
            SymbolKind::Data,
            SymbolSection::Section(maps),
            false,
        )));
    }

    let helper = obj.add_symbol(symbol("bpf_ktime_get_ns", 0, 0, SymbolKind::Unknown, SymbolSection::Undefined, true));

    let btf_section = obj.add_section(Vec::new(), b".BTF".to_vec(), SectionKind::Other);
    obj.append_section_data(btf_section, &btf.finish(), 4);
    let ext_section = obj.add_section(Vec::new(), b".BTF.ext".to_vec(), SectionKind::Other);
    let ext = btf_ext(&[(section_name, vec![(0, task, access, CORE_FIELD_OFFSET)])]);
    obj.append_section_data(ext_section, &ext, 4);

    for (offset, target, r_type) in [(8, helper, R_BPF_64_64), (32, helper, R_BPF_64_32), (40, map_symbols[0], R_BPF_64_64)] {
        obj.add_relocation(
            text,
            Relocation {
                offset,
                symbol: target,
                addend: 0,
                flags: RelocationFlags::Elf { r_type },
            },
        )
        .unwrap();
    }

    obj.write().unwrap()
}

#[test]
fn test_parse_bpf_object()
{
    let object = CompiledObject::parse(&build_object()).unwrap();

    assert_eq!(object.programs().len(), 1);
    let program = object.program("trace_exit").unwrap();
    assert_eq!(program.section(), SECTION);
    assert_eq!(program.insns().len(), 9);
    assert_eq!(program.relocations().len(), 1);
    assert_eq!(program.relocations()[0].path.to_string(), "pid");
    assert_eq!(program.map_refs()[0].insn, 5);
    assert_eq!(program.map_refs()[0].map, "counts");
    assert_eq!(program.helper_refs().len(), 2);

    let names: Vec<&str> = object.maps().iter().map(|map| map.name.as_str()).collect();
    assert_eq!(names, vec!["counts", "inner", "outer"]);
    assert_eq!(object.maps()[2].kind, MapKind::ArrayOfMaps);
    assert_eq!(object.maps()[2].inner.as_deref(), Some("inner"));

    let helper = &object.helpers()[0];
    assert_eq!(helper.name, "bpf_ktime_get_ns");
    assert_eq!(helper.linkage, Linkage::Weak);
    let recorded = helper.recorded.as_ref().unwrap();
    assert_eq!(recorded.ret, ReturnKind::Integer);
    assert!(recorded.args.is_empty());
}

#[test]
fn test_load_parsed_object()
{
    let object = CompiledObject::parse(&build_object()).unwrap();
    let (target, _) = task_graph(12);
    let backend = Arc::new(InMemoryBackend::new());
    let loader = Loader::new(target, backend.clone(), LoaderOptions::new());

    let loaded = loader.load(&object).unwrap();
    let program = loaded.program("trace_exit").unwrap();
    assert!(program.is_ready());

    let insns = program.insns();
    assert_eq!(insns[0].off, 12);
    assert_eq!(insns[1].imm, 1);
    assert_eq!(insns[4].imm, 5);
    assert_eq!(insns[5].src_reg, BPF_PSEUDO_MAP_FD);
    assert_eq!(insns[5].imm as u32, loaded.map("counts").unwrap().raw());
    assert_eq!(insns[7].imm, 1);
    assert_eq!(backend.created(), vec!["counts", "inner", "outer"]);

    // Untouched instructions are byte-identical
    let original = program_bytes(&object);
    let patched = program.to_bytes(Endianness::Little);
    assert_eq!(original[64..], patched[64..]);
    assert_eq!(original[24..32], patched[24..32]);
}

fn program_bytes(object: &CompiledObject) -> Vec<u8>
{
    object.programs()[0].to_bytes(Endianness::Little)
}

#[test]
fn test_parse_rejects_foreign_architecture()
{
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0xc3], 1);
    let err = CompiledObject::parse(&obj.write().unwrap()).unwrap_err();
    assert!(matches!(err, LoaderError::Parse { .. }));
    assert!(err.to_string().contains("BPF"), "{err}");
}

#[test]
fn test_parse_rejects_odd_map_records()
{
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
    let maps = obj.add_section(Vec::new(), b"maps".to_vec(), SectionKind::Data);
    obj.append_section_data(maps, &[0u8; 16], 4);
    obj.add_symbol(symbol("short", 0, 16, SymbolKind::Data, SymbolSection::Section(maps), false));

    let err = CompiledObject::parse(&obj.write().unwrap()).unwrap_err();
    assert!(err.to_string().contains("16-byte"), "{err}");
}
