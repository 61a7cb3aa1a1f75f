//! # Compiled Objects
//!
//! Reads a compiled BPF ELF object into the inputs the loader consumes:
//!
//! | ELF piece                         | Becomes                              |
//! |-----------------------------------|--------------------------------------|
//! | executable sections               | [`ProgramImage`]s                    |
//! | `maps` section + its symbols      | [`MapDefinition`]s                   |
//! | `.BTF`                            | the local [`TypeGraph`]              |
//! | `.BTF.ext` CO-RE records          | [`RelocationRecord`]s per program    |
//! | relocations against map symbols   | map references                       |
//! | relocations against undefined     | helper calls / existence probes      |
//! | symbols                           |                                      |
//!
//! Calls that already carry a numeric helper id (no ELF relocation) are left
//! as they are.

use std::collections::HashMap;

use object::{Architecture, Endianness, Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex, SectionKind, SymbolKind};
use tracing::{debug, trace};

use crate::btf::{parse_core_relocations, TypeGraph, TypeKind};
use crate::error::{LoaderError, LoaderResult};
use crate::helpers::{ArgKind, DeclaredHelper, HelperSignature, Linkage, ReturnKind};
use crate::insn::{decode_all, INSN_SIZE};
use crate::maps::{MapDefinition, MapRecord, LEGACY_RECORD_SIZE, NESTED_RECORD_SIZE};
use crate::program::ProgramImage;
use crate::reloc::RelocationRecord;

/// Name of the legacy map definition section.
pub const MAPS_SECTION: &str = "maps";
pub const BTF_SECTION: &str = ".BTF";
pub const BTF_EXT_SECTION: &str = ".BTF.ext";

/// Everything the loader needs from one compiled object.
#[derive(Debug, Clone)]
pub struct CompiledObject
{
    endian: Endianness,
    btf: TypeGraph,
    programs: Vec<ProgramImage>,
    maps: Vec<MapDefinition>,
    helpers: Vec<DeclaredHelper>,
}

impl CompiledObject
{
    /// Object assembled by hand rather than parsed.
    #[must_use]
    pub fn new(btf: TypeGraph) -> Self
    {
        Self {
            endian: Endianness::Little,
            btf,
            programs: Vec::new(),
            maps: Vec::new(),
            helpers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: ProgramImage) -> Self
    {
        self.programs.push(program);
        self
    }

    #[must_use]
    pub fn with_map(mut self, definition: MapDefinition) -> Self
    {
        self.maps.push(definition);
        self
    }

    #[must_use]
    pub fn with_helper(mut self, helper: DeclaredHelper) -> Self
    {
        self.helpers.push(helper);
        self
    }

    /// Parse an ELF object.
    ///
    /// ## Errors
    ///
    /// `Parse` if the ELF is malformed, is not a BPF object, or any of its
    /// map, BTF or relocation metadata is inconsistent.
    pub fn parse(bytes: &[u8]) -> LoaderResult<Self>
    {
        let file = object::File::parse(bytes).map_err(|err| LoaderError::parse("ELF object", err.to_string()))?;
        if file.architecture() != Architecture::Bpf {
            return Err(LoaderError::parse(
                "ELF object",
                format!("expected a BPF object, found {:?}", file.architecture()),
            ));
        }
        let endian = file.endianness();

        let btf = match file.section_by_name(BTF_SECTION) {
            Some(section) => TypeGraph::load(section_data(&section)?)?,
            None => TypeGraph::empty(),
        };

        let maps_section = file.section_by_name(MAPS_SECTION);
        let maps_index = maps_section.as_ref().map(ObjectSection::index);
        let maps = match &maps_section {
            Some(section) => parse_maps(&file, section, endian)?,
            None => Vec::new(),
        };

        let mut core_relocations: HashMap<String, Vec<RelocationRecord>> = HashMap::new();
        if let Some(section) = file.section_by_name(BTF_EXT_SECTION) {
            for relocation in parse_core_relocations(section_data(&section)?, &btf)? {
                core_relocations
                    .entry(relocation.section)
                    .or_default()
                    .push(relocation.record);
            }
        }

        let mut helpers: HashMap<String, DeclaredHelper> = HashMap::new();
        let mut programs = Vec::new();
        for section in file.sections() {
            if section.kind() != SectionKind::Text {
                continue;
            }
            let data = section_data(&section)?;
            if data.is_empty() {
                continue;
            }
            let section_name = section
                .name()
                .map_err(|err| LoaderError::parse("ELF section name", err.to_string()))?
                .to_string();
            let insns = decode_all(data, endian)?;
            let name = program_name(&file, section.index()).unwrap_or_else(|| section_name.clone());
            let mut program = ProgramImage::new(name, insns).with_section(section_name.clone());
            for record in core_relocations.remove(&section_name).unwrap_or_default() {
                program = program.with_relocation(record);
            }

            for (offset, relocation) in section.relocations() {
                let RelocationTarget::Symbol(symbol_index) = relocation.target() else {
                    continue;
                };
                let symbol = file
                    .symbol_by_index(symbol_index)
                    .map_err(|err| LoaderError::parse("ELF relocation", err.to_string()))?;
                let symbol_name = symbol
                    .name()
                    .map_err(|err| LoaderError::parse("ELF symbol name", err.to_string()))?;
                let insn = usize::try_from(offset).unwrap_or(usize::MAX) / INSN_SIZE;

                if maps_index.is_some() && symbol.section_index() == maps_index {
                    trace!("{}: insn {insn} loads map {symbol_name}", program.name());
                    program = program.with_map_ref(insn, symbol_name);
                } else if symbol.is_undefined() {
                    let slot = program.insns().get(insn).copied().ok_or_else(|| {
                        LoaderError::parse("ELF relocation", format!("offset {offset} is outside {}", program.name()))
                    })?;
                    program = if slot.is_call() {
                        program.with_helper_call(insn, symbol_name)
                    } else if slot.is_ld_imm64() {
                        program.with_helper_probe(insn, symbol_name)
                    } else {
                        return Err(LoaderError::InvalidInstruction {
                            index: insn,
                            reason: format!("extern `{symbol_name}` referenced by {slot}"),
                        });
                    };
                    helpers.entry(symbol_name.to_string()).or_insert_with(|| DeclaredHelper {
                        name: symbol_name.to_string(),
                        linkage: if symbol.is_weak() { Linkage::Weak } else { Linkage::Strong },
                        recorded: recorded_signature(&btf, symbol_name),
                    });
                }
            }
            programs.push(program);
        }

        if let Some(section) = core_relocations.keys().next() {
            return Err(LoaderError::parse(
                BTF_EXT_SECTION,
                format!("relocation for unknown section `{section}`"),
            ));
        }

        let mut helpers: Vec<DeclaredHelper> = helpers.into_values().collect();
        helpers.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            "Parsed object: {} program(s), {} map(s), {} helper symbol(s), {} type(s)",
            programs.len(),
            maps.len(),
            helpers.len(),
            btf.len()
        );

        Ok(Self {
            endian,
            btf,
            programs,
            maps,
            helpers,
        })
    }

    #[must_use]
    pub fn endian(&self) -> Endianness
    {
        self.endian
    }

    /// The local type graph recorded by the compiler.
    #[must_use]
    pub fn btf(&self) -> &TypeGraph
    {
        &self.btf
    }

    #[must_use]
    pub fn programs(&self) -> &[ProgramImage]
    {
        &self.programs
    }

    #[must_use]
    pub fn program(&self, name: &str) -> Option<&ProgramImage>
    {
        self.programs.iter().find(|program| program.name() == name)
    }

    #[must_use]
    pub fn maps(&self) -> &[MapDefinition]
    {
        &self.maps
    }

    #[must_use]
    pub fn helpers(&self) -> &[DeclaredHelper]
    {
        &self.helpers
    }

    /// Relocations of every program, for diagnostics.
    pub fn relocations(&self) -> impl Iterator<Item = (&str, &RelocationRecord)>
    {
        self.programs
            .iter()
            .flat_map(|program| program.relocations().iter().map(move |record| (program.name(), record)))
    }
}

fn section_data<'data>(section: &object::Section<'data, '_>) -> LoaderResult<&'data [u8]>
{
    section
        .data()
        .map_err(|err| LoaderError::parse("ELF section data", err.to_string()))
}

/// Global function symbol at the start of a section, if any.
fn program_name(file: &object::File<'_>, section: SectionIndex) -> Option<String>
{
    file.symbols()
        .filter(|symbol| symbol.section_index() == Some(section) && symbol.kind() == SymbolKind::Text)
        .filter(|symbol| symbol.address() == 0 && symbol.is_global())
        .find_map(|symbol| symbol.name().ok().filter(|name| !name.is_empty()).map(str::to_string))
}

fn parse_maps(
    file: &object::File<'_>,
    section: &object::Section<'_, '_>,
    endian: Endianness,
) -> LoaderResult<Vec<MapDefinition>>
{
    let data = section_data(section)?;
    let mut symbols: Vec<(u64, u64, String)> = file
        .symbols()
        .filter(|symbol| symbol.section_index() == Some(section.index()))
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            (!name.is_empty()).then(|| (symbol.address(), symbol.size(), name.to_string()))
        })
        .collect();
    symbols.sort_by_key(|(offset, ..)| *offset);
    if symbols.is_empty() {
        return Ok(Vec::new());
    }

    let fallback = data.len() / symbols.len();
    let mut records = Vec::with_capacity(symbols.len());
    for (offset, size, name) in &symbols {
        let size = match usize::try_from(*size).unwrap_or(0) {
            0 => fallback,
            size => size,
        };
        if size != LEGACY_RECORD_SIZE && size != NESTED_RECORD_SIZE {
            return Err(LoaderError::parse(
                "maps section",
                format!("map `{name}` has a {size}-byte definition"),
            ));
        }
        let start = usize::try_from(*offset).unwrap_or(usize::MAX);
        let bytes = data
            .get(start..start.saturating_add(size))
            .ok_or_else(|| LoaderError::parse("maps section", format!("map `{name}` is truncated")))?;
        records.push((name.clone(), MapRecord::decode(bytes, endian)?));
    }

    records
        .iter()
        .map(|(name, record)| {
            let inner = match record.inner_index {
                Some(index) => Some(
                    records
                        .get(index as usize)
                        .map(|(inner, _)| inner.clone())
                        .ok_or_else(|| {
                            LoaderError::parse("maps section", format!("map `{name}` has inner index {index} out of range"))
                        })?,
                ),
                None => None,
            };
            Ok(record.into_definition(name.clone(), inner))
        })
        .collect()
}

/// Signature of an extern function as recorded in the local BTF.
fn recorded_signature(btf: &TypeGraph, name: &str) -> Option<HelperSignature>
{
    let proto = btf.ids_named(name).iter().find_map(|id| match &btf.get(*id)?.kind {
        TypeKind::Func { proto, .. } => Some(*proto),
        _ => None,
    })?;
    let TypeKind::FuncProto { ret, params } = &btf.get(proto)?.kind else {
        return None;
    };

    let classify = |id| match btf.get(btf.skip_mods_and_typedefs(id)).map(|node| &node.kind) {
        Some(TypeKind::Ptr { .. } | TypeKind::Array { .. }) => ArgKind::Memory,
        Some(TypeKind::Int { .. } | TypeKind::Enum { .. }) => ArgKind::Scalar,
        _ => ArgKind::Anything,
    };
    let ret = match btf.get(btf.skip_mods_and_typedefs(*ret)).map(|node| &node.kind) {
        Some(TypeKind::Void) | None => ReturnKind::Void,
        Some(TypeKind::Ptr { .. }) => ReturnKind::Pointer,
        Some(_) => ReturnKind::Integer,
    };

    // A trailing `void` parameter marks a variadic prototype.
    let variadic = params.last().is_some_and(|param| param.ty.raw() == 0);
    let args: Vec<ArgKind> = params
        .iter()
        .filter(|param| param.ty.raw() != 0)
        .map(|param| classify(param.ty))
        .collect();
    let signature = HelperSignature::new(ret, &args);
    Some(if variadic { signature.variadic() } else { signature })
}
