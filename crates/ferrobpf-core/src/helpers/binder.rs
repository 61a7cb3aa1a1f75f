//! Binding helper calls and map references.
//!
//! Runs after relocations, on an image in the `FieldsPatched` state, and
//! leaves it `Ready`:
//!
//! 1. Every helper symbol the program references is classified as
//!    [`HelperPresence::Required`], `OptionalPresent` or `OptionalAbsent`.
//! 2. `call` instructions get the helper's numeric id.
//! 3. Existence probes (`ld_imm64` of the helper's address) get `1` or `0`.
//! 4. Map loads get the manager-issued handle.
//!
//! A helper that is absent on the target is only acceptable when it was
//! declared weak *and* the program probes for it. Its calls are then
//! unreachable on this target and are rewritten to [`POISON_CALL_ID`], which
//! no verifier accepts.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{DeclaredHelper, HelperAvailability, HelperPresence, HelperSignature, HelperTable, Linkage};
use crate::error::{LoaderError, LoaderResult};
use crate::insn::{Instruction, BPF_PSEUDO_MAP_FD};
use crate::maps::{MapHandle, MapTable};
use crate::program::{ProgramImage, ProgramState, ReferenceKind};

/// Call id written into calls of helpers that resolved absent.
pub const POISON_CALL_ID: i32 = 0x0BAD_2310;

/// Final binding of one helper symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperBinding
{
    pub name: String,
    /// Numeric call id; `None` for weak symbols unknown to the table
    pub id: Option<u32>,
    pub signature: Option<HelperSignature>,
    pub presence: HelperPresence,
    /// Call sites rewritten
    pub calls: usize,
    /// Existence probes rewritten
    pub probes: usize,
}

impl HelperBinding
{
    #[must_use]
    pub fn is_present(&self) -> bool
    {
        self.presence != HelperPresence::OptionalAbsent
    }
}

/// What [`bind`] did to one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport
{
    /// Per-helper results, keyed by symbol name
    pub helpers: BTreeMap<String, HelperBinding>,
    /// `(instruction, handle)` for every patched map load
    pub maps: Vec<(usize, MapHandle)>,
}

impl BindReport
{
    /// Symbol → call id for every present helper.
    #[must_use]
    pub fn call_ids(&self) -> BTreeMap<&str, u32>
    {
        self.helpers
            .values()
            .filter(|binding| binding.is_present())
            .filter_map(|binding| binding.id.map(|id| (binding.name.as_str(), id)))
            .collect()
    }

    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&HelperBinding>
    {
        self.helpers.get(name)
    }
}

/// Bind helper calls, existence probes and map loads of `image`, then mark
/// it `Ready`.
///
/// Symbols the program references but `declared` does not list are treated
/// as strongly declared.
///
/// ## Errors
///
/// - `InvalidState` if the image is not `FieldsPatched`
/// - `AmbiguousSignature` if a recorded signature disagrees with the table
/// - `UnboundHelper` for an absent helper that is strong, or weak but called
///   without a probe
/// - `UnknownMap` for a map load naming a map missing from `maps`
/// - `InvalidInstruction` if a reference points at the wrong opcode
pub fn bind(
    image: &mut ProgramImage,
    declared: &[DeclaredHelper],
    availability: &HelperAvailability,
    maps: &MapTable,
) -> LoaderResult<BindReport>
{
    if *image.state() != ProgramState::FieldsPatched {
        return Err(LoaderError::InvalidState {
            program: image.name().to_string(),
            from: image.state().to_string(),
            to: ProgramState::Ready.to_string(),
        });
    }

    let table = HelperTable::global();
    let mut references = image.helper_refs().to_vec();
    references.sort_by_key(|reference| reference.insn);

    let mut report = BindReport::default();
    for reference in &references {
        if report.helpers.contains_key(&reference.symbol) {
            continue;
        }
        let declaration = declared
            .iter()
            .find(|helper| helper.name == reference.symbol)
            .cloned()
            .unwrap_or_else(|| DeclaredHelper::strong(reference.symbol.clone()));
        let spec = table.get(&declaration.name);

        if let (Some(spec), Some(recorded)) = (spec, &declaration.recorded) {
            if !spec.signature.accepts(recorded) {
                return Err(LoaderError::AmbiguousSignature {
                    name: declaration.name.clone(),
                    recorded: recorded.to_string(),
                    expected: spec.signature.to_string(),
                });
            }
        }

        let available = spec.is_some_and(|spec| availability.contains(spec.id));
        let presence = match (declaration.linkage, available) {
            (Linkage::Strong, true) => HelperPresence::Required,
            (Linkage::Strong, false) => {
                return Err(LoaderError::UnboundHelper {
                    name: declaration.name,
                    insn: reference.insn,
                    reason: if spec.is_some() {
                        "not available on the target".to_string()
                    } else {
                        "not a known helper".to_string()
                    },
                });
            }
            (Linkage::Weak, true) => HelperPresence::OptionalPresent,
            (Linkage::Weak, false) => {
                let probed = references
                    .iter()
                    .any(|other| other.symbol == declaration.name && other.kind == ReferenceKind::ExistenceProbe);
                if !probed {
                    return Err(LoaderError::UnboundHelper {
                        name: declaration.name,
                        insn: reference.insn,
                        reason: "weak helper is absent and its calls are not guarded by an existence check"
                            .to_string(),
                    });
                }
                HelperPresence::OptionalAbsent
            }
        };

        report.helpers.insert(
            declaration.name.clone(),
            HelperBinding {
                name: declaration.name,
                id: spec.map(|spec| spec.id),
                signature: spec.map(|spec| spec.signature.clone()),
                presence,
                calls: 0,
                probes: 0,
            },
        );
    }

    for reference in &references {
        let Some(binding) = report.helpers.get_mut(&reference.symbol) else {
            continue;
        };
        match reference.kind {
            ReferenceKind::Call => {
                let id = match (binding.presence, binding.id) {
                    (HelperPresence::OptionalAbsent, _) | (_, None) => POISON_CALL_ID,
                    (_, Some(id)) => i32::try_from(id).unwrap_or(POISON_CALL_ID),
                };
                patch_call(image, reference.insn, id)?;
                binding.calls += 1;
            }
            ReferenceKind::ExistenceProbe => {
                let value = u64::from(binding.is_present());
                patch_ld_imm64(image, reference.insn, 0, value)?;
                binding.probes += 1;
            }
        }
    }

    for binding in report.helpers.values() {
        match binding.presence {
            HelperPresence::OptionalAbsent => warn!(
                "Weak helper {} is absent: {} probe(s) resolved false, {} call(s) poisoned",
                binding.name, binding.probes, binding.calls
            ),
            _ => debug!("Bound helper {} to id {:?} ({} call(s))", binding.name, binding.id, binding.calls),
        }
    }

    let mut map_refs = image.map_refs().to_vec();
    map_refs.sort_by_key(|reference| reference.insn);
    for reference in map_refs {
        let handle = maps.get(&reference.map).ok_or_else(|| LoaderError::UnknownMap {
            name: reference.map.clone(),
            insn: reference.insn,
        })?;
        patch_ld_imm64(image, reference.insn, BPF_PSEUDO_MAP_FD, u64::from(handle.raw()))?;
        report.maps.push((reference.insn, handle));
    }

    image.mark_ready()?;
    Ok(report)
}

fn patch_call(image: &mut ProgramImage, index: usize, id: i32) -> LoaderResult<()>
{
    let slots = image.insns_mut();
    match slots.get_mut(index) {
        Some(insn) if insn.is_call() => {
            insn.src_reg = 0;
            insn.imm = id;
            Ok(())
        }
        Some(insn) => Err(LoaderError::InvalidInstruction {
            index,
            reason: format!("helper reference on non-call {insn}"),
        }),
        None => Err(LoaderError::InvalidInstruction {
            index,
            reason: "helper reference out of range".to_string(),
        }),
    }
}

fn patch_ld_imm64(image: &mut ProgramImage, index: usize, src_reg: u8, value: u64) -> LoaderResult<()>
{
    let slots = image.insns_mut();
    let Some(first) = slots.get(index).copied().filter(Instruction::is_ld_imm64) else {
        return Err(LoaderError::InvalidInstruction {
            index,
            reason: "expected ld_imm64".to_string(),
        });
    };
    if !slots.get(index + 1).is_some_and(|next| next.code == 0) {
        return Err(LoaderError::InvalidInstruction {
            index,
            reason: "ld_imm64 without its second slot".to_string(),
        });
    }
    let [low, high] = Instruction::ld_imm64(first.dst_reg, src_reg, value);
    slots[index] = low;
    slots[index + 1] = high;
    Ok(())
}
