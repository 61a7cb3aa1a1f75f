//! Program images and their load state machine.

use std::fmt;

use object::Endianness;

use crate::error::{LoaderError, LoaderResult};
use crate::insn::{encode_all, Instruction};
use crate::reloc::RelocationRecord;

/// Where a program image is in the load pipeline
///
/// ## State Transitions
///
/// - `Raw` → `FieldsPatched`: every relocation was resolved and patched
/// - `FieldsPatched` → `Ready`: every helper call and map reference was bound
/// - `Raw` / `FieldsPatched` → `Failed(reason)`: any fatal error
///
/// `Ready` and `Failed` are terminal. Any other transition is rejected with
/// [`LoaderError::InvalidState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramState
{
    /// Relocations unresolved, helpers unbound
    Raw,
    /// Relocations applied, helpers still symbolic
    FieldsPatched,
    /// Fully prepared for execution
    Ready,
    /// Load aborted; the image must not be used
    Failed(String),
}

impl ProgramState
{
    #[must_use]
    pub fn is_terminal(&self) -> bool
    {
        matches!(self, ProgramState::Ready | ProgramState::Failed(_))
    }

    fn allows(&self, next: &ProgramState) -> bool
    {
        matches!(
            (self, next),
            (ProgramState::Raw, ProgramState::FieldsPatched)
                | (ProgramState::FieldsPatched, ProgramState::Ready)
                | (ProgramState::Raw | ProgramState::FieldsPatched, ProgramState::Failed(_))
        )
    }
}

impl fmt::Display for ProgramState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ProgramState::Raw => write!(f, "raw"),
            ProgramState::FieldsPatched => write!(f, "fields-patched"),
            ProgramState::Ready => write!(f, "ready"),
            ProgramState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// An `ld_imm64` that loads the handle of a named map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReference
{
    pub insn: usize,
    pub map: String,
}

/// How an instruction uses a helper symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind
{
    /// `call` to the helper
    Call,
    /// `ld_imm64` of the helper's address, used as an existence check
    ExistenceProbe,
}

/// An instruction referring to a helper by symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperReference
{
    pub insn: usize,
    pub symbol: String,
    pub kind: ReferenceKind,
}

/// One program's private instruction stream plus the metadata needed to
/// prepare it.
///
/// The instruction stream is only mutated by relocation patching and helper
/// binding, and only while the image is not in a terminal state. Once `Ready`,
/// the stream is identical to the compiled one except for patched operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage
{
    name: String,
    section: String,
    insns: Vec<Instruction>,
    relocations: Vec<RelocationRecord>,
    map_refs: Vec<MapReference>,
    helper_refs: Vec<HelperReference>,
    state: ProgramState,
}

impl ProgramImage
{
    #[must_use]
    pub fn new(name: impl Into<String>, insns: Vec<Instruction>) -> Self
    {
        let name = name.into();
        Self {
            section: name.clone(),
            name,
            insns,
            relocations: Vec::new(),
            map_refs: Vec::new(),
            helper_refs: Vec::new(),
            state: ProgramState::Raw,
        }
    }

    #[must_use]
    pub fn with_section(mut self, section: impl Into<String>) -> Self
    {
        self.section = section.into();
        self
    }

    #[must_use]
    pub fn with_relocation(mut self, record: RelocationRecord) -> Self
    {
        self.relocations.push(record);
        self
    }

    #[must_use]
    pub fn with_map_ref(mut self, insn: usize, map: impl Into<String>) -> Self
    {
        self.map_refs.push(MapReference { insn, map: map.into() });
        self
    }

    #[must_use]
    pub fn with_helper_call(self, insn: usize, symbol: impl Into<String>) -> Self
    {
        self.with_helper_ref(insn, symbol, ReferenceKind::Call)
    }

    #[must_use]
    pub fn with_helper_probe(self, insn: usize, symbol: impl Into<String>) -> Self
    {
        self.with_helper_ref(insn, symbol, ReferenceKind::ExistenceProbe)
    }

    fn with_helper_ref(mut self, insn: usize, symbol: impl Into<String>, kind: ReferenceKind) -> Self
    {
        self.helper_refs.push(HelperReference {
            insn,
            symbol: symbol.into(),
            kind,
        });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// ELF section the program was read from (the name for hand-built images)
    #[must_use]
    pub fn section(&self) -> &str
    {
        &self.section
    }

    #[must_use]
    pub fn insns(&self) -> &[Instruction]
    {
        &self.insns
    }

    #[must_use]
    pub fn relocations(&self) -> &[RelocationRecord]
    {
        &self.relocations
    }

    #[must_use]
    pub fn map_refs(&self) -> &[MapReference]
    {
        &self.map_refs
    }

    #[must_use]
    pub fn helper_refs(&self) -> &[HelperReference]
    {
        &self.helper_refs
    }

    #[must_use]
    pub fn state(&self) -> &ProgramState
    {
        &self.state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool
    {
        self.state == ProgramState::Ready
    }

    /// Serialise the instruction stream.
    #[must_use]
    pub fn to_bytes(&self, endian: Endianness) -> Vec<u8>
    {
        encode_all(&self.insns, endian)
    }

    pub(crate) fn insns_mut(&mut self) -> &mut [Instruction]
    {
        &mut self.insns
    }

    pub(crate) fn mark_fields_patched(&mut self) -> LoaderResult<()>
    {
        self.transition(ProgramState::FieldsPatched)
    }

    pub(crate) fn mark_ready(&mut self) -> LoaderResult<()>
    {
        self.transition(ProgramState::Ready)
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) -> LoaderResult<()>
    {
        self.transition(ProgramState::Failed(reason.into()))
    }

    fn transition(&mut self, next: ProgramState) -> LoaderResult<()>
    {
        if !self.state.allows(&next) {
            return Err(LoaderError::InvalidState {
                program: self.name.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_happy_path_transitions()
    {
        let mut image = ProgramImage::new("prog", vec![Instruction::exit()]);
        assert_eq!(image.state(), &ProgramState::Raw);
        image.mark_fields_patched().unwrap();
        image.mark_ready().unwrap();
        assert!(image.is_ready());
        assert!(image.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final()
    {
        let mut image = ProgramImage::new("prog", vec![]);
        image.mark_failed("boom").unwrap();
        assert!(matches!(image.mark_fields_patched(), Err(LoaderError::InvalidState { .. })));
        assert!(image.mark_failed("again").is_err());
        assert_eq!(image.state(), &ProgramState::Failed("boom".into()));
    }

    #[test]
    fn test_cannot_skip_relocation_stage()
    {
        let mut image = ProgramImage::new("prog", vec![]);
        let err = image.mark_ready().unwrap_err();
        assert_eq!(err.to_string(), "Program `prog` cannot move from raw to ready");
    }
}
