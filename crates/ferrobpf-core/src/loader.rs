//! # Loader
//!
//! Drives a [`CompiledObject`] from raw images to `Ready` programs:
//!
//! 1. Create (or join) every map the object declares through the shared
//!    [`MapManager`]. This is all-or-nothing.
//! 2. For each program, on a private copy of its image:
//!    - resolve and patch every relocation against the target graph
//!      (`Raw` → `FieldsPatched`)
//!    - bind helper calls, existence probes and map loads
//!      (`FieldsPatched` → `Ready`)
//! 3. Return the ready images, the map table and a per-program report.
//!
//! Any fatal error marks the program `Failed`, releases the object's maps
//! and is returned as [`LoaderError::ProgramFailed`] naming the program and
//! the stage and carrying the failed image. An object never loads partially.
//!
//! ## Concurrency
//!
//! A [`Loader`] is `Sync`. [`Loader::load_all`] prepares several objects on
//! scoped worker threads; maps they have in common are created once by the
//! manager and shared.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use ferrobpf_core::btf::TypeGraph;
//! use ferrobpf_core::insn::Instruction;
//! use ferrobpf_core::loader::Loader;
//! use ferrobpf_core::maps::InMemoryBackend;
//! use ferrobpf_core::object_file::CompiledObject;
//! use ferrobpf_core::options::LoaderOptions;
//! use ferrobpf_core::program::ProgramImage;
//!
//! let loader = Loader::new(TypeGraph::empty(), Arc::new(InMemoryBackend::new()), LoaderOptions::new());
//! let object = CompiledObject::new(TypeGraph::empty())
//!     .with_program(ProgramImage::new("noop", vec![Instruction::mov64_imm(0, 0), Instruction::exit()]));
//!
//! let loaded = loader.load(&object)?;
//! assert!(loaded.program("noop").is_some_and(|program| program.is_ready()));
//! loader.unload(loaded);
//! # Ok::<(), ferrobpf_core::error::LoaderError>(())
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::btf::TypeGraph;
use crate::error::{LoaderError, LoaderResult};
use crate::helpers::{bind, BindReport};
use crate::maps::{MapBackend, MapHandle, MapManager, MapTable};
use crate::object_file::CompiledObject;
use crate::options::LoaderOptions;
use crate::program::ProgramImage;
use crate::reloc::{relocate_program, RelocationOutcome};

/// What happened to one program during a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramReport
{
    pub program: String,
    /// One outcome per relocation, in instruction order
    pub relocations: Vec<RelocationOutcome>,
    pub binding: BindReport,
}

impl ProgramReport
{
    /// Relocations that fell back to a best-effort sentinel.
    pub fn defaulted(&self) -> impl Iterator<Item = &RelocationOutcome>
    {
        self.relocations.iter().filter(|outcome| outcome.is_defaulted())
    }

    /// Outcome of the relocation patching `insn`.
    #[must_use]
    pub fn relocation_at(&self, insn: usize) -> Option<&RelocationOutcome>
    {
        self.relocations.iter().find(|outcome| outcome.insn == insn)
    }
}

/// A fully loaded object.
///
/// Holds a reference on every map in [`LoadedObject::maps`] until passed to
/// [`Loader::unload`].
#[derive(Debug)]
pub struct LoadedObject
{
    programs: Vec<ProgramImage>,
    maps: MapTable,
    reports: Vec<ProgramReport>,
}

impl LoadedObject
{
    /// Ready images, in section order.
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
    pub fn maps(&self) -> &MapTable
    {
        &self.maps
    }

    #[must_use]
    pub fn map(&self, name: &str) -> Option<MapHandle>
    {
        self.maps.get(name)
    }

    #[must_use]
    pub fn reports(&self) -> &[ProgramReport]
    {
        &self.reports
    }

    #[must_use]
    pub fn report(&self, program: &str) -> Option<&ProgramReport>
    {
        self.reports.iter().find(|report| report.program == program)
    }

    /// Helper name → call id across every program, for dispatch by the
    /// execution environment.
    #[must_use]
    pub fn call_ids(&self) -> BTreeMap<&str, u32>
    {
        self.reports
            .iter()
            .flat_map(|report| report.binding.call_ids())
            .collect()
    }
}

/// Loads compiled objects against one target environment.
#[derive(Debug)]
pub struct Loader
{
    target: TypeGraph,
    maps: Arc<MapManager>,
    options: LoaderOptions,
}

impl Loader
{
    /// Loader with its own map manager on top of `backend`.
    #[must_use]
    pub fn new(target: TypeGraph, backend: Arc<dyn MapBackend>, options: LoaderOptions) -> Self
    {
        let manager = MapManager::new(backend).with_possible_cpus(options.possible_cpus());
        Self::with_manager(target, Arc::new(manager), options)
    }

    /// Loader sharing an existing map manager, so maps are deduplicated
    /// against other loaders using it.
    #[must_use]
    pub fn with_manager(target: TypeGraph, maps: Arc<MapManager>, options: LoaderOptions) -> Self
    {
        Self {
            target: target.with_pointer_size(options.pointer_size()),
            maps,
            options,
        }
    }

    #[must_use]
    pub fn target(&self) -> &TypeGraph
    {
        &self.target
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<MapManager>
    {
        &self.maps
    }

    #[must_use]
    pub fn options(&self) -> &LoaderOptions
    {
        &self.options
    }

    /// Load every program of `object`.
    ///
    /// ## Errors
    ///
    /// - Map errors (`Map`, `CyclicMapDependency`) as returned by
    ///   [`MapManager::create_all`]
    /// - `ProgramFailed` wrapping the first fatal relocation or binding error
    pub fn load(&self, object: &CompiledObject) -> LoaderResult<LoadedObject>
    {
        let maps = self.maps.create_all(object.maps())?;

        let mut programs = Vec::with_capacity(object.programs().len());
        let mut reports = Vec::with_capacity(object.programs().len());
        for image in object.programs() {
            match self.load_program(object, image, &maps) {
                Ok((program, report)) => {
                    programs.push(program);
                    reports.push(report);
                }
                Err(err) => {
                    warn!("{err}; releasing {} map(s)", maps.len());
                    self.maps.release(maps);
                    return Err(err);
                }
            }
        }

        info!("Loaded {} program(s) with {} map(s)", programs.len(), maps.len());
        Ok(LoadedObject {
            programs,
            maps,
            reports,
        })
    }

    /// Load several objects concurrently, one worker thread each.
    ///
    /// Results are returned in input order; one object failing does not
    /// affect the others.
    pub fn load_all(&self, objects: &[CompiledObject]) -> Vec<LoaderResult<LoadedObject>>
    {
        std::thread::scope(|scope| {
            let workers: Vec<_> = objects
                .iter()
                .map(|object| scope.spawn(move || self.load(object)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    /// Release the maps held by a loaded object.
    pub fn unload(&self, loaded: LoadedObject)
    {
        info!("Unloading {} program(s)", loaded.programs.len());
        self.maps.release(loaded.maps);
    }

    fn load_program(
        &self,
        object: &CompiledObject,
        image: &ProgramImage,
        maps: &MapTable,
    ) -> LoaderResult<(ProgramImage, ProgramReport)>
    {
        let span = info_span!("load_program", program = image.name());
        let _guard = span.enter();

        let mut program = image.clone();
        let records = program.relocations().to_vec();
        let relocations = relocate_program(
            &mut program,
            &records,
            object.btf(),
            &self.target,
            self.options.policies(),
            self.options.verify_local_values(),
        )
        .and_then(|outcomes| program.mark_fields_patched().map(|()| outcomes))
        .map_err(|err| fail(&mut program, "relocation", err))?;

        let binding = bind(&mut program, object.helpers(), self.options.helpers(), maps)
            .map_err(|err| fail(&mut program, "binding", err))?;

        info!(
            "Program ready: {} relocation(s), {} defaulted, {} helper(s)",
            relocations.len(),
            relocations.iter().filter(|outcome| outcome.is_defaulted()).count(),
            binding.helpers.len()
        );
        let report = ProgramReport {
            program: program.name().to_string(),
            relocations,
            binding,
        };
        Ok((program, report))
    }
}

fn fail(program: &mut ProgramImage, stage: &'static str, err: LoaderError) -> LoaderError
{
    if let Err(state) = program.mark_failed(err.to_string()) {
        warn!("{state}");
    }
    LoaderError::ProgramFailed {
        program: program.name().to_string(),
        stage,
        image: Box::new(program.clone()),
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::btf::{Member, TypeGraphBuilder};
    use crate::helpers::{DeclaredHelper, HelperAvailability};
    use crate::insn::{Instruction, BPF_MEM, BPF_W, BPF_LDX};
    use crate::maps::{InMemoryBackend, MapDefinition, MapKind};
    use crate::program::ProgramState;
    use crate::reloc::{RelocationKind, RelocationRecord};

    fn task_graph(offset: u32) -> TypeGraph
    {
        let mut builder = TypeGraphBuilder::new();
        let int = builder.int("int", 4, true);
        builder.struct_type(
            Some("task"),
            16,
            vec![Member::new("flags", int, 0), Member::new("pid", int, offset * 8)],
        );
        builder.build().unwrap()
    }

    fn pid_program() -> ProgramImage
    {
        let load = Instruction::new(BPF_LDX | BPF_MEM | BPF_W, 0, 1, 4, 0);
        ProgramImage::new("read_pid", vec![load, Instruction::exit()]).with_relocation(
            RelocationRecord::parse(0, RelocationKind::FieldOffset, crate::btf::TypeId::new(2), "pid").unwrap(),
        )
    }

    #[test]
    fn test_relocation_failure_releases_maps()
    {
        let backend = Arc::new(InMemoryBackend::new());
        let mut builder = TypeGraphBuilder::new();
        builder.int("int", 4, true);
        let target = builder.build().unwrap();
        let loader = Loader::new(target, backend.clone(), LoaderOptions::new());

        let object = CompiledObject::new(task_graph(4))
            .with_map(MapDefinition::new("counts", MapKind::Hash, 4, 8, 64))
            .with_program(pid_program());

        let err = loader.load(&object).unwrap_err();
        match &err {
            LoaderError::ProgramFailed { program, stage, .. } => {
                assert_eq!(program, "read_pid");
                assert_eq!(*stage, "relocation");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root_cause(), LoaderError::NoMatch { insn: 0, .. }));
        let image = err.failed_image().unwrap();
        assert_eq!(image.name(), "read_pid");
        assert!(matches!(image.state(), ProgramState::Failed(reason) if reason.contains("task")));
        assert!(!image.is_ready());
        assert_eq!(backend.live_count(), 0);
        assert_eq!(backend.destroyed(), vec!["counts".to_string()]);
    }

    #[test]
    fn test_binding_failure_reports_stage()
    {
        let loader = Loader::new(
            task_graph(8),
            Arc::new(InMemoryBackend::new()),
            LoaderOptions::new().with_helpers(HelperAvailability::all().without("bpf_ktime_get_ns")),
        );
        let object = CompiledObject::new(task_graph(4))
            .with_program(pid_program().with_helper_call(1, "bpf_ktime_get_ns"))
            .with_helper(DeclaredHelper::strong("bpf_ktime_get_ns"));

        let err = loader.load(&object).unwrap_err();
        assert!(matches!(err, LoaderError::ProgramFailed { stage: "binding", .. }));
        assert!(matches!(err.root_cause(), LoaderError::UnboundHelper { .. }));
    }

    #[test]
    fn test_load_reports_outcomes()
    {
        let loader = Loader::new(task_graph(8), Arc::new(InMemoryBackend::new()), LoaderOptions::new());
        let object = CompiledObject::new(task_graph(4)).with_program(pid_program());

        let loaded = loader.load(&object).unwrap();
        let report = loaded.report("read_pid").unwrap();
        assert_eq!(report.relocation_at(0).map(RelocationOutcome::value), Some(8));
        assert_eq!(report.defaulted().count(), 0);
        assert_eq!(loaded.program("read_pid").unwrap().insns()[0].off, 8);
        loader.unload(loaded);
    }
}
