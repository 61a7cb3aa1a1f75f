//! # Map Lifecycle Manager
//!
//! Creates the maps a load needs, at most once per unique definition, and
//! hands out [`MapHandle`]s for them.
//!
//! ## Creation order
//!
//! Definitions are sorted so every inner map is created before the outer
//! map-of-maps that references it. A cycle in the inner-map relation fails
//! the whole request with [`LoaderError::CyclicMapDependency`].
//!
//! ## Deduplication and sharing
//!
//! Two definitions are the same map when every field matches, including the
//! fully resolved inner definition. Concurrent loads asking for the same map
//! serialise on a per-map creation slot: the first caller creates it, later
//! callers block until the handle is published (or observe the same
//! failure). Every load holds one reference per map; the map is destroyed
//! when the last reference is released.
//!
//! ## Rollback
//!
//! [`MapManager::create_all`] is all-or-nothing: if any map fails, the
//! references already taken by that call are released again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::{MapBackend, MapDefinition, MapHandle, MapKind};
use crate::error::{LoaderError, LoaderResult, MapError};

/// Number of CPUs assumed when the caller does not say otherwise.
pub const DEFAULT_POSSIBLE_CPUS: u32 = 1;

/// Deduplication key: the definition with its inner map resolved recursively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MapIdentity
{
    name: String,
    kind: MapKind,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    inner: Option<Box<MapIdentity>>,
}

impl MapIdentity
{
    fn of(definition: &MapDefinition, inner: Option<&MapIdentity>) -> Self
    {
        Self {
            name: definition.name.clone(),
            kind: definition.kind,
            key_size: definition.key_size,
            value_size: definition.value_size,
            max_entries: definition.max_entries,
            flags: definition.flags,
            inner: inner.map(|inner| Box::new(inner.clone())),
        }
    }
}

#[derive(Debug)]
enum Slot
{
    Creating,
    Ready
    {
        handle: MapHandle, users: usize
    },
    Failed(MapError),
    /// Destroyed after its last user left; callers must start over
    Retired,
}

#[derive(Debug)]
struct CreationSlot
{
    slot: Mutex<Slot>,
    published: Condvar,
}

impl CreationSlot
{
    fn creating() -> Self
    {
        Self {
            slot: Mutex::new(Slot::Creating),
            published: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot>
    {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One map of a [`MapTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry
{
    pub handle: MapHandle,
    /// Definition after validation (defaults filled in)
    pub definition: MapDefinition,
    /// Whether this request issued the creation call
    pub created: bool,
}

/// Name → handle table for one load.
///
/// Holds one reference on every map it lists until passed to
/// [`MapManager::release`].
#[derive(Debug, Default)]
pub struct MapTable
{
    entries: BTreeMap<String, MapEntry>,
    identities: Vec<MapIdentity>,
}

impl MapTable
{
    #[must_use]
    pub fn get(&self, name: &str) -> Option<MapHandle>
    {
        self.entries.get(name).map(|entry| entry.handle)
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&MapEntry>
    {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MapEntry)>
    {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

/// Creates, shares and destroys maps across loads.
pub struct MapManager
{
    backend: Arc<dyn MapBackend>,
    registry: Mutex<HashMap<MapIdentity, Arc<CreationSlot>>>,
    possible_cpus: u32,
}

impl std::fmt::Debug for MapManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("MapManager")
            .field("live", &self.live_count())
            .field("possible_cpus", &self.possible_cpus)
            .finish_non_exhaustive()
    }
}

impl MapManager
{
    #[must_use]
    pub fn new(backend: Arc<dyn MapBackend>) -> Self
    {
        Self {
            backend,
            registry: Mutex::new(HashMap::new()),
            possible_cpus: DEFAULT_POSSIBLE_CPUS,
        }
    }

    /// CPU count used to size perf-event arrays declared with zero entries.
    #[must_use]
    pub fn with_possible_cpus(mut self, cpus: u32) -> Self
    {
        self.possible_cpus = cpus.max(1);
        self
    }

    /// Number of distinct maps currently alive through this manager.
    #[must_use]
    pub fn live_count(&self) -> usize
    {
        self.lock_registry().len()
    }

    /// Create (or join) every map in `definitions`.
    ///
    /// Definitions with the same name must be identical; they collapse into
    /// one entry.
    ///
    /// ## Errors
    ///
    /// - `Map(InvalidDefinition | UnknownInner | ConflictingDefinition)` before
    ///   anything is created
    /// - `CyclicMapDependency` before anything is created
    /// - `Map(CreateFailed | ResourceExhausted)` after rolling back
    pub fn create_all(&self, definitions: &[MapDefinition]) -> LoaderResult<MapTable>
    {
        let unique = self.prepare(definitions)?;
        let order = creation_order(&unique)?;

        let mut table = MapTable::default();
        let mut identities: Vec<Option<MapIdentity>> = vec![None; unique.len()];
        let by_name: HashMap<&str, usize> = unique
            .iter()
            .enumerate()
            .map(|(index, def)| (def.name.as_str(), index))
            .collect();

        for index in order {
            let definition = &unique[index];
            let inner_index = definition.inner.as_deref().and_then(|inner| by_name.get(inner).copied());
            let inner_identity = inner_index.and_then(|inner| identities[inner].as_ref());
            let identity = MapIdentity::of(definition, inner_identity);
            let inner_handle = definition.inner.as_deref().and_then(|inner| table.get(inner));

            match self.acquire(&identity, definition, inner_handle) {
                Ok((handle, created)) => {
                    if created {
                        info!("Created map {definition} as {handle}");
                    } else {
                        debug!("Reusing {handle} for map {}", definition.name);
                    }
                    table.entries.insert(
                        definition.name.clone(),
                        MapEntry {
                            handle,
                            definition: definition.clone(),
                            created,
                        },
                    );
                    table.identities.push(identity.clone());
                    identities[index] = Some(identity);
                }
                Err(err) => {
                    warn!("Map creation failed, rolling back {} map(s): {err}", table.len());
                    self.release(table);
                    return Err(err.into());
                }
            }
        }

        Ok(table)
    }

    /// Drop the references held by `table`, destroying maps no other load
    /// still uses. Inner maps outlive the outer maps that reference them.
    pub fn release(&self, table: MapTable)
    {
        for identity in table.identities.iter().rev() {
            self.release_one(identity);
        }
    }

    fn prepare(&self, definitions: &[MapDefinition]) -> LoaderResult<Vec<MapDefinition>>
    {
        let mut unique: Vec<MapDefinition> = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let validated = definition.validate(self.possible_cpus)?;
            match unique.iter().find(|existing| existing.name == validated.name) {
                Some(existing) if *existing == validated => {}
                Some(_) => {
                    return Err(MapError::ConflictingDefinition {
                        name: validated.name,
                    }
                    .into());
                }
                None => unique.push(validated),
            }
        }

        for definition in &unique {
            if let Some(inner) = &definition.inner {
                if !unique.iter().any(|candidate| candidate.name == *inner) {
                    return Err(MapError::UnknownInner {
                        name: definition.name.clone(),
                        inner: inner.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(unique)
    }

    /// Take one reference on the map for `identity`, creating it if needed.
    /// Returns the handle and whether this call created it.
    fn acquire(
        &self,
        identity: &MapIdentity,
        definition: &MapDefinition,
        inner: Option<MapHandle>,
    ) -> Result<(MapHandle, bool), MapError>
    {
        loop {
            let (entry, creator) = {
                let mut registry = self.lock_registry();
                match registry.get(identity) {
                    Some(entry) => (Arc::clone(entry), false),
                    None => {
                        let entry = Arc::new(CreationSlot::creating());
                        registry.insert(identity.clone(), Arc::clone(&entry));
                        (entry, true)
                    }
                }
            };

            if creator {
                let result = self.backend.create(definition, inner);
                {
                    let mut slot = entry.lock();
                    *slot = match &result {
                        Ok(handle) => Slot::Ready {
                            handle: *handle,
                            users: 1,
                        },
                        Err(err) => Slot::Failed(err.clone()),
                    };
                }
                entry.published.notify_all();
                if result.is_err() {
                    let mut registry = self.lock_registry();
                    if registry.get(identity).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                        registry.remove(identity);
                    }
                }
                return result.map(|handle| (handle, true));
            }

            let mut slot = entry.lock();
            while matches!(*slot, Slot::Creating) {
                slot = entry.published.wait(slot).unwrap_or_else(PoisonError::into_inner);
            }
            match &mut *slot {
                Slot::Ready { handle, users } => {
                    *users += 1;
                    return Ok((*handle, false));
                }
                Slot::Failed(err) => return Err(err.clone()),
                Slot::Retired | Slot::Creating => {}
            }
        }
    }

    fn release_one(&self, identity: &MapIdentity)
    {
        let retired = {
            let mut registry = self.lock_registry();
            let Some(entry) = registry.get(identity).cloned() else {
                return;
            };
            let mut slot = entry.lock();
            let Slot::Ready { handle, users } = &mut *slot else {
                return;
            };
            *users -= 1;
            if *users > 0 {
                return;
            }
            let handle = *handle;
            *slot = Slot::Retired;
            drop(slot);
            registry.remove(identity);
            handle
        };
        debug!("Destroying map {} ({retired})", identity.name);
        self.backend.destroy(retired);
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<MapIdentity, Arc<CreationSlot>>>
    {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark
{
    Unvisited,
    Visiting,
    Done,
}

/// Inner maps first. Ties keep declaration order.
fn creation_order(definitions: &[MapDefinition]) -> LoaderResult<Vec<usize>>
{
    let by_name: HashMap<&str, usize> = definitions
        .iter()
        .enumerate()
        .map(|(index, def)| (def.name.as_str(), index))
        .collect();
    let mut marks = vec![Mark::Unvisited; definitions.len()];
    let mut order = Vec::with_capacity(definitions.len());

    for start in 0..definitions.len() {
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(index) = current {
            match marks[index] {
                Mark::Done => break,
                Mark::Visiting => {
                    let begin = chain.iter().position(|seen| *seen == index).unwrap_or(0);
                    let mut cycle: Vec<String> = chain[begin..]
                        .iter()
                        .map(|seen: &usize| definitions[*seen].name.clone())
                        .collect();
                    cycle.push(definitions[index].name.clone());
                    return Err(LoaderError::CyclicMapDependency { cycle });
                }
                Mark::Unvisited => {
                    marks[index] = Mark::Visiting;
                    chain.push(index);
                    current = definitions[index]
                        .inner
                        .as_deref()
                        .and_then(|inner| by_name.get(inner).copied());
                }
            }
        }
        // Each map has at most one inner map, so the walk is a chain and the
        // reversed chain is a valid creation order.
        for index in chain.into_iter().rev() {
            marks[index] = Mark::Done;
            order.push(index);
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::maps::InMemoryBackend;

    fn manager() -> (Arc<InMemoryBackend>, MapManager)
    {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = MapManager::new(backend.clone());
        (backend, manager)
    }

    #[test]
    fn test_inner_maps_created_first()
    {
        let (backend, manager) = manager();
        let defs = [
            MapDefinition::new("outer", MapKind::HashOfMaps, 8, 4, 4).with_inner("middle"),
            MapDefinition::new("middle", MapKind::ArrayOfMaps, 4, 4, 4).with_inner("leaf"),
            MapDefinition::new("leaf", MapKind::Array, 4, 16, 4),
            MapDefinition::new("solo", MapKind::Hash, 4, 4, 4),
        ];
        let table = manager.create_all(&defs).unwrap();
        assert_eq!(backend.created(), vec!["leaf", "middle", "outer", "solo"]);
        assert_eq!(table.len(), 4);
        assert!(table.entry("outer").unwrap().created);
    }

    #[test]
    fn test_cycle_is_rejected_before_creation()
    {
        let (backend, manager) = manager();
        let defs = [
            MapDefinition::new("a", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("b"),
            MapDefinition::new("b", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("a"),
        ];
        let err = manager.create_all(&defs).unwrap_err();
        match err {
            LoaderError::CyclicMapDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(backend.created().is_empty());

        let selfish = [MapDefinition::new("me", MapKind::HashOfMaps, 4, 4, 1).with_inner("me")];
        assert!(matches!(
            manager.create_all(&selfish),
            Err(LoaderError::CyclicMapDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_inner_and_conflicts()
    {
        let (_, manager) = manager();
        let orphan = [MapDefinition::new("outer", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("ghost")];
        assert!(matches!(
            manager.create_all(&orphan),
            Err(LoaderError::Map(MapError::UnknownInner { .. }))
        ));

        let conflict = [
            MapDefinition::new("m", MapKind::Hash, 4, 4, 1),
            MapDefinition::new("m", MapKind::Hash, 4, 8, 1),
        ];
        assert!(matches!(
            manager.create_all(&conflict),
            Err(LoaderError::Map(MapError::ConflictingDefinition { .. }))
        ));
    }

    #[test]
    fn test_failure_rolls_back_everything()
    {
        let (backend, manager) = manager();
        backend.fail_on(
            "second",
            MapError::CreateFailed {
                name: "second".into(),
                reason: "E2BIG".into(),
            },
        );
        let defs = [
            MapDefinition::new("first", MapKind::Hash, 4, 4, 1),
            MapDefinition::new("second", MapKind::Hash, 4, 4, 1),
        ];
        let err = manager.create_all(&defs).unwrap_err();
        assert!(matches!(err, LoaderError::Map(MapError::CreateFailed { ref name, .. }) if name == "second"));
        assert_eq!(backend.live_count(), 0);
        assert_eq!(backend.destroyed(), vec!["first"]);
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_identical_definitions_share_one_map()
    {
        let (backend, manager) = manager();
        let defs = [MapDefinition::new("shared", MapKind::Hash, 4, 8, 64)];
        let first = manager.create_all(&defs).unwrap();
        let second = manager.create_all(&defs).unwrap();
        assert_eq!(first.get("shared"), second.get("shared"));
        assert!(!second.entry("shared").unwrap().created);
        assert_eq!(backend.created().len(), 1);

        manager.release(first);
        assert_eq!(backend.live_count(), 1);
        manager.release(second);
        assert_eq!(backend.live_count(), 0);
    }

    #[test]
    fn test_inner_definition_is_part_of_identity()
    {
        let (backend, manager) = manager();
        let small = [
            MapDefinition::new("outer", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("inner"),
            MapDefinition::new("inner", MapKind::Array, 4, 8, 1),
        ];
        let large = [
            MapDefinition::new("outer", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("inner"),
            MapDefinition::new("inner", MapKind::Array, 4, 16, 1),
        ];
        let a = manager.create_all(&small).unwrap();
        let b = manager.create_all(&large).unwrap();
        assert_ne!(a.get("outer"), b.get("outer"));
        assert_eq!(backend.created().len(), 4);
    }
}
