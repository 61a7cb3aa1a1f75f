//! Map creation backends.
//!
//! The [`MapManager`](super::MapManager) decides *what* to create and in
//! which order; a [`MapBackend`] performs the actual creation. The kernel
//! backend lives in [`crate::platform`]; [`InMemoryBackend`] is a
//! deterministic stand-in for hosts without BPF support and for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{MapDefinition, MapHandle};
use crate::error::MapError;

/// Something that can materialise map definitions.
///
/// Implementations must be callable from several loader threads at once.
pub trait MapBackend: Send + Sync
{
    /// Create one map.
    ///
    /// For map-of-maps kinds `inner` is the handle of the already-created
    /// inner map, used as the template for the outer map's values.
    ///
    /// ## Errors
    ///
    /// `MapError::CreateFailed` or `MapError::ResourceExhausted`, naming the
    /// definition.
    fn create(&self, definition: &MapDefinition, inner: Option<MapHandle>) -> Result<MapHandle, MapError>;

    /// Destroy a map previously returned by [`create`](Self::create).
    fn destroy(&self, handle: MapHandle);
}

#[derive(Debug, Default)]
struct InMemoryState
{
    last_id: u32,
    live: BTreeMap<MapHandle, MapDefinition>,
    created: Vec<String>,
    destroyed: Vec<String>,
    failures: HashMap<String, MapError>,
    capacity: Option<usize>,
    delay: Option<Duration>,
}

/// Backend that keeps maps in process memory.
///
/// Handles are issued sequentially from 1, so the same sequence of
/// creations always yields the same handles. Failures can be injected per
/// map name, and a capacity limit simulates resource exhaustion.
#[derive(Debug, Default)]
pub struct InMemoryBackend
{
    state: Mutex<InMemoryState>,
}

impl InMemoryBackend
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Refuse creations once `limit` maps are live.
    #[must_use]
    pub fn with_capacity(self, limit: usize) -> Self
    {
        self.lock().capacity = Some(limit);
        self
    }

    /// Sleep for `delay` inside every creation, widening race windows.
    #[must_use]
    pub fn with_create_delay(self, delay: Duration) -> Self
    {
        self.lock().delay = Some(delay);
        self
    }

    /// Make every creation of the map named `name` fail with `error`.
    pub fn fail_on(&self, name: impl Into<String>, error: MapError)
    {
        self.lock().failures.insert(name.into(), error);
    }

    /// Names of every map created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<String>
    {
        self.lock().created.clone()
    }

    /// Names of every map destroyed so far, in destruction order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String>
    {
        self.lock().destroyed.clone()
    }

    /// Number of maps currently alive.
    #[must_use]
    pub fn live_count(&self) -> usize
    {
        self.lock().live.len()
    }

    /// Definition behind a live handle.
    #[must_use]
    pub fn definition(&self, handle: MapHandle) -> Option<MapDefinition>
    {
        self.lock().live.get(&handle).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MapBackend for InMemoryBackend
{
    fn create(&self, definition: &MapDefinition, inner: Option<MapHandle>) -> Result<MapHandle, MapError>
    {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.get(&definition.name) {
            return Err(error.clone());
        }
        if state.capacity.is_some_and(|limit| state.live.len() >= limit) {
            return Err(MapError::ResourceExhausted {
                name: definition.name.clone(),
            });
        }
        match inner {
            Some(inner) if !state.live.contains_key(&inner) => {
                return Err(MapError::CreateFailed {
                    name: definition.name.clone(),
                    reason: format!("inner map {inner} does not exist"),
                });
            }
            None if definition.kind.is_map_of_maps() => {
                return Err(MapError::CreateFailed {
                    name: definition.name.clone(),
                    reason: "map-of-maps created without an inner map".to_string(),
                });
            }
            _ => {}
        }

        state.last_id += 1;
        let handle = MapHandle::from_raw(state.last_id);
        state.live.insert(handle, definition.clone());
        state.created.push(definition.name.clone());
        Ok(handle)
    }

    fn destroy(&self, handle: MapHandle)
    {
        let mut state = self.lock();
        if let Some(definition) = state.live.remove(&handle) {
            state.destroyed.push(definition.name);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::maps::MapKind;

    #[test]
    fn test_handles_are_sequential()
    {
        let backend = InMemoryBackend::new();
        let def = MapDefinition::new("a", MapKind::Hash, 4, 4, 1);
        assert_eq!(backend.create(&def, None).unwrap().raw(), 1);
        assert_eq!(backend.create(&def, None).unwrap().raw(), 2);
        assert_eq!(backend.live_count(), 2);
    }

    #[test]
    fn test_outer_map_requires_live_inner()
    {
        let backend = InMemoryBackend::new();
        let outer = MapDefinition::new("outer", MapKind::ArrayOfMaps, 4, 4, 1).with_inner("inner");
        assert!(backend.create(&outer, None).is_err());
        assert!(backend.create(&outer, Some(MapHandle::from_raw(7))).is_err());

        let inner = backend
            .create(&MapDefinition::new("inner", MapKind::Array, 4, 8, 1), None)
            .unwrap();
        assert!(backend.create(&outer, Some(inner)).is_ok());
    }

    #[test]
    fn test_capacity_and_injected_failures()
    {
        let backend = InMemoryBackend::new().with_capacity(1);
        let def = MapDefinition::new("a", MapKind::Hash, 4, 4, 1);
        let handle = backend.create(&def, None).unwrap();
        assert_eq!(
            backend.create(&def, None),
            Err(MapError::ResourceExhausted { name: "a".into() })
        );
        backend.destroy(handle);
        assert_eq!(backend.destroyed(), vec!["a".to_string()]);

        backend.fail_on(
            "a",
            MapError::CreateFailed {
                name: "a".into(),
                reason: "EPERM".into(),
            },
        );
        assert!(backend.create(&def, None).is_err());
    }
}
