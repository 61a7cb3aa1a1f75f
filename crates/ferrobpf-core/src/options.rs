//! # Loader Options
//!
//! Builder-style configuration shared by every program of a load.

use crate::helpers::HelperAvailability;
use crate::reloc::{Policy, PolicyTable, RelocationKind};

/// Configuration for a [`Loader`](crate::loader::Loader).
///
/// ## Example
///
/// ```rust
/// use ferrobpf_core::options::LoaderOptions;
/// use ferrobpf_core::reloc::{Policy, RelocationKind};
///
/// let options = LoaderOptions::new()
///     .with_policy(RelocationKind::EnumValue, Policy::BestEffort)
///     .with_possible_cpus(8);
/// assert_eq!(options.policies().get(RelocationKind::EnumValue), Policy::BestEffort);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions
{
    policies: PolicyTable,
    verify_local_values: bool,
    possible_cpus: u32,
    pointer_size: u32,
    helpers: HelperAvailability,
}

impl Default for LoaderOptions
{
    fn default() -> Self
    {
        Self {
            policies: PolicyTable::default(),
            verify_local_values: true,
            possible_cpus: 1,
            pointer_size: 8,
            helpers: HelperAvailability::all(),
        }
    }
}

impl LoaderOptions
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Defaults with the CPU count read from the running host.
    ///
    /// Falls back to one CPU when the count cannot be read.
    #[must_use]
    pub fn for_host() -> Self
    {
        let cpus = crate::platform::possible_cpus().unwrap_or_else(|err| {
            tracing::warn!("Could not read possible CPUs, assuming 1: {err}");
            1
        });
        Self::default().with_possible_cpus(cpus)
    }

    /// Policy for one relocation class. Records carrying their own policy
    /// still win.
    #[must_use]
    pub fn with_policy(mut self, kind: RelocationKind, policy: Policy) -> Self
    {
        self.policies.set(kind, policy);
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: PolicyTable) -> Self
    {
        self.policies = policies;
        self
    }

    /// Check that each relocated instruction holds the value computed
    /// against the local graph before overwriting it.
    #[must_use]
    pub fn with_verify_local_values(mut self, verify: bool) -> Self
    {
        self.verify_local_values = verify;
        self
    }

    #[must_use]
    pub fn with_possible_cpus(mut self, cpus: u32) -> Self
    {
        self.possible_cpus = cpus.max(1);
        self
    }

    /// Pointer width in bytes used when sizing target types.
    #[must_use]
    pub fn with_pointer_size(mut self, bytes: u32) -> Self
    {
        self.pointer_size = bytes;
        self
    }

    /// Helpers the target implements.
    #[must_use]
    pub fn with_helpers(mut self, helpers: HelperAvailability) -> Self
    {
        self.helpers = helpers;
        self
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyTable
    {
        &self.policies
    }

    #[must_use]
    pub fn verify_local_values(&self) -> bool
    {
        self.verify_local_values
    }

    #[must_use]
    pub fn possible_cpus(&self) -> u32
    {
        self.possible_cpus
    }

    #[must_use]
    pub fn pointer_size(&self) -> u32
    {
        self.pointer_size
    }

    #[must_use]
    pub fn helpers(&self) -> &HelperAvailability
    {
        &self.helpers
    }
}
