//! Device-wide tunables.
//!
//! A plain struct with a `Default` impl, constructed by the CLI from
//! flags or by a server from env vars, rather than a config file format
//! — there is no persisted state to load one from.

use std::time::Duration;

/// Security level for GART mapping. Levels 0-6; higher levels
/// trade aperture churn for stronger isolation. The level never changes
/// correctness, only which BO categories are mandatory vs. best-effort.
pub type SecurityLevel = u8;

/// Highest defined security level.
pub const MAX_SECURITY_LEVEL: SecurityLevel = 6;

/// Device-wide configuration for a [`crate::device::Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host1xConfig {
    /// Total size of the GART aperture in bytes.
    pub gart_aperture_size: usize,
    /// IOMMU (or pretend-IOMMU) page size in bytes; governs mapping alignment.
    pub gart_page_size: usize,
    /// Number of hardware channels to instantiate.
    pub num_channels: u32,
    /// Number of sync-point counters available for allocation.
    pub num_syncpoints: u32,
    /// Number of MLOCKs available for arbitration.
    pub num_mlocks: u32,
    /// Per-entity hang-detection timeout.
    pub entity_timeout: Duration,
    /// GART mapping security level, 0-6.
    pub security_level: SecurityLevel,
    /// BOs smaller than this are placed at the top of the aperture
    /// (best-fit small-first/high-placement heuristic).
    pub small_bo_threshold: usize,
}

impl Default for Host1xConfig {
    fn default() -> Self {
        Self {
            gart_aperture_size: 32 * 1024 * 1024,
            gart_page_size: 4096,
            num_channels: 4,
            num_syncpoints: 32,
            num_mlocks: 16,
            entity_timeout: Duration::from_millis(600),
            security_level: 0,
            small_bo_threshold: 512 * 1024,
        }
    }
}
