//! Buffer objects: the driver's view of memory a job can reference.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

bitflags! {
    /// Caller-supplied flags on [`Bo::alloc`]/[`Bo::import`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoFlags: u32 {
        /// At least one job will write through this BO; affects how early
        /// in `job_map`'s tiers it gets mapped.
        const WRITE = 1 << 0;
        /// Caller will manage fencing itself; the job lifecycle still maps
        /// the BO but skips adding it to the job's own wait set.
        const EXPLICIT_FENCE = 1 << 1;
        /// Scatter-pin rather than request contiguous DMA memory, even if
        /// contiguous memory is available.
        const FORCE_SCATTER = 1 << 2;
    }
}

/// How a buffer object's pages are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// A single physically contiguous DMA allocation.
    ContiguousDma,
    /// Pages pinned in place but not contiguous; requires an IOMMU to be
    /// used as a GART source.
    Scattered,
    /// A caller-provided external handle taken by reference.
    Imported,
}

/// GART binding state of a buffer object, independent of its backing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GartState {
    Unbound,
    /// Actively bound with the given refcount and aperture address.
    Bound { gart_addr: u64, refcount: u32 },
    /// Mapping retained but unreferenced; eligible for the eviction scan.
    Cached { gart_addr: u64 },
}

struct BoInner {
    id: u64,
    size: usize,
    flags: BoFlags,
    backing: BackingKind,
    /// Physical/DMA address for contiguous BOs; unused for scattered ones.
    dma_addr: u64,
    gart: Mutex<GartState>,
    /// Set while any live job references this BO (spec's "per-job pin bit"
    /// is really one bit per job; we track it as a simple live-job count
    /// since the job lifecycle never needs to ask "which job").
    job_refcount: AtomicU32,
    /// Backing bytes, standing in for the CPU mapping `copy_user_gathers`
    /// reads through — this workspace has no real DMA memory to map.
    content: Mutex<Vec<u8>>,
}

/// A reference-counted handle to one buffer object.
///
/// Cloning a `Bo` is cheap and shares the same underlying allocation —
/// mirrors how userspace handles alias one kernel object.
#[derive(Clone)]
pub struct Bo(Arc<BoInner>);

static NEXT_BO_ID: AtomicU32 = AtomicU32::new(1);

impl Bo {
    /// Allocate contiguous DMA memory, or scatter-pinned pages if
    /// `flags` requests it. `dma_addr` is supplied by the caller in place
    /// of a real allocator, since this crate has no hardware DMA pool.
    pub fn alloc(size: usize, flags: BoFlags, dma_addr: u64) -> Self {
        let backing = if flags.contains(BoFlags::FORCE_SCATTER) {
            BackingKind::Scattered
        } else {
            BackingKind::ContiguousDma
        };
        Bo(Arc::new(BoInner {
            id: NEXT_BO_ID.fetch_add(1, Ordering::Relaxed) as u64,
            size,
            flags,
            backing,
            dma_addr,
            gart: Mutex::new(GartState::Unbound),
            job_refcount: AtomicU32::new(0),
            content: Mutex::new(vec![0u8; size]),
        }))
    }

    /// Take a reference to an externally-provided scatter-table region.
    pub fn import(size: usize, flags: BoFlags) -> Self {
        Bo(Arc::new(BoInner {
            id: NEXT_BO_ID.fetch_add(1, Ordering::Relaxed) as u64,
            size,
            flags,
            backing: BackingKind::Imported,
            dma_addr: 0,
            gart: Mutex::new(GartState::Unbound),
            job_refcount: AtomicU32::new(0),
            content: Mutex::new(vec![0u8; size]),
        }))
    }

    /// Write `words` (little-endian) starting at `byte_offset` into the
    /// BO's backing bytes. Panics if the write would run past `size` —
    /// callers validate bounds against `size` before calling this.
    pub fn write_words(&self, byte_offset: usize, words: &[u32]) {
        let mut content = self.0.content.lock();
        let mut off = byte_offset;
        for w in words {
            content[off..off + 4].copy_from_slice(&w.to_le_bytes());
            off += 4;
        }
    }

    /// Read `count` little-endian words starting at `byte_offset`.
    pub fn read_words(&self, byte_offset: usize, count: usize) -> Vec<u32> {
        let content = self.0.content.lock();
        let mut out = Vec::with_capacity(count);
        let mut off = byte_offset;
        for _ in 0..count {
            out.push(u32::from_le_bytes(content[off..off + 4].try_into().unwrap()));
            off += 4;
        }
        out
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn flags(&self) -> BoFlags {
        self.0.flags
    }

    pub fn backing(&self) -> BackingKind {
        self.0.backing
    }

    pub fn dma_addr(&self) -> u64 {
        self.0.dma_addr
    }

    pub fn is_scattered(&self) -> bool {
        self.0.backing == BackingKind::Scattered
    }

    pub fn gart_state(&self) -> GartState {
        *self.0.gart.lock()
    }

    pub(crate) fn gart_state_mut(&self) -> parking_lot::MutexGuard<'_, GartState> {
        self.0.gart.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.0.job_refcount.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pin(&self) {
        self.0.job_refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.0.job_refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PartialEq for Bo {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Bo {}

impl std::fmt::Debug for Bo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bo")
            .field("id", &self.0.id)
            .field("size", &self.0.size)
            .field("backing", &self.0.backing)
            .field("gart", &*self.0.gart.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_scatter_flag_selects_scattered_backing() {
        let bo = Bo::alloc(4096, BoFlags::FORCE_SCATTER, 0);
        assert_eq!(bo.backing(), BackingKind::Scattered);
        assert!(bo.is_scattered());
    }

    #[test]
    fn default_alloc_is_contiguous() {
        let bo = Bo::alloc(4096, BoFlags::empty(), 0x1000);
        assert_eq!(bo.backing(), BackingKind::ContiguousDma);
        assert_eq!(bo.dma_addr(), 0x1000);
    }

    #[test]
    fn pin_unpin_tracks_busy_state() {
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        assert!(!bo.is_busy());
        bo.pin();
        assert!(bo.is_busy());
        bo.unpin();
        assert!(!bo.is_busy());
    }

    #[test]
    fn clones_share_identity() {
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let bo2 = bo.clone();
        assert_eq!(bo, bo2);
        bo.pin();
        assert!(bo2.is_busy());
    }
}
