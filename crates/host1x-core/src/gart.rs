//! GART residency manager (component A, second half): the 32 MB IOMMU
//! aperture, its best-fit allocator, and the eviction cache that lets
//! `gart_unmap` avoid a real IOMMU teardown until space is actually needed.

use parking_lot::{Condvar, Mutex};

use crate::bo::{Bo, GartState};
use crate::config::{Host1xConfig, SecurityLevel};
use crate::error::{Host1xError, Result};

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    start: u64,
    len: u64,
}

struct CacheEntry {
    bo: Bo,
    start: u64,
    len: u64,
}

struct AperturePlan {
    /// Bytes currently free (not bound, not cached).
    free: Vec<FreeRange>,
    /// Bound-but-unreferenced mappings, kept mapped on the chance they get
    /// reused before the next eviction scan needs the space.
    cache: Vec<CacheEntry>,
}

/// Owns the GART address space and the mapping state of every bound BO.
pub struct GartAperture {
    size: u64,
    page_size: u64,
    small_bo_threshold: usize,
    plan: Mutex<AperturePlan>,
    /// Notified whenever `gart_unmap`/`job_unmap` return real bytes to the
    /// free list, so a caller that got `TryAgain` from `job_map` can block
    /// until it is worth retrying.
    space_cond: Condvar,
}

impl GartAperture {
    pub fn new(cfg: &Host1xConfig) -> Self {
        GartAperture {
            size: cfg.gart_aperture_size as u64,
            page_size: cfg.gart_page_size as u64,
            small_bo_threshold: cfg.small_bo_threshold,
            plan: Mutex::new(AperturePlan {
                free: vec![FreeRange { start: 0, len: cfg.gart_aperture_size as u64 }],
                cache: Vec::new(),
            }),
            space_cond: Condvar::new(),
        }
    }

    fn align_up(&self, n: u64) -> u64 {
        let p = self.page_size;
        (n + p - 1) / p * p
    }

    /// Bytes neither bound nor cached.
    pub fn free_bytes(&self) -> u64 {
        self.plan.lock().free.iter().map(|r| r.len).sum()
    }

    /// Bytes held by cached (unreferenced but still-mapped) entries.
    pub fn cached_bytes(&self) -> u64 {
        self.plan.lock().cache.iter().map(|e| e.len).sum()
    }

    pub fn aperture_size(&self) -> u64 {
        self.size
    }

    /// Best-fit placement within the current free list. Regions smaller
    /// than `small_bo_threshold` are placed at the top of whichever free
    /// block they land in; larger ones at the bottom.
    fn try_alloc_locked(&self, plan: &mut AperturePlan, size: u64, small: bool) -> Option<u64> {
        let (idx, range) = plan
            .free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.len >= size)
            .min_by_key(|(_, r)| r.len)
            .map(|(i, r)| (i, *r))?;

        let addr = if small {
            range.start + range.len - size
        } else {
            range.start
        };

        plan.free.remove(idx);
        if small {
            if range.len > size {
                plan.free.push(FreeRange { start: range.start, len: range.len - size });
            }
        } else if range.len > size {
            plan.free.push(FreeRange { start: range.start + size, len: range.len - size });
        }
        Some(addr)
    }

    fn free_range_locked(&self, plan: &mut AperturePlan, start: u64, len: u64) {
        plan.free.push(FreeRange { start, len });
        plan.free.sort_by_key(|r| r.start);
        let mut merged: Vec<FreeRange> = Vec::with_capacity(plan.free.len());
        for r in plan.free.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.start + last.len == r.start {
                    last.len += r.len;
                    continue;
                }
            }
            merged.push(r);
        }
        plan.free = merged;
    }

    /// Evict whole cached entries, in aperture order, until at least
    /// `needed` contiguous-or-not bytes have been returned to the free
    /// list. Evicting a cache entry unmaps it for real (refcount was
    /// already zero) and folds its range back into `free`.
    ///
    /// Only evicts whole entries rather than splitting a victim's head or
    /// tail — real defragmentation isn't needed for correctness, only for
    /// reducing churn, so this crate keeps the simpler all-or-nothing
    /// eviction.
    fn evict_scan_locked(&self, plan: &mut AperturePlan, needed: u64) -> u64 {
        plan.cache.sort_by_key(|e| e.start);
        let mut reclaimed = 0u64;
        let mut i = 0;
        while i < plan.cache.len() && reclaimed < needed {
            let entry = plan.cache.remove(i);
            *entry.bo.gart_state_mut() = GartState::Unbound;
            reclaimed += entry.len;
            self.free_range_locked(plan, entry.start, entry.len);
        }
        reclaimed
    }

    fn flush_all_cache_locked(&self, plan: &mut AperturePlan) {
        for entry in plan.cache.drain(..) {
            *entry.bo.gart_state_mut() = GartState::Unbound;
            plan.free.push(FreeRange { start: entry.start, len: entry.len });
        }
        plan.free.sort_by_key(|r| r.start);
        let merged = {
            let mut m: Vec<FreeRange> = Vec::with_capacity(plan.free.len());
            for r in plan.free.drain(..) {
                if let Some(last) = m.last_mut() {
                    if last.start + last.len == r.start {
                        last.len += r.len;
                        continue;
                    }
                }
                m.push(r);
            }
            m
        };
        plan.free = merged;
    }

    /// Bind `bo` into the aperture, returning its GART address.
    pub fn gart_map(&self, bo: &Bo, mandatory: bool) -> Result<u64> {
        {
            let mut gart = bo.gart_state_mut();
            match *gart {
                GartState::Bound { gart_addr, refcount } => {
                    *gart = GartState::Bound { gart_addr, refcount: refcount + 1 };
                    return Ok(gart_addr);
                }
                GartState::Cached { gart_addr } => {
                    let mut plan = self.plan.lock();
                    if let Some(pos) = plan.cache.iter().position(|e| e.bo == *bo) {
                        plan.cache.remove(pos);
                    }
                    *gart = GartState::Bound { gart_addr, refcount: 1 };
                    return Ok(gart_addr);
                }
                GartState::Unbound => {}
            }
        }

        let size = self.align_up(bo.size() as u64);
        let small = bo.size() < self.small_bo_threshold;
        let mut plan = self.plan.lock();

        if let Some(addr) = self.try_alloc_locked(&mut plan, size, small) {
            *bo.gart_state_mut() = GartState::Bound { gart_addr: addr, refcount: 1 };
            return Ok(addr);
        }

        if !mandatory {
            return Err(Host1xError::TryAgain);
        }

        self.evict_scan_locked(&mut plan, size);
        if let Some(addr) = self.try_alloc_locked(&mut plan, size, small) {
            *bo.gart_state_mut() = GartState::Bound { gart_addr: addr, refcount: 1 };
            return Ok(addr);
        }

        self.flush_all_cache_locked(&mut plan);
        if let Some(addr) = self.try_alloc_locked(&mut plan, size, small) {
            *bo.gart_state_mut() = GartState::Bound { gart_addr: addr, refcount: 1 };
            return Ok(addr);
        }

        let available = plan.free.iter().map(|r| r.len).sum::<u64>() as usize;
        Err(Host1xError::OutOfGartSpace { requested: size as usize, available })
    }

    /// Drop one reference to `bo`'s binding. On reaching zero it moves to
    /// the eviction cache unless `flush_cache` asks for an immediate
    /// teardown.
    pub fn gart_unmap(&self, bo: &Bo, flush_cache: bool) {
        let mut gart = bo.gart_state_mut();
        let (addr, refcount) = match *gart {
            GartState::Bound { gart_addr, refcount } => (gart_addr, refcount),
            _ => return,
        };
        if refcount > 1 {
            *gart = GartState::Bound { gart_addr: addr, refcount: refcount - 1 };
            return;
        }
        if flush_cache {
            *gart = GartState::Unbound;
            drop(gart);
            let mut plan = self.plan.lock();
            self.free_range_locked(&mut plan, addr, self.align_up(bo.size() as u64));
            drop(plan);
            self.space_cond.notify_all();
        } else {
            *gart = GartState::Cached { gart_addr: addr };
            drop(gart);
            self.plan.lock().cache.push(CacheEntry {
                bo: bo.clone(),
                start: addr,
                len: self.align_up(bo.size() as u64),
            });
        }
    }

    /// Job-level mapping entry point. `entries` is
    /// `(bo, is_write)`; returns the BOs this call actually bound so the
    /// caller can unmap them on job retirement, or the original error with
    /// every mapping this call made already undone.
    pub fn job_map(&self, entries: &[(Bo, bool)], security_level: SecurityLevel) -> Result<Vec<Bo>> {
        let mandatory_of = |bo: &Bo| bo.is_scattered() || security_level > 0;

        let mandatory_total: u64 = entries
            .iter()
            .filter(|(bo, _)| mandatory_of(bo))
            .map(|(bo, _)| self.align_up(bo.size() as u64))
            .sum();
        if mandatory_total > self.size {
            return Err(Host1xError::OutOfGartSpace {
                requested: mandatory_total as usize,
                available: self.size as usize,
            });
        }
        // Total fits the aperture, but not right now: every byte the
        // mandatory set needs would have to come from mappings other
        // in-flight jobs currently hold. That's transient — it resolves
        // itself once one of them retires — so signal `TryAgain` rather
        // than spending the per-BO eviction/flush dance below only to
        // land on the same conclusion.
        if mandatory_total > self.free_bytes() + self.cached_bytes() {
            return Err(Host1xError::TryAgain);
        }

        let mut scattered: Vec<&(Bo, bool)> = entries.iter().filter(|(bo, _)| bo.is_scattered()).collect();
        scattered.sort_by_key(|(bo, _)| std::cmp::Reverse(bo.size()));
        let mut writable: Vec<&(Bo, bool)> =
            entries.iter().filter(|(bo, w)| !bo.is_scattered() && *w).collect();
        writable.sort_by_key(|(bo, _)| std::cmp::Reverse(bo.size()));
        let mut read_only: Vec<&(Bo, bool)> =
            entries.iter().filter(|(bo, w)| !bo.is_scattered() && !*w).collect();
        read_only.sort_by_key(|(bo, _)| std::cmp::Reverse(bo.size()));

        let mut mapped: Vec<Bo> = Vec::new();
        for tier in [scattered, writable, read_only] {
            for (bo, _) in tier {
                let mandatory = mandatory_of(bo);
                match self.gart_map(bo, mandatory) {
                    Ok(_) => mapped.push(bo.clone()),
                    Err(Host1xError::TryAgain) if !mandatory => break,
                    Err(e) => {
                        for m in &mapped {
                            self.gart_unmap(m, false);
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(mapped)
    }

    /// Unmap every BO a prior `job_map` bound, on job retirement.
    pub fn job_unmap(&self, bos: &[Bo], flush: bool) {
        for bo in bos {
            self.gart_unmap(bo, flush);
        }
        self.space_cond.notify_all();
    }

    /// Block until another job's `job_unmap` frees real aperture space, or
    /// the timeout elapses. Used by callers that got `TryAgain`.
    pub fn wait_for_space(&self, timeout: std::time::Duration) {
        let mut plan = self.plan.lock();
        self.space_cond.wait_for(&mut plan, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::BoFlags;

    fn aperture(size: usize) -> GartAperture {
        let cfg = Host1xConfig { gart_aperture_size: size, gart_page_size: 4096, ..Default::default() };
        GartAperture::new(&cfg)
    }

    #[test]
    fn map_then_remap_reuses_binding() {
        let g = aperture(1 << 20);
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let a1 = g.gart_map(&bo, true).unwrap();
        let a2 = g.gart_map(&bo, true).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(g.free_bytes(), (1 << 20) - 4096);
    }

    #[test]
    fn unmap_to_zero_refs_moves_to_cache_not_free() {
        let g = aperture(1 << 20);
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        g.gart_map(&bo, true).unwrap();
        g.gart_unmap(&bo, false);
        assert_eq!(g.cached_bytes(), 4096);
        assert_eq!(g.free_bytes(), (1 << 20) - 4096);
        assert!(matches!(bo.gart_state(), GartState::Cached { .. }));
    }

    #[test]
    fn remap_of_cached_entry_reuses_address_without_new_allocation() {
        let g = aperture(1 << 20);
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let addr = g.gart_map(&bo, true).unwrap();
        g.gart_unmap(&bo, false);
        let addr2 = g.gart_map(&bo, true).unwrap();
        assert_eq!(addr, addr2);
        assert_eq!(g.cached_bytes(), 0);
    }

    #[test]
    fn small_bo_placed_at_top_of_aperture() {
        let g = aperture(1 << 20);
        let small = Bo::alloc(4096, BoFlags::empty(), 0); // below 512K threshold
        let addr = g.gart_map(&small, true).unwrap();
        assert_eq!(addr, (1 << 20) - 4096);
    }

    #[test]
    fn large_bo_placed_at_bottom_of_aperture() {
        let g = aperture(1 << 20);
        let big = Bo::alloc(600 * 1024, BoFlags::empty(), 0); // above 512K threshold
        let addr = g.gart_map(&big, true).unwrap();
        assert_eq!(addr, 0);
    }

    #[test]
    fn eviction_scan_reclaims_cached_space_for_mandatory_request() {
        let g = aperture(8192);
        let bo1 = Bo::alloc(4096, BoFlags::empty(), 0);
        let bo2 = Bo::alloc(4096, BoFlags::empty(), 0);
        g.gart_map(&bo1, true).unwrap();
        g.gart_map(&bo2, true).unwrap();
        g.gart_unmap(&bo1, false);
        g.gart_unmap(&bo2, false);
        assert_eq!(g.free_bytes(), 0);
        let bo3 = Bo::alloc(8192, BoFlags::empty(), 0);
        let addr = g.gart_map(&bo3, true).unwrap();
        assert_eq!(addr, 0);
        assert_eq!(g.cached_bytes(), 0);
    }

    #[test]
    fn best_effort_map_returns_try_again_without_flushing_cache() {
        let g = aperture(4096);
        let cached_bo = Bo::alloc(4096, BoFlags::empty(), 0);
        g.gart_map(&cached_bo, true).unwrap();
        g.gart_unmap(&cached_bo, false);
        // Aperture is full of cache, no free bytes; a non-mandatory request
        // for more than fits should fail with TryAgain, cache intact.
        let other = Bo::alloc(8192, BoFlags::empty(), 0);
        let err = g.gart_map(&other, false).unwrap_err();
        assert_eq!(err, Host1xError::TryAgain);
        assert_eq!(g.cached_bytes(), 4096);
    }

    #[test]
    fn job_map_failure_undoes_partial_mappings() {
        let g = aperture(4096);
        let ok_bo = Bo::alloc(2048, BoFlags::empty(), 0);
        let too_big = Bo::alloc(8192, BoFlags::empty(), 0);
        let entries = vec![(ok_bo.clone(), false), (too_big.clone(), false)];
        let err = g.job_map(&entries, 0).unwrap_err();
        assert!(matches!(err, Host1xError::OutOfGartSpace { .. }));
    }

    #[test]
    fn job_map_signals_try_again_when_other_jobs_hold_the_needed_space() {
        let g = aperture(8192);
        // Stands in for another in-flight job's mandatory mapping: bound,
        // not cached, so it isn't reclaimable by eviction.
        let other_job_bo = Bo::alloc(4096, BoFlags::empty(), 0);
        g.gart_map(&other_job_bo, true).unwrap();

        let needed = Bo::alloc(8192, BoFlags::empty(), 0);
        let entries = vec![(needed, false)];
        // security_level > 0 makes every entry mandatory.
        let err = g.job_map(&entries, 1).unwrap_err();
        assert_eq!(err, Host1xError::TryAgain);
    }

    #[test]
    fn job_map_orders_scattered_before_writable_before_readonly() {
        let g = aperture(1 << 20);
        let scattered = Bo::alloc(4096, BoFlags::FORCE_SCATTER, 0);
        let writable = Bo::alloc(4096, BoFlags::WRITE, 0);
        let read_only = Bo::alloc(4096, BoFlags::empty(), 0);
        let entries = vec![
            (read_only.clone(), false),
            (writable.clone(), true),
            (scattered.clone(), false),
        ];
        let mapped = g.job_map(&entries, 0).unwrap();
        assert_eq!(mapped.len(), 3);
        assert!(scattered.gart_state() != GartState::Unbound);
    }
}
