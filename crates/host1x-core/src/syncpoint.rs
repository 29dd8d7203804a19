//! Sync-point manager (component B): 32-bit saturating counters, the
//! fences attached to their threshold values, and threshold-interrupt
//! dispatch.
//!
//! The fence list for every sync point sits behind one registry-wide
//! lock, also briefly held by the interrupt handler — the dispatch path
//! below only ever locks it to drain already-allocated state, never to
//! allocate.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Host1xError, Result};

/// Identifies one sync-point counter.
pub type SyncptId = u32;

/// Compares `cur` against threshold `thr` modulo 2^32, wrapping at ±2^31.
pub fn expired(cur: u32, thr: u32) -> bool {
    (cur.wrapping_sub(thr) as i32) >= 0
}

#[derive(Debug)]
struct FenceState {
    done: bool,
    error: Option<Host1xError>,
}

struct FenceInner {
    syncpt: SyncptId,
    threshold: u32,
    state: Mutex<FenceState>,
    condvar: Condvar,
}

/// A one-shot future that signals when its sync point reaches `threshold`.
///
/// Once signalled (or cancelled with an error) a fence is immutable — every
/// mutating method below is a no-op past the first signal/cancel.
#[derive(Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    fn new(syncpt: SyncptId, threshold: u32) -> Self {
        Fence(Arc::new(FenceInner {
            syncpt,
            threshold,
            state: Mutex::new(FenceState { done: false, error: None }),
            condvar: Condvar::new(),
        }))
    }

    pub fn syncpt(&self) -> SyncptId {
        self.0.syncpt
    }

    pub fn threshold(&self) -> u32 {
        self.0.threshold
    }

    pub fn is_signalled(&self) -> bool {
        self.0.state.lock().done
    }

    /// Mark this fence complete with success. No-op if already done.
    fn signal(&self) {
        let mut st = self.0.state.lock();
        if st.done {
            return;
        }
        st.done = true;
        self.0.condvar.notify_all();
    }

    /// Mark this fence complete with an error. No-op if already done.
    fn cancel(&self, err: Host1xError) {
        let mut st = self.0.state.lock();
        if st.done {
            return;
        }
        st.done = true;
        st.error = Some(err);
        self.0.condvar.notify_all();
    }

    /// Block until signalled or cancelled, returning the terminal result.
    pub fn wait(&self) -> Result<()> {
        let mut st = self.0.state.lock();
        while !st.done {
            self.0.condvar.wait(&mut st);
        }
        match &st.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Error this fence ended with, if it has completed.
    pub fn error(&self) -> Option<Host1xError> {
        self.0.state.lock().error.clone()
    }
}

struct SyncPointState {
    value: u32,
    threshold: u32,
    interrupt_armed: bool,
    active: bool,
    fences: Vec<Fence>,
    device_name: &'static str,
}

impl SyncPointState {
    fn fresh(device_name: &'static str) -> Self {
        SyncPointState {
            value: 0,
            threshold: 1,
            interrupt_armed: false,
            active: false,
            fences: Vec::new(),
            device_name,
        }
    }

    fn is_idle(&self) -> bool {
        self.fences.is_empty() && self.value == self.threshold
    }
}

/// Point-in-time view of one sync point, for the debug dumper.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SyncPointSnapshot {
    pub id: SyncptId,
    pub value: u32,
    pub threshold: u32,
    pub interrupt_armed: bool,
    pub num_fences: usize,
    pub device_name: &'static str,
}

/// Owns every sync-point counter on a device. Passed by reference to every
/// component that needs one (spec design note: no global mutable registry).
pub struct SyncPointRegistry {
    slots: Mutex<Vec<Option<SyncPointState>>>,
    free: Mutex<VecDeque<SyncptId>>,
    free_cond: Condvar,
    shutdown: Mutex<bool>,
}

impl SyncPointRegistry {
    pub fn new(count: u32) -> Self {
        let slots = Mutex::new((0..count).map(|_| None).collect());
        let free = Mutex::new((0..count).collect());
        SyncPointRegistry {
            slots,
            free,
            free_cond: Condvar::new(),
            shutdown: Mutex::new(false),
        }
    }

    /// Release every blocked [`Self::alloc`] caller with `Interrupted`,
    /// used during device shutdown.
    pub fn shutdown(&self) {
        *self.shutdown.lock() = true;
        self.free_cond.notify_all();
    }

    /// Allocate a fresh sync point (value=0, threshold=1, interrupt
    /// disabled). Blocks interruptibly when none are free.
    pub fn alloc(&self, device_name: &'static str) -> Result<SyncptId> {
        let mut free = self.free.lock();
        loop {
            if let Some(id) = free.pop_front() {
                self.slots.lock()[id as usize] = Some(SyncPointState::fresh(device_name));
                return Ok(id);
            }
            if *self.shutdown.lock() {
                return Err(Host1xError::Interrupted);
            }
            self.free_cond.wait(&mut free);
        }
    }

    /// Release a sync point. If its fence list is non-empty (should not
    /// normally happen) every fence is cancelled with `Cancelled` first.
    pub fn free(&self, id: SyncptId) {
        let mut slots = self.slots.lock();
        if let Some(mut sp) = slots[id as usize].take() {
            for fence in sp.fences.drain(..) {
                fence.cancel(Host1xError::Cancelled);
            }
        }
        drop(slots);
        self.free.lock().push_back(id);
        self.free_cond.notify_one();
    }

    pub fn set_value(&self, id: SyncptId, v: u32) {
        let mut slots = self.slots.lock();
        if let Some(sp) = slots[id as usize].as_mut() {
            sp.value = v;
        }
    }

    pub fn value(&self, id: SyncptId) -> u32 {
        self.slots.lock()[id as usize].as_ref().map(|s| s.value).unwrap_or(0)
    }

    pub fn set_threshold(&self, id: SyncptId, t: u32) {
        let mut slots = self.slots.lock();
        if let Some(sp) = slots[id as usize].as_mut() {
            sp.threshold = t;
        }
    }

    pub fn set_interrupt(&self, id: SyncptId, on: bool) {
        let mut slots = self.slots.lock();
        if let Some(sp) = slots[id as usize].as_mut() {
            sp.interrupt_armed = on;
        }
    }

    /// Attach a new fence at `threshold`, inserted so the fence list stays
    /// non-decreasing in threshold, arming the interrupt if needed.
    pub fn create_fence(&self, id: SyncptId, threshold: u32) -> Fence {
        let fence = Fence::new(id, threshold);
        let mut slots = self.slots.lock();
        let sp = slots[id as usize].as_mut().expect("create_fence on freed syncpoint");
        let pos = sp.fences.partition_point(|f| f.threshold() <= threshold);
        sp.fences.insert(pos, fence.clone());
        sp.interrupt_armed = true;
        sp.active = true;
        fence
    }

    /// Remove every attached fence without signalling them (used when a
    /// channel is reset). Returns the detached fences so the
    /// caller can resubmit or drop them.
    pub fn detach_fences(&self, id: SyncptId) -> Vec<Fence> {
        let mut slots = self.slots.lock();
        if let Some(sp) = slots[id as usize].as_mut() {
            std::mem::take(&mut sp.fences)
        } else {
            Vec::new()
        }
    }

    /// Reset to a fresh state and cancel every remaining fence with `err`.
    pub fn reset(&self, id: SyncptId, err: Host1xError) {
        let mut slots = self.slots.lock();
        if let Some(sp) = slots[id as usize].as_mut() {
            sp.value = 0;
            sp.threshold = 1;
            sp.interrupt_armed = false;
            sp.active = false;
            let fences = std::mem::take(&mut sp.fences);
            drop(slots);
            for fence in fences {
                fence.cancel(err.clone());
            }
        }
    }

    pub fn is_idle(&self, id: SyncptId) -> bool {
        self.slots.lock()[id as usize].as_ref().map(|s| s.is_idle()).unwrap_or(true)
    }

    /// Dispatch one 32-bit hardware interrupt-status word covering
    /// sync points `[base, base+32)`. Returns the bitmask of sync points
    /// actually acted on, for the caller to acknowledge to hardware.
    ///
    /// Never allocates beyond what the already-populated fence lists need
    /// to shrink (`Vec::retain`/`drain` reuse existing storage), per the
    /// "IRQ handler must not allocate" design note.
    pub fn dispatch_status_word(&self, base: u32, status: u32) -> u32 {
        let mut handled = 0u32;
        let mut slots = self.slots.lock();
        for bit in 0..32u32 {
            if status & (1 << bit) == 0 {
                continue;
            }
            let id = base + bit;
            if id as usize >= slots.len() {
                continue;
            }
            let Some(sp) = slots[id as usize].as_mut() else {
                continue;
            };
            if sp.fences.is_empty() {
                continue;
            }
            let to_signal: Vec<Fence> = if sp.fences.len() == 1 {
                std::mem::take(&mut sp.fences)
            } else {
                let cur = sp.value;
                let (expired_fences, remaining): (Vec<_>, Vec<_>) =
                    sp.fences.drain(..).partition(|f| expired(cur, f.threshold()));
                sp.fences = remaining;
                expired_fences
            };
            if !to_signal.is_empty() {
                handled |= 1 << bit;
            }
            if sp.fences.is_empty() {
                sp.interrupt_armed = false;
                sp.active = false;
            }
            drop(slots);
            for fence in &to_signal {
                fence.signal();
            }
            slots = self.slots.lock();
        }
        handled
    }

    pub fn snapshot(&self, id: SyncptId) -> Option<SyncPointSnapshot> {
        self.slots.lock()[id as usize].as_ref().map(|sp| SyncPointSnapshot {
            id,
            value: sp.value,
            threshold: sp.threshold,
            interrupt_armed: sp.interrupt_armed,
            num_fences: sp.fences.len(),
            device_name: sp.device_name,
        })
    }

    pub fn snapshot_all(&self) -> Vec<SyncPointSnapshot> {
        let slots = self.slots.lock();
        (0..slots.len() as u32)
            .filter_map(|id| {
                slots[id as usize].as_ref().map(|sp| SyncPointSnapshot {
                    id,
                    value: sp.value,
                    threshold: sp.threshold,
                    interrupt_armed: sp.interrupt_armed,
                    num_fences: sp.fences.len(),
                    device_name: sp.device_name,
                })
            })
            .collect()
    }
}
