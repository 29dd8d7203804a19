//! Channel scheduler: channel selection by pipe-mask rating,
//! per-context entity ordering, and the six-step job push sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{ChannelBackend, RingRange};
use crate::error::{Host1xError, Result};
use crate::job::Job;
use crate::opcode::{Opcode, INCR_SYNCPT_OFFSET};
use crate::pushbuffer::{PushBuffer, ALIGN_WORDS};
use crate::submit::Pipe;
use crate::syncpoint::SyncPointRegistry;

/// One hardware DMA channel: its push buffer, the set of pipes it
/// accepts, and a record of each in-flight job's command buffer (keyed
/// by job id, which doubles as the synthetic "address" a `RESTART`/
/// `GATHER` targets — there is no real DMA address space to borrow one
/// from in this workspace).
pub struct Channel {
    pub id: u32,
    pub accepted_pipes: Pipe,
    push_buffer: Mutex<PushBuffer>,
    cmdbufs: RwLock<HashMap<u64, Vec<u32>>>,
    /// In-order queue of jobs waiting to be pushed, one per context that
    /// has work here — spec's "per-context scheduler entity."
    entities: Mutex<HashMap<u64, VecDeque<Job>>>,
    running: AtomicBool,
}

impl Channel {
    pub fn new(id: u32, accepted_pipes: Pipe, ring_capacity_words: usize) -> Self {
        Channel {
            id,
            accepted_pipes,
            push_buffer: Mutex::new(PushBuffer::new(ring_capacity_words)),
            cmdbufs: RwLock::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Drop the in-flight command buffer recorded for `job_id` (recovery
    /// step 7, "pop the hung job from the push buffer").
    pub fn drop_cmd_buf(&self, job_id: u64) {
        self.cmdbufs.write().remove(&job_id);
    }

    /// Drain every entity's queue, for recovery step 9's resubmission.
    pub fn drain_pending(&self) -> Vec<Job> {
        let mut entities = self.entities.lock();
        entities.values_mut().flat_map(|q| q.drain(..)).collect()
    }

    pub fn init(&self, backend: &dyn ChannelBackend) -> Result<()> {
        let pb = self.push_buffer.lock();
        let ring = RingRange { start: 0, end: pb.capacity_words() as u64 * 4 };
        backend.init(self.id, ring, pb.put() as u64 * 4)
    }

    /// Enqueue `job` onto its context's in-order entity.
    pub fn enqueue(&self, job: Job) {
        self.entities.lock().entry(job.context().id()).or_default().push_back(job);
    }

    fn pop_next(&self) -> Option<Job> {
        let mut entities = self.entities.lock();
        entities.values_mut().find_map(|q| q.pop_front())
    }

    /// Run the six-step push sequence for `job`, then (if the backend
    /// reports it executed immediately rather than stalling) advance the
    /// sync point and dispatch its fences — this workspace has no real
    /// engine to execute opcodes, so "execution" is simulated as
    /// happening synchronously unless the backend has been told to stall.
    pub fn push_job(
        &self,
        job: &Job,
        syncpt_registry: &SyncPointRegistry,
        backend: &dyn ChannelBackend,
    ) -> Result<()> {
        let mut pb = self.push_buffer.lock();

        // Reserve the whole sequence below as one contiguous block so this
        // job's opcodes never straddle the ring's wraparound point: gathers,
        // SETCLASS, RESTART, the alignment NOPs (worst case ALIGN_WORDS - 1
        // of them), and the trailing sync-point IMM.
        let reserved = job.init_gathers().len() + 2 + (ALIGN_WORDS - 1) + 1;
        pb.prepare(reserved);

        // 1. Optional init-gathers.
        for w in job.init_gathers() {
            pb.push(*w);
        }

        // 2. A plain SETCLASS (the SETSTRMID/SETAPPID hypervisor variant
        //    applies only to SoCs with hypervisor registers, out of scope
        //    for this workspace).
        pb.push_opcode(&Opcode::SetClass { class: job.class(), offset: 0, mask: 0 });

        // 3. RESTART to the job's command buffer.
        self.cmdbufs.write().insert(job.id(), job.cmd_buf().to_vec());
        pb.push_opcode(&Opcode::Restart { addr: job.id() });

        // 4. Alignment NOPs so the return address is ring-granularity
        //    aligned.
        pb.align(ALIGN_WORDS);

        // 6. The extra increment of the job's sync point; the
        //    corresponding WAIT-until-threshold gate is implicit in this
        //    workspace's design (the channel's own push-buffer mutex
        //    already serializes one job's execution against the next),
        //    so no separate WAIT opcode is emitted.
        pb.push_opcode(&Opcode::Imm {
            offset: INCR_SYNCPT_OFFSET,
            data: job.syncpt() & 0xff,
        });

        let put = pb.put() as u64;
        drop(pb);

        backend.submit(self.id, put)?;

        if backend.dmaget(self.id) == put {
            syncpt_registry.set_value(job.syncpt(), job.num_incrs() + 1);
            syncpt_registry.dispatch_status_word(job.syncpt() / 32, 1 << (job.syncpt() % 32));
        }
        Ok(())
    }

    pub fn dmaget(&self, backend: &dyn ChannelBackend) -> u64 {
        backend.dmaget(self.id)
    }

    pub fn push_buffer_words(&self) -> Vec<u32> {
        self.push_buffer.lock().words().to_vec()
    }

    /// Current push-buffer write position, in words — for the debug dumper.
    pub fn put(&self) -> usize {
        self.push_buffer.lock().put()
    }

    /// Logical ring size in words, excluding the reserved `RESTART_W` tail —
    /// for the debug dumper, which must wrap its window the same way `push`
    /// does rather than against the ring's physical word count.
    pub fn capacity_words(&self) -> usize {
        self.push_buffer.lock().capacity_words()
    }

    pub fn cmd_buf_for(&self, job_id: u64) -> Option<Vec<u32>> {
        self.cmdbufs.read().get(&job_id).cloned()
    }
}

/// Picks the best-fitting channel for a job's requested pipe mask.
/// Rating: `64 - popcount(accepted ^ requested)`, considered only among
/// channels whose accepted mask is a superset of requested; highest
/// rating wins, ties broken by list order, short-circuiting at a
/// perfect-match rating of 64.
pub fn select_channel<'a>(channels: &'a [Arc<Channel>], requested: Pipe) -> Result<&'a Arc<Channel>> {
    let mut best: Option<(&Arc<Channel>, u32)> = None;
    for ch in channels {
        if !ch.accepted_pipes.contains(requested) {
            continue;
        }
        let rating = 64 - (ch.accepted_pipes.bits() ^ requested.bits()).count_ones();
        if rating == 64 {
            return Ok(ch);
        }
        if best.map(|(_, r)| rating > r).unwrap_or(true) {
            best = Some((ch, rating));
        }
    }
    best.map(|(ch, _)| ch).ok_or(Host1xError::NoSuitableChannel { pipes: requested.bits() })
}

/// Cooperative driver for one channel's entities, standing in for an
/// external drm-scheduler collaborator.
pub struct EntityRunner {
    pub channel: Arc<Channel>,
    pub syncpt_registry: Arc<SyncPointRegistry>,
    pub backend: Arc<dyn ChannelBackend>,
}

impl EntityRunner {
    pub fn new(
        channel: Arc<Channel>,
        syncpt_registry: Arc<SyncPointRegistry>,
        backend: Arc<dyn ChannelBackend>,
    ) -> Self {
        EntityRunner { channel, syncpt_registry, backend }
    }

    /// Returns the next unresolved pre-fence for `job`, if any, per
    /// spec's `dependency(job)`.
    pub fn dependency(&self, job: &Job, pre_fences: &[crate::syncpoint::Fence]) -> Option<crate::syncpoint::Fence> {
        let _ = job;
        pre_fences.iter().find(|f| !f.is_signalled()).cloned()
    }

    /// Enqueue and, once every pre-fence is resolved, push the job.
    /// Blocks the calling thread on pre-fence resolution — callers that
    /// need non-blocking submission should run this on its own thread.
    pub fn run(&self, job: Job, pre_fences: &[crate::syncpoint::Fence]) -> Result<()> {
        for fence in pre_fences {
            fence.wait()?;
        }
        self.channel.enqueue(job.clone());
        if let Some(next) = self.channel.pop_next() {
            self.channel.push_job(&next, &self.syncpt_registry, self.backend.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimChannelBackend;

    fn channels() -> Vec<Arc<Channel>> {
        vec![
            Arc::new(Channel::new(0, Pipe::GR3D | Pipe::VIC, 256)),
            Arc::new(Channel::new(1, Pipe::GR3D, 256)),
        ]
    }

    #[test]
    fn select_channel_prefers_exact_pipe_match() {
        let chans = channels();
        let picked = select_channel(&chans, Pipe::GR3D).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn select_channel_falls_back_to_superset_channel() {
        let chans = channels();
        let picked = select_channel(&chans, Pipe::GR3D | Pipe::VIC).unwrap();
        assert_eq!(picked.id, 0);
    }

    #[test]
    fn select_channel_fails_when_no_channel_covers_request() {
        let chans = channels();
        let err = select_channel(&chans, Pipe::HOST1X).unwrap_err();
        assert!(matches!(err, Host1xError::NoSuitableChannel { .. }));
    }

    #[test]
    fn push_job_advances_syncpoint_when_backend_not_stalled() {
        let ch = Channel::new(0, Pipe::GR3D, 256);
        let backend = SimChannelBackend::new(1);
        ch.init(&backend).unwrap();
        let syncpt_registry = Arc::new(SyncPointRegistry::new(4));
        let ctx = crate::context::Context::new();
        let sp_registry_for_job = syncpt_registry.clone();
        let syncpt = syncpt_registry.alloc("test").unwrap();
        let gart = Arc::new(crate::gart::GartAperture::new(&crate::config::Host1xConfig::default()));
        let job = crate::job::Job::new(
            ctx,
            sp_registry_for_job,
            gart,
            syncpt,
            crate::firewall::classes::GR3D,
            Vec::new(),
            vec![0],
            Vec::new(),
            Pipe::GR3D,
            1,
        )
        .unwrap();
        let fence = job.out_fence();
        ch.push_job(&job, &syncpt_registry, &backend).unwrap();
        assert!(fence.wait().is_ok());
    }

    #[test]
    fn push_job_does_not_advance_syncpoint_when_stalled() {
        let ch = Channel::new(0, Pipe::GR3D, 256);
        let backend = SimChannelBackend::new(1);
        ch.init(&backend).unwrap();
        let syncpt_registry = Arc::new(SyncPointRegistry::new(4));
        let ctx = crate::context::Context::new();
        let syncpt = syncpt_registry.alloc("test").unwrap();
        let gart = Arc::new(crate::gart::GartAperture::new(&crate::config::Host1xConfig::default()));
        let job = crate::job::Job::new(
            ctx,
            syncpt_registry.clone(),
            gart,
            syncpt,
            crate::firewall::classes::GR3D,
            Vec::new(),
            vec![0],
            Vec::new(),
            Pipe::GR3D,
            1,
        )
        .unwrap();
        backend.stall(0);
        ch.push_job(&job, &syncpt_registry, &backend).unwrap();
        assert!(!job.out_fence().is_signalled());
    }
}
