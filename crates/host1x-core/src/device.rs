//! The device: owns every shared collaborator (GART, sync points, MLOCKs,
//! channels) and exposes the external interfaces — `submit`, context
//! open/close, and the timeout hook an external watchdog would call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::assembler::{self, AssembledMetadata};
use crate::backend::ChannelBackend;
use crate::bo::BoFlags;
use crate::client::Client;
use crate::config::Host1xConfig;
use crate::context::Context;
use crate::error::{Host1xError, Result};
use crate::gart::GartAperture;
use crate::job::Job;
use crate::mlock::MlockRegistry;
use crate::recovery;
use crate::scheduler::{self, Channel, EntityRunner};
use crate::submit::{Pipe, SubmitDescriptor, SubmitResult};
use crate::syncpoint::{SyncPointRegistry, SyncptId};

/// One channel's accepted pipe mask and push-buffer ring size, as handed
/// to [`Device::new`].
pub struct ChannelSpec {
    pub accepted_pipes: Pipe,
    pub ring_capacity_words: usize,
}

/// Owns the whole job-lifecycle subsystem for one simulated host1x
/// instance: the GART aperture, sync-point and MLOCK registries, every
/// channel and its [`EntityRunner`], and the registered clients recovery
/// resets on a hang.
pub struct Device {
    config: Host1xConfig,
    name: &'static str,
    gart: Arc<GartAperture>,
    syncpoints: Arc<SyncPointRegistry>,
    mlocks: Arc<MlockRegistry>,
    channels: Vec<Arc<Channel>>,
    runners: Vec<EntityRunner>,
    backend: Arc<dyn ChannelBackend>,
    clients: RwLock<Vec<Arc<dyn Client>>>,
    /// Holds one handle per in-flight job until its out-fence signals, so a
    /// job is dropped (and its six-step retirement runs) only once both
    /// the out-fence has signalled *and* every other handle (the channel's
    /// entity queue, the caller's own `SubmitResult`) has already let go.
    /// Kept behind its own
    /// `Arc` (rather than borrowing `self`) so the watcher thread spawned
    /// per submit doesn't need the `Device` itself to outlive the call.
    inflight: Arc<Mutex<HashMap<u64, Job>>>,
}

impl Device {
    pub fn new(
        config: Host1xConfig,
        name: &'static str,
        backend: Arc<dyn ChannelBackend>,
        channel_specs: &[ChannelSpec],
    ) -> Result<Arc<Self>> {
        let gart = Arc::new(GartAperture::new(&config));
        let syncpoints = Arc::new(SyncPointRegistry::new(config.num_syncpoints));
        let mlocks = Arc::new(MlockRegistry::new(config.num_mlocks));

        let mut channels = Vec::with_capacity(channel_specs.len());
        let mut runners = Vec::with_capacity(channel_specs.len());
        for (id, spec) in channel_specs.iter().enumerate() {
            let channel = Arc::new(Channel::new(id as u32, spec.accepted_pipes, spec.ring_capacity_words));
            channel.init(backend.as_ref())?;
            runners.push(EntityRunner::new(channel.clone(), syncpoints.clone(), backend.clone()));
            channels.push(channel);
        }

        Ok(Arc::new(Device {
            config,
            name,
            gart,
            syncpoints,
            mlocks,
            channels,
            runners,
            backend,
            clients: RwLock::new(Vec::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    pub fn config(&self) -> &Host1xConfig {
        &self.config
    }

    pub fn gart(&self) -> &Arc<GartAperture> {
        &self.gart
    }

    pub fn syncpoints(&self) -> &Arc<SyncPointRegistry> {
        &self.syncpoints
    }

    pub fn mlocks(&self) -> &Arc<MlockRegistry> {
        &self.mlocks
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn backend(&self) -> &Arc<dyn ChannelBackend> {
        &self.backend
    }

    pub fn register_client(&self, client: Arc<dyn Client>) {
        self.clients.write().push(client);
    }

    pub fn open_context(&self) -> Arc<Context> {
        Context::new()
    }

    /// Allocate a fresh sync point for a caller that is about to assemble a
    /// command buffer — the id must be known before the buffer's own
    /// trailing increment can be authored, so this is split out from
    /// [`Device::submit`] rather than folded into it.
    pub fn reserve_syncpt(&self) -> Result<SyncptId> {
        self.syncpoints.alloc(self.name)
    }

    /// Runs the submission pipeline: map the job's BOs into
    /// GART, assemble and firewall-validate its command buffer, derive its
    /// metadata, pick a channel, and push it. Every step after
    /// [`Device::reserve_syncpt`] unwinds in reverse on failure: an error
    /// here always leaves the sync point freed and every successful GART
    /// mapping undone.
    pub fn submit(&self, ctx: &Arc<Context>, desc: SubmitDescriptor) -> Result<SubmitResult> {
        let syncpt = desc.syncpt;

        let entries: Vec<(crate::bo::Bo, bool)> = desc
            .bo_table
            .iter()
            .map(|e| (e.bo.clone(), e.flags.contains(BoFlags::WRITE)))
            .collect();

        let mapped = match self.gart.job_map(&entries, self.config.security_level) {
            Ok(m) => m,
            Err(Host1xError::TryAgain) => {
                self.gart.wait_for_space(Duration::from_millis(50));
                match self.gart.job_map(&entries, self.config.security_level) {
                    Ok(m) => m,
                    Err(e) => {
                        self.syncpoints.free(syncpt);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.syncpoints.free(syncpt);
                return Err(e);
            }
        };

        let bo_table: Vec<crate::bo::Bo> = desc.bo_table.iter().map(|e| e.bo.clone()).collect();

        let build = (|| -> Result<(Vec<u32>, Vec<u32>, AssembledMetadata)> {
            let mut cmd_buf = Vec::new();
            assembler::copy_user_gathers(&mut cmd_buf, desc.class, &desc.gathers)?;
            assembler::validate_and_patch(&mut cmd_buf, desc.class, &desc.relocs, &bo_table)?;
            let meta = assembler::compute_metadata(&cmd_buf, syncpt)?;
            let init_gathers = assembler::copy_raw_gathers(&desc.init_gathers)?;
            Ok((cmd_buf, init_gathers, meta))
        })();

        let (cmd_buf, init_gathers, meta) = match build {
            Ok(v) => v,
            Err(e) => {
                self.gart.job_unmap(&mapped, false);
                self.syncpoints.free(syncpt);
                return Err(e);
            }
        };

        let job = Job::new(
            ctx.clone(),
            self.syncpoints.clone(),
            self.gart.clone(),
            syncpt,
            desc.class,
            init_gathers,
            cmd_buf,
            mapped,
            meta.pipes,
            meta.num_incrs,
        )?;

        let channel = match scheduler::select_channel(&self.channels, meta.pipes) {
            Ok(ch) => ch,
            Err(e) => return Err(e), // dropping `job` here runs its retirement sequence
        };

        let runner = self
            .runners
            .iter()
            .find(|r| Arc::ptr_eq(&r.channel, channel))
            .expect("every channel has a runner");

        self.inflight.lock().insert(job.id(), job.clone());
        self.track_until_signalled(job.clone());

        log::debug!(
            "submit: job {} on {} channel {} (syncpt {}, {} incrs)",
            job.id(),
            self.name,
            channel.id,
            syncpt,
            meta.num_incrs
        );
        runner.run(job.clone(), &desc.pre_fences)?;

        Ok(SubmitResult { job_id: job.id(), out_fence: job.out_fence() })
    }

    /// Spawns a one-shot watcher that drops this device's `inflight` handle
    /// for `job` once its out-fence resolves (success or error), letting
    /// the job's refcount finally reach zero after the real reason it was
    /// alive — its hardware work completing — rather than the moment its
    /// last caller-side clone happens to go out of scope.
    fn track_until_signalled(&self, job: Job) {
        let fence = job.out_fence();
        let id = job.id();
        drop(job);
        let map = self.inflight.clone();
        std::thread::Builder::new()
            .name("host1x-job-watch".into())
            .spawn(move || {
                let _ = fence.wait();
                map.lock().remove(&id);
            })
            .expect("failed to start job watcher thread");
    }

    /// Invokes the ten-step recovery sequence for `job`,
    /// believed hung on `channel_id`. Standing in for an external watchdog
    /// timer, which this workspace does not model as a running thread —
    /// callers (the CLI's `hang` harness, tests) invoke this directly once
    /// they have decided a job is overdue.
    pub fn handle_timeout(&self, channel_id: u32, job: &Job) -> Result<()> {
        log::warn!("timeout suspected: {} channel {} job {}", self.name, channel_id, job.id());
        let runner = self
            .runners
            .iter()
            .find(|r| r.channel.id == channel_id)
            .ok_or(Host1xError::NoSuitableChannel { pipes: 0 })?;
        let clients = self.clients.read().clone();
        recovery::handle_timeout(runner, job, &self.mlocks, &clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::UserGatherDesc;
    use crate::backend::SimChannelBackend;
    use crate::bo::{Bo, BoFlags};
    use crate::firewall::classes;
    use crate::opcode::{self, Opcode, INCR_SYNCPT_OFFSET};
    use crate::submit::BoTableEntry;

    fn test_device(num_channels: u32) -> Arc<Device> {
        let backend: Arc<dyn ChannelBackend> = Arc::new(SimChannelBackend::new(num_channels));
        let specs: Vec<ChannelSpec> = (0..num_channels)
            .map(|_| ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: 256 })
            .collect();
        Device::new(Host1xConfig::default(), "test", backend, &specs).unwrap()
    }

    fn gather_with_trailing_incr(syncpt: SyncptId) -> UserGatherDesc {
        let bo = Bo::alloc(64, BoFlags::empty(), 0);
        let mut words = Vec::new();
        opcode::encode(&Opcode::Incr { offset: 0x10, count: 1 }, &mut words);
        words.push(0x42);
        opcode::encode(&Opcode::Imm { offset: INCR_SYNCPT_OFFSET, data: syncpt & 0xff }, &mut words);
        bo.write_words(0, &words);
        UserGatherDesc { bo, offset: 0, words: words.len() as u32 }
    }

    #[test]
    fn submit_runs_a_simple_job_to_completion() {
        let device = test_device(1);
        let ctx = device.open_context();
        let syncpt = device.reserve_syncpt().unwrap();
        let gather = gather_with_trailing_incr(syncpt);
        let desc = SubmitDescriptor {
            context_id: ctx.id(),
            syncpt,
            class: classes::GR3D,
            init_gathers: Vec::new(),
            gathers: vec![gather],
            relocs: Vec::new(),
            bo_table: Vec::new(),
            pre_fences: Vec::new(),
        };

        let result = device.submit(&ctx, desc).unwrap();
        assert!(result.out_fence.wait().is_ok());
    }

    #[test]
    fn submit_rejects_when_no_channel_accepts_the_pipe() {
        let backend: Arc<dyn ChannelBackend> = Arc::new(SimChannelBackend::new(1));
        let device = Device::new(
            Host1xConfig::default(),
            "test",
            backend,
            &[ChannelSpec { accepted_pipes: Pipe::VIC, ring_capacity_words: 256 }],
        )
        .unwrap();
        let ctx = device.open_context();
        let syncpt = device.reserve_syncpt().unwrap();
        let gather = gather_with_trailing_incr(syncpt);
        let desc = SubmitDescriptor {
            context_id: ctx.id(),
            syncpt,
            class: classes::GR3D,
            init_gathers: Vec::new(),
            gathers: vec![gather],
            relocs: Vec::new(),
            bo_table: Vec::new(),
            pre_fences: Vec::new(),
        };

        let err = device.submit(&ctx, desc).unwrap_err();
        assert!(matches!(err, Host1xError::NoSuitableChannel { .. }));
    }

    #[test]
    fn submit_maps_bo_table_entries_into_gart() {
        let device = test_device(1);
        let ctx = device.open_context();
        let syncpt = device.reserve_syncpt().unwrap();
        let gather = gather_with_trailing_incr(syncpt);
        let extra_bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let desc = SubmitDescriptor {
            context_id: ctx.id(),
            syncpt,
            class: classes::GR3D,
            init_gathers: Vec::new(),
            gathers: vec![gather],
            relocs: Vec::new(),
            bo_table: vec![BoTableEntry { bo: extra_bo.clone(), flags: BoFlags::empty() }],
            pre_fences: Vec::new(),
        };

        let result = device.submit(&ctx, desc).unwrap();
        assert!(result.out_fence.wait().is_ok());
        assert_ne!(extra_bo.gart_state(), crate::bo::GartState::Unbound);
    }

    #[test]
    fn handle_timeout_recovers_a_stalled_channel() {
        let backend_sim = Arc::new(SimChannelBackend::new(1));
        let backend: Arc<dyn ChannelBackend> = backend_sim.clone();
        let device = Device::new(
            Host1xConfig::default(),
            "test",
            backend,
            &[ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: 256 }],
        )
        .unwrap();
        let ctx = device.open_context();
        let syncpt = device.reserve_syncpt().unwrap();
        let job = crate::job::Job::new(
            ctx.clone(),
            device.syncpoints().clone(),
            device.gart().clone(),
            syncpt,
            classes::GR3D,
            Vec::new(),
            vec![0],
            Vec::new(),
            Pipe::GR3D,
            1,
        )
        .unwrap();

        backend_sim.stall(0);
        device.channels()[0].push_job(&job, device.syncpoints(), device.backend().as_ref()).unwrap();
        assert!(!job.out_fence().is_signalled());

        device.handle_timeout(0, &job).unwrap();
        let err = job.out_fence().wait().unwrap_err();
        assert_eq!(err, Host1xError::TimedOut { channel: 0, elapsed_ms: 0 });
    }

    #[test]
    fn handle_timeout_fails_for_unknown_channel() {
        let device = test_device(1);
        let ctx = device.open_context();
        let syncpt = device.reserve_syncpt().unwrap();
        let job = crate::job::Job::new(
            ctx.clone(),
            device.syncpoints().clone(),
            device.gart().clone(),
            syncpt,
            classes::GR3D,
            Vec::new(),
            vec![0],
            Vec::new(),
            Pipe::GR3D,
            1,
        )
        .unwrap();
        let err = device.handle_timeout(99, &job).unwrap_err();
        assert!(matches!(err, Host1xError::NoSuitableChannel { .. }));
    }
}
