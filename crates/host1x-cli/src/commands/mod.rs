pub mod bench;
pub mod dump;
pub mod hang;
pub mod serve;
pub mod submit;

use std::sync::Arc;

use host1x_core::assembler::UserGatherDesc;
use host1x_core::backend::{ChannelBackend, SimChannelBackend};
use host1x_core::bo::{Bo, BoFlags};
use host1x_core::config::Host1xConfig;
use host1x_core::device::{ChannelSpec, Device};
use host1x_core::firewall::classes;
use host1x_core::opcode::{self, Opcode, INCR_SYNCPT_OFFSET};
use host1x_core::submit::{Pipe, SubmitDescriptor};
use host1x_core::syncpoint::SyncptId;

/// Build a device with a single GR3D channel of `ring_words` words — the
/// harness's stand-in for a real Tegra SoC's single channel backend.
pub fn single_channel_device(ring_words: usize) -> Arc<Device> {
    let backend: Arc<dyn ChannelBackend> = Arc::new(SimChannelBackend::new(1));
    Device::new(
        Host1xConfig::default(),
        "host1x-ctl",
        backend,
        &[ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: ring_words }],
    )
    .expect("device construction with a single channel never fails")
}

/// A one-word GR3D gather that increments `syncpt` once. Good enough to
/// drive a job to completion without a real engine behind it.
pub fn trivial_gather(syncpt: SyncptId) -> UserGatherDesc {
    let bo = Bo::alloc(64, BoFlags::empty(), 0);
    let mut words = Vec::new();
    opcode::encode(&Opcode::Incr { offset: 0x10, count: 1 }, &mut words);
    words.push(0x42);
    opcode::encode(&Opcode::Imm { offset: INCR_SYNCPT_OFFSET, data: syncpt & 0xff }, &mut words);
    bo.write_words(0, &words);
    UserGatherDesc { bo, offset: 0, words: words.len() as u32 }
}

pub fn submit_one(device: &Device, ctx: &Arc<host1x_core::Context>) -> host1x_core::Result<u64> {
    let syncpt = device.reserve_syncpt()?;
    let gather = trivial_gather(syncpt);
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
    let result = device.submit(ctx, desc)?;
    result.out_fence.wait()?;
    Ok(result.job_id)
}
