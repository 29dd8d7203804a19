//! Timeout & recovery path: resets a hung channel, tears
//! fences down with an error, and restarts the scheduler.

use std::sync::Arc;

use crate::backend::ChannelBackend;
use crate::client::Client;
use crate::error::{Host1xError, Result};
use crate::job::Job;
use crate::mlock::MlockRegistry;
use crate::scheduler::{Channel, EntityRunner};
use crate::syncpoint::SyncPointRegistry;

/// Runs the ten-step recovery sequence for `job`, which is suspected
/// hung on `channel`. Returns `Ok(())` once the channel is usable again
/// (whether or not the job actually turned out to be hung — step 2's
/// race check may find it already completed).
pub fn handle_timeout(
    runner: &EntityRunner,
    job: &Job,
    mlocks: &MlockRegistry,
    clients: &[Arc<dyn Client>],
) -> Result<()> {
    let channel = &runner.channel;
    let backend = runner.backend.as_ref();
    let syncpt_registry = &runner.syncpt_registry;

    // 1. Stop the scheduler for this channel.
    channel.stop();

    // 2. Recheck: if the hardware fence was in fact already signalled
    //    (a race against the timeout firing), just restart the scheduler.
    if job.out_fence().is_signalled() {
        channel.start();
        return Ok(());
    }

    // 3. Reset the channel adapter: stops DMA and tears down the FIFO.
    backend.reset(channel.id)?;

    // 4. Detach every fence from the hung job's sync point, unsignalled.
    syncpt_registry.detach_fences(job.syncpt());

    // 5. Reset the sync point with TimedOut; this signals any remaining
    //    fences (there should be none left after step 4, but a fence
    //    created between steps 4 and 5 is still covered).
    syncpt_registry.reset(
        job.syncpt(),
        Host1xError::TimedOut { channel: channel.id, elapsed_ms: 0 },
    );

    // 6. Release every MLOCK owned by the channel.
    mlocks.release_all_for_channel(channel.id);

    // 7. Pop the hung job from the push buffer.
    channel.drop_cmd_buf(job.id());

    // 8. Invoke reset_hw for every client whose pipe bit overlaps the
    //    hung job's pipes mask.
    for client in clients {
        if client.pipe().intersects(job.pipes()) {
            client.reset_hw();
        }
    }

    // 9. Mark this job for karma (it is simply dropped, never resubmitted
    //    itself) and resubmit whatever else was queued behind it.
    let pending = channel.drain_pending();
    for pending_job in pending {
        channel.push_job(&pending_job, syncpt_registry, backend)?;
    }

    // 10. Restart the scheduler.
    channel.start();
    Ok(())
}
