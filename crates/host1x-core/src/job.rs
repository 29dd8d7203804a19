//! Job object: the unit of work submitted by a context, and
//! its six-step deferred-drop retirement sequence.

use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;

use crate::bo::Bo;
use crate::context::Context;
use crate::error::Result;
use crate::gart::GartAperture;
use crate::submit::Pipe;
use crate::syncpoint::{Fence, SyncPointRegistry, SyncptId};

type RetireWork = Box<dyn FnOnce() + Send>;

fn retire_queue() -> &'static mpsc::Sender<RetireWork> {
    static QUEUE: OnceLock<mpsc::Sender<RetireWork>> = OnceLock::new();
    QUEUE.get_or_init(|| {
        let (tx, rx) = mpsc::channel::<RetireWork>();
        thread::Builder::new()
            .name("host1x-job-retire".into())
            .spawn(move || {
                for work in rx {
                    work();
                }
            })
            .expect("failed to start job retirement worker");
        tx
    })
}

struct JobInner {
    id: u64,
    class: u32,
    context: Arc<Context>,
    syncpt_registry: Arc<SyncPointRegistry>,
    gart: Arc<GartAperture>,
    syncpt: SyncptId,
    pipes: Pipe,
    num_incrs: u32,
    out_fence: Fence,
    init_gathers: Vec<u32>,
    cmd_buf: Vec<u32>,
    /// Taken by `Drop` and handed to the retirement worker; `None` once
    /// retirement has been queued.
    mapped_bos: Mutex<Option<Vec<Bo>>>,
}

/// A reference-counted handle to one submitted job. Dropping the last
/// handle runs the six-step retirement sequence on a background worker,
/// since unpinning BOs and tearing down GART bindings may block.
#[derive(Clone)]
pub struct Job(Arc<JobInner>);

impl Job {
    /// Builds the job's out-fence against an already-allocated `syncpt` —
    /// the caller must allocate it before assembling the command buffer,
    /// since the job's own trailing increment opcode has to target this
    /// id. `mapped_bos` is whatever `GartAperture::job_map` bound for this
    /// job; `cmd_buf` is the already-assembled and firewall-validated
    /// command buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<Context>,
        syncpt_registry: Arc<SyncPointRegistry>,
        gart: Arc<GartAperture>,
        syncpt: SyncptId,
        class: u32,
        init_gathers: Vec<u32>,
        cmd_buf: Vec<u32>,
        mapped_bos: Vec<Bo>,
        pipes: Pipe,
        num_incrs: u32,
    ) -> Result<Self> {
        // The scheduler's own trailing increment (push.rs step 6) brings
        // the counter one past the job's own final increment; out-fence
        // consumers only see success once that has landed too, which is
        // what guarantees the command buffer is safe to release.
        let out_fence = syncpt_registry.create_fence(syncpt, num_incrs + 1);

        for bo in &mapped_bos {
            bo.pin();
        }
        context.job_created();

        static NEXT_JOB_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let id = NEXT_JOB_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        Ok(Job(Arc::new(JobInner {
            id,
            class,
            context,
            syncpt_registry,
            gart,
            syncpt,
            pipes,
            num_incrs,
            out_fence,
            init_gathers,
            cmd_buf,
            mapped_bos: Mutex::new(Some(mapped_bos)),
        })))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn class(&self) -> u32 {
        self.0.class
    }

    pub fn syncpt(&self) -> SyncptId {
        self.0.syncpt
    }

    pub fn pipes(&self) -> Pipe {
        self.0.pipes
    }

    pub fn num_incrs(&self) -> u32 {
        self.0.num_incrs
    }

    pub fn out_fence(&self) -> Fence {
        self.0.out_fence.clone()
    }

    pub fn init_gathers(&self) -> &[u32] {
        &self.0.init_gathers
    }

    pub fn cmd_buf(&self) -> &[u32] {
        &self.0.cmd_buf
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.0.context
    }
}

impl Drop for JobInner {
    fn drop(&mut self) {
        let Some(mapped_bos) = self.mapped_bos.lock().take() else {
            return;
        };
        let syncpt_registry = self.syncpt_registry.clone();
        let gart = self.gart.clone();
        let context = self.context.clone();
        let syncpt = self.syncpt;

        let _ = retire_queue().send(Box::new(move || {
            // 1. Detach residual fences from the sync point (no signal).
            syncpt_registry.detach_fences(syncpt);
            // 2. Unmap GART bindings with flush=false.
            gart.job_unmap(&mapped_bos, false);
            // 3. Drop BO references.
            for bo in &mapped_bos {
                bo.unpin();
            }
            drop(mapped_bos);
            // 4. Free the command buffer: nothing to do, it is dropped
            //    along with this closure's captured state.
            // 5. Release the sync point so it can be reused.
            syncpt_registry.free(syncpt);
            // 6. Decrement the context's active-job counter and wake any
            //    wait_context waiter.
            context.job_retired();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::BoFlags;
    use crate::config::Host1xConfig;
    use std::time::{Duration, Instant};

    fn registry() -> Arc<SyncPointRegistry> {
        Arc::new(SyncPointRegistry::new(8))
    }

    fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn new_job_allocates_syncpoint_and_pins_bos() {
        let ctx = Context::new();
        let syncpt_registry = registry();
        let syncpt = syncpt_registry.alloc("test").unwrap();
        let gart = Arc::new(GartAperture::new(&Host1xConfig::default()));
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let job = Job::new(
            ctx.clone(),
            syncpt_registry,
            gart,
            syncpt,
            crate::firewall::classes::GR3D,
            Vec::new(),
            vec![0, 1, 2],
            vec![bo.clone()],
            Pipe::GR3D,
            1,
        )
        .unwrap();
        assert!(bo.is_busy());
        assert_eq!(ctx.active_jobs(), 1);
        assert_eq!(job.num_incrs(), 1);
    }

    #[test]
    fn dropping_last_handle_retires_job_in_background() {
        let ctx = Context::new();
        let syncpt_registry = registry();
        let syncpt = syncpt_registry.alloc("test").unwrap();
        let gart = Arc::new(GartAperture::new(&Host1xConfig::default()));
        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        let job = Job::new(
            ctx.clone(),
            syncpt_registry,
            gart,
            syncpt,
            crate::firewall::classes::GR3D,
            Vec::new(),
            vec![0],
            vec![bo.clone()],
            Pipe::GR3D,
            1,
        )
        .unwrap();
        drop(job);
        assert!(wait_until(|| !bo.is_busy(), Duration::from_millis(500)));
        assert!(wait_until(|| ctx.is_idle(), Duration::from_millis(500)));
    }
}
