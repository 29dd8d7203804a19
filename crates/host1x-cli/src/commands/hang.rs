use std::sync::Arc;

use host1x_core::backend::{ChannelBackend, SimChannelBackend};
use host1x_core::config::Host1xConfig;
use host1x_core::device::{ChannelSpec, Device};
use host1x_core::firewall::classes;
use host1x_core::submit::Pipe;

/// `Device::submit` doesn't hand the caller a `Job` (only its id and
/// out-fence), but `handle_timeout` needs the `Job` itself — a real
/// watchdog lives inside the driver and already holds it. This harness
/// plays that role directly: push a job onto the channel by hand, stall
/// the backend first so it never "executes", then recover it.
pub fn run() {
    let backend_sim = Arc::new(SimChannelBackend::new(1));
    let backend: Arc<dyn ChannelBackend> = backend_sim.clone();
    let device = Device::new(
        Host1xConfig::default(),
        "host1x-ctl",
        backend,
        &[ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: 256 }],
    )
    .expect("device construction with a single channel never fails");

    let ctx = device.open_context();
    let syncpt = device.reserve_syncpt().expect("fresh registry has free sync points");
    let job = host1x_core::Job::new(
        ctx,
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
    .expect("job construction with no relocations never fails");

    backend_sim.stall(0);
    device.channels()[0]
        .push_job(&job, device.syncpoints(), device.backend().as_ref())
        .expect("pushing onto a freshly-initialized channel cannot itself fail");

    println!("job {} stalled, forcing timeout recovery", job.id());
    match device.handle_timeout(0, &job) {
        Ok(()) => match job.out_fence().wait() {
            Ok(()) => println!("recovery ran but the fence unexpectedly signalled clean"),
            Err(e) => println!("recovered: fence resolved to {e}"),
        },
        Err(e) => {
            eprintln!("recovery itself failed: {e}");
            std::process::exit(1);
        }
    }
}
