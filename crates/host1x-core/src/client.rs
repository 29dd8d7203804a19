//! Client: a registered consumer of one or more pipe bits on a channel.
//!
//! Hang recovery invokes the per-client `reset_hw` hook for every client
//! whose pipe bit is in the hung job's pipes mask. One small trait, many
//! implementations, owned by whatever wires up a device.

use crate::submit::Pipe;

/// A consumer of one or more engine classes on a channel (a 2D blitter
/// driver, a 3D driver, a video decoder). `reset_hw` is invoked during
/// hang recovery for every client whose `pipe()` overlaps the hung job's
/// pipe mask.
pub trait Client: Send + Sync {
    fn pipe(&self) -> Pipe;
    fn reset_hw(&self);
}

/// Adapts a plain closure to [`Client`], for callers that don't need a
/// full struct (the CLI's `--client` flag, tests).
pub struct FnClient<F: Fn() + Send + Sync> {
    pipe: Pipe,
    reset: F,
}

impl<F: Fn() + Send + Sync> FnClient<F> {
    pub fn new(pipe: Pipe, reset: F) -> Self {
        FnClient { pipe, reset }
    }
}

impl<F: Fn() + Send + Sync> Client for FnClient<F> {
    fn pipe(&self) -> Pipe {
        self.pipe
    }

    fn reset_hw(&self) {
        (self.reset)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn fn_client_invokes_closure_on_reset_hw() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let client = FnClient::new(Pipe::GR3D, move || called2.store(true, Ordering::SeqCst));
        assert_eq!(client.pipe(), Pipe::GR3D);
        client.reset_hw();
        assert!(called.load(Ordering::SeqCst));
    }
}
