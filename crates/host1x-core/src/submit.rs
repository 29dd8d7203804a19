//! External submission interface: the descriptor the IOCTL
//! collaborator would build from userspace's job description, and the
//! result the core hands back.

use bitflags::bitflags;

use crate::assembler::{RelocDescriptor, UserGatherDesc};
use crate::bo::{Bo, BoFlags};
use crate::syncpoint::{Fence, SyncptId};

bitflags! {
    /// Engine pipelines a channel accepts, or a job requests. The
    /// channel scheduler's rating formula (§4.F) scores how well a
    /// channel's accepted mask covers a job's requested mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pipe: u32 {
        const HOST1X = 1 << 0;
        const GR3D   = 1 << 1;
        const VIC    = 1 << 2;
    }
}

/// Maps a `SETCLASS` selector to the pipe bit it occupies, for
/// `compute_metadata`'s `pipes` union and the scheduler's channel match.
pub fn pipe_for_class(class: u32) -> Pipe {
    match class {
        crate::firewall::classes::HOST1X => Pipe::HOST1X,
        crate::firewall::classes::GR3D => Pipe::GR3D,
        crate::firewall::classes::VIC => Pipe::VIC,
        _ => Pipe::empty(),
    }
}

/// One entry of a job's BO reference table.
#[derive(Clone)]
pub struct BoTableEntry {
    pub bo: Bo,
    pub flags: BoFlags,
}

/// Everything `Device::submit` needs to assemble, map, and schedule one
/// job. Built by the IOCTL collaborator in the real driver; built
/// directly by callers here (the CLI, tests) since that boundary isn't
/// modeled.
pub struct SubmitDescriptor {
    pub context_id: u64,
    /// Allocated via [`crate::device::Device::reserve_syncpt`] ahead of
    /// time — the caller needs the concrete id before it can author the
    /// command buffer's own trailing increment.
    pub syncpt: SyncptId,
    pub class: u32,
    pub init_gathers: Vec<UserGatherDesc>,
    pub gathers: Vec<UserGatherDesc>,
    pub relocs: Vec<RelocDescriptor>,
    pub bo_table: Vec<BoTableEntry>,
    pub pre_fences: Vec<Fence>,
}

/// What `Device::submit` returns on success.
pub struct SubmitResult {
    pub job_id: u64,
    pub out_fence: Fence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_for_class_maps_known_classes() {
        assert_eq!(pipe_for_class(crate::firewall::classes::GR3D), Pipe::GR3D);
        assert_eq!(pipe_for_class(crate::firewall::classes::VIC), Pipe::VIC);
        assert_eq!(pipe_for_class(crate::firewall::classes::HOST1X), Pipe::HOST1X);
    }

    #[test]
    fn pipe_for_class_is_empty_for_unknown_class() {
        assert_eq!(pipe_for_class(0xAB), Pipe::empty());
    }
}
