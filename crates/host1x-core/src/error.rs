//! Error kinds surfaced by the job lifecycle core.
//!
//! One flat enum covers every failure mode in the submit path, the GART
//! residency manager, and the recovery path. Variants carry enough context
//! (offsets, register numbers, ids) to render directly into the debug dump
//! and to let tests assert on the exact failure.

use thiserror::Error;

/// Top-level error type for every fallible core operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Host1xError {
    /// Malformed submission descriptor: bad alignment, zero count, gather
    /// overflowing its BO, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The firewall rejected an unknown top-level opcode.
    #[error("unknown opcode 0x{opcode:x} at word {word_offset}")]
    BadOpcode { opcode: u8, word_offset: usize },

    /// A write to a declared address register had no matching relocation.
    #[error("no relocation for address-register write at word {word_offset} (register {register})")]
    BadReloc { word_offset: usize, register: u32 },

    /// A write targeted a register the firewall forbids for the current class.
    #[error("register {register} out of range for class {class} at word {word_offset}")]
    RegOutOfRange {
        class: u32,
        register: u32,
        word_offset: usize,
    },

    /// A backing allocation (BO, job, command buffer) could not be satisfied.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// GART space could not be found even after a full eviction-cache flush.
    #[error("out of GART space: requested {requested} bytes, {available} available after flush")]
    OutOfGartSpace { requested: usize, available: usize },

    /// Transient GART pressure: caller should retry once space frees up.
    ///
    /// Distinct from [`Host1xError::OutOfGartSpace`]: this is what
    /// `job_map` returns when the *total* footprint fits the aperture but
    /// free space does not right now.
    #[error("GART space temporarily unavailable, retry after eviction")]
    TryAgain,

    /// No channel accepts the job's full requested pipe mask.
    #[error("no channel accepts pipe mask 0b{pipes:b}")]
    NoSuitableChannel { pipes: u32 },

    /// The BO is still referenced by an unfinished job.
    #[error("buffer object {0} is busy")]
    Busy(u64),

    /// Hardware did not complete the job within its entity timeout.
    #[error("job on channel {channel} timed out after {elapsed_ms} ms")]
    TimedOut { channel: u32, elapsed_ms: u64 },

    /// Shutdown-time teardown cancelled an in-flight fence.
    #[error("cancelled")]
    Cancelled,

    /// A blocking call was interrupted before it could complete.
    #[error("interrupted")]
    Interrupted,

    /// A scattered BO needs an IOMMU to be imported, and none is present.
    #[error("buffer is scattered and no IOMMU is available to import it")]
    NotScatterable,

    /// Relocation referenced a cmdbuf or target BO index outside the job's tables.
    #[error("relocation referenced out-of-range BO index {0}")]
    BadRelocIndex(usize),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, Host1xError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = Host1xError::BadReloc {
            word_offset: 4,
            register: 0x12,
        };
        let msg = e.to_string();
        assert!(msg.contains("word 4"));
        assert!(msg.contains("18")); // 0x12 == 18
    }

    #[test]
    fn try_again_is_distinct_from_out_of_gart_space() {
        assert_ne!(
            Host1xError::TryAgain,
            Host1xError::OutOfGartSpace {
                requested: 1,
                available: 0
            }
        );
    }
}
