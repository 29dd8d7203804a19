//! Command-stream assembler: copies user gather buffers into
//! a job's command buffer, walks the resulting opcode stream to validate
//! register writes and patch relocations, and derives the job's metadata.

use crate::bo::Bo;
use crate::error::{Host1xError, Result};
use crate::firewall;
use crate::opcode::{self, Opcode, INCR_SYNCPT_OFFSET};
use crate::submit::{pipe_for_class, Pipe};

/// One user-supplied span of opcodes to copy verbatim into the job's
/// command buffer.
#[derive(Clone)]
pub struct UserGatherDesc {
    pub bo: Bo,
    /// Byte offset into `bo`.
    pub offset: u32,
    /// Word count to copy.
    pub words: u32,
}

/// `{cmdbuf_word_offset, target_bo_index, target_byte_offset, shift}` —
/// matches a single address-register write in the assembled command
/// buffer to the BO whose device address should be patched in.
#[derive(Clone, Copy)]
pub struct RelocDescriptor {
    pub cmdbuf_word_offset: usize,
    pub target_bo_index: usize,
    pub target_byte_offset: u64,
    pub shift: u32,
}

/// Derived from walking the assembled command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssembledMetadata {
    pub pipes: Pipe,
    pub num_incrs: u32,
}

/// Copy each gather's words into `cmd_buf`, after an initial `SETCLASS`
/// for the job's engine class.
pub fn copy_user_gathers(cmd_buf: &mut Vec<u32>, class: u32, gathers: &[UserGatherDesc]) -> Result<()> {
    cmd_buf.push({
        let mut buf = Vec::with_capacity(1);
        opcode::encode(&Opcode::SetClass { class, offset: 0, mask: 0 }, &mut buf);
        buf[0]
    });
    cmd_buf.extend_from_slice(&copy_raw_gathers(gathers)?);
    Ok(())
}

/// Validate and copy a span of user gather descriptors with no leading
/// `SETCLASS`, used for a job's init-gathers (engine HW-init sequences
/// that run ahead of the job's own command buffer).
pub fn copy_raw_gathers(gathers: &[UserGatherDesc]) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for desc in gathers {
        let bo_size = desc.bo.size() as u64;
        let offset = desc.offset as u64;
        let byte_len = desc.words as u64 * 4;
        if offset % 4 != 0 {
            return Err(Host1xError::InvalidArgument(format!(
                "gather offset {offset} is not 4-byte aligned"
            )));
        }
        if desc.words == 0 {
            return Err(Host1xError::InvalidArgument("gather with zero words".into()));
        }
        if offset > bo_size.saturating_sub(4) || offset + byte_len > bo_size {
            return Err(Host1xError::InvalidArgument(format!(
                "gather [{offset}, {}) overflows BO of size {bo_size}",
                offset + byte_len
            )));
        }
        let words = desc.bo.read_words(offset as usize, desc.words as usize);
        out.extend_from_slice(&words);
    }
    Ok(out)
}

/// How many header-plus-data words an opcode whose tag writes registers
/// occupies, and the register indices it writes (for the firewall check)
/// plus the data-word index (relative to the opcode's header) that should
/// be patched for each, if any.
enum RegWrite {
    /// `(register, data_word_index)` pairs; `data_word_index` is `None`
    /// when the value lives in the header word itself (`Imm`).
    Writes(Vec<(u32, Option<usize>)>),
    /// Opcode does not write registers at all.
    None,
}

fn register_writes(op: &Opcode) -> RegWrite {
    match *op {
        Opcode::Incr { offset, count } => {
            RegWrite::Writes((0..count).map(|i| (offset + i, Some(1 + i as usize))).collect())
        }
        Opcode::NonIncr { offset, count } => {
            RegWrite::Writes((0..count).map(|i| (offset, Some(1 + i as usize))).collect())
        }
        Opcode::Mask { offset, mask } => RegWrite::Writes(
            (0..16u32)
                .filter(|bit| mask & (1 << bit) != 0)
                .enumerate()
                .map(|(data_idx, bit)| (offset + bit, Some(1 + data_idx)))
                .collect(),
        ),
        Opcode::Imm { offset, .. } => RegWrite::Writes(vec![(offset, None)]),
        Opcode::IncrW { offset, .. } | Opcode::NonIncrW { offset, .. } => {
            RegWrite::Writes(vec![(offset, Some(1))])
        }
        _ => RegWrite::None,
    }
}

/// Total words (header + trailing data words) this opcode consumes in
/// the firewall walk — wider than [`Opcode::word_len`] for the
/// data-word-bearing register opcodes, whose data words aren't part of
/// the decoded `Opcode` value.
fn total_words(op: &Opcode) -> usize {
    match *op {
        Opcode::Incr { count, .. } | Opcode::NonIncr { count, .. } => 1 + count as usize,
        Opcode::Mask { mask, .. } => 1 + (mask.count_ones() as usize),
        _ => op.word_len(),
    }
}

/// Walk `cmd_buf` one opcode at a time, validating register writes
/// against the current class's declared address registers and patching
/// every address-register write with the device address its matching
/// relocation names.
pub fn validate_and_patch(
    cmd_buf: &mut [u32],
    initial_class: u32,
    relocs: &[RelocDescriptor],
    bo_table: &[Bo],
) -> Result<()> {
    let mut class = initial_class;
    let mut pos = 0usize;

    while pos < cmd_buf.len() {
        let op = opcode::decode(&cmd_buf[pos..])
            .ok_or(Host1xError::BadOpcode { opcode: (cmd_buf[pos] >> 28) as u8, word_offset: pos })?;

        if let Opcode::SetClass { class: c, .. } = &op {
            class = *c;
        }

        match register_writes(&op) {
            RegWrite::None => {}
            RegWrite::Writes(writes) => {
                for (register, data_word_idx) in writes {
                    let word_offset = match data_word_idx {
                        Some(idx) => pos + idx,
                        None => pos,
                    };
                    if firewall::is_forbidden_register(class, register) {
                        return Err(Host1xError::RegOutOfRange { class, register, word_offset });
                    }
                    if !firewall::is_address_register(class, register) {
                        continue;
                    }
                    let reloc = relocs
                        .iter()
                        .find(|r| r.cmdbuf_word_offset == word_offset)
                        .ok_or(Host1xError::BadReloc { word_offset, register })?;
                    let bo = bo_table
                        .get(reloc.target_bo_index)
                        .ok_or(Host1xError::BadRelocIndex(reloc.target_bo_index))?;
                    let base = match bo.gart_state() {
                        crate::bo::GartState::Bound { gart_addr, .. } => gart_addr,
                        crate::bo::GartState::Cached { gart_addr } => gart_addr,
                        crate::bo::GartState::Unbound => bo.dma_addr(),
                    };
                    let device_addr = (base + reloc.target_byte_offset) >> reloc.shift;
                    match data_word_idx {
                        Some(_) => cmd_buf[word_offset] = device_addr as u32,
                        None => {
                            // Imm: patch the low 16 bits of the header word in place.
                            let header = cmd_buf[word_offset];
                            cmd_buf[word_offset] = (header & 0xffff_0000) | (device_addr as u32 & 0xffff);
                        }
                    }
                }
            }
        }

        pos += total_words(&op);
    }
    Ok(())
}

/// Derive `pipes` (union of classes seen) and `num_incrs` (count of
/// syncpoint-increment `IMM`s addressed to `syncpt`), and confirm the
/// stream ends with a final increment.
pub fn compute_metadata(cmd_buf: &[u32], syncpt: u32) -> Result<AssembledMetadata> {
    let mut class = 0u32;
    let mut pipes = Pipe::empty();
    let mut num_incrs = 0u32;
    let mut last_was_final_incr = false;
    let mut pos = 0usize;

    while pos < cmd_buf.len() {
        let op = opcode::decode(&cmd_buf[pos..])
            .ok_or(Host1xError::BadOpcode { opcode: (cmd_buf[pos] >> 28) as u8, word_offset: pos })?;
        last_was_final_incr = false;
        if let Opcode::SetClass { class: c, .. } = &op {
            class = *c;
            pipes |= pipe_for_class(class);
        }
        if let Some((_, index)) = op.as_syncpt_incr(INCR_SYNCPT_OFFSET) {
            if index == syncpt {
                num_incrs += 1;
                last_was_final_incr = true;
            }
        }
        pos += total_words(&op);
    }

    if num_incrs == 0 || !last_was_final_incr {
        return Err(Host1xError::InvalidArgument(
            "command stream does not end with a final increment on the job's sync point".into(),
        ));
    }

    Ok(AssembledMetadata { pipes, num_incrs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::{BoFlags, GartState};

    fn push(cmd_buf: &mut Vec<u32>, op: Opcode) {
        opcode::encode(&op, cmd_buf);
    }

    #[test]
    fn copy_user_gathers_prefixes_setclass() {
        let mut cmd_buf = Vec::new();
        let bo = Bo::alloc(64, BoFlags::empty(), 0);
        bo.write_words(0, &[0xdead_beef, 0xcafe_babe]);
        let descs = vec![UserGatherDesc { bo, offset: 0, words: 2 }];
        copy_user_gathers(&mut cmd_buf, firewall::classes::GR3D, &descs).unwrap();
        assert!(matches!(
            opcode::decode(&cmd_buf[0..1]),
            Some(Opcode::SetClass { class, .. }) if class == firewall::classes::GR3D
        ));
        assert_eq!(cmd_buf[1], 0xdead_beef);
        assert_eq!(cmd_buf[2], 0xcafe_babe);
    }

    #[test]
    fn copy_user_gathers_rejects_misaligned_offset() {
        let mut cmd_buf = Vec::new();
        let bo = Bo::alloc(64, BoFlags::empty(), 0);
        let descs = vec![UserGatherDesc { bo, offset: 2, words: 1 }];
        let err = copy_user_gathers(&mut cmd_buf, firewall::classes::GR3D, &descs).unwrap_err();
        assert!(matches!(err, Host1xError::InvalidArgument(_)));
    }

    #[test]
    fn copy_user_gathers_rejects_overflow() {
        let mut cmd_buf = Vec::new();
        let bo = Bo::alloc(8, BoFlags::empty(), 0);
        let descs = vec![UserGatherDesc { bo, offset: 4, words: 2 }];
        let err = copy_user_gathers(&mut cmd_buf, firewall::classes::GR3D, &descs).unwrap_err();
        assert!(matches!(err, Host1xError::InvalidArgument(_)));
    }

    #[test]
    fn validate_and_patch_rejects_address_register_without_reloc() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        push(&mut cmd_buf, Opcode::Incr { offset: firewall::gr3d_tex_addr(0), count: 1 });
        cmd_buf.push(0); // data word, no matching reloc
        let err = validate_and_patch(&mut cmd_buf, 0, &[], &[]).unwrap_err();
        assert!(matches!(err, Host1xError::BadReloc { .. }));
    }

    #[test]
    fn validate_and_patch_patches_matching_reloc() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        let data_word_offset = cmd_buf.len() + 1;
        push(&mut cmd_buf, Opcode::Incr { offset: firewall::gr3d_tex_addr(0), count: 1 });
        cmd_buf.push(0);

        let bo = Bo::alloc(4096, BoFlags::empty(), 0);
        *bo.gart_state_mut() = GartState::Bound { gart_addr: 0x8000_0000, refcount: 1 };
        let relocs = vec![RelocDescriptor {
            cmdbuf_word_offset: data_word_offset,
            target_bo_index: 0,
            target_byte_offset: 0x100,
            shift: 0,
        }];
        validate_and_patch(&mut cmd_buf, 0, &relocs, &[bo]).unwrap();
        assert_eq!(cmd_buf[data_word_offset], 0x8000_0100);
    }

    #[test]
    fn validate_and_patch_rejects_forbidden_register() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        push(&mut cmd_buf, Opcode::Incr { offset: firewall::gr3d_debug_reg(0), count: 1 });
        cmd_buf.push(0);
        let err = validate_and_patch(&mut cmd_buf, 0, &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            Host1xError::RegOutOfRange { register, .. } if register == firewall::gr3d_debug_reg(0)
        ));
    }

    #[test]
    fn validate_and_patch_accepts_ordinary_register_without_reloc() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        push(&mut cmd_buf, Opcode::Incr { offset: 0x10, count: 1 });
        cmd_buf.push(0x42);
        validate_and_patch(&mut cmd_buf, 0, &[], &[]).unwrap();
    }

    #[test]
    fn compute_metadata_requires_trailing_increment_on_job_syncpoint() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        let err = compute_metadata(&cmd_buf, 7).unwrap_err();
        assert!(matches!(err, Host1xError::InvalidArgument(_)));
    }

    #[test]
    fn compute_metadata_counts_increments_and_unions_pipes() {
        let mut cmd_buf = Vec::new();
        push(&mut cmd_buf, Opcode::SetClass { class: firewall::classes::GR3D, offset: 0, mask: 0 });
        push(&mut cmd_buf, Opcode::Imm { offset: INCR_SYNCPT_OFFSET, data: (0 << 8) | 7 });
        let meta = compute_metadata(&cmd_buf, 7).unwrap();
        assert_eq!(meta.num_incrs, 1);
        assert_eq!(meta.pipes, Pipe::GR3D);
    }
}
