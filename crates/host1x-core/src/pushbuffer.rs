//! Push buffer: the ring of 32-bit words a channel's DMA engine fetches
//! opcodes from. The hardware adapter driving it lives in
//! [`crate::backend`].

use crate::opcode::{self, Opcode};

/// Word alignment granularity pushes are rounded up to; 16 bytes = 4 words
/// on every SoC this crate models.
pub const ALIGN_WORDS: usize = 4;

/// Words reserved at the tail of the ring for the wraparound `RESTART_W`
/// (2 words, wide enough for a 64-bit ring base regardless of SoC).
const RESTART_RESERVED_WORDS: usize = 2;

/// A ring of opcode words, pre-filled with NOPs so any prefix of the ring
/// decodes cleanly even before anything has been pushed into it.
pub struct PushBuffer {
    words: Vec<u32>,
    /// Index of the next word to write.
    put: usize,
    /// `true` once at least one wraparound has happened; distinguishes an
    /// empty ring (`put == 0`, nothing ever written) from a full lap.
    wrapped: bool,
}

/// `Opcode::NonIncr { offset: 0, count: 0 }` encodes to a single all-zero
/// word on this crate's layout and is used as filler, mirroring how real
/// host1x rings use an all-zero/NOP word as ring padding.
const NOP_WORD: u32 = 0;

impl PushBuffer {
    /// Allocate a ring holding `capacity_words` words (rounded down to a
    /// multiple of [`ALIGN_WORDS`]), pre-filled with NOPs and terminated
    /// with a `RESTART_W` back to word 0.
    pub fn new(capacity_words: usize) -> Self {
        let capacity_words = (capacity_words / ALIGN_WORDS) * ALIGN_WORDS;
        assert!(capacity_words > RESTART_RESERVED_WORDS, "push buffer too small to hold a RESTART");
        let mut words = vec![NOP_WORD; capacity_words];
        let restart_at = capacity_words - RESTART_RESERVED_WORDS;
        let mut restart_words = Vec::with_capacity(RESTART_RESERVED_WORDS);
        opcode::encode(&Opcode::RestartW { addr: 0 }, &mut restart_words);
        words[restart_at..].copy_from_slice(&restart_words);
        PushBuffer { words, put: 0, wrapped: false }
    }

    pub fn capacity_words(&self) -> usize {
        self.words.len() - RESTART_RESERVED_WORDS
    }

    pub fn put(&self) -> usize {
        self.put
    }

    /// Bytes currently free before the ring would need to wrap — used by
    /// the scheduler to decide whether a job's command buffer fits without
    /// crossing the tail.
    pub fn space_until_wrap(&self) -> usize {
        self.capacity_words() - self.put
    }

    /// Write one word at `put`, wrapping to 0 past the reserved RESTART
    /// region. Panics if the ring has no free capacity, mirroring the
    /// spec's "assert there is space" — callers must call
    /// [`Self::prepare`] first so this can never actually run out.
    pub fn push(&mut self, word: u32) {
        assert!(self.put < self.capacity_words(), "push buffer overflow");
        self.words[self.put] = word;
        self.put += 1;
        if self.put == self.capacity_words() {
            self.put = 0;
            self.wrapped = true;
        }
    }

    pub fn push_opcode(&mut self, op: &Opcode) {
        let mut buf = Vec::with_capacity(op.word_len());
        opcode::encode(op, &mut buf);
        for w in buf {
            self.push(w);
        }
    }

    /// If writing `n` more words would cross the wraparound point, pad
    /// with NOPs to jump over it first, so the block `n` is about to write
    /// lands entirely within one linear region.
    pub fn prepare(&mut self, n: usize) {
        if self.put + n > self.capacity_words() {
            while self.put != 0 {
                self.push(NOP_WORD);
            }
        }
    }

    /// Push NOPs until `put` (in words) is aligned to `align_words`.
    pub fn align(&mut self, align_words: usize) {
        while self.put % align_words != 0 {
            self.push(NOP_WORD);
        }
    }

    /// Read-only view of the ring contents, for the debug dumper.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }
}
