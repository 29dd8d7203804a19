//! Debug dumper: a point-in-time snapshot of every channel,
//! sync point, and MLOCK, plus a decoded rendering of each channel's
//! pending push-buffer window — for a `/dump` HTTP endpoint or a CLI
//! `dump` subcommand to render.

use crate::device::Device;
use crate::opcode;
use crate::syncpoint::SyncPointSnapshot;

/// One decoded push-buffer entry between a channel's DMAGET and its
/// software `put` pointer.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DecodedWord {
    /// Word offset within the ring.
    pub offset: usize,
    pub text: String,
}

/// Point-in-time view of one channel's scheduler and hardware state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChannelSnapshot {
    pub id: u32,
    pub accepted_pipes: u32,
    pub running: bool,
    pub dmaget: u64,
    pub dmaput: u64,
    /// Decoded opcodes in `[dmaget, dmaput)`, wrapping if `dmaget > dmaput`.
    pub window: Vec<DecodedWord>,
}

/// Point-in-time view of one MLOCK.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MlockSnapshot {
    pub index: u32,
    pub owner_channel: Option<u32>,
}

/// The full dump: every channel, sync point, and MLOCK on a device.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DumpSnapshot {
    pub channels: Vec<ChannelSnapshot>,
    pub syncpoints: Vec<SyncPointSnapshot>,
    pub mlocks: Vec<MlockSnapshot>,
}

/// Decode the words between `get` and `put` (word indices into `ring`,
/// wrapping past `capacity` back to 0 when `get > put`), tolerating unknown
/// opcodes by rendering them as a raw hex word rather than failing the
/// whole dump — a debug tool should never itself crash on a corrupt ring.
///
/// `capacity` is the logical ring size `put`/`get` are expressed in terms
/// of — it excludes the reserved `RESTART_W` tail `ring` itself carries, so
/// a post-wrap window never walks into that fixed marker region.
fn decode_window(ring: &[u32], capacity: usize, get: usize, put: usize) -> Vec<DecodedWord> {
    if capacity == 0 {
        return Vec::new();
    }
    let get = get % capacity;
    let put = put % capacity;

    let mut indices: Vec<usize> = Vec::new();
    if get <= put {
        indices.extend(get..put);
    } else {
        indices.extend(get..capacity);
        indices.extend(0..put);
    }

    let mut out = Vec::with_capacity(indices.len());
    let mut i = 0;
    while i < indices.len() {
        let offset = indices[i];
        match opcode::decode(&ring[offset..]) {
            Some(op) => {
                let consumed = op.word_len();
                out.push(DecodedWord { offset, text: op.to_string() });
                i += consumed.max(1);
            }
            None => {
                out.push(DecodedWord { offset, text: format!("??? word=0x{:08x}", ring[offset]) });
                i += 1;
            }
        }
    }
    out
}

impl DumpSnapshot {
    /// Renders the snapshot the way a kernel driver's debugfs node would:
    /// one stanza per channel/sync-point/MLOCK, plain text, no JSON.
    pub fn to_text(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        for ch in &self.channels {
            let _ = writeln!(
                out,
                "channel {}: pipes=0x{:x} running={} dmaget={} dmaput={}",
                ch.id, ch.accepted_pipes, ch.running, ch.dmaget, ch.dmaput
            );
            for word in &ch.window {
                let _ = writeln!(out, "  [{:>5}] {}", word.offset, word.text);
            }
        }

        for sp in &self.syncpoints {
            let _ = writeln!(
                out,
                "syncpoint {} ({}): value={} threshold={} interrupt_armed={} fences={}",
                sp.id, sp.device_name, sp.value, sp.threshold, sp.interrupt_armed, sp.num_fences
            );
        }

        for ml in &self.mlocks {
            match ml.owner_channel {
                Some(ch) => {
                    let _ = writeln!(out, "mlock {}: held by channel {}", ml.index, ch);
                }
                None => {
                    let _ = writeln!(out, "mlock {}: free", ml.index);
                }
            }
        }

        out
    }
}

impl Device {
    /// Builds a [`DumpSnapshot`] of this device's current state. Safe to
    /// call from any thread at any time — every collaborator's snapshot
    /// accessor takes only the same short-lived locks its own operations
    /// do, so a dump never blocks a job in flight for long.
    pub fn dump(&self) -> DumpSnapshot {
        let channels = self
            .channels()
            .iter()
            .map(|ch| {
                let words = ch.push_buffer_words();
                let dmaput = ch.put() as u64;
                let dmaget = self.backend().dmaget(ch.id);
                ChannelSnapshot {
                    id: ch.id,
                    accepted_pipes: ch.accepted_pipes.bits(),
                    running: ch.is_running(),
                    dmaget,
                    dmaput,
                    window: decode_window(&words, ch.capacity_words(), dmaget as usize, dmaput as usize),
                }
            })
            .collect();

        let syncpoints = self.syncpoints().snapshot_all();

        let mlocks = self
            .mlocks()
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(index, owner_channel)| MlockSnapshot { index: index as u32, owner_channel })
            .collect();

        DumpSnapshot { channels, syncpoints, mlocks }
    }
}
