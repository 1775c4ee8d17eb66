//! Executable segments and their decoder caches.
//!
//! A segment covers one contiguous executable range of the guest. At
//! creation every possible instruction address in the range is decoded
//! into a slot holding a handler pointer plus packed operands, so the
//! dispatch loop never re-decodes. Generation is one-shot: segments are
//! sealed afterwards and evicted wholesale, never patched.

use crate::arch::Address;
use crate::decoder::{self, DecodedSlot};

pub struct ExecuteSegment {
    base: Address,
    len: usize,
    /// 2 with the compressed extension enabled, else 4.
    granularity: usize,
    slots: Vec<DecodedSlot>,
    /// Covers the ELF entry point.
    initial: bool,
}

impl ExecuteSegment {
    /// Decode `data` (the code bytes at `base`) into a sealed decoder
    /// cache. With compressed decoding every 2-byte offset gets a slot;
    /// a 4-byte instruction that would straddle past the end of the
    /// range decodes as illegal, which stops a runaway PC at the
    /// boundary.
    pub fn generate(base: Address, data: &[u8], compressed: bool, initial: bool) -> ExecuteSegment {
        let granularity = if compressed { 2 } else { 4 };
        let count = data.len() / granularity;
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let offset = index * granularity;
            slots.push(Self::decode_at(data, offset, compressed));
        }
        log::debug!(
            "decoder cache for {:#x}..{:#x}: {} slots ({}-byte granularity)",
            base,
            base + data.len() as Address,
            slots.len(),
            granularity
        );
        ExecuteSegment {
            base,
            len: data.len(),
            granularity,
            slots,
            initial,
        }
    }

    fn decode_at(data: &[u8], offset: usize, compressed: bool) -> DecodedSlot {
        if offset + 2 > data.len() {
            return decoder::illegal_slot(0);
        }
        let half = u16::from_le_bytes([data[offset], data[offset + 1]]);
        if compressed && (half & 3) != 3 {
            return decoder::decode_compressed(half);
        }
        if (half & 3) != 3 {
            // a compressed encoding with compressed decoding disabled
            return decoder::illegal_slot(half as u32);
        }
        if offset + 4 > data.len() {
            return decoder::illegal_slot(half as u32);
        }
        let word = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        decoder::decode(word)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn contains(&self, vaddr: Address) -> bool {
        vaddr >= self.base && ((vaddr - self.base) as usize) < self.len
    }

    /// The decoded slot covering `pc`. The caller has already verified
    /// alignment for the configured ISA.
    pub fn slot_at(&self, pc: Address) -> Option<DecodedSlot> {
        if !self.contains(pc) {
            return None;
        }
        let index = (pc - self.base) as usize / self.granularity;
        self.slots.get(index).copied()
    }
}

impl std::fmt::Debug for ExecuteSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteSegment")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("granularity", &self.granularity)
            .field("initial", &self.initial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // addi x1, x0, 5 ; addi x2, x1, 1
    const ADDI_X1: u32 = 0x0050_0093;
    const ADDI_X2: u32 = 0x0010_8113;

    fn code(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn slots_cover_every_word() {
        let bytes = code(&[ADDI_X1, ADDI_X2]);
        let seg = ExecuteSegment::generate(0x1000, &bytes, false, true);
        assert_eq!(seg.len(), 8);
        assert!(seg.contains(0x1004));
        assert!(!seg.contains(0x1008));
        assert!(seg.slot_at(0x1000).is_some());
        assert!(seg.slot_at(0x1004).is_some());
        assert!(seg.slot_at(0x1008).is_none());
    }

    #[test]
    fn compressed_granularity_doubles_slots() {
        let bytes = code(&[ADDI_X1, ADDI_X2]);
        let seg = ExecuteSegment::generate(0x1000, &bytes, true, false);
        // every half-word offset resolves to a slot
        assert!(seg.slot_at(0x1002).is_some());
    }

    #[test]
    fn trailing_half_word_decodes_as_illegal() {
        let mut bytes = code(&[ADDI_X1]);
        bytes.extend_from_slice(&0x0093u16.to_le_bytes());
        let seg = ExecuteSegment::generate(0x1000, &bytes, true, false);
        // the 32-bit encoding at the tail has no second half
        assert!(seg.slot_at(0x1004).is_some());
    }
}
