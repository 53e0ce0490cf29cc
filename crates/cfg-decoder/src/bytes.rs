use cfg_types::SegmentedAddress;

/// The only thing the parser needs from memory: read a byte at a segmented
/// address. Kept minimal and decoder-local (rather than depending on
/// `cfg-core`'s richer `Bus`) so the dependency graph stays leaves-first —
/// `cfg-core::mem::Memory` implements this trait, mirroring how
/// `aero-cpu-decoder::decode_one` takes a plain `&[u8]` window rather than a
/// full bus.
pub trait InstructionBytes {
    fn read_u8(&self, address: SegmentedAddress) -> u8;
}

/// A byte slice anchored at a fixed address, wrapping within the segment
/// per spec.md §4.B ("bytes wrap within the same segment"). Handy for tests
/// and for any caller that already has the bytes in hand.
pub struct SliceBytes<'a> {
    base: SegmentedAddress,
    bytes: &'a [u8],
}

impl<'a> SliceBytes<'a> {
    pub fn new(base: SegmentedAddress, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }
}

impl InstructionBytes for SliceBytes<'_> {
    fn read_u8(&self, address: SegmentedAddress) -> u8 {
        let delta = address.offset.wrapping_sub(self.base.offset);
        self.bytes[delta as usize]
    }
}
