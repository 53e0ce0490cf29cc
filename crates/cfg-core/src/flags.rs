use bitflags::bitflags;

bitflags! {
    /// The FLAGS register, bit positions per the Intel SDM (spec.md §4.F:
    /// "setting CF/PF/AF/ZF/SF/OF per Intel SDM").
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Flags {
    /// Sets or clears CF/ZF/SF/OF/AF/PF from an ALU result, matching how
    /// `add/sub/...` compute flags from the widened result and the inputs'
    /// sign bits (spec.md §4.F).
    pub fn set_arith(&mut self, cf: bool, of: bool, af: bool, result: u32, width_bits: u32) {
        self.set(Flags::CF, cf);
        self.set(Flags::OF, of);
        self.set(Flags::AF, af);
        self.update_sign_zero_parity(result, width_bits);
    }

    /// `and/or/xor/test`: CF=OF=0, ZF/SF/PF from the result (spec.md §4.F).
    pub fn set_logical(&mut self, result: u32, width_bits: u32) {
        self.set(Flags::CF, false);
        self.set(Flags::OF, false);
        self.update_sign_zero_parity(result, width_bits);
    }

    fn update_sign_zero_parity(&mut self, result: u32, width_bits: u32) {
        let mask = if width_bits == 32 { u32::MAX } else { (1u32 << width_bits) - 1 };
        let masked = result & mask;
        self.set(Flags::ZF, masked == 0);
        self.set(Flags::SF, masked & (1 << (width_bits - 1)) != 0);
        self.set(Flags::PF, (masked as u8).count_ones() % 2 == 0);
    }
}
