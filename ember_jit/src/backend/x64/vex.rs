//! VEX prefix for AVX/AVX2 encodings.

/// Vector length selected by VEX.L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorLength {
    /// 128-bit (XMM).
    #[default]
    L128,
    /// 256-bit (YMM).
    L256,
}

/// Opcode map selected by VEX.mmmmm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpcodeMap {
    Map0F = 1,
    Map0F38 = 2,
    Map0F3A = 3,
}

/// VEX prefix fields.
///
/// `r`, `x` and `b` hold the extension bits as REX would; they are inverted
/// only when encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vex {
    pub l: VectorLength,
    /// Operand prefix: 0=none, 1=66, 2=F3, 3=F2.
    pub pp: u8,
    pub map: OpcodeMap,
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
    /// Second source register, 0..=15 (not inverted).
    pub vvvv: u8,
}

impl Vex {
    /// Whether the 2-byte form can express this prefix.
    #[inline]
    pub const fn can_use_2byte(&self) -> bool {
        !self.w && matches!(self.map, OpcodeMap::Map0F) && !self.x && !self.b
    }

    /// Encoded length in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        if self.can_use_2byte() { 2 } else { 3 }
    }

    #[inline]
    const fn vvvv_l_pp(&self) -> u8 {
        ((!self.vvvv & 0xF) << 3) | ((matches!(self.l, VectorLength::L256) as u8) << 2) | (self.pp & 0x3)
    }

    /// `C5 [R vvvv L pp]`.
    #[inline]
    pub const fn encode_2byte(&self) -> [u8; 2] {
        [0xC5, ((!self.r as u8) << 7) | self.vvvv_l_pp()]
    }

    /// `C4 [R X B mmmmm] [W vvvv L pp]`.
    #[inline]
    pub const fn encode_3byte(&self) -> [u8; 3] {
        let byte1 = ((!self.r as u8) << 7)
            | ((!self.x as u8) << 6)
            | ((!self.b as u8) << 5)
            | (self.map as u8);
        let byte2 = ((self.w as u8) << 7) | self.vvvv_l_pp();
        [0xC4, byte1, byte2]
    }

    /// Shortest encoding, written into `out`. Returns the byte count.
    pub fn encode_into(&self, out: &mut [u8; 3]) -> usize {
        if self.can_use_2byte() {
            let [a, b] = self.encode_2byte();
            out[0] = a;
            out[1] = b;
            2
        } else {
            *out = self.encode_3byte();
            3
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vex(map: OpcodeMap, r: bool, b: bool, vvvv: u8) -> Vex {
        Vex {
            l: VectorLength::L128,
            pp: 1,
            map,
            w: false,
            r,
            x: false,
            b,
            vvvv,
        }
    }

    #[test]
    fn test_two_byte_form() {
        // vpaddd xmm0, xmm1, xmm2 -> C5 F1 FE C2
        let v = vex(OpcodeMap::Map0F, false, false, 1);
        assert!(v.can_use_2byte());
        assert_eq!(v.encode_2byte(), [0xC5, 0xF1]);
    }

    #[test]
    fn test_b_extension_forces_three_bytes() {
        let v = vex(OpcodeMap::Map0F, false, true, 1);
        assert!(!v.can_use_2byte());
        assert_eq!(v.encode_3byte(), [0xC4, 0xC1, 0x71]);
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn test_map_0f38_forces_three_bytes() {
        let v = vex(OpcodeMap::Map0F38, false, false, 0);
        let mut out = [0; 3];
        assert_eq!(v.encode_into(&mut out), 3);
        assert_eq!(out, [0xC4, 0xE2, 0x79]);
    }

    #[test]
    fn test_vector_length_bit() {
        let mut v = vex(OpcodeMap::Map0F, true, false, 15);
        v.l = VectorLength::L256;
        v.pp = 0;
        assert_eq!(v.encode_2byte(), [0xC5, 0x04]);
    }
}
