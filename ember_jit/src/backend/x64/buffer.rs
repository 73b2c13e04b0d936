//! Growable code buffer.

/// Kind of relocation recorded against a position in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// A 32-bit displacement that needs the constant-area start added.
    ConstantArea,
}

/// A position in the buffer that must be patched at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerFixup {
    /// Offset of the 32-bit patch site.
    pub position: usize,
    /// What to add.
    pub kind: FixupKind,
}

/// Byte buffer that instructions are appended to.
#[derive(Debug, Default, Clone)]
pub struct AssemblerBuffer {
    bytes: Vec<u8>,
    fixups: Vec<AssemblerFixup>,
}

impl AssemblerBuffer {
    /// Initial capacity, enough for a small method.
    pub const INITIAL_CAPACITY: usize = 4 * 1024;

    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(Self::INITIAL_CAPACITY),
            fixups: Vec::new(),
        }
    }

    /// Number of bytes emitted.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Reserve room for at least `additional` more bytes.
    #[inline]
    pub fn ensure_capacity(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Append one byte.
    #[inline]
    pub fn emit_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    /// Append a little-endian u16.
    #[inline]
    pub fn emit_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a little-endian u32.
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a little-endian u64.
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append raw bytes.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Read the byte at `position`.
    #[inline]
    pub fn load_u8(&self, position: usize) -> u8 {
        self.bytes[position]
    }

    /// Overwrite the byte at `position`.
    #[inline]
    pub fn store_u8(&mut self, position: usize, value: u8) {
        self.bytes[position] = value;
    }

    /// Read the u32 at `position`.
    #[inline]
    pub fn load_u32(&self, position: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[position..position + 4]);
        u32::from_le_bytes(raw)
    }

    /// Overwrite the u32 at `position`.
    #[inline]
    pub fn store_u32(&mut self, position: usize, value: u32) {
        self.bytes[position..position + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Record a fixup for the 32-bit slot at `position`.
    pub fn add_fixup(&mut self, position: usize, kind: FixupKind) {
        self.fixups.push(AssemblerFixup { position, kind });
    }

    /// Recorded fixups in emission order.
    pub fn fixups(&self) -> &[AssemblerFixup] {
        &self.fixups
    }

    /// Emitted bytes.
    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the buffer.
    pub fn into_parts(self) -> (Vec<u8>, Vec<AssemblerFixup>) {
        (self.bytes, self.fixups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_patch() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u8(0xE9);
        buf.emit_u32(0);
        buf.emit_u16(0xBEEF);
        assert_eq!(buf.size(), 7);

        buf.store_u32(1, 0x1234_5678);
        assert_eq!(buf.load_u32(1), 0x1234_5678);
        assert_eq!(buf.contents(), &[0xE9, 0x78, 0x56, 0x34, 0x12, 0xEF, 0xBE]);
    }

    #[test]
    fn test_fixups_recorded() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u64(0);
        buf.add_fixup(4, FixupKind::ConstantArea);
        assert_eq!(
            buf.fixups(),
            &[AssemblerFixup {
                position: 4,
                kind: FixupKind::ConstantArea
            }]
        );
        let (bytes, fixups) = buf.into_parts();
        assert_eq!(bytes.len(), 8);
        assert_eq!(fixups.len(), 1);
    }
}
