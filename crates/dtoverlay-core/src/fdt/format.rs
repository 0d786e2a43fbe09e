//! Flattened tree blob format definitions.
//!
//! Blob structure:
//! - Header: ten big-endian u32 words (40 bytes)
//! - Memory reservation block: (address, size) u64 pairs, zero terminated
//! - Structure block: token stream (begin node, property, end node, end)
//! - Strings block: NUL-terminated property names

use crate::{Error, Result};

/// Header magic.
pub const FDT_MAGIC: u32 = 0xD00D_FEED;

/// Size of the version 17 header.
pub const HEADER_SIZE: usize = 40;

/// Size of the version 16 header, which lacks `size_dt_struct`.
pub const V16_HEADER_SIZE: usize = 36;

/// Version written by the encoder.
pub const FDT_VERSION: u32 = 17;

/// Oldest version the written blob stays compatible with.
pub const FDT_LAST_COMP_VERSION: u32 = 16;

/// Size of one memory reservation entry.
pub const RESERVATION_SIZE: usize = 16;

/// Structure block tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Token {
    /// Start of a node, followed by its padded name.
    BeginNode = 0x1,
    /// End of a node.
    EndNode = 0x2,
    /// Property: length, name offset, padded value.
    Prop = 0x3,
    /// Ignored filler.
    Nop = 0x4,
    /// End of the structure block.
    End = 0x9,
}

impl Token {
    /// Converts a raw word to a token.
    pub fn from_word(word: u32) -> Result<Self> {
        match word {
            0x1 => Ok(Token::BeginNode),
            0x2 => Ok(Token::EndNode),
            0x3 => Ok(Token::Prop),
            0x4 => Ok(Token::Nop),
            0x9 => Ok(Token::End),
            other => Err(Error::malformed(format!("unknown token {:#x}", other))),
        }
    }
}

/// Memory reservation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reservation {
    pub address: u64,
    pub size: u64,
}

/// Blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl Header {
    /// Reads the header from the start of a blob. Version 16 headers carry
    /// no structure size; it is taken to run up to the strings block.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        if blob.len() < V16_HEADER_SIZE {
            return Err(Error::malformed(format!(
                "blob of {} bytes is shorter than the header",
                blob.len()
            )));
        }
        let word = |i: usize| read_u32(blob, i * 4).unwrap_or(0);
        let mut header = Header {
            magic: word(0),
            totalsize: word(1),
            off_dt_struct: word(2),
            off_dt_strings: word(3),
            off_mem_rsvmap: word(4),
            version: word(5),
            last_comp_version: word(6),
            boot_cpuid_phys: word(7),
            size_dt_strings: word(8),
            size_dt_struct: word(9),
        };
        if header.version < FDT_VERSION {
            let end = if header.off_dt_strings > header.off_dt_struct {
                header.off_dt_strings
            } else {
                header.totalsize
            };
            header.size_dt_struct = end.saturating_sub(header.off_dt_struct);
        }
        header.validate(blob.len())?;
        Ok(header)
    }

    fn validate(&self, available: usize) -> Result<()> {
        if self.magic != FDT_MAGIC {
            return Err(Error::malformed(format!("bad magic {:#010x}", self.magic)));
        }
        if self.version < FDT_LAST_COMP_VERSION || self.last_comp_version > FDT_VERSION {
            return Err(Error::malformed(format!(
                "unsupported version {} (last compatible {})",
                self.version, self.last_comp_version
            )));
        }
        let header_size = if self.version < FDT_VERSION {
            V16_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        let total = self.totalsize as usize;
        if total > available || total < header_size {
            return Err(Error::malformed(format!(
                "totalsize {} does not fit blob of {} bytes",
                total, available
            )));
        }
        let block_end = |off: u32, size: u32| off as usize + size as usize;
        if block_end(self.off_dt_struct, self.size_dt_struct) > total
            || block_end(self.off_dt_strings, self.size_dt_strings) > total
            || self.off_mem_rsvmap as usize > total
            || (self.off_dt_struct as usize) < header_size
        {
            return Err(Error::malformed("block offsets exceed totalsize"));
        }
        if self.off_dt_struct % 4 != 0 || self.off_mem_rsvmap % 8 != 0 {
            return Err(Error::malformed("misaligned block offsets"));
        }
        Ok(())
    }

    /// Writes the header into the first 40 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        let words = [
            self.magic,
            self.totalsize,
            self.off_dt_struct,
            self.off_dt_strings,
            self.off_mem_rsvmap,
            self.version,
            self.last_comp_version,
            self.boot_cpuid_phys,
            self.size_dt_strings,
            self.size_dt_struct,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
    }
}

/// Reads a big-endian u32 at `offset`, if in bounds.
pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a big-endian u64 at `offset`, if in bounds.
pub fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let hi = read_u32(buf, offset)? as u64;
    let lo = read_u32(buf, offset + 4)? as u64;
    Some((hi << 32) | lo)
}

/// Rounds up to the next 4-byte boundary.
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}
