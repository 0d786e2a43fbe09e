//! Blob serializer.
//!
//! Layout matches what a devicetree compiler emits: header, reservation
//! block, structure block, strings block, with no padding between them and
//! any reserved free space at the end. The strings block and trailing space
//! of a decoded tree are reused as-is so that an unmodified tree encodes to
//! the bytes it was decoded from. NOP tokens are not reproduced.

use super::format::{
    Header, Token, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_VERSION, HEADER_SIZE, RESERVATION_SIZE,
};
use crate::tree::{NodeId, Tree};
use crate::{Error, Result};
use tracing::debug;

/// Property-name table with suffix sharing.
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn new(seed: &[u8]) -> Self {
        Self {
            data: seed.to_vec(),
        }
    }

    /// Offset of `name`, appending it when no existing entry (or entry
    /// suffix) matches.
    fn offset(&mut self, name: &str) -> u32 {
        let mut needle = name.as_bytes().to_vec();
        needle.push(0);
        if let Some(pos) = self
            .data
            .windows(needle.len())
            .position(|w| w == needle.as_slice())
        {
            return pos as u32;
        }
        let pos = self.data.len();
        self.data.extend_from_slice(&needle);
        pos as u32
    }
}

/// Builds the structure block.
struct StructWriter<'t> {
    tree: &'t Tree,
    strings: StringTable,
    out: Vec<u8>,
}

impl<'t> StructWriter<'t> {
    fn token(&mut self, token: Token) {
        self.out.extend_from_slice(&(token as u32).to_be_bytes());
    }

    fn word(&mut self, word: u32) {
        self.out.extend_from_slice(&word.to_be_bytes());
    }

    fn padded(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
        while self.out.len() % 4 != 0 {
            self.out.push(0);
        }
    }

    fn node(&mut self, id: NodeId) {
        let tree = self.tree;
        let node = tree.node(id);
        self.token(Token::BeginNode);
        let mut name = node.name().as_bytes().to_vec();
        name.push(0);
        self.padded(&name);
        for prop in node.properties() {
            let nameoff = self.strings.offset(&prop.name);
            self.token(Token::Prop);
            self.word(prop.value.len() as u32);
            self.word(nameoff);
            self.padded(&prop.value);
        }
        for &child in node.children() {
            self.node(child);
        }
        self.token(Token::EndNode);
    }
}

/// Encodes a tree into a freshly allocated blob.
pub fn encode(tree: &Tree) -> Vec<u8> {
    let mut writer = StructWriter {
        tree,
        strings: StringTable::new(&tree.meta().strings),
        out: Vec::new(),
    };
    writer.node(NodeId::ROOT);
    writer.token(Token::End);
    let structure = writer.out;
    let strings = writer.strings.data;

    let reservations = &tree.meta().reservations;
    let rsv_size = (reservations.len() + 1) * RESERVATION_SIZE;
    let off_struct = HEADER_SIZE + rsv_size;
    let off_strings = off_struct + structure.len();
    let total = off_strings + strings.len() + tree.meta().padding;

    let mut blob = vec![0u8; total];
    Header {
        magic: FDT_MAGIC,
        totalsize: total as u32,
        off_dt_struct: off_struct as u32,
        off_dt_strings: off_strings as u32,
        off_mem_rsvmap: HEADER_SIZE as u32,
        version: FDT_VERSION,
        last_comp_version: FDT_LAST_COMP_VERSION,
        boot_cpuid_phys: tree.meta().boot_cpuid_phys,
        size_dt_strings: strings.len() as u32,
        size_dt_struct: structure.len() as u32,
    }
    .write(&mut blob);

    for (i, rsv) in reservations.iter().enumerate() {
        let at = HEADER_SIZE + i * RESERVATION_SIZE;
        blob[at..at + 8].copy_from_slice(&rsv.address.to_be_bytes());
        blob[at + 8..at + 16].copy_from_slice(&rsv.size.to_be_bytes());
    }
    blob[off_struct..off_strings].copy_from_slice(&structure);
    blob[off_strings..off_strings + strings.len()].copy_from_slice(&strings);

    debug!(
        "Encoded {} nodes into {} bytes ({} struct, {} strings)",
        tree.node_count(),
        total,
        structure.len(),
        strings.len()
    );
    blob
}

/// Encodes a tree, failing when the blob would exceed `capacity` bytes.
pub fn encode_with_limit(tree: &Tree, capacity: usize) -> Result<Vec<u8>> {
    let blob = encode(tree);
    if blob.len() > capacity {
        return Err(Error::OutputOverflow {
            needed: blob.len(),
            capacity,
        });
    }
    Ok(blob)
}

/// Encodes a tree into a caller-provided buffer, returning the bytes used.
pub fn encode_into(tree: &Tree, out: &mut [u8]) -> Result<usize> {
    let blob = encode_with_limit(tree, out.len())?;
    out[..blob.len()].copy_from_slice(&blob);
    Ok(blob.len())
}
