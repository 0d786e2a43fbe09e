//! Blob decoder.

use super::format::{align4, read_u32, read_u64, Header, Reservation, Token, RESERVATION_SIZE};
use crate::symbols::SYMBOLS_NODE;
use crate::tree::{NodeId, Tree};
use crate::{Error, Result};
use tracing::debug;

/// Decodes a blob into a tree. Decoding is all-or-nothing.
pub fn decode(blob: &[u8]) -> Result<Tree> {
    let header = Header::parse(blob)?;
    let mut tree = Tree::new();

    let strings_start = header.off_dt_strings as usize;
    let strings = &blob[strings_start..strings_start + header.size_dt_strings as usize];
    let struct_start = header.off_dt_struct as usize;
    let structure = &blob[struct_start..struct_start + header.size_dt_struct as usize];

    let reservations = decode_reservations(blob, &header)?;
    StructReader::new(structure, strings).read_into(&mut tree)?;

    let blocks_end = (strings_start + strings.len()).max(struct_start + structure.len());
    let meta = tree.meta_mut();
    meta.boot_cpuid_phys = header.boot_cpuid_phys;
    meta.reservations = reservations;
    meta.strings = strings.to_vec();
    meta.padding = (header.totalsize as usize).saturating_sub(blocks_end);

    debug!(
        "Decoded blob: {} bytes, {} nodes, {} reservations",
        header.totalsize,
        tree.node_count(),
        tree.meta().reservations.len()
    );
    Ok(tree)
}

fn decode_reservations(blob: &[u8], header: &Header) -> Result<Vec<Reservation>> {
    let limit = header.totalsize as usize;
    let mut offset = header.off_mem_rsvmap as usize;
    let mut out = Vec::new();
    loop {
        if offset + RESERVATION_SIZE > limit {
            return Err(Error::malformed("unterminated memory reservation block"));
        }
        let address = read_u64(blob, offset).unwrap_or(0);
        let size = read_u64(blob, offset + 8).unwrap_or(0);
        if address == 0 && size == 0 {
            return Ok(out);
        }
        out.push(Reservation { address, size });
        offset += RESERVATION_SIZE;
    }
}

/// Cursor over the structure block.
struct StructReader<'a> {
    data: &'a [u8],
    strings: &'a [u8],
    pos: usize,
}

impl<'a> StructReader<'a> {
    fn new(data: &'a [u8], strings: &'a [u8]) -> Self {
        Self {
            data,
            strings,
            pos: 0,
        }
    }

    fn word(&mut self) -> Result<u32> {
        let w = read_u32(self.data, self.pos)
            .ok_or_else(|| Error::malformed("structure block ends mid-token"))?;
        self.pos += 4;
        Ok(w)
    }

    /// Next token, skipping NOPs.
    fn token(&mut self) -> Result<Token> {
        loop {
            match Token::from_word(self.word()?)? {
                Token::Nop => continue,
                token => return Ok(token),
            }
        }
    }

    fn node_name(&mut self) -> Result<&'a str> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed("unterminated node name"))?;
        let name = std::str::from_utf8(&rest[..len])
            .map_err(|_| Error::malformed("node name is not valid UTF-8"))?;
        self.pos = align4(self.pos + len + 1);
        Ok(name)
    }

    fn property(&mut self) -> Result<(&'a str, &'a [u8])> {
        let data: &'a [u8] = self.data;
        let len = self.word()? as usize;
        let nameoff = self.word()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| Error::malformed("property length overruns structure block"))?;
        let value = &data[self.pos..end];
        self.pos = align4(end);
        Ok((self.string_at(nameoff)?, value))
    }

    fn string_at(&self, offset: usize) -> Result<&'a str> {
        let strings: &'a [u8] = self.strings;
        let rest = strings
            .get(offset..)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::malformed(format!("name offset {} outside strings", offset)))?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed("unterminated property name"))?;
        std::str::from_utf8(&rest[..len])
            .map_err(|_| Error::malformed("property name is not valid UTF-8"))
    }

    fn read_into(mut self, tree: &mut Tree) -> Result<()> {
        if self.token()? != Token::BeginNode {
            return Err(Error::malformed("structure block does not start with a node"));
        }
        if !self.node_name()?.is_empty() {
            return Err(Error::malformed("root node must be unnamed"));
        }

        let mut stack: Vec<NodeId> = vec![NodeId::ROOT];
        while let Some(&current) = stack.last() {
            match self.token()? {
                Token::BeginNode => {
                    let name = self.node_name()?;
                    let child = tree.add_child(current, name)?;
                    stack.push(child);
                }
                Token::Prop => {
                    let (name, value) = self.property()?;
                    let in_symbols = current != NodeId::ROOT
                        && tree.node(current).name() == SYMBOLS_NODE
                        && tree.node(current).parent() == Some(NodeId::ROOT);
                    if in_symbols && tree.property(current, name).is_some() {
                        return Err(Error::DuplicateLabel(name.to_string()));
                    }
                    tree.add_property(current, name, value.to_vec())?;
                }
                Token::EndNode => {
                    stack.pop();
                }
                Token::End => {
                    return Err(Error::malformed(format!(
                        "unterminated node {}",
                        tree.path(current)
                    )));
                }
                Token::Nop => unreachable!("token() skips NOPs"),
            }
        }

        match self.token()? {
            Token::End => Ok(()),
            other => Err(Error::malformed(format!(
                "expected end token after root, got {:?}",
                other
            ))),
        }
    }
}
