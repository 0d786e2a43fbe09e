//! Labels, phandles and cross-references.
//!
//! Labels are read from a tree's `/__symbols__` node and bound to stable
//! [`NodeId`]s. An overlay refers to base labels through `/__fixups__`
//! (label → list of `path:property:offset` locations) and to its own nodes
//! through phandles listed in `/__local_fixups__`, which must be shifted above
//! the base tree's phandles before anything is merged.

use std::collections::BTreeMap;

use crate::tree::{NodeId, Tree};
use crate::{Error, Result};
use tracing::{debug, warn};

/// Node holding label → path bindings.
pub const SYMBOLS_NODE: &str = "__symbols__";

/// Node listing unresolved references to external labels.
pub const FIXUPS_NODE: &str = "__fixups__";

/// Node mirroring the tree, listing offsets of internal phandle references.
pub const LOCAL_FIXUPS_NODE: &str = "__local_fixups__";

/// Label → node table for one tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    labels: BTreeMap<String, NodeId>,
}

impl SymbolTable {
    /// Builds the table from `/__symbols__`. Labels whose path does not exist
    /// are skipped.
    pub fn from_tree(tree: &Tree) -> Result<Self> {
        let mut table = SymbolTable::default();
        let Some(symbols) = tree.child(NodeId::ROOT, SYMBOLS_NODE) else {
            return Ok(table);
        };
        for prop in tree.node(symbols).properties() {
            let path = prop.as_str().ok_or_else(|| {
                Error::malformed(format!("symbol {} is not a path string", prop.name))
            })?;
            match tree.find(path) {
                Some(id) => table.insert(&prop.name, id)?,
                None => warn!("Symbol {} points at missing node {}", prop.name, path),
            }
        }
        debug!("Loaded {} symbols", table.len());
        Ok(table)
    }

    /// Binds a label. Rebinding to a different node is an error.
    pub fn insert(&mut self, label: &str, id: NodeId) -> Result<()> {
        match self.labels.get(label) {
            Some(&existing) if existing != id => Err(Error::DuplicateLabel(label.to_string())),
            Some(_) => Ok(()),
            None => {
                self.labels.insert(label.to_string(), id);
                Ok(())
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.labels.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// A phandle slot inside the overlay that refers to a base label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub label: String,
    /// Path of the node holding the slot.
    pub path: String,
    pub property: String,
    /// Byte offset of the 32-bit slot within the property.
    pub offset: usize,
}

impl Reference {
    /// Parses a `path:property:offset` fixup location.
    fn parse(label: &str, location: &str) -> Result<Self> {
        let mut parts = location.rsplitn(3, ':');
        let (Some(offset), Some(property), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::malformed(format!(
                "fixup location {:?} is not path:property:offset",
                location
            )));
        };
        let offset = offset
            .parse()
            .map_err(|_| Error::malformed(format!("bad fixup offset in {:?}", location)))?;
        Ok(Reference {
            label: label.to_string(),
            path: path.to_string(),
            property: property.to_string(),
            offset,
        })
    }
}

/// References from an overlay to base labels, bound as soon as the label is
/// known and kept pending otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pending: Vec<Reference>,
}

impl References {
    /// Reads `/__fixups__` and binds every reference whose label the base
    /// tree defines. Nodes that are referenced but carry no phandle get one.
    pub fn bind(overlay: &mut Tree, base: &mut Tree, symbols: &SymbolTable) -> Result<Self> {
        let mut refs = Vec::new();
        if let Some(fixups) = overlay.child(NodeId::ROOT, FIXUPS_NODE) {
            for prop in overlay.node(fixups).properties() {
                let locations = prop.as_strings().ok_or_else(|| {
                    Error::malformed(format!("fixup {} is not a string list", prop.name))
                })?;
                for location in locations {
                    refs.push(Reference::parse(&prop.name, location)?);
                }
            }
        }

        let mut pending = Vec::new();
        for reference in refs {
            match symbols.get(&reference.label) {
                Some(node) => {
                    let phandle = base.ensure_phandle(node)?;
                    write_cell(overlay, &reference, phandle)?;
                    debug!(
                        "Bound {} at {}:{} to phandle {:#x}",
                        reference.label, reference.path, reference.property, phandle
                    );
                }
                None => {
                    check_slot(overlay, &reference)?;
                    debug!("Label {} not defined yet, left pending", reference.label);
                    pending.push(reference);
                }
            }
        }
        Ok(Self { pending })
    }

    pub fn pending(&self) -> &[Reference] {
        &self.pending
    }

    /// First pending reference whose slot lies inside the subtree at `root`.
    pub fn pending_within(&self, overlay: &Tree, root: NodeId) -> Option<&Reference> {
        self.pending.iter().find(|r| {
            overlay
                .find(&r.path)
                .is_some_and(|id| overlay.is_within(id, root))
        })
    }

    /// Pending reference at exactly this slot.
    pub fn pending_at(&self, path: &str, property: &str, offset: usize) -> Option<&Reference> {
        self.pending
            .iter()
            .find(|r| r.path == path && r.property == property && r.offset == offset)
    }
}

fn check_slot(tree: &Tree, reference: &Reference) -> Result<NodeId> {
    let id = tree.find(&reference.path).ok_or_else(|| {
        Error::malformed(format!("reference location {} does not exist", reference.path))
    })?;
    let len = tree
        .property(id, &reference.property)
        .map(|p| p.value.len())
        .ok_or_else(|| {
            Error::malformed(format!(
                "reference property {}:{} does not exist",
                reference.path, reference.property
            ))
        })?;
    if reference.offset.checked_add(4).map_or(true, |end| end > len) {
        return Err(Error::malformed(format!(
            "reference offset {} outside {}:{}",
            reference.offset, reference.path, reference.property
        )));
    }
    Ok(id)
}

fn write_cell(tree: &mut Tree, reference: &Reference, value: u32) -> Result<()> {
    let id = check_slot(tree, reference)?;
    if let Some(bytes) = tree.property_mut(id, &reference.property) {
        bytes[reference.offset..reference.offset + 4].copy_from_slice(&value.to_be_bytes());
    }
    Ok(())
}

fn shift_phandle(phandle: u32, delta: u32) -> Result<u32> {
    phandle
        .checked_add(delta)
        .filter(|&p| p != u32::MAX)
        .ok_or_else(|| {
            Error::malformed(format!(
                "phandle {:#x} cannot be moved above the base tree's phandles",
                phandle
            ))
        })
}

/// Shifts every phandle defined by the overlay, and every internal reference
/// to one, by `delta` so they cannot collide with the base tree's phandles.
pub fn renumber_local_phandles(overlay: &mut Tree, delta: u32) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    for id in overlay.ids().collect::<Vec<_>>() {
        for name in ["phandle", "linux,phandle"] {
            let Some(bytes) = overlay.property_mut(id, name) else {
                continue;
            };
            if bytes.len() != 4 {
                return Err(Error::malformed(format!("{} is not a single cell", name)));
            }
            let old = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if old != 0 && old != u32::MAX {
                bytes.copy_from_slice(&shift_phandle(old, delta)?.to_be_bytes());
            }
        }
    }

    let Some(local) = overlay.child(NodeId::ROOT, LOCAL_FIXUPS_NODE) else {
        return Ok(());
    };
    let mut work = vec![(local, NodeId::ROOT)];
    while let Some((fixup, target)) = work.pop() {
        for prop in overlay.node(fixup).properties().to_vec() {
            let offsets = prop.as_cells().ok_or_else(|| {
                Error::malformed(format!("local fixup {} is not a cell list", prop.name))
            })?;
            let path = overlay.path(target);
            let bytes = overlay.property_mut(target, &prop.name).ok_or_else(|| {
                Error::malformed(format!("local fixup names missing {}:{}", path, prop.name))
            })?;
            for offset in offsets {
                let at = offset as usize;
                let slot = bytes.get_mut(at..at.saturating_add(4)).ok_or_else(|| {
                    Error::malformed(format!("local fixup offset {} outside {}", at, prop.name))
                })?;
                let old = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);
                slot.copy_from_slice(&shift_phandle(old, delta)?.to_be_bytes());
            }
        }
        for &child in overlay.node(fixup).children() {
            let name = overlay.node(child).name();
            let mirrored = overlay.child(target, name).ok_or_else(|| {
                Error::malformed(format!("local fixup node {} has no counterpart", name))
            })?;
            work.push((child, mirrored));
        }
    }
    Ok(())
}
