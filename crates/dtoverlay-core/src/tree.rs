//! In-memory hardware tree.
//!
//! Nodes live in an append-only arena and are addressed by [`NodeId`]. Ids stay
//! valid for the lifetime of the tree and across [`Clone`], which is what lets
//! the symbol table and the fragment applier refer to nodes by index instead of
//! holding references into the graph.

use crate::fdt::format::Reservation;
use crate::value::PropertyValue;
use crate::{Error, Result};

/// Index of a node inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: NodeId = NodeId(0);

    /// Returns the arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named property with its raw big-endian value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

impl Property {
    /// Interprets the value as a single NUL-terminated string.
    pub fn as_str(&self) -> Option<&str> {
        let bytes = self.value.strip_suffix(&[0])?;
        if bytes.contains(&0) {
            return None;
        }
        std::str::from_utf8(bytes).ok()
    }

    /// Interprets the value as a list of NUL-terminated strings.
    pub fn as_strings(&self) -> Option<Vec<&str>> {
        let bytes = self.value.strip_suffix(&[0])?;
        bytes
            .split(|&b| b == 0)
            .map(|s| std::str::from_utf8(s).ok())
            .collect()
    }

    /// Interprets the value as a list of 32-bit cells.
    pub fn as_cells(&self) -> Option<Vec<u32>> {
        if self.value.len() % 4 != 0 {
            return None;
        }
        Some(
            self.value
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Interprets the value as exactly one 32-bit cell.
    pub fn as_u32(&self) -> Option<u32> {
        match self.value.as_slice() {
            [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }
}

/// A node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    properties: Vec<Property>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl Node {
    fn new(name: &str, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            properties: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }

    /// Full node name including any unit address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node name without the unit address.
    pub fn base_name(&self) -> &str {
        self.name.split('@').next().unwrap_or(&self.name)
    }

    /// The part after `@`, if any.
    pub fn unit_address(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, addr)| addr)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Blob-level metadata carried alongside the node graph so that encoding a
/// decoded tree reproduces the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMeta {
    /// Physical id of the boot CPU.
    pub boot_cpuid_phys: u32,
    /// Memory reservation block entries.
    pub reservations: Vec<Reservation>,
    /// Strings block of the decoded input; new names are appended after it.
    pub strings: Vec<u8>,
    /// Free space the input reserved after its last block.
    pub padding: usize,
}

/// Arena-backed hardware tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: Vec<Node>,
    meta: TreeMeta,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Creates a tree holding only an unnamed root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("", None)],
            meta: TreeMeta::default(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn meta(&self) -> &TreeMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut TreeMeta {
        &mut self.meta
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Appends a new child. Sibling names must be unique.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        if self.child(parent, name).is_some() {
            return Err(Error::malformed(format!(
                "duplicate node {} under {}",
                name,
                self.path(parent)
            )));
        }
        Ok(self.push_child(parent, name))
    }

    /// Returns the named child, creating it when absent.
    pub fn child_or_insert(&mut self, parent: NodeId, name: &str) -> NodeId {
        match self.child(parent, name) {
            Some(id) => id,
            None => self.push_child(parent, name),
        }
    }

    fn push_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Finds a direct child by exact name.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].name == name)
    }

    pub fn property(&self, id: NodeId, name: &str) -> Option<&Property> {
        self.nodes[id.0].property(name)
    }

    /// Sets a property, replacing the value in place when it already exists.
    pub fn set_property(&mut self, id: NodeId, name: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        let node = &mut self.nodes[id.0];
        match node.properties.iter_mut().find(|p| p.name == name) {
            Some(prop) => prop.value = value,
            None => node.properties.push(Property {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Sets a property from a typed value.
    pub fn set_value(&mut self, id: NodeId, name: &str, value: PropertyValue) {
        self.set_property(id, name, value.to_bytes());
    }

    /// Appends a property that must not exist yet.
    pub(crate) fn add_property(&mut self, id: NodeId, name: &str, value: Vec<u8>) -> Result<()> {
        if self.property(id, name).is_some() {
            return Err(Error::malformed(format!(
                "duplicate property {} in {}",
                name,
                self.path(id)
            )));
        }
        self.nodes[id.0].properties.push(Property {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    /// Mutable access to a property's value bytes.
    pub fn property_mut(&mut self, id: NodeId, name: &str) -> Option<&mut Vec<u8>> {
        self.nodes[id.0]
            .properties
            .iter_mut()
            .find(|p| p.name == name)
            .map(|p| &mut p.value)
    }

    pub fn remove_property(&mut self, id: NodeId, name: &str) -> Option<Vec<u8>> {
        let props = &mut self.nodes[id.0].properties;
        let pos = props.iter().position(|p| p.name == name)?;
        Some(props.remove(pos).value)
    }

    /// Absolute path of a node.
    pub fn path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur.0].parent {
            parts.push(self.nodes[cur.0].name.as_str());
            cur = parent;
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Looks up an absolute path. A component without a unit address also
    /// matches a child carrying one, when the exact name is absent.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let rest = path.strip_prefix('/')?;
        let mut cur = NodeId::ROOT;
        for part in rest.split('/').filter(|p| !p.is_empty()) {
            cur = match self.child(cur, part) {
                Some(id) => id,
                None if !part.contains('@') => self.nodes[cur.0]
                    .children
                    .iter()
                    .copied()
                    .find(|&c| self.nodes[c.0].base_name() == part)?,
                None => return None,
            };
        }
        Some(cur)
    }

    /// Phandle of a node, from `phandle` or the legacy `linux,phandle`.
    pub fn phandle(&self, id: NodeId) -> Option<u32> {
        let node = &self.nodes[id.0];
        node.property("phandle")
            .or_else(|| node.property("linux,phandle"))
            .and_then(Property::as_u32)
    }

    pub fn find_by_phandle(&self, phandle: u32) -> Option<NodeId> {
        if phandle == 0 || phandle == u32::MAX {
            return None;
        }
        self.ids().find(|&id| self.phandle(id) == Some(phandle))
    }

    /// Highest phandle in use, 0 when there is none.
    pub fn max_phandle(&self) -> u32 {
        self.ids()
            .filter_map(|id| self.phandle(id))
            .filter(|&p| p != u32::MAX)
            .max()
            .unwrap_or(0)
    }

    /// Returns the node's phandle, allocating the next free one if needed.
    pub fn ensure_phandle(&mut self, id: NodeId) -> Result<u32> {
        if let Some(p) = self.phandle(id) {
            return Ok(p);
        }
        let p = self
            .max_phandle()
            .checked_add(1)
            .filter(|&p| p != u32::MAX)
            .ok_or_else(|| Error::malformed("no free phandle left"))?;
        self.set_property(id, "phandle", p.to_be_bytes().to_vec());
        Ok(p)
    }

    /// All node ids in arena order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Pre-order walk of the subtree rooted at `id`, parent before children.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            out.push(cur);
            stack.extend(self.nodes[cur.0].children.iter().rev().copied());
        }
        out
    }

    /// True when `id` lies inside the subtree rooted at `ancestor`.
    pub fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.nodes[c.0].parent;
        }
        false
    }
}
