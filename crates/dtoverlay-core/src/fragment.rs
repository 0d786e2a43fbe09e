//! Overlay fragments and the merge that applies them.
//!
//! A fragment is a root child of the overlay holding a `target` phandle or a
//! `target-path`, and a patch subtree named `__overlay__` (applied) or
//! `__dormant__` (inert until an override activates it).

use std::collections::HashMap;
use std::fmt;

use crate::symbols::{References, SymbolTable, SYMBOLS_NODE};
use crate::tree::{NodeId, Tree};
use crate::{Error, Result};
use tracing::{debug, info};

/// Patch node of a fragment that starts active.
pub const OVERLAY_NODE: &str = "__overlay__";

/// Patch node of a fragment that starts dormant.
pub const DORMANT_NODE: &str = "__dormant__";

/// Activation state of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    /// Retained but not merged.
    Dormant,
    /// Merged into the resolved tree.
    Active,
}

impl fmt::Display for FragmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentState::Dormant => write!(f, "dormant"),
            FragmentState::Active => write!(f, "active"),
        }
    }
}

/// Where a fragment's patch is merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `target = <&label>`, resolved to a phandle.
    Phandle(u32),
    /// `target-path = "/soc/gpio"`.
    Path(String),
    /// `target-path = "gpio"`, a label name.
    Label(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Phandle(p) => write!(f, "<{:#x}>", p),
            Target::Path(p) => write!(f, "{}", p),
            Target::Label(l) => write!(f, "&{}", l),
        }
    }
}

/// One patch unit of an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: u32,
    /// The fragment node in the overlay tree.
    pub node: NodeId,
    /// The patch subtree root in the overlay tree.
    pub patch: NodeId,
    pub target: Target,
    state: FragmentState,
}

impl Fragment {
    pub fn state(&self) -> FragmentState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == FragmentState::Active
    }

    /// Moves a dormant fragment to active. Returns false when it already was.
    pub fn activate(&mut self) -> bool {
        let changed = self.state == FragmentState::Dormant;
        self.state = FragmentState::Active;
        changed
    }

    /// Handles a deactivation request. Dormant fragments stay dormant; a
    /// fragment that is already active cannot be taken back.
    pub fn deactivate(&self) -> Result<()> {
        match self.state {
            FragmentState::Dormant => Ok(()),
            FragmentState::Active => Err(Error::IrreversibleFragment(self.id)),
        }
    }
}

/// Collects the overlay's fragments in ascending id order.
pub fn collect(overlay: &Tree) -> Result<Vec<Fragment>> {
    let mut fragments = Vec::new();
    for (position, &node) in overlay.node(NodeId::ROOT).children().iter().enumerate() {
        let (patch, state) = match (
            overlay.child(node, OVERLAY_NODE),
            overlay.child(node, DORMANT_NODE),
        ) {
            (Some(_), Some(_)) => {
                return Err(Error::malformed(format!(
                    "{} has both {} and {}",
                    overlay.path(node),
                    OVERLAY_NODE,
                    DORMANT_NODE
                )))
            }
            (Some(p), None) => (p, FragmentState::Active),
            (None, Some(p)) => (p, FragmentState::Dormant),
            (None, None) => continue,
        };
        let id = overlay
            .node(node)
            .unit_address()
            .and_then(|addr| addr.parse::<u32>().ok())
            .unwrap_or(position as u32);
        let target = read_target(overlay, node)?;
        fragments.push(Fragment {
            id,
            node,
            patch,
            target,
            state,
        });
    }
    fragments.sort_by_key(|f| f.id);
    if let Some(pair) = fragments.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(Error::malformed(format!("duplicate fragment id {}", pair[0].id)));
    }
    debug!(
        "Found {} fragments ({} dormant)",
        fragments.len(),
        fragments.iter().filter(|f| !f.is_active()).count()
    );
    Ok(fragments)
}

fn read_target(overlay: &Tree, node: NodeId) -> Result<Target> {
    if let Some(prop) = overlay.property(node, "target") {
        let phandle = prop.as_u32().ok_or_else(|| {
            Error::malformed(format!("{}: target is not a phandle", overlay.path(node)))
        })?;
        return Ok(Target::Phandle(phandle));
    }
    if let Some(prop) = overlay.property(node, "target-path") {
        let path = prop.as_str().ok_or_else(|| {
            Error::malformed(format!("{}: target-path is not a string", overlay.path(node)))
        })?;
        return Ok(if path.starts_with('/') {
            Target::Path(path.to_string())
        } else {
            Target::Label(path.to_string())
        });
    }
    Err(Error::malformed(format!("{} has no target", overlay.path(node))))
}

/// Merges fragments into a copy of the base tree.
pub struct Applier<'a> {
    pub overlay: &'a Tree,
    pub references: &'a References,
    /// Labels of the base tree; node ids stay valid in the merged copy.
    pub base_symbols: &'a SymbolTable,
}

impl Applier<'_> {
    /// Produces the merged tree: `base` plus every active fragment, applied
    /// in ascending id order, plus the labels those fragments carry.
    pub fn merge(&self, base: &Tree, fragments: &[Fragment]) -> Result<Tree> {
        let mut merged = base.clone();
        let mut origin: HashMap<NodeId, NodeId> = HashMap::new();
        let overlay_symbols = SymbolTable::from_tree(self.overlay)?;

        for fragment in fragments.iter().filter(|f| f.is_active()) {
            if let Some(pending) = self.references.pending_within(self.overlay, fragment.node) {
                return Err(if pending.property == "target" {
                    Error::UnresolvedTarget {
                        fragment: fragment.id,
                    }
                } else {
                    Error::UnresolvedSymbol(pending.label.clone())
                });
            }
            let target = self
                .resolve_target(&merged, fragment, &overlay_symbols, &origin)
                .ok_or(Error::UnresolvedTarget {
                    fragment: fragment.id,
                })?;
            debug!(
                "Merging fragment {} into {}",
                fragment.id,
                merged.path(target)
            );
            merge_node(&mut merged, target, self.overlay, fragment.patch, &mut origin);
        }

        self.export_symbols(&mut merged, &overlay_symbols, &origin)?;
        info!(
            "Merged {} of {} fragments",
            fragments.iter().filter(|f| f.is_active()).count(),
            fragments.len()
        );
        Ok(merged)
    }

    /// Labels resolve against the base tree first, then against overlay
    /// nodes already merged by an earlier fragment, then against whatever
    /// `/__symbols__` holds by now.
    fn resolve_target(
        &self,
        merged: &Tree,
        fragment: &Fragment,
        overlay_symbols: &SymbolTable,
        origin: &HashMap<NodeId, NodeId>,
    ) -> Option<NodeId> {
        match &fragment.target {
            Target::Phandle(p) => merged.find_by_phandle(*p),
            Target::Path(path) => merged.find(path),
            Target::Label(label) => self
                .base_symbols
                .get(label)
                .or_else(|| {
                    overlay_symbols
                        .get(label)
                        .and_then(|node| origin.get(&node).copied())
                })
                .or_else(|| {
                    let symbols = merged.child(NodeId::ROOT, SYMBOLS_NODE)?;
                    merged.find(merged.property(symbols, label)?.as_str()?)
                }),
        }
    }

    /// Adds the overlay's labels for merged nodes to `/__symbols__`, when the
    /// base tree keeps one.
    fn export_symbols(
        &self,
        merged: &mut Tree,
        overlay_symbols: &SymbolTable,
        origin: &HashMap<NodeId, NodeId>,
    ) -> Result<()> {
        let Some(symbols) = merged.child(NodeId::ROOT, SYMBOLS_NODE) else {
            return Ok(());
        };
        for (label, overlay_node) in overlay_symbols.iter() {
            let Some(&node) = origin.get(&overlay_node) else {
                continue;
            };
            let path = merged.path(node);
            if let Some(existing) = merged.property(symbols, label) {
                if existing.as_str() != Some(path.as_str()) {
                    return Err(Error::DuplicateLabel(label.to_string()));
                }
                continue;
            }
            let mut value = path.into_bytes();
            value.push(0);
            merged.set_property(symbols, label, value);
        }
        Ok(())
    }
}

/// Recursively merges `src` (in `overlay`) into `dst` (in `merged`):
/// properties overwrite, same-named children merge, others are appended.
fn merge_node(
    merged: &mut Tree,
    dst: NodeId,
    overlay: &Tree,
    src: NodeId,
    origin: &mut HashMap<NodeId, NodeId>,
) {
    origin.insert(src, dst);
    for prop in overlay.node(src).properties() {
        merged.set_property(dst, &prop.name, prop.value.clone());
    }
    for &child in overlay.node(src).children() {
        let target = merged.child_or_insert(dst, overlay.node(child).name());
        merge_node(merged, target, overlay, child, origin);
    }
}
