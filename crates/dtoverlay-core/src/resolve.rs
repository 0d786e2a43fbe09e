//! Resolution of a base tree, an overlay and a list of overrides.
//!
//! A [`Resolution`] owns everything one resolution needs: the base tree, the
//! overlay (renumbered and bound to the base's labels), its fragments and
//! rules, and the merged result. Overrides are applied one at a time; each
//! is planned first, then applied to copies of the state which replace the
//! current state only when the override succeeded as a whole.

use crate::fdt;
use crate::fragment::{self, Applier, Fragment, FragmentState};
use crate::overrides::{OverrideRule, OverrideSet, RuleSource, Step, OVERRIDES_NODE};
use crate::symbols::{renumber_local_phandles, References, SymbolTable};
use crate::tree::{NodeId, Tree};
use crate::{Error, Result};
use tracing::{debug, info};

/// Which tree an edit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Base,
    Overlay,
}

/// The mutable part of a resolution, swapped in as a unit.
#[derive(Debug, Clone)]
struct State {
    base: Tree,
    overlay: Tree,
    fragments: Vec<Fragment>,
    merged: Tree,
}

/// One resolution of a base tree against an optional overlay.
#[derive(Debug, Clone)]
pub struct Resolution {
    state: State,
    references: References,
    base_symbols: SymbolTable,
    overlay_rules: OverrideSet,
    base_rules: OverrideSet,
}

impl Resolution {
    /// Decodes both blobs and merges the overlay's active fragments.
    pub fn new(base: &[u8], overlay: Option<&[u8]>) -> Result<Self> {
        let base = fdt::decode(base)?;
        let overlay = overlay.map(fdt::decode).transpose()?;
        Self::from_trees(base, overlay)
    }

    /// Same as [`Resolution::new`] for trees that are already decoded.
    pub fn from_trees(mut base: Tree, overlay: Option<Tree>) -> Result<Self> {
        let mut overlay = overlay.unwrap_or_default();
        let base_symbols = SymbolTable::from_tree(&base)?;

        let references = References::bind(&mut overlay, &mut base, &base_symbols)?;
        renumber_local_phandles(&mut overlay, base.max_phandle())?;

        let fragments = fragment::collect(&overlay)?;
        let overlay_rules = OverrideSet::from_tree(&overlay, RuleSource::Overlay)?;
        let base_rules = OverrideSet::from_tree(&base, RuleSource::Base)?;

        let merged = Applier {
            overlay: &overlay,
            references: &references,
            base_symbols: &base_symbols,
        }
        .merge(&base, &fragments)?;

        info!(
            "Resolution ready: {} fragments, {} overlay rules, {} base rules, {} pending references",
            fragments.len(),
            overlay_rules.rules().len(),
            base_rules.rules().len(),
            references.pending().len()
        );

        Ok(Self {
            state: State {
                base,
                overlay,
                fragments,
                merged,
            },
            references,
            base_symbols,
            overlay_rules,
            base_rules,
        })
    }

    /// The merged tree as it currently stands.
    pub fn tree(&self) -> &Tree {
        &self.state.merged
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.state.fragments
    }

    pub fn fragment_state(&self, id: u32) -> Option<FragmentState> {
        self.state
            .fragments
            .iter()
            .find(|f| f.id == id)
            .map(Fragment::state)
    }

    /// Every rule that can be applied, overlay rules first.
    pub fn rules(&self) -> impl Iterator<Item = &OverrideRule> {
        self.overlay_rules
            .rules()
            .iter()
            .chain(self.base_rules.rules())
    }

    /// Looks up a rule, the overlay's taking precedence over the base tree's.
    pub fn rule(&self, name: &str) -> Option<&OverrideRule> {
        self.overlay_rules
            .get(name)
            .or_else(|| self.base_rules.get(name))
    }

    /// Applies one `name=value` override. On error nothing changes.
    pub fn apply_override(&mut self, name: &str, value: &str) -> Result<()> {
        let rule = self
            .rule(name)
            .ok_or_else(|| Error::UnknownOverride(name.to_string()))?;
        let steps = rule.plan(value)?;
        let source = rule.source;

        let mut next = self.state.clone();
        for step in &steps {
            self.apply_step(&mut next, name, source, step)?;
        }
        next.merged = Applier {
            overlay: &next.overlay,
            references: &self.references,
            base_symbols: &self.base_symbols,
        }
        .merge(&next.base, &next.fragments)?;

        self.state = next;
        info!("Applied override {}={}", name, value);
        Ok(())
    }

    /// Applies overrides in order, stopping at the first failure.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in overrides {
            self.apply_override(name, value)?;
        }
        Ok(())
    }

    fn apply_step(&self, next: &mut State, rule: &str, source: RuleSource, step: &Step) -> Result<()> {
        let edit = match step {
            Step::Fragment { id, activate } => {
                let fragment = next
                    .fragments
                    .iter_mut()
                    .find(|f| f.id == *id)
                    .ok_or_else(|| {
                        Error::malformed(format!("override {} toggles unknown fragment {}", rule, id))
                    })?;
                if *activate {
                    if fragment.activate() {
                        debug!("Fragment {} activated by {}", id, rule);
                    }
                } else {
                    fragment.deactivate()?;
                }
                return Ok(());
            }
            Step::Replace { edit, .. } | Step::Patch { edit, .. } | Step::Flag { edit, .. } => edit,
        };

        if source == RuleSource::Overlay {
            let path = format!("/{}", OVERRIDES_NODE);
            if let Some(pending) = self.references.pending_at(&path, rule, edit.slot) {
                return Err(Error::UnresolvedSymbol(pending.label.clone()));
            }
        }
        let (side, node) = locate(next, source, edit.phandle)
            .ok_or_else(|| Error::UnresolvedSymbol(format!("phandle {:#x}", edit.phandle)))?;
        let tree = match side {
            Side::Base => &mut next.base,
            Side::Overlay => &mut next.overlay,
        };

        match step {
            Step::Replace { value, .. } => tree.set_property(node, &edit.property, value.clone()),
            Step::Patch { offset, bytes, .. } => patch(tree, node, &edit.property, *offset, bytes)?,
            Step::Flag { present: true, .. } => {
                if tree.property(node, &edit.property).is_none() {
                    tree.set_property(node, &edit.property, Vec::new());
                }
            }
            Step::Flag { present: false, .. } => {
                tree.remove_property(node, &edit.property);
            }
            Step::Fragment { .. } => {}
        }
        debug!(
            "{} edited {}:{} in {:?} tree",
            rule,
            tree.path(node),
            edit.property,
            side
        );
        Ok(())
    }

    /// Gives up the merged tree without encoding it, e.g. to use it as the
    /// base of the next overlay.
    pub fn into_tree(self) -> Tree {
        self.state.merged
    }

    /// Encodes the merged tree.
    pub fn finish(self) -> Vec<u8> {
        fdt::encode(&self.state.merged)
    }

    /// Encodes the merged tree within a size limit.
    pub fn finish_with_limit(self, capacity: usize) -> Result<Vec<u8>> {
        fdt::encode_with_limit(&self.state.merged, capacity)
    }
}

/// Finds the node a rule's phandle names. Overlay rules may point into the
/// overlay or, through fixups, into the base tree.
fn locate(state: &State, source: RuleSource, phandle: u32) -> Option<(Side, NodeId)> {
    if source == RuleSource::Overlay {
        if let Some(id) = state.overlay.find_by_phandle(phandle) {
            return Some((Side::Overlay, id));
        }
    }
    state
        .base
        .find_by_phandle(phandle)
        .map(|id| (Side::Base, id))
}

/// Overwrites `bytes` at `offset`, leaving the rest of the property intact.
/// A missing property is created when the write starts at offset 0.
fn patch(tree: &mut Tree, node: NodeId, property: &str, offset: usize, bytes: &[u8]) -> Result<()> {
    let Some(value) = tree.property_mut(node, property) else {
        if offset == 0 {
            tree.set_property(node, property, bytes.to_vec());
            return Ok(());
        }
        return Err(Error::OutOfRange {
            property: property.to_string(),
            offset,
            width: bytes.len(),
            len: 0,
        });
    };
    let Some(end) = offset
        .checked_add(bytes.len())
        .filter(|&end| end <= value.len())
    else {
        return Err(Error::OutOfRange {
            property: property.to_string(),
            offset,
            width: bytes.len(),
            len: value.len(),
        });
    };
    value[offset..end].copy_from_slice(bytes);
    Ok(())
}

/// Resolves in one call: decode, merge, apply `overrides` in order, encode.
/// `capacity` bounds the output size when given.
pub fn resolve<'a, I>(
    base: &[u8],
    overlay: Option<&[u8]>,
    overrides: I,
    capacity: Option<usize>,
) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut resolution = Resolution::new(base, overlay)?;
    resolution.apply_overrides(overrides)?;
    match capacity {
        Some(capacity) => resolution.finish_with_limit(capacity),
        None => Ok(resolution.finish()),
    }
}
