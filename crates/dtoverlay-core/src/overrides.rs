//! Override rules.
//!
//! Rules are declared as properties of an `/__overrides__` node. A rule's
//! value is a sequence of entries, each a 32-bit phandle immediately followed
//! by a NUL-terminated string (no padding in between):
//!
//! - phandle 0: fragment toggles, e.g. `"=104=105!103"`
//! - otherwise: a property edit on the node with that phandle:
//!   - `"name"`: replace with the argument as a string
//!   - `"name:4"`, `"name;2"`, `"name.1"`, `"name#8"`: write a 32/16/8/64-bit
//!     integer at the given byte offset
//!   - `"name?"`: boolean, property present when true, removed when false
//!   - any of the above with `=literal` appended writes the literal instead of
//!     the argument

use std::fmt;

use crate::fdt::format::read_u32;
use crate::tree::{NodeId, Tree};
use crate::value::{parse_bool, parse_integer};
use crate::{Error, Result};
use tracing::debug;

/// Node holding override declarations.
pub const OVERRIDES_NODE: &str = "__overrides__";

/// A fragment toggle, keyed by the argument's truth value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// `+N`: activate when true.
    Enable(u32),
    /// `-N`: deactivate when true.
    Disable(u32),
    /// `=N`: activate when true, deactivate when false.
    Follow(u32),
    /// `!N`: deactivate when true, activate when false.
    Invert(u32),
}

impl Toggle {
    /// Parses a toggle list such as `"=104 =105!103"`.
    pub fn parse_list(decl: &str) -> Result<Vec<Toggle>> {
        let mut out = Vec::new();
        let mut chars = decl.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_whitespace() {
                continue;
            }
            let mut end = start + c.len_utf8();
            while let Some(&(i, d)) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                end = i + 1;
                chars.next();
            }
            let id: u32 = decl[start + c.len_utf8()..end].parse().map_err(|_| {
                Error::malformed(format!("bad fragment toggle {:?}", &decl[start..end]))
            })?;
            out.push(match c {
                '+' => Toggle::Enable(id),
                '-' => Toggle::Disable(id),
                '=' => Toggle::Follow(id),
                '!' => Toggle::Invert(id),
                other => {
                    return Err(Error::malformed(format!(
                        "bad fragment toggle operator {:?}",
                        other
                    )))
                }
            });
        }
        Ok(out)
    }

    /// The fragment and requested state for a given argument, if any.
    pub fn effect(&self, flag: bool) -> Option<(u32, bool)> {
        match *self {
            Toggle::Enable(id) => flag.then_some((id, true)),
            Toggle::Disable(id) => flag.then_some((id, false)),
            Toggle::Follow(id) => Some((id, flag)),
            Toggle::Invert(id) => Some((id, !flag)),
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toggle::Enable(id) => write!(f, "+{}", id),
            Toggle::Disable(id) => write!(f, "-{}", id),
            Toggle::Follow(id) => write!(f, "={}", id),
            Toggle::Invert(id) => write!(f, "!{}", id),
        }
    }
}

/// How an edit interprets its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Whole property replaced by a NUL-terminated string.
    String,
    /// Big-endian integer of this many bytes.
    Integer(usize),
    /// Presence flag.
    Boolean,
}

impl EditKind {
    fn from_separator(sep: char) -> Option<Self> {
        match sep {
            '.' => Some(EditKind::Integer(1)),
            ';' => Some(EditKind::Integer(2)),
            ':' => Some(EditKind::Integer(4)),
            '#' => Some(EditKind::Integer(8)),
            _ => None,
        }
    }

    fn separator(&self) -> &'static str {
        match self {
            EditKind::Integer(1) => ".",
            EditKind::Integer(2) => ";",
            EditKind::Integer(8) => "#",
            EditKind::Integer(_) => ":",
            EditKind::String | EditKind::Boolean => "",
        }
    }

    /// Human-readable name used in type errors.
    pub fn expected(&self) -> &'static str {
        match self {
            EditKind::String => "string",
            EditKind::Integer(1) => "8-bit integer",
            EditKind::Integer(2) => "16-bit integer",
            EditKind::Integer(8) => "64-bit integer",
            EditKind::Integer(_) => "32-bit integer",
            EditKind::Boolean => "boolean",
        }
    }
}

/// A property edit on the node with `phandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEdit {
    pub phandle: u32,
    /// Byte offset of the phandle within the declaring rule.
    pub slot: usize,
    pub property: String,
    pub kind: EditKind,
    /// Byte offset for integer edits; absent for whole-property edits.
    pub offset: Option<usize>,
    /// Literal that replaces the argument.
    pub fixed: Option<String>,
}

impl PropertyEdit {
    fn parse(phandle: u32, slot: usize, decl: &str) -> Result<Self> {
        let (decl, fixed) = match decl.split_once('=') {
            Some((s, lit)) => (s, Some(lit.to_string())),
            None => (decl, None),
        };
        let (property, kind, offset) = if let Some(name) = decl.strip_suffix('?') {
            (name, EditKind::Boolean, None)
        } else {
            match decl.rfind(|c: char| EditKind::from_separator(c).is_some()) {
                Some(pos)
                    if pos > 0
                        && pos + 1 < decl.len()
                        && decl[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
                {
                    let sep = decl[pos..].chars().next().unwrap_or(':');
                    let kind = EditKind::from_separator(sep).unwrap_or(EditKind::Integer(4));
                    let offset = decl[pos + 1..]
                        .parse()
                        .map_err(|_| Error::malformed(format!("bad offset in {:?}", decl)))?;
                    (&decl[..pos], kind, Some(offset))
                }
                _ => (decl, EditKind::String, None),
            }
        };
        if property.is_empty() {
            return Err(Error::malformed(format!("empty property name in {:?}", decl)));
        }
        Ok(PropertyEdit {
            phandle,
            slot,
            property: property.to_string(),
            kind,
            offset,
            fixed,
        })
    }
}

impl fmt::Display for PropertyEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:#x}> {}{}", self.phandle, self.property, self.kind.separator())?;
        if let Some(offset) = self.offset {
            write!(f, "{}", offset)?;
        }
        if self.kind == EditKind::Boolean {
            write!(f, "?")?;
        }
        if let Some(fixed) = &self.fixed {
            write!(f, "={}", fixed)?;
        }
        Ok(())
    }
}

/// One entry of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Fragments(Vec<Toggle>),
    Edit(PropertyEdit),
}

/// Which tree declared a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    Overlay,
    Base,
}

/// A named override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    pub name: String,
    pub source: RuleSource,
    pub actions: Vec<Action>,
}

/// Change requested by applying a rule to an argument, before it is bound
/// to concrete nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Activate (`true`) or deactivate (`false`) a fragment.
    Fragment { id: u32, activate: bool },
    /// Replace the whole property.
    Replace {
        edit: PropertyEdit,
        value: Vec<u8>,
    },
    /// Overwrite `bytes.len()` bytes at `offset`.
    Patch {
        edit: PropertyEdit,
        offset: usize,
        bytes: Vec<u8>,
    },
    /// Create an empty property (`true`) or remove it (`false`).
    Flag { edit: PropertyEdit, present: bool },
}

impl OverrideRule {
    /// Parses a rule declaration.
    pub fn parse(name: &str, source: RuleSource, value: &[u8]) -> Result<Self> {
        let mut actions = Vec::new();
        let mut pos = 0;
        while pos < value.len() {
            let phandle = read_u32(value, pos)
                .ok_or_else(|| Error::malformed(format!("override {} truncated", name)))?;
            let rest = &value[pos + 4..];
            let len = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::malformed(format!("override {} unterminated", name)))?;
            let decl = std::str::from_utf8(&rest[..len])
                .map_err(|_| Error::malformed(format!("override {} is not UTF-8", name)))?;
            actions.push(if phandle == 0 {
                Action::Fragments(Toggle::parse_list(decl)?)
            } else {
                Action::Edit(PropertyEdit::parse(phandle, pos, decl)?)
            });
            pos += 4 + len + 1;
        }
        Ok(OverrideRule {
            name: name.to_string(),
            source,
            actions,
        })
    }

    /// Interprets `argument` for every action. Nothing is mutated here, so a
    /// type error leaves all state untouched.
    pub fn plan(&self, argument: &str) -> Result<Vec<Step>> {
        let mut steps = Vec::new();
        for action in &self.actions {
            match action {
                Action::Fragments(toggles) => {
                    let flag = self.flag(argument)?;
                    steps.extend(
                        toggles
                            .iter()
                            .filter_map(|t| t.effect(flag))
                            .map(|(id, activate)| Step::Fragment { id, activate }),
                    );
                }
                Action::Edit(edit) => {
                    let literal = edit.fixed.as_deref().unwrap_or(argument);
                    steps.push(self.edit_step(edit, literal)?);
                }
            }
        }
        Ok(steps)
    }

    fn flag(&self, literal: &str) -> Result<bool> {
        if literal.trim().is_empty() {
            return Ok(true);
        }
        parse_bool(literal).ok_or_else(|| self.mismatch(EditKind::Boolean, literal))
    }

    fn edit_step(&self, edit: &PropertyEdit, literal: &str) -> Result<Step> {
        let edit = edit.clone();
        match edit.kind {
            EditKind::String => {
                let mut value = literal.as_bytes().to_vec();
                value.push(0);
                Ok(Step::Replace { edit, value })
            }
            EditKind::Boolean => {
                let present = self.flag(literal)?;
                Ok(Step::Flag { edit, present })
            }
            EditKind::Integer(width) => {
                let value = parse_integer(literal)
                    .filter(|&v| fits(v, width))
                    .ok_or_else(|| self.mismatch(edit.kind, literal))?;
                let bytes = value.to_be_bytes()[8 - width..].to_vec();
                let offset = edit.offset.unwrap_or(0);
                Ok(Step::Patch {
                    edit,
                    offset,
                    bytes,
                })
            }
        }
    }

    fn mismatch(&self, kind: EditKind, literal: &str) -> Error {
        Error::TypeMismatch {
            name: self.name.clone(),
            expected: kind.expected(),
            value: literal.to_string(),
        }
    }
}

/// True when `value` (possibly a two's complement negative) fits `width` bytes.
fn fits(value: u64, width: usize) -> bool {
    if width >= 8 {
        return true;
    }
    let bits = width as u32 * 8;
    let signed = value as i64;
    value < (1u64 << bits) || (signed < 0 && signed >= -(1i64 << (bits - 1)))
}

/// All rules declared by one tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideSet {
    rules: Vec<OverrideRule>,
}

impl OverrideSet {
    /// Reads `/__overrides__`, if present.
    pub fn from_tree(tree: &Tree, source: RuleSource) -> Result<Self> {
        let Some(node) = tree.child(NodeId::ROOT, OVERRIDES_NODE) else {
            return Ok(Self::default());
        };
        let rules = tree
            .node(node)
            .properties()
            .iter()
            .filter(|p| p.name != "name" && p.name != "phandle")
            .map(|p| OverrideRule::parse(&p.name, source, &p.value))
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} {:?} override rules", rules.len(), source);
        Ok(Self { rules })
    }

    pub fn get(&self, name: &str) -> Option<&OverrideRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn rules(&self) -> &[OverrideRule] {
        &self.rules
    }
}

/// Encodes a rule declaration; the inverse of [`OverrideRule::parse`] for
/// building overlays programmatically.
pub fn encode_entries(entries: &[(u32, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (phandle, decl) in entries {
        out.extend_from_slice(&phandle.to_be_bytes());
        out.extend_from_slice(decl.as_bytes());
        out.push(0);
    }
    out
}
