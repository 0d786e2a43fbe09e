//! Overlay resolution for flattened hardware description trees.
//!
//! Decodes a base tree and an overlay from their binary blob form, merges the
//! overlay's active fragments, applies named overrides that toggle dormant
//! fragments or edit properties, and encodes the result.

pub mod error;
pub mod fdt;
pub mod fragment;
pub mod overrides;
pub mod resolve;
pub mod symbols;
pub mod tree;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use fragment::{Fragment, FragmentState, Target};
pub use overrides::{OverrideRule, RuleSource};
pub use resolve::{resolve, Resolution};
pub use symbols::SymbolTable;
pub use tree::{Node, NodeId, Property, Tree};
pub use value::PropertyValue;
