//! Error types for the overlay resolution engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding, resolving or encoding a tree.
///
/// Every variant is terminal: a resolution that hits one of these produces
/// no output tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input blob is structurally inconsistent.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The same label is bound to more than one node.
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),

    /// A fragment's target could not be located.
    #[error("Unresolved target for fragment {fragment}")]
    UnresolvedTarget { fragment: u32 },

    /// A label reference could not be bound to a node.
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// No override rule with this name is declared.
    #[error("Unknown override: {0}")]
    UnknownOverride(String),

    /// The override argument cannot be parsed as the property's type.
    #[error("Type mismatch for override {name}: expected {expected}, got {value:?}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        value: String,
    },

    /// An offset write would exceed the property's length.
    #[error("Write of {width} bytes at offset {offset} exceeds property {property} ({len} bytes)")]
    OutOfRange {
        property: String,
        offset: usize,
        width: usize,
        len: usize,
    },

    /// An override tried to deactivate a fragment that is already merged.
    #[error("Fragment {0} is already active and cannot be deactivated")]
    IrreversibleFragment(u32),

    /// The encoded tree does not fit the output capacity.
    #[error("Output overflow: need {needed} bytes, capacity is {capacity}")]
    OutputOverflow { needed: usize, capacity: usize },
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedInput(msg.into())
    }
}
