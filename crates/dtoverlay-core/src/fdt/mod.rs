//! Flattened tree blob codec.
//!
//! Converts between the binary blob consumed by firmware and drivers and the
//! in-memory [`Tree`](crate::Tree).

mod decode;
mod encode;

pub mod format;

pub use decode::decode;
pub use encode::{encode, encode_into, encode_with_limit};
pub use format::{Header, Reservation, Token};
