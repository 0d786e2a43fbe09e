//! Typed property values.
//!
//! Properties are stored as raw bytes; this module gives them a type for
//! construction, for display, and for parsing override arguments.

use std::fmt;

/// A property value with an explicit interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// Zero-length property (a boolean flag that is present).
    Empty,
    /// Big-endian 32-bit cells, e.g. `<18 0>`.
    Cells(Vec<u32>),
    /// A single NUL-terminated string.
    String(String),
    /// A list of NUL-terminated strings.
    Strings(Vec<String>),
    /// Opaque bytes, e.g. `[de ad]`.
    Bytes(Vec<u8>),
    /// A reference to another node by phandle.
    Phandle(u32),
}

impl PropertyValue {
    /// Encodes the value in the on-disk representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PropertyValue::Empty => Vec::new(),
            PropertyValue::Cells(cells) => cells.iter().flat_map(|c| c.to_be_bytes()).collect(),
            PropertyValue::String(s) => {
                let mut out = s.as_bytes().to_vec();
                out.push(0);
                out
            }
            PropertyValue::Strings(list) => {
                let mut out = Vec::new();
                for s in list {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                out
            }
            PropertyValue::Bytes(bytes) => bytes.clone(),
            PropertyValue::Phandle(p) => p.to_be_bytes().to_vec(),
        }
    }

    /// Guesses the most readable interpretation of raw bytes.
    pub fn infer(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return PropertyValue::Empty;
        }
        if let Some(strings) = printable_strings(bytes) {
            return match strings.len() {
                1 => PropertyValue::String(strings.into_iter().next().unwrap_or_default()),
                _ => PropertyValue::Strings(strings),
            };
        }
        if bytes.len() % 4 == 0 {
            return PropertyValue::Cells(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            );
        }
        PropertyValue::Bytes(bytes.to_vec())
    }
}

fn printable_strings(bytes: &[u8]) -> Option<Vec<String>> {
    let body = bytes.strip_suffix(&[0])?;
    if body.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    for part in body.split(|&b| b == 0) {
        if part.is_empty() || !part.iter().all(|b| (0x20..0x7f).contains(b)) {
            return None;
        }
        out.push(String::from_utf8_lossy(part).into_owned());
    }
    Some(out)
}

impl From<Vec<u32>> for PropertyValue {
    fn from(cells: Vec<u32>) -> Self {
        PropertyValue::Cells(cells)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<PropertyValue> for Vec<u8> {
    fn from(value: PropertyValue) -> Self {
        value.to_bytes()
    }
}

impl fmt::Display for PropertyValue {
    /// Renders in devicetree source syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Empty => Ok(()),
            PropertyValue::Cells(cells) => {
                let parts: Vec<String> = cells.iter().map(|c| format!("{:#x}", c)).collect();
                write!(f, "<{}>", parts.join(" "))
            }
            PropertyValue::String(s) => write!(f, "{:?}", s),
            PropertyValue::Strings(list) => {
                let parts: Vec<String> = list.iter().map(|s| format!("{:?}", s)).collect();
                write!(f, "{}", parts.join(", "))
            }
            PropertyValue::Bytes(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "[{}]", parts.join(" "))
            }
            PropertyValue::Phandle(p) => write!(f, "<{:#x}>", p),
        }
    }
}

/// Parses an integer literal: decimal, `0x` hex, `0o` or leading-zero octal,
/// `0b` binary, with an optional leading `-` stored as two's complement.
pub fn parse_integer(literal: &str) -> Option<u64> {
    let s = literal.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let lower = digits.to_ascii_lowercase();
    let value = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()?
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()?
    } else if lower.len() > 1 && lower.starts_with('0') {
        u64::from_str_radix(&lower[1..], 8).ok()?
    } else {
        lower.parse::<u64>().ok()?
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Parses a boolean literal. Integers are accepted too, non-zero is true.
pub fn parse_bool(literal: &str) -> Option<bool> {
    match literal.trim().to_lowercase().as_str() {
        "y" | "yes" | "on" | "true" | "okay" => Some(true),
        "n" | "no" | "off" | "false" | "disabled" => Some(false),
        other => parse_integer(other).map(|v| v != 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bytes() {
        assert_eq!(PropertyValue::Cells(vec![1, 0x12]).to_bytes(), [0, 0, 0, 1, 0, 0, 0, 0x12]);
        assert_eq!(PropertyValue::from("okay").to_bytes(), b"okay\0");
        assert_eq!(
            PropertyValue::Strings(vec!["a".into(), "bc".into()]).to_bytes(),
            b"a\0bc\0"
        );
        assert!(PropertyValue::Empty.to_bytes().is_empty());
    }

    #[test]
    fn test_infer() {
        assert_eq!(PropertyValue::infer(b"okay\0"), PropertyValue::from("okay"));
        assert_eq!(
            PropertyValue::infer(&[0, 0, 0, 3]),
            PropertyValue::Cells(vec![3])
        );
        assert_eq!(PropertyValue::infer(&[1, 2]), PropertyValue::Bytes(vec![1, 2]));
        assert_eq!(PropertyValue::infer(&[]), PropertyValue::Empty);
    }

    #[test]
    fn test_display() {
        assert_eq!(PropertyValue::Cells(vec![18, 0]).to_string(), "<0x12 0x0>");
        assert_eq!(PropertyValue::from("okay").to_string(), "\"okay\"");
        assert_eq!(PropertyValue::Bytes(vec![0xde, 0xad]).to_string(), "[de ad]");
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("0x1F"), Some(31));
        assert_eq!(parse_integer("010"), Some(8));
        assert_eq!(parse_integer("0"), Some(0));
        assert_eq!(parse_integer("-1"), Some(u64::MAX));
        assert_eq!(parse_integer("abc"), None);
        assert_eq!(parse_integer(""), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("N"), Some(false));
        assert_eq!(parse_bool("2"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }
}
