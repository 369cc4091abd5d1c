//! Storage quantities (`1Gi`, `500M`, `1073741824`).

use crate::error::ParseError;

const SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a whole-number quantity into bytes.
pub fn parse_quantity(quantity: &str) -> Result<u64, ParseError> {
    let invalid = || ParseError::InvalidQuantity(quantity.to_string());
    let trimmed = quantity.trim();

    // Binary suffixes are listed first so `Mi` wins over `M`.
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| trimmed.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((trimmed, 1));

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)
}
