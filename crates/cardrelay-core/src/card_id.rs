//! Card identifier formatting.
//!
//! Downstream delivery and deduplication key on the formatted string, so the
//! mapping from raw identifier bytes must be stable: identical bytes and
//! technology always produce an identical string.

use std::fmt::Write as _;

use crate::types::CardTechnology;

/// Separator between the technology prefix and the hex digits.
pub const PREFIX_SEPARATOR: char = ':';

/// Format raw identifier bytes as `"{prefix}:{HEX}"`.
///
/// Hex digits are uppercase, two per byte, without separators. Returns `None`
/// for an empty identifier, which never counts as a successful read.
///
/// ```
/// use cardrelay_core::{format_card_id, CardTechnology};
///
/// let idm = [0x01, 0x27, 0x00, 0x5d, 0x2a, 0x1b, 0x3c, 0x4d];
/// assert_eq!(
///     format_card_id(CardTechnology::Felica, &idm).as_deref(),
///     Some("felica:0127005D2A1B3C4D"),
/// );
/// ```
#[must_use]
pub fn format_card_id(technology: CardTechnology, bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let prefix = technology.prefix();
    let mut out = String::with_capacity(prefix.len() + 1 + bytes.len() * 2);
    out.push_str(prefix);
    out.push(PREFIX_SEPARATOR);
    for byte in bytes {
        // Writing into a String cannot fail.
        let _ = write!(out, "{byte:02X}");
    }
    Some(out)
}
