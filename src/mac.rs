//! Validated device identifiers
//!
//! The gate keys its authorization state by hardware (MAC) address, so the
//! raw strings arriving from the captive portal are parsed into a canonical
//! form before any business logic runs. Parsing fails closed: anything that
//! is not one of the accepted spellings is rejected up front.

use crate::errors::TollGateError;
use std::fmt;
use std::str::FromStr;

/// A validated MAC address, canonicalized to uppercase colon form
/// (`AA:BB:CC:DD:EE:FF`).
///
/// Accepted input spellings, case-insensitive, surrounding whitespace
/// trimmed:
/// - colon-separated: `00:1A:2B:3C:4D:5E`
/// - hyphen-separated: `00-1A-2B-3C-4D-5E`
/// - unseparated: `001A2B3C4D5E` (must contain at least one letter, so a
///   purely numeric identifier is not mistaken for a MAC)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MacAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = TollGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mac = s.trim().to_ascii_uppercase();

        if let Some(groups) = separated_groups(&mac, ':') {
            return Ok(MacAddress(groups.join(":")));
        }
        if let Some(groups) = separated_groups(&mac, '-') {
            return Ok(MacAddress(groups.join(":")));
        }
        if is_bare_mac(&mac) {
            let grouped: Vec<String> = mac
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect();
            return Ok(MacAddress(grouped.join(":")));
        }

        Err(TollGateError::InvalidMacAddress(s.trim().to_string()))
    }
}

fn is_hex_pair(part: &str) -> bool {
    part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit())
}

fn separated_groups(mac: &str, sep: char) -> Option<Vec<&str>> {
    if !mac.contains(sep) {
        return None;
    }
    let groups: Vec<&str> = mac.split(sep).collect();
    if groups.len() == 6 && groups.iter().all(|g| is_hex_pair(g)) {
        Some(groups)
    } else {
        None
    }
}

fn is_bare_mac(mac: &str) -> bool {
    mac.len() == 12
        && mac.chars().all(|c| c.is_ascii_hexdigit())
        && mac.chars().any(|c| c.is_ascii_alphabetic())
}
