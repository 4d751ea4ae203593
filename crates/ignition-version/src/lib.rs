//! Firmware version parsing and comparison
//!
//! Devices declare the format their version strings use; releases are
//! compared under the device's declared format. The comparator is a total
//! order within one format: transitive, antisymmetric and reflexive.
//!
//! # Example
//!
//! ```
//! use std::cmp::Ordering;
//! use ignition_version::{Version, VersionFormat};
//!
//! # fn main() -> Result<(), ignition_version::VersionError> {
//! let old = Version::parse("1.2.3.4", VersionFormat::Quad)?;
//! let new = Version::parse("1.2.3.5", VersionFormat::Quad)?;
//! assert_eq!(old.compare(&new), Ordering::Less);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised while parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// The version string was empty
    #[error("version string is empty")]
    Empty,

    /// A dotted component was not a number in the declared base
    #[error("invalid version component '{component}' in '{version}'")]
    InvalidComponent {
        /// The offending component
        component: String,
        /// The full version string
        version: String,
    },

    /// The string had the wrong number of dotted components for the format
    #[error("expected {expected} components in '{version}', found {found}")]
    ComponentCount {
        /// Components required by the format
        expected: usize,
        /// Components found
        found: usize,
        /// The full version string
        version: String,
    },
}

/// The declared format of a device or release version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionFormat {
    /// An opaque string compared byte-wise
    #[default]
    Plain,
    /// A single unsigned integer
    Number,
    /// Two dotted components, `major.minor`
    Pair,
    /// Three dotted components, `major.minor.micro`
    Triplet,
    /// Four dotted components, `major.minor.micro.build`
    Quad,
    /// Dotted components of binary-coded-decimal nibbles
    Bcd,
    /// A single hexadecimal number, `0x`-prefix optional
    Hex,
}

impl VersionFormat {
    /// The number of dotted components the format requires, if fixed.
    pub fn component_count(self) -> Option<usize> {
        match self {
            VersionFormat::Number | VersionFormat::Hex => Some(1),
            VersionFormat::Pair => Some(2),
            VersionFormat::Triplet => Some(3),
            VersionFormat::Quad => Some(4),
            VersionFormat::Plain | VersionFormat::Bcd => None,
        }
    }

    /// Guess a format from the shape of a version string.
    ///
    /// Used for devices that never declared one; the guess prefers the
    /// dotted-decimal families and falls back to [`VersionFormat::Plain`].
    pub fn guess(version: &str) -> Self {
        let version = version.trim();
        if version.starts_with("0x") || version.starts_with("0X") {
            return VersionFormat::Hex;
        }
        let parts: Vec<&str> = version.split('.').collect();
        if !parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            return VersionFormat::Plain;
        }
        match parts.len() {
            1 => VersionFormat::Number,
            2 => VersionFormat::Pair,
            3 => VersionFormat::Triplet,
            4 => VersionFormat::Quad,
            _ => VersionFormat::Plain,
        }
    }
}

impl fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionFormat::Plain => "plain",
            VersionFormat::Number => "number",
            VersionFormat::Pair => "pair",
            VersionFormat::Triplet => "triplet",
            VersionFormat::Quad => "quad",
            VersionFormat::Bcd => "bcd",
            VersionFormat::Hex => "hex",
        };
        f.write_str(name)
    }
}

/// A version string parsed under a declared format.
///
/// Two versions compare component-wise when numeric, byte-wise when plain.
/// Comparing versions parsed under different formats is a caller bug; the
/// comparison still totally orders them by falling back to the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    raw: String,
    format: VersionFormat,
    components: Vec<u64>,
}

impl Version {
    /// Parse a version string under the given format.
    pub fn parse(raw: &str, format: VersionFormat) -> Result<Self, VersionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }

        let components = match format {
            VersionFormat::Plain => Vec::new(),
            VersionFormat::Hex => vec![parse_component(raw, raw, 16)?],
            VersionFormat::Number => vec![parse_component(raw, raw, 10)?],
            VersionFormat::Pair | VersionFormat::Triplet | VersionFormat::Quad => {
                let parts: Vec<&str> = raw.split('.').collect();
                let expected = format.component_count().unwrap_or(parts.len());
                if parts.len() != expected {
                    return Err(VersionError::ComponentCount {
                        expected,
                        found: parts.len(),
                        version: raw.to_string(),
                    });
                }
                parts
                    .iter()
                    .map(|p| parse_component(p, raw, 10))
                    .collect::<Result<Vec<_>, _>>()?
            }
            VersionFormat::Bcd => {
                let parts: Vec<&str> = raw.split('.').collect();
                parts
                    .iter()
                    .map(|p| parse_bcd_component(p, raw))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(Self {
            raw: raw.to_string(),
            format,
            components,
        })
    }

    /// The raw string as supplied by the device or release.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The declared format.
    pub fn format(&self) -> VersionFormat {
        self.format
    }

    /// The parsed numeric components; empty for plain versions.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Compare two versions.
    ///
    /// Numeric formats compare component-wise with missing trailing
    /// components treated as zero, so `1.2` and `1.2.0` are equal under BCD.
    pub fn compare(&self, other: &Self) -> Ordering {
        if self.format == VersionFormat::Plain || other.format == VersionFormat::Plain {
            return self.raw.cmp(&other.raw);
        }
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// Compare two raw strings under a shared format, if both parse.
    pub fn try_compare(a: &str, b: &str, format: VersionFormat) -> Option<Ordering> {
        let a = Version::parse(a, format).ok()?;
        let b = Version::parse(b, format).ok()?;
        Some(a.compare(&b))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_component(component: &str, version: &str, radix: u32) -> Result<u64, VersionError> {
    let digits = if radix == 16 {
        component
            .strip_prefix("0x")
            .or_else(|| component.strip_prefix("0X"))
            .unwrap_or(component)
    } else {
        component
    };
    u64::from_str_radix(digits, radix).map_err(|_| VersionError::InvalidComponent {
        component: component.to_string(),
        version: version.to_string(),
    })
}

/// Decode a BCD component: each hex nibble must itself be a decimal digit.
fn parse_bcd_component(component: &str, version: &str) -> Result<u64, VersionError> {
    let digits = component
        .strip_prefix("0x")
        .or_else(|| component.strip_prefix("0X"))
        .unwrap_or(component);
    let value = u64::from_str_radix(digits, 16).map_err(|_| VersionError::InvalidComponent {
        component: component.to_string(),
        version: version.to_string(),
    })?;
    let mut out: u64 = 0;
    let mut scale: u64 = 1;
    let mut rest = value;
    loop {
        let nibble = rest & 0xf;
        if nibble > 9 {
            return Err(VersionError::InvalidComponent {
                component: component.to_string(),
                version: version.to_string(),
            });
        }
        out += nibble * scale;
        rest >>= 4;
        if rest == 0 {
            break;
        }
        scale *= 10;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_ordering() -> Result<(), VersionError> {
        let a = Version::parse("1.2.3.4", VersionFormat::Quad)?;
        let b = Version::parse("1.2.3.5", VersionFormat::Quad)?;
        let c = Version::parse("1.10.0.0", VersionFormat::Quad)?;
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(a.compare(&a), Ordering::Equal);
        assert_eq!(b.compare(&c), Ordering::Less);
        Ok(())
    }

    #[test]
    fn test_quad_component_count_enforced() {
        let err = Version::parse("1.2.3", VersionFormat::Quad);
        assert!(matches!(err, Err(VersionError::ComponentCount { .. })));
    }

    #[test]
    fn test_number_is_numeric_not_lexicographic() -> Result<(), VersionError> {
        let a = Version::parse("9", VersionFormat::Number)?;
        let b = Version::parse("10", VersionFormat::Number)?;
        assert_eq!(a.compare(&b), Ordering::Less);
        Ok(())
    }

    #[test]
    fn test_bcd_nibble_decode() -> Result<(), VersionError> {
        // 0x10 encodes "10", not 16
        let a = Version::parse("0x10", VersionFormat::Bcd)?;
        assert_eq!(a.components(), &[10]);
        let b = Version::parse("0x09", VersionFormat::Bcd)?;
        assert_eq!(a.compare(&b), Ordering::Greater);
        Ok(())
    }

    #[test]
    fn test_bcd_rejects_hex_nibbles() {
        let err = Version::parse("0x1A", VersionFormat::Bcd);
        assert!(matches!(err, Err(VersionError::InvalidComponent { .. })));
    }

    #[test]
    fn test_hex_with_and_without_prefix() -> Result<(), VersionError> {
        let a = Version::parse("0xff", VersionFormat::Hex)?;
        let b = Version::parse("100", VersionFormat::Hex)?;
        assert_eq!(a.components(), &[255]);
        assert_eq!(b.components(), &[256]);
        assert_eq!(a.compare(&b), Ordering::Less);
        Ok(())
    }

    #[test]
    fn test_plain_compares_bytewise() -> Result<(), VersionError> {
        let a = Version::parse("RQR12.07_B0029", VersionFormat::Plain)?;
        let b = Version::parse("RQR12.08_B0030", VersionFormat::Plain)?;
        assert_eq!(a.compare(&b), Ordering::Less);
        Ok(())
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(Version::parse("", VersionFormat::Plain), Err(VersionError::Empty));
        assert_eq!(Version::parse("  ", VersionFormat::Quad), Err(VersionError::Empty));
    }

    #[test]
    fn test_guess() {
        assert_eq!(VersionFormat::guess("1.2.3.4"), VersionFormat::Quad);
        assert_eq!(VersionFormat::guess("1.2.3"), VersionFormat::Triplet);
        assert_eq!(VersionFormat::guess("1.2"), VersionFormat::Pair);
        assert_eq!(VersionFormat::guess("42"), VersionFormat::Number);
        assert_eq!(VersionFormat::guess("0x1234"), VersionFormat::Hex);
        assert_eq!(VersionFormat::guess("RQR12.07_B0029"), VersionFormat::Plain);
    }

    #[test]
    fn test_try_compare() {
        assert_eq!(
            Version::try_compare("2.0.0.0", "1.9.9.9", VersionFormat::Quad),
            Some(Ordering::Greater)
        );
        assert_eq!(Version::try_compare("junk", "1.0", VersionFormat::Pair), None);
    }
}
