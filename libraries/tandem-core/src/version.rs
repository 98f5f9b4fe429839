//! Semantic-version gate
//!
//! Versions are compared as `MAJOR.MINOR.PATCH`. Parsing is lenient in the
//! way device firmware strings need: missing components default to 0 and
//! anything after the last numeric component is ignored, so `1.2.3-rc1`
//! and `1.2.3` compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Parsed `MAJOR.MINOR.PATCH` triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTriple {
    /// Major component
    pub major: u32,
    /// Minor component
    pub minor: u32,
    /// Patch component
    pub patch: u32,
}

impl VersionTriple {
    /// Create a triple from its components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse leniently; never fails.
    ///
    /// Components are read left to right and parsing stops at the first
    /// component that does not start with a digit or is not preceded by a
    /// `.` separator. Unread components stay 0.
    pub fn parse(input: &str) -> Self {
        let mut parts = [0u32; 3];
        let mut rest = input.trim_start();

        for (index, slot) in parts.iter_mut().enumerate() {
            if index > 0 {
                match rest.strip_prefix('.') {
                    Some(after) => rest = after,
                    None => break,
                }
            }

            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                break;
            }

            *slot = rest[..digits]
                .bytes()
                .fold(0u32, |acc, b| acc.saturating_mul(10).saturating_add(u32::from(b - b'0')));
            rest = &rest[digits..];
        }

        Self::new(parts[0], parts[1], parts[2])
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome of a version comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOrdering {
    /// The offered version is older than or equal to the installed one
    OlderOrEqual,
    /// The offered version is strictly newer
    Newer,
}

/// Comparator with a force-override escape hatch
///
/// While the override is set every comparison reports [`VersionOrdering::Newer`]
/// without parsing either input. The operator override and forced-install
/// scopes ([`VersionGate::forced`]) are tracked apart, so ending a forced
/// install never touches what an operator set in the meantime.
#[derive(Debug, Default)]
pub struct VersionGate {
    force: AtomicBool,
    scopes: AtomicUsize,
}

/// Keeps the gate forced until dropped
#[derive(Debug)]
pub struct ForcedScope<'a> {
    gate: &'a VersionGate,
}

impl Drop for ForcedScope<'_> {
    fn drop(&mut self) {
        self.gate.scopes.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VersionGate {
    /// Create a gate with the override cleared
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the override
    pub fn set_override(&self, enabled: bool) {
        self.force.store(enabled, Ordering::SeqCst);
    }

    /// Whether the override is currently set
    pub fn is_overridden(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Force every comparison until the returned scope is dropped
    pub fn forced(&self) -> ForcedScope<'_> {
        self.scopes.fetch_add(1, Ordering::SeqCst);
        ForcedScope { gate: self }
    }

    /// Whether comparisons are currently forced, by the operator or a scope
    pub fn is_forcing(&self) -> bool {
        self.is_overridden() || self.scopes.load(Ordering::SeqCst) > 0
    }

    /// Compare the offered version against the installed one
    pub fn compare(&self, offered: &str, installed: &str) -> VersionOrdering {
        if self.is_forcing() {
            return VersionOrdering::Newer;
        }

        if VersionTriple::parse(offered) > VersionTriple::parse(installed) {
            VersionOrdering::Newer
        } else {
            VersionOrdering::OlderOrEqual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_triples() {
        assert_eq!(VersionTriple::parse("1.2.3"), VersionTriple::new(1, 2, 3));
        assert_eq!(VersionTriple::parse("10.0.42"), VersionTriple::new(10, 0, 42));
    }

    #[test]
    fn missing_components_default_to_zero() {
        assert_eq!(VersionTriple::parse("1.0"), VersionTriple::new(1, 0, 0));
        assert_eq!(VersionTriple::parse("7"), VersionTriple::new(7, 0, 0));
        assert_eq!(VersionTriple::parse(""), VersionTriple::default());
    }

    #[test]
    fn trailing_garbage_is_ignored() {
        assert_eq!(VersionTriple::parse("1.2.3-rc1"), VersionTriple::new(1, 2, 3));
        assert_eq!(VersionTriple::parse("1.2.3.4"), VersionTriple::new(1, 2, 3));
        assert_eq!(VersionTriple::parse("2.1x.9"), VersionTriple::new(2, 1, 0));
        assert_eq!(VersionTriple::parse("v1.2.3"), VersionTriple::default());
    }

    #[test]
    fn compare_matches_documented_cases() {
        let gate = VersionGate::new();
        assert_eq!(gate.compare("1.2.3", "1.2.3"), VersionOrdering::OlderOrEqual);
        assert_eq!(gate.compare("2.0.0", "1.9.9"), VersionOrdering::Newer);
        assert_eq!(gate.compare("1.0", "1.0.0"), VersionOrdering::OlderOrEqual);
        assert_eq!(gate.compare("1.9.9", "2.0.0"), VersionOrdering::OlderOrEqual);
        assert_eq!(gate.compare("1.10.0", "1.9.0"), VersionOrdering::Newer);
    }

    #[test]
    fn override_forces_newer() {
        let gate = VersionGate::new();
        gate.set_override(true);
        assert!(gate.is_overridden());
        assert_eq!(gate.compare("1.2.3", "1.2.3"), VersionOrdering::Newer);
        assert_eq!(gate.compare("garbage", "9.9.9"), VersionOrdering::Newer);

        gate.set_override(false);
        assert_eq!(gate.compare("1.2.3", "1.2.3"), VersionOrdering::OlderOrEqual);
    }

    #[test]
    fn forced_scope_leaves_operator_override_alone() {
        let gate = VersionGate::new();
        {
            let _scope = gate.forced();
            assert_eq!(gate.compare("1.0.0", "2.0.0"), VersionOrdering::Newer);
            assert!(!gate.is_overridden());

            gate.set_override(true);
        }
        assert!(gate.is_overridden());
        assert_eq!(gate.compare("1.0.0", "2.0.0"), VersionOrdering::Newer);

        gate.set_override(false);
        assert!(!gate.is_forcing());
        assert_eq!(gate.compare("1.0.0", "2.0.0"), VersionOrdering::OlderOrEqual);
    }

    #[test]
    fn huge_components_saturate() {
        let v = VersionTriple::parse("99999999999.1.1");
        assert_eq!(v.major, u32::MAX);
        assert_eq!(v.minor, 1);
    }

    #[test]
    fn display_is_dotted() {
        assert_eq!(VersionTriple::new(3, 1, 4).to_string(), "3.1.4");
    }
}
