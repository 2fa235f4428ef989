//! Memory budgets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScopeError;

/// A memory budget in whole MiB.
///
/// Rendered as `"<n>M"`, the form written into a scope's size-control entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct MemoryBudget(u64);

impl MemoryBudget {
    /// Create a budget of `mib` MiB. Zero is rejected.
    pub fn from_mib(mib: u64) -> Result<Self, ScopeError> {
        if mib == 0 {
            return Err(ScopeError::InvalidBudget(mib.to_string()));
        }
        Ok(Self(mib))
    }

    /// The budget in MiB.
    pub fn mib(&self) -> u64 {
        self.0
    }

    /// The budget in bytes.
    pub fn bytes(&self) -> u64 {
        self.0.saturating_mul(1024 * 1024)
    }

    /// The control-file representation, e.g. `"128M"`.
    pub fn to_control_string(&self) -> String {
        format!("{}M", self.0)
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}M", self.0)
    }
}

impl FromStr for MemoryBudget {
    type Err = ScopeError;

    /// Parse `"<n>M"` or `"<n>"`; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix('M')
            .or_else(|| trimmed.strip_suffix('m'))
            .unwrap_or(trimmed);
        let mib = digits
            .parse::<u64>()
            .map_err(|_| ScopeError::InvalidBudget(s.to_string()))?;
        Self::from_mib(mib)
    }
}

impl TryFrom<u64> for MemoryBudget {
    type Error = ScopeError;

    fn try_from(mib: u64) -> Result<Self, Self::Error> {
        Self::from_mib(mib)
    }
}

impl From<MemoryBudget> for u64 {
    fn from(budget: MemoryBudget) -> Self {
        budget.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_string() {
        let budget = MemoryBudget::from_mib(128).unwrap();
        assert_eq!(budget.to_control_string(), "128M");
        assert_eq!(budget.to_string(), "128M");
        assert_eq!(budget.bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_parse() {
        assert_eq!("64M".parse::<MemoryBudget>().unwrap().mib(), 64);
        assert_eq!("256".parse::<MemoryBudget>().unwrap().mib(), 256);
        assert_eq!("512M\n".parse::<MemoryBudget>().unwrap().mib(), 512);
        assert!("0M".parse::<MemoryBudget>().is_err());
        assert!("12G".parse::<MemoryBudget>().is_err());
        assert!("".parse::<MemoryBudget>().is_err());
    }

    #[test]
    fn test_serde_rejects_zero() {
        assert!(serde_json::from_str::<MemoryBudget>("0").is_err());
        let budget: MemoryBudget = serde_json::from_str("64").unwrap();
        assert_eq!(serde_json::to_string(&budget).unwrap(), "64");
    }
}
