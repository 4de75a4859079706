//! Identifier type for remote data source entries.
//!
//! The remote service hands out numeric ids, but the engine treats them as
//! opaque and also accepts string ids from alternative backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of an entry stored in a remote data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryId {
    /// Numeric id (the usual case).
    Number(i64),
    /// Textual id.
    Text(String),
}

impl EntryId {
    /// Returns true for ids that carry no identity (`0` or an empty string).
    ///
    /// These never reach a delete request.
    #[must_use]
    pub fn is_falsy(&self) -> bool {
        match self {
            EntryId::Number(n) => *n == 0,
            EntryId::Text(s) => s.is_empty(),
        }
    }
}

impl From<i64> for EntryId {
    fn from(id: i64) -> Self {
        EntryId::Number(id)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        EntryId::Text(id.to_string())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Number(n) => write!(f, "{n}"),
            EntryId::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for EntryId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidEntryId(s.to_string()));
        }
        Ok(trimmed
            .parse::<i64>()
            .map(EntryId::Number)
            .unwrap_or_else(|_| EntryId::Text(trimmed.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_ids() {
        assert!(EntryId::Number(0).is_falsy());
        assert!(EntryId::Text(String::new()).is_falsy());
        assert!(!EntryId::Number(12).is_falsy());
        assert!(!EntryId::from("abc").is_falsy());
    }

    #[test]
    fn parse_prefers_numbers() {
        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::Number(42));
        assert_eq!("x-1".parse::<EntryId>().unwrap(), EntryId::from("x-1"));
        assert!("  ".parse::<EntryId>().is_err());
    }

    #[test]
    fn serde_is_untagged() {
        let ids: Vec<EntryId> = serde_json::from_str(r#"[1, "two"]"#).unwrap();
        assert_eq!(ids, vec![EntryId::Number(1), EntryId::from("two")]);
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"[1,"two"]"#);
    }
}
