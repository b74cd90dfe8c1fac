//! Subscription rule table mapping source tables to target collections.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Rule file problems are fatal at startup
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse rule file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Immutable routing table loaded once at startup
///
/// Maps a source table name to the ordered list of target collections its
/// events are written to. Unknown source tables route nowhere.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub subscriptions: HashMap<String, Vec<String>>,
}

impl RuleConfig {
    /// Load the JSON rule file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|source| RuleError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| RuleError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// The fan-out list for a source table, or `None` when it routes nowhere.
    pub fn targets(&self, table: &str) -> Option<&[String]> {
        self.subscriptions.get(table).map(Vec::as_slice)
    }

    /// Source tables this sink subscribes to.
    pub fn source_tables(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_map() {
        let rules: RuleConfig = serde_json::from_str(
            r#"{"subscriptions": {"accounts": ["accounts", "accounts_audit"], "orders": []}}"#,
        )
        .unwrap();
        assert_eq!(
            rules.targets("accounts").unwrap(),
            ["accounts".to_string(), "accounts_audit".to_string()]
        );
        assert_eq!(rules.targets("orders").unwrap(), Vec::<String>::new().as_slice());
        assert!(rules.targets("unknown").is_none());
    }

    #[test]
    fn empty_document_routes_nowhere() {
        let rules: RuleConfig = serde_json::from_str("{}").unwrap();
        assert!(rules.targets("accounts").is_none());
        assert_eq!(rules.source_tables().count(), 0);
    }
}
