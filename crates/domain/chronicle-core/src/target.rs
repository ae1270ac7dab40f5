use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const REFERENCE: &str = "reference";
const ACCOUNT_PREFIX: &str = "account:";

/// Identity of a tracked target: an account, or the global reference-data singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TargetId {
    Account(u64),
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid target id '{0}' (expected 'reference' or 'account:<number>')")]
pub struct TargetIdParseError(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Account(id) => write!(f, "{ACCOUNT_PREFIX}{id}"),
            TargetId::Reference => f.write_str(REFERENCE),
        }
    }
}

impl FromStr for TargetId {
    type Err = TargetIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == REFERENCE {
            return Ok(TargetId::Reference);
        }
        // Bare numbers are accepted as account ids for CLI convenience.
        let digits = s.strip_prefix(ACCOUNT_PREFIX).unwrap_or(s);
        digits
            .parse::<u64>()
            .map(TargetId::Account)
            .map_err(|_| TargetIdParseError(s.to_string()))
    }
}

impl From<TargetId> for String {
    fn from(value: TargetId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for TargetId {
    type Error = TargetIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A target as last resolved from the target directory.
///
/// `credentials_valid` and `access_token` are owned by whatever refreshes
/// credentials; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub active: bool,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub credentials_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Target {
    pub fn new(id: TargetId) -> Self {
        Self {
            id,
            active: true,
            scopes: BTreeSet::new(),
            credentials_valid: true,
            access_token: None,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// The reference singleton needs no scope; accounts must hold it explicitly.
    pub fn has_scope(&self, scope: Option<&str>) -> bool {
        match (self.id, scope) {
            (_, None) | (TargetId::Reference, _) => true,
            (TargetId::Account(_), Some(scope)) => self.scopes.contains(scope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_id_round_trips_through_display() {
        for id in [TargetId::Reference, TargetId::Account(90000001)] {
            assert_eq!(id.to_string().parse::<TargetId>().unwrap(), id);
        }
        assert_eq!("42".parse::<TargetId>().unwrap(), TargetId::Account(42));
        assert!("account:x".parse::<TargetId>().is_err());
    }

    #[test]
    fn reference_target_has_every_scope() {
        let reference = Target::new(TargetId::Reference);
        assert!(reference.has_scope(Some("esi-assets.read_assets.v1")));

        let account = Target::new(TargetId::Account(1)).with_scopes(["a"]);
        assert!(account.has_scope(Some("a")));
        assert!(!account.has_scope(Some("b")));
        assert!(account.has_scope(None));
    }
}
