//! Identity types shared by every component: the agent-side `AgentIdentity`
//! and the user-side `UserPrincipal` produced by token verification.

use serde::{Deserialize, Serialize};

/// `<owner>-<workspace-token>`, ASCII, `[a-z0-9]([-a-z0-9]*[a-z0-9])?`.
///
/// The owner prefix is whatever precedes the *first* `-`; this is a textual
/// view over a `String`, not a parsed struct, so it round-trips byte for
/// byte through the wire and through Kubernetes object names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIdentity(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityFormatError {
    #[error("identity must not be empty")]
    Empty,
    #[error("identity contains characters outside [a-z0-9-]: {0:?}")]
    InvalidChars(String),
    #[error("identity must not start or end with '-': {0:?}")]
    LeadingOrTrailingDash(String),
    #[error("identity has no owner prefix (missing '-'): {0:?}")]
    NoOwnerDelimiter(String),
}

impl AgentIdentity {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentityFormatError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdentityFormatError::Empty);
        }
        if !raw.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
            return Err(IdentityFormatError::InvalidChars(raw));
        }
        if raw.starts_with('-') || raw.ends_with('-') {
            return Err(IdentityFormatError::LeadingOrTrailingDash(raw));
        }
        if !raw.contains('-') {
            return Err(IdentityFormatError::NoOwnerDelimiter(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The portion before the first `-`, checked against the `owner` claim
    /// at registration time (§3, §4.C) and at every ownership check after.
    pub fn owner_prefix(&self) -> &str {
        self.0.split_once('-').map(|(owner, _)| owner).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentIdentity {
    type Err = IdentityFormatError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Extracted from a validated bearer token. Never persisted; recomputed
/// per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrincipal {
    pub subject: String,
    pub owner: String,
    pub roles: Vec<String>,
    pub expiry: u64,
}

impl UserPrincipal {
    /// The ownership predicate applied identically by both gateway surfaces.
    pub fn owns(&self, identity: &AgentIdentity) -> bool {
        self.owner == identity.owner_prefix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_identity() {
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        assert_eq!(id.as_str(), "alpha-ws1");
        assert_eq!(id.owner_prefix(), "alpha");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(AgentIdentity::parse(""), Err(IdentityFormatError::Empty));
    }

    #[test]
    fn rejects_uppercase() {
        assert!(matches!(
            AgentIdentity::parse("Alpha-ws1"),
            Err(IdentityFormatError::InvalidChars(_))
        ));
    }

    #[test]
    fn rejects_missing_delimiter() {
        assert!(matches!(
            AgentIdentity::parse("alphaws1"),
            Err(IdentityFormatError::NoOwnerDelimiter(_))
        ));
    }

    #[test]
    fn rejects_leading_dash() {
        assert!(matches!(
            AgentIdentity::parse("-alpha-ws1"),
            Err(IdentityFormatError::LeadingOrTrailingDash(_))
        ));
    }

    #[test]
    fn owner_prefix_splits_at_first_dash_only() {
        let id = AgentIdentity::parse("alpha-ws1-extra").unwrap();
        assert_eq!(id.owner_prefix(), "alpha");
    }

    #[test]
    fn principal_owns_matching_identity_only() {
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        let alpha = UserPrincipal {
            subject: "sub1".into(),
            owner: "alpha".into(),
            roles: vec![],
            expiry: 0,
        };
        let bravo = UserPrincipal {
            owner: "bravo".into(),
            ..alpha.clone()
        };
        assert!(alpha.owns(&id));
        assert!(!bravo.owns(&id));
    }
}
