//! Client and module identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

/// Identity of a client application that owns a sandbox.
///
/// Value-typed and immutable: two identities are the same client exactly
/// when both the owning uid and the package name match. This is the sole
/// key of every per-client map in the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Uid of the process that owns the client application
    pub owner_uid: u32,
    /// Package name of the client application
    pub package_name: String,
}

impl ClientIdentity {
    /// Creates a new identity.
    pub fn new(owner_uid: u32, package_name: impl Into<String>) -> Self {
        Self {
            owner_uid,
            package_name: package_name.into(),
        }
    }

    /// Parses the `uid:package` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let (uid, package) = s.split_once(':').ok_or_else(|| DomainError::ParseError {
            field: "client identity".to_string(),
            reason: format!("expected uid:package, got '{s}'"),
        })?;

        let owner_uid = uid.parse::<u32>().map_err(|e| DomainError::ParseError {
            field: "owner uid".to_string(),
            reason: e.to_string(),
        })?;

        if package.is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "package name".to_string(),
                value: String::new(),
                expected: "non-empty package name".to_string(),
            });
        }

        Ok(Self::new(owner_uid, package))
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_uid, self.package_name)
    }
}

/// Name of a plugin module that can be loaded into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    /// Creates a new module name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModuleName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_identity_value_equality() {
        let a = ClientIdentity::new(10042, "com.example.app");
        let b = ClientIdentity::new(10042, "com.example.app".to_string());
        let other_uid = ClientIdentity::new(10043, "com.example.app");

        assert_eq!(a, b);
        assert_ne!(a, other_uid);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
        assert_eq!(map.get(&other_uid), None);
    }

    #[test]
    fn test_identity_display_and_parse() {
        let id = ClientIdentity::new(10042, "com.example.app");
        assert_eq!(id.to_string(), "10042:com.example.app");
        assert_eq!(ClientIdentity::parse("10042:com.example.app").unwrap(), id);
    }

    #[test]
    fn test_identity_parse_invalid() {
        assert!(ClientIdentity::parse("com.example.app").is_err());
        assert!(ClientIdentity::parse("abc:com.example.app").is_err());
        assert!(ClientIdentity::parse("10042:").is_err());
    }

    #[test]
    fn test_module_name_serializes_transparently() {
        let name = ModuleName::new("ads.mediation");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"ads.mediation\"");
        assert_eq!(name.as_str(), "ads.mediation");
    }
}
