//! Admission policy consulted before any sandbox state is created.

use std::collections::HashSet;

use sbx_core::{ClientIdentity, ModuleName};

use crate::config::PolicyConfig;

/// Verdict of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Decides whether a client may have a sandbox and load modules into it.
pub trait PolicyChecker: Send + Sync + 'static {
    fn check_connect(&self, identity: &ClientIdentity) -> PolicyDecision;

    fn check_load(&self, identity: &ClientIdentity, module: &ModuleName) -> PolicyDecision {
        let _ = module;
        self.check_connect(identity)
    }
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PolicyChecker for AllowAll {
    fn check_connect(&self, _identity: &ClientIdentity) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Denies a fixed set of packages.
#[derive(Debug, Default, Clone)]
pub struct PackageDenyList {
    denied: HashSet<String>,
}

impl PackageDenyList {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: packages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.denied_packages.iter().cloned())
    }
}

impl PolicyChecker for PackageDenyList {
    fn check_connect(&self, identity: &ClientIdentity) -> PolicyDecision {
        if self.denied.contains(&identity.package_name) {
            PolicyDecision::Deny(format!(
                "package {} may not use a sandbox",
                identity.package_name
            ))
        } else {
            PolicyDecision::Allow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_list_matches_package_only() {
        let policy = PackageDenyList::new(["com.blocked"]);

        assert!(matches!(
            policy.check_connect(&ClientIdentity::new(1, "com.blocked")),
            PolicyDecision::Deny(_)
        ));
        assert_eq!(
            policy.check_load(&ClientIdentity::new(2, "com.fine"), &ModuleName::new("ads")),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_load_check_defaults_to_connect_check() {
        let policy = PackageDenyList::from_config(&PolicyConfig {
            denied_packages: vec!["com.blocked".to_string()],
        });
        assert!(matches!(
            policy.check_load(&ClientIdentity::new(1, "com.blocked"), &ModuleName::new("x")),
            PolicyDecision::Deny(_)
        ));
        assert_eq!(
            AllowAll.check_connect(&ClientIdentity::new(1, "com.blocked")),
            PolicyDecision::Allow
        );
    }
}
