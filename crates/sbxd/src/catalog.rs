//! Installed-module catalog.
//!
//! The catalog is the storage backend's answer to "is this module
//! installed for this client?". The manager asks it before creating a
//! load session.

use std::collections::HashMap;

use sbx_core::{ClientIdentity, ModuleInfo, ModuleName};

/// Resolves module names to installed modules.
pub trait ModuleCatalog: Send + Sync + 'static {
    /// Returns the module's metadata, or `None` if it is not installed.
    fn resolve(&self, identity: &ClientIdentity, module: &ModuleName) -> Option<ModuleInfo>;
}

/// Catalog built from a fixed module list, visible to every client.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    modules: HashMap<ModuleName, ModuleInfo>,
}

impl StaticCatalog {
    pub fn new(modules: impl IntoIterator<Item = ModuleInfo>) -> Self {
        Self {
            modules: modules
                .into_iter()
                .map(|info| (info.name.clone(), info))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleCatalog for StaticCatalog {
    fn resolve(&self, _identity: &ClientIdentity, module: &ModuleName) -> Option<ModuleInfo> {
        self.modules.get(module).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown() {
        let catalog = StaticCatalog::new([
            ModuleInfo::new("ads", "libads.so"),
            ModuleInfo::new("maps", "libmaps.so").with_version("2"),
        ]);
        let client = ClientIdentity::new(1, "com.example");

        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog
                .resolve(&client, &ModuleName::new("maps"))
                .and_then(|m| m.version),
            Some("2".to_string())
        );
        assert!(catalog.resolve(&client, &ModuleName::new("chat")).is_none());
    }

    #[test]
    fn test_later_duplicate_wins() {
        let catalog = StaticCatalog::new([
            ModuleInfo::new("ads", "old.so"),
            ModuleInfo::new("ads", "new.so"),
        ]);
        let info = catalog
            .resolve(&ClientIdentity::new(1, "a"), &ModuleName::new("ads"))
            .unwrap();
        assert_eq!(info.provider, "new.so");
        assert!(!catalog.is_empty());
    }
}
