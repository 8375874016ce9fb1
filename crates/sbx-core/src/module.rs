//! Module metadata and load results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::ModuleName;

/// Catalog entry describing an installed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Name the client uses to refer to the module
    pub name: ModuleName,

    /// Entry point the worker instantiates (class, symbol, or path)
    pub provider: String,

    /// Installed version, if the catalog tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ModuleInfo {
    /// Creates catalog metadata with no version.
    pub fn new(name: impl Into<ModuleName>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            version: None,
        }
    }

    /// Sets the installed version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Opaque handle to the interface a loaded module exposes.
///
/// The token is minted by the worker; the manager only stores and forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInterface {
    pub token: String,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ModuleInterface {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A module that reached the loaded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModule {
    pub name: ModuleName,
    pub interface: ModuleInterface,
    pub loaded_at: DateTime<Utc>,
}

/// Reason a worker gave for failing to load a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorCode {
    /// The worker already has this module loaded
    AlreadyLoaded,
    /// The worker could not find the module's provider
    NotFound,
    /// The provider was found but failed to initialise
    ProviderInit,
    /// The worker itself failed to instantiate its loading machinery
    Instantiation,
    /// Any other worker-side failure
    Internal,
    /// A failure code defined by the module
    ModuleDefined(i32),
}

impl LoadErrorCode {
    /// True when the failure means the worker is unusable and should be stopped.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self, Self::Instantiation)
    }
}

impl fmt::Display for LoadErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyLoaded => write!(f, "already_loaded"),
            Self::NotFound => write!(f, "not_found"),
            Self::ProviderInit => write!(f, "provider_init"),
            Self::Instantiation => write!(f, "instantiation"),
            Self::Internal => write!(f, "internal"),
            Self::ModuleDefined(code) => write!(f, "module_defined:{code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_instantiation_is_fatal() {
        assert!(LoadErrorCode::Instantiation.is_fatal_to_worker());
        assert!(!LoadErrorCode::ProviderInit.is_fatal_to_worker());
        assert!(!LoadErrorCode::ModuleDefined(3).is_fatal_to_worker());
    }

    #[test]
    fn test_module_info_deserialize_without_version() {
        let info: ModuleInfo =
            serde_json::from_str(r#"{"name":"ads","provider":"libads.so"}"#).unwrap();
        assert_eq!(info, ModuleInfo::new("ads", "libads.so"));
        assert_eq!(info.with_version("2.1").version.as_deref(), Some("2.1"));
    }

    #[test]
    fn test_interface_omits_null_metadata() {
        let json = serde_json::to_string(&ModuleInterface::new("tok-1")).unwrap();
        assert_eq!(json, r#"{"token":"tok-1"}"#);
    }
}
