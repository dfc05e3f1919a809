//! Static registry of transfer modules
//!
//! Module names from configuration are resolved here once, at startup, and
//! every resulting spec is validated before any work begins.

use std::collections::{BTreeMap, HashSet};

use crate::error::{EtlError, EtlResult};
use crate::modules;
use crate::transfer::TransferSpec;

/// Builds a module's spec
pub type SpecFactory = fn() -> TransferSpec;

/// A configured module with its validated spec
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub name: String,
    pub spec: TransferSpec,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<&'static str, SpecFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The modules compiled into this binary
    pub fn builtin() -> Self {
        Self::new()
            .register("customers", modules::customers::spec)
            .register("orders", modules::orders::spec)
    }

    pub fn register(mut self, name: &'static str, factory: SpecFactory) -> Self {
        self.factories.insert(name, factory);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build and validate the spec of one module
    pub fn get(&self, name: &str) -> EtlResult<TransferSpec> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EtlError::UnknownModule {
                name: name.to_string(),
                registered: self.names().join(", "),
            })?;

        let spec = factory();
        spec.validate().map_err(|reason| EtlError::InvalidSpec {
            module: name.to_string(),
            reason,
        })?;
        Ok(spec)
    }

    /// Resolve every configured module, failing on the first unknown or invalid one
    pub fn resolve(&self, names: &[String]) -> EtlResult<Vec<ResolvedModule>> {
        let mut seen = HashSet::new();
        let mut pairs = HashSet::new();
        let mut resolved = Vec::with_capacity(names.len());

        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(EtlError::Config(format!(
                    "module '{}' is listed more than once",
                    name
                )));
            }

            let spec = self.get(name)?;
            if !pairs.insert(spec.pair()) {
                return Err(EtlError::Config(format!(
                    "module '{}' moves {} which another configured module already moves",
                    name,
                    spec.pair()
                )));
            }

            resolved.push(ResolvedModule {
                name: name.clone(),
                spec,
            });
        }

        Ok(resolved)
    }
}
