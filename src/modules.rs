use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use tracing::{debug, info};

use crate::{engine::Runtime, Result};

/// Owns the engine runtime and remembers which of its modules are loaded.
///
/// Loading is idempotent. The set of loaded modules is only changed through
/// this registry and is never reset behind its back.
pub struct ModuleRegistry<R: Runtime> {
    runtime: Arc<R>,
    loaded: Mutex<BTreeSet<String>>,
}

impl<R: Runtime> ModuleRegistry<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime: Arc::new(runtime),
            loaded: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Load `name` unless this registry already loaded it.
    pub fn ensure_loaded(&self, name: &str) -> Result<()> {
        let mut loaded = self.loaded.lock().expect("Poisoned lock");
        if loaded.contains(name) {
            debug!(module = name, "module already loaded");
            return Ok(());
        }
        self.runtime
            .load_module(name)
            .with_context(|| format!("Error loading module {}", name))?;
        info!(module = name, "loaded module");
        loaded.insert(name.to_string());
        Ok(())
    }

    pub fn unload(&self, name: &str) -> Result<()> {
        let mut loaded = self.loaded.lock().expect("Poisoned lock");
        self.runtime
            .unload_module(name)
            .with_context(|| format!("Error unloading module {}", name))?;
        info!(module = name, "unloaded module");
        loaded.remove(name);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().expect("Poisoned lock").contains(name)
    }

    /// Modules the runtime reports as loaded.
    pub fn list(&self) -> Vec<String> {
        self.runtime.list_modules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toy::ToyRuntime;
    use pretty_assertions::assert_eq;

    #[test]
    fn loading_is_idempotent() -> Result<()> {
        let registry = ModuleRegistry::new(ToyRuntime::new());
        registry.ensure_loaded("basemod")?;
        registry.ensure_loaded("bugs")?;
        registry.ensure_loaded("basemod")?;
        assert_eq!(registry.list(), vec!["basemod", "bugs"]);
        assert_eq!(registry.runtime().load_count(), 2);
        assert!(registry.is_loaded("bugs"));
        Ok(())
    }

    #[test]
    fn unknown_module_fails() {
        let registry = ModuleRegistry::new(ToyRuntime::new());
        assert!(registry.ensure_loaded("glm").is_err());
        assert!(!registry.is_loaded("glm"));
    }

    #[test]
    fn unload_forgets_module() -> Result<()> {
        let registry = ModuleRegistry::new(ToyRuntime::new());
        registry.ensure_loaded("lecuyer")?;
        registry.unload("lecuyer")?;
        assert!(!registry.is_loaded("lecuyer"));
        assert!(registry.list().is_empty());
        registry.ensure_loaded("lecuyer")?;
        assert_eq!(registry.runtime().load_count(), 2);
        Ok(())
    }
}
