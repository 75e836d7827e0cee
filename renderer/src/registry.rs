use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use sstemplate::CompiledTemplate;
use sstemplate::parser::ParseError;
use thiserror::Error;
use tracing::debug;

use crate::store::{CacheStore, StoreError};

const TEMPLATE_EXTENSION: &str = "ss";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read template '{name}': {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },

    #[error("template '{name}' failed to compile ({} error(s))", .errors.len())]
    Compile {
        name: String,
        /// Template text, for rendering the diagnostics.
        source_text: String,
        errors: Vec<ParseError>,
    },
}

/// Compiles named templates on first use and keeps them for the life of the
/// process, until flushed.
#[derive(Debug)]
pub struct TemplateRegistry {
    base_dir: PathBuf,
    compiled: RwLock<HashMap<String, Arc<CompiledTemplate>>>,
}

impl TemplateRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        TemplateRegistry {
            base_dir: base_dir.into(),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File backing `name`. A name without an extension gets `.ss`.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = self.base_dir.join(name);
        if path.extension().is_none() {
            path.with_extension(TEMPLATE_EXTENSION)
        } else {
            path
        }
    }

    /// The compiled template for `name`, compiling it if needed. Callers keep
    /// the returned snapshot for the whole render, so a concurrent flush never
    /// changes a template mid-render.
    pub fn get(&self, name: &str) -> Result<Arc<CompiledTemplate>, LoadError> {
        if let Some(template) = self.read().get(name) {
            return Ok(Arc::clone(template));
        }

        let source = std::fs::read_to_string(self.resolve(name)).map_err(|source| LoadError::Io {
            name: name.to_string(),
            source,
        })?;
        let compiled = sstemplate::compile(&source, 0).map_err(|errors| LoadError::Compile {
            name: name.to_string(),
            source_text: source.clone(),
            errors,
        })?;
        debug!(template = name, regions = compiled.regions.len(), "compiled template");

        let mut map = self
            .compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = map
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(compiled));
        Ok(Arc::clone(entry))
    }

    /// Number of compiled templates held.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every compiled template and clear `store`. Renders already
    /// holding a template finish with the version they started with.
    pub fn flush(&self, store: &dyn CacheStore) -> Result<(), StoreError> {
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("flushed compiled templates");
        store.clear()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CompiledTemplate>>> {
        self.compiled.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn compiles_once_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Page.ss"), "<% cached %>$Title<% end_cached %>").unwrap();
        let registry = TemplateRegistry::new(dir.path());

        let first = registry.get("Page").unwrap();
        let second = registry.get("Page").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn flush_recompiles_and_clears_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Page.ss");
        std::fs::write(&path, "old").unwrap();
        let registry = TemplateRegistry::new(dir.path());
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(60)).unwrap();

        let old = registry.get("Page").unwrap();
        std::fs::write(&path, "new").unwrap();
        registry.flush(&store).unwrap();
        let new = registry.get("Page").unwrap();

        assert!(store.is_empty());
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.nodes, vec![sstemplate::node::TemplateNode::text("new")]);
        assert_eq!(old.nodes, vec![sstemplate::node::TemplateNode::text("old")]);
    }

    #[test]
    fn missing_template_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::new(dir.path());
        assert!(matches!(registry.get("Nope"), Err(LoadError::Io { .. })));
    }

    #[test]
    fn compile_errors_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Bad.ss"), "<% if $A %>").unwrap();
        let registry = TemplateRegistry::new(dir.path());
        match registry.get("Bad") {
            Err(LoadError::Compile { errors, source_text, .. }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(source_text, "<% if $A %>");
            }
            other => panic!("expected compile error, got {:?}", other),
        }
        assert!(registry.is_empty());
    }
}
