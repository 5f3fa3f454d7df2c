//! Module kind registry: names mapped to a class plus a processor
//! constructor, so contexts can be instantiated from topology
//! descriptions without touching concrete processor types.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::module::{Module, ModuleClass, Processor};

type Constructor = Box<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

struct ModuleKind {
    class: ModuleClass,
    ctor: Constructor,
}

/// Thread-safe registry of module kinds.
#[derive(Default)]
pub struct ModuleRegistry {
    kinds: RwLock<HashMap<String, Arc<ModuleKind>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind under `name`. Fails if the name is taken.
    pub fn register<F>(&self, name: impl Into<String>, class: ModuleClass, ctor: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Processor> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut kinds = self.kinds.write();
        if kinds.contains_key(&name) {
            return Err(Error::DuplicateKind(name));
        }
        kinds.insert(
            name,
            Arc::new(ModuleKind {
                class,
                ctor: Box::new(ctor),
            }),
        );
        Ok(())
    }

    /// Instantiate a fresh, unintegrated module of the named kind.
    pub fn create(&self, name: &str) -> Result<Module> {
        let kind = self
            .kinds
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(name.into()))?;
        Module::new(kind.class, (kind.ctor)())
    }

    pub fn class_of(&self, name: &str) -> Result<ModuleClass> {
        self.kinds
            .read()
            .get(name)
            .map(|k| k.class)
            .ok_or_else(|| Error::UnknownKind(name.into()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.read().contains_key(name)
    }

    /// Registered kind names, unordered.
    pub fn kind_names(&self) -> Vec<String> {
        self.kinds.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ProcessContext;

    struct Null;
    impl Processor for Null {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
    }

    #[test]
    fn test_register_and_create() {
        let reg = ModuleRegistry::new();
        reg.register("null", ModuleClass::new(1, 0, 1), || Box::new(Null))
            .unwrap();
        assert!(reg.contains("null"));
        let m = reg.create("null").unwrap();
        assert_eq!(m.class().n_istreams, 1);
        assert_eq!(m.class().n_ostreams, 1);
        assert!(!m.integrated());
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let reg = ModuleRegistry::new();
        reg.register("dup", ModuleClass::new(0, 0, 1), || Box::new(Null))
            .unwrap();
        let err = reg
            .register("dup", ModuleClass::new(0, 0, 2), || Box::new(Null))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKind(_)));
    }

    #[test]
    fn test_unknown_kind() {
        let reg = ModuleRegistry::new();
        assert!(matches!(reg.create("nope"), Err(Error::UnknownKind(_))));
        assert!(matches!(reg.class_of("nope"), Err(Error::UnknownKind(_))));
    }

    #[test]
    fn test_kind_names() {
        let reg = ModuleRegistry::new();
        reg.register("a", ModuleClass::new(0, 0, 1), || Box::new(Null))
            .unwrap();
        reg.register("b", ModuleClass::new(0, 0, 1), || Box::new(Null))
            .unwrap();
        let mut names = reg.kind_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
