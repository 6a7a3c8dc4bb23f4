use std::{collections::HashMap, error::Error, fmt::Display, sync::Arc};

use crate::Subaddress;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RegistryError {
    DuplicateName(String),
    NotFound(String),
    /// The server is already serving connections and the registry can no longer change
    Sealed,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => {
                write!(f, "Sub-address {} is already registered", name)
            }
            RegistryError::NotFound(name) => write!(f, "Unknown sub-address {}", name),
            RegistryError::Sealed => {
                write!(f, "Sub-addresses cannot be registered while serving")
            }
        }
    }
}

impl Error for RegistryError {}

/// Maps sub-address names to their handlers.
///
/// The registry is filled before the server starts and only read afterwards.
#[derive(Default, Clone)]
pub struct Registry {
    entries: HashMap<String, Arc<dyn Subaddress>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn Subaddress>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        log::debug!("Registered sub-address {}", name);
        self.entries.insert(name, handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Subaddress>, RegistryError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Names of all registered sub-addresses, in no particular order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Registry, RegistryError};
    use crate::{HandlerError, Subaddress};

    struct Fixed(&'static [u8]);

    impl Subaddress for Fixed {
        fn handle_sync(&self, _payload: &[u8], _end: bool) -> Result<Vec<u8>, HandlerError> {
            Ok(self.0.to_vec())
        }

        fn handle_async(&self, _control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register("hislip0", Arc::new(Fixed(b"a"))).unwrap();
        registry.register("hislip1", Arc::new(Fixed(b"b"))).unwrap();
        assert_eq!(
            registry.register("hislip0", Arc::new(Fixed(b"c"))),
            Err(RegistryError::DuplicateName("hislip0".to_string()))
        );
        assert_eq!(registry.len(), 2);
        // the first registration is kept
        let handler = registry.lookup("hislip0").unwrap();
        assert_eq!(handler.handle_sync(b"", true).unwrap(), b"a");
    }

    #[test]
    fn lookup_miss() {
        let registry = Registry::new();
        match registry.lookup("inst0") {
            Err(RegistryError::NotFound(name)) => assert_eq!(name, "inst0"),
            Err(other) => panic!("expected NotFound, got {}", other),
            Ok(_) => panic!("expected NotFound"),
        }
    }
}
