//! Key naming shared by writers and watchers.
//!
//! Configuration lives under `<namespace>/<entity>/<variable>`, for example
//! `/config/srv1/timeout`. The layout is the addressing scheme for both sides,
//! so it must stay stable.

use crate::Error;

pub const DEFAULT_NAMESPACE: &str = "/config";
pub const SEPARATOR: char = '/';

/// Builds and takes apart keys for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Creates a key space rooted at `namespace`. A trailing separator is
    /// ignored, so `/config` and `/config/` are the same namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        while namespace.ends_with(SEPARATOR) {
            namespace.pop();
        }
        Self { namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix covering every variable of `entity`, separator included so that
    /// `srv1` does not also match `srv10`.
    pub fn entity_prefix(&self, entity: &str) -> Result<String, Error> {
        validate(entity)?;
        Ok(format!("{}{}{}{}", self.namespace, SEPARATOR, entity, SEPARATOR))
    }

    /// Full key of `variable` under `entity`.
    pub fn key(&self, entity: &str, variable: &str) -> Result<String, Error> {
        validate(variable)?;
        Ok(format!("{}{}", self.entity_prefix(entity)?, variable))
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Trailing path segment of `key`, which is the variable name the local view
/// is indexed by.
pub fn variable_name(key: &str) -> &str {
    match key.rfind(SEPARATOR) {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

fn validate(component: &str) -> Result<(), Error> {
    if component.is_empty() || component.contains(SEPARATOR) {
        return Err(Error::InvalidKey(component.to_string()));
    }
    Ok(())
}
