//! Point writes of configuration values.

use tracing::{debug, info};

use crate::key::KeySpace;
use crate::store::{ConfigStore, Revision};
use crate::Error;

/// Writes single configuration values. Last writer wins; nothing is retried.
pub struct Writer<S> {
    store: S,
    keys: KeySpace,
}

impl<S: ConfigStore> Writer<S> {
    pub fn new(store: S, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Stores `value` as `variable` of `entity` and returns the revision of
    /// the write.
    pub async fn write(
        &self,
        entity: &str,
        variable: &str,
        value: &str,
    ) -> Result<Revision, Error> {
        let key = self.keys.key(entity, variable)?;
        let revision = self
            .store
            .put(&key, value)
            .await
            .map_err(|e| Error::write(&key, e))?;

        info!(%key, %revision, "value written");
        Ok(revision)
    }

    /// Removes `variable` of `entity`. Returns the revision of the delete, or
    /// `None` if the variable was not set.
    pub async fn unset(&self, entity: &str, variable: &str) -> Result<Option<Revision>, Error> {
        let key = self.keys.key(entity, variable)?;
        let revision = self
            .store
            .delete(&key)
            .await
            .map_err(|e| Error::write(&key, e))?;

        match revision {
            Some(revision) => info!(%key, %revision, "value removed"),
            None => debug!(%key, "nothing to remove"),
        }
        Ok(revision)
    }
}
