use std::sync::Arc;

use dhc_core::LabelId;
use dhc_storage::{EventStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LabelResolutionError {
    #[error("label `{name}`: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("label `{0}` missing right after it was created")]
    Missing(String),
}

/// Get-or-create access to labels by name.
#[derive(Clone)]
pub struct LabelRegistry {
    store: Arc<dyn EventStore>,
}

impl LabelRegistry {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Look up `name`, creating the label first when it does not exist yet.
    ///
    /// Creation is a no-op when another writer got there first, so the second
    /// lookup always sees exactly one row.
    pub async fn resolve(&self, name: &str) -> Result<LabelId, LabelResolutionError> {
        let store_err = |source| LabelResolutionError::Store {
            name: name.to_string(),
            source,
        };
        if let Some(label) = self.store.find_label(name).await.map_err(store_err)? {
            debug!(label = name, id = %label.id, "label resolved");
            return Ok(label.id);
        }
        self.store.create_label(name).await.map_err(store_err)?;
        let label = self
            .store
            .find_label(name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| LabelResolutionError::Missing(name.to_string()))?;
        info!(label = name, id = %label.id, "label created");
        Ok(label.id)
    }
}
