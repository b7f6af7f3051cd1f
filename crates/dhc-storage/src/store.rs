//! Persisted relational state: labels and events.

use async_trait::async_trait;
use dhc_core::{Event, Label, NaturalKey};
use thiserror::Error;

/// The persisted store cannot be reached or rejected an operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_label(&self, name: &str) -> Result<Option<Label>, StoreError>;

    /// Create a label if no label with `name` exists. Never fails on a duplicate.
    async fn create_label(&self, name: &str) -> Result<(), StoreError>;

    async fn find_event(&self, key: &NaturalKey) -> Result<Option<Event>, StoreError>;

    /// Insert all events in one batched write; rows whose natural key already
    /// exists are left alone. Returns the number of rows written.
    async fn insert_events(&self, events: &[Event]) -> Result<usize, StoreError>;

    /// Overwrite the mutable fields of the row matching `event`'s natural key.
    /// Returns the number of rows touched.
    async fn update_event(&self, event: &Event) -> Result<usize, StoreError>;
}
