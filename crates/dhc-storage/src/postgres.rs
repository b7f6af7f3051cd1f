//! Postgres-backed [`EventStore`] (sqlx).

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dhc_core::{Event, Label, LabelId, NaturalKey};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::{EventStore, StoreError};

/// Seven binds per row keeps a chunk well under the 65535 bind-parameter limit.
const MAX_ROWS_PER_INSERT: usize = 5_000;

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        info!(target = %redact_database_url(database_url), "connected to event store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// All chunks commit together; a failed chunk leaves no rows from the batch.
    async fn insert_in_chunks(
        &self,
        events: &[Event],
        rows_per_statement: usize,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for chunk in events.chunks(rows_per_statement.max(1)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO event ("timestamp", title, "text", link, label_id, image_link, media_link) "#,
            );
            qb.push_values(chunk, |mut row, event| {
                row.push_bind(event.timestamp)
                    .push_bind(event.title.clone())
                    .push_bind(event.text.clone())
                    .push_bind(event.link.clone())
                    .push_bind(event.label_id.0)
                    .push_bind(event.image_link.clone())
                    .push_bind(event.media_link.clone());
            });
            qb.push(r#" ON CONFLICT (label_id, "timestamp", title) DO NOTHING"#);
            let result = qb.build().execute(&mut *tx).await?;
            debug!(rows = chunk.len(), written = result.rows_affected(), "batched insert");
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Host/database part of a connection string, without credentials.
pub fn redact_database_url(database_url: &str) -> &str {
    database_url
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(database_url)
}

fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        timestamp: row.try_get::<NaiveDateTime, _>("timestamp")?,
        title: row.try_get("title")?,
        text: row.try_get("text")?,
        link: row.try_get("link")?,
        label_id: LabelId(row.try_get("label_id")?),
        image_link: row.try_get("image_link")?,
        media_link: row.try_get("media_link")?,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn find_label(&self, name: &str) -> Result<Option<Label>, StoreError> {
        let row = sqlx::query("SELECT id, name FROM label WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Label, sqlx::Error> {
            Ok(Label {
                id: LabelId(row.try_get("id")?),
                name: row.try_get("name")?,
            })
        })
        .transpose()
        .map_err(StoreError::Database)
    }

    async fn create_label(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO label (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_event(&self, key: &NaturalKey) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            r#"SELECT "timestamp", title, "text", link, label_id, image_link, media_link
               FROM event
               WHERE label_id = $1 AND "timestamp" = $2 AND title = $3"#,
        )
        .bind(key.label_id.0)
        .bind(key.timestamp)
        .bind(&key.title)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(event_from_row).transpose()?)
    }

    async fn insert_events(&self, events: &[Event]) -> Result<usize, StoreError> {
        self.insert_in_chunks(events, MAX_ROWS_PER_INSERT).await
    }

    async fn update_event(&self, event: &Event) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"UPDATE event
               SET "text" = $1, link = $2, image_link = $3, media_link = $4
               WHERE label_id = $5 AND "timestamp" = $6 AND title = $7"#,
        )
        .bind(&event.text)
        .bind(&event.link)
        .bind(&event.image_link)
        .bind(&event.media_link)
        .bind(event.label_id.0)
        .bind(event.timestamp)
        .bind(&event.title)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
