//! Postgres-backed outbox store.
//!
//! Messages live in the `outbox_messages` table. Every unit of work wraps one
//! SQLx transaction; dropping the unit without committing rolls it back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check / not-null violation) | `23514` / `23502` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use outbox_core::{Message, MessageId, MessageStatus};

use super::r#trait::{OutboxStore, StoreError, UnitOfWork};
use crate::config::PostgresConfig;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        id           UUID PRIMARY KEY,
        payload      TEXT NOT NULL,
        status       VARCHAR(50) NOT NULL DEFAULT 'pending',
        processed_at TIMESTAMPTZ NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_PENDING_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS outbox_messages_pending_idx
        ON outbox_messages (created_at, id)
        WHERE status = 'pending'
"#;

/// Postgres-backed transactional outbox store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a new pool from validated configuration.
    #[instrument(skip(config), fields(host = config.host.as_deref().unwrap_or("<url>")), err)]
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.dsn())
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its pending index when missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(CREATE_PENDING_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_pending_index", e))?;

        debug!("outbox schema ready");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Unit = PostgresUnitOfWork;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        Ok(PostgresUnitOfWork { tx })
    }
}

/// One open Postgres transaction.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    #[instrument(skip(self, message), fields(message_id = %message.id()), err)]
    async fn create(&mut self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id,
                payload,
                status,
                processed_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*message.id().as_uuid())
        .bind(message.payload())
        .bind(message.status().as_str())
        .bind(message.processed_at())
        .bind(message.created_at())
        .bind(message.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_message", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&mut self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                payload,
                status,
                processed_at,
                created_at,
                updated_at
            FROM outbox_messages
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_pending", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let row = MessageRow::from_row(&row)
                .map_err(|e| StoreError::Backend(format!("failed to read message row: {e}")))?;
            messages.push(row.into_message()?);
        }

        Ok(messages)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id()), err)]
    async fn mark_processed(&mut self, message: &Message) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'processed',
                processed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(*message.id().as_uuid())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(message.id()));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique / check / not-null violations
                Some("23505") | Some("23514") | Some("23502") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("timed out acquiring connection in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct MessageRow {
    id: uuid::Uuid,
    payload: String,
    status: String,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            processed_at: row.try_get("processed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl MessageRow {
    fn into_message(self) -> Result<Message, StoreError> {
        let status: MessageStatus = self.status.parse()?;
        Ok(Message::restore(
            MessageId::from_uuid(self.id),
            self.payload,
            status,
            self.processed_at,
            self.created_at,
            self.updated_at,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, processed_at: Option<DateTime<Utc>>) -> MessageRow {
        let now = Utc::now();
        MessageRow {
            id: uuid::Uuid::now_v7(),
            payload: "order-created:42".to_string(),
            status: status.to_string(),
            processed_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn pending_row_maps_to_pending_message() {
        let message = row("pending", None).into_message().unwrap();
        assert!(message.is_pending());
        assert_eq!(message.payload(), "order-created:42");
    }

    #[test]
    fn processed_row_keeps_its_timestamp() {
        let at = Utc::now();
        let message = row("processed", Some(at)).into_message().unwrap();
        assert_eq!(message.processed_at(), Some(at));
    }

    #[test]
    fn inconsistent_rows_are_rejected() {
        assert!(matches!(
            row("processed", None).into_message(),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            row("pending", Some(Utc::now())).into_message(),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            row("archived", None).into_message(),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("begin_transaction", sqlx::Error::PoolClosed),
            StoreError::Unavailable(msg) if msg.contains("begin_transaction")
        ));
        assert!(matches!(
            map_sqlx_error("begin_transaction", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn unexpected_errors_map_to_backend() {
        assert!(matches!(
            map_sqlx_error("find_pending", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }

    /// Tests against a real Postgres instance.
    ///
    /// Run with `DATABASE_URL=postgres://... cargo test -p outbox-infra -- --ignored`.
    /// Each test works in its own throwaway schema.
    mod live {
        use super::*;
        use chrono::SubsecRound;

        use crate::config::RelayConfig;
        use crate::engine::OutboxEngine;
        use crate::publisher::{InMemoryPublisher, PublishError, Publisher};

        struct TestDb {
            store: PostgresOutboxStore,
            admin: PgPool,
            schema: String,
        }

        impl TestDb {
            async fn open() -> Option<Self> {
                let url = std::env::var("DATABASE_URL").ok()?;
                let schema = format!("outbox_test_{}", uuid::Uuid::now_v7().simple());

                let admin = PgPool::connect(&url).await.unwrap();
                sqlx::query(&format!("CREATE SCHEMA {schema}"))
                    .execute(&admin)
                    .await
                    .unwrap();

                let set_path = format!("SET search_path TO {schema}");
                let pool = PgPoolOptions::new()
                    .max_connections(4)
                    .after_connect(move |conn, _meta| {
                        let set_path = set_path.clone();
                        Box::pin(async move {
                            sqlx::query(&set_path).execute(conn).await?;
                            Ok(())
                        })
                    })
                    .connect(&url)
                    .await
                    .unwrap();

                let store = PostgresOutboxStore::new(pool);
                store.ensure_schema().await.unwrap();
                Some(Self {
                    store,
                    admin,
                    schema,
                })
            }

            async fn status_of(&self, id: MessageId) -> String {
                sqlx::query("SELECT status FROM outbox_messages WHERE id = $1")
                    .bind(*id.as_uuid())
                    .fetch_one(self.store.pool())
                    .await
                    .unwrap()
                    .get("status")
            }

            async fn seed(&self, messages: &[Message]) {
                let mut unit = self.store.begin().await.unwrap();
                for message in messages {
                    unit.create(message).await.unwrap();
                }
                unit.commit().await.unwrap();
            }

            async fn teardown(self) {
                self.store.close().await;
                sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
                    .execute(&self.admin)
                    .await
                    .unwrap();
                self.admin.close().await;
            }
        }

        /// Deletes the row carrying `victim` as soon as that payload is sent,
        /// so the relay's status update for it finds nothing to mark.
        struct DeletingPublisher {
            inner: InMemoryPublisher,
            pool: PgPool,
            victim: &'static str,
        }

        #[async_trait]
        impl Publisher for DeletingPublisher {
            async fn send(&self, channel: &str, payload: &[u8]) -> Result<(), PublishError> {
                self.inner.send(channel, payload).await?;
                if payload == self.victim.as_bytes() {
                    sqlx::query("DELETE FROM outbox_messages WHERE payload = $1")
                        .bind(self.victim)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| PublishError::Unavailable(e.to_string()))?;
                }
                Ok(())
            }

            async fn close(&self) {
                self.inner.close().await;
            }
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn order_created_end_to_end() {
            let Some(db) = TestDb::open().await else { return };
            let publisher = InMemoryPublisher::new();
            let engine =
                OutboxEngine::new(db.store.clone(), publisher.clone(), RelayConfig::default())
                    .unwrap();

            let id = engine.enqueue("order-created:42").await.unwrap();
            assert_eq!(db.status_of(id).await, "pending");

            assert_eq!(engine.relay().await.unwrap().published, 1);
            assert_eq!(publisher.sent_payloads(), vec!["order-created:42"]);
            assert_eq!(db.status_of(id).await, "processed");
            assert!(engine.relay().await.unwrap().is_idle());

            db.teardown().await;
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn find_pending_orders_by_creation_and_keeps_microseconds() {
            let Some(db) = TestDb::open().await else { return };
            let base = Utc::now();
            let oldest = Message::new_at("first", base);
            let middle = Message::new_at("second", base + chrono::Duration::milliseconds(1));
            let newest = Message::new_at("third", base + chrono::Duration::milliseconds(2));
            // Inserted out of order on purpose.
            db.seed(&[newest.clone(), oldest.clone(), middle.clone()]).await;

            let mut unit = db.store.begin().await.unwrap();
            let fetched = unit.find_pending(2).await.unwrap();
            unit.rollback().await.unwrap();

            let ids: Vec<_> = fetched.iter().map(|m| m.id()).collect();
            assert_eq!(ids, vec![oldest.id(), middle.id()]);
            assert_eq!(fetched[0].created_at(), oldest.created_at().trunc_subsecs(6));
            assert!(fetched[0].is_pending());

            db.teardown().await;
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn mark_processed_only_touches_pending_rows_and_rolls_back() {
            let Some(db) = TestDb::open().await else { return };
            let message = Message::new("a");
            db.seed(std::slice::from_ref(&message)).await;

            let mut unit = db.store.begin().await.unwrap();
            unit.mark_processed(&message).await.unwrap();
            assert!(matches!(
                unit.mark_processed(&message).await,
                Err(StoreError::NotFound(id)) if id == message.id()
            ));
            unit.rollback().await.unwrap();
            assert_eq!(db.status_of(message.id()).await, "pending");

            let mut unit = db.store.begin().await.unwrap();
            unit.mark_processed(&message).await.unwrap();
            unit.commit().await.unwrap();
            assert_eq!(db.status_of(message.id()).await, "processed");

            let mut unit = db.store.begin().await.unwrap();
            assert!(unit.find_pending(10).await.unwrap().is_empty());
            assert!(matches!(
                unit.mark_processed(&message).await,
                Err(StoreError::NotFound(_))
            ));
            unit.rollback().await.unwrap();

            db.teardown().await;
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn duplicate_id_is_a_conflict() {
            let Some(db) = TestDb::open().await else { return };
            let message = Message::new("a");
            db.seed(std::slice::from_ref(&message)).await;

            let mut unit = db.store.begin().await.unwrap();
            assert!(matches!(
                unit.create(&message).await,
                Err(StoreError::Conflict(_))
            ));
            drop(unit);

            db.teardown().await;
        }

        #[tokio::test]
        #[ignore = "needs DATABASE_URL"]
        async fn failed_mark_rolls_back_batch_and_resends_earlier_payload() {
            let Some(db) = TestDb::open().await else { return };
            let inner = InMemoryPublisher::new();
            let publisher = DeletingPublisher {
                inner: inner.clone(),
                pool: db.store.pool().clone(),
                victim: "B",
            };
            let engine =
                OutboxEngine::new(db.store.clone(), publisher, RelayConfig::default()).unwrap();

            let a = engine.enqueue("A").await.unwrap();
            engine.enqueue("B").await.unwrap();

            let err = engine.relay().await.unwrap_err();
            assert!(matches!(
                err,
                crate::error::OutboxError::Persistence(StoreError::NotFound(_))
            ));
            // A was sent, but its status update was rolled back with the batch.
            assert_eq!(db.status_of(a).await, "pending");

            engine.relay().await.unwrap();
            assert_eq!(inner.send_count("A"), 2);
            assert_eq!(inner.send_count("B"), 1);
            assert_eq!(db.status_of(a).await, "processed");

            db.teardown().await;
        }
    }
}
