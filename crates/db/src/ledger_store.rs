use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use taskledger_core::store::{
    CommitBatch, DocumentKey, DocumentWrite, LedgerStore, Precondition, StoreError,
    StoredDocument,
};
use tracing::debug;

use crate::DbPool;

// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_SHAREDCACHE
const RETRYABLE_CODES: &[&str] = &["5", "6", "517", "262"];

/// [`LedgerStore`] over the `ledger_document` table.
///
/// A commit runs in one SQLite transaction: writes go first so the connection holds the
/// write lock before the read-only preconditions are checked.
pub struct SqlLedgerStore {
    pool: DbPool,
}

impl SqlLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl LedgerStore for SqlLedgerStore {
    async fn fetch(&self, key: &DocumentKey) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT collection, doc_id, version, body_json
             FROM ledger_document
             WHERE collection = ? AND doc_id = ?",
        )
        .bind(&key.collection)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx(key, error))?;

        row.map(document_from_row).transpose()
    }

    async fn list(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query(
            "SELECT collection, doc_id, version, body_json
             FROM ledger_document
             WHERE collection = ?
             ORDER BY doc_id ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx(&DocumentKey::new(collection, "*"), error))?;

        rows.into_iter().map(document_from_row).collect()
    }

    async fn commit(&self, batch: CommitBatch) -> Result<Vec<StoredDocument>, StoreError> {
        let commit_key = DocumentKey::new("ledger_document", "commit");
        let mut tx = self.pool.begin().await.map_err(|error| map_sqlx(&commit_key, error))?;

        let mut written = Vec::with_capacity(batch.writes.len());
        for write in batch.writes {
            written.push(apply_write(&mut tx, write).await?);
        }
        for precondition in &batch.preconditions {
            check_precondition(&mut tx, precondition).await?;
        }

        tx.commit().await.map_err(|error| map_sqlx(&commit_key, error))?;
        debug!(
            event_name = "ledger.store.committed",
            writes = written.len(),
            preconditions = batch.preconditions.len(),
            "ledger batch committed"
        );
        Ok(written)
    }
}

async fn apply_write(
    tx: &mut Transaction<'_, Sqlite>,
    write: DocumentWrite,
) -> Result<StoredDocument, StoreError> {
    let DocumentWrite { key, expected_version, body } = write;
    let body_json = serde_json::to_string(&body)
        .map_err(|error| StoreError::Backend(format!("{key}: {error}")))?;
    let now = Utc::now().to_rfc3339();

    let version = match expected_version {
        None => {
            sqlx::query(
                "INSERT INTO ledger_document (
                    collection,
                    doc_id,
                    version,
                    body_json,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, 1, ?, ?, ?)",
            )
            .bind(&key.collection)
            .bind(&key.id)
            .bind(&body_json)
            .bind(&now)
            .bind(&now)
            .execute(&mut **tx)
            .await
            .map_err(|error| map_sqlx(&key, error))?;
            1
        }
        Some(expected) => {
            let next = expected + 1;
            let result = sqlx::query(
                "UPDATE ledger_document
                 SET version = ?, body_json = ?, updated_at = ?
                 WHERE collection = ? AND doc_id = ? AND version = ?",
            )
            .bind(to_sql_version(next)?)
            .bind(&body_json)
            .bind(&now)
            .bind(&key.collection)
            .bind(&key.id)
            .bind(to_sql_version(expected)?)
            .execute(&mut **tx)
            .await
            .map_err(|error| map_sqlx(&key, error))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(key));
            }
            next
        }
    };

    Ok(StoredDocument { key, version, body })
}

async fn check_precondition(
    tx: &mut Transaction<'_, Sqlite>,
    precondition: &Precondition,
) -> Result<(), StoreError> {
    let key = &precondition.key;
    let current = sqlx::query(
        "SELECT version FROM ledger_document WHERE collection = ? AND doc_id = ?",
    )
    .bind(&key.collection)
    .bind(&key.id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|error| map_sqlx(key, error))?
    .map(|row| row.try_get::<i64, _>("version"))
    .transpose()
    .map_err(|error| map_sqlx(key, error))?;

    let expected = precondition.expected_version.map(to_sql_version).transpose()?;
    if current != expected {
        return Err(StoreError::Conflict(key.clone()));
    }
    Ok(())
}

fn document_from_row(row: SqliteRow) -> Result<StoredDocument, StoreError> {
    let key = DocumentKey::new(
        row.try_get::<String, _>("collection").map_err(backend)?,
        row.try_get::<String, _>("doc_id").map_err(backend)?,
    );
    let version = row.try_get::<i64, _>("version").map_err(backend)?;
    let body_json = row.try_get::<String, _>("body_json").map_err(backend)?;
    let body = serde_json::from_str(&body_json)
        .map_err(|error| StoreError::Decode { key: key.clone(), message: error.to_string() })?;
    let version = u64::try_from(version).map_err(|_| StoreError::Decode {
        key: key.clone(),
        message: format!("negative version {version}"),
    })?;
    Ok(StoredDocument { key, version, body })
}

fn to_sql_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Backend(format!("version {version} overflows")))
}

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

/// Unique violations and lock contention mean another commit won the race.
fn map_sqlx(key: &DocumentKey, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(database) = &error {
        let retryable = database
            .code()
            .is_some_and(|code| RETRYABLE_CODES.contains(&code.as_ref()));
        if database.is_unique_violation() || retryable {
            return StoreError::Conflict(key.clone());
        }
    }
    StoreError::Backend(error.to_string())
}
