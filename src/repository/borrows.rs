//! Borrows repository for database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tokio_stream::StreamExt;

use super::{BorrowStream, LedgerStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        borrow::{BorrowRecord, NewBorrow, OutstandingFilter},
        enums::BorrowStatus,
    },
};

const OUTSTANDING_BY_BOOK: &str = r#"
    SELECT * FROM borrows
    WHERE book_id = $1 AND status <> 'RETURNED'
    ORDER BY due_date, id
"#;

const OUTSTANDING_BY_USER: &str = r#"
    SELECT * FROM borrows
    WHERE user_id = $1 AND status <> 'RETURNED'
    ORDER BY due_date, id
"#;

#[derive(Clone)]
pub struct BorrowsRepository {
    pool: Pool<Postgres>,
}

impl BorrowsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for BorrowsRepository {
    /// Get borrow record by ID
    async fn get_record(&self, id: i32) -> AppResult<BorrowRecord> {
        sqlx::query_as::<_, BorrowRecord>("SELECT * FROM borrows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Borrow record with id {} not found", id)))
    }

    async fn insert_record(&self, record: &NewBorrow, created_at: DateTime<Utc>) -> AppResult<BorrowRecord> {
        sqlx::query_as::<_, BorrowRecord>(
            r#"
            INSERT INTO borrows (user_id, book_id, quantity, due_date, status, renewals, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            RETURNING *
            "#,
        )
        .bind(record.user_id)
        .bind(record.book_id)
        .bind(record.quantity)
        .bind(record.due_date)
        .bind(BorrowStatus::Active)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => AppError::NotFound(format!(
                "User {} or book {} no longer exists",
                record.user_id, record.book_id
            )),
            other => AppError::Database(other),
        })
    }

    async fn mark_returned(&self, id: i32, returned_at: DateTime<Utc>) -> AppResult<BorrowRecord> {
        let updated = sqlx::query_as::<_, BorrowRecord>(
            r#"
            UPDATE borrows
            SET status = 'RETURNED', returned_at = $2
            WHERE id = $1 AND status <> 'RETURNED'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(returned_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            None => {
                self.get_record(id).await?;
                Err(AppError::InvalidState(format!("Borrow record {} is already returned", id)))
            }
        }
    }

    async fn renew(&self, id: i32, due_date: DateTime<Utc>, max_renewals: i32) -> AppResult<BorrowRecord> {
        let updated = sqlx::query_as::<_, BorrowRecord>(
            r#"
            UPDATE borrows
            SET due_date = $2, renewals = renewals + 1, status = 'ACTIVE'
            WHERE id = $1 AND status <> 'RETURNED' AND renewals < $3
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(due_date)
        .bind(max_renewals)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            None => {
                let record = self.get_record(id).await?;
                if record.status == BorrowStatus::Returned {
                    Err(AppError::InvalidState(format!("Cannot renew returned borrow record {}", id)))
                } else {
                    Err(AppError::BusinessRule(format!(
                        "Maximum renewals reached ({}/{})",
                        record.renewals, max_renewals
                    )))
                }
            }
        }
    }

    async fn list_outstanding<'a>(&'a self, filter: OutstandingFilter) -> AppResult<BorrowStream<'a>> {
        let (sql, id) = match filter {
            OutstandingFilter::Book(id) => (OUTSTANDING_BY_BOOK, id),
            OutstandingFilter::User(id) => (OUTSTANDING_BY_USER, id),
        };

        let rows = sqlx::query_as::<_, BorrowRecord>(sql)
            .bind(id)
            .fetch(&self.pool)
            .map(|row| row.map_err(AppError::from));

        Ok(Box::pin(rows))
    }

    async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE borrows SET status = 'OVERDUE' WHERE status = 'ACTIVE' AND due_date < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
