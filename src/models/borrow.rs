//! Borrow record model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::enums::BorrowStatus;

/// Borrow record from database
///
/// `status` is the persisted state. `Overdue` is only written by the sweep,
/// so a stored `Active` may already be overdue; use
/// [`compute_status`](crate::services::ledger::compute_status) to observe it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowRecord {
    pub id: i32,
    pub user_id: i32,
    pub book_id: i32,
    pub quantity: i32,
    pub due_date: DateTime<Utc>,
    pub status: BorrowStatus,
    pub renewals: i32,
    pub created_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

/// Fields of a record about to be checked out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBorrow {
    pub user_id: i32,
    pub book_id: i32,
    pub quantity: i32,
    pub due_date: DateTime<Utc>,
}

/// Scope of an outstanding-records listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutstandingFilter {
    Book(i32),
    User(i32),
}

impl OutstandingFilter {
    pub fn matches(&self, record: &BorrowRecord) -> bool {
        match self {
            OutstandingFilter::Book(id) => record.book_id == *id,
            OutstandingFilter::User(id) => record.user_id == *id,
        }
    }
}
