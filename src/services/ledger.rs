//! Borrow ledger: lifecycle rules for borrow records
//!
//! The ledger validates and applies record transitions. It never touches
//! copy counters; pairing a record change with the matching catalog change
//! is the coordinator's job ([`LoansService`](super::loans::LoansService)).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    config::LoansConfig,
    error::{AppError, AppResult},
    models::{BorrowRecord, BorrowStatus, NewBorrow, OutstandingFilter},
    repository::{BorrowStream, LedgerStore},
};

/// Status of `record` as observed at `now`.
///
/// Pure: a returned record stays returned, anything else is overdue once its
/// due date has passed. Reads never persist this; see [`BorrowLedger::sweep_overdue`].
pub fn compute_status(record: &BorrowRecord, now: DateTime<Utc>) -> BorrowStatus {
    match record.status {
        BorrowStatus::Returned => BorrowStatus::Returned,
        _ if record.due_date < now => BorrowStatus::Overdue,
        _ => BorrowStatus::Active,
    }
}

/// Reject a checkout whose quantity or due date is unusable
pub fn validate_new_record(record: &NewBorrow, now: DateTime<Utc>) -> AppResult<()> {
    if record.quantity <= 0 {
        return Err(AppError::Validation(format!(
            "Quantity must be positive, got {}",
            record.quantity
        )));
    }
    if record.due_date <= now {
        return Err(AppError::Validation("Due date must be in the future".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct BorrowLedger {
    store: Arc<dyn LedgerStore>,
    max_renewals: i32,
}

impl BorrowLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LoansConfig) -> Self {
        Self {
            store,
            max_renewals: config.max_renewals,
        }
    }

    pub async fn get_record(&self, id: i32) -> AppResult<BorrowRecord> {
        self.store.get_record(id).await
    }

    /// Create an `Active` record
    pub async fn create_record(&self, record: &NewBorrow, now: DateTime<Utc>) -> AppResult<BorrowRecord> {
        validate_new_record(record, now)?;
        self.store.insert_record(record, now).await
    }

    /// Close an outstanding record
    pub async fn mark_returned(&self, id: i32, now: DateTime<Utc>) -> AppResult<BorrowRecord> {
        self.store.mark_returned(id, now).await
    }

    /// Extend an outstanding record's due date
    pub async fn renew(&self, id: i32, new_due_date: DateTime<Utc>, now: DateTime<Utc>) -> AppResult<BorrowRecord> {
        let record = self.store.get_record(id).await?;
        if record.status == BorrowStatus::Returned {
            return Err(AppError::InvalidState(format!("Cannot renew returned borrow record {}", id)));
        }
        if new_due_date <= now || new_due_date <= record.due_date {
            return Err(AppError::Validation(
                "New due date must be later than both now and the current due date".to_string(),
            ));
        }
        self.store.renew(id, new_due_date, self.max_renewals).await
    }

    /// Outstanding records, earliest due first
    pub async fn list_outstanding(&self, filter: OutstandingFilter) -> AppResult<BorrowStream<'_>> {
        self.store.list_outstanding(filter).await
    }

    /// Persist the overdue transition for every record due before `now`
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let changed = self.store.sweep_overdue(now).await?;
        if changed > 0 {
            tracing::info!(changed, "Marked borrow records overdue");
        }
        Ok(changed)
    }
}
