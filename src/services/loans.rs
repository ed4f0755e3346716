//! Transaction coordinator for checkouts, returns and renewals
//!
//! A checkout is a two-step saga: reserve copies in the catalog, then create
//! the ledger record. If the second step fails the reservation is released
//! before the error is surfaced. The atomic `reserve_copies` is the only
//! thing standing between concurrent checkouts and an oversold book; no
//! lock is taken here.
//!
//! Once a request reaches `Applying` it runs on its own task, so a caller
//! dropping the request future cannot strand reserved copies.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_stream::StreamExt;

use super::ledger::{compute_status, validate_new_record, BorrowLedger};
use crate::{
    config::LoansConfig,
    error::{AppError, AppResult},
    models::{BorrowRecord, BorrowStatus, NewBorrow, OutstandingFilter},
    repository::{CatalogStore, MembershipStore},
};

/// Progress of a single coordinator request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Requested,
    Validating,
    Applying,
    Committed,
    Rejected,
    RolledBack,
    /// Ledger and catalog disagree after a partially applied request
    Failed,
}

impl TxPhase {
    pub fn can_advance_to(self, next: TxPhase) -> bool {
        use TxPhase::*;
        matches!(
            (self, next),
            (Requested, Validating)
                | (Validating, Applying)
                | (Validating, Rejected)
                | (Applying, Committed)
                | (Applying, Rejected)
                | (Applying, RolledBack)
                | (Applying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxPhase::Committed | TxPhase::Rejected | TxPhase::RolledBack | TxPhase::Failed
        )
    }
}

/// Phase tracker; every transition is traced
#[derive(Debug)]
struct Transaction {
    operation: &'static str,
    book_id: Option<i32>,
    phase: TxPhase,
}

impl Transaction {
    fn begin(operation: &'static str, book_id: Option<i32>) -> Self {
        Self {
            operation,
            book_id,
            phase: TxPhase::Requested,
        }
    }

    fn advance(&mut self, next: TxPhase) {
        let legal = self.phase.can_advance_to(next);
        if !legal {
            tracing::error!(
                operation = self.operation,
                book_id = ?self.book_id,
                from = ?self.phase,
                to = ?next,
                "Illegal borrow transaction transition"
            );
        }
        debug_assert!(legal, "illegal transition {:?} -> {:?}", self.phase, next);
        tracing::debug!(
            operation = self.operation,
            book_id = ?self.book_id,
            from = ?self.phase,
            to = ?next,
            "Borrow transaction transition"
        );
        self.phase = next;
    }

    /// Move to a terminal phase and pass `result` through
    fn finish<T>(mut self, next: TxPhase, result: AppResult<T>) -> AppResult<T> {
        self.advance(next);
        if let Err(ref e) = result {
            match next {
                TxPhase::Rejected => tracing::info!(operation = self.operation, book_id = ?self.book_id, "Rejected: {}", e),
                TxPhase::RolledBack => tracing::warn!(operation = self.operation, book_id = ?self.book_id, "Rolled back: {}", e),
                TxPhase::Failed => tracing::error!(operation = self.operation, book_id = ?self.book_id, "Failed: {}", e),
                _ => {}
            }
        }
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            tracing::error!(
                operation = self.operation,
                book_id = ?self.book_id,
                phase = ?self.phase,
                "Borrow transaction abandoned before completion"
            );
        }
    }
}

#[derive(Clone)]
pub struct LoansService {
    catalog: Arc<dyn CatalogStore>,
    users: Arc<dyn MembershipStore>,
    ledger: BorrowLedger,
    config: LoansConfig,
}

impl LoansService {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        users: Arc<dyn MembershipStore>,
        ledger: BorrowLedger,
        config: LoansConfig,
    ) -> Self {
        Self {
            catalog,
            users,
            ledger,
            config,
        }
    }

    /// Due date given to a checkout that does not ask for one
    pub fn default_due_date(&self, now: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        now.checked_add_signed(Duration::days(self.config.default_loan_days))
            .ok_or_else(|| AppError::Validation("Due date is out of range".to_string()))
    }

    /// Borrow `quantity` copies of a book
    pub async fn checkout(
        &self,
        user_id: i32,
        book_id: i32,
        quantity: i32,
        due_date: DateTime<Utc>,
    ) -> AppResult<BorrowRecord> {
        let now = Utc::now();
        let request = NewBorrow {
            user_id,
            book_id,
            quantity,
            due_date,
        };

        let mut tx = Transaction::begin("checkout", Some(book_id));
        tx.advance(TxPhase::Validating);
        if let Err(e) = self.validate_checkout(&request, now).await {
            return tx.finish(TxPhase::Rejected, Err(e));
        }
        tx.advance(TxPhase::Applying);

        let this = self.clone();
        tokio::spawn(async move { this.apply_checkout(tx, request, now).await })
            .await
            .map_err(|e| AppError::Internal(format!("Checkout task aborted: {}", e)))?
    }

    async fn validate_checkout(&self, request: &NewBorrow, now: DateTime<Utc>) -> AppResult<()> {
        validate_new_record(request, now)?;
        self.users.get_user(request.user_id).await?;
        self.catalog.get_book(request.book_id).await?;

        if self.config.block_overdue_borrowers {
            let mut outstanding = self
                .ledger
                .list_outstanding(OutstandingFilter::User(request.user_id))
                .await?;
            while let Some(record) = outstanding.next().await {
                let record = record?;
                if compute_status(&record, now) == BorrowStatus::Overdue {
                    return Err(AppError::BusinessRule(format!(
                        "User {} has overdue borrow record {}",
                        request.user_id, record.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn apply_checkout(
        &self,
        tx: Transaction,
        request: NewBorrow,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowRecord> {
        if let Err(e) = self.catalog.reserve_copies(request.book_id, request.quantity).await {
            // nothing was persisted, so there is nothing to roll back
            if !matches!(e, AppError::InsufficientInventory(_) | AppError::NotFound(_)) {
                tracing::error!(book_id = request.book_id, "Reserving copies failed: {}", e);
            }
            return tx.finish(TxPhase::Rejected, Err(e));
        }

        match self.ledger.create_record(&request, now).await {
            Ok(record) => {
                tracing::info!(
                    record_id = record.id,
                    user_id = record.user_id,
                    book_id = record.book_id,
                    quantity = record.quantity,
                    "Checkout committed"
                );
                tx.finish(TxPhase::Committed, Ok(record))
            }
            Err(e) => match self.catalog.release_copies(request.book_id, request.quantity).await {
                // The book vanished meanwhile; its copies went with it
                Ok(_) | Err(AppError::NotFound(_)) => tx.finish(TxPhase::RolledBack, Err(e)),
                Err(compensation) => tx.finish(
                    TxPhase::Failed,
                    Err(AppError::InvariantViolation(format!(
                        "Could not release {} copies of book {} after failed checkout ({}): {}",
                        request.quantity, request.book_id, e, compensation
                    ))),
                ),
            },
        }
    }

    /// Return an outstanding record and put its copies back
    pub async fn return_record(&self, record_id: i32) -> AppResult<BorrowRecord> {
        let now = Utc::now();
        let mut tx = Transaction::begin("return", None);
        tx.advance(TxPhase::Validating);

        let record = match self.ledger.get_record(record_id).await {
            Ok(record) if record.status == BorrowStatus::Returned => {
                return tx.finish(
                    TxPhase::Rejected,
                    Err(AppError::InvalidState(format!(
                        "Borrow record {} is already returned",
                        record_id
                    ))),
                );
            }
            Ok(record) => record,
            Err(e) => return tx.finish(TxPhase::Rejected, Err(e)),
        };
        tx.book_id = Some(record.book_id);
        tx.advance(TxPhase::Applying);

        let this = self.clone();
        tokio::spawn(async move { this.apply_return(tx, record_id, now).await })
            .await
            .map_err(|e| AppError::Internal(format!("Return task aborted: {}", e)))?
    }

    async fn apply_return(&self, tx: Transaction, record_id: i32, now: DateTime<Utc>) -> AppResult<BorrowRecord> {
        // Racing returns are settled here: only one conditional update wins
        let returned = match self.ledger.mark_returned(record_id, now).await {
            Ok(record) => record,
            Err(e) => return tx.finish(TxPhase::Rejected, Err(e)),
        };

        match self.catalog.release_copies(returned.book_id, returned.quantity).await {
            Ok(_) => {
                tracing::info!(
                    record_id = returned.id,
                    book_id = returned.book_id,
                    quantity = returned.quantity,
                    "Return committed"
                );
                tx.finish(TxPhase::Committed, Ok(returned))
            }
            Err(AppError::NotFound(_)) => {
                tracing::warn!(book_id = returned.book_id, "Returned record for a deleted book");
                tx.finish(TxPhase::Committed, Ok(returned))
            }
            Err(e) => tx.finish(
                TxPhase::Failed,
                Err(AppError::InvariantViolation(format!(
                    "Borrow record {} returned but {} copies of book {} could not be released: {}",
                    returned.id, returned.quantity, returned.book_id, e
                ))),
            ),
        }
    }

    /// Extend a record's due date; defaults to one loan period past the
    /// later of now and the current due date.
    pub async fn renew(&self, record_id: i32, due_date: Option<DateTime<Utc>>) -> AppResult<BorrowRecord> {
        let now = Utc::now();
        let due_date = match due_date {
            Some(due_date) => due_date,
            None => {
                let record = self.ledger.get_record(record_id).await?;
                self.default_due_date(record.due_date.max(now))?
            }
        };
        self.ledger.renew(record_id, due_date, now).await
    }

    /// Outstanding records with their observed status
    pub async fn list_outstanding(&self, filter: OutstandingFilter) -> AppResult<Vec<BorrowRecord>> {
        let now = Utc::now();
        let records: Vec<BorrowRecord> = self.ledger.list_outstanding(filter).await?.collect::<AppResult<_>>().await?;
        Ok(records
            .into_iter()
            .map(|mut record| {
                record.status = compute_status(&record, now);
                record
            })
            .collect())
    }

    pub async fn get_record(&self, record_id: i32) -> AppResult<BorrowRecord> {
        let mut record = self.ledger.get_record(record_id).await?;
        record.status = compute_status(&record, Utc::now());
        Ok(record)
    }

    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.ledger.sweep_overdue(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Book, CreateBook, Genre, NewUser, Role};
    use crate::repository::{BorrowStream, LedgerStore, MockMembershipStore, Repository};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Ledger store that delegates reads but refuses to insert
    struct RefusingLedger {
        inner: Arc<dyn LedgerStore>,
    }

    #[async_trait]
    impl LedgerStore for RefusingLedger {
        async fn get_record(&self, id: i32) -> AppResult<BorrowRecord> {
            self.inner.get_record(id).await
        }

        async fn insert_record(&self, _: &NewBorrow, _: DateTime<Utc>) -> AppResult<BorrowRecord> {
            Err(AppError::Internal("disk full".to_string()))
        }

        async fn mark_returned(&self, id: i32, at: DateTime<Utc>) -> AppResult<BorrowRecord> {
            self.inner.mark_returned(id, at).await
        }

        async fn renew(&self, id: i32, due: DateTime<Utc>, max: i32) -> AppResult<BorrowRecord> {
            self.inner.renew(id, due, max).await
        }

        async fn list_outstanding<'a>(&'a self, filter: OutstandingFilter) -> AppResult<BorrowStream<'a>> {
            self.inner.list_outstanding(filter).await
        }

        async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
            self.inner.sweep_overdue(now).await
        }
    }

    /// Ledger store that signals and then stalls before inserting
    struct SlowLedger {
        inner: Arc<dyn LedgerStore>,
        inserting: Arc<Notify>,
    }

    #[async_trait]
    impl LedgerStore for SlowLedger {
        async fn get_record(&self, id: i32) -> AppResult<BorrowRecord> {
            self.inner.get_record(id).await
        }

        async fn insert_record(&self, record: &NewBorrow, at: DateTime<Utc>) -> AppResult<BorrowRecord> {
            self.inserting.notify_one();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.inner.insert_record(record, at).await
        }

        async fn mark_returned(&self, id: i32, at: DateTime<Utc>) -> AppResult<BorrowRecord> {
            self.inner.mark_returned(id, at).await
        }

        async fn renew(&self, id: i32, due: DateTime<Utc>, max: i32) -> AppResult<BorrowRecord> {
            self.inner.renew(id, due, max).await
        }

        async fn list_outstanding<'a>(&'a self, filter: OutstandingFilter) -> AppResult<BorrowStream<'a>> {
            self.inner.list_outstanding(filter).await
        }

        async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
            self.inner.sweep_overdue(now).await
        }
    }

    /// Catalog whose reservations fail as if the database were down
    struct UnreachableCatalog {
        inner: Arc<dyn CatalogStore>,
    }

    #[async_trait]
    impl CatalogStore for UnreachableCatalog {
        async fn get_book(&self, id: i32) -> AppResult<Book> {
            self.inner.get_book(id).await
        }

        async fn list_books(&self) -> AppResult<Vec<Book>> {
            self.inner.list_books().await
        }

        async fn create_book(&self, book: &CreateBook) -> AppResult<Book> {
            self.inner.create_book(book).await
        }

        async fn delete_book(&self, id: i32) -> AppResult<()> {
            self.inner.delete_book(id).await
        }

        async fn reserve_copies(&self, _: i32, _: i32) -> AppResult<Book> {
            Err(AppError::Internal("connection reset".to_string()))
        }

        async fn release_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book> {
            self.inner.release_copies(book_id, quantity).await
        }
    }

    async fn seed(repository: &Repository, copies: i32) -> (i32, Book) {
        let user = repository
            .users
            .create_user(&NewUser {
                name: "Linus".to_string(),
                email: "linus@example.org".to_string(),
                password_hash: "hash".to_string(),
                role: Role::User,
            })
            .await
            .unwrap();
        let book = repository
            .books
            .create_book(&CreateBook {
                title: "The Hobbit".to_string(),
                author: "J.R.R. Tolkien".to_string(),
                genre: Genre::Fantasy,
                description: None,
                total_copies: copies,
            })
            .await
            .unwrap();
        (user.id, book)
    }

    #[test]
    fn test_phase_transitions() {
        use TxPhase::*;
        assert!(Requested.can_advance_to(Validating));
        assert!(Validating.can_advance_to(Rejected));
        assert!(Applying.can_advance_to(RolledBack));
        assert!(!Requested.can_advance_to(Applying));
        assert!(!Validating.can_advance_to(Committed));
        assert!(!Committed.can_advance_to(RolledBack));
        assert!(Committed.is_terminal() && Failed.is_terminal());
        assert!(!Applying.is_terminal());
    }

    #[tokio::test]
    async fn test_failed_record_creation_releases_reservation() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 2).await;
        let config = LoansConfig::default();
        let ledger = BorrowLedger::new(
            Arc::new(RefusingLedger { inner: repository.borrows.clone() }),
            &config,
        );
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        let err = loans
            .checkout(user_id, book.id, 2, Utc::now() + Duration::days(7))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(repository.books.get_book(book.id).await.unwrap().available_copies, 2);
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected_before_reserving() {
        let repository = Repository::in_memory();
        let (_, book) = seed(&repository, 1).await;

        let mut users = MockMembershipStore::new();
        users
            .expect_get_user()
            .withf(|id| *id == 77)
            .times(1)
            .returning(|id| Err(AppError::NotFound(format!("User with id {} not found", id))));

        let config = LoansConfig::default();
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(repository.books.clone(), Arc::new(users), ledger, config);

        let err = loans
            .checkout(77, book.id, 1, Utc::now() + Duration::days(7))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(repository.books.get_book(book.id).await.unwrap().available_copies, 1);
    }

    #[tokio::test]
    async fn test_overdue_borrower_blocked_when_configured() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 3).await;
        let config = LoansConfig {
            block_overdue_borrowers: true,
            ..LoansConfig::default()
        };
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        // Back-date a record so it is already overdue
        let now = Utc::now();
        repository
            .borrows
            .insert_record(
                &NewBorrow { user_id, book_id: book.id, quantity: 1, due_date: now - Duration::days(1) },
                now - Duration::days(22),
            )
            .await
            .unwrap();
        repository.books.reserve_copies(book.id, 1).await.unwrap();

        let err = loans
            .checkout(user_id, book.id, 1, now + Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BusinessRule(_)));
        assert_eq!(repository.books.get_book(book.id).await.unwrap().available_copies, 2);
    }

    #[tokio::test]
    async fn test_return_after_release_drift_is_invariant_violation() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 1).await;
        let config = LoansConfig::default();
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        // A record the catalog never reserved for
        let now = Utc::now();
        let record = repository
            .borrows
            .insert_record(&NewBorrow { user_id, book_id: book.id, quantity: 1, due_date: now + Duration::days(1) }, now)
            .await
            .unwrap();

        let err = loans.return_record(record.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert_eq!(repository.books.get_book(book.id).await.unwrap().available_copies, 1);
    }

    #[tokio::test]
    async fn test_default_renewal_extends_from_current_due_date() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 1).await;
        let config = LoansConfig::default();
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        let due = Utc::now() + Duration::days(5);
        let record = loans.checkout(user_id, book.id, 1, due).await.unwrap();
        let renewed = loans.renew(record.id, None).await.unwrap();

        assert_eq!(renewed.due_date, due + Duration::days(21));
        assert_eq!(renewed.renewals, 1);
    }

    #[tokio::test]
    async fn test_renew_near_max_date_is_rejected_not_panicking() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 1).await;
        let config = LoansConfig::default();
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        assert!(matches!(
            loans.default_due_date(DateTime::<Utc>::MAX_UTC),
            Err(AppError::Validation(_))
        ));

        let record = loans.checkout(user_id, book.id, 1, DateTime::<Utc>::MAX_UTC).await.unwrap();
        let err = loans.renew(record.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        let unchanged = repository.borrows.get_record(record.id).await.unwrap();
        assert_eq!(unchanged.renewals, 0);
        assert_eq!(unchanged.due_date, DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_checkout_completes_after_caller_is_cancelled() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 3).await;
        let config = LoansConfig::default();
        let inserting = Arc::new(Notify::new());
        let ledger = BorrowLedger::new(
            Arc::new(SlowLedger {
                inner: repository.borrows.clone(),
                inserting: inserting.clone(),
            }),
            &config,
        );
        let loans = LoansService::new(repository.books.clone(), repository.users.clone(), ledger, config);

        let caller = tokio::spawn(async move {
            loans
                .checkout(user_id, book.id, 2, Utc::now() + Duration::days(7))
                .await
        });
        inserting.notified().await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        let mut outstanding = Vec::new();
        for _ in 0..100 {
            outstanding = repository
                .borrows
                .list_outstanding(OutstandingFilter::Book(book.id))
                .await
                .unwrap()
                .collect::<AppResult<Vec<_>>>()
                .await
                .unwrap();
            if !outstanding.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(outstanding.len(), 1);
        let held: i32 = outstanding.iter().map(|r| r.quantity).sum();
        let book = repository.books.get_book(book.id).await.unwrap();
        assert_eq!(held, 2);
        assert_eq!(book.available_copies, book.total_copies - held);
    }

    #[tokio::test]
    async fn test_reserve_failure_leaves_no_trace() {
        let repository = Repository::in_memory();
        let (user_id, book) = seed(&repository, 2).await;
        let config = LoansConfig::default();
        let catalog = Arc::new(UnreachableCatalog { inner: repository.books.clone() });
        let ledger = BorrowLedger::new(repository.borrows.clone(), &config);
        let loans = LoansService::new(catalog, repository.users.clone(), ledger, config);

        let err = loans
            .checkout(user_id, book.id, 1, Utc::now() + Duration::days(7))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(repository.books.get_book(book.id).await.unwrap().available_copies, 2);
        let mut outstanding = repository
            .borrows
            .list_outstanding(OutstandingFilter::User(user_id))
            .await
            .unwrap();
        assert!(outstanding.next().await.is_none());
    }

    #[test]
    fn test_transaction_reaches_terminal_phase() {
        let mut tx = Transaction::begin("checkout", Some(1));
        tx.advance(TxPhase::Validating);
        tx.advance(TxPhase::Applying);
        assert!(!tx.phase.is_terminal());

        let result: AppResult<()> = tx.finish(TxPhase::Rejected, Err(AppError::Internal("down".to_string())));
        assert!(result.is_err());
    }
}
