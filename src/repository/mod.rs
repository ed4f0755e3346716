//! Repository layer: the store contracts and their backends
//!
//! Each store is a trait so the services run unchanged against Postgres or
//! the in-memory backend. Every mutation of a book's `available_copies`
//! happens inside a single store call, which is what keeps concurrent
//! checkouts from overselling.

pub mod books;
pub mod borrows;
pub mod memory;
pub mod users;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tokio_stream::Stream;

use crate::{
    error::AppResult,
    models::{BorrowRecord, Book, CreateBook, NewBorrow, NewUser, OutstandingFilter, User},
};

/// Lazy sequence of borrow records
pub type BorrowStream<'a> = Pin<Box<dyn Stream<Item = AppResult<BorrowRecord>> + Send + 'a>>;

/// Owner of book records and their copy counters
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_book(&self, id: i32) -> AppResult<Book>;

    async fn list_books(&self) -> AppResult<Vec<Book>>;

    /// Insert a book with every copy available
    async fn create_book(&self, book: &CreateBook) -> AppResult<Book>;

    /// Delete a book; its borrow records go with it
    async fn delete_book(&self, id: i32) -> AppResult<()>;

    /// Atomically take `quantity` copies, failing with `InsufficientInventory`
    /// when fewer are available.
    async fn reserve_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book>;

    /// Atomically give back `quantity` copies, failing with
    /// `InvariantViolation` if that would exceed `total_copies`.
    async fn release_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book>;
}

/// Owner of user records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_user(&self, id: i32) -> AppResult<User>;

    async fn list_users(&self) -> AppResult<Vec<User>>;

    async fn email_exists(&self, email: &str) -> AppResult<bool>;

    /// Fails with `Conflict` when the email is taken
    async fn create_user(&self, user: &NewUser) -> AppResult<User>;

    /// Delete a user; their borrow records go with them
    async fn delete_user(&self, id: i32) -> AppResult<()>;
}

/// Persistence for borrow records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_record(&self, id: i32) -> AppResult<BorrowRecord>;

    /// Insert an `Active` record. Fails with `NotFound` if the user or book is gone.
    async fn insert_record(&self, record: &NewBorrow, created_at: DateTime<Utc>) -> AppResult<BorrowRecord>;

    /// Conditional `Active`/`Overdue` -> `Returned`. Losing a race to another
    /// return yields `InvalidState`.
    async fn mark_returned(&self, id: i32, returned_at: DateTime<Utc>) -> AppResult<BorrowRecord>;

    /// Move the due date and bump the renewal count, provided the record is
    /// outstanding and has fewer than `max_renewals` renewals.
    async fn renew(&self, id: i32, due_date: DateTime<Utc>, max_renewals: i32) -> AppResult<BorrowRecord>;

    /// Outstanding records in the scope, earliest due first. Each call
    /// starts a fresh stream.
    async fn list_outstanding<'a>(&'a self, filter: OutstandingFilter) -> AppResult<BorrowStream<'a>>;

    /// Persist `Active` -> `Overdue` for everything due before `now`.
    /// Returns the number of records changed.
    async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64>;
}

/// Main repository struct bundling the three stores
#[derive(Clone)]
pub struct Repository {
    pub pool: Option<Pool<Postgres>>,
    pub books: Arc<dyn CatalogStore>,
    pub users: Arc<dyn MembershipStore>,
    pub borrows: Arc<dyn LedgerStore>,
}

impl Repository {
    /// Create a Postgres-backed repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: Arc::new(books::BooksRepository::new(pool.clone())),
            users: Arc::new(users::UsersRepository::new(pool.clone())),
            borrows: Arc::new(borrows::BorrowsRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Create a repository whose stores share one in-process state
    pub fn in_memory() -> Self {
        let store = Arc::new(memory::MemoryStore::default());
        Self {
            pool: None,
            books: store.clone(),
            users: store.clone(),
            borrows: store,
        }
    }

    /// Round-trip to the database, if there is one
    pub async fn ping(&self) -> AppResult<()> {
        if let Some(pool) = &self.pool {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }
}
