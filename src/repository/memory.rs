//! In-process backend for all three stores
//!
//! One write lock guards the whole state, so every store call is a single
//! critical section: reserve/release are linearizable per book and the
//! cascade on delete is atomic with the delete itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{BorrowStream, CatalogStore, LedgerStore, MembershipStore};
use crate::{
    error::{AppError, AppResult},
    models::{BorrowRecord, BorrowStatus, Book, CreateBook, NewBorrow, NewUser, OutstandingFilter, User},
};

#[derive(Default)]
struct MemoryState {
    books: BTreeMap<i32, Book>,
    users: BTreeMap<i32, User>,
    borrows: BTreeMap<i32, BorrowRecord>,
    last_book_id: i32,
    last_user_id: i32,
    last_borrow_id: i32,
}

impl MemoryState {
    fn book(&self, id: i32) -> AppResult<&Book> {
        self.books
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    fn book_mut(&mut self, id: i32) -> AppResult<&mut Book> {
        self.books
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    fn record_mut(&mut self, id: i32) -> AppResult<&mut BorrowRecord> {
        self.borrows
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Borrow record with id {} not found", id)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_book(&self, id: i32) -> AppResult<Book> {
        self.state.read().await.book(id).cloned()
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        Ok(self.state.read().await.books.values().cloned().collect())
    }

    async fn create_book(&self, book: &CreateBook) -> AppResult<Book> {
        let mut state = self.state.write().await;
        state.last_book_id += 1;
        let now = Utc::now();
        let created = Book {
            id: state.last_book_id,
            title: book.title.clone(),
            author: book.author.clone(),
            genre: book.genre,
            description: book.description.clone(),
            total_copies: book.total_copies,
            available_copies: book.total_copies,
            created_at: now,
            updated_at: now,
        };
        state.books.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_book(&self, id: i32) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.book(id)?;
        state.books.remove(&id);
        state.borrows.retain(|_, record| record.book_id != id);
        Ok(())
    }

    async fn reserve_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book> {
        let mut state = self.state.write().await;
        let book = state.book_mut(book_id)?;
        if book.available_copies < quantity {
            return Err(AppError::InsufficientInventory(format!(
                "Book {} has {} copies available, {} requested",
                book_id, book.available_copies, quantity
            )));
        }
        book.available_copies -= quantity;
        book.updated_at = Utc::now();
        Ok(book.clone())
    }

    async fn release_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book> {
        let mut state = self.state.write().await;
        let book = state.book_mut(book_id)?;
        if book.available_copies + quantity > book.total_copies {
            return Err(AppError::InvariantViolation(format!(
                "Releasing {} copies of book {} would exceed its total ({} of {} available)",
                quantity, book_id, book.available_copies, book.total_copies
            )));
        }
        book.available_copies += quantity;
        book.updated_at = Utc::now();
        Ok(book.clone())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get_user(&self, id: i32) -> AppResult<User> {
        self.state
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", id)))
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn email_exists(&self, email: &str) -> AppResult<bool> {
        let state = self.state.read().await;
        Ok(state.users.values().any(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn create_user(&self, user: &NewUser) -> AppResult<User> {
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AppError::Conflict(format!("Email {} is already registered", user.email)));
        }
        state.last_user_id += 1;
        let now = Utc::now();
        let created = User {
            id: state.last_user_id,
            name: user.name.clone(),
            email: user.email.clone(),
            password: user.password_hash.clone(),
            role: user.role,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_user(&self, id: i32) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.users.remove(&id).is_none() {
            return Err(AppError::NotFound(format!("User with id {} not found", id)));
        }
        state.borrows.retain(|_, record| record.user_id != id);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_record(&self, id: i32) -> AppResult<BorrowRecord> {
        self.state
            .read()
            .await
            .borrows
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Borrow record with id {} not found", id)))
    }

    async fn insert_record(&self, record: &NewBorrow, created_at: DateTime<Utc>) -> AppResult<BorrowRecord> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&record.user_id) || !state.books.contains_key(&record.book_id) {
            return Err(AppError::NotFound(format!(
                "User {} or book {} no longer exists",
                record.user_id, record.book_id
            )));
        }
        state.last_borrow_id += 1;
        let created = BorrowRecord {
            id: state.last_borrow_id,
            user_id: record.user_id,
            book_id: record.book_id,
            quantity: record.quantity,
            due_date: record.due_date,
            status: BorrowStatus::Active,
            renewals: 0,
            created_at,
            returned_at: None,
        };
        state.borrows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn mark_returned(&self, id: i32, returned_at: DateTime<Utc>) -> AppResult<BorrowRecord> {
        let mut state = self.state.write().await;
        let record = state.record_mut(id)?;
        if record.status == BorrowStatus::Returned {
            return Err(AppError::InvalidState(format!("Borrow record {} is already returned", id)));
        }
        record.status = BorrowStatus::Returned;
        record.returned_at = Some(returned_at);
        Ok(record.clone())
    }

    async fn renew(&self, id: i32, due_date: DateTime<Utc>, max_renewals: i32) -> AppResult<BorrowRecord> {
        let mut state = self.state.write().await;
        let record = state.record_mut(id)?;
        if record.status == BorrowStatus::Returned {
            return Err(AppError::InvalidState(format!("Cannot renew returned borrow record {}", id)));
        }
        if record.renewals >= max_renewals {
            return Err(AppError::BusinessRule(format!(
                "Maximum renewals reached ({}/{})",
                record.renewals, max_renewals
            )));
        }
        record.due_date = due_date;
        record.renewals += 1;
        record.status = BorrowStatus::Active;
        Ok(record.clone())
    }

    async fn list_outstanding<'a>(&'a self, filter: OutstandingFilter) -> AppResult<BorrowStream<'a>> {
        let mut records: Vec<BorrowRecord> = self
            .state
            .read()
            .await
            .borrows
            .values()
            .filter(|r| r.status.is_outstanding() && filter.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.due_date, r.id));

        Ok(Box::pin(tokio_stream::iter(records.into_iter().map(Ok::<_, AppError>))))
    }

    async fn sweep_overdue(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for record in state.borrows.values_mut() {
            if record.status == BorrowStatus::Active && record.due_date < now {
                record.status = BorrowStatus::Overdue;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Genre, Role};
    use chrono::Duration;
    use tokio_stream::StreamExt;

    fn create_book(total: i32) -> CreateBook {
        CreateBook {
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            genre: Genre::Fiction,
            description: None,
            total_copies: total,
        }
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Ada".to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_stay_within_bounds() {
        let store = MemoryStore::default();
        let book = store.create_book(&create_book(2)).await.unwrap();
        assert_eq!(book.available_copies, 2);

        let book = store.reserve_copies(book.id, 2).await.unwrap();
        assert_eq!(book.available_copies, 0);

        let err = store.reserve_copies(book.id, 1).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientInventory(_)));

        store.release_copies(book.id, 2).await.unwrap();
        let err = store.release_copies(book.id, 1).await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert_eq!(store.get_book(book.id).await.unwrap().available_copies, 2);
    }

    #[tokio::test]
    async fn test_reserve_unknown_book() {
        let store = MemoryStore::default();
        let err = store.reserve_copies(42, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_email_is_case_insensitive() {
        let store = MemoryStore::default();
        store.create_user(&new_user("ada@example.org")).await.unwrap();
        assert!(store.email_exists("ADA@example.org").await.unwrap());
        let err = store.create_user(&new_user("Ada@Example.org")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_deleting_book_cascades_to_records() {
        let store = MemoryStore::default();
        let user = store.create_user(&new_user("ada@example.org")).await.unwrap();
        let book = store.create_book(&create_book(1)).await.unwrap();
        let record = store
            .insert_record(
                &NewBorrow {
                    user_id: user.id,
                    book_id: book.id,
                    quantity: 1,
                    due_date: Utc::now() + Duration::days(7),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        store.delete_book(book.id).await.unwrap();

        assert!(matches!(store.get_record(record.id).await, Err(AppError::NotFound(_))));
        let mut outstanding = store.list_outstanding(OutstandingFilter::User(user.id)).await.unwrap();
        assert!(outstanding.next().await.is_none());
    }

    #[tokio::test]
    async fn test_insert_requires_existing_references() {
        let store = MemoryStore::default();
        let book = store.create_book(&create_book(1)).await.unwrap();
        let err = store
            .insert_record(
                &NewBorrow {
                    user_id: 99,
                    book_id: book.id,
                    quantity: 1,
                    due_date: Utc::now() + Duration::days(1),
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
