//! Books repository for database operations

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use super::CatalogStore;
use crate::{
    error::{AppError, AppResult},
    models::book::{Book, CreateBook},
};

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for BooksRepository {
    /// Get book by ID
    async fn get_book(&self, id: i32) -> AppResult<Book> {
        sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>("SELECT * FROM books ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(books)
    }

    async fn create_book(&self, book: &CreateBook) -> AppResult<Book> {
        let created = sqlx::query_as::<_, Book>(
            r#"
            INSERT INTO books (title, author, genre, description, total_copies, available_copies)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(&book.title)
        .bind(&book.author)
        .bind(book.genre)
        .bind(&book.description)
        .bind(book.total_copies)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn delete_book(&self, id: i32) -> AppResult<()> {
        // borrows rows are removed by ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        }
        Ok(())
    }

    async fn reserve_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book> {
        let updated = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books
            SET available_copies = available_copies - $2, updated_at = NOW()
            WHERE id = $1 AND available_copies >= $2
            RETURNING *
            "#,
        )
        .bind(book_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(book) => Ok(book),
            None => {
                // Either the row is missing or the guard rejected the update
                let book = self.get_book(book_id).await?;
                Err(AppError::InsufficientInventory(format!(
                    "Book {} has {} copies available, {} requested",
                    book_id, book.available_copies, quantity
                )))
            }
        }
    }

    async fn release_copies(&self, book_id: i32, quantity: i32) -> AppResult<Book> {
        let updated = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books
            SET available_copies = available_copies + $2, updated_at = NOW()
            WHERE id = $1 AND available_copies + $2 <= total_copies
            RETURNING *
            "#,
        )
        .bind(book_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(book) => Ok(book),
            None => {
                let book = self.get_book(book_id).await?;
                Err(AppError::InvariantViolation(format!(
                    "Releasing {} copies of book {} would exceed its total ({} of {} available)",
                    quantity, book_id, book.available_copies, book.total_copies
                )))
            }
        }
    }
}
