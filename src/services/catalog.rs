//! Catalog management service

use std::sync::Arc;

use validator::Validate;

use crate::{
    error::AppResult,
    models::book::{Book, CreateBook},
    repository::CatalogStore,
};

#[derive(Clone)]
pub struct CatalogService {
    books: Arc<dyn CatalogStore>,
}

impl CatalogService {
    pub fn new(books: Arc<dyn CatalogStore>) -> Self {
        Self { books }
    }

    pub async fn list_books(&self) -> AppResult<Vec<Book>> {
        self.books.list_books().await
    }

    /// Get book by ID
    pub async fn get_book(&self, id: i32) -> AppResult<Book> {
        self.books.get_book(id).await
    }

    /// Create a new book with all copies available
    pub async fn create_book(&self, book: CreateBook) -> AppResult<Book> {
        book.validate()?;
        let book = CreateBook {
            title: book.title.trim().to_string(),
            author: book.author.trim().to_string(),
            ..book
        };
        let created = self.books.create_book(&book).await?;
        tracing::info!(book_id = created.id, copies = created.total_copies, "Book created");
        Ok(created)
    }

    /// Delete a book and, through the cascade, its borrow records
    pub async fn delete_book(&self, id: i32) -> AppResult<()> {
        self.books.delete_book(id).await?;
        tracing::info!(book_id = id, "Book deleted");
        Ok(())
    }
}
