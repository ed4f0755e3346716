//! Data models for Biblio

pub mod book;
pub mod borrow;
pub mod enums;
pub mod user;

// Re-export commonly used types
pub use book::{Book, CreateBook};
pub use borrow::{BorrowRecord, NewBorrow, OutstandingFilter};
pub use enums::{BorrowStatus, Genre, Role};
pub use user::{CreateUser, NewUser, User};
