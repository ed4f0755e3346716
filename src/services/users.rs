//! User management service

use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHasher,
};
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::user::{CreateUser, NewUser, User},
    repository::MembershipStore,
};

#[derive(Clone)]
pub struct UsersService {
    users: Arc<dyn MembershipStore>,
}

impl UsersService {
    pub fn new(users: Arc<dyn MembershipStore>) -> Self {
        Self { users }
    }

    /// Hash a password using Argon2
    pub fn hash_password(&self, password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }

    /// Get user by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<User> {
        self.users.get_user(id).await
    }

    pub async fn list_users(&self) -> AppResult<Vec<User>> {
        self.users.list_users().await
    }

    /// Create a new user
    pub async fn create_user(&self, user: CreateUser) -> AppResult<User> {
        user.validate()?;

        let email = user.email.trim().to_lowercase();
        if self.users.email_exists(&email).await? {
            return Err(AppError::Conflict(format!("Email {} is already registered", email)));
        }

        let new_user = NewUser {
            name: user.name.trim().to_string(),
            email,
            password_hash: self.hash_password(&user.password)?,
            role: user.role.unwrap_or_default(),
        };
        let created = self.users.create_user(&new_user).await?;
        tracing::info!(user_id = created.id, role = %created.role, "User created");
        Ok(created)
    }

    /// Delete a user and, through the cascade, their borrow records
    pub async fn delete_user(&self, id: i32) -> AppResult<()> {
        self.users.delete_user(id).await?;
        tracing::info!(user_id = id, "User deleted");
        Ok(())
    }
}
