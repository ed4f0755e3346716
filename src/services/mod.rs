//! Business logic services

pub mod catalog;
pub mod ledger;
pub mod loans;
pub mod scheduler;
pub mod users;

use crate::{config::LoansConfig, repository::Repository};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub repository: Repository,
    pub catalog: catalog::CatalogService,
    pub users: users::UsersService,
    pub ledger: ledger::BorrowLedger,
    pub loans: loans::LoansService,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(repository: Repository, loans_config: LoansConfig) -> Self {
        let ledger = ledger::BorrowLedger::new(repository.borrows.clone(), &loans_config);
        Self {
            catalog: catalog::CatalogService::new(repository.books.clone()),
            users: users::UsersService::new(repository.users.clone()),
            loans: loans::LoansService::new(
                repository.books.clone(),
                repository.users.clone(),
                ledger.clone(),
                loans_config,
            ),
            ledger,
            repository,
        }
    }
}
