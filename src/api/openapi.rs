//! OpenAPI documentation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{books, borrows, health, users};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Biblio API",
        version = "1.0.0",
        description = "Library borrowing REST API",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Books
        books::list_books,
        books::create_book,
        books::get_book,
        books::delete_book,
        books::list_book_borrows,
        // Users
        users::list_users,
        users::create_user,
        users::get_user,
        users::delete_user,
        users::list_user_borrows,
        // Borrows
        borrows::checkout,
        borrows::get_borrow,
        borrows::return_borrow,
        borrows::renew_borrow,
        borrows::sweep_overdue,
    ),
    components(
        schemas(
            // Books
            crate::models::book::Book,
            crate::models::book::CreateBook,
            crate::models::enums::Genre,
            // Users
            crate::models::user::User,
            crate::models::user::CreateUser,
            crate::models::enums::Role,
            // Borrows
            crate::models::borrow::BorrowRecord,
            crate::models::enums::BorrowStatus,
            borrows::CheckoutRequest,
            borrows::RenewRequest,
            borrows::ReturnResponse,
            borrows::SweepResponse,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "books", description = "Catalog management"),
        (name = "users", description = "Membership management"),
        (name = "borrows", description = "Checkout, return and renewal")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
