//! Borrowing endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    error::{AppError, AppResult},
    models::BorrowRecord,
    AppState,
};

/// Checkout request
#[derive(Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub user_id: i32,
    pub book_id: i32,
    /// Number of copies (defaults to 1)
    pub quantity: Option<i32>,
    /// Due date (defaults to the configured loan period from now)
    pub due_date: Option<DateTime<Utc>>,
}

/// Renewal request
#[derive(Deserialize, Default, ToSchema)]
pub struct RenewRequest {
    /// New due date (defaults to one loan period past the current due date)
    pub due_date: Option<DateTime<Utc>>,
}

/// Return response with the closed record
#[derive(Serialize, ToSchema)]
pub struct ReturnResponse {
    /// Return status
    pub status: String,
    pub borrow: BorrowRecord,
}

#[derive(Serialize, ToSchema)]
pub struct SweepResponse {
    /// Records moved to OVERDUE by this sweep
    pub marked_overdue: u64,
}

/// Borrow copies of a book
#[utoipa::path(
    post,
    path = "/borrows",
    tag = "borrows",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Borrow record created", body = BorrowRecord),
        (status = 400, description = "Invalid quantity or due date"),
        (status = 404, description = "User or book not found"),
        (status = 409, description = "Not enough copies available"),
        (status = 422, description = "Borrower has overdue records")
    )
)]
pub async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<BorrowRecord>)> {
    let loans = &state.services.loans;
    let due_date = match request.due_date {
        Some(due_date) => due_date,
        None => loans.default_due_date(Utc::now())?,
    };

    let record = loans
        .checkout(request.user_id, request.book_id, request.quantity.unwrap_or(1), due_date)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Get a borrow record with its observed status
#[utoipa::path(
    get,
    path = "/borrows/{id}",
    tag = "borrows",
    params(
        ("id" = i32, Path, description = "Borrow record ID")
    ),
    responses(
        (status = 200, description = "Borrow record", body = BorrowRecord),
        (status = 404, description = "Borrow record not found")
    )
)]
pub async fn get_borrow(State(state): State<AppState>, Path(id): Path<i32>) -> AppResult<Json<BorrowRecord>> {
    let record = state.services.loans.get_record(id).await?;
    Ok(Json(record))
}

/// Return borrowed copies
#[utoipa::path(
    post,
    path = "/borrows/{id}/return",
    tag = "borrows",
    params(
        ("id" = i32, Path, description = "Borrow record ID")
    ),
    responses(
        (status = 200, description = "Copies returned", body = ReturnResponse),
        (status = 404, description = "Borrow record not found"),
        (status = 409, description = "Already returned"),
        (status = 500, description = "Catalog and ledger disagree")
    )
)]
pub async fn return_borrow(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> AppResult<Json<ReturnResponse>> {
    let record = state.services.loans.return_record(id).await?;

    Ok(Json(ReturnResponse {
        status: "returned".to_string(),
        borrow: record,
    }))
}

/// Renew a borrow record
#[utoipa::path(
    post,
    path = "/borrows/{id}/renew",
    tag = "borrows",
    params(
        ("id" = i32, Path, description = "Borrow record ID")
    ),
    request_body = RenewRequest,
    responses(
        (status = 200, description = "Borrow record renewed", body = BorrowRecord),
        (status = 400, description = "Malformed body or due date not later than the current one"),
        (status = 404, description = "Borrow record not found"),
        (status = 409, description = "Already returned"),
        (status = 422, description = "Maximum renewals reached")
    )
)]
pub async fn renew_borrow(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    request: Result<Json<RenewRequest>, JsonRejection>,
) -> AppResult<Json<BorrowRecord>> {
    // A bare POST renews by one loan period; a body that is present must parse
    let request = match request {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => RenewRequest::default(),
        Err(rejection) => return Err(AppError::Validation(rejection.body_text())),
    };
    let record = state.services.loans.renew(id, request.due_date).await?;
    Ok(Json(record))
}

/// Mark every record past its due date as overdue
#[utoipa::path(
    post,
    path = "/borrows/sweep",
    tag = "borrows",
    responses(
        (status = 200, description = "Sweep completed", body = SweepResponse)
    )
)]
pub async fn sweep_overdue(State(state): State<AppState>) -> AppResult<Json<SweepResponse>> {
    let marked_overdue = state.services.loans.sweep_overdue(Utc::now()).await?;
    Ok(Json(SweepResponse { marked_overdue }))
}
