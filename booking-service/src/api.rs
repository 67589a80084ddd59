use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{Booking, Error, RetryPolicy, Task, TaskPayload};

use crate::gateway::verify_webhook;
use crate::lifecycle::BookingLifecycle;
use crate::queue::TaskQueue;
use crate::store::BookingStore;

pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<BookingLifecycle>,
    pub store: Arc<dyn BookingStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub webhook_secret: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: Uuid,
    pub showtime_id: Uuid,
    pub section_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub booking_id: Uuid,
    pub status: String,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub gateway_order_id: Option<String>,
    pub ticket_ids: Vec<Uuid>,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        Self {
            booking_id: booking.id,
            status: booking.status.as_str().to_string(),
            total_amount: booking.total_amount,
            currency: booking.currency,
            expires_at: booking.expires_at,
            gateway_order_id: booking.gateway_order_id,
            ticket_ids: booking.ticket_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BookingOwnerQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CancelBookingRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RefundBookingRequest {
    pub reason: String,
    pub initiated_by: Uuid,
    pub amount: Option<BigDecimal>,
}

/// 202 body for operations that run through the queue.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub task_id: Uuid,
    pub status: String,
}

/// Capture notification as the payment gateway posts it. The body-level
/// HMAC proves origin; the embedded `signature` is the per-payment
/// proof the worker re-checks against the order.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub booking_id: Uuid,
    pub payment_id: String,
    #[serde(default = "default_payment_method")]
    pub method: String,
    pub signature: String,
}

fn default_payment_method() -> String {
    "unknown".to_string()
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError(Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::InsufficientInventory { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::Conflict(_) | Error::LockUnavailable(_) => StatusCode::CONFLICT,
            Error::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            Error::ExternalService(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // keep the detail in the log, not the wire
            error!("request failed: {}", self.0);
            return (
                status,
                Json(ErrorResponse {
                    error: "internal error".to_string(),
                }),
            )
                .into_response();
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/refund", post(refund_booking))
        .route("/payments/webhook", post(payment_webhook))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// The one synchronous lifecycle operation: the buyer needs the hold,
/// the price, and the gateway order before they can pay.
pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), ApiError> {
    let booking = state
        .lifecycle
        .create_booking(
            request.user_id,
            request.showtime_id,
            request.section_id,
            request.quantity,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Query(query): Query<BookingOwnerQuery>,
) -> Result<Json<BookingResponse>, ApiError> {
    let booking = state.lifecycle.get_booking(booking_id, query.user_id).await?;
    Ok(Json(booking.into()))
}

/// Validates existence and ownership synchronously, then hands the
/// state change to the queue.
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<CancelBookingRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let booking = state
        .store
        .booking(booking_id)
        .await?
        .ok_or(Error::NotFound("booking"))?;
    if booking.user_id != request.user_id {
        return Err(Error::Forbidden.into());
    }

    let task = Task::new(
        TaskPayload::CancelBooking {
            booking_id,
            user_id: request.user_id,
        },
        state.retry.max_attempts,
    );
    let task_id = task.id;
    state.queue.enqueue(task).await?;
    info!(%booking_id, %task_id, "cancel accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            task_id,
            status: "accepted".to_string(),
        }),
    ))
}

pub async fn refund_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<RefundBookingRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    if request.reason.trim().is_empty() {
        return Err(Error::validation("refund reason is required").into());
    }
    let booking = state
        .store
        .booking(booking_id)
        .await?
        .ok_or(Error::NotFound("booking"))?;
    let amount = request.amount.unwrap_or_else(|| booking.total_amount.clone());

    let task = Task::new(
        TaskPayload::RefundBooking {
            booking_id,
            reason: request.reason,
            initiated_by: request.initiated_by,
            amount,
        },
        state.retry.max_attempts,
    );
    let task_id = task.id;
    state.queue.enqueue(task).await?;
    info!(%booking_id, %task_id, "refund accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            task_id,
            status: "accepted".to_string(),
        }),
    ))
}

/// Gateway callback. A bad body signature is the only error the gateway
/// ever sees; once the body is proven authentic the response is 200 no
/// matter what happens internally, and failures are logged for
/// reconciliation. Repeated deliveries are absorbed by the idempotent
/// capture handler downstream.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_webhook(&state.webhook_secret, &body, signature) {
        warn!("webhook rejected: body signature mismatch");
        return StatusCode::BAD_REQUEST;
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            error!("authentic webhook with undecodable body: {}", e);
            return StatusCode::OK;
        }
    };
    if event.event != "payment.captured" {
        info!(event = %event.event, "ignoring webhook event type");
        return StatusCode::OK;
    }

    let task = Task::new(
        TaskPayload::VerifyPayment {
            booking_id: event.booking_id,
            method: event.method,
            external_payment_id: event.payment_id,
            signature: event.signature,
        },
        state.retry.max_attempts,
    );
    if let Err(e) = state.queue.enqueue(task).await {
        error!(booking_id = %event.booking_id, "failed to enqueue payment verification: {}", e);
    }
    StatusCode::OK
}

pub async fn health_check() -> &'static str {
    "OK"
}
