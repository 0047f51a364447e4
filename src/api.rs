//! HTTP surface over [`AgreementService`].

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::agreement::{Agreement, Guard, NewAgreement, Party, Role};
use crate::error::AgreementError;
use crate::service::{AgreementDetail, AgreementService, RoleListing};

/// Header carrying the administrative token for deletes.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

type ApiResult<T> = Result<T, AgreementError>;
type AppState = Arc<AgreementService>;

pub fn build_router(service: Arc<AgreementService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agreements", post(create))
        .route("/agreements/role/:role/:address", get(list_by_role))
        .route("/agreements/:id", get(detail).delete(delete))
        .route("/agreements/:id/confirm", put(confirm))
        .route("/agreements/:id/raise-dispute", put(raise_dispute))
        .route("/agreements/:id/resolve-dispute", put(resolve_dispute))
        .route("/agreements/:id/release-funds", put(release_funds))
        .route("/agreements/:id/cancel-expired", put(cancel_expired))
        .route("/agreements/:id/extend-deadline", put(extend_deadline))
        .with_state(service)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    guard: Option<Guard>,
}

impl AgreementError {
    pub fn status(&self) -> StatusCode {
        match self {
            AgreementError::Validation(_) | AgreementError::InvalidWinner(_) => {
                StatusCode::BAD_REQUEST
            }
            AgreementError::Forbidden(_) => StatusCode::FORBIDDEN,
            AgreementError::NotFound(_) => StatusCode::NOT_FOUND,
            AgreementError::InvalidState { .. }
            | AgreementError::AlreadyConfirmed(_)
            | AgreementError::Duplicate(_)
            | AgreementError::Conflict(_) => StatusCode::CONFLICT,
            AgreementError::NotEligible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AgreementError::Oracle(_) => StatusCode::BAD_GATEWAY,
            AgreementError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AgreementError {
    fn into_response(self) -> Response {
        let message = match &self {
            AgreementError::Storage(err) => {
                error!(error = %err, "storage failure");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.code(),
            message,
            retryable: self.is_retryable(),
            guard: self.guard(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    version: &'static str,
    store: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRequest {
    caller: String,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    caller: String,
    role: String,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    caller: String,
    winner: String,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendRequest {
    caller: String,
    deadline: DateTime<Utc>,
    #[serde(default)]
    tx_hash: Option<String>,
}

/// Malformed bodies become `validation_error` responses.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AgreementError::Validation(rejection.body_text()))
}

fn agreement_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| AgreementError::Validation(format!("'{raw}' is not an agreement id")))
}

async fn health(State(service): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        store: service.backend(),
    })
}

async fn create(
    State(service): State<AppState>,
    payload: Result<Json<NewAgreement>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Agreement>)> {
    let created = service.create(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_by_role(
    State(service): State<AppState>,
    Path((role, address)): Path<(String, String)>,
) -> ApiResult<Json<RoleListing>> {
    let role = role.parse::<Role>().map_err(AgreementError::Validation)?;
    Ok(Json(service.list_by_role(role, &address).await?))
}

async fn detail(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgreementDetail>> {
    Ok(Json(service.detail(agreement_id(&id)?).await?))
}

async fn confirm(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let party = request
        .role
        .parse::<Party>()
        .map_err(AgreementError::Validation)?;
    let updated = service
        .request_confirmation(id, &request.caller, party, request.tx_hash.as_deref())
        .await?;
    Ok(Json(updated))
}

async fn raise_dispute(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let updated = service
        .raise_dispute(id, &request.caller, request.tx_hash.as_deref())
        .await?;
    Ok(Json(updated))
}

async fn resolve_dispute(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let updated = service
        .resolve_dispute(
            id,
            &request.caller,
            &request.winner,
            request.tx_hash.as_deref(),
        )
        .await?;
    Ok(Json(updated))
}

async fn release_funds(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let updated = service
        .release_funds(id, &request.caller, request.tx_hash.as_deref())
        .await?;
    Ok(Json(updated))
}

async fn cancel_expired(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let updated = service
        .cancel_expired(id, &request.caller, request.tx_hash.as_deref())
        .await?;
    Ok(Json(updated))
}

async fn extend_deadline(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ExtendRequest>, JsonRejection>,
) -> ApiResult<Json<Agreement>> {
    let id = agreement_id(&id)?;
    let request = body(payload)?;
    let updated = service
        .extend_deadline(
            id,
            &request.caller,
            request.deadline,
            request.tx_hash.as_deref(),
        )
        .await?;
    Ok(Json(updated))
}

async fn delete(
    State(service): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let id = agreement_id(&id)?;
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    service.delete(id, token).await?;
    Ok(StatusCode::NO_CONTENT)
}
