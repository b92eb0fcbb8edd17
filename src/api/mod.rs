//! Inbound API surface (A6, `SPEC_FULL.md` §4.11): exactly the three
//! operations named in §6 Inbound, nothing else.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{ErrorKind, NewTransaction, TransactionId, TxStatus};

pub fn router<S: Store + 'static>(store: Arc<S>) -> Router {
    Router::new()
        .route("/tx", post(submit::<S>))
        .route("/tx/:id", get(get_status::<S>).delete(cancel::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(store)
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    from: Address,
    to: Address,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    value: U256,
    gas_limit: U256,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: TransactionId,
}

async fn submit<S: Store>(
    State(store): State<Arc<S>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let id = store
        .insert_transaction(NewTransaction {
            signing_address: request.from,
            to: request.to,
            data: request.data,
            value: request.value,
            gas_limit: request.gas_limit,
            has_value: false,
        })
        .await?;
    Ok(Json(SubmitResponse { id }))
}

async fn cancel<S: Store>(
    State(store): State<Arc<S>>,
    Path(id): Path<TransactionId>,
) -> Result<StatusCode, ApiError> {
    store.cancel_transaction(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: TxStatus,
    hash: Option<String>,
    block_number: Option<u64>,
    error_kind: Option<ErrorKind>,
}

async fn get_status<S: Store>(
    State(store): State<Arc<S>>,
    Path(id): Path<TransactionId>,
) -> Result<Json<StatusResponse>, ApiError> {
    let tx = store.get_transaction(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(StatusResponse {
        status: tx.status,
        hash: tx.last_broadcast_hash.map(|h| format!("{h:#x}")),
        block_number: None,
        error_kind: tx.last_error_kind,
    }))
}

enum ApiError {
    NotFound,
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "no such transaction").into_response(),
            Self::Store(StoreError::Refused(reason)) => (StatusCode::CONFLICT, reason).into_response(),
            Self::Store(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
        }
    }
}
