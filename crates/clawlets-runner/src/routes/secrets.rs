//! Secrets submission route: `/secrets/submit`.
//!
//! Checks run in a fixed order and each failure short-circuits before the
//! store is touched: method, `Origin`, `X-Clawlets-Nonce`, body size, body
//! shape. Only `POST` does work; `OPTIONS` gets a preflight reply scoped to
//! the allowed origin, and every other method is a 404. A body that fails
//! mid-read answers `500 {"error":"internal error","detail":...}`.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{
    AppError, INVALID_JSON_BODY, MISSING_FIELDS, NONCE_MISMATCH, ORIGIN_FORBIDDEN,
};
use crate::state::AppState;
use crate::store::SecretMap;

/// Header carrying the per-session nonce.
pub const NONCE_HEADER: &str = "x-clawlets-nonce";

#[derive(Serialize)]
struct SubmitResponse {
    ok: bool,
    accepted: usize,
}

/// Handle any method on `/secrets/submit`.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method == Method::OPTIONS {
        return preflight(&state);
    }
    if method != Method::POST {
        return AppError::NotFound.into_response();
    }

    if headers.get(ORIGIN) != Some(&state.allowed_origin) {
        warn!(origin = ?headers.get(ORIGIN), "secrets submission from foreign origin rejected");
        return AppError::Forbidden(ORIGIN_FORBIDDEN).into_response();
    }

    let mut response = match accept(&state, &headers, body).await {
        Ok(accepted) => Json(SubmitResponse { ok: true, accepted }).into_response(),
        Err(err) => err.into_response(),
    };
    allow_origin(response.headers_mut(), &state.allowed_origin);
    response
}

async fn accept(state: &AppState, headers: &HeaderMap, body: Body) -> Result<usize, AppError> {
    let presented = headers
        .get(NONCE_HEADER)
        .map_or(&[][..], HeaderValue::as_bytes);
    if !bool::from(presented.ct_eq(state.nonce.as_bytes())) {
        warn!("secrets submission with wrong nonce rejected");
        return Err(AppError::Forbidden(NONCE_MISMATCH));
    }

    let bytes = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => return Err(AppError::PayloadTooLarge),
        Err(e) => {
            warn!(error = %e, "failed to read secrets submission body");
            return Err(AppError::Internal(format!("failed to read request body: {e}")));
        }
    };

    let payload: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| AppError::BadRequest(INVALID_JSON_BODY))?;

    let (job_id, secrets) =
        parse_submission(&payload).ok_or(AppError::BadRequest(MISSING_FIELDS))?;

    let accepted = state.store.submit(job_id, secrets);
    info!(job_id, accepted, "secrets buffered");
    Ok(accepted)
}

/// Extract a non-empty `jobId` string and an object-valued `secrets` map.
fn parse_submission(payload: &serde_json::Value) -> Option<(&str, SecretMap)> {
    let job_id = payload.get("jobId")?.as_str().filter(|id| !id.is_empty())?;
    let secrets = payload.get("secrets")?.as_object()?;
    Some((job_id, SecretMap::from_json_object(secrets)))
}

fn preflight(state: &AppState) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    allow_origin(headers, &state.allowed_origin);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-clawlets-nonce"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    response
}

fn allow_origin(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(VARY, HeaderValue::from_static("Origin"));
}
