//! HTTP routes for the loopback secrets buffer.
//!
//! `/secrets/submit` is the only functional route. Everything else answers
//! `404 {"error":"not found"}`.

pub mod secrets;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::http::header::{CACHE_CONTROL, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::routing::any;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;

/// Path of the submission endpoint.
pub const SUBMIT_PATH: &str = "/secrets/submit";

/// Submissions handled at once; the rest queue.
const MAX_CONCURRENT_SUBMISSIONS: usize = 16;

/// Build the buffer's router.
pub fn router(state: Arc<AppState>) -> Router {
    let submit_routes = Router::new()
        .route(SUBMIT_PATH, any(secrets::submit))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_SUBMISSIONS));

    Router::new()
        .merge(submit_routes)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn not_found() -> AppError {
    AppError::NotFound
}
