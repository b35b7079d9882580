//! Shared state for the secrets buffer HTTP handlers.
//!
//! Built once per [`LocalSecretsBuffer`](crate::buffer::LocalSecretsBuffer)
//! and shared with the Axum handlers via `Arc`.

use std::sync::Arc;

use axum::http::HeaderValue;
use zeroize::Zeroizing;

use crate::store::SecretStore;

/// Shared state passed to the submit handler.
pub struct AppState {
    /// Where accepted submissions go.
    pub store: Arc<SecretStore>,
    /// Expected `X-Clawlets-Nonce` value.
    pub nonce: Zeroizing<String>,
    /// The only `Origin` allowed to submit, pre-encoded for responses.
    pub allowed_origin: HeaderValue,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("nonce", &"[redacted]")
            .field("allowed_origin", &self.allowed_origin)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}
