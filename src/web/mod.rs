//! axum/tower integration.
//!
//! [`TransactionLayer`] wraps a service in the status-driven retry loop and
//! [`MiddlewareRegistry`] wires it to routers by alias and group.

pub mod middleware;
pub mod registry;

use crate::core::TxError;
use axum::Json;
use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub use middleware::{TransactionLayer, TransactionService};
pub use registry::{MiddlewareRegistry, MiddlewareSpec};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Name of the route a request is dispatched to.
///
/// Insert it as a request extension ahead of the transaction layer. Requests
/// without one fall back to axum's `MatchedPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteName(pub String);

impl RouteName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn route_name_of<B>(request: &Request<B>) -> Option<String> {
    let extensions = request.extensions();
    extensions
        .get::<RouteName>()
        .map(|name| name.0.clone())
        .or_else(|| extensions.get::<MatchedPath>().map(|p| p.as_str().to_string()))
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    let body = Json(ErrorResponse {
        error: message,
        code: code.to_string(),
    });
    (status, body).into_response()
}

impl IntoResponse for TxError {
    fn into_response(self) -> Response {
        let status = match &self {
            TxError::Backend(_) | TxError::TransactionNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.code(), self.to_string())
    }
}
