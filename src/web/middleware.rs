use super::{error_response, route_name_of};
use crate::config::TransactionConfig;
use crate::events::{EventBus, RequestInfo};
use crate::transaction::{TransactionBackend, TransactionSession};
use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http_body_util::LengthLimitError;
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use tracing::{Instrument, Level, event, info_span};

/// Wraps a service in a request-scoped transaction with status-driven retries.
///
/// Each non-ignored request gets a fresh [`TransactionSession`] which is
/// inserted into the request extensions before the inner service runs.
#[derive(Clone)]
pub struct TransactionLayer {
    config: Arc<TransactionConfig>,
    backend: Arc<dyn TransactionBackend>,
    events: EventBus,
    attempts: Option<u32>,
}

impl TransactionLayer {
    pub fn new(config: TransactionConfig, backend: Arc<dyn TransactionBackend>) -> Self {
        Self::with_shared_config(Arc::new(config), backend)
    }

    pub fn with_shared_config(config: Arc<TransactionConfig>, backend: Arc<dyn TransactionBackend>) -> Self {
        Self {
            config,
            backend,
            events: EventBus::new(),
            attempts: None,
        }
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Override the configured attempt budget; `0` keeps the default
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn effective_attempts(&self) -> u32 {
        self.config.effective_attempts(self.attempts)
    }

    async fn handle<S>(self, mut request: Request<Body>, mut inner: S) -> Result<Response, S::Error>
    where
        S: Service<Request<Body>, Response = Response>,
    {
        let route_name = route_name_of(&request);
        if self.config.should_ignore_route(route_name.as_deref())
            || self.config.should_ignore_method(request.method())
        {
            event!(
                Level::TRACE,
                method = %request.method(),
                route = route_name.as_deref().unwrap_or_default(),
                "transaction middleware bypassed"
            );
            // Never started: hook registration answers `NotActive` and no transaction opens.
            let session = TransactionSession::new(Arc::clone(&self.backend), self.events.clone());
            request.extensions_mut().insert(session);
            return inner.ready().await?.call(request).await;
        }

        let mut info = RequestInfo::new(request.method().clone(), request.uri().clone());
        if let Some(name) = route_name {
            info = info.with_route_name(name);
        }
        let attempts = self.effective_attempts();
        let span = info_span!(
            "transaction.request",
            request_id = %info.request_id,
            method = %info.method,
            uri = %info.uri,
            attempts
        );

        async move {
            let (parts, body) = request.into_parts();
            let body = match axum::body::to_bytes(body, self.config.request_body_limit).await {
                Ok(bytes) => bytes,
                Err(err) if exceeds_limit(&err) => {
                    event!(Level::WARN, error = %err, "request body rejected");
                    return Ok(error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "payload_too_large",
                        format!("request body exceeds {} bytes", self.config.request_body_limit),
                    ));
                }
                Err(err) => {
                    event!(Level::WARN, error = %err, "failed to read request body");
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_body",
                        format!("failed to read request body: {err}"),
                    ));
                }
            };

            let session = TransactionSession::new(Arc::clone(&self.backend), self.events.clone());
            session.start_middleware();
            let outcome = self
                .run_attempts(&session, &info, &parts, &body, attempts, &mut inner)
                .await;
            session.stop_middleware();
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_attempts<S>(
        &self,
        session: &TransactionSession,
        info: &RequestInfo,
        parts: &Parts,
        body: &Bytes,
        attempts: u32,
        inner: &mut S,
    ) -> Result<Response, S::Error>
    where
        S: Service<Request<Body>, Response = Response>,
    {
        let mut remaining = attempts;
        loop {
            if let Err(err) = session.begin_transaction(Some(info)).await {
                return Ok(err.into_response());
            }

            let response = match call_inner(inner, replay(parts, body, session)).await {
                Ok(response) => response,
                Err(err) => {
                    // Not retried: the error belongs to the host's error handling.
                    if let Err(abort_err) = session.abort().await {
                        event!(Level::ERROR, error = %abort_err, "failed to abort transaction");
                    }
                    return Err(err);
                }
            };

            let status = response.status();
            if self.config.should_commit(status) {
                if let Err(err) = session.commit(Some(info)).await {
                    return Ok(err.into_response());
                }
                event!(Level::DEBUG, status = status.as_u16(), attempt = session.current_attempt(), "request committed");
                return Ok(response);
            }

            let is_final = remaining <= 1;
            if let Err(err) = session.rollback(Some(info), is_final).await {
                return Ok(err.into_response());
            }
            if is_final {
                event!(
                    Level::INFO,
                    status = status.as_u16(),
                    attempts,
                    "request rolled back, attempts exhausted"
                );
                return Ok(response);
            }
            event!(Level::DEBUG, status = status.as_u16(), remaining = remaining - 1, "retrying request");
            remaining -= 1;
        }
    }
}

async fn call_inner<S>(inner: &mut S, request: Request<Body>) -> Result<Response, S::Error>
where
    S: Service<Request<Body>, Response = Response>,
{
    inner.ready().await?.call(request).await
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Rebuild an identical request for the next attempt.
fn replay(parts: &Parts, body: &Bytes, session: &TransactionSession) -> Request<Body> {
    let mut request = Request::new(Body::from(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request.extensions_mut().insert(session.clone());
    request
}

impl fmt::Debug for TransactionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLayer")
            .field("alias", &self.config.middleware_alias)
            .field("attempts", &self.effective_attempts())
            .field("events", &self.events)
            .finish()
    }
}

impl<S> Layer<S> for TransactionLayer {
    type Service = TransactionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TransactionService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TransactionService<S> {
    inner: S,
    layer: TransactionLayer,
}

impl<S> Service<Request<Body>> for TransactionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(layer.handle(request, inner))
    }
}
