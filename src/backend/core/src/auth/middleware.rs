//! Tower layer that resolves the caller's [`AccessContext`] before a handler
//! runs, plus the matching axum extractor.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

use super::resolver::{AuthError, ContextResolver};
use crate::rbac::AccessContext;

/// Resolves credentials on every request it wraps. Requests that fail to
/// resolve are answered with the [`AuthError`] response and never reach the
/// inner service.
#[derive(Clone)]
pub struct AccessContextLayer {
    resolver: Arc<ContextResolver>,
}

impl AccessContextLayer {
    pub fn new(resolver: Arc<ContextResolver>) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for AccessContextLayer {
    type Service = AccessContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessContextService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AccessContextService<S> {
    inner: S,
    resolver: Arc<ContextResolver>,
}

impl<S> Service<Request<Body>> for AccessContextService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match resolver.resolve_headers(request.headers()).await {
                Ok(ctx) => {
                    request.extensions_mut().insert(ctx);
                    inner.call(request).await
                }
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AccessContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AccessContext>()
            .cloned()
            .ok_or(AuthError::MissingCredential)
    }
}
