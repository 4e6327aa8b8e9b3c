use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{LOCATION, RETRY_AFTER};
use actix_web::{Error, HttpResponse, ResponseError};
use log::{debug, error, info, warn};
use serde_json::json;
use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use crate::auth::identity_from_request;
use crate::errors::ApiError;
use crate::rate_limit::{RateDecision, TokenBucketLimiter};

// Logger middleware to log all requests and responses
pub struct RequestLogger;

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestLoggerMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggerMiddleware { service: Rc::new(service) }))
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + 'static>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let method = req.method().clone();
        let path = req.path().to_owned();
        let client_ip = req
            .connection_info()
            .realip_remote_addr()
            .map(|s| s.to_owned())
            .unwrap_or_else(|| String::from("unknown"));

        info!("→ Request: \x1B[1;34m{} {}\x1B[0m from IP: {}", method, path, client_ip);

        let service = self.service.clone();

        Box::pin(async move {
            let start = std::time::Instant::now();
            let res = service.call(req).await?;
            let elapsed = start.elapsed();
            let status = res.status();

            if status.is_success() || status.is_redirection() {
                info!(
                    "← Response: \x1B[1;32m{}\x1B[0m for {} {} completed in {:.2?}",
                    status, method, path, elapsed
                );
            } else if status.is_client_error() {
                warn!(
                    "← Response: \x1B[1;33m{}\x1B[0m for {} {} completed in {:.2?}",
                    status, method, path, elapsed
                );
            } else {
                error!(
                    "← Response: \x1B[1;31m{}\x1B[0m for {} {} completed in {:.2?}",
                    status, method, path, elapsed
                );
            }

            Ok(res)
        })
    }
}

/// Path prefixes that require a signed-in actor and count against the
/// per-actor request budget.
pub const GATED_PREFIXES: [&str; 3] = ["/dashboard", "/complete-profile", "/api/trpc"];

/// Rate-limit key for requests without a verified identity.
pub const ANONYMOUS_KEY: &str = "unknown";

pub fn is_gated(path: &str) -> bool {
    GATED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Edge gate in front of pages and procedures: per-actor token bucket first,
/// then the sign-in check.
pub struct EdgeGate {
    limiter: Arc<TokenBucketLimiter>,
    sign_in_path: Rc<str>,
}

impl EdgeGate {
    pub fn new(limiter: Arc<TokenBucketLimiter>, sign_in_path: &str) -> Self {
        Self { limiter, sign_in_path: Rc::from(sign_in_path) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for EdgeGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = EdgeGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(EdgeGateMiddleware {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            sign_in_path: self.sign_in_path.clone(),
        }))
    }
}

pub struct EdgeGateMiddleware<S> {
    service: Rc<S>,
    limiter: Arc<TokenBucketLimiter>,
    sign_in_path: Rc<str>,
}

impl<S, B> Service<ServiceRequest> for EdgeGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + 'static>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_owned();
        if !is_gated(&path) {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(|res| res.map_into_left_body()) });
        }

        let identity = identity_from_request(req.request()).ok();
        let key = identity
            .as_ref()
            .map(|i| i.external_id.as_str())
            .unwrap_or(ANONYMOUS_KEY);

        if let RateDecision::Denied { retry_after_secs } = self.limiter.check(key) {
            warn!("Rate limit exceeded for {} on {}", key, path);
            let response = HttpResponse::TooManyRequests()
                .insert_header((RETRY_AFTER, retry_after_secs.to_string()))
                .json(json!({ "error": "Rate limit exceeded" }));
            return Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) });
        }

        if identity.is_none() {
            let response = if path.starts_with("/api/") {
                ApiError::Unauthorized("Authentication required".to_string()).error_response()
            } else {
                debug!("Redirecting anonymous request for {} to sign-in", path);
                HttpResponse::Found()
                    .insert_header((LOCATION, self.sign_in_path.as_ref()))
                    .finish()
            };
            return Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(|res| res.map_into_left_body()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_covers_pages_and_procedures_only() {
        assert!(is_gated("/dashboard"));
        assert!(is_gated("/dashboard/sessions/abc"));
        assert!(is_gated("/complete-profile"));
        assert!(is_gated("/api/trpc/session.create"));
        assert!(!is_gated("/api/health"));
        assert!(!is_gated("/api/auth/creation"));
        assert!(!is_gated("/sign-in"));
        assert!(!is_gated("/ws"));
    }
}
