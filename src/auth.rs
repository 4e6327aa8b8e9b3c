use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::ApiError;
use crate::models::User;
use crate::services::IdentityService;
use crate::state::AppState;

/// Claims issued by the identity provider.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Claims {
    pub sub: String,      // Subject (external identity id)
    pub exp: usize,       // Expiration time
    pub iat: usize,       // Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A verified external identity. It may not have a local user yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub external_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub image_url: Option<String>,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            external_id: claims.sub,
            email: claims.email,
            username: claims.username,
            image_url: claims.image_url,
        }
    }
}

pub struct AuthService;

impl AuthService {
    pub fn generate_token(identity: &Identity, config: &AppConfig) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.external_id.clone(),
            exp: (now + Duration::hours(1)).timestamp() as usize,
            iat: now.timestamp() as usize,
            iss: config.jwt_issuer.clone(),
            email: identity.email.clone(),
            username: identity.username.clone(),
            image_url: identity.image_url.clone(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .map_err(|e| {
            error!("Failed to generate token: {}", e);
            ApiError::InternalError("Failed to generate token".to_string())
        })
    }

    pub fn verify_token(token: &str, config: &AppConfig) -> Result<Identity, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<Claims>(token, &DecodingKey::from_secret(config.jwt_secret.as_bytes()), &validation)
            .map(|data| Identity::from(data.claims))
            .map_err(|e| {
                debug!("Rejected bearer token: {}", e);
                ApiError::Unauthorized("Invalid or expired token".to_string())
            })
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, or the `token` query
/// parameter for clients that cannot set headers (browser sockets).
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    if let Some(header) = req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    web::Query::<TokenQuery>::from_query(req.query_string())
        .ok()
        .and_then(|q| q.into_inner().token)
}

fn app_state(req: &HttpRequest) -> Result<web::Data<AppState>, ApiError> {
    req.app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| ApiError::InternalError("Application state is not configured".to_string()))
}

pub fn identity_from_request(req: &HttpRequest) -> Result<Identity, ApiError> {
    let state = app_state(req)?;
    let token = bearer_token(req).ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
    AuthService::verify_token(&token, &state.config)
}

impl FromRequest for Identity {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(identity_from_request(req))
    }
}

/// The local user behind a verified identity.
pub struct CurrentUser(pub User);

impl FromRequest for CurrentUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let identity = identity_from_request(req);
        let state = app_state(req);
        Box::pin(async move {
            let identity = identity?;
            let state = state?;
            let user = IdentityService::resolve(&identity, &state).await?;
            Ok(CurrentUser(user))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn identity() -> Identity {
        Identity {
            external_id: "user_2abc".into(),
            email: Some("a@example.com".into()),
            username: None,
            image_url: None,
        }
    }

    #[test]
    fn token_round_trips_identity() {
        let config = AppConfig::for_tests();
        let token = AuthService::generate_token(&identity(), &config).unwrap();
        assert_eq!(AuthService::verify_token(&token, &config).unwrap(), identity());
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let config = AppConfig::for_tests();
        let mut other = AppConfig::for_tests();
        other.jwt_secret = "another-secret".into();
        let token = AuthService::generate_token(&identity(), &other).unwrap();
        assert!(matches!(AuthService::verify_token(&token, &config), Err(ApiError::Unauthorized(_))));
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let mut config = AppConfig::for_tests();
        let token = AuthService::generate_token(&identity(), &config).unwrap();
        config.jwt_issuer = Some("https://id.speakspace.app".into());
        assert!(AuthService::verify_token(&token, &config).is_err());
    }

    #[test]
    fn bearer_token_prefers_header_then_query() {
        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Bearer abc.def"))
            .uri("/ws?token=zzz")
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def"));

        let req = TestRequest::default().uri("/ws?token=zzz").to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("zzz"));

        let req = TestRequest::default().to_http_request();
        assert_eq!(bearer_token(&req), None);
    }
}
