use actix_web::http::header::LOCATION;
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use log::debug;
use serde_json::json;

use crate::auth::{CurrentUser, Identity};
use crate::errors::ApiError;
use crate::models::{
    BanUserRequest, CodeLookup, CreateSessionRequest, JoinSessionRequest, LeaveSessionRequest,
    MessagesQuery, SendMessageRequest, SessionLookup, UpdateDetailsRequest,
};
use crate::services::{IdentityService, MessageService, Provisioning, SessionService};
use crate::state::AppState;

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// First stop after sign-in: provisions the local user and sends the browser
/// on to the dashboard, or to profile completion for new users.
#[get("/auth/creation")]
async fn auth_creation(identity: Identity, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let (user, provisioning) = IdentityService::ensure_user(&identity, &state).await?;
    let target = match provisioning {
        Provisioning::Existing => "/dashboard",
        Provisioning::Created => "/complete-profile",
    };
    debug!("Bootstrap for user {} redirects to {}", user.id, target);
    Ok(HttpResponse::Found().insert_header((LOCATION, target)).finish())
}

#[post("/auth.updateDetails")]
async fn update_details(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<UpdateDetailsRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = IdentityService::update_details(user, body.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[post("/session.create")]
async fn create_session(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> Result<HttpResponse, ApiError> {
    let created = SessionService::create(&user, body.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(created))
}

#[get("/session.getByCode")]
async fn get_session_by_code(
    _user: CurrentUser,
    state: web::Data<AppState>,
    query: web::Query<CodeLookup>,
) -> Result<HttpResponse, ApiError> {
    let details = SessionService::get_by_code(&query.code, &state).await?;
    Ok(HttpResponse::Ok().json(details))
}

#[get("/session.getById")]
async fn get_session_by_id(
    _user: CurrentUser,
    state: web::Data<AppState>,
    query: web::Query<SessionLookup>,
) -> Result<HttpResponse, ApiError> {
    let details = SessionService::get_by_id(&query.id, &state).await?;
    Ok(HttpResponse::Ok().json(details))
}

#[post("/session.join")]
async fn join_session(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<JoinSessionRequest>,
) -> Result<HttpResponse, ApiError> {
    let joined = SessionService::join(&user, body.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(joined))
}

#[post("/session.leave")]
async fn leave_session(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<LeaveSessionRequest>,
) -> Result<HttpResponse, ApiError> {
    let result = SessionService::leave(&user, body.session_id, &state).await?;
    Ok(HttpResponse::Ok().json(result))
}

#[post("/session.banUser")]
async fn ban_user(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<BanUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let result = SessionService::ban_user(&user, body.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(result))
}

#[get("/session.getMySessions")]
async fn get_my_sessions(CurrentUser(user): CurrentUser, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let sessions = SessionService::get_my_sessions(&user, &state).await?;
    Ok(HttpResponse::Ok().json(sessions))
}

#[post("/message.send")]
async fn send_message(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, ApiError> {
    let message = MessageService::send(&user, body.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(message))
}

#[get("/message.getSessionMessages")]
async fn get_session_messages(
    CurrentUser(user): CurrentUser,
    state: web::Data<AppState>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = MessageService::get_session_messages(&user, query.into_inner(), &state).await?;
    Ok(HttpResponse::Ok().json(page))
}

async fn unknown_procedure(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFound(format!("No procedure at {}", req.path())))
}

/// Malformed JSON bodies and query strings surface as `BAD_REQUEST` like any
/// other validation failure.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::ValidationError(err.to_string()).into())
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| ApiError::ValidationError(err.to_string()).into())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .app_data(json_config())
            .app_data(query_config())
            .service(health_check)
            .service(auth_creation)
            .service(
                web::scope("/trpc")
                    .service(update_details)
                    .service(create_session)
                    .service(get_session_by_code)
                    .service(get_session_by_id)
                    .service(join_session)
                    .service(leave_session)
                    .service(ban_user)
                    .service(get_my_sessions)
                    .service(send_message)
                    .service(get_session_messages)
                    .default_service(web::route().to(unknown_procedure)),
            ),
    );
}
