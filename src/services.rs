use chrono::Utc;
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use uuid::Uuid;

use crate::auth::Identity;
use crate::errors::{ApiError, StoreError};
use crate::models::*;
use crate::relay::UserPresence;
use crate::state::AppState;
use crate::store::{run_blocking, Store};

const JOIN_CODE_LENGTH: usize = 10;
const FALLBACK_EMAIL: &str = "no-email-provided";
const FALLBACK_IMAGE_URL: &str = "default-avatar-url";

fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_join_code() -> String {
    random_alphanumeric(JOIN_CODE_LENGTH)
}

fn fallback_username() -> String {
    format!("user-{}", random_alphanumeric(6).to_ascii_lowercase())
}

fn presence_of(user: &User) -> UserPresence {
    UserPresence { user_id: user.id, username: user.username.clone() }
}

/// Whether `ensure_user` found the local user or had to create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    Existing,
    Created,
}

pub struct IdentityService;

impl IdentityService {
    /// Returns the local user for a verified identity, creating it on first
    /// sight with placeholder profile fields.
    pub async fn ensure_user(identity: &Identity, state: &AppState) -> Result<(User, Provisioning), ApiError> {
        let external_id = identity.external_id.clone();
        if let Some(user) = run_blocking(&state.store, move |s| s.find_user_by_external_id(&external_id)).await? {
            return Ok((user, Provisioning::Existing));
        }

        let new_user = NewUser {
            id: Uuid::new_v4(),
            external_id: identity.external_id.clone(),
            username: identity.username.clone().unwrap_or_else(fallback_username),
            email: identity.email.clone().unwrap_or_else(|| FALLBACK_EMAIL.to_string()),
            image_url: identity.image_url.clone().unwrap_or_else(|| FALLBACK_IMAGE_URL.to_string()),
            user_type: UserType::Student.as_str().to_string(),
        };
        let external_id = identity.external_id.clone();

        let created = run_blocking(&state.store, move |s| match s.insert_user(new_user) {
            Ok(user) => Ok((user, Provisioning::Created)),
            // Lost a race against a concurrent bootstrap for the same identity.
            Err(StoreError::Conflict(_)) => s
                .find_user_by_external_id(&external_id)?
                .map(|user| (user, Provisioning::Existing))
                .ok_or(StoreError::NotFound),
            Err(e) => Err(e),
        })
        .await
        .map_err(|e| {
            error!("Failed to create user for {}: {}", identity.external_id, e);
            ApiError::InternalError(e.to_string())
        })?;

        if created.1 == Provisioning::Created {
            info!("Created user {} for identity {}", created.0.id, identity.external_id);
        }
        Ok(created)
    }

    /// The local user of an identity; identities without one must bootstrap first.
    pub async fn resolve(identity: &Identity, state: &AppState) -> Result<User, ApiError> {
        let external_id = identity.external_id.clone();
        run_blocking(&state.store, move |s| s.find_user_by_external_id(&external_id))
            .await?
            .ok_or_else(|| {
                debug!("No local user for identity {}", identity.external_id);
                ApiError::Unauthorized("User not found".to_string())
            })
    }

    pub async fn update_details(user: User, request: UpdateDetailsRequest, state: &AppState) -> Result<User, ApiError> {
        let patch = request.into_patch()?;
        if patch.is_empty() {
            return Ok(user);
        }

        let user_id = user.id;
        let updated = run_blocking(&state.store, move |s| s.update_user(user_id, &patch))
            .await
            .map_err(|e| {
                error!("Failed to update details of user {}: {}", user_id, e);
                ApiError::InternalError("Failed to update user details".to_string())
            })?;

        info!("Updated details of user {}", user_id);
        Ok(updated)
    }
}

pub struct SessionService;

fn load_details(store: &dyn Store, session: Session) -> Result<SessionDetails, StoreError> {
    let creator = store.find_user(session.creator_id)?.ok_or(StoreError::NotFound)?;
    let session_members = store.list_members(session.id)?;
    Ok(SessionDetails { creator: UserSummary::from(&creator), session, session_members })
}

enum JoinOutcome {
    Joined,
    Rejoined,
    AlreadyMember,
    Banned,
}

fn join_existing(store: &dyn Store, member: SessionMember) -> Result<JoinOutcome, StoreError> {
    match member.state() {
        MembershipState::Banned => Ok(JoinOutcome::Banned),
        MembershipState::Left => {
            store.set_left_at(member.id, None)?;
            Ok(JoinOutcome::Rejoined)
        }
        MembershipState::Active => Ok(JoinOutcome::AlreadyMember),
    }
}

impl SessionService {
    pub async fn create(user: &User, request: CreateSessionRequest, state: &AppState) -> Result<CreateSessionResponse, ApiError> {
        request.validate()?;

        let new_session = NewSession {
            id: Uuid::new_v4(),
            code: generate_join_code(),
            title: request.title.clone(),
            description: request.description.clone(),
            session_type: request.session_type.as_str().to_string(),
            communication_modes: request.distinct_modes().iter().map(|m| m.as_str().to_string()).collect(),
            creator_id: user.id,
        };

        let session = run_blocking(&state.store, move |s| s.create_session_with_moderator(new_session))
            .await
            .map_err(|e| {
                error!("Failed to create session for user {}: {}", user.id, e);
                ApiError::InternalError(e.to_string())
            })?;

        info!("User {} created session {} ({})", user.id, session.id, session.code);
        let join_link = state.config.join_link(&session.code);
        Ok(CreateSessionResponse { session, join_link })
    }

    pub async fn get_by_code(code: &str, state: &AppState) -> Result<SessionDetails, ApiError> {
        let code = code.to_string();
        run_blocking(&state.store, move |s| match s.find_session_by_code(&code)? {
            Some(session) => load_details(s, session).map(Some),
            None => Ok(None),
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))
    }

    pub async fn get_by_id(id: &str, state: &AppState) -> Result<SessionDetails, ApiError> {
        let session_id = Uuid::parse_str(id).map_err(|_| ApiError::NotFound("Session not found".to_string()))?;
        run_blocking(&state.store, move |s| match s.find_session(session_id)? {
            Some(session) => load_details(s, session).map(Some),
            None => Ok(None),
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))
    }

    pub async fn join(user: &User, request: JoinSessionRequest, state: &AppState) -> Result<JoinSessionResponse, ApiError> {
        let code = request.code.clone();
        let session = run_blocking(&state.store, move |s| s.find_session_by_code(&code))
            .await?
            .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

        if request.role == Some(MemberRole::Moderator) {
            warn!("User {} requested moderator role when joining {}", user.id, request.code);
            return Err(ApiError::Forbidden("Cannot join a session as moderator".to_string()));
        }

        let (session_id, user_id) = (session.id, user.id);
        let outcome = run_blocking(&state.store, move |s| {
            if let Some(existing) = s.find_membership(session_id, user_id)? {
                return join_existing(s, existing);
            }
            let new_member = NewSessionMember {
                id: Uuid::new_v4(),
                user_id,
                session_id,
                role: MemberRole::Participant.as_str().to_string(),
            };
            match s.insert_membership(new_member) {
                Ok(_) => Ok(JoinOutcome::Joined),
                Err(StoreError::Conflict(_)) => {
                    let existing = s.find_membership(session_id, user_id)?.ok_or(StoreError::NotFound)?;
                    join_existing(s, existing)
                }
                Err(e) => Err(e),
            }
        })
        .await?;

        match outcome {
            JoinOutcome::Banned => {
                debug!("Banned user {} tried to join session {}", user_id, session_id);
                return Err(ApiError::Forbidden("You are banned from this session".to_string()));
            }
            JoinOutcome::AlreadyMember => {
                debug!("User {} is already a member of session {}", user_id, session_id);
            }
            JoinOutcome::Joined | JoinOutcome::Rejoined => {
                info!("User {} joined session {}", user_id, session_id);
                state.events.publish_user_joined(session_id, user);
            }
        }

        Ok(JoinSessionResponse { session })
    }

    pub async fn leave(user: &User, session_id: Uuid, state: &AppState) -> Result<SuccessResponse, ApiError> {
        let user_id = user.id;
        let member = run_blocking(&state.store, move |s| s.find_membership(session_id, user_id))
            .await?
            .ok_or_else(|| ApiError::NotFound("You are not a member of this session".to_string()))?;

        let now = Utc::now().naive_utc();
        run_blocking(&state.store, move |s| s.set_left_at(member.id, Some(now))).await?;

        info!("User {} left session {}", user_id, session_id);
        state.events.publish_user_left(session_id, presence_of(user));
        Ok(SuccessResponse { success: true })
    }

    pub async fn ban_user(user: &User, request: BanUserRequest, state: &AppState) -> Result<SuccessResponse, ApiError> {
        let BanUserRequest { session_id, target_user_id } = request;
        let user_id = user.id;

        let caller = run_blocking(&state.store, move |s| s.find_membership(session_id, user_id)).await?;
        if !caller.map(|m| m.is_active_moderator()).unwrap_or(false) {
            warn!("User {} attempted to ban in session {} without moderator rights", user_id, session_id);
            return Err(ApiError::Forbidden("Only moderators can ban users".to_string()));
        }
        if target_user_id == user_id {
            return Err(ApiError::Forbidden("You cannot ban yourself".to_string()));
        }

        let target = run_blocking(&state.store, move |s| s.find_membership(session_id, target_user_id))
            .await?
            .ok_or_else(|| ApiError::NotFound("User is not a member of this session".to_string()))?;
        if target.role == MemberRole::Moderator {
            return Err(ApiError::Forbidden("Moderators cannot be banned".to_string()));
        }

        let now = Utc::now().naive_utc();
        let (banned_rows, target_user) = run_blocking(&state.store, move |s| {
            let rows = s.ban_member(session_id, target_user_id, now)?;
            Ok((rows, s.find_user(target_user_id)?))
        })
        .await?;

        info!(
            "Moderator {} banned user {} from session {} ({} row(s))",
            user_id, target_user_id, session_id, banned_rows
        );
        let presence = match target_user {
            Some(target_user) => presence_of(&target_user),
            None => UserPresence { user_id: target_user_id, username: String::new() },
        };
        state.events.publish_user_left(session_id, presence);
        Ok(SuccessResponse { success: true })
    }

    pub async fn get_my_sessions(user: &User, state: &AppState) -> Result<Vec<SessionListing>, ApiError> {
        let user_id = user.id;
        let sessions = run_blocking(&state.store, move |s| s.list_active_sessions_for(user_id)).await?;
        debug!("Listed {} active session(s) for user {}", sessions.len(), user_id);
        Ok(sessions)
    }
}

pub struct MessageService;

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl MessageService {
    pub async fn send(user: &User, request: SendMessageRequest, state: &AppState) -> Result<MessageWithSender, ApiError> {
        let (session_id, user_id) = (request.session_id, user.id);

        let member = run_blocking(&state.store, move |s| s.find_membership(session_id, user_id)).await?;
        if member.map(|m| m.state()) != Some(MembershipState::Active) {
            debug!("User {} is not an active member of session {}", user_id, session_id);
            return Err(ApiError::Forbidden("You are not an active member of this session".to_string()));
        }

        let content = non_blank(request.content);
        let media_url = non_blank(request.media_url);
        if content.is_none() && media_url.is_none() {
            return Err(ApiError::ValidationError("Message must have content or media".to_string()));
        }

        let new_message = NewMessage {
            id: Uuid::new_v4(),
            session_id,
            sender_id: user_id,
            content,
            media_url,
            media_type: non_blank(request.media_type),
        };
        let message = run_blocking(&state.store, move |s| s.insert_message(new_message)).await?;

        debug!("User {} sent message {} to session {}", user_id, message.id, session_id);
        state.events.publish_new_message(&message);
        Ok(message)
    }

    pub async fn get_session_messages(user: &User, query: MessagesQuery, state: &AppState) -> Result<MessagePage, ApiError> {
        let limit = query.page_limit()?;
        let (session_id, user_id, cursor) = (query.session_id, user.id, query.cursor);

        let member = run_blocking(&state.store, move |s| s.find_membership(session_id, user_id)).await?;
        if member.is_none() {
            debug!("User {} has no access to messages of session {}", user_id, session_id);
            return Err(ApiError::Forbidden("You are not a member of this session".to_string()));
        }

        let mut messages = run_blocking(&state.store, move |s| s.messages_from(session_id, cursor, limit + 1)).await?;
        let next_cursor = if (messages.len() as i64) > limit {
            messages.pop().map(|m| m.id)
        } else {
            None
        };
        messages.reverse();

        Ok(MessagePage { messages, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn identity(external_id: &str) -> Identity {
        Identity { external_id: external_id.into(), email: None, username: None, image_url: None }
    }

    #[test]
    fn join_codes_are_ten_alphanumerics() {
        let code = generate_join_code();
        assert_eq!(code.len(), 10);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn fallback_username_is_lowercase() {
        let name = fallback_username();
        assert!(name.starts_with("user-"));
        assert_eq!(name.len(), 11);
        assert_eq!(name, name.to_ascii_lowercase());
    }

    #[actix_web::test]
    async fn ensure_user_creates_once_with_fallbacks() {
        let state = AppState::in_memory(AppConfig::for_tests());

        let (user, first) = IdentityService::ensure_user(&identity("ext-1"), &state).await.unwrap();
        assert_eq!(first, Provisioning::Created);
        assert_eq!(user.email, FALLBACK_EMAIL);
        assert_eq!(user.image_url, FALLBACK_IMAGE_URL);
        assert_eq!(user.user_type, UserType::Student);

        let (again, second) = IdentityService::ensure_user(&identity("ext-1"), &state).await.unwrap();
        assert_eq!(second, Provisioning::Existing);
        assert_eq!(again.id, user.id);
    }

    #[actix_web::test]
    async fn resolve_requires_bootstrap() {
        let state = AppState::in_memory(AppConfig::for_tests());
        let err = IdentityService::resolve(&identity("ghost"), &state).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[actix_web::test]
    async fn empty_patch_returns_current_user() {
        let state = AppState::in_memory(AppConfig::for_tests());
        let (user, _) = IdentityService::ensure_user(&identity("ext-2"), &state).await.unwrap();
        let same = IdentityService::update_details(user.clone(), UpdateDetailsRequest::default(), &state)
            .await
            .unwrap();
        assert_eq!(same, user);
    }

    #[actix_web::test]
    async fn get_by_id_with_malformed_id_is_not_found() {
        let state = AppState::in_memory(AppConfig::for_tests());
        let err = SessionService::get_by_id("not-a-uuid", &state).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
