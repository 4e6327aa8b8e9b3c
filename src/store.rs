use actix_web::web;
use chrono::NaiveDateTime;
use log::error;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ApiError, StoreError};
use crate::models::{
    MemberWithUser, MessageWithSender, NewMessage, NewSession, NewSessionMember, NewUser, Session,
    SessionListing, SessionMember, User, UserPatch,
};

/// Persistence operations backing the procedure surface.
///
/// Every method is a blocking call; async callers go through [`run_blocking`].
pub trait Store: Send + Sync {
    fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;

    fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Fails with `Conflict` when the external id is already taken.
    fn insert_user(&self, new_user: NewUser) -> Result<User, StoreError>;

    fn update_user(&self, id: Uuid, patch: &UserPatch) -> Result<User, StoreError>;

    /// Inserts the session and the creator's moderator membership as one unit.
    fn create_session_with_moderator(&self, new_session: NewSession) -> Result<Session, StoreError>;

    fn find_session(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    fn find_session_by_code(&self, code: &str) -> Result<Option<Session>, StoreError>;

    fn list_members(&self, session_id: Uuid) -> Result<Vec<MemberWithUser>, StoreError>;

    fn find_membership(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<SessionMember>, StoreError>;

    /// Fails with `Conflict` when a row for the (user, session) pair exists.
    fn insert_membership(&self, new_member: NewSessionMember) -> Result<SessionMember, StoreError>;

    fn set_left_at(
        &self,
        member_id: Uuid,
        left_at: Option<NaiveDateTime>,
    ) -> Result<SessionMember, StoreError>;

    /// Marks every row of the user in the session banned and left. Returns the
    /// number of rows touched.
    fn ban_member(&self, session_id: Uuid, user_id: Uuid, at: NaiveDateTime)
        -> Result<usize, StoreError>;

    /// Active sessions where the user holds an active, non-banned row, newest
    /// first.
    fn list_active_sessions_for(&self, user_id: Uuid) -> Result<Vec<SessionListing>, StoreError>;

    fn insert_message(&self, new_message: NewMessage) -> Result<MessageWithSender, StoreError>;

    /// Up to `take` messages of the session, newest first, starting at the
    /// cursor message inclusive. An unknown cursor yields an empty list.
    fn messages_from(
        &self,
        session_id: Uuid,
        cursor: Option<Uuid>,
        take: i64,
    ) -> Result<Vec<MessageWithSender>, StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Runs a store call on the blocking thread pool.
pub async fn run_blocking<T, F>(store: &SharedStore, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    web::block(move || op(store.as_ref()))
        .await
        .map_err(|e| {
            error!("Database operation error: {}", e);
            ApiError::InternalError(e.to_string())
        })?
        .map_err(ApiError::from)
}
