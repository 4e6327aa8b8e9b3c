use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{ApiError, StoreError};

// Enumerations are stored as VARCHAR and travel over the wire in
// SCREAMING_SNAKE_CASE.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

string_enum!(UserType {
    Hr => "HR",
    Student => "STUDENT",
    JobSeeker => "JOBSEEKER",
    Employee => "EMPLOYEE",
});

string_enum!(SessionType {
    GroupDiscussion => "GROUP_DISCUSSION",
    Interview => "INTERVIEW",
});

string_enum!(CommunicationMode {
    Chat => "CHAT",
    Voice => "VOICE",
    Video => "VIDEO",
});

string_enum!(MemberRole {
    Moderator => "MODERATOR",
    Participant => "PARTICIPANT",
});

fn parse_column<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Backend)
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::app_user)]
pub struct UserRow {
    pub id: Uuid,
    pub external_id: String,
    pub username: String,
    pub email: String,
    pub image_url: String,
    pub user_type: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub username: String,
    pub email: String,
    pub image_url: String,
    pub user_type: UserType,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            external_id: row.external_id,
            username: row.username,
            email: row.email,
            image_url: row.image_url,
            user_type: parse_column(&row.user_type)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::app_user)]
pub struct NewUser {
    pub id: Uuid,
    pub external_id: String,
    pub username: String,
    pub email: String,
    pub image_url: String,
    pub user_type: String,
}

/// Field-by-field profile update. `None` leaves the column untouched.
#[derive(AsChangeset, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = crate::schema::app_user)]
pub struct UserPatch {
    pub username: Option<String>,
    pub email: Option<String>,
    pub image_url: Option<String>,
    pub user_type: Option<String>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.email.is_none()
            && self.image_url.is_none()
            && self.user_type.is_none()
    }

    pub fn apply_to(&self, user: &mut User) {
        if let Some(username) = &self.username {
            user.username = username.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(image_url) = &self.image_url {
            user.image_url = image_url.clone();
        }
        if let Some(user_type) = self.user_type.as_deref().and_then(|t| t.parse().ok()) {
            user.user_type = user_type;
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub image_url: Option<String>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self { id: user.id, username: user.username.clone(), image_url: Some(user.image_url.clone()) }
    }
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::practice_session)]
pub struct SessionRow {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub session_type: String,
    pub communication_modes: Vec<String>,
    pub is_active: bool,
    pub creator_id: Uuid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub session_type: SessionType,
    pub communication_modes: Vec<CommunicationMode>,
    pub is_active: bool,
    pub creator_id: Uuid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            code: row.code,
            title: row.title,
            description: row.description,
            session_type: parse_column(&row.session_type)?,
            communication_modes: row
                .communication_modes
                .iter()
                .map(|m| parse_column(m))
                .collect::<Result<_, _>>()?,
            is_active: row.is_active,
            creator_id: row.creator_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::practice_session)]
pub struct NewSession {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub session_type: String,
    pub communication_modes: Vec<String>,
    pub creator_id: Uuid,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::session_member)]
pub struct MemberRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub is_banned: bool,
    pub joined_at: NaiveDateTime,
    pub left_at: Option<NaiveDateTime>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMember {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: MemberRole,
    pub is_banned: bool,
    pub joined_at: NaiveDateTime,
    pub left_at: Option<NaiveDateTime>,
}

impl TryFrom<MemberRow> for SessionMember {
    type Error = StoreError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            session_id: row.session_id,
            role: parse_column(&row.role)?,
            is_banned: row.is_banned,
            joined_at: row.joined_at,
            left_at: row.left_at,
        })
    }
}

/// Lifecycle state of one (user, session) membership.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipState {
    Active,
    Left,
    Banned,
}

impl SessionMember {
    pub fn state(&self) -> MembershipState {
        if self.is_banned {
            MembershipState::Banned
        } else if self.left_at.is_some() {
            MembershipState::Left
        } else {
            MembershipState::Active
        }
    }

    pub fn is_active_moderator(&self) -> bool {
        self.role == MemberRole::Moderator && self.state() == MembershipState::Active
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::session_member)]
pub struct NewSessionMember {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::message)]
pub struct MessageRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::message)]
pub struct NewMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    pub id: Uuid,
    pub username: String,
    pub image_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithSender {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub created_at: NaiveDateTime,
    pub sender: SenderSummary,
}

impl MessageWithSender {
    pub fn from_row(row: MessageRow, sender: SenderSummary) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            sender_id: row.sender_id,
            content: row.content,
            media_url: row.media_url,
            media_type: row.media_type,
            created_at: row.created_at,
            sender,
        }
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberWithUser {
    #[serde(flatten)]
    pub member: SessionMember,
    pub user: UserSummary,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    #[serde(flatten)]
    pub session: Session,
    pub creator: UserSummary,
    pub session_members: Vec<MemberWithUser>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatorSummary {
    pub id: Uuid,
    pub username: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    #[serde(flatten)]
    pub session: Session,
    pub creator: CreatorSummary,
    pub member_count: i64,
}

// ---------------------------------------------------------------------------
// Procedure inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDetailsRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub image_url: Option<String>,
    pub user_type: Option<UserType>,
}

impl UpdateDetailsRequest {
    pub fn into_patch(self) -> Result<UserPatch, ApiError> {
        if let Some(username) = &self.username {
            let len = username.chars().count();
            if !(3..=20).contains(&len) {
                return Err(ApiError::ValidationError(
                    "Username must be between 3 and 20 characters".to_string(),
                ));
            }
        }
        if let Some(email) = &self.email {
            if !is_valid_email(email) {
                return Err(ApiError::ValidationError("Invalid email address".to_string()));
            }
        }
        if let Some(image_url) = &self.image_url {
            if url::Url::parse(image_url).is_err() {
                return Err(ApiError::ValidationError("Invalid image URL".to_string()));
            }
        }
        Ok(UserPatch {
            username: self.username,
            email: self.email,
            image_url: self.image_url,
            user_type: self.user_type.map(|t| t.as_str().to_string()),
        })
    }
}

fn is_valid_email(email: &str) -> bool {
    let mut parts = email.splitn(2, '@');
    let (local, domain) = match (parts.next(), parts.next()) {
        (Some(l), Some(d)) => (l, d),
        _ => return false,
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub title: String,
    pub description: Option<String>,
    pub session_type: SessionType,
    pub communication_modes: Vec<CommunicationMode>,
}

impl CreateSessionRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let len = self.title.chars().count();
        if !(3..=100).contains(&len) {
            return Err(ApiError::ValidationError(
                "Title must be between 3 and 100 characters".to_string(),
            ));
        }
        if self.communication_modes.is_empty() {
            return Err(ApiError::ValidationError(
                "At least one communication mode is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Modes in request order with duplicates removed.
    pub fn distinct_modes(&self) -> Vec<CommunicationMode> {
        let mut modes = Vec::with_capacity(self.communication_modes.len());
        for mode in &self.communication_modes {
            if !modes.contains(mode) {
                modes.push(*mode);
            }
        }
        modes
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session: Session,
    pub join_link: String,
}

#[derive(Deserialize, Debug)]
pub struct SessionLookup {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct CodeLookup {
    pub code: String,
}

#[derive(Deserialize, Debug)]
pub struct JoinSessionRequest {
    pub code: String,
    pub role: Option<MemberRole>,
}

#[derive(Serialize, Debug)]
pub struct JoinSessionResponse {
    pub session: Session,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionRequest {
    pub session_id: Uuid,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BanUserRequest {
    pub session_id: Uuid,
    pub target_user_id: Uuid,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub session_id: Uuid,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub session_id: Uuid,
    pub cursor: Option<Uuid>,
    pub limit: Option<i64>,
}

impl MessagesQuery {
    pub fn page_limit(&self) -> Result<i64, ApiError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ApiError::ValidationError(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        Ok(limit)
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageWithSender>,
    pub next_cursor: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_use_wire_names() {
        assert_eq!(serde_json::to_string(&SessionType::GroupDiscussion).unwrap(), "\"GROUP_DISCUSSION\"");
        assert_eq!("JOBSEEKER".parse::<UserType>().unwrap(), UserType::JobSeeker);
        assert!("ADMIN".parse::<MemberRole>().is_err());
    }

    #[test]
    fn patch_rejects_short_username() {
        let req = UpdateDetailsRequest { username: Some("ab".into()), ..Default::default() };
        assert!(matches!(req.into_patch(), Err(ApiError::ValidationError(_))));
    }

    #[test]
    fn patch_rejects_malformed_email_and_url() {
        let req = UpdateDetailsRequest { email: Some("not-an-email".into()), ..Default::default() };
        assert!(req.into_patch().is_err());
        let req = UpdateDetailsRequest { image_url: Some("avatar.png".into()), ..Default::default() };
        assert!(req.into_patch().is_err());
    }

    #[test]
    fn patch_only_touches_provided_fields() {
        let patch = UpdateDetailsRequest {
            user_type: Some(UserType::Hr),
            ..Default::default()
        }
        .into_patch()
        .unwrap();

        let now = chrono::Utc::now().naive_utc();
        let mut user = User {
            id: Uuid::new_v4(),
            external_id: "ext".into(),
            username: "keepme".into(),
            email: "keep@example.com".into(),
            image_url: "https://img.example.com/a.png".into(),
            user_type: UserType::Student,
            created_at: now,
            updated_at: now,
        };
        patch.apply_to(&mut user);
        assert_eq!(user.user_type, UserType::Hr);
        assert_eq!(user.username, "keepme");
        assert_eq!(user.email, "keep@example.com");
    }

    #[test]
    fn create_request_requires_modes_and_title_length() {
        let mut req = CreateSessionRequest {
            title: "Standup".into(),
            description: None,
            session_type: SessionType::GroupDiscussion,
            communication_modes: vec![CommunicationMode::Chat, CommunicationMode::Chat],
        };
        assert!(req.validate().is_ok());
        assert_eq!(req.distinct_modes(), vec![CommunicationMode::Chat]);

        req.communication_modes.clear();
        assert!(req.validate().is_err());

        req.communication_modes.push(CommunicationMode::Video);
        req.title = "ab".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn membership_state_derives_from_flags() {
        let now = chrono::Utc::now().naive_utc();
        let mut member = SessionMember {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            role: MemberRole::Moderator,
            is_banned: false,
            joined_at: now,
            left_at: None,
        };
        assert_eq!(member.state(), MembershipState::Active);
        assert!(member.is_active_moderator());
        member.left_at = Some(now);
        assert_eq!(member.state(), MembershipState::Left);
        assert!(!member.is_active_moderator());
        member.is_banned = true;
        assert_eq!(member.state(), MembershipState::Banned);
    }

    #[test]
    fn page_limit_defaults_and_bounds() {
        let q = MessagesQuery { session_id: Uuid::new_v4(), cursor: None, limit: None };
        assert_eq!(q.page_limit().unwrap(), 50);
        let q = MessagesQuery { session_id: Uuid::new_v4(), cursor: None, limit: Some(101) };
        assert!(q.page_limit().is_err());
        let q = MessagesQuery { session_id: Uuid::new_v4(), cursor: None, limit: Some(0) };
        assert!(q.page_limit().is_err());
    }
}
