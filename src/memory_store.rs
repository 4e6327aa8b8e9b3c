use chrono::{NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::*;
use crate::store::Store;

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    sessions: Vec<Session>,
    members: Vec<SessionMember>,
    // insertion order doubles as the tie-breaker for equal timestamps
    messages: Vec<MessageRow>,
}

/// In-process store used by tests and the `memory` development backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl Tables {
    fn sender(&self, user_id: Uuid) -> Result<SenderSummary, StoreError> {
        self.users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| SenderSummary { id: u.id, username: u.username.clone(), image_url: Some(u.image_url.clone()) })
            .ok_or(StoreError::NotFound)
    }
}

impl Store for MemoryStore {
    fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.users.iter().find(|u| u.external_id == external_id).cloned())
    }

    fn find_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    fn insert_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut tables = self.lock()?;
        if tables.users.iter().any(|u| u.external_id == new_user.external_id) {
            return Err(StoreError::Conflict("external_id already exists".to_string()));
        }
        let created = now();
        let user = User {
            id: new_user.id,
            external_id: new_user.external_id,
            username: new_user.username,
            email: new_user.email,
            image_url: new_user.image_url,
            user_type: new_user.user_type.parse().map_err(StoreError::Backend)?,
            created_at: created,
            updated_at: created,
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    fn update_user(&self, id: Uuid, patch: &UserPatch) -> Result<User, StoreError> {
        let mut tables = self.lock()?;
        let user = tables.users.iter_mut().find(|u| u.id == id).ok_or(StoreError::NotFound)?;
        if !patch.is_empty() {
            patch.apply_to(user);
            user.updated_at = now();
        }
        Ok(user.clone())
    }

    fn create_session_with_moderator(&self, new_session: NewSession) -> Result<Session, StoreError> {
        let mut tables = self.lock()?;
        if tables.sessions.iter().any(|s| s.code == new_session.code) {
            return Err(StoreError::Conflict("session code already exists".to_string()));
        }
        let created = now();
        let session = Session {
            id: new_session.id,
            code: new_session.code,
            title: new_session.title,
            description: new_session.description,
            session_type: new_session.session_type.parse().map_err(StoreError::Backend)?,
            communication_modes: new_session
                .communication_modes
                .iter()
                .map(|m| m.parse().map_err(StoreError::Backend))
                .collect::<Result<_, _>>()?,
            is_active: true,
            creator_id: new_session.creator_id,
            created_at: created,
            updated_at: created,
        };
        tables.members.push(SessionMember {
            id: Uuid::new_v4(),
            user_id: session.creator_id,
            session_id: session.id,
            role: MemberRole::Moderator,
            is_banned: false,
            joined_at: created,
            left_at: None,
        });
        tables.sessions.push(session.clone());
        Ok(session)
    }

    fn find_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.sessions.iter().find(|s| s.id == id).cloned())
    }

    fn find_session_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.sessions.iter().find(|s| s.code == code).cloned())
    }

    fn list_members(&self, session_id: Uuid) -> Result<Vec<MemberWithUser>, StoreError> {
        let tables = self.lock()?;
        tables
            .members
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| {
                let user = tables.users.iter().find(|u| u.id == m.user_id).ok_or(StoreError::NotFound)?;
                Ok(MemberWithUser { member: m.clone(), user: UserSummary::from(user) })
            })
            .collect()
    }

    fn find_membership(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<SessionMember>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .members
            .iter()
            .find(|m| m.session_id == session_id && m.user_id == user_id)
            .cloned())
    }

    fn insert_membership(&self, new_member: NewSessionMember) -> Result<SessionMember, StoreError> {
        let mut tables = self.lock()?;
        if tables
            .members
            .iter()
            .any(|m| m.session_id == new_member.session_id && m.user_id == new_member.user_id)
        {
            return Err(StoreError::Conflict("membership already exists".to_string()));
        }
        let member = SessionMember {
            id: new_member.id,
            user_id: new_member.user_id,
            session_id: new_member.session_id,
            role: new_member.role.parse().map_err(StoreError::Backend)?,
            is_banned: false,
            joined_at: now(),
            left_at: None,
        };
        tables.members.push(member.clone());
        Ok(member)
    }

    fn set_left_at(
        &self,
        member_id: Uuid,
        left_at: Option<NaiveDateTime>,
    ) -> Result<SessionMember, StoreError> {
        let mut tables = self.lock()?;
        let member = tables
            .members
            .iter_mut()
            .find(|m| m.id == member_id)
            .ok_or(StoreError::NotFound)?;
        member.left_at = left_at;
        Ok(member.clone())
    }

    fn ban_member(&self, session_id: Uuid, user_id: Uuid, at: NaiveDateTime) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;
        let mut touched = 0;
        for member in tables
            .members
            .iter_mut()
            .filter(|m| m.session_id == session_id && m.user_id == user_id)
        {
            member.is_banned = true;
            member.left_at = Some(at);
            touched += 1;
        }
        Ok(touched)
    }

    fn list_active_sessions_for(&self, user_id: Uuid) -> Result<Vec<SessionListing>, StoreError> {
        let tables = self.lock()?;
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for member in &tables.members {
            *counts.entry(member.session_id).or_default() += 1;
        }

        let mut listings = Vec::new();
        // reverse insertion order keeps newest first among equal timestamps
        for session in tables.sessions.iter().rev() {
            let member_of = tables.members.iter().any(|m| {
                m.session_id == session.id && m.user_id == user_id && m.state() == MembershipState::Active
            });
            if !member_of || !session.is_active {
                continue;
            }
            let creator = tables
                .users
                .iter()
                .find(|u| u.id == session.creator_id)
                .ok_or(StoreError::NotFound)?;
            listings.push(SessionListing {
                session: session.clone(),
                creator: CreatorSummary { id: creator.id, username: creator.username.clone() },
                member_count: counts.get(&session.id).copied().unwrap_or(0),
            });
        }
        listings.sort_by(|a, b| b.session.created_at.cmp(&a.session.created_at));
        Ok(listings)
    }

    fn insert_message(&self, new_message: NewMessage) -> Result<MessageWithSender, StoreError> {
        let mut tables = self.lock()?;
        let sender = tables.sender(new_message.sender_id)?;
        let row = MessageRow {
            id: new_message.id,
            session_id: new_message.session_id,
            sender_id: new_message.sender_id,
            content: new_message.content,
            media_url: new_message.media_url,
            media_type: new_message.media_type,
            created_at: now(),
        };
        tables.messages.push(row.clone());
        Ok(MessageWithSender::from_row(row, sender))
    }

    fn messages_from(
        &self,
        session_id: Uuid,
        cursor: Option<Uuid>,
        take: i64,
    ) -> Result<Vec<MessageWithSender>, StoreError> {
        let tables = self.lock()?;
        let newest_first = tables.messages.iter().rev().filter(|m| m.session_id == session_id);

        let page: Vec<&MessageRow> = match cursor {
            Some(cursor_id) => newest_first
                .skip_while(|m| m.id != cursor_id)
                .take(take.max(0) as usize)
                .collect(),
            None => newest_first.take(take.max(0) as usize).collect(),
        };

        page.into_iter()
            .map(|row| Ok(MessageWithSender::from_row(row.clone(), tables.sender(row.sender_id)?)))
            .collect()
    }
}
