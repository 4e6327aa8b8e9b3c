use chrono::{NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::dsl;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, PooledConnection};
use log::{debug, info};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::DbPool;
use crate::errors::StoreError;
use crate::models::*;
use crate::store::Store;

// Database initialization SQL
pub const DB_INIT_SQL: &str = r#"
-- Create tables if they don't exist
CREATE TABLE IF NOT EXISTS app_user (
    id UUID PRIMARY KEY,
    external_id VARCHAR(255) UNIQUE NOT NULL,
    username VARCHAR(100) NOT NULL,
    email VARCHAR(255) NOT NULL,
    image_url VARCHAR(1024) NOT NULL,
    user_type VARCHAR(20) NOT NULL DEFAULT 'STUDENT',
    created_at TIMESTAMP NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMP NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS practice_session (
    id UUID PRIMARY KEY,
    code VARCHAR(32) UNIQUE NOT NULL,
    title VARCHAR(100) NOT NULL,
    description TEXT,
    session_type VARCHAR(32) NOT NULL,
    communication_modes TEXT[] NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    creator_id UUID NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMP NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS session_member (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    session_id UUID NOT NULL,
    role VARCHAR(20) NOT NULL DEFAULT 'PARTICIPANT',
    is_banned BOOLEAN NOT NULL DEFAULT FALSE,
    joined_at TIMESTAMP NOT NULL DEFAULT NOW(),
    left_at TIMESTAMP,
    UNIQUE (user_id, session_id)
);

CREATE TABLE IF NOT EXISTS message (
    id UUID PRIMARY KEY,
    session_id UUID NOT NULL,
    sender_id UUID NOT NULL,
    content TEXT,
    media_url VARCHAR(2048),
    media_type VARCHAR(255),
    created_at TIMESTAMP NOT NULL DEFAULT NOW(),
    CHECK (content IS NOT NULL OR media_url IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_message_session_created
    ON message (session_id, created_at DESC, id DESC);

-- Add foreign keys if not exist
DO $$
BEGIN
    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'fk_session_creator'
    ) THEN
        ALTER TABLE practice_session ADD CONSTRAINT fk_session_creator
        FOREIGN KEY (creator_id) REFERENCES app_user(id) ON DELETE RESTRICT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'fk_member_user'
    ) THEN
        ALTER TABLE session_member ADD CONSTRAINT fk_member_user
        FOREIGN KEY (user_id) REFERENCES app_user(id) ON DELETE RESTRICT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'fk_member_session'
    ) THEN
        ALTER TABLE session_member ADD CONSTRAINT fk_member_session
        FOREIGN KEY (session_id) REFERENCES practice_session(id) ON DELETE CASCADE;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'fk_message_sender'
    ) THEN
        ALTER TABLE message ADD CONSTRAINT fk_message_sender
        FOREIGN KEY (sender_id) REFERENCES app_user(id) ON DELETE RESTRICT;
    END IF;

    IF NOT EXISTS (
        SELECT 1 FROM pg_constraint WHERE conname = 'fk_message_session'
    ) THEN
        ALTER TABLE message ADD CONSTRAINT fk_message_session
        FOREIGN KEY (session_id) REFERENCES practice_session(id) ON DELETE CASCADE;
    END IF;
END $$;
"#;

/// Runs the idempotent schema script and builds the connection pool.
pub fn init_pool(db_url: &str) -> Result<DbPool, StoreError> {
    let mut conn = PgConnection::establish(db_url)
        .map_err(|e| StoreError::Backend(format!("failed to connect: {}", e)))?;
    conn.batch_execute(DB_INIT_SQL)?;
    info!("Database initialization complete.");

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    let pool = r2d2::Pool::builder().build(manager)?;
    Ok(pool)
}

type SenderColumns = (Uuid, String, String);

fn sender_summary((id, username, image_url): SenderColumns) -> SenderSummary {
    SenderSummary { id, username, image_url: Some(image_url) }
}

fn user_summary(row: &UserRow) -> UserSummary {
    UserSummary { id: row.id, username: row.username.clone(), image_url: Some(row.image_url.clone()) }
}

/// PostgreSQL-backed store.
type AtOrBefore = dsl::Or<
    dsl::Lt<crate::schema::message::created_at, NaiveDateTime>,
    dsl::And<dsl::Eq<crate::schema::message::created_at, NaiveDateTime>, dsl::LtEq<crate::schema::message::id, Uuid>>,
>;

/// Messages at or before the `(created_at, id)` position, cursor row included.
fn at_or_before(ts: NaiveDateTime, cursor_id: Uuid) -> AtOrBefore {
    use crate::schema::message;
    message::created_at
        .lt(ts)
        .or(message::created_at.eq(ts).and(message::id.le(cursor_id)))
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl Store for PgStore {
    fn find_user_by_external_id(&self, ext_id: &str) -> Result<Option<User>, StoreError> {
        use crate::schema::app_user::dsl::*;
        let mut conn = self.conn()?;
        app_user
            .filter(external_id.eq(ext_id))
            .select(UserRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(User::try_from)
            .transpose()
    }

    fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        use crate::schema::app_user::dsl::*;
        let mut conn = self.conn()?;
        app_user
            .find(user_id)
            .select(UserRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(User::try_from)
            .transpose()
    }

    fn insert_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        use crate::schema::app_user::dsl::*;
        let mut conn = self.conn()?;
        let row = diesel::insert_into(app_user)
            .values(&new_user)
            .returning(UserRow::as_returning())
            .get_result(&mut conn)?;
        info!("Created new user with ID: {}", row.id);
        User::try_from(row)
    }

    fn update_user(&self, user_id: Uuid, patch: &UserPatch) -> Result<User, StoreError> {
        use crate::schema::app_user::dsl::*;
        let mut conn = self.conn()?;
        if patch.is_empty() {
            let row = app_user.find(user_id).select(UserRow::as_select()).first(&mut conn)?;
            return User::try_from(row);
        }
        let row = diesel::update(app_user.find(user_id))
            .set((patch, updated_at.eq(Utc::now().naive_utc())))
            .returning(UserRow::as_returning())
            .get_result(&mut conn)?;
        User::try_from(row)
    }

    fn create_session_with_moderator(&self, new_session: NewSession) -> Result<Session, StoreError> {
        use crate::schema::{practice_session, session_member};
        let mut conn = self.conn()?;
        let row = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let row = diesel::insert_into(practice_session::table)
                .values(&new_session)
                .returning(SessionRow::as_returning())
                .get_result(conn)?;
            let moderator = NewSessionMember {
                id: Uuid::new_v4(),
                user_id: new_session.creator_id,
                session_id: row.id,
                role: MemberRole::Moderator.as_str().to_string(),
            };
            diesel::insert_into(session_member::table)
                .values(&moderator)
                .execute(conn)?;
            Ok(row)
        })?;
        debug!("Session {} created with moderator {}", row.id, row.creator_id);
        Session::try_from(row)
    }

    fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        use crate::schema::practice_session::dsl::*;
        let mut conn = self.conn()?;
        practice_session
            .find(session_id)
            .select(SessionRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Session::try_from)
            .transpose()
    }

    fn find_session_by_code(&self, join_code: &str) -> Result<Option<Session>, StoreError> {
        use crate::schema::practice_session::dsl::*;
        let mut conn = self.conn()?;
        practice_session
            .filter(code.eq(join_code))
            .select(SessionRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(Session::try_from)
            .transpose()
    }

    fn list_members(&self, sid: Uuid) -> Result<Vec<MemberWithUser>, StoreError> {
        use crate::schema::{app_user, session_member};
        let mut conn = self.conn()?;
        let rows = session_member::table
            .inner_join(app_user::table)
            .filter(session_member::session_id.eq(sid))
            .order(session_member::joined_at.asc())
            .select((MemberRow::as_select(), UserRow::as_select()))
            .load::<(MemberRow, UserRow)>(&mut conn)?;
        rows.into_iter()
            .map(|(member, user)| {
                Ok(MemberWithUser { user: user_summary(&user), member: SessionMember::try_from(member)? })
            })
            .collect()
    }

    fn find_membership(&self, sid: Uuid, uid: Uuid) -> Result<Option<SessionMember>, StoreError> {
        use crate::schema::session_member::dsl::*;
        let mut conn = self.conn()?;
        session_member
            .filter(session_id.eq(sid))
            .filter(user_id.eq(uid))
            .select(MemberRow::as_select())
            .first(&mut conn)
            .optional()?
            .map(SessionMember::try_from)
            .transpose()
    }

    fn insert_membership(&self, new_member: NewSessionMember) -> Result<SessionMember, StoreError> {
        use crate::schema::session_member::dsl::*;
        let mut conn = self.conn()?;
        let row = diesel::insert_into(session_member)
            .values(&new_member)
            .returning(MemberRow::as_returning())
            .get_result(&mut conn)?;
        SessionMember::try_from(row)
    }

    fn set_left_at(
        &self,
        member_id: Uuid,
        left: Option<NaiveDateTime>,
    ) -> Result<SessionMember, StoreError> {
        use crate::schema::session_member::dsl::*;
        let mut conn = self.conn()?;
        let row = diesel::update(session_member.find(member_id))
            .set(left_at.eq(left))
            .returning(MemberRow::as_returning())
            .get_result(&mut conn)?;
        SessionMember::try_from(row)
    }

    fn ban_member(&self, sid: Uuid, uid: Uuid, at: NaiveDateTime) -> Result<usize, StoreError> {
        use crate::schema::session_member::dsl::*;
        let mut conn = self.conn()?;
        let touched = diesel::update(
            session_member.filter(session_id.eq(sid)).filter(user_id.eq(uid)),
        )
        .set((is_banned.eq(true), left_at.eq(Some(at))))
        .execute(&mut conn)?;
        Ok(touched)
    }

    fn list_active_sessions_for(&self, uid: Uuid) -> Result<Vec<SessionListing>, StoreError> {
        use crate::schema::{app_user, practice_session, session_member};
        let mut conn = self.conn()?;

        let memberships = session_member::table
            .filter(session_member::user_id.eq(uid))
            .filter(session_member::left_at.is_null())
            .filter(session_member::is_banned.eq(false))
            .select(session_member::session_id);

        let rows = practice_session::table
            .inner_join(app_user::table)
            .filter(practice_session::id.eq_any(memberships))
            .filter(practice_session::is_active.eq(true))
            .order(practice_session::created_at.desc())
            .select((SessionRow::as_select(), app_user::id, app_user::username))
            .load::<(SessionRow, Uuid, String)>(&mut conn)?;

        let ids: Vec<Uuid> = rows.iter().map(|(s, _, _)| s.id).collect();
        let counts: HashMap<Uuid, i64> = session_member::table
            .filter(session_member::session_id.eq_any(&ids))
            .group_by(session_member::session_id)
            .select((session_member::session_id, diesel::dsl::count(session_member::id)))
            .load::<(Uuid, i64)>(&mut conn)?
            .into_iter()
            .collect();

        rows.into_iter()
            .map(|(session, creator_id, creator_name)| {
                let member_count = counts.get(&session.id).copied().unwrap_or(0);
                Ok(SessionListing {
                    session: Session::try_from(session)?,
                    creator: CreatorSummary { id: creator_id, username: creator_name },
                    member_count,
                })
            })
            .collect()
    }

    fn insert_message(&self, new_message: NewMessage) -> Result<MessageWithSender, StoreError> {
        use crate::schema::{app_user, message};
        let mut conn = self.conn()?;
        let row = diesel::insert_into(message::table)
            .values(&new_message)
            .returning(MessageRow::as_returning())
            .get_result(&mut conn)?;
        let sender = app_user::table
            .find(row.sender_id)
            .select((app_user::id, app_user::username, app_user::image_url))
            .first::<SenderColumns>(&mut conn)?;
        Ok(MessageWithSender::from_row(row, sender_summary(sender)))
    }

    fn messages_from(
        &self,
        sid: Uuid,
        cursor: Option<Uuid>,
        take: i64,
    ) -> Result<Vec<MessageWithSender>, StoreError> {
        use crate::schema::{app_user, message};
        let mut conn = self.conn()?;

        let start = match cursor {
            Some(cursor_id) => {
                let found = message::table
                    .filter(message::id.eq(cursor_id))
                    .filter(message::session_id.eq(sid))
                    .select((message::created_at, message::id))
                    .first::<(NaiveDateTime, Uuid)>(&mut conn)
                    .optional()?;
                match found {
                    Some(position) => Some(position),
                    None => return Ok(Vec::new()),
                }
            }
            None => None,
        };

        let mut query = message::table
            .inner_join(app_user::table)
            .filter(message::session_id.eq(sid))
            .select((MessageRow::as_select(), (app_user::id, app_user::username, app_user::image_url)))
            .into_boxed();

        if let Some((ts, cursor_id)) = start {
            query = query.filter(at_or_before(ts, cursor_id));
        }

        let rows = query
            .order((message::created_at.desc(), message::id.desc()))
            .limit(take)
            .load::<(MessageRow, SenderColumns)>(&mut conn)?;

        Ok(rows
            .into_iter()
            .map(|(row, sender)| MessageWithSender::from_row(row, sender_summary(sender)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::message;
    use diesel::debug_query;
    use diesel::pg::Pg;

    #[test]
    fn cursor_filter_keeps_the_cursor_row() {
        let ts = Utc::now().naive_utc();
        let query = message::table.select(message::id).filter(at_or_before(ts, Uuid::new_v4()));
        let sql = debug_query::<Pg, _>(&query).to_string();

        assert!(sql.contains(r#""message"."created_at" < $1"#), "{}", sql);
        assert!(sql.contains(r#""message"."created_at" = $2"#), "{}", sql);
        assert!(sql.contains(r#""message"."id" <= $3"#), "{}", sql);
        assert!(sql.contains(" OR "), "{}", sql);
    }
}
