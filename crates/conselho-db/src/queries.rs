use crate::Database;
use crate::models::{
    UserRow, cents, consultant_status_from_row, get_decimal, get_time, get_uuid, message_from_row,
    now_text, role_from_row, timestamp_text, user_from_row,
};
use anyhow::Result;
use conselho_types::models::{ChatMessage, ConsultantProfile, ConsultantStatus, Role, User};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Whether `e` is a UNIQUE constraint failure, e.g. a username that was
/// taken between the check and the insert.
pub fn is_unique_violation(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, username: &str, password_hash: &str, role: Role) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id.to_string(), username, password_hash, role.as_str(), now_text()),
            )?;
            Ok(())
        })
    }

    /// Create a consultant user and their rate card in one transaction.
    pub fn create_consultant(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        price_per_minute: Decimal,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (id, username, password, role, created_at) VALUES (?1, ?2, ?3, 'consultant', ?4)",
                (id.to_string(), username, password_hash, now_text()),
            )?;
            tx.execute(
                "INSERT INTO consultant_profiles (user_id, price_per_minute, status) VALUES (?1, ?2, 'online')",
                (id.to_string(), cents(price_per_minute).to_string()),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, password, role FROM users WHERE username = ?1",
                    [username],
                    user_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, role, created_at FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(User {
                            id: get_uuid(row, 0)?,
                            username: row.get(1)?,
                            role: role_from_row(row, 2)?,
                            created_at: get_time(row, 3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Consultant profiles --

    pub fn get_consultant_profile(&self, user_id: Uuid) -> Result<Option<ConsultantProfile>> {
        self.with_conn(|conn| query_consultant_profile(conn, user_id))
    }

    pub fn set_consultant_status(&self, user_id: Uuid, status: ConsultantStatus) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE consultant_profiles SET status = ?1 WHERE user_id = ?2",
                (status.as_str(), user_id.to_string()),
            )?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        consultation_id: Uuid,
        sender_role: Role,
        content: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            consultation_id,
            sender_role,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        };
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, consultation_id, sender_role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id.to_string(),
                    consultation_id.to_string(),
                    sender_role.as_str(),
                    message.content,
                    timestamp_text(message.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(message)
    }

    /// Oldest first, capped at `limit`.
    pub fn get_messages(&self, consultation_id: Uuid, limit: u32) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, consultation_id, sender_role, content, created_at
                 FROM messages
                 WHERE consultation_id = ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![consultation_id.to_string(), limit],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn query_consultant_profile(
    conn: &Connection,
    user_id: Uuid,
) -> Result<Option<ConsultantProfile>> {
    let row = conn
        .query_row(
            "SELECT user_id, price_per_minute, status FROM consultant_profiles WHERE user_id = ?1",
            [user_id.to_string()],
            |row| {
                Ok(ConsultantProfile {
                    user_id: get_uuid(row, 0)?,
                    price_per_minute: get_decimal(row, 1)?,
                    status: consultant_status_from_row(row, 2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
