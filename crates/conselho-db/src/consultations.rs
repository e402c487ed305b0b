use chrono::Utc;
use conselho_types::models::{Consultation, ConsultantStatus, ConsultationStatus};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::Database;
use crate::models::{CONSULTATION_COLUMNS, cents, consultation_from_row, timestamp_text};
use crate::queries::query_consultant_profile;

#[derive(Debug, thiserror::Error)]
pub enum ConsultationError {
    #[error("consultation not found")]
    NotFound,

    #[error("not a participant of this consultation")]
    NotParticipant,

    #[error("consultation is not active")]
    NotActive,

    #[error("consultant not found")]
    ConsultantNotFound,

    #[error("consultant is not available")]
    ConsultantUnavailable,

    #[error("client already has an active consultation ({0})")]
    AlreadyActive(Uuid),

    #[error("consultation store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ConsultationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.into())
    }
}

impl Database {
    /// Open a consultation between `client_id` and an online consultant,
    /// snapshotting the consultant's current rate. The consultant is marked
    /// busy until the consultation ends.
    pub fn start_consultation(
        &self,
        client_id: Uuid,
        consultant_id: Uuid,
    ) -> Result<Consultation, ConsultationError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let profile = match query_consultant_profile(&tx, consultant_id)? {
                Some(profile) => profile,
                None => return Ok(Err(ConsultationError::ConsultantNotFound)),
            };
            if profile.status != ConsultantStatus::Online {
                return Ok(Err(ConsultationError::ConsultantUnavailable));
            }
            if let Some(existing) = query_active_for_client(&tx, client_id)? {
                return Ok(Err(ConsultationError::AlreadyActive(existing)));
            }

            let consultation = Consultation {
                id: Uuid::new_v4(),
                client_id,
                consultant_id,
                started_at: Utc::now(),
                ended_at: None,
                status: ConsultationStatus::Active,
                price_per_minute_snapshot: cents(profile.price_per_minute),
                total_charged: cents(Decimal::ZERO),
            };
            insert_consultation(&tx, &consultation)?;
            tx.execute(
                "UPDATE consultant_profiles SET status = 'busy' WHERE user_id = ?1",
                [consultant_id.to_string()],
            )?;
            tx.commit()?;

            info!(
                "Consultation {} started: client {} with consultant {} at {}/min",
                consultation.id, client_id, consultant_id, consultation.price_per_minute_snapshot
            );
            Ok(Ok(consultation))
        })?
    }

    pub fn get_consultation(&self, id: Uuid) -> anyhow::Result<Option<Consultation>> {
        self.with_conn(|conn| query_consultation(conn, id))
    }

    /// Load a consultation on behalf of `user_id`, who must take part in it.
    pub fn consultation_for_participant(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Consultation, ConsultationError> {
        let consultation = self
            .get_consultation(id)?
            .ok_or(ConsultationError::NotFound)?;
        if consultation.role_of(user_id).is_none() {
            return Err(ConsultationError::NotParticipant);
        }
        Ok(consultation)
    }

    /// The active consultation `user_id` takes part in, on either side.
    pub fn active_consultation_for(&self, user_id: Uuid) -> anyhow::Result<Option<Consultation>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM consultations
                         WHERE (client_id = ?1 OR consultant_id = ?1) AND status = 'active'
                         ORDER BY started_at DESC
                         LIMIT 1",
                        CONSULTATION_COLUMNS
                    ),
                    [user_id.to_string()],
                    consultation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Mark an active consultation ended and free the consultant. Returns the
    /// updated row, or `None` if it was not active (already ended, cancelled
    /// or unknown), so repeated calls are harmless.
    pub fn end_consultation(&self, id: Uuid) -> anyhow::Result<Option<Consultation>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE consultations SET status = 'ended', ended_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                (timestamp_text(Utc::now()), id.to_string()),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let consultation = query_consultation(&tx, id)?;
            if let Some(c) = &consultation {
                tx.execute(
                    "UPDATE consultant_profiles SET status = 'online'
                     WHERE user_id = ?1 AND status = 'busy'",
                    [c.consultant_id.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(consultation)
        })
    }
}

fn insert_consultation(conn: &Connection, c: &Consultation) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO consultations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            CONSULTATION_COLUMNS
        ),
        rusqlite::params![
            c.id.to_string(),
            c.client_id.to_string(),
            c.consultant_id.to_string(),
            timestamp_text(c.started_at),
            c.ended_at.map(timestamp_text),
            c.status.as_str(),
            cents(c.price_per_minute_snapshot).to_string(),
            cents(c.total_charged).to_string(),
        ],
    )?;
    Ok(())
}

fn query_consultation(conn: &Connection, id: Uuid) -> anyhow::Result<Option<Consultation>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM consultations WHERE id = ?1", CONSULTATION_COLUMNS),
            [id.to_string()],
            consultation_from_row,
        )
        .optional()?;
    Ok(row)
}

fn query_active_for_client(conn: &Connection, client_id: Uuid) -> anyhow::Result<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM consultations WHERE client_id = ?1 AND status = 'active'",
            [client_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.and_then(|s| s.parse().ok()))
}
