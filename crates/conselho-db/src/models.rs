//! Row decoding helpers. SQLite stores ids, money and timestamps as TEXT; these
//! turn them back into typed values, reporting corrupt cells as conversion
//! errors instead of panicking.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use conselho_types::models::{
    ChatMessage, Consultation, ConsultationStatus, LedgerTransaction, Role, TransactionKind,
};
use rusqlite::Row;
use rusqlite::types::Type;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Auth row, including the password hash. Never leaves the server.
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password: String,
    pub role: Role,
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn get_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| conversion_error(idx, format!("bad uuid '{}': {}", raw, e)))
}

pub(crate) fn get_decimal(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| conversion_error(idx, format!("bad decimal '{}': {}", raw, e)))
}

pub(crate) fn get_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw)))
}

pub(crate) fn get_opt_time(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw))),
    }
}

fn get_enum<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unexpected value '{}'", raw)))
}

/// Accepts RFC 3339 and SQLite's own `datetime('now')` format, which has no
/// timezone and is UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering.
pub(crate) fn timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn now_text() -> String {
    timestamp_text(Utc::now())
}

/// Money is kept at two decimal places everywhere it is stored.
pub fn cents(mut value: Decimal) -> Decimal {
    value.rescale(2);
    value
}

pub(crate) const CONSULTATION_COLUMNS: &str = "id, client_id, consultant_id, started_at, ended_at, status, price_per_minute_snapshot, total_charged";

pub(crate) fn consultation_from_row(row: &Row) -> rusqlite::Result<Consultation> {
    Ok(Consultation {
        id: get_uuid(row, 0)?,
        client_id: get_uuid(row, 1)?,
        consultant_id: get_uuid(row, 2)?,
        started_at: get_time(row, 3)?,
        ended_at: get_opt_time(row, 4)?,
        status: get_enum(row, 5, ConsultationStatus::parse)?,
        price_per_minute_snapshot: get_decimal(row, 6)?,
        total_charged: get_decimal(row, 7)?,
    })
}

pub(crate) const TRANSACTION_COLUMNS: &str =
    "id, user_id, type, amount, balance_after, reference_id, created_at";

pub(crate) fn transaction_from_row(row: &Row) -> rusqlite::Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: get_uuid(row, 0)?,
        user_id: get_uuid(row, 1)?,
        kind: get_enum(row, 2, TransactionKind::parse)?,
        amount: get_decimal(row, 3)?,
        balance_after: get_decimal(row, 4)?,
        reference_id: row.get(5)?,
        created_at: get_time(row, 6)?,
    })
}

pub(crate) fn message_from_row(row: &Row) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: get_uuid(row, 0)?,
        consultation_id: get_uuid(row, 1)?,
        sender_role: get_enum(row, 2, Role::parse)?,
        content: row.get(3)?,
        created_at: get_time(row, 4)?,
    })
}

pub(crate) fn user_from_row(row: &Row) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: get_uuid(row, 0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        role: get_enum(row, 3, Role::parse)?,
    })
}

pub(crate) fn role_from_row(row: &Row, idx: usize) -> rusqlite::Result<Role> {
    get_enum(row, idx, Role::parse)
}

pub(crate) fn consultant_status_from_row(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<conselho_types::models::ConsultantStatus> {
    get_enum(row, idx, conselho_types::models::ConsultantStatus::parse)
}
