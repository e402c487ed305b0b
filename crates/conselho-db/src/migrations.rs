use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const LATEST_VERSION: u32 = 2;

pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

/// Bring the schema up to [`LATEST_VERSION`]. Each step runs in its own
/// transaction together with its `schema_version` row.
pub fn run(conn: &mut Connection) -> Result<u32> {
    let mut version = current_version(conn)?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        let tx = conn.transaction()?;
        tx.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                role        TEXT NOT NULL CHECK (role IN ('client', 'consultant')),
                created_at  TEXT NOT NULL
            );

            CREATE TABLE consultant_profiles (
                user_id           TEXT PRIMARY KEY REFERENCES users(id),
                price_per_minute  TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'online'
                                  CHECK (status IN ('online', 'busy', 'offline'))
            );

            CREATE TABLE ledger_accounts (
                user_id  TEXT PRIMARY KEY REFERENCES users(id),
                balance  TEXT NOT NULL DEFAULT '0.00'
            );

            CREATE TABLE credits_transactions (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                id             TEXT NOT NULL UNIQUE,
                user_id        TEXT NOT NULL REFERENCES users(id),
                type           TEXT NOT NULL CHECK (type IN ('add', 'debit')),
                amount         TEXT NOT NULL,
                balance_after  TEXT NOT NULL,
                reference_id   TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );

            CREATE INDEX idx_credits_transactions_user
                ON credits_transactions(user_id, seq);

            CREATE TABLE consultations (
                id                         TEXT PRIMARY KEY,
                client_id                  TEXT NOT NULL REFERENCES users(id),
                consultant_id              TEXT NOT NULL REFERENCES users(id),
                started_at                 TEXT NOT NULL,
                ended_at                   TEXT,
                status                     TEXT NOT NULL
                                           CHECK (status IN ('active', 'ended', 'cancelled')),
                price_per_minute_snapshot  TEXT NOT NULL,
                total_charged              TEXT NOT NULL DEFAULT '0.00'
            );

            CREATE UNIQUE INDEX idx_consultations_one_active_per_client
                ON consultations(client_id) WHERE status = 'active';

            CREATE INDEX idx_consultations_consultant
                ON consultations(consultant_id, status);

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                consultation_id  TEXT NOT NULL REFERENCES consultations(id),
                sender_role      TEXT NOT NULL CHECK (sender_role IN ('client', 'consultant')),
                content          TEXT NOT NULL,
                created_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_consultation
                ON messages(consultation_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
        tx.commit()?;
        version = 1;
    }

    if version < 2 {
        info!("Running migration v2 (append-only ledger)");
        let tx = conn.transaction()?;
        tx.execute_batch(
            "
            CREATE TRIGGER credits_transactions_no_update
                BEFORE UPDATE ON credits_transactions
            BEGIN
                SELECT RAISE(ABORT, 'credits_transactions is append-only');
            END;

            CREATE TRIGGER credits_transactions_no_delete
                BEFORE DELETE ON credits_transactions
            BEGIN
                SELECT RAISE(ABORT, 'credits_transactions is append-only');
            END;

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
        tx.commit()?;
        version = 2;
    }

    info!("Database schema at v{}", version);
    Ok(version)
}
