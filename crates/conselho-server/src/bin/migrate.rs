//! Apply pending schema migrations to the configured database and exit.

use std::path::PathBuf;

use tracing::info;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conselho=info".into()),
        )
        .init();

    // Only the database path matters here; no secret is needed to migrate.
    let db_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONSELHO_DB_PATH").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("conselho.db"));

    info!("Migrating {}", db_path.display());
    let version = conselho_db::migrate(&db_path)?;
    info!("Schema is at v{}", version);
    Ok(())
}
