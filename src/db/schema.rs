use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Ordered schema steps. Versions are applied once each, in order.
const MIGRATIONS: &[(u32, &str, &str)] = &[
    (1, "initial", include_str!("migrations/001_initial.sql")),
    (2, "reference_data", include_str!("migrations/002_reference_data.sql")),
    (3, "mine_banking", include_str!("migrations/003_mine_banking.sql")),
    (4, "player_sessions", include_str!("migrations/004_player_sessions.sql")),
    (5, "chat_messages", include_str!("migrations/005_chat_messages.sql")),
];

/// Bring the schema up to date. Returns the versions applied by this call.
pub fn run_migrations(conn: &Connection) -> Result<Vec<u32>> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .context("Failed to create schema_migrations table")?;

    let current = current_version(conn)?;
    let latest = MIGRATIONS.last().map_or(0, |(version, _, _)| *version);
    if current > latest {
        bail!(
            "Database schema version {} is newer than this build supports ({})",
            current,
            latest
        );
    }

    let mut applied = Vec::new();
    for &(version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "Applying migration");

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("Failed to apply migration {:03}_{}", version, name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            (version, name, chrono::Utc::now().to_rfc3339()),
        )?;
        tx.commit()?;

        applied.push(version);
    }

    Ok(applied)
}

fn current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn fresh_database_gets_every_version() {
        let conn = Connection::open_in_memory().unwrap();

        let applied = run_migrations(&conn).unwrap();

        assert_eq!(applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(current_version(&conn).unwrap(), 5);
        assert_eq!(table_count(&conn, "placeables"), 0);
    }

    #[test]
    fn rerun_applies_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert!(run_migrations(&conn).unwrap().is_empty());
        // reference rows are seeded exactly once
        assert_eq!(table_count(&conn, "blueprints"), 8);
    }

    #[test]
    fn refuses_a_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', '')",
            [],
        )
        .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }
}
