//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`
//! and run exactly once, tracked by the `schema_version` table. Migrations
//! must be additive; destructive changes require an explicit data migration.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Run all pending migrations. Returns the number applied.
///
/// Forward-compat guard: a database written by a newer build refuses to open
/// rather than running against unknown schema.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Database schema version ({}) is newer than this build supports ({}). \
             Update jobmail to the latest version.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;

        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1);
        assert_eq!(current_version(&conn).unwrap(), 1);

        // Key tables exist with their load-bearing columns
        conn.execute(
            "INSERT INTO projects (id, user_id, name, created_at, updated_at)
             VALUES ('p1', 'u1', 'Baker St', '2026-01-01', '2026-01-01')",
            [],
        )
        .expect("projects table should exist");

        conn.execute(
            "INSERT INTO email_project_mappings
                (user_id, project_id, email_id, created_at, updated_at)
             VALUES ('u1', 'p1', 'm1', '2026-01-01', '2026-01-01')",
            [],
        )
        .expect("mappings table should exist");

        conn.execute(
            "INSERT INTO queue_items (queue, user_id, payload, next_visible_at, created_at, updated_at)
             VALUES ('notification', 'u1', '{}', '2026-01-01', '2026-01-01', '2026-01-01')",
            [],
        )
        .expect("queue table should exist");
    }

    #[test]
    fn test_idempotency() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(err.contains("newer than this build"), "got: {}", err);
    }

    #[test]
    fn test_active_mapping_uniqueness_enforced() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO email_project_mappings
                (user_id, project_id, email_id, is_active, created_at, updated_at)
             VALUES ('u1', 'p1', 'm1', 1, '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        // A second active mapping for the same (user, email) must be rejected.
        let dup = conn.execute(
            "INSERT INTO email_project_mappings
                (user_id, project_id, email_id, is_active, created_at, updated_at)
             VALUES ('u1', 'p2', 'm1', 1, '2026-01-02', '2026-01-02')",
            [],
        );
        assert!(dup.is_err());
        // An inactive duplicate is fine (historical record after reassignment).
        conn.execute(
            "INSERT INTO email_project_mappings
                (user_id, project_id, email_id, is_active, created_at, updated_at)
             VALUES ('u1', 'p2', 'm1', 0, '2026-01-02', '2026-01-02')",
            [],
        )
        .unwrap();
    }
}
