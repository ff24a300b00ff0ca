use serde::Serialize;
use sqlx::{Row, SqliteConnection};

use flamenco_core::{Error, IntegrityKind};

/// Result of a startup integrity pass: either clean, or a list of issues
/// that should stop the Manager from serving (§4.1, §7).
#[derive(Clone, Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Run `PRAGMA integrity_check` and `PRAGMA foreign_key_check`, refusing to
/// serve on any finding (§4.1 "on failure, refuse to serve").
pub async fn check_integrity(conn: &mut SqliteConnection) -> flamenco_core::Result<IntegrityReport> {
    let mut issues = Vec::new();

    let rows: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
        .fetch_all(&mut *conn)
        .await?;
    for (message,) in rows {
        if message != "ok" {
            issues.push(message);
        }
    }

    let fk_rows = sqlx::query("PRAGMA foreign_key_check").fetch_all(&mut *conn).await?;
    for row in fk_rows {
        let table: String = row.try_get(0)?;
        issues.push(format!("foreign key violation in table {table}"));
    }

    Ok(IntegrityReport { issues })
}

/// Confirm `PRAGMA foreign_keys` is enabled on this connection, refusing
/// outright if it isn't (§4.1 referential-cascade check).
pub async fn check_foreign_keys_enabled(conn: &mut SqliteConnection) -> flamenco_core::Result<()> {
    let enabled: i64 = sqlx::query("PRAGMA foreign_keys")
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;

    if enabled == 0 {
        return Err(Error::integrity(
            IntegrityKind::Cascade,
            "foreign key enforcement is disabled on this connection",
        ));
    }

    Ok(())
}

/// Truncate the write-ahead log, per the periodic maintenance task in §4.1.
pub async fn checkpoint_wal(conn: &mut SqliteConnection) -> flamenco_core::Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&mut *conn).await?;
    Ok(())
}
