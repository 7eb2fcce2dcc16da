use crate::infrastructure::error::InfraError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the state database. The daemon and the admin CLI share it, so writers wait briefly
/// instead of failing on a held lock.
pub fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = open_connection(path)?;
    let _mode: String =
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_reapplied_without_error() {
        let dir = std::env::temp_dir().join(format!("netcurfew-storage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("state.sqlite");

        initialize_database(&path).expect("first init");
        initialize_database(&path).expect("second init");

        let connection = open_connection(&path).expect("open");
        let tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv_state'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(tables, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
