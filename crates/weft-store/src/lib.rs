pub mod recipes;
pub mod runs;

pub use recipes::SqliteRecipeStore;
pub use runs::SqliteRunStore;

use std::path::Path;

use rusqlite::Connection;
use weft_core::{Result, WeftError};

/// Open (or create) a database file with the pragmas every store uses.
fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )
    .map_err(db_err)?;
    Ok(conn)
}

fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}
