//! SQLite connection pool.
//!
//! Storage calls are sync Diesel on an r2d2 pool, moved onto the blocking
//! thread pool so workers can await them.

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::result::DatabaseErrorKind;

pub type DieselError = diesel::result::Error;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

const POOL_SIZE: u32 = 10;

/// WAL plus a busy timeout: writers on different aggregates queue on the
/// database lock instead of failing with SQLITE_BUSY.
const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 30000;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
";

#[derive(Debug, Clone, Copy)]
struct Pragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for Pragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(PRAGMAS)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open a pool on the database file at `db_path`.
pub fn create_diesel_pool(db_path: &Path) -> Result<SqlitePool, diesel::r2d2::PoolError> {
    create_diesel_pool_from_url(&db_path.display().to_string())
}

/// Open a pool from a path or `sqlite:` URL.
pub fn create_diesel_pool_from_url(
    database_url: &str,
) -> Result<SqlitePool, diesel::r2d2::PoolError> {
    let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
    Pool::builder()
        .max_size(POOL_SIZE)
        .connection_timeout(Duration::from_secs(30))
        .connection_customizer(Box::new(Pragmas))
        .build(ConnectionManager::<SqliteConnection>::new(path))
}

/// Run `f` with a pooled connection on the blocking thread pool.
pub async fn run_blocking<F, T>(pool: SqlitePool, f: F) -> Result<T, DieselError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DieselError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(unavailable)?;
        f(&mut conn)
    })
    .await
    .map_err(unavailable)?
}

fn unavailable(err: impl ToString) -> DieselError {
    DieselError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(err.to_string()))
}
