//! Retry helper for SQLite lock contention.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1000;

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), by code or by message.
fn is_sqlite_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let (code, message) = match sqlx_err {
        sqlx::Error::Database(db_err) => (
            db_err.code().map(Cow::into_owned),
            db_err.message().to_ascii_lowercase(),
        ),
        other => (None, other.to_string().to_ascii_lowercase()),
    };

    matches!(code.as_deref(), Some("5") | Some("6"))
        || message.contains("database is locked")
        || message.contains("database is busy")
}

fn busy_delay(attempt: u32) -> Duration {
    let base = BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (base / 4 + 1);
    Duration::from_millis((base + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Re-run `op` while SQLite reports the database as busy or locked.
///
/// Any other error is returned on the first occurrence.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = busy_delay(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
