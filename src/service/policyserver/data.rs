use ruma::OwnedEventId;
use rusqlite::OptionalExtension;

use crate::{db::Pool, Result};

/// Persisted side of the signing cache: a signature once issued must be
/// retrievable across restarts, per the persistent-variant decision.
pub trait Data: Send + Sync {
    fn get_signature(&self, event_id: &OwnedEventId) -> Result<Option<String>>;
    fn put_signature(&self, event_id: &OwnedEventId, signature_b64: &str) -> Result<()>;
}

pub struct SqliteData {
    pub pool: &'static Pool,
}

impl Data for SqliteData {
    fn get_signature(&self, event_id: &OwnedEventId) -> Result<Option<String>> {
        self.pool.with_reader(|conn| {
            conn.query_row(
                "SELECT signature FROM policy_server_signature WHERE event_id = ?1",
                [event_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    fn put_signature(&self, event_id: &OwnedEventId, signature_b64: &str) -> Result<()> {
        self.pool.with_writer(|conn| {
            conn.execute(
                "INSERT INTO policy_server_signature (event_id, signature, created_at_ms) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(event_id) DO UPDATE SET signature = excluded.signature",
                rusqlite::params![
                    event_id.as_str(),
                    signature_b64,
                    crate::utils::millis_since_unix_epoch() as i64
                ],
            )?;
            Ok(())
        })
    }
}
