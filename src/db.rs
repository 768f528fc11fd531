use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, DatabaseName::Main};

use crate::Result;

/// A small connection pool over the sqlite file backing the action log and
/// policy-server signature tables: one writer connection behind a mutex, a
/// handful of reader connections picked round-robin, matching the teacher's
/// sqlite abstraction but scaled down to the three tables this crate needs.
pub struct Pool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    path: PathBuf,
}

enum HoldingConn<'a> {
    FromGuard(MutexGuard<'a, Connection>),
    FromOwned(Connection),
}

impl Deref for HoldingConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            HoldingConn::FromGuard(guard) => guard,
            HoldingConn::FromOwned(conn) => conn,
        }
    }
}

impl Pool {
    pub fn open<P: AsRef<Path>>(path: P, num_readers: usize) -> Result<Self> {
        let writer = Mutex::new(Self::prepare_conn(&path)?);

        let mut readers = Vec::with_capacity(num_readers);
        for _ in 0..num_readers.max(1) {
            readers.push(Mutex::new(Self::prepare_conn(&path)?));
        }

        let pool = Self {
            writer,
            readers,
            path: path.as_ref().to_path_buf(),
        };
        pool.migrate()?;
        Ok(pool)
    }

    fn prepare_conn<P: AsRef<Path>>(path: P) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(Some(Main), "journal_mode", "WAL")?;
        conn.pragma_update(Some(Main), "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.write_lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS taken_action (
                target_user TEXT NOT NULL,
                in_room_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                source_policy_room_id TEXT NOT NULL,
                rule_entity TEXT NOT NULL,
                recommendation TEXT NOT NULL,
                taken_at_ms INTEGER NOT NULL,
                PRIMARY KEY (target_user, in_room_id, action_type)
            );
            CREATE INDEX IF NOT EXISTS taken_action_by_policy_room
                ON taken_action (source_policy_room_id);
            CREATE INDEX IF NOT EXISTS taken_action_by_rule_entity
                ON taken_action (rule_entity);
            CREATE TABLE IF NOT EXISTS policy_server_signature (
                event_id TEXT PRIMARY KEY,
                signature TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            ",
        )?;

        let version: u64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| {
            row.get(0)
        })?;
        if version == 0 {
            conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        }

        Ok(())
    }

    pub fn write_lock(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    fn read_lock(&self) -> HoldingConn<'_> {
        for reader in &self.readers {
            if let Some(guard) = reader.try_lock() {
                return HoldingConn::FromGuard(guard);
            }
        }

        tracing::warn!("all sqlite readers locked, opening a spillover connection");
        let spilled = Self::prepare_conn(&self.path).expect("spillover connection must open");
        HoldingConn::FromOwned(spilled)
    }

    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.read_lock())
    }

    pub fn with_writer<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.write_lock())
    }
}
