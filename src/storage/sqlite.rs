//! SQLite permanent database.

use super::{PermanentDatabase, StorageError, StorageResult, TempDatabase};
use crate::base::{Hash, Height};
use crate::block::BlockMap;
use crate::consensus::{SuffrageProof, Voteproof};
use crate::state::State;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

fn decode<T: DeserializeOwned>(body: &str) -> StorageResult<T> {
    Ok(serde_json::from_str(body)?)
}

pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let db = SqliteDatabase {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let db = SqliteDatabase {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blockmaps (
                height        INTEGER PRIMARY KEY,
                manifest_hash TEXT NOT NULL UNIQUE,
                body          TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS states (
                key      TEXT NOT NULL,
                height   INTEGER NOT NULL,
                hash     TEXT NOT NULL,
                body     TEXT NOT NULL,
                PRIMARY KEY (key, height)
            );
            CREATE TABLE IF NOT EXISTS suffrage_history (
                suffrage_height INTEGER PRIMARY KEY,
                height          INTEGER NOT NULL,
                state_hash      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS suffrage_proofs (
                suffrage_height INTEGER PRIMARY KEY,
                height          INTEGER NOT NULL,
                body            TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS operations_in_state (
                fact   TEXT PRIMARY KEY,
                height INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS operations_known (
                operation TEXT PRIMARY KEY,
                height    INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS voteproofs (
                height INTEGER PRIMARY KEY,
                init   TEXT NOT NULL,
                accept TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suffrage_proofs_height ON suffrage_proofs(height);",
        )?;
        Ok(())
    }

    fn query_body(&self, sql: &str, params: impl rusqlite::Params) -> StorageResult<Option<String>> {
        let conn = self.conn.lock();
        let body = conn
            .query_row(sql, params, |row| row.get::<_, String>(0))
            .optional()?;
        Ok(body)
    }

    /// Height of the last committed block.
    pub fn last_height(&self) -> StorageResult<Option<Height>> {
        let conn = self.conn.lock();
        let h: Option<i64> = conn.query_row("SELECT MAX(height) FROM blockmaps", [], |row| row.get(0))?;
        Ok(h.map(Height::new))
    }
}

impl PermanentDatabase for SqliteDatabase {
    fn last_blockmap(&self) -> StorageResult<Option<BlockMap>> {
        self.query_body("SELECT body FROM blockmaps ORDER BY height DESC LIMIT 1", [])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn blockmap(&self, height: Height) -> StorageResult<Option<BlockMap>> {
        self.query_body("SELECT body FROM blockmaps WHERE height = ?1", [height.get()])?
            .map(|b| decode(&b))
            .transpose()
    }

    fn state(&self, key: &str) -> StorageResult<Option<State>> {
        self.query_body(
            "SELECT body FROM states WHERE key = ?1 ORDER BY height DESC LIMIT 1",
            [key],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn state_at(&self, key: &str, height: Height) -> StorageResult<Option<State>> {
        self.query_body(
            "SELECT body FROM states WHERE key = ?1 AND height <= ?2 ORDER BY height DESC LIMIT 1",
            params![key, height.get()],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn suffrage_proof(&self, suffrage_height: Height) -> StorageResult<Option<SuffrageProof>> {
        self.query_body(
            "SELECT body FROM suffrage_proofs WHERE suffrage_height = ?1",
            [suffrage_height.get()],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn last_suffrage_proof(&self) -> StorageResult<Option<SuffrageProof>> {
        self.query_body(
            "SELECT body FROM suffrage_proofs ORDER BY suffrage_height DESC LIMIT 1",
            [],
        )?
        .map(|b| decode(&b))
        .transpose()
    }

    fn exists_in_state_operation(&self, fact: &Hash) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM operations_in_state WHERE fact = ?1",
                [fact.to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn exists_known_operation(&self, operation: &Hash) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM operations_known WHERE operation = ?1",
                [operation.to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn voteproofs(&self, height: Height) -> StorageResult<Option<(Voteproof, Voteproof)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT init, accept FROM voteproofs WHERE height = ?1",
                [height.get()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((init, accept)) => Ok(Some((decode(&init)?, decode(&accept)?))),
            None => Ok(None),
        }
    }

    fn merge_temp_database(&self, temp: &TempDatabase) -> StorageResult<()> {
        temp.is_complete()?;
        let blockmap = temp
            .blockmap()
            .ok_or_else(|| StorageError::NotFound("staged blockmap".to_string()))?;
        let height = temp.height();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT manifest_hash FROM blockmaps WHERE height = ?1",
                [height.get()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            if existing == blockmap.manifest.hash.to_hex() {
                debug!(height = %height, "block already merged");
                return Ok(());
            }
            return Err(StorageError::AlreadyExists(format!(
                "different block at height {height}"
            )));
        }

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT height, manifest_hash FROM blockmaps ORDER BY height DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let expected = last.as_ref().map_or(Height::GENESIS, |(h, _)| Height::new(*h).next());
        if height != expected {
            return Err(StorageError::HeightMismatch {
                expected,
                found: height,
            });
        }
        if let Some((_, last_hash)) = &last {
            let previous = blockmap.manifest.previous.map(|h| h.to_hex());
            if previous.as_deref() != Some(last_hash.as_str()) {
                return Err(StorageError::InvalidData(format!(
                    "block {height} does not follow the last block"
                )));
            }
        }

        tx.execute(
            "INSERT INTO blockmaps (height, manifest_hash, body) VALUES (?1, ?2, ?3)",
            params![
                height.get(),
                blockmap.manifest.hash.to_hex(),
                serde_json::to_string(blockmap)?
            ],
        )?;

        for st in temp.states() {
            tx.execute(
                "INSERT INTO states (key, height, hash, body) VALUES (?1, ?2, ?3, ?4)",
                params![st.key, st.height.get(), st.hash.to_hex(), serde_json::to_string(st)?],
            )?;
        }

        for fact in temp.operations_in_state() {
            tx.execute(
                "INSERT OR IGNORE INTO operations_in_state (fact, height) VALUES (?1, ?2)",
                params![fact.to_hex(), height.get()],
            )?;
        }
        for op in temp.operations_known() {
            tx.execute(
                "INSERT OR IGNORE INTO operations_known (operation, height) VALUES (?1, ?2)",
                params![op.to_hex(), height.get()],
            )?;
        }

        if let Some((init, accept)) = temp.voteproofs() {
            tx.execute(
                "INSERT INTO voteproofs (height, init, accept) VALUES (?1, ?2, ?3)",
                params![
                    height.get(),
                    serde_json::to_string(init)?,
                    serde_json::to_string(accept)?
                ],
            )?;
        }

        if let Some(proof) = temp.suffrage_proof() {
            let suffrage_height = proof.suffrage_height().get();
            tx.execute(
                "INSERT INTO suffrage_history (suffrage_height, height, state_hash) VALUES (?1, ?2, ?3)",
                params![suffrage_height, height.get(), proof.state.hash.to_hex()],
            )?;
            tx.execute(
                "INSERT INTO suffrage_proofs (suffrage_height, height, body) VALUES (?1, ?2, ?3)",
                params![suffrage_height, height.get(), serde_json::to_string(proof)?],
            )?;
        }

        tx.commit()?;
        info!(
            height = %height,
            block = %blockmap.manifest.hash,
            states = temp.states().count(),
            "block merged into permanent database"
        );
        Ok(())
    }
}
