//! SQLite-backed storage adapter.

use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    component_hash, CollisionGroup, CollisionResult, HealthStatus, PendingComponent, RecoveredKey,
    RecoveredNonce, Stats, Storage, StorageError, TxInput, TxRef,
};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`. Accepts a bare filesystem
    /// path, a `sqlite://` URL, or `:memory:`.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let path = path
            .strip_prefix("sqlite://")
            .or_else(|| path.strip_prefix("sqlite:"))
            .unwrap_or(path);
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::Backend(e.to_string()))?;
                }
            }
            Connection::open(path)?
        };

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.lock().execute_batch(
            r#"
            -- First-seen witness per R value.
            CREATE TABLE IF NOT EXISTS r_value_index (
                r_value TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                chain_id INTEGER NOT NULL
            );

            -- Every later occurrence of an already-seen R.
            CREATE TABLE IF NOT EXISTS collisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                r_value TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                address TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(r_value, tx_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_collisions_r_value ON collisions(r_value);

            CREATE TABLE IF NOT EXISTS scan_state (
                chain_id INTEGER PRIMARY KEY,
                last_block INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recovered_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                private_key TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                r_values TEXT NOT NULL,
                tx_hashes TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(address, chain_id)
            );
            CREATE INDEX IF NOT EXISTS idx_recovered_keys_address ON recovered_keys(address);

            CREATE TABLE IF NOT EXISTS recovered_nonces (
                r_value TEXT PRIMARY KEY,
                k_value TEXT NOT NULL,
                derived_from_key_id INTEGER REFERENCES recovered_keys(id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_components (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                component_hash TEXT UNIQUE NOT NULL,
                r_values TEXT NOT NULL,
                tx_hashes TEXT NOT NULL,
                addresses TEXT NOT NULL,
                chain_ids TEXT NOT NULL,
                equations INTEGER NOT NULL,
                unknowns INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Invalid(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Backend(e.to_string()))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn batch_check_and_insert(
        &self,
        txs: &[TxInput],
    ) -> Result<Vec<CollisionResult>, StorageError> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        let mut collisions = Vec::new();
        {
            let mut select_witness = tx.prepare_cached(
                "SELECT tx_hash, chain_id FROM r_value_index WHERE r_value = ?1",
            )?;
            let mut insert_witness = tx.prepare_cached(
                "INSERT INTO r_value_index (r_value, tx_hash, chain_id) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_collision = tx.prepare_cached(
                "INSERT INTO collisions (r_value, tx_hash, chain_id, address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(r_value, tx_hash) DO NOTHING",
            )?;

            for input in txs {
                let witness: Option<(String, u64)> = select_witness
                    .query_row(params![input.r_value], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;

                match witness {
                    None => {
                        insert_witness.execute(params![
                            input.r_value,
                            input.tx_hash,
                            input.chain_id
                        ])?;
                    }
                    Some((witness_tx, witness_chain)) => {
                        if witness_tx.eq_ignore_ascii_case(&input.tx_hash) {
                            continue;
                        }
                        let inserted = insert_collision.execute(params![
                            input.r_value,
                            input.tx_hash,
                            input.chain_id,
                            input.address,
                            now_rfc3339()
                        ])?;
                        if inserted > 0 {
                            collisions.push(CollisionResult {
                                r_value: input.r_value.clone(),
                                tx_hash: input.tx_hash.clone(),
                                chain_id: input.chain_id,
                                address: input.address.clone(),
                                first_tx: TxRef {
                                    tx_hash: witness_tx,
                                    chain_id: witness_chain,
                                },
                            });
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(collisions)
    }

    async fn save_recovered_key(&self, key: &RecoveredKey) -> Result<i64, StorageError> {
        let conn = self.conn.lock();
        let id = conn.query_row(
            r#"INSERT INTO recovered_keys (address, private_key, chain_id, r_values, tx_hashes, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(address, chain_id) DO UPDATE SET
                 private_key = excluded.private_key,
                 r_values = excluded.r_values,
                 tx_hashes = excluded.tx_hashes
               RETURNING id"#,
            params![
                key.address,
                key.private_key,
                key.chain_id,
                to_json(&key.r_values)?,
                to_json(&key.tx_hashes)?,
                now_rfc3339()
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    async fn get_recovered_keys(&self) -> Result<Vec<RecoveredKey>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, address, private_key, chain_id, r_values, tx_hashes, created_at
             FROM recovered_keys ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (id, address, private_key, chain_id, r_values, tx_hashes, created_at) = row?;
            keys.push(RecoveredKey {
                id,
                address,
                private_key,
                chain_id,
                r_values: from_json(&r_values)?,
                tx_hashes: from_json(&tx_hashes)?,
                created_at,
            });
        }
        Ok(keys)
    }

    async fn is_key_recovered(&self, address: &str, chain_id: u64) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM recovered_keys WHERE address = ?1 AND chain_id = ?2",
            params![address.to_lowercase(), chain_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn save_recovered_nonce(&self, nonce: &RecoveredNonce) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO recovered_nonces (r_value, k_value, derived_from_key_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(r_value) DO UPDATE SET k_value = excluded.k_value",
            params![
                nonce.r_value,
                nonce.k_value,
                nonce.derived_from_key_id,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn get_recovered_nonce(
        &self,
        r_value: &str,
    ) -> Result<Option<RecoveredNonce>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT k_value, derived_from_key_id FROM recovered_nonces WHERE r_value = ?1",
                params![r_value],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(k_value, derived_from_key_id)| RecoveredNonce {
            r_value: r_value.to_string(),
            k_value,
            derived_from_key_id,
        }))
    }

    async fn get_recovered_nonces(&self) -> Result<Vec<RecoveredNonce>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r_value, k_value, derived_from_key_id FROM recovered_nonces",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RecoveredNonce {
                r_value: row.get(0)?,
                k_value: row.get(1)?,
                derived_from_key_id: row.get(2)?,
            })
        })?;
        let mut nonces = Vec::new();
        for row in rows {
            nonces.push(row?);
        }
        Ok(nonces)
    }

    async fn has_cross_key_potential(
        &self,
        r_value: &str,
        exclude_address: &str,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(DISTINCT address) FROM collisions
             WHERE r_value = ?1 AND address IS NOT NULL AND address != '' AND address != ?2",
            params![r_value, exclude_address.to_lowercase()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn save_pending_component(&self, comp: &PendingComponent) -> Result<i64, StorageError> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let id = conn.query_row(
            r#"INSERT INTO pending_components
               (component_hash, r_values, tx_hashes, addresses, chain_ids, equations, unknowns, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
               ON CONFLICT(component_hash) DO UPDATE SET
                 tx_hashes = excluded.tx_hashes,
                 addresses = excluded.addresses,
                 chain_ids = excluded.chain_ids,
                 equations = excluded.equations,
                 unknowns = excluded.unknowns,
                 updated_at = excluded.updated_at
               RETURNING id"#,
            params![
                component_hash(&comp.r_values),
                to_json(&comp.r_values)?,
                to_json(&comp.tx_hashes)?,
                to_json(&comp.addresses)?,
                to_json(&comp.chain_ids)?,
                comp.equations,
                comp.unknowns,
                now
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    async fn get_pending_components(&self) -> Result<Vec<PendingComponent>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, r_values, tx_hashes, addresses, chain_ids, equations, unknowns
             FROM pending_components ORDER BY equations - unknowns DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
            ))
        })?;

        let mut comps = Vec::new();
        for row in rows {
            let (id, r_values, tx_hashes, addresses, chain_ids, equations, unknowns) = row?;
            comps.push(PendingComponent {
                id,
                r_values: from_json(&r_values)?,
                tx_hashes: from_json(&tx_hashes)?,
                addresses: from_json(&addresses)?,
                chain_ids: from_json(&chain_ids)?,
                equations,
                unknowns,
            });
        }
        Ok(comps)
    }

    async fn delete_pending_component(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM pending_components WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn get_all_collisions(&self) -> Result<Vec<CollisionGroup>, StorageError> {
        let conn = self.conn.lock();
        let mut r_stmt =
            conn.prepare("SELECT DISTINCT r_value FROM collisions ORDER BY r_value")?;
        let r_values: Vec<String> = r_stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut groups = Vec::new();
        let mut witness_stmt =
            conn.prepare("SELECT tx_hash, chain_id FROM r_value_index WHERE r_value = ?1")?;
        let mut refs_stmt =
            conn.prepare("SELECT tx_hash, chain_id FROM collisions WHERE r_value = ?1")?;
        for r_value in r_values {
            let mut tx_refs = Vec::new();
            if let Some((tx_hash, chain_id)) = witness_stmt
                .query_row(params![r_value], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?
            {
                tx_refs.push(TxRef { tx_hash, chain_id });
            }
            let rows = refs_stmt.query_map(params![r_value], |row| {
                Ok(TxRef {
                    tx_hash: row.get(0)?,
                    chain_id: row.get(1)?,
                })
            })?;
            for row in rows {
                tx_refs.push(row?);
            }
            groups.push(CollisionGroup { r_value, tx_refs });
        }
        Ok(groups)
    }

    async fn get_last_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                "SELECT last_block FROM scan_state WHERE chain_id = ?1",
                params![chain_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block)
    }

    async fn save_last_block(&self, chain_id: u64, block: u64) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scan_state (chain_id, last_block, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id) DO UPDATE SET
               last_block = excluded.last_block, updated_at = excluded.updated_at",
            params![chain_id, block, now_rfc3339()],
        )?;
        Ok(())
    }

    async fn get_stats(&self) -> Result<Stats, StorageError> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<u64, StorageError> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(Stats {
            total_r_values: count("SELECT COUNT(*) FROM r_value_index")?,
            total_collisions: count("SELECT COUNT(DISTINCT r_value) FROM collisions")?,
            pending_components: count("SELECT COUNT(*) FROM pending_components")?,
            recovered_keys: count("SELECT COUNT(*) FROM recovered_keys")?,
            recovered_nonces: count("SELECT COUNT(*) FROM recovered_nonces")?,
            healthy: true,
        })
    }

    async fn health(&self) -> HealthStatus {
        let start = Instant::now();
        let result: Result<i64, _> = self.conn.lock().query_row("SELECT 1", [], |row| row.get(0));
        let latency_ms = start.elapsed().as_millis() as i64;
        match result {
            Ok(_) => HealthStatus {
                connected: true,
                latency_ms,
                open_connections: 1,
                error: None,
            },
            Err(e) => HealthStatus {
                connected: false,
                latency_ms,
                open_connections: 0,
                error: Some(e.to_string()),
            },
        }
    }
}
