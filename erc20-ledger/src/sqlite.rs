//! SQLite ledger store.
//!
//! One database file holds the whole ledger in four tables:
//!
//! ```sql
//! transfers  (block_number, log_index) PK, block_hash, tx_hash,
//!            from_addr, to_addr, value, timestamp
//! balances   address PK, balance
//! checkpoint id = 0, block_number, block_hash, updated_at, minted, burned
//! anchors    block_number PK, block_hash
//! ```
//!
//! Hashes and addresses are lowercase `0x` hex, amounts base-10 text.
//! Each [`Changeset`] is written in a single transaction touching only the
//! rows it names. The database runs in WAL mode with `synchronous=FULL`, so
//! a commit that returned is on disk.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use alloy::primitives::{Address, B256, U256};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::checkpoint::Checkpoint;
use crate::store::{Anchor, BalanceRow, Changeset, Snapshot, Store, StoreError};
use crate::types::TransferEvent;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS transfers (
        block_number INTEGER NOT NULL,
        log_index    INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        tx_hash      TEXT    NOT NULL,
        from_addr    TEXT    NOT NULL,
        to_addr      TEXT    NOT NULL,
        value        TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        PRIMARY KEY (block_number, log_index)
    );
    CREATE UNIQUE INDEX IF NOT EXISTS transfers_identity
        ON transfers (block_hash, tx_hash, log_index);
    CREATE TABLE IF NOT EXISTS balances (
        address TEXT PRIMARY KEY,
        balance TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS checkpoint (
        id           INTEGER PRIMARY KEY CHECK (id = 0),
        block_number INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        updated_at   INTEGER NOT NULL,
        minted       TEXT    NOT NULL,
        burned       TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS anchors (
        block_number INTEGER PRIMARY KEY,
        block_hash   TEXT    NOT NULL
    );";

/// Ledger persisted in a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the parent directory cannot be created
    /// or the database cannot be opened and initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: format!("creating {}", parent.display()),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(sql(format!("opening {}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(sql("configuring journal"))?;
        conn.execute_batch(SCHEMA).map_err(sql("creating tables"))?;

        tracing::debug!(path = %path.display(), "ledger database open");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(tx: &Transaction<'_>, change: &Changeset) -> rusqlite::Result<()> {
        let mut delete = tx.prepare_cached(
            "DELETE FROM transfers WHERE block_number = ?1 AND log_index = ?2",
        )?;
        for event in &change.removed {
            delete.execute(params![int(event.block_number)?, int(event.log_index)?])?;
        }

        let mut insert = tx.prepare_cached(
            "INSERT INTO transfers
                (block_number, log_index, block_hash, tx_hash, from_addr, to_addr, value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for event in &change.inserted {
            insert.execute(params![
                int(event.block_number)?,
                int(event.log_index)?,
                format!("{:#x}", event.block_hash),
                format!("{:#x}", event.tx_hash),
                format!("{:#x}", event.from),
                format!("{:#x}", event.to),
                event.value.to_string(),
                int(event.timestamp)?,
            ])?;
        }

        let mut upsert = tx.prepare_cached(
            "INSERT INTO balances (address, balance) VALUES (?1, ?2)
             ON CONFLICT (address) DO UPDATE SET balance = excluded.balance",
        )?;
        let mut clear = tx.prepare_cached("DELETE FROM balances WHERE address = ?1")?;
        for row in &change.balances {
            let address = format!("{:#x}", row.address);
            if row.balance.is_zero() {
                clear.execute(params![address])?;
            } else {
                upsert.execute(params![address, row.balance.to_string()])?;
            }
        }

        let checkpoint = change.checkpoint;
        tx.prepare_cached(
            "INSERT OR REPLACE INTO checkpoint
                (id, block_number, block_hash, updated_at, minted, burned)
             VALUES (0, ?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            int(checkpoint.block_number)?,
            format!("{:#x}", checkpoint.block_hash),
            int(checkpoint.updated_at)?,
            change.minted.to_string(),
            change.burned.to_string(),
        ])?;

        match (change.anchors.first(), change.anchors.last()) {
            (Some(first), Some(last)) => {
                tx.prepare_cached(
                    "DELETE FROM anchors WHERE block_number < ?1 OR block_number > ?2",
                )?
                .execute(params![int(first.block_number)?, int(last.block_number)?])?;
            }
            _ => {
                tx.execute("DELETE FROM anchors", [])?;
            }
        }
        let mut anchor = tx.prepare_cached(
            "INSERT OR REPLACE INTO anchors (block_number, block_hash) VALUES (?1, ?2)",
        )?;
        for a in &change.anchors {
            anchor.execute(params![int(a.block_number)?, format!("{:#x}", a.block_hash)])?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let Some((number, hash, updated_at, minted, burned)) = conn
            .query_row(
                "SELECT block_number, block_hash, updated_at, minted, burned
                 FROM checkpoint WHERE id = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(sql("reading checkpoint"))?
        else {
            return Ok(None);
        };
        let checkpoint = Checkpoint {
            block_number: uint("checkpoint.block_number", number)?,
            block_hash: parse("checkpoint.block_hash", &hash)?,
            updated_at: uint("checkpoint.updated_at", updated_at)?,
        };

        let mut stmt = conn
            .prepare(
                "SELECT block_number, log_index, block_hash, tx_hash,
                        from_addr, to_addr, value, timestamp
                 FROM transfers ORDER BY block_number, log_index",
            )
            .map_err(sql("reading transfers"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawTransfer {
                    block_number: row.get(0)?,
                    log_index: row.get(1)?,
                    block_hash: row.get(2)?,
                    tx_hash: row.get(3)?,
                    from: row.get(4)?,
                    to: row.get(5)?,
                    value: row.get(6)?,
                    timestamp: row.get(7)?,
                })
            })
            .map_err(sql("reading transfers"))?;
        let mut transfers = Vec::new();
        for row in rows {
            transfers.push(row.map_err(sql("reading transfers"))?.decode()?);
        }

        let mut stmt = conn
            .prepare("SELECT address, balance FROM balances ORDER BY address")
            .map_err(sql("reading balances"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql("reading balances"))?;
        let mut balances = Vec::new();
        for row in rows {
            let (address, balance) = row.map_err(sql("reading balances"))?;
            balances.push(BalanceRow {
                address: parse("balances.address", &address)?,
                balance: parse("balances.balance", &balance)?,
            });
        }

        let mut stmt = conn
            .prepare("SELECT block_number, block_hash FROM anchors ORDER BY block_number")
            .map_err(sql("reading anchors"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql("reading anchors"))?;
        let mut anchors = Vec::new();
        for row in rows {
            let (number, hash) = row.map_err(sql("reading anchors"))?;
            anchors.push(Anchor {
                block_number: uint("anchors.block_number", number)?,
                block_hash: parse("anchors.block_hash", &hash)?,
            });
        }

        Ok(Some(Snapshot {
            checkpoint,
            transfers,
            balances,
            minted: parse("checkpoint.minted", &minted)?,
            burned: parse("checkpoint.burned", &burned)?,
            anchors,
        }))
    }

    fn commit(&self, change: &Changeset) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction().map_err(sql("opening transaction"))?;
        Self::write(&tx, change).map_err(sql(format!(
            "writing checkpoint {}",
            change.checkpoint.block_number
        )))?;
        tx.commit().map_err(sql("committing transaction"))?;

        tracing::debug!(
            block = change.checkpoint.block_number,
            inserted = change.inserted.len(),
            removed = change.removed.len(),
            balances = change.balances.len(),
            "ledger changes written"
        );
        Ok(())
    }
}

/// Column values of one `transfers` row before parsing.
struct RawTransfer {
    block_number: i64,
    log_index: i64,
    block_hash: String,
    tx_hash: String,
    from: String,
    to: String,
    value: String,
    timestamp: i64,
}

impl RawTransfer {
    fn decode(self) -> Result<TransferEvent, StoreError> {
        Ok(TransferEvent {
            tx_hash: parse::<B256>("transfers.tx_hash", &self.tx_hash)?,
            log_index: uint("transfers.log_index", self.log_index)?,
            block_number: uint("transfers.block_number", self.block_number)?,
            block_hash: parse::<B256>("transfers.block_hash", &self.block_hash)?,
            from: parse::<Address>("transfers.from_addr", &self.from)?,
            to: parse::<Address>("transfers.to_addr", &self.to)?,
            value: parse::<U256>("transfers.value", &self.value)?,
            timestamp: uint("transfers.timestamp", self.timestamp)?,
        })
    }
}

fn sql(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Sqlite { context, source }
}

/// SQLite integers are signed; heights and timestamps never reach 2^63.
fn int(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn uint(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn parse<T>(column: &str, text: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column} = {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::Ledger;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("erc20-sqlite-{}-{name}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir.join("ledger.db")
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    fn transfer(block: u64, from: Address, to: Address, value: U256) -> TransferEvent {
        TransferEvent {
            tx_hash: B256::with_last_byte(u8::try_from(block).unwrap()),
            log_index: 0,
            block_number: block,
            block_hash: B256::left_padding_from(&block.to_be_bytes()),
            from,
            to,
            value,
            timestamp: 1_700_000_000 + block,
        }
    }

    fn at(block: u64) -> Checkpoint {
        Checkpoint::now(block, B256::left_padding_from(&block.to_be_bytes()))
    }

    fn commit(store: &SqliteStore, ledger: &mut Ledger, events: Vec<TransferEvent>, block: u64) {
        let change = ledger.stage(events, at(block)).unwrap();
        store.commit(&change).unwrap();
        ledger.absorb(&change);
    }

    #[test]
    fn persists_across_reopen() {
        let path = scratch("reopen");
        let alice = Address::with_last_byte(0xa1);
        let bob = Address::with_last_byte(0xb0);
        let mut ledger = Ledger::new(Checkpoint::initial(1));
        {
            let store = SqliteStore::open(&path).unwrap();
            assert!(store.load().unwrap().is_none(), "fresh database is empty");
            commit(&store, &mut ledger, vec![transfer(1, Address::ZERO, alice, U256::MAX)], 1);
            commit(&store, &mut ledger, vec![transfer(2, alice, bob, U256::from(7))], 2);
        }

        let loaded = SqliteStore::open(&path).unwrap().load().unwrap();
        assert_eq!(loaded, Some(ledger.to_snapshot()), "state survives a restart");
        let rebuilt = Ledger::from_snapshot(loaded.unwrap()).unwrap();
        assert_eq!(rebuilt.balance_of(&bob), U256::from(7), "balances reload");
        assert_eq!(rebuilt.minted(), U256::MAX, "full-width totals kept");
        cleanup(&path);
    }

    #[test]
    fn rollback_deletes_only_retracted_rows() {
        let path = scratch("rollback");
        let alice = Address::with_last_byte(0xa1);
        let bob = Address::with_last_byte(0xb0);
        let store = SqliteStore::open(&path).unwrap();
        let mut ledger = Ledger::new(Checkpoint::initial(1));
        commit(&store, &mut ledger, vec![transfer(1, Address::ZERO, alice, U256::from(10))], 1);
        commit(&store, &mut ledger, vec![transfer(2, alice, bob, U256::from(10))], 2);
        commit(&store, &mut ledger, Vec::new(), 3);

        let change = ledger.stage_rollback(at(1)).unwrap();
        store.commit(&change).unwrap();
        ledger.absorb(&change);

        let stored = store.load().unwrap().unwrap();
        assert_eq!(stored, ledger.to_snapshot(), "database matches the ledger");
        assert_eq!(stored.transfers.len(), 1, "block 2 transfer deleted");
        assert_eq!(
            stored.balances,
            vec![BalanceRow {
                address: alice,
                balance: U256::from(10)
            }],
            "bob's emptied row deleted, alice restored"
        );
        assert_eq!(
            stored.anchors.iter().map(|a| a.block_number).collect::<Vec<_>>(),
            vec![1],
            "anchors above the ancestor dropped"
        );
        cleanup(&path);
    }

    #[test]
    fn failed_commit_keeps_previous_state() {
        let path = scratch("atomic");
        let alice = Address::with_last_byte(0xa1);
        let store = SqliteStore::open(&path).unwrap();
        let mut ledger = Ledger::new(Checkpoint::initial(1));
        commit(&store, &mut ledger, vec![transfer(1, Address::ZERO, alice, U256::from(10))], 1);
        let before = store.load().unwrap();

        // Re-inserting block 1 violates the primary key halfway through.
        let mut change = ledger
            .stage(vec![transfer(2, Address::ZERO, alice, U256::from(5))], at(2))
            .unwrap();
        change
            .inserted
            .push(transfer(1, Address::ZERO, alice, U256::from(10)));
        assert!(
            matches!(store.commit(&change), Err(StoreError::Sqlite { .. })),
            "constraint violation surfaces"
        );
        assert_eq!(store.load().unwrap(), before, "transaction rolled back");
        cleanup(&path);
    }

    #[test]
    fn commits_are_fully_synchronous() {
        let path = scratch("sync");
        let store = SqliteStore::open(&path).unwrap();
        let conn = store.conn.lock().unwrap();
        let level: i64 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(level, 2, "synchronous=FULL");
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal", "write-ahead log");
        drop(conn);
        cleanup(&path);
    }

    #[test]
    fn reports_corrupt_rows() {
        let path = scratch("corrupt");
        let alice = Address::with_last_byte(0xa1);
        let store = SqliteStore::open(&path).unwrap();
        let mut ledger = Ledger::new(Checkpoint::initial(1));
        commit(&store, &mut ledger, vec![transfer(1, Address::ZERO, alice, U256::from(10))], 1);
        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE balances SET balance = 'lots'", [])
            .unwrap();

        assert!(
            matches!(store.load(), Err(StoreError::Corrupt(_))),
            "corrupt state is an error, never a silent reset"
        );
        cleanup(&path);
    }
}
