#![cfg(feature = "sqlite")]

use crate::storage_traits::{LockFilter, Page, PageSpecification, QueryCriteria, StateStatus, VaultStorage};
use anyhow::Context;
use ddr_core::amount::{Amount, Currency};
use ddr_core::error::StorageError;
use ddr_core::id::{LockId, StateRef, TxId};
use ddr_core::identity::PartyKey;
use ddr_core::locks::{current_time_millis, ReservationInfo, SoftLockManager};
use ddr_core::states::{LedgerState, StateAndRef, StateKind};
use ddr_core::transaction::SignedTransaction;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Runtime;

/// SQL query constants to avoid repetition
mod sql {
    pub const CREATE_STATES_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS states (
            tx_id BLOB NOT NULL,
            output_index INTEGER NOT NULL,
            kind TEXT NOT NULL,
            owner BLOB NOT NULL,
            currency TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            external_id TEXT,
            obligation_status TEXT,
            consumed_by BLOB,
            state_data BLOB NOT NULL,
            PRIMARY KEY (tx_id, output_index)
        );
    "#;

    pub const CREATE_STATES_OWNER_INDEX: &str = r#"
        CREATE INDEX IF NOT EXISTS idx_states_owner
        ON states (kind, owner, currency, consumed_by);
    "#;

    pub const CREATE_TRANSACTIONS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS transactions (
            tx_id BLOB PRIMARY KEY,
            recorded_at INTEGER NOT NULL,
            tx_data BLOB NOT NULL
        );
    "#;

    pub const CREATE_RESERVATIONS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS reservations (
            tx_id BLOB NOT NULL,
            output_index INTEGER NOT NULL,
            lock_id BLOB NOT NULL,
            acquired_at INTEGER NOT NULL,
            timeout_ms INTEGER,
            PRIMARY KEY (tx_id, output_index)
        );
    "#;

    pub const INSERT_TRANSACTION: &str = r#"
        INSERT OR IGNORE INTO transactions (tx_id, recorded_at, tx_data)
        VALUES (?, ?, ?)
    "#;

    pub const GET_TRANSACTION: &str = r#"
        SELECT tx_data FROM transactions WHERE tx_id = ?
    "#;

    pub const INSERT_STATE: &str = r#"
        INSERT OR IGNORE INTO states
            (tx_id, output_index, kind, owner, currency, quantity, external_id, obligation_status, state_data)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#;

    pub const GET_STATE: &str = r#"
        SELECT tx_id, output_index, state_data, consumed_by
        FROM states
        WHERE tx_id = ? AND output_index = ?
    "#;

    pub const CONSUME_STATE: &str = r#"
        UPDATE states
        SET consumed_by = ?
        WHERE tx_id = ? AND output_index = ? AND consumed_by IS NULL
    "#;

    pub const BALANCE: &str = r#"
        SELECT COALESCE(SUM(quantity), 0)
        FROM states
        WHERE kind = ? AND owner = ? AND currency = ? AND consumed_by IS NULL
    "#;

    pub const GET_RESERVATION: &str = r#"
        SELECT tx_id, output_index, lock_id, acquired_at, timeout_ms
        FROM reservations
        WHERE tx_id = ? AND output_index = ?
          AND (timeout_ms IS NULL OR acquired_at + timeout_ms > ?)
    "#;

    pub const GET_RESERVATIONS_BY_LOCK: &str = r#"
        SELECT tx_id, output_index, lock_id, acquired_at, timeout_ms
        FROM reservations
        WHERE lock_id = ?
          AND (timeout_ms IS NULL OR acquired_at + timeout_ms > ?)
    "#;

    pub const UPSERT_RESERVATION: &str = r#"
        INSERT OR REPLACE INTO reservations (tx_id, output_index, lock_id, acquired_at, timeout_ms)
        VALUES (?, ?, ?, ?, ?)
    "#;

    pub const DELETE_RESERVATION: &str = r#"
        DELETE FROM reservations
        WHERE tx_id = ? AND output_index = ?
    "#;

    pub const DELETE_LOCK_RESERVATION: &str = r#"
        DELETE FROM reservations
        WHERE lock_id = ? AND tx_id = ? AND output_index = ?
    "#;

    pub const DELETE_LOCK_RESERVATIONS: &str = r#"
        DELETE FROM reservations
        WHERE lock_id = ?
    "#;

    pub const DELETE_EXPIRED_RESERVATIONS: &str = r#"
        DELETE FROM reservations
        WHERE timeout_ms IS NOT NULL AND acquired_at + timeout_ms <= ?
    "#;

    pub const DELETE_ALL_RESERVATIONS: &str = "DELETE FROM reservations";

    pub const LIVE_RESERVATION_EXISTS: &str = " EXISTS (SELECT 1 FROM reservations r \
        WHERE r.tx_id = s.tx_id AND r.output_index = s.output_index \
        AND (r.timeout_ms IS NULL OR r.acquired_at + r.timeout_ms > ";
}

/// A SQLite-backed vault using sqlx
///
/// States, recorded transactions and soft-lock reservations share one
/// database so that reserving and spending are serialised by SQLite's
/// write lock.
pub struct SqliteVault {
    pool: SqlitePool,
    rt: Arc<Runtime>,
    db_path: PathBuf,
}

impl SqliteVault {
    /// Open or create a vault database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();

        // Create a runtime for async operations
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Failed to create runtime")?;
        let rt = Arc::new(rt);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        // Create connection pool
        let pool = rt
            .block_on(async {
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
            })
            .with_context(|| format!("Failed to open vault database {}", db_path.display()))?;

        // Initialize the database schema
        rt.block_on(Self::initialize_schema(&pool))
            .context("Failed to initialize vault schema")?;

        log::info!("Opened SQLite vault at {}", db_path.display());
        Ok(Self { pool, rt, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for statement in [
            sql::CREATE_STATES_TABLE,
            sql::CREATE_STATES_OWNER_INDEX,
            sql::CREATE_TRANSACTIONS_TABLE,
            sql::CREATE_RESERVATIONS_TABLE,
        ] {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    fn state_from_row(row: &SqliteRow) -> Result<StateAndRef, StorageError> {
        let tx_id: Vec<u8> = row.try_get("tx_id")?;
        let index: i64 = row.try_get("output_index")?;
        let data: Vec<u8> = row.try_get("state_data")?;

        let tx_id = TxId::from_slice(&tx_id)
            .ok_or_else(|| StorageError::Corrupt(format!("Invalid transaction id of length {}", tx_id.len())))?;
        let state: LedgerState = bincode::deserialize(&data)?;
        Ok(StateAndRef::new(StateRef::new(tx_id, index as u32), state))
    }

    fn reservation_from_row(row: &SqliteRow) -> Result<ReservationInfo, StorageError> {
        let tx_id: Vec<u8> = row.try_get("tx_id")?;
        let index: i64 = row.try_get("output_index")?;
        let lock_id: Vec<u8> = row.try_get("lock_id")?;
        let acquired_at: i64 = row.try_get("acquired_at")?;
        let timeout_ms: Option<i64> = row.try_get("timeout_ms")?;

        let tx_id = TxId::from_slice(&tx_id)
            .ok_or_else(|| StorageError::Corrupt("Invalid transaction id in reservation".to_string()))?;
        let lock_id = LockId::from_slice(&lock_id)
            .ok_or_else(|| StorageError::Corrupt("Invalid lock id in reservation".to_string()))?;
        Ok(ReservationInfo {
            state_ref: StateRef::new(tx_id, index as u32),
            lock_id,
            acquired_at: acquired_at as u64,
            timeout_ms: timeout_ms.map(|t| t as u64),
        })
    }

    /// Append the WHERE clause for `criteria` to a query over `states s`
    fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, criteria: &QueryCriteria, now: i64) {
        qb.push(" WHERE 1 = 1");
        match criteria.state_status {
            StateStatus::Unconsumed => {
                qb.push(" AND s.consumed_by IS NULL");
            }
            StateStatus::Consumed => {
                qb.push(" AND s.consumed_by IS NOT NULL");
            }
            StateStatus::All => {}
        }
        if let Some(kind) = criteria.kind {
            qb.push(" AND s.kind = ").push_bind(kind.as_str());
        }
        if let Some(owner) = criteria.owner {
            qb.push(" AND s.owner = ").push_bind(owner.as_bytes().to_vec());
        }
        if let Some(currency) = criteria.currency {
            qb.push(" AND s.currency = ").push_bind(currency.as_str().to_string());
        }
        if let Some(external_id) = &criteria.external_id {
            qb.push(" AND s.external_id = ").push_bind(external_id.clone());
        }
        if let Some(status) = criteria.obligation_status {
            qb.push(" AND s.obligation_status = ").push_bind(status.as_str());
        }
        match criteria.lock_filter {
            LockFilter::Any => {}
            LockFilter::UnlockedOnly => {
                qb.push(" AND NOT")
                    .push(sql::LIVE_RESERVATION_EXISTS)
                    .push_bind(now)
                    .push("))");
            }
            LockFilter::HeldBy(lock_id) => {
                qb.push(" AND")
                    .push(sql::LIVE_RESERVATION_EXISTS)
                    .push_bind(now)
                    .push(") AND r.lock_id = ")
                    .push_bind(lock_id.as_bytes().to_vec())
                    .push(")");
            }
        }
    }
}

impl std::fmt::Debug for SqliteVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVault")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl VaultStorage for SqliteVault {
    fn record_transaction(&self, tx: &SignedTransaction) -> Result<bool, StorageError> {
        let id = tx.id();
        let tx_data = bincode::serialize(tx)?;
        let now = current_time_millis() as i64;

        self.rt.block_on(async {
            let mut dbtx = self
                .pool
                .begin()
                .await
                .with_context(|| "Failed to start database transaction")?;

            // Recording twice is a no-op
            let inserted = sqlx::query(sql::INSERT_TRANSACTION)
                .bind(&id[..])
                .bind(now)
                .bind(&tx_data)
                .execute(&mut *dbtx)
                .await
                .with_context(|| format!("Failed to store transaction {}", id))?
                .rows_affected();
            if inserted == 0 {
                dbtx.rollback().await.context("Failed to roll back")?;
                return Ok(false);
            }

            for input in &tx.envelope().inputs {
                let r = &input.reference;
                sqlx::query(sql::CONSUME_STATE)
                    .bind(&id[..])
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to consume state {}", r))?;
                sqlx::query(sql::DELETE_RESERVATION)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to drop reservation on {}", r))?;
            }

            for output in tx.output_states() {
                let state = &output.state;
                let data = bincode::serialize(state)?;
                sqlx::query(sql::INSERT_STATE)
                    .bind(&id[..])
                    .bind(output.reference.index as i64)
                    .bind(state.kind().as_str())
                    .bind(&state.owner().key.as_bytes()[..])
                    .bind(state.amount().currency.as_str())
                    .bind(state.amount().quantity as i64)
                    .bind(state.external_id())
                    .bind(state.obligation_status().map(|s| s.as_str()))
                    .bind(&data)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to store state {}", output.reference))?;
            }

            dbtx.commit()
                .await
                .with_context(|| format!("Failed to commit transaction {}", id))?;
            log::debug!("Recorded transaction {} in SQLite vault", id);
            Ok(true)
        })
    }

    fn get_transaction(&self, id: &TxId) -> Result<Option<SignedTransaction>, StorageError> {
        self.rt.block_on(async {
            let data: Option<Vec<u8>> = sqlx::query_scalar(sql::GET_TRANSACTION)
                .bind(&id[..])
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch transaction {}", id))?;

            match data {
                Some(data) => Ok(Some(bincode::deserialize(&data)?)),
                None => Ok(None),
            }
        })
    }

    fn get_state(&self, state_ref: &StateRef) -> Result<Option<StateAndRef>, StorageError> {
        self.rt.block_on(async {
            let row = sqlx::query(sql::GET_STATE)
                .bind(&state_ref.tx_id[..])
                .bind(state_ref.index as i64)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch state {}", state_ref))?;

            row.as_ref().map(Self::state_from_row).transpose()
        })
    }

    fn consumed_by(&self, state_ref: &StateRef) -> Result<Option<TxId>, StorageError> {
        self.rt.block_on(async {
            let row = sqlx::query(sql::GET_STATE)
                .bind(&state_ref.tx_id[..])
                .bind(state_ref.index as i64)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch state {}", state_ref))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let consumed_by: Option<Vec<u8>> = row.try_get("consumed_by")?;
            Ok(consumed_by.and_then(|bytes| TxId::from_slice(&bytes)))
        })
    }

    fn query(&self, criteria: &QueryCriteria, page: &PageSpecification) -> Result<Page, StorageError> {
        let now = current_time_millis() as i64;

        self.rt.block_on(async {
            let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM states s");
            Self::push_filters(&mut count, criteria, now);
            let total: i64 = count
                .build_query_scalar::<i64>()
                .fetch_one(&self.pool)
                .await
                .context("Failed to count matching states")?;

            let mut select =
                QueryBuilder::<Sqlite>::new("SELECT s.tx_id, s.output_index, s.state_data FROM states s");
            Self::push_filters(&mut select, criteria, now);
            select
                .push(" ORDER BY s.rowid LIMIT ")
                .push_bind(i64::from(page.page_size))
                .push(" OFFSET ")
                .push_bind(page.offset() as i64);
            let rows = select
                .build()
                .fetch_all(&self.pool)
                .await
                .context("Failed to query states")?;

            let states = rows
                .iter()
                .map(Self::state_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Page {
                states,
                total_states_available: total as u64,
            })
        })
    }

    fn mark_consumed(&self, refs: &[StateRef], consumed_by: &TxId) -> Result<usize, StorageError> {
        self.rt.block_on(async {
            let mut dbtx = self.pool.begin().await.context("Failed to start database transaction")?;
            let mut count = 0;
            for r in refs {
                count += sqlx::query(sql::CONSUME_STATE)
                    .bind(&consumed_by[..])
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to consume state {}", r))?
                    .rows_affected() as usize;
                sqlx::query(sql::DELETE_RESERVATION)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to drop reservation on {}", r))?;
            }
            dbtx.commit().await.context("Failed to commit consumption")?;
            Ok(count)
        })
    }

    fn balance(&self, owner: &PartyKey, currency: Currency) -> Result<Amount, StorageError> {
        self.rt.block_on(async {
            let total: i64 = sqlx::query_scalar(sql::BALANCE)
                .bind(StateKind::Token.as_str())
                .bind(&owner.as_bytes()[..])
                .bind(currency.as_str())
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to sum tokens of {}", owner))?;
            Ok(Amount::new(total as u64, currency))
        })
    }
}

impl SoftLockManager for SqliteVault {
    fn try_reserve(
        &self,
        lock_id: &LockId,
        refs: &[StateRef],
        timeout_ms: Option<u64>,
    ) -> Result<bool, StorageError> {
        let now = current_time_millis() as i64;
        let lock_bytes = lock_id.as_bytes().to_vec();

        self.rt.block_on(async {
            let mut dbtx = self.pool.begin().await.context("Failed to start reservation")?;

            // Writing first takes the database write lock for the whole check-and-set
            sqlx::query(sql::DELETE_EXPIRED_RESERVATIONS)
                .bind(now)
                .execute(&mut *dbtx)
                .await
                .context("Failed to purge expired reservations")?;

            for r in refs {
                let state = sqlx::query(sql::GET_STATE)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .fetch_optional(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to fetch state {}", r))?;
                let spendable = match &state {
                    Some(row) => row.try_get::<Option<Vec<u8>>, _>("consumed_by")?.is_none(),
                    None => false,
                };

                let holder = sqlx::query(sql::GET_RESERVATION)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .bind(now)
                    .fetch_optional(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to fetch reservation on {}", r))?;
                let held_by_other = match &holder {
                    Some(row) => row.try_get::<Vec<u8>, _>("lock_id")? != lock_bytes,
                    None => false,
                };

                if !spendable || held_by_other {
                    log::debug!("Cannot reserve {} for {}", r, lock_id);
                    dbtx.rollback().await.context("Failed to roll back reservation")?;
                    return Ok(false);
                }
            }

            for r in refs {
                sqlx::query(sql::UPSERT_RESERVATION)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .bind(&lock_bytes)
                    .bind(now)
                    .bind(timeout_ms.map(|t| t as i64))
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to reserve {}", r))?;
            }

            dbtx.commit().await.context("Failed to commit reservation")?;
            Ok(true)
        })
    }

    fn release(&self, lock_id: &LockId, refs: Option<&[StateRef]>) -> Result<usize, StorageError> {
        let lock_bytes = lock_id.as_bytes().to_vec();

        self.rt.block_on(async {
            let Some(refs) = refs else {
                let released = sqlx::query(sql::DELETE_LOCK_RESERVATIONS)
                    .bind(&lock_bytes)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("Failed to release {}", lock_id))?
                    .rows_affected();
                return Ok(released as usize);
            };

            let mut dbtx = self.pool.begin().await.context("Failed to start release")?;
            let mut released = 0;
            for r in refs {
                released += sqlx::query(sql::DELETE_LOCK_RESERVATION)
                    .bind(&lock_bytes)
                    .bind(&r.tx_id[..])
                    .bind(r.index as i64)
                    .execute(&mut *dbtx)
                    .await
                    .with_context(|| format!("Failed to release {} from {}", r, lock_id))?
                    .rows_affected() as usize;
            }
            dbtx.commit().await.context("Failed to commit release")?;
            Ok(released)
        })
    }

    fn reservation_info(&self, state_ref: &StateRef) -> Result<Option<ReservationInfo>, StorageError> {
        let now = current_time_millis() as i64;
        self.rt.block_on(async {
            let row = sqlx::query(sql::GET_RESERVATION)
                .bind(&state_ref.tx_id[..])
                .bind(state_ref.index as i64)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch reservation on {}", state_ref))?;
            row.as_ref().map(Self::reservation_from_row).transpose()
        })
    }

    fn reservations_for(&self, lock_id: &LockId) -> Result<Vec<ReservationInfo>, StorageError> {
        let now = current_time_millis() as i64;
        self.rt.block_on(async {
            let rows = sqlx::query(sql::GET_RESERVATIONS_BY_LOCK)
                .bind(&lock_id.as_bytes()[..])
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch reservations of {}", lock_id))?;
            rows.iter().map(Self::reservation_from_row).collect()
        })
    }

    fn cleanup_expired_reservations(&self) -> Result<usize, StorageError> {
        let now = current_time_millis() as i64;
        self.rt.block_on(async {
            let removed = sqlx::query(sql::DELETE_EXPIRED_RESERVATIONS)
                .bind(now)
                .execute(&self.pool)
                .await
                .context("Failed to purge expired reservations")?
                .rows_affected();
            if removed > 0 {
                log::info!("Removed {} expired reservations", removed);
            }
            Ok(removed as usize)
        })
    }

    fn release_all(&self) -> Result<usize, StorageError> {
        self.rt.block_on(async {
            let removed = sqlx::query(sql::DELETE_ALL_RESERVATIONS)
                .execute(&self.pool)
                .await
                .context("Failed to clear reservations")?
                .rows_affected();
            Ok(removed as usize)
        })
    }
}
