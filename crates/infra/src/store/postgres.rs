//! Postgres-backed ledger store.
//!
//! Every mutator runs inside one transaction and takes `SELECT ... FOR UPDATE`
//! row locks before reading the balance it is about to change.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Result | Scenario |
//! |------------|----------------------|--------|----------|
//! | Database (unique violation) on `processed_operations` | `23505` | `DepositOutcome::Duplicate` | Same idempotency key committed concurrently |
//! | Database (check constraint violation) | `23514` | `Infrastructure` | Balance would go negative (guarded in code first) |
//! | Database (other) | Any other | `Infrastructure` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Infrastructure` | Connection failures |
//!
//! ## Thread Safety
//!
//! `PostgresLedgerStore` is `Send + Sync` and cheap to clone; all clones share
//! one connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, info, instrument};

use ledgerline_core::money;
use ledgerline_core::{
    Account, AccountId, Amount, DepositOutcome, IdempotencyKey, LedgerError, LedgerResult,
    OperationId, OperationType, ProcessedOperation, TransactionRecord, TransactionType,
    TransferReceipt,
};

use super::r#trait::{LedgerStore, clamp_history_limit};

const SCHEMA: &str = include_str!("schema.sql");

/// Postgres-backed ledger store.
///
/// ## Locking
///
/// - withdraw / deposit: one `FOR UPDATE` on the account row
/// - transfer: `FOR UPDATE` on the lower id, then on the higher id, inside the
///   same transaction, whichever direction the money moves
///
/// Locks are released by commit or rollback only.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        info!("ledger schema ready");
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = tracing::field::Empty), err)]
    pub async fn insert_account(&self, owner: &str) -> LedgerResult<AccountId> {
        let row = sqlx::query("INSERT INTO accounts (owner) VALUES ($1) RETURNING id")
            .bind(owner)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_account", e))?;

        let raw: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_account", e))?;
        let id = account_id(raw)?;
        Span::current().record("account_id", raw);
        Ok(id)
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    pub async fn load_account(&self, id: AccountId) -> LedgerResult<Account> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        read_account(&mut conn, id, false)
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    /// Debit one account under a row lock.
    #[instrument(skip(self), fields(account_id = %id, amount = amount.get()), err)]
    pub async fn atomic_withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        let mut tx = self.begin().await?;

        let Some(account) = read_account(&mut tx, id, true).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(id));
        };

        let Some(next) = money::debit(account.balance, amount) else {
            rollback(tx).await?;
            return Err(LedgerError::InsufficientFunds {
                account_id: id,
                balance: account.balance,
                requested: amount.get(),
            });
        };

        let updated = write_balance(&mut tx, id, next).await?;
        insert_record(&mut tx, &updated, TransactionType::Withdraw, amount, None).await?;

        commit(tx).await?;
        debug!(balance = updated.balance, "withdraw committed");
        Ok(updated)
    }

    /// Move money between two accounts, locking both rows in ascending id order.
    #[instrument(
        skip(self),
        fields(from_id = %from, to_id = %to, amount = amount.get()),
        err
    )]
    pub async fn atomic_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        if from == to {
            return Err(LedgerError::validation("cannot transfer to the same account"));
        }

        let (low, high) = AccountId::lock_order(from, to);
        let mut tx = self.begin().await?;

        let Some(first) = read_account(&mut tx, low, true).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(low));
        };
        let Some(second) = read_account(&mut tx, high, true).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(high));
        };

        let (source, destination) = if from == low {
            (first, second)
        } else {
            (second, first)
        };

        let Some(source_next) = money::debit(source.balance, amount) else {
            rollback(tx).await?;
            return Err(LedgerError::InsufficientFunds {
                account_id: from,
                balance: source.balance,
                requested: amount.get(),
            });
        };
        let destination_next = match money::credit(destination.balance, amount) {
            Ok(next) => next,
            Err(err) => {
                rollback(tx).await?;
                return Err(err);
            }
        };

        let from_after = write_balance(&mut tx, from, source_next).await?;
        let to_after = write_balance(&mut tx, to, destination_next).await?;

        let reference_id = OperationId::new().to_string();
        insert_record(
            &mut tx,
            &from_after,
            TransactionType::TransferOut,
            amount,
            Some(&reference_id),
        )
        .await?;
        insert_record(
            &mut tx,
            &to_after,
            TransactionType::TransferIn,
            amount,
            Some(&reference_id),
        )
        .await?;

        commit(tx).await?;
        debug!(%reference_id, "transfer committed");

        Ok(TransferReceipt {
            from: from_after,
            to: to_after,
            reference_id,
        })
    }

    /// Credit an account at most once per idempotency key.
    ///
    /// The balance update, the dedup row and the audit row commit together.
    #[instrument(
        skip(self, key),
        fields(account_id = %id, amount = amount.get(), idempotency_key = %key),
        err
    )]
    pub async fn atomic_deposit_with_idempotency(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        let mut tx = self.begin().await?;

        if let Some(processed) = find_processed(&mut tx, key).await? {
            rollback(tx).await?;
            return self.duplicate(id, amount, processed).await;
        }

        let Some(account) = read_account(&mut tx, id, true).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(id));
        };

        // A concurrent delivery of the same key may have committed while this
        // transaction waited for the row lock.
        if let Some(processed) = find_processed(&mut tx, key).await? {
            rollback(tx).await?;
            return self.duplicate(id, amount, processed).await;
        }

        let next = match money::credit(account.balance, amount) {
            Ok(next) => next,
            Err(err) => {
                rollback(tx).await?;
                return Err(err);
            }
        };
        let updated = write_balance(&mut tx, id, next).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_operations (
                idempotency_key,
                operation_type,
                account_id,
                amount,
                balance_after
            )
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(key.as_str())
        .bind(OperationType::Deposit.as_str())
        .bind(id.get())
        .bind(amount.get())
        .bind(updated.balance)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                rollback(tx).await?;
                let processed = self.processed_by_key(key).await?;
                return self.duplicate(id, amount, processed).await;
            }
            return Err(map_sqlx_error("insert_processed_operation", err));
        }

        insert_record(
            &mut tx,
            &updated,
            TransactionType::Deposit,
            amount,
            Some(key.as_str()),
        )
        .await?;

        commit(tx).await?;
        debug!(balance = updated.balance, "deposit committed");
        Ok(DepositOutcome::Applied(updated))
    }

    #[instrument(
        skip(self),
        fields(account_id = %id, record_count = tracing::field::Empty),
        err
    )]
    pub async fn load_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.load_account(id).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, account_id, type, amount, balance_after, reference_id, created_at
            FROM transactions
            WHERE account_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(id.get())
        .bind(i64::from(clamp_history_limit(limit)))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_transactions", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let row = TransactionRow::from_row(&row)
                .map_err(|e| map_sqlx_error("decode_transaction", e))?;
            records.push(row.try_into()?);
        }

        Span::current().record("record_count", records.len());
        Ok(records)
    }

    /// Truncate every ledger table and restart id sequences. Test/dev only.
    #[instrument(skip(self), err)]
    pub async fn truncate(&self) -> LedgerResult<()> {
        sqlx::query("TRUNCATE processed_operations, transactions, accounts RESTART IDENTITY")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("truncate", e))?;
        info!("ledger tables truncated");
        Ok(())
    }

    async fn begin(&self) -> LedgerResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn processed_by_key(&self, key: &IdempotencyKey) -> LedgerResult<ProcessedOperation> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        find_processed(&mut conn, key).await?.ok_or_else(|| {
            LedgerError::infrastructure(format!(
                "idempotency key {key} conflicted but could not be read back"
            ))
        })
    }

    async fn duplicate(
        &self,
        id: AccountId,
        amount: Amount,
        processed: ProcessedOperation,
    ) -> LedgerResult<DepositOutcome> {
        processed.check_matches(id, amount)?;
        let account = self.load_account(id).await?;
        debug!(idempotency_key = %processed.idempotency_key, "duplicate deposit");
        Ok(DepositOutcome::Duplicate(processed.replay_onto(&account)))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_account(&self, owner: &str) -> LedgerResult<AccountId> {
        self.insert_account(owner).await
    }

    async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.load_account(id).await
    }

    async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        self.atomic_withdraw(id, amount).await
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        self.atomic_transfer(from, to, amount).await
    }

    async fn deposit(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        self.atomic_deposit_with_idempotency(id, amount, key).await
    }

    async fn list_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.load_transactions(id, limit).await
    }

    async fn reset(&self) -> LedgerResult<()> {
        self.truncate().await
    }
}

async fn read_account(
    conn: &mut PgConnection,
    id: AccountId,
    for_update: bool,
) -> LedgerResult<Option<Account>> {
    let sql = if for_update {
        "SELECT id, owner, balance, created_at, version FROM accounts WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT id, owner, balance, created_at, version FROM accounts WHERE id = $1"
    };

    let row = sqlx::query(sql)
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("read_account", e))?;

    row.map(|r| {
        AccountRow::from_row(&r)
            .map_err(|e| map_sqlx_error("decode_account", e))
            .and_then(Account::try_from)
    })
    .transpose()
}

async fn write_balance(conn: &mut PgConnection, id: AccountId, balance: i64) -> LedgerResult<Account> {
    let row = sqlx::query(
        r#"
        UPDATE accounts
        SET balance = $2, version = version + 1
        WHERE id = $1
        RETURNING id, owner, balance, created_at, version
        "#,
    )
    .bind(id.get())
    .bind(balance)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("write_balance", e))?;

    AccountRow::from_row(&row)
        .map_err(|e| map_sqlx_error("decode_account", e))
        .and_then(Account::try_from)
}

async fn insert_record(
    conn: &mut PgConnection,
    account: &Account,
    kind: TransactionType,
    amount: Amount,
    reference_id: Option<&str>,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (account_id, type, amount, balance_after, reference_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(account.id.get())
    .bind(kind.as_str())
    .bind(amount.get())
    .bind(account.balance)
    .bind(reference_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_transaction", e))?;
    Ok(())
}

async fn find_processed(
    conn: &mut PgConnection,
    key: &IdempotencyKey,
) -> LedgerResult<Option<ProcessedOperation>> {
    let row = sqlx::query(
        r#"
        SELECT idempotency_key, operation_type, account_id, amount, balance_after, processed_at
        FROM processed_operations
        WHERE idempotency_key = $1
        "#,
    )
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_processed", e))?;

    row.map(|r| {
        ProcessedRow::from_row(&r)
            .map_err(|e| map_sqlx_error("decode_processed", e))
            .and_then(ProcessedOperation::try_from)
    })
    .transpose()
}

async fn commit(tx: Transaction<'_, Postgres>) -> LedgerResult<()> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn rollback(tx: Transaction<'_, Postgres>) -> LedgerResult<()> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

fn account_id(raw: i64) -> LedgerResult<AccountId> {
    AccountId::new(raw)
        .map_err(|_| LedgerError::infrastructure(format!("stored account id {raw} is invalid")))
}

/// Map SQLx errors to `LedgerError::Infrastructure`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            LedgerError::infrastructure(format!(
                "database error in {operation} [{code}]: {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::infrastructure(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::infrastructure(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            LedgerError::infrastructure(format!("unexpected row not found in {operation}"))
        }
        _ => LedgerError::infrastructure(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: i64,
    owner: String,
    balance: i64,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            balance: row.try_get("balance")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: account_id(row.id)?,
            owner: row.owner,
            balance: row.balance,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

#[derive(Debug)]
struct TransactionRow {
    id: i64,
    account_id: i64,
    kind: String,
    amount: i64,
    balance_after: i64,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransactionRow {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            kind: row.try_get("type")?,
            amount: row.try_get("amount")?,
            balance_after: row.try_get("balance_after")?,
            reference_id: row.try_get("reference_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = TransactionType::parse(&row.kind).ok_or_else(|| {
            LedgerError::infrastructure(format!("unknown transaction type '{}'", row.kind))
        })?;
        Ok(TransactionRecord {
            id: row.id,
            account_id: account_id(row.account_id)?,
            kind,
            amount: row.amount,
            balance_after: row.balance_after,
            reference_id: row.reference_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct ProcessedRow {
    idempotency_key: String,
    operation_type: String,
    account_id: i64,
    amount: i64,
    balance_after: i64,
    processed_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ProcessedRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProcessedRow {
            idempotency_key: row.try_get("idempotency_key")?,
            operation_type: row.try_get("operation_type")?,
            account_id: row.try_get("account_id")?,
            amount: row.try_get("amount")?,
            balance_after: row.try_get("balance_after")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl TryFrom<ProcessedRow> for ProcessedOperation {
    type Error = LedgerError;

    fn try_from(row: ProcessedRow) -> Result<Self, Self::Error> {
        let operation = OperationType::parse(&row.operation_type).ok_or_else(|| {
            LedgerError::infrastructure(format!(
                "unknown operation type '{}'",
                row.operation_type
            ))
        })?;
        let idempotency_key = IdempotencyKey::parse(row.idempotency_key)
            .map_err(|e| LedgerError::infrastructure(format!("stored key is invalid: {e}")))?;
        Ok(ProcessedOperation {
            idempotency_key,
            operation,
            account_id: account_id(row.account_id)?,
            amount: row.amount,
            balance_after: row.balance_after,
            processed_at: row.processed_at,
        })
    }
}
