use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use ledgerline_core::ledger::lock_pair;
use ledgerline_core::{
    Account, AccountId, Amount, DepositOutcome, IdempotencyKey, LedgerAccount, LedgerError,
    LedgerResult, OperationId, OperationType, ProcessedOperation, TransactionRecord,
    TransactionType, TransferReceipt,
};

use super::r#trait::{LedgerStore, clamp_history_limit};

/// Number of independently locked dedup shards.
const DEDUP_SHARDS: usize = 64;

type DedupShard = HashMap<IdempotencyKey, ProcessedOperation>;

/// One account plus its own audit trail.
#[derive(Debug)]
struct AccountEntry {
    ledger: LedgerAccount,
    records: Mutex<Vec<TransactionRecord>>,
}

impl AccountEntry {
    fn records(&self) -> LedgerResult<MutexGuard<'_, Vec<TransactionRecord>>> {
        self.records.lock().map_err(|_| poisoned("transaction history"))
    }
}

/// In-memory ledger store backed by per-account mutexes.
///
/// Intended for tests/dev. Withdrawals and transfers touch only the locks of
/// the accounts involved. Lock order is always: account(s) in ascending id,
/// then the dedup shard of the key, then the accounts' audit trails.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<BTreeMap<AccountId, Arc<AccountEntry>>>,
    processed: Vec<Mutex<DedupShard>>,
    next_account_id: AtomicI64,
    next_record_id: AtomicI64,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            processed: (0..DEDUP_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            next_account_id: AtomicI64::new(1),
            next_record_id: AtomicI64::new(1),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, id: AccountId) -> LedgerResult<Arc<AccountEntry>> {
        let accounts = self.accounts.read().map_err(|_| poisoned("accounts"))?;
        accounts.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    fn shard(&self, key: &IdempotencyKey) -> LedgerResult<MutexGuard<'_, DedupShard>> {
        // Keys are hex digests, so the leading byte is uniformly distributed.
        let idx = key
            .as_str()
            .get(..2)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0)
            % DEDUP_SHARDS;
        self.processed[idx]
            .lock()
            .map_err(|_| poisoned("processed operations"))
    }

    fn record(
        &self,
        account: &Account,
        kind: TransactionType,
        amount: Amount,
        reference_id: Option<String>,
    ) -> TransactionRecord {
        TransactionRecord {
            id: self.next_record_id.fetch_add(1, Ordering::SeqCst),
            account_id: account.id,
            kind,
            amount: amount.get(),
            balance_after: account.balance,
            reference_id,
            created_at: Utc::now(),
        }
    }

    fn create_account_sync(&self, owner: &str) -> LedgerResult<AccountId> {
        let id = AccountId::new(self.next_account_id.fetch_add(1, Ordering::SeqCst))?;
        let entry = AccountEntry {
            ledger: LedgerAccount::new(Account::open(id, owner, Utc::now())),
            records: Mutex::new(Vec::new()),
        };

        self.accounts
            .write()
            .map_err(|_| poisoned("accounts"))?
            .insert(id, Arc::new(entry));

        debug!(account_id = %id, "account created");
        Ok(id)
    }

    fn withdraw_sync(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        let entry = self.account(id)?;
        let mut guard = entry.ledger.lock()?;
        let mut records = entry.records()?;

        guard.debit(amount)?;
        records.push(self.record(guard.account(), TransactionType::Withdraw, amount, None));

        Ok(guard.account().clone())
    }

    fn transfer_sync(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        if from == to {
            return Err(LedgerError::validation("cannot transfer to the same account"));
        }

        let source = self.account(from)?;
        let destination = self.account(to)?;
        let (mut src, mut dst) = lock_pair(&source.ledger, &destination.ledger)?;

        dst.check_credit(amount)?;
        src.debit(amount)?;
        dst.credit(amount)?;

        let reference_id = OperationId::new().to_string();
        let out = self.record(
            src.account(),
            TransactionType::TransferOut,
            amount,
            Some(reference_id.clone()),
        );
        let inn = self.record(
            dst.account(),
            TransactionType::TransferIn,
            amount,
            Some(reference_id.clone()),
        );
        // One trail lock at a time.
        source.records()?.push(out);
        destination.records()?.push(inn);

        Ok(TransferReceipt {
            from: src.account().clone(),
            to: dst.account().clone(),
            reference_id,
        })
    }

    fn deposit_sync(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        let entry = self.account(id)?;
        let mut guard = entry.ledger.lock()?;
        let mut processed = self.shard(key)?;

        if let Some(existing) = processed.get(key) {
            existing.check_matches(id, amount)?;
            debug!(account_id = %id, idempotency_key = %key, "duplicate deposit");
            return Ok(DepositOutcome::Duplicate(existing.replay_onto(guard.account())));
        }

        let balance_after = guard.credit(amount)?;
        processed.insert(
            key.clone(),
            ProcessedOperation {
                idempotency_key: key.clone(),
                operation: OperationType::Deposit,
                account_id: id,
                amount: amount.get(),
                balance_after,
                processed_at: Utc::now(),
            },
        );
        drop(processed);

        let record = self.record(
            guard.account(),
            TransactionType::Deposit,
            amount,
            Some(key.to_string()),
        );
        entry.records()?.push(record);

        Ok(DepositOutcome::Applied(guard.account().clone()))
    }

    fn list_transactions_sync(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let entry = self.account(id)?;
        let records = entry.records()?;

        Ok(records
            .iter()
            .rev()
            .take(clamp_history_limit(limit) as usize)
            .cloned()
            .collect())
    }

    fn reset_sync(&self) -> LedgerResult<()> {
        let mut accounts = self.accounts.write().map_err(|_| poisoned("accounts"))?;
        for shard in &self.processed {
            shard
                .lock()
                .map_err(|_| poisoned("processed operations"))?
                .clear();
        }

        accounts.clear();
        self.next_account_id.store(1, Ordering::SeqCst);
        self.next_record_id.store(1, Ordering::SeqCst);
        Ok(())
    }
}

fn poisoned(what: &str) -> LedgerError {
    LedgerError::infrastructure(format!("{what} lock poisoned"))
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self, owner: &str) -> LedgerResult<AccountId> {
        self.create_account_sync(owner)
    }

    async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.account(id)?.ledger.snapshot()
    }

    async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        self.withdraw_sync(id, amount)
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        self.transfer_sync(from, to, amount)
    }

    async fn deposit(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        self.deposit_sync(id, amount, key)
    }

    async fn list_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.list_transactions_sync(id, limit)
    }

    async fn reset(&self) -> LedgerResult<()> {
        self.reset_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerline_core::generate_key;
    use proptest::prelude::*;

    fn amount(n: i64) -> Amount {
        Amount::new(n).unwrap()
    }

    async fn funded(store: &InMemoryLedgerStore, owner: &str, balance: i64) -> AccountId {
        let id = store.create_account(owner).await.unwrap();
        if balance > 0 {
            let key = generate_key(OperationType::Deposit, id, amount(balance));
            store.deposit(id, amount(balance), &key).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn account_ids_are_assigned_monotonically() {
        let store = InMemoryLedgerStore::new();
        let a = store.create_account("alice").await.unwrap();
        let b = store.create_account("bob").await.unwrap();
        assert!(b > a);
        assert_eq!(store.get_account(a).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn duplicate_deposit_applies_once() {
        let store = InMemoryLedgerStore::new();
        let a = store.create_account("alice").await.unwrap();
        let key = generate_key(OperationType::Deposit, a, amount(1_000));

        let first = store.deposit(a, amount(1_000), &key).await.unwrap();
        let second = store.deposit(a, amount(1_000), &key).await.unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(first.account().balance, 1_000);
        assert!(second.is_duplicate());
        assert_eq!(second.account().balance, 1_000);
        assert_eq!(store.get_account(a).await.unwrap().balance, 1_000);
        assert_eq!(store.list_transactions(a, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deposit_to_missing_account_is_not_found() {
        let store = InMemoryLedgerStore::new();
        let ghost = AccountId::new(999).unwrap();
        let key = generate_key(OperationType::Deposit, ghost, amount(5));
        assert_eq!(
            store.deposit(ghost, amount(5), &key).await,
            Err(LedgerError::NotFound(ghost))
        );
    }

    #[tokio::test]
    async fn overdraft_is_rejected_and_balance_unchanged() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 100).await;

        let err = store.withdraw(a, amount(500)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { balance: 100, requested: 500, .. }));
        assert_eq!(store.get_account(a).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn self_transfer_is_rejected_without_mutation() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 100).await;

        let err = store.transfer(a, a, amount(10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(store.get_account(a).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn transfer_to_missing_account_changes_nothing() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 100).await;
        let ghost = AccountId::new(77).unwrap();

        assert_eq!(
            store.transfer(a, ghost, amount(10)).await,
            Err(LedgerError::NotFound(ghost))
        );
        assert_eq!(store.get_account(a).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn transfer_writes_paired_audit_legs() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 300).await;
        let b = funded(&store, "bob", 0).await;

        let receipt = store.transfer(a, b, amount(120)).await.unwrap();
        assert_eq!(receipt.from.balance, 180);
        assert_eq!(receipt.to.balance, 120);

        let out = &store.list_transactions(a, 1).await.unwrap()[0];
        let inn = &store.list_transactions(b, 1).await.unwrap()[0];
        assert_eq!(out.kind, TransactionType::TransferOut);
        assert_eq!(inn.kind, TransactionType::TransferIn);
        assert_eq!(out.reference_id.as_deref(), Some(receipt.reference_id.as_str()));
        assert_eq!(out.reference_id, inn.reference_id);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 1_000).await;
        for n in 1..=5 {
            store.withdraw(a, amount(n)).await.unwrap();
        }

        let page = store.list_transactions(a, 3).await.unwrap();
        let amounts: Vec<i64> = page.iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![5, 4, 3]);
        assert_eq!(page[0].balance_after, 1_000 - 15);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = InMemoryLedgerStore::new();
        let a = funded(&store, "alice", 10).await;
        store.reset().await.unwrap();

        assert_eq!(store.get_account(a).await, Err(LedgerError::NotFound(a)));
        assert_eq!(store.create_account("again").await.unwrap().get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hundred_concurrent_transfers_drain_the_source() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let a = funded(&store, "alice", 10_000).await;
        let b = funded(&store, "bob", 0).await;

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.transfer(a, b, amount(100)).await })
            })
            .collect();

        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(store.get_account(a).await.unwrap().balance, 0);
        assert_eq!(store.get_account(b).await.unwrap().balance, 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_direction_transfers_do_not_deadlock() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let a = funded(&store, "alice", 50_000).await;
        let b = funded(&store, "bob", 50_000).await;

        let mut tasks = Vec::new();
        for i in 0..2_000 {
            let store = store.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            tasks.push(tokio::spawn(async move {
                store.transfer(from, to, amount(50)).await
            }));
        }

        let joined = tokio::time::timeout(std::time::Duration::from_secs(30), async {
            for t in tasks {
                t.await.unwrap().unwrap();
            }
        })
        .await;
        assert!(joined.is_ok(), "transfers did not finish");

        assert_eq!(store.get_account(a).await.unwrap().balance, 50_000);
        assert_eq!(store.get_account(b).await.unwrap().balance, 50_000);
    }

    #[test]
    fn held_account_does_not_block_other_accounts() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let a = store.create_account_sync("alice").unwrap();
        let b = store.create_account_sync("bob").unwrap();
        let c = store.create_account_sync("carol").unwrap();

        let held = store.account(a).unwrap();
        let _guard = held.ledger.lock().unwrap();
        let _trail = held.records().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = store.clone();
        std::thread::spawn(move || {
            let key = generate_key(OperationType::Deposit, b, amount(100));
            let result = worker
                .deposit_sync(b, amount(100), &key)
                .and_then(|_| worker.withdraw_sync(b, amount(30)))
                .and_then(|_| worker.transfer_sync(b, c, amount(20)))
                .and_then(|_| worker.list_transactions_sync(b, 10));
            let _ = tx.send(result);
        });

        let history = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("operations on b waited for a's locks")
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].balance_after, 50);
    }

    #[tokio::test]
    async fn reused_key_for_another_operation_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let a = store.create_account("alice").await.unwrap();
        let b = store.create_account("bob").await.unwrap();
        let key = IdempotencyKey::from_caller_token(a, "req-1");
        store.deposit(a, amount(1_000), &key).await.unwrap();

        assert!(matches!(
            store.deposit(b, amount(5), &key).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            store.deposit(a, amount(5), &key).await,
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(store.get_account(a).await.unwrap().balance, 1_000);
        assert_eq!(store.get_account(b).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn same_caller_token_on_two_accounts_applies_to_each() {
        let store = InMemoryLedgerStore::new();
        let a = store.create_account("alice").await.unwrap();
        let b = store.create_account("bob").await.unwrap();

        let on_a = IdempotencyKey::from_caller_token(a, "req-1");
        let on_b = IdempotencyKey::from_caller_token(b, "req-1");
        assert!(!store.deposit(a, amount(1_000), &on_a).await.unwrap().is_duplicate());
        let outcome = store.deposit(b, amount(5), &on_b).await.unwrap();

        assert!(!outcome.is_duplicate());
        assert_eq!(outcome.account().balance, 5);
        assert_eq!(store.get_account(a).await.unwrap().balance, 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeliveries_apply_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let a = store.create_account("alice").await.unwrap();
        let key = generate_key(OperationType::Deposit, a, amount(250));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.deposit(a, amount(250), &key).await })
            })
            .collect();

        let mut applied = 0;
        for t in tasks {
            if !t.await.unwrap().unwrap().is_duplicate() {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(store.get_account(a).await.unwrap().balance, 250);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Withdraw { account: usize, amount: i64 },
        Transfer { from: usize, to: usize, amount: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1i64..400).prop_map(|(account, amount)| Op::Withdraw { account, amount }),
            (0usize..3, 0usize..3, 1i64..400)
                .prop_map(|(from, to, amount)| Op::Transfer { from, to, amount }),
        ]
    }

    proptest! {
        #[test]
        fn random_operations_keep_balances_consistent(ops in prop::collection::vec(op(), 1..60)) {
            let store = InMemoryLedgerStore::new();
            let ids: Vec<AccountId> = (0..3)
                .map(|n| store.create_account_sync(&format!("p{n}")).unwrap())
                .collect();
            for id in &ids {
                let key = generate_key(OperationType::Deposit, *id, amount(500));
                store.deposit_sync(*id, amount(500), &key).unwrap();
            }

            let mut withdrawn = 0;
            for op in ops {
                match op {
                    Op::Withdraw { account, amount: n } => {
                        if store.withdraw_sync(ids[account], amount(n)).is_ok() {
                            withdrawn += n;
                        }
                    }
                    Op::Transfer { from, to, amount: n } => {
                        let result = store.transfer_sync(ids[from], ids[to], amount(n));
                        if from == to {
                            prop_assert!(matches!(result, Err(LedgerError::Validation(_))));
                        }
                    }
                }
            }

            let balances: Vec<i64> = ids
                .iter()
                .map(|id| store.account(*id).unwrap().ledger.get_balance().unwrap())
                .collect();
            prop_assert!(balances.iter().all(|b| *b >= 0));
            prop_assert_eq!(balances.iter().sum::<i64>(), 1_500 - withdrawn);
        }
    }
}
