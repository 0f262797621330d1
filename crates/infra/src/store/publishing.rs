use async_trait::async_trait;
use tracing::warn;

use ledgerline_core::{
    Account, AccountId, Amount, DepositOutcome, IdempotencyKey, LedgerResult, TransactionRecord,
    TransferReceipt,
};
use ledgerline_events::{EventBus, LedgerEvent};

use super::r#trait::LedgerStore;

/// Adapter that publishes a `LedgerEvent` after a mutation commits.
///
/// Ordering invariant: **publish happens only after the store call succeeds**.
/// Duplicate deposits are not republished. A failed publish is logged; the
/// mutation itself has already committed and is reported as successful.
#[derive(Debug)]
pub struct PublishingLedgerStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingLedgerStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> PublishingLedgerStore<S, B>
where
    B: EventBus<LedgerEvent>,
{
    fn publish(&self, event: LedgerEvent) {
        if let Err(err) = self.bus.publish(event) {
            warn!(error = %err, "ledger event not published");
        }
    }
}

#[async_trait]
impl<S, B> LedgerStore for PublishingLedgerStore<S, B>
where
    S: LedgerStore,
    B: EventBus<LedgerEvent>,
{
    async fn create_account(&self, owner: &str) -> LedgerResult<AccountId> {
        self.store.create_account(owner).await
    }

    async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.store.get_account(id).await
    }

    async fn withdraw(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        let account = self.store.withdraw(id, amount).await?;
        self.publish(LedgerEvent::withdrawn(&account, amount.get()));
        Ok(account)
    }

    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> LedgerResult<TransferReceipt> {
        let receipt = self.store.transfer(from, to, amount).await?;
        self.publish(LedgerEvent::transferred(&receipt, amount.get()));
        Ok(receipt)
    }

    async fn deposit(
        &self,
        id: AccountId,
        amount: Amount,
        key: &IdempotencyKey,
    ) -> LedgerResult<DepositOutcome> {
        let outcome = self.store.deposit(id, amount, key).await?;
        if let DepositOutcome::Applied(account) = &outcome {
            self.publish(LedgerEvent::deposited(account, amount.get()));
        }
        Ok(outcome)
    }

    async fn list_transactions(
        &self,
        id: AccountId,
        limit: u32,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.store.list_transactions(id, limit).await
    }

    async fn reset(&self) -> LedgerResult<()> {
        self.store.reset().await
    }
}
