use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::Account;
use crate::AccountId;
use crate::AccountKind;
use crate::AccountStore;
use crate::BalanceStore;
use crate::Currency;
use crate::LedgerResult;
use crate::SystemPurpose;

/// Owner id for every SYSTEM-kind account (§4.4: "reserved System User").
pub const SYSTEM_USER_ID: &str = "system";

/// Lazily materializes the DEPOSITS/WITHDRAWALS/FEES counter-party accounts
/// per currency and caches their identity for the life of the process.
/// System accounts are never deleted or moved, so the cache never needs
/// invalidation — only a create-once guard for the cold path.
pub struct SystemAccountRouter {
    accounts: Arc<dyn AccountStore>,
    balances: Arc<dyn BalanceStore>,
    cache: RwLock<HashMap<(SystemPurpose, Currency), AccountId>>,
    create_guard: Mutex<()>,
}

impl SystemAccountRouter {
    pub fn new(accounts: Arc<dyn AccountStore>, balances: Arc<dyn BalanceStore>) -> Self {
        Self {
            accounts,
            balances,
            cache: RwLock::new(HashMap::new()),
            create_guard: Mutex::new(()),
        }
    }

    pub async fn system_account(
        &self,
        purpose: SystemPurpose,
        currency: Currency,
    ) -> LedgerResult<AccountId> {
        if let Some(id) = self.cache.read().await.get(&(purpose, currency)) {
            return Ok(id.clone());
        }

        // Cold path: only one caller per process creates the row for a
        // given (purpose, currency); everyone else rediscovers it.
        let _guard = self.create_guard.lock().await;
        if let Some(id) = self.cache.read().await.get(&(purpose, currency)) {
            return Ok(id.clone());
        }

        let account = self.materialize(currency).await?;
        self.cache
            .write()
            .await
            .insert((purpose, currency), account.id.clone());
        Ok(account.id)
    }

    async fn materialize(&self, currency: Currency) -> LedgerResult<Account> {
        let now = Utc::now();
        let account = self
            .accounts
            .register_account(SYSTEM_USER_ID, AccountKind::System, currency, now)
            .await?;
        self.balances
            .init_balance(&account.id, currency, Decimal::ZERO, now)
            .await?;
        Ok(account)
    }
}
