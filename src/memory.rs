use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Datelike;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::Account;
use crate::AccountId;
use crate::AccountKind;
use crate::AccountStats;
use crate::AccountStore;
use crate::Balance;
use crate::BalanceStore;
use crate::CurrencyTotal;
use crate::DailyTrendPoint;
use crate::Direction;
use crate::DirectionTypeStat;
use crate::Entry;
use crate::IdentifierMint;
use crate::JournalStore;
use crate::LedgerEngine;
use crate::LedgerError;
use crate::LedgerResult;
use crate::MonthlyTrendPoint;
use crate::NetFlow;
use crate::Paging;
use crate::PostingSide;
use crate::ReversalInput;
use crate::Currency;
use crate::EngineConfig;
use crate::AmountInput;
use crate::SweepReport;
use crate::SystemAccountRouter;
use crate::SystemPurpose;
use crate::StatsWindow;
use crate::Transaction;
use crate::TransactionFilter;
use crate::TransactionKind;
use crate::TransactionStatus;
use crate::TransferInput;
use crate::TypeStat;
use crate::UserStats;
use std::sync::Arc;

fn signed_delta(side: PostingSide, amount: Decimal) -> Decimal {
    match side {
        PostingSide::Credit => amount,
        PostingSide::Debit => -amount,
    }
}

fn flip(side: PostingSide) -> PostingSide {
    match side {
        PostingSide::Debit => PostingSide::Credit,
        PostingSide::Credit => PostingSide::Debit,
    }
}

fn paginate(mut rows: Vec<Transaction>, paging: Paging) -> Vec<Transaction> {
    rows.sort_by(|a, b| match paging.sort_dir {
        crate::SortDir::Asc => a.created_at.cmp(&b.created_at),
        crate::SortDir::Desc => b.created_at.cmp(&a.created_at),
    });
    let start = ((paging.page - 1) as usize).saturating_mul(paging.limit as usize);
    rows.into_iter().skip(start).take(paging.limit as usize).collect()
}

/// Validates invariants T1, T2, and T4 before a transaction is admitted to
/// the journal. T3 (currency purity across entries) is enforced upstream —
/// the engine only ever builds entries from accounts it has already checked
/// against the transaction's declared currency.
fn validate_for_append(tx: &Transaction) -> LedgerResult<()> {
    if tx.entries.len() < 2 {
        return Err(LedgerError::BadRequest(
            "a transaction must contain at least two entries".into(),
        ));
    }
    if !tx.is_balanced() {
        return Err(LedgerError::BadRequest(
            "transaction entries are not balanced".into(),
        ));
    }
    if tx.debit_total() != tx.amount || tx.credit_total() != tx.amount {
        return Err(LedgerError::BadRequest(
            "declared amount does not match entry totals".into(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct AccountState {
    by_id: HashMap<AccountId, Account>,
    by_number: HashMap<String, AccountId>,
}

/// In-memory reference implementation of `AccountStore`. Holds every row
/// behind one lock; fine for the single-process reference engine, swappable
/// for a real row-store behind the same trait.
pub struct InMemoryAccountStore {
    state: Mutex<AccountState>,
    mint: IdentifierMint,
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccountState::default()),
            mint: IdentifierMint::new(),
        }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn register_account(
        &self,
        owner_id: &str,
        kind: AccountKind,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;
        let account_number = loop {
            let candidate = self.mint.mint_account_number();
            if !state.by_number.contains_key(&candidate) {
                break candidate;
            }
        };
        let id = self.mint.mint_transaction_id("ACC");
        let account = Account {
            id: id.clone(),
            account_number: account_number.clone(),
            owner_id: owner_id.to_string(),
            kind,
            currency,
            active: true,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        state.by_number.insert(account_number, id.clone());
        state.by_id.insert(id, account.clone());
        Ok(account)
    }

    async fn find_by_number(&self, account_number: &str) -> LedgerResult<Account> {
        let state = self.state.lock().await;
        let id = state
            .by_number
            .get(account_number)
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_number} not found")))?;
        state
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_number} not found")))
    }

    async fn find_by_id(&self, account_id: &str) -> LedgerResult<Account> {
        let state = self.state.lock().await;
        state
            .by_id
            .get(account_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_id} not found")))
    }

    async fn set_active(
        &self,
        account_number: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;
        let id = state
            .by_number
            .get(account_number)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_number} not found")))?;
        let account = state
            .by_id
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_number} not found")))?;
        account.active = active;
        account.updated_at = now;
        account.version += 1;
        Ok(account.clone())
    }
}

/// In-memory reference implementation of `BalanceStore`. `write_balance`
/// enforces the optimistic-CAS contract for real, independent of whatever
/// coarser locking a particular engine wraps around it.
#[derive(Default)]
pub struct InMemoryBalanceStore {
    rows: Mutex<HashMap<AccountId, Balance>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn read_balance(&self, account_id: &str) -> LedgerResult<Balance> {
        let rows = self.rows.lock().await;
        rows.get(account_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("balance for account {account_id} not found")))
    }

    async fn write_balance(
        &self,
        account_id: &str,
        expected_version: u64,
        new_amount: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<Balance> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("balance for account {account_id} not found")))?;
        if row.version != expected_version {
            return Err(LedgerError::Conflict(format!(
                "balance for account {account_id} moved from version {expected_version} to {}",
                row.version
            )));
        }
        row.amount = new_amount;
        row.last_updated = now;
        row.version += 1;
        Ok(row.clone())
    }

    async fn init_balance(
        &self,
        account_id: &str,
        currency: Currency,
        initial_amount: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<Balance> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(account_id) {
            return Err(LedgerError::Conflict(format!(
                "balance for account {account_id} already initialized"
            )));
        }
        let balance = Balance {
            account_id: account_id.to_string(),
            currency,
            amount: initial_amount,
            last_updated: now,
            version: 0,
        };
        rows.insert(account_id.to_string(), balance.clone());
        Ok(balance)
    }
}

#[derive(Default)]
struct JournalState {
    by_id: HashMap<String, Transaction>,
    by_tx_id: HashMap<String, String>,
}

/// In-memory reference implementation of `JournalStore`. Query methods scan
/// the full row set; fine for the reference engine's test-scale volumes, not
/// meant to model an indexed production store.
#[derive(Default)]
pub struct InMemoryJournalStore {
    state: Mutex<JournalState>,
}

impl InMemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn append_transaction(&self, mut tx: Transaction) -> LedgerResult<Transaction> {
        validate_for_append(&tx)?;
        let mut state = self.state.lock().await;
        if state.by_tx_id.contains_key(&tx.transaction_id) {
            return Err(LedgerError::Conflict(format!(
                "transaction id {} already exists",
                tx.transaction_id
            )));
        }
        tx.status = TransactionStatus::Processing;
        state.by_tx_id.insert(tx.transaction_id.clone(), tx.id.clone());
        state.by_id.insert(tx.id.clone(), tx.clone());
        Ok(tx)
    }

    async fn mark_status(
        &self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Transaction> {
        let mut state = self.state.lock().await;
        let tx = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id} not found")))?;
        match status {
            TransactionStatus::Processing => tx.mark_processing(now)?,
            TransactionStatus::Completed => tx.mark_completed(now)?,
            TransactionStatus::Failed => tx.mark_failed(failure_reason.unwrap_or_default(), now)?,
            TransactionStatus::Cancelled => tx.mark_cancelled(now)?,
            TransactionStatus::Pending => {
                return Err(LedgerError::IllegalStateTransition {
                    from: tx.status,
                    to: TransactionStatus::Pending,
                });
            }
        }
        Ok(tx.clone())
    }

    async fn find_by_tx_id(&self, tx_id: &str) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .by_tx_id
            .get(tx_id)
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.by_id.get(id).cloned())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
        paging: &Paging,
    ) -> LedgerResult<Vec<Transaction>> {
        let paging = paging.normalize()?;
        let state = self.state.lock().await;
        let rows: Vec<Transaction> = state
            .by_id
            .values()
            .filter(|tx| tx.initiator_user_id == user_id && filter.matches(tx))
            .cloned()
            .collect();
        Ok(paginate(rows, paging))
    }

    async fn list_by_account(
        &self,
        account_number: &str,
        filter: &TransactionFilter,
        paging: &Paging,
    ) -> LedgerResult<Vec<Transaction>> {
        let paging = paging.normalize()?;
        let state = self.state.lock().await;
        let rows: Vec<Transaction> = state
            .by_id
            .values()
            .filter(|tx| {
                let touches = tx.from_account_number.as_deref() == Some(account_number)
                    || tx.to_account_number.as_deref() == Some(account_number);
                touches && filter.matches(tx)
            })
            .cloned()
            .collect();
        Ok(paginate(rows, paging))
    }

    async fn aggregate_by_user(&self, user_id: &str, window: &StatsWindow) -> LedgerResult<UserStats> {
        let state = self.state.lock().await;
        let mut summary: HashMap<Currency, (u64, Decimal)> = HashMap::new();
        let mut by_type: HashMap<(TransactionKind, Currency), (u64, Decimal)> = HashMap::new();
        let mut monthly: HashMap<(i32, u32, TransactionKind), (u64, Decimal)> = HashMap::new();

        for tx in state.by_id.values() {
            if tx.initiator_user_id != user_id
                || tx.status != TransactionStatus::Completed
                || !window.contains(tx.created_at)
            {
                continue;
            }
            let s = summary.entry(tx.currency).or_insert((0, Decimal::ZERO));
            s.0 += 1;
            s.1 += tx.amount;

            let t = by_type.entry((tx.kind, tx.currency)).or_insert((0, Decimal::ZERO));
            t.0 += 1;
            t.1 += tx.amount;

            let key = (tx.created_at.year(), tx.created_at.month(), tx.kind);
            let m = monthly.entry(key).or_insert((0, Decimal::ZERO));
            m.0 += 1;
            m.1 += tx.amount;
        }

        let mut summary: Vec<CurrencyTotal> = summary
            .into_iter()
            .map(|(currency, (count, total))| CurrencyTotal { currency, count, total })
            .collect();
        summary.sort_by_key(|row| row.currency.code());

        let mut by_type: Vec<TypeStat> = by_type
            .into_iter()
            .map(|((kind, currency), (count, total))| TypeStat {
                kind,
                currency,
                count,
                total,
            })
            .collect();
        by_type.sort_by_key(|row| (row.currency.code(), format!("{:?}", row.kind)));

        let mut monthly_trend: Vec<MonthlyTrendPoint> = monthly
            .into_iter()
            .map(|((year, month, kind), (count, total))| MonthlyTrendPoint {
                year,
                month,
                kind,
                count,
                total,
            })
            .collect();
        monthly_trend.sort_by_key(|row| (row.year, row.month, format!("{:?}", row.kind)));

        Ok(UserStats {
            summary,
            by_type,
            monthly_trend,
        })
    }

    async fn aggregate_by_account(
        &self,
        account_number: &str,
        window: &StatsWindow,
    ) -> LedgerResult<AccountStats> {
        let state = self.state.lock().await;
        let mut net: HashMap<Currency, Decimal> = HashMap::new();
        let mut by_direction: HashMap<(Direction, TransactionKind, Currency), (u64, Decimal)> = HashMap::new();
        let mut daily: HashMap<(chrono::NaiveDate, Direction), (u64, Decimal)> = HashMap::new();

        for tx in state.by_id.values() {
            if tx.status != TransactionStatus::Completed || !window.contains(tx.created_at) {
                continue;
            }
            let touches_to = tx.to_account_number.as_deref() == Some(account_number);
            let touches_from = tx.from_account_number.as_deref() == Some(account_number);
            if !touches_to && !touches_from {
                continue;
            }
            let direction = if touches_to {
                Direction::Incoming
            } else {
                Direction::Outgoing
            };
            let signed = match direction {
                Direction::Incoming => tx.amount,
                Direction::Outgoing => -tx.amount,
            };
            *net.entry(tx.currency).or_insert(Decimal::ZERO) += signed;

            let d = by_direction
                .entry((direction, tx.kind, tx.currency))
                .or_insert((0, Decimal::ZERO));
            d.0 += 1;
            d.1 += tx.amount;

            let date = tx.created_at.date_naive();
            let e = daily.entry((date, direction)).or_insert((0, Decimal::ZERO));
            e.0 += 1;
            e.1 += tx.amount;
        }

        let mut net_flow: Vec<NetFlow> = net
            .into_iter()
            .map(|(currency, net)| NetFlow { currency, net })
            .collect();
        net_flow.sort_by_key(|row| row.currency.code());

        let mut by_direction_and_type: Vec<DirectionTypeStat> = by_direction
            .into_iter()
            .map(|((direction, kind, currency), (count, total))| DirectionTypeStat {
                direction,
                kind,
                currency,
                count,
                total,
            })
            .collect();
        by_direction_and_type.sort_by_key(|row| {
            (
                format!("{:?}", row.direction),
                row.currency.code(),
                format!("{:?}", row.kind),
            )
        });

        let mut daily_trend: Vec<DailyTrendPoint> = daily
            .into_iter()
            .map(|((date, direction), (count, total))| DailyTrendPoint {
                date,
                direction,
                count,
                total,
            })
            .collect();
        daily_trend.sort_by_key(|row| (row.date, format!("{:?}", row.direction)));

        Ok(AccountStats {
            net_flow,
            by_direction_and_type,
            daily_trend,
        })
    }

    async fn select_pending_older_than(&self, older_than: DateTime<Utc>) -> LedgerResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .by_id
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn find_reversal_of(&self, original_transaction_id: &str) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .by_id
            .values()
            .find(|tx| {
                tx.kind == TransactionKind::Reversal
                    && tx.status == TransactionStatus::Completed
                    && tx.metadata.get("originalTransactionId").map(String::as_str)
                        == Some(original_transaction_id)
            })
            .cloned())
    }
}

/// Reference `LedgerEngine`: one coarse commit lock serializes every
/// primitive so the optimistic `BalanceStore::write_balance` contract never
/// actually races against itself here (a persistent backend behind the same
/// traits would rely on the CAS check, not this lock, for that).
pub struct InMemoryLedgerEngine {
    accounts: Arc<dyn AccountStore>,
    balances: Arc<dyn BalanceStore>,
    journal: Arc<dyn JournalStore>,
    router: SystemAccountRouter,
    mint: IdentifierMint,
    config: EngineConfig,
    commit_lock: Mutex<()>,
}

impl InMemoryLedgerEngine {
    pub fn new(config: EngineConfig) -> Self {
        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
        let balances: Arc<dyn BalanceStore> = Arc::new(InMemoryBalanceStore::new());
        let journal: Arc<dyn JournalStore> = Arc::new(InMemoryJournalStore::new());
        Self::with_stores(accounts, balances, journal, config)
    }

    /// Builds the engine over externally supplied stores. Used by tests that
    /// need a fault-injecting `BalanceStore` double, and by anyone wiring a
    /// persistent backend behind the same three traits.
    pub fn with_stores(
        accounts: Arc<dyn AccountStore>,
        balances: Arc<dyn BalanceStore>,
        journal: Arc<dyn JournalStore>,
        config: EngineConfig,
    ) -> Self {
        let router = SystemAccountRouter::new(accounts.clone(), balances.clone());
        Self {
            accounts,
            balances,
            journal,
            router,
            mint: IdentifierMint::new(),
            config,
            commit_lock: Mutex::new(()),
        }
    }

    /// Opens a customer account and its zero balance row. Not part of the
    /// five primitives; ambient scaffolding the commit frame's account loads
    /// otherwise have nothing to load.
    pub async fn register_account(
        &self,
        owner_id: &str,
        kind: AccountKind,
        currency: Currency,
        initial_amount: Decimal,
    ) -> LedgerResult<Account> {
        let now = Utc::now();
        let account = self.accounts.register_account(owner_id, kind, currency, now).await?;
        self.balances
            .init_balance(&account.id, currency, initial_amount, now)
            .await?;
        Ok(account)
    }

    /// Reads a single account's current balance row. Ambient introspection
    /// alongside `register_account`; not one of the five primitives.
    pub async fn balance_of(&self, account_id: &str) -> LedgerResult<Balance> {
        self.balances.read_balance(account_id).await
    }

    async fn load_active_account(&self, account_number: &str, expected_currency: Currency) -> LedgerResult<Account> {
        let account = self.accounts.find_by_number(account_number).await?;
        if !account.active {
            return Err(LedgerError::InactiveAccount {
                account_id: account.id.clone(),
            });
        }
        if account.currency != expected_currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: expected_currency,
                found: account.currency,
            });
        }
        Ok(account)
    }

    async fn fail_transaction(&self, id: &str, now: DateTime<Utc>, err: LedgerError) -> LedgerError {
        let reason = err.to_string();
        let _ = self.journal.mark_status(id, TransactionStatus::Failed, Some(reason), now).await;
        err
    }

    /// Runs `op` inside the commit lock with bounded retry on `Conflict`,
    /// the engine-internal retry budget from `EngineConfig::max_retries`.
    async fn with_commit_retry<F, Fut, T>(&self, mut op: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = {
                let _guard = self.commit_lock.lock().await;
                op().await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(LedgerError::Conflict(reason)) => {
                    if attempt >= self.config.max_retries {
                        return Err(LedgerError::ConcurrencyExhausted { attempts: attempt });
                    }
                    attempt += 1;
                    tracing::warn!(attempt, %reason, "retrying ledger commit after conflict");
                    tokio::time::sleep(self.config.base_backoff * attempt).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    #[tracing::instrument(skip(self, input), fields(kind = ?kind, currency = %input.currency))]
    async fn try_commit_customer_vs_system(
        &self,
        kind: TransactionKind,
        purpose: SystemPurpose,
        customer_side: PostingSide,
        input: &AmountInput,
    ) -> LedgerResult<Transaction> {
        let now = Utc::now();
        let customer = self.load_active_account(&input.account_number, input.currency).await?;
        let customer_balance = self.balances.read_balance(&customer.id).await?;
        let system_account_id = self.router.system_account(purpose, input.currency).await?;
        let system_balance = self.balances.read_balance(&system_account_id).await?;

        let new_customer_amount = customer_balance.amount + signed_delta(customer_side, input.amount);
        if customer_side == PostingSide::Debit
            && new_customer_amount < Decimal::ZERO
            && !self.config.allows_negative(customer.kind)
        {
            tracing::debug!(account_id = %customer.id, "rejecting for insufficient funds");
            return Err(LedgerError::InsufficientFunds {
                available: customer_balance.amount,
                requested: input.amount,
            });
        }

        let system_side = flip(customer_side);
        let new_system_amount = system_balance.amount + signed_delta(system_side, input.amount);

        let (from_account_number, to_account_number) = match customer_side {
            PostingSide::Credit => (None, Some(customer.account_number.clone())),
            PostingSide::Debit => (Some(customer.account_number.clone()), None),
        };

        let tx = Transaction {
            id: self.mint.mint_transaction_id("ROW"),
            transaction_id: self.mint.mint_transaction_id(kind.id_prefix()),
            kind,
            initiator_user_id: input.user_id.clone(),
            entries: vec![
                Entry {
                    account_id: customer.id.clone(),
                    side: customer_side,
                    amount: input.amount,
                },
                Entry {
                    account_id: system_account_id.clone(),
                    side: system_side,
                    amount: input.amount,
                },
            ],
            amount: input.amount,
            currency: input.currency,
            from_account_number,
            to_account_number,
            status: TransactionStatus::Pending,
            description: input.description.clone().unwrap_or_default(),
            reference: input.reference.clone(),
            metadata: input.metadata.clone(),
            failure_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.journal.append_transaction(tx).await?;

        if let Err(e) = self
            .balances
            .write_balance(&customer.id, customer_balance.version, new_customer_amount, now)
            .await
        {
            return Err(self.fail_transaction(&tx.id, now, e).await);
        }
        if let Err(e) = self
            .balances
            .write_balance(&system_account_id, system_balance.version, new_system_amount, now)
            .await
        {
            return Err(self.fail_transaction(&tx.id, now, e).await);
        }

        self.journal.mark_status(&tx.id, TransactionStatus::Completed, None, now).await
    }

    #[tracing::instrument(skip(self, input), fields(kind = ?TransactionKind::Transfer, currency = %input.currency))]
    async fn try_commit_transfer(&self, input: &TransferInput) -> LedgerResult<Transaction> {
        let now = Utc::now();
        let from = self.load_active_account(&input.from_account_number, input.currency).await?;
        if from.owner_id != input.user_id {
            tracing::debug!(account_id = %from.id, "rejecting transfer from a non-owner caller");
            return Err(LedgerError::BadRequest(
                "caller does not own the source account".into(),
            ));
        }
        let to = self.load_active_account(&input.to_account_number, input.currency).await?;
        let from_balance = self.balances.read_balance(&from.id).await?;
        let to_balance = self.balances.read_balance(&to.id).await?;

        let new_from_amount = from_balance.amount - input.amount;
        if new_from_amount < Decimal::ZERO && !self.config.allows_negative(from.kind) {
            tracing::debug!(account_id = %from.id, "rejecting for insufficient funds");
            return Err(LedgerError::InsufficientFunds {
                available: from_balance.amount,
                requested: input.amount,
            });
        }
        let new_to_amount = to_balance.amount + input.amount;

        let tx = Transaction {
            id: self.mint.mint_transaction_id("ROW"),
            transaction_id: self.mint.mint_transaction_id(TransactionKind::Transfer.id_prefix()),
            kind: TransactionKind::Transfer,
            initiator_user_id: input.user_id.clone(),
            entries: vec![
                Entry {
                    account_id: from.id.clone(),
                    side: PostingSide::Debit,
                    amount: input.amount,
                },
                Entry {
                    account_id: to.id.clone(),
                    side: PostingSide::Credit,
                    amount: input.amount,
                },
            ],
            amount: input.amount,
            currency: input.currency,
            from_account_number: Some(from.account_number.clone()),
            to_account_number: Some(to.account_number.clone()),
            status: TransactionStatus::Pending,
            description: input.description.clone().unwrap_or_default(),
            reference: input.reference.clone(),
            metadata: input.metadata.clone(),
            failure_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.journal.append_transaction(tx).await?;

        if let Err(e) = self
            .balances
            .write_balance(&from.id, from_balance.version, new_from_amount, now)
            .await
        {
            return Err(self.fail_transaction(&tx.id, now, e).await);
        }
        if let Err(e) = self
            .balances
            .write_balance(&to.id, to_balance.version, new_to_amount, now)
            .await
        {
            return Err(self.fail_transaction(&tx.id, now, e).await);
        }

        self.journal.mark_status(&tx.id, TransactionStatus::Completed, None, now).await
    }

    #[tracing::instrument(skip(self, input), fields(kind = ?TransactionKind::Reversal, original = %input.original_transaction_id))]
    async fn try_commit_reversal(&self, input: &ReversalInput) -> LedgerResult<Transaction> {
        if input.caller_role != crate::Role::Admin {
            tracing::debug!("rejecting reversal from a non-admin caller");
            return Err(LedgerError::BadRequest(
                "reversal requires the admin role".into(),
            ));
        }
        let original = self
            .journal
            .find_by_tx_id(&input.original_transaction_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "transaction {} not found",
                    input.original_transaction_id
                ))
            })?;
        if original.status != TransactionStatus::Completed {
            tracing::debug!(status = ?original.status, "rejecting reversal of a non-completed transaction");
            return Err(LedgerError::BadRequest(format!(
                "transaction {} is not completed",
                original.transaction_id
            )));
        }
        if self.journal.find_reversal_of(&original.transaction_id).await?.is_some() {
            tracing::debug!("rejecting duplicate reversal");
            return Err(LedgerError::AlreadyReversed {
                original_transaction_id: original.transaction_id.clone(),
            });
        }

        let now = Utc::now();
        let reversed_entries: Vec<Entry> = original
            .entries
            .iter()
            .map(|e| Entry {
                account_id: e.account_id.clone(),
                side: flip(e.side),
                amount: e.amount,
            })
            .collect();

        let mut deltas: HashMap<AccountId, Decimal> = HashMap::new();
        for entry in &reversed_entries {
            *deltas.entry(entry.account_id.clone()).or_insert(Decimal::ZERO) += signed_delta(entry.side, entry.amount);
        }

        let mut rows = Vec::with_capacity(deltas.len());
        for (account_id, delta) in deltas {
            let account = self.accounts.find_by_id(&account_id).await?;
            let balance = self.balances.read_balance(&account_id).await?;
            let new_amount = balance.amount + delta;
            if new_amount < Decimal::ZERO && !self.config.allows_negative(account.kind) {
                tracing::debug!(account_id = %account_id, "rejecting reversal for insufficient funds");
                return Err(LedgerError::InsufficientFunds {
                    available: balance.amount,
                    requested: -delta,
                });
            }
            rows.push((account_id, balance.version, new_amount));
        }

        let mut metadata = input.metadata.clone();
        metadata.insert("originalTransactionId".into(), original.transaction_id.clone());
        metadata.insert("reversalReason".into(), input.reason.clone());

        let tx = Transaction {
            id: self.mint.mint_transaction_id("ROW"),
            transaction_id: self.mint.mint_transaction_id(TransactionKind::Reversal.id_prefix()),
            kind: TransactionKind::Reversal,
            initiator_user_id: input.user_id.clone(),
            entries: reversed_entries,
            amount: original.amount,
            currency: original.currency,
            from_account_number: original.to_account_number.clone(),
            to_account_number: original.from_account_number.clone(),
            status: TransactionStatus::Pending,
            description: format!("Reversal of {}", original.transaction_id),
            reference: Some(original.transaction_id.clone()),
            metadata,
            failure_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.journal.append_transaction(tx).await?;

        for (account_id, version, new_amount) in rows {
            if let Err(e) = self.balances.write_balance(&account_id, version, new_amount, now).await {
                return Err(self.fail_transaction(&tx.id, now, e).await);
            }
        }

        self.journal.mark_status(&tx.id, TransactionStatus::Completed, None, now).await
    }

    async fn sweep_one(&self, tx: Transaction) -> Result<(), (String, LedgerError)> {
        let now = Utc::now();
        let _guard = self.commit_lock.lock().await;
        let tx_id = tx.transaction_id.clone();
        let row_id = tx.id.clone();

        let processing = self
            .journal
            .mark_status(&row_id, TransactionStatus::Processing, None, now)
            .await
            .map_err(|e| (tx_id.clone(), e))?;

        let mut deltas: HashMap<AccountId, Decimal> = HashMap::new();
        for entry in &processing.entries {
            *deltas.entry(entry.account_id.clone()).or_insert(Decimal::ZERO) += signed_delta(entry.side, entry.amount);
        }

        let mut rows = Vec::with_capacity(deltas.len());
        for (account_id, delta) in deltas {
            let account = match self.accounts.find_by_id(&account_id).await {
                Ok(account) => account,
                Err(e) => {
                    let _ = self
                        .journal
                        .mark_status(&row_id, TransactionStatus::Failed, Some(e.to_string()), now)
                        .await;
                    return Err((tx_id, e));
                }
            };
            let balance = match self.balances.read_balance(&account_id).await {
                Ok(balance) => balance,
                Err(e) => {
                    let _ = self
                        .journal
                        .mark_status(&row_id, TransactionStatus::Failed, Some(e.to_string()), now)
                        .await;
                    return Err((tx_id, e));
                }
            };
            let new_amount = balance.amount + delta;
            if new_amount < Decimal::ZERO && !self.config.allows_negative(account.kind) {
                let err = LedgerError::InsufficientFunds {
                    available: balance.amount,
                    requested: -delta,
                };
                tracing::debug!(tx_id = %tx_id, "sweep failing transaction for insufficient funds");
                let _ = self
                    .journal
                    .mark_status(&row_id, TransactionStatus::Failed, Some(err.to_string()), now)
                    .await;
                return Err((tx_id, err));
            }
            rows.push((account_id, balance.version, new_amount));
        }

        for (account_id, version, new_amount) in rows {
            if let Err(e) = self.balances.write_balance(&account_id, version, new_amount, now).await {
                tracing::debug!(tx_id = %tx_id, error = %e, "sweep failing transaction on balance write");
                let _ = self
                    .journal
                    .mark_status(&row_id, TransactionStatus::Failed, Some(e.to_string()), now)
                    .await;
                return Err((tx_id, e));
            }
        }

        self.journal
            .mark_status(&row_id, TransactionStatus::Completed, None, now)
            .await
            .map(|_| ())
            .map_err(|e| (tx_id, e))
    }
}

#[async_trait]
impl LedgerEngine for InMemoryLedgerEngine {
    async fn deposit(&self, input: AmountInput) -> LedgerResult<Transaction> {
        let input = input.normalize(&self.config)?;
        self.with_commit_retry(|| {
            self.try_commit_customer_vs_system(
                TransactionKind::Deposit,
                SystemPurpose::Deposits,
                PostingSide::Credit,
                &input,
            )
        })
        .await
    }

    async fn withdrawal(&self, input: AmountInput) -> LedgerResult<Transaction> {
        let input = input.normalize(&self.config)?;
        self.with_commit_retry(|| {
            self.try_commit_customer_vs_system(
                TransactionKind::Withdrawal,
                SystemPurpose::Withdrawals,
                PostingSide::Debit,
                &input,
            )
        })
        .await
    }

    async fn transfer(&self, input: TransferInput) -> LedgerResult<Transaction> {
        let input = input.normalize(&self.config)?;
        self.with_commit_retry(|| self.try_commit_transfer(&input)).await
    }

    async fn fee(&self, input: AmountInput) -> LedgerResult<Transaction> {
        let input = input.normalize(&self.config)?;
        self.with_commit_retry(|| {
            self.try_commit_customer_vs_system(TransactionKind::Fee, SystemPurpose::Fees, PostingSide::Debit, &input)
        })
        .await
    }

    async fn reversal(&self, input: ReversalInput) -> LedgerResult<Transaction> {
        let input = input.normalize()?;
        self.with_commit_retry(|| self.try_commit_reversal(&input)).await
    }

    async fn sweep_pending(&self, older_than: Duration) -> LedgerResult<SweepReport> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|_| LedgerError::BadRequest("invalid sweep threshold".into()))?;
        let pending = self.journal.select_pending_older_than(threshold).await?;
        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut failed_ids = Vec::new();
        for tx in pending {
            match self.sweep_one(tx).await {
                Ok(()) => processed += 1,
                Err((tx_id, _err)) => {
                    failed += 1;
                    failed_ids.push(tx_id);
                }
            }
        }
        Ok(SweepReport {
            processed,
            failed,
            failed_ids,
        })
    }

    async fn user_stats(&self, user_id: &str, window: StatsWindow) -> LedgerResult<UserStats> {
        self.journal.aggregate_by_user(user_id, &window).await
    }

    async fn account_stats(&self, account_number: &str, window: StatsWindow) -> LedgerResult<AccountStats> {
        self.journal.aggregate_by_account(account_number, &window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn engine() -> InMemoryLedgerEngine {
        InMemoryLedgerEngine::new(EngineConfig::default())
    }

    async fn open_account(engine: &InMemoryLedgerEngine, owner: &str, initial: Decimal) -> Account {
        engine
            .register_account(owner, AccountKind::Savings, Currency::Usd, initial)
            .await
            .expect("open account")
    }

    fn amount_input(account_number: &str, user_id: &str, amount: Decimal) -> AmountInput {
        AmountInput {
            user_id: user_id.to_string(),
            account_number: account_number.to_string(),
            amount,
            currency: Currency::Usd,
            description: None,
            reference: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn deposit_credits_the_customer_and_debits_the_system_account() {
        let engine = engine();
        let account = open_account(&engine, "user-1", dec!(0)).await;

        let tx = engine
            .deposit(amount_input(&account.account_number, "user-1", dec!(50.00)))
            .await
            .expect("deposit");
        assert_eq!(tx.status, TransactionStatus::Completed);

        let balance = engine.balances.read_balance(&account.id).await.expect("balance");
        assert_eq!(balance.amount, dec!(50.00));
    }

    #[tokio::test]
    async fn withdrawal_rejects_insufficient_funds() {
        let engine = engine();
        let account = open_account(&engine, "user-1", dec!(10.00)).await;

        let err = engine
            .withdrawal(amount_input(&account.account_number, "user-1", dec!(50.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let balance = engine.balances.read_balance(&account.id).await.expect("balance");
        assert_eq!(balance.amount, dec!(10.00));
    }

    #[tokio::test]
    async fn transfer_moves_funds_between_two_accounts() {
        let engine = engine();
        let from = open_account(&engine, "user-1", dec!(100.00)).await;
        let to = open_account(&engine, "user-2", dec!(0)).await;

        let tx = engine
            .transfer(TransferInput {
                user_id: "user-1".into(),
                from_account_number: from.account_number.clone(),
                to_account_number: to.account_number.clone(),
                amount: dec!(40.00),
                currency: Currency::Usd,
                description: None,
                reference: None,
                metadata: HashMap::new(),
            })
            .await
            .expect("transfer");
        assert_eq!(tx.status, TransactionStatus::Completed);

        assert_eq!(
            engine.balances.read_balance(&from.id).await.expect("from balance").amount,
            dec!(60.00)
        );
        assert_eq!(
            engine.balances.read_balance(&to.id).await.expect("to balance").amount,
            dec!(40.00)
        );
    }

    #[tokio::test]
    async fn transfer_rejects_callers_who_do_not_own_the_source_account() {
        let engine = engine();
        let from = open_account(&engine, "user-1", dec!(100.00)).await;
        let to = open_account(&engine, "user-2", dec!(0)).await;

        let err = engine
            .transfer(TransferInput {
                user_id: "user-2".into(),
                from_account_number: from.account_number.clone(),
                to_account_number: to.account_number.clone(),
                amount: dec!(10.00),
                currency: Currency::Usd,
                description: None,
                reference: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn reversal_requires_admin_role_and_undoes_a_completed_transfer() {
        let engine = engine();
        let from = open_account(&engine, "user-1", dec!(100.00)).await;
        let to = open_account(&engine, "user-2", dec!(0)).await;

        let tx = engine
            .transfer(TransferInput {
                user_id: "user-1".into(),
                from_account_number: from.account_number.clone(),
                to_account_number: to.account_number.clone(),
                amount: dec!(40.00),
                currency: Currency::Usd,
                description: None,
                reference: None,
                metadata: HashMap::new(),
            })
            .await
            .expect("transfer");

        let denied = engine
            .reversal(ReversalInput {
                user_id: "user-1".into(),
                original_transaction_id: tx.transaction_id.clone(),
                reason: "customer dispute".into(),
                caller_role: crate::Role::Customer,
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(denied, LedgerError::BadRequest(_)));

        let reversal = engine
            .reversal(ReversalInput {
                user_id: "admin-1".into(),
                original_transaction_id: tx.transaction_id.clone(),
                reason: "customer dispute".into(),
                caller_role: crate::Role::Admin,
                metadata: HashMap::new(),
            })
            .await
            .expect("reversal");
        assert_eq!(reversal.kind, TransactionKind::Reversal);

        assert_eq!(
            engine.balances.read_balance(&from.id).await.expect("from balance").amount,
            dec!(100.00)
        );
        assert_eq!(
            engine.balances.read_balance(&to.id).await.expect("to balance").amount,
            dec!(0)
        );

        let again = engine
            .reversal(ReversalInput {
                user_id: "admin-1".into(),
                original_transaction_id: tx.transaction_id.clone(),
                reason: "duplicate attempt".into(),
                caller_role: crate::Role::Admin,
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::AlreadyReversed { .. }));
    }

    #[tokio::test]
    async fn sweep_pending_completes_stale_transactions() {
        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
        let balances: Arc<dyn BalanceStore> = Arc::new(InMemoryBalanceStore::new());
        let now = Utc::now();
        let account = accounts
            .register_account("user-1", AccountKind::Savings, Currency::Usd, now)
            .await
            .expect("account");
        balances
            .init_balance(&account.id, Currency::Usd, dec!(0), now)
            .await
            .expect("init balance");

        let router = SystemAccountRouter::new(accounts.clone(), balances.clone());
        let system_account_id = router
            .system_account(SystemPurpose::Deposits, Currency::Usd)
            .await
            .expect("system account");

        // A row inserted directly into the journal, bypassing
        // `append_transaction`'s forced PENDING -> PROCESSING jump, to model
        // a transaction that crashed before the sweep ever ran.
        let stale_created_at = Utc::now() - chrono::Duration::hours(2);
        let pending_tx = Transaction {
            id: "row-stale-1".into(),
            transaction_id: "DEP-STALE-1".into(),
            kind: TransactionKind::Deposit,
            initiator_user_id: "user-1".into(),
            entries: vec![
                Entry {
                    account_id: account.id.clone(),
                    side: PostingSide::Credit,
                    amount: dec!(25.00),
                },
                Entry {
                    account_id: system_account_id.clone(),
                    side: PostingSide::Debit,
                    amount: dec!(25.00),
                },
            ],
            amount: dec!(25.00),
            currency: Currency::Usd,
            from_account_number: None,
            to_account_number: Some(account.account_number.clone()),
            status: TransactionStatus::Pending,
            description: String::new(),
            reference: None,
            metadata: HashMap::new(),
            failure_reason: None,
            processed_at: None,
            created_at: stale_created_at,
            updated_at: stale_created_at,
        };

        let journal = InMemoryJournalStore::new();
        {
            let mut state = journal.state.lock().await;
            state
                .by_tx_id
                .insert(pending_tx.transaction_id.clone(), pending_tx.id.clone());
            state.by_id.insert(pending_tx.id.clone(), pending_tx);
        }

        let engine = InMemoryLedgerEngine::with_stores(accounts, balances.clone(), Arc::new(journal), EngineConfig::default());

        let report = engine.sweep_pending(Duration::from_secs(1)).await.expect("sweep");
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert!(report.failed_ids.is_empty());

        let balance = balances.read_balance(&account.id).await.expect("balance");
        assert_eq!(balance.amount, dec!(25.00));
    }

    /// `BalanceStore` double that fails the first `fail_times` writes with
    /// `Conflict` before delegating, used to exercise the retry/backoff path
    /// without a real race.
    struct FlakyBalanceStore {
        inner: InMemoryBalanceStore,
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl BalanceStore for FlakyBalanceStore {
        async fn read_balance(&self, account_id: &str) -> LedgerResult<Balance> {
            self.inner.read_balance(account_id).await
        }

        async fn write_balance(
            &self,
            account_id: &str,
            expected_version: u64,
            new_amount: Decimal,
            now: DateTime<Utc>,
        ) -> LedgerResult<Balance> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(LedgerError::Conflict("injected conflict".into()));
            }
            self.inner.write_balance(account_id, expected_version, new_amount, now).await
        }

        async fn init_balance(
            &self,
            account_id: &str,
            currency: Currency,
            initial_amount: Decimal,
            now: DateTime<Utc>,
        ) -> LedgerResult<Balance> {
            self.inner.init_balance(account_id, currency, initial_amount, now).await
        }
    }

    #[tokio::test]
    async fn concurrency_exhausted_surfaces_after_max_retries() {
        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
        let balances = Arc::new(FlakyBalanceStore {
            inner: InMemoryBalanceStore::new(),
            fail_times: 10,
            attempts: AtomicU32::new(0),
        });
        let journal: Arc<dyn JournalStore> = Arc::new(InMemoryJournalStore::new());

        let now = Utc::now();
        let account = accounts
            .register_account("user-1", AccountKind::Savings, Currency::Usd, now)
            .await
            .expect("account");
        balances
            .init_balance(&account.id, Currency::Usd, dec!(0), now)
            .await
            .expect("init balance");

        let config = EngineConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let engine = InMemoryLedgerEngine::with_stores(accounts, balances, journal, config);

        let err = engine
            .deposit(amount_input(&account.account_number, "user-1", dec!(10.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn retry_succeeds_once_the_injected_conflict_stops() {
        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
        let balances = Arc::new(FlakyBalanceStore {
            inner: InMemoryBalanceStore::new(),
            fail_times: 1,
            attempts: AtomicU32::new(0),
        });
        let journal: Arc<dyn JournalStore> = Arc::new(InMemoryJournalStore::new());

        let now = Utc::now();
        let account = accounts
            .register_account("user-1", AccountKind::Savings, Currency::Usd, now)
            .await
            .expect("account");
        balances
            .init_balance(&account.id, Currency::Usd, dec!(0), now)
            .await
            .expect("init balance");

        let config = EngineConfig {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let engine = InMemoryLedgerEngine::with_stores(accounts, balances, journal, config);

        let tx = engine
            .deposit(amount_input(&account.account_number, "user-1", dec!(10.00)))
            .await
            .expect("deposit eventually succeeds");
        assert_eq!(tx.status, TransactionStatus::Completed);
    }
}
