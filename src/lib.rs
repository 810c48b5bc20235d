#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use rust_decimal::Decimal;

mod memory;
mod mint;
mod router;

pub use memory::InMemoryAccountStore;
pub use memory::InMemoryBalanceStore;
pub use memory::InMemoryJournalStore;
pub use memory::InMemoryLedgerEngine;
pub use mint::IdentifierMint;
pub use router::SystemAccountRouter;

pub type AccountId = String;
pub type TransactionRowId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("account {account_id} is inactive")]
    InactiveAccount { account_id: String },
    #[error("currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Decimal, requested: Decimal },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("illegal state transition from {from:?} to {to:?}")]
    IllegalStateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("transaction {original_transaction_id} has already been reversed")]
    AlreadyReversed { original_transaction_id: String },
    #[error("concurrency retries exhausted after {attempts} attempts")]
    ConcurrencyExhausted { attempts: u32 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Currencies the ledger recognizes. Conversion between them is out of scope;
/// every transaction carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
    Cad,
    Chf,
    Aud,
    Cny,
    Inr,
    Ngn,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
            Currency::Cad => "CAD",
            Currency::Chf => "CHF",
            Currency::Aud => "AUD",
            Currency::Cny => "CNY",
            Currency::Inr => "INR",
            Currency::Ngn => "NGN",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "GBP" => Some(Currency::Gbp),
            "JPY" => Some(Currency::Jpy),
            "CAD" => Some(Currency::Cad),
            "CHF" => Some(Currency::Chf),
            "AUD" => Some(Currency::Aud),
            "CNY" => Some(Currency::Cny),
            "INR" => Some(Currency::Inr),
            "NGN" => Some(Currency::Ngn),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Savings,
    Investment,
    Credit,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Admin,
    ServiceAccount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub account_number: String,
    pub owner_id: String,
    pub kind: AccountKind,
    pub currency: Currency,
    pub active: bool,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Stored separately from `Account` so hot balance writes never contend with
/// account-metadata reads. `version` backs the optimistic write in
/// `BalanceStore::write_balance`.
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub account_id: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingSide {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub account_id: AccountId,
    pub side: PostingSide,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Transfer,
    Payment,
    Fee,
    Interest,
    Adjustment,
    Reversal,
    Refund,
}

impl TransactionKind {
    /// The three-letter prefix minted into `transactionId` per the
    /// identifier format in the external-interfaces contract.
    pub fn id_prefix(self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEP",
            TransactionKind::Withdrawal => "WDR",
            TransactionKind::Transfer => "TRF",
            TransactionKind::Fee => "FEE",
            TransactionKind::Reversal => "REV",
            TransactionKind::Payment
            | TransactionKind::Interest
            | TransactionKind::Adjustment
            | TransactionKind::Refund => "TXN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionRowId,
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub initiator_user_id: String,
    pub entries: Vec<Entry>,
    pub amount: Decimal,
    pub currency: Currency,
    pub from_account_number: Option<String>,
    pub to_account_number: Option<String>,
    pub status: TransactionStatus,
    pub description: String,
    pub reference: Option<String>,
    pub metadata: HashMap<String, String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Invariant T2: debits and credits balance.
    pub fn is_balanced(&self) -> bool {
        let (debits, credits) = self.entries.iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(d, c), entry| match entry.side {
                PostingSide::Debit => (d + entry.amount, c),
                PostingSide::Credit => (d, c + entry.amount),
            },
        );
        debits == credits
    }

    pub fn debit_total(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.side == PostingSide::Debit)
            .map(|e| e.amount)
            .sum()
    }

    pub fn credit_total(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.side == PostingSide::Credit)
            .map(|e| e.amount)
            .sum()
    }

    /// Guards the state machine in the design's §4.5.8: every transition
    /// not listed there is rejected, terminal states never move again.
    fn transition(&mut self, to: TransactionStatus, now: DateTime<Utc>) -> LedgerResult<()> {
        let allowed = matches!(
            (self.status, to),
            (TransactionStatus::Pending, TransactionStatus::Processing)
                | (TransactionStatus::Processing, TransactionStatus::Completed)
                | (TransactionStatus::Processing, TransactionStatus::Failed)
                | (TransactionStatus::Pending, TransactionStatus::Cancelled)
        );
        if !allowed {
            return Err(LedgerError::IllegalStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> LedgerResult<()> {
        self.transition(TransactionStatus::Processing, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> LedgerResult<()> {
        self.transition(TransactionStatus::Completed, now)?;
        self.processed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) -> LedgerResult<()> {
        self.transition(TransactionStatus::Failed, now)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> LedgerResult<()> {
        self.transition(TransactionStatus::Cancelled, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemPurpose {
    Deposits,
    Withdrawals,
    Fees,
}

fn validate_amount(amount: Decimal, config: &EngineConfig) -> LedgerResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::BadRequest(
            "amount must be greater than zero".into(),
        ));
    }
    if amount.scale() > config.amount_scale {
        return Err(LedgerError::BadRequest(format!(
            "amount must have at most {} fractional digits",
            config.amount_scale
        )));
    }
    if amount > config.max_amount {
        return Err(LedgerError::BadRequest(format!(
            "amount exceeds the maximum of {}",
            config.max_amount
        )));
    }
    Ok(())
}

fn validate_account_number(account_number: &str) -> LedgerResult<()> {
    let segments: Vec<&str> = account_number.split('-').collect();
    let valid = segments.len() == 4
        && segments[0] == "ACCT"
        && segments[1..]
            .iter()
            .all(|segment| segment.len() == 4 && segment.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(LedgerError::BadRequest(format!(
            "'{account_number}' is not a valid account number"
        )));
    }
    Ok(())
}

/// Shared shape for Deposit, Withdrawal, and Fee inputs — the design notes
/// these three as identical request contracts that differ only in which
/// primitive receives them.
#[derive(Debug, Clone, PartialEq)]
pub struct AmountInput {
    pub user_id: String,
    pub account_number: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl AmountInput {
    pub fn normalize(mut self, config: &EngineConfig) -> LedgerResult<Self> {
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("userId is required".into()));
        }
        validate_account_number(&self.account_number)?;
        validate_amount(self.amount, config)?;
        self.description = self.description.map(|d| d.trim().to_string());
        Ok(self)
    }
}

pub type DepositInput = AmountInput;
pub type WithdrawalInput = AmountInput;
pub type FeeInput = AmountInput;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferInput {
    pub user_id: String,
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl TransferInput {
    pub fn normalize(mut self, config: &EngineConfig) -> LedgerResult<Self> {
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("userId is required".into()));
        }
        if self.from_account_number == self.to_account_number {
            return Err(LedgerError::BadRequest(
                "fromAccountNumber and toAccountNumber must differ".into(),
            ));
        }
        validate_account_number(&self.from_account_number)?;
        validate_account_number(&self.to_account_number)?;
        validate_amount(self.amount, config)?;
        self.description = self.description.map(|d| d.trim().to_string());
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReversalInput {
    pub user_id: String,
    pub original_transaction_id: String,
    pub reason: String,
    pub caller_role: Role,
    pub metadata: HashMap<String, String>,
}

impl ReversalInput {
    pub fn normalize(mut self) -> LedgerResult<Self> {
        self.reason = self.reason.trim().to_string();
        if self.reason.is_empty() {
            return Err(LedgerError::BadRequest("reason is required".into()));
        }
        if self.original_transaction_id.trim().is_empty() {
            return Err(LedgerError::BadRequest(
                "originalTransactionId is required".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: u32,
    pub limit: u32,
    pub sort_dir: SortDir,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            sort_dir: SortDir::Desc,
        }
    }
}

impl Paging {
    pub fn normalize(self) -> LedgerResult<Self> {
        if self.page < 1 {
            return Err(LedgerError::BadRequest("page must be >= 1".into()));
        }
        if !(1..=100).contains(&self.limit) {
            return Err(LedgerError::BadRequest("limit must be within [1,100]".into()));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    pub account_number: Option<String>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
}

impl TransactionFilter {
    pub(crate) fn matches(&self, tx: &Transaction) -> bool {
        if let Some(kind) = self.kind
            && kind != tx.kind
        {
            return false;
        }
        if let Some(status) = self.status
            && status != tx.status
        {
            return false;
        }
        if let Some(from) = self.from_time
            && tx.created_at < from
        {
            return false;
        }
        if let Some(to) = self.to_time
            && tx.created_at > to
        {
            return false;
        }
        if let Some(account_number) = &self.account_number {
            let touches = tx.from_account_number.as_deref() == Some(account_number.as_str())
                || tx.to_account_number.as_deref() == Some(account_number.as_str());
            if !touches {
                return false;
            }
        }
        if let Some(min) = self.min_amount
            && tx.amount < min
        {
            return false;
        }
        if let Some(max) = self.max_amount
            && tx.amount > max
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl StatsWindow {
    pub(crate) fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyTotal {
    pub currency: Currency,
    pub count: u64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeStat {
    pub kind: TransactionKind,
    pub currency: Currency,
    pub count: u64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyTrendPoint {
    pub year: i32,
    pub month: u32,
    pub kind: TransactionKind,
    pub count: u64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserStats {
    pub summary: Vec<CurrencyTotal>,
    pub by_type: Vec<TypeStat>,
    pub monthly_trend: Vec<MonthlyTrendPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetFlow {
    pub currency: Currency,
    pub net: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionTypeStat {
    pub direction: Direction,
    pub kind: TransactionKind,
    pub currency: Currency,
    pub count: u64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyTrendPoint {
    pub date: NaiveDate,
    pub direction: Direction,
    pub count: u64,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccountStats {
    pub net_flow: Vec<NetFlow>,
    pub by_direction_and_type: Vec<DirectionTypeStat>,
    pub daily_trend: Vec<DailyTrendPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub processed: u64,
    pub failed: u64,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonNegativePolicy {
    Strict,
    AllowNegativeForKinds(Vec<AccountKind>),
}

impl Default for NonNegativePolicy {
    fn default() -> Self {
        NonNegativePolicy::Strict
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub non_negative_policy: NonNegativePolicy,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub sweep_staleness_threshold: Duration,
    pub max_amount: Decimal,
    pub amount_scale: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            non_negative_policy: NonNegativePolicy::default(),
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
            sweep_staleness_threshold: Duration::from_secs(60),
            max_amount: Decimal::new(100_000_000_000, 0),
            amount_scale: 2,
        }
    }
}

impl EngineConfig {
    /// Whether `kind` is allowed to carry a negative balance under the
    /// configured policy. SYSTEM accounts are always exempt (§4.4).
    pub fn allows_negative(&self, kind: AccountKind) -> bool {
        if kind == AccountKind::System {
            return true;
        }
        match &self.non_negative_policy {
            NonNegativePolicy::Strict => false,
            NonNegativePolicy::AllowNegativeForKinds(kinds) => kinds.contains(&kind),
        }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn register_account(
        &self,
        owner_id: &str,
        kind: AccountKind,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> LedgerResult<Account>;

    async fn find_by_number(&self, account_number: &str) -> LedgerResult<Account>;

    async fn find_by_id(&self, account_id: &str) -> LedgerResult<Account>;

    async fn set_active(
        &self,
        account_number: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> LedgerResult<Account>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn read_balance(&self, account_id: &str) -> LedgerResult<Balance>;

    /// Fails with `Conflict` if the stored row's version no longer matches
    /// `expected_version` — the optimistic-CAS contract described in §4.2.
    async fn write_balance(
        &self,
        account_id: &str,
        expected_version: u64,
        new_amount: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<Balance>;

    async fn init_balance(
        &self,
        account_id: &str,
        currency: Currency,
        initial_amount: Decimal,
        now: DateTime<Utc>,
    ) -> LedgerResult<Balance>;
}

#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn append_transaction(&self, tx: Transaction) -> LedgerResult<Transaction>;

    async fn mark_status(
        &self,
        id: &str,
        status: TransactionStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Transaction>;

    async fn find_by_tx_id(&self, tx_id: &str) -> LedgerResult<Option<Transaction>>;

    async fn find_by_id(&self, id: &str) -> LedgerResult<Option<Transaction>>;

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
        paging: &Paging,
    ) -> LedgerResult<Vec<Transaction>>;

    async fn list_by_account(
        &self,
        account_number: &str,
        filter: &TransactionFilter,
        paging: &Paging,
    ) -> LedgerResult<Vec<Transaction>>;

    async fn aggregate_by_user(&self, user_id: &str, window: &StatsWindow) -> LedgerResult<UserStats>;

    async fn aggregate_by_account(
        &self,
        account_number: &str,
        window: &StatsWindow,
    ) -> LedgerResult<AccountStats>;

    async fn select_pending_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> LedgerResult<Vec<Transaction>>;

    /// Backs invariant T6: finds the completed reversal, if any, already
    /// referencing `original_transaction_id`.
    async fn find_reversal_of(&self, original_transaction_id: &str) -> LedgerResult<Option<Transaction>>;
}

#[async_trait]
pub trait LedgerEngine: Send + Sync {
    async fn deposit(&self, input: DepositInput) -> LedgerResult<Transaction>;
    async fn withdrawal(&self, input: WithdrawalInput) -> LedgerResult<Transaction>;
    async fn transfer(&self, input: TransferInput) -> LedgerResult<Transaction>;
    async fn fee(&self, input: FeeInput) -> LedgerResult<Transaction>;
    async fn reversal(&self, input: ReversalInput) -> LedgerResult<Transaction>;
    async fn sweep_pending(&self, older_than: Duration) -> LedgerResult<SweepReport>;
    async fn user_stats(&self, user_id: &str, window: StatsWindow) -> LedgerResult<UserStats>;
    async fn account_stats(
        &self,
        account_number: &str,
        window: StatsWindow,
    ) -> LedgerResult<AccountStats>;
}
