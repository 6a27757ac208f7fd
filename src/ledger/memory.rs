//! In-memory transactional backend
//!
//! Implements [`TxSource`] without a database so the orchestrator and the
//! coordinator can be exercised in tests or embedded in tools.
//!
//! A unit of work holds the store-wide lock from begin to commit/rollback
//! and mutates a private copy of the state, so every transaction behaves as
//! SERIALIZABLE whatever level was requested. Commit swaps the copy in;
//! rollback drops it.
//!
//! Fault injection ([`FailPoint`]), including injected serialization
//! conflicts, and call counters make failure and retry paths reproducible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::error::LedgerError;
use super::models::{Account, AccountId, CreateAccountParams, Entry, Page, Transfer};
use super::queries::Queries;
use super::tx::{IsolationLevel, TxHandle, TxSource};

/// Where an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    GetAccount,
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    next_account_id: i64,
    next_entry_id: i64,
    next_transfer_id: i64,
}

impl MemoryState {
    fn require_account(&self, id: AccountId, what: &str) -> Result<(), LedgerError> {
        if self.accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(LedgerError::ConstraintViolation(format!(
                "{what} violates foreign key: account {id} does not exist"
            )))
        }
    }
}

/// SQLSTATE PostgreSQL reports for a write-write conflict at REPEATABLE READ
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug)]
struct Fault {
    point: FailPoint,
    /// Calls to let through before failing
    skip: usize,
    /// Report a serialization failure instead of a generic error
    conflict: bool,
}

/// Shared counters, latency and armed faults
#[derive(Debug, Default)]
struct Probe {
    faults: Mutex<Vec<Fault>>,
    latency_ms: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    balance_updates: Mutex<Vec<AccountId>>,
}

impl Probe {
    /// Consume an armed fault for `point`, if it is due
    fn trip(&self, point: FailPoint) -> Result<(), LedgerError> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        // One fault per call; others due on the same call fire on the next ones
        let mut fired = None;
        faults.retain_mut(|fault| {
            if fault.point != point {
                return true;
            }
            if fault.skip == 0 && fired.is_none() {
                fired = Some(fault.conflict);
                return false;
            }
            fault.skip = fault.skip.saturating_sub(1);
            true
        });
        let Some(conflict) = fired else {
            return Ok(());
        };

        let err = match point {
            _ if conflict => LedgerError::Database {
                code: Some(SERIALIZATION_FAILURE.to_string()),
                message: "could not serialize access due to concurrent update".to_string(),
            },
            FailPoint::Begin | FailPoint::Commit | FailPoint::Rollback => {
                LedgerError::Connection(format!("injected failure at {point:?}"))
            }
            _ => LedgerError::Database {
                code: Some("XX000".to_string()),
                message: format!("injected failure at {point:?}"),
            },
        };
        Err(err)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }
}

/// In-memory [`TxSource`]
#[derive(Clone, Default)]
pub struct MemoryTxSource {
    state: Arc<AsyncMutex<MemoryState>>,
    probe: Arc<Probe>,
}

impl MemoryTxSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call at `point`
    pub fn fail_at(&self, point: FailPoint) {
        self.fail_at_nth(point, 1);
    }

    /// Fail the `nth` (1-based) call at `point` from now on
    pub fn fail_at_nth(&self, point: FailPoint, nth: usize) {
        self.arm(point, nth, false);
    }

    /// Make the `nth` (1-based) call at `point` report a serialization
    /// failure, the way PostgreSQL aborts a conflicting writer
    pub fn conflict_at_nth(&self, point: FailPoint, nth: usize) {
        self.arm(point, nth, true);
    }

    fn arm(&self, point: FailPoint, nth: usize, conflict: bool) {
        self.probe
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                point,
                skip: nth.saturating_sub(1),
                conflict,
            });
    }

    /// Sleep this long inside every primitive call
    pub fn set_latency(&self, latency: Duration) {
        self.probe
            .latency_ms
            .store(latency.as_millis() as usize, Ordering::Relaxed);
    }

    pub fn begin_count(&self) -> usize {
        self.probe.begins.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.probe.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.probe.rollbacks.load(Ordering::SeqCst)
    }

    /// Account ids in the order `add_account_balance` was called, drained
    pub fn take_balance_updates(&self) -> Vec<AccountId> {
        std::mem::take(
            &mut *self
                .probe
                .balance_updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Committed account row
    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.state.lock().await.accounts.get(&id).cloned()
    }

    pub async fn account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn entries(&self) -> Vec<Entry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn transfers(&self) -> Vec<Transfer> {
        self.state.lock().await.transfers.clone()
    }
}

#[async_trait]
impl TxSource for MemoryTxSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, LedgerError> {
        let guard = self.state.clone().lock_owned().await;
        self.probe.trip(FailPoint::Begin)?;
        self.probe.begins.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(isolation = %isolation, "memory tx begin");

        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            probe: self.probe.clone(),
        }))
    }
}

/// Open in-memory transaction
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
    probe: Arc<Probe>,
}

#[async_trait]
impl TxHandle for MemoryTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryTx {
            mut guard,
            work,
            probe,
        } = *self;
        probe.trip(FailPoint::Commit)?;
        *guard = work;
        probe.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.probe.rollbacks.fetch_add(1, Ordering::SeqCst);
        // Private copy is discarded either way
        self.probe.trip(FailPoint::Rollback)
    }
}

fn window<T>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    rows.skip(page.offset.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl Queries for MemoryTx {
    async fn get_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.probe.delay().await;
        self.probe.trip(FailPoint::GetAccount)?;
        self.work
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))
    }

    async fn create_account(
        &mut self,
        params: &CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        self.probe.delay().await;
        self.work.next_account_id += 1;
        let account = Account {
            id: self.work.next_account_id,
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: Utc::now(),
        };
        self.work.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        page: Page,
    ) -> Result<Vec<Account>, LedgerError> {
        self.probe.delay().await;
        let rows = self
            .work
            .accounts
            .values()
            .filter(|a| a.owner == owner)
            .cloned();
        Ok(window(rows, page))
    }

    async fn create_entry(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<Entry, LedgerError> {
        self.probe.delay().await;
        self.probe.trip(FailPoint::CreateEntry)?;
        self.work.require_account(account_id, "entry")?;

        self.work.next_entry_id += 1;
        let entry = Entry {
            id: self.work.next_entry_id,
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.work.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        self.probe.delay().await;
        self.work
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("entry {id}")))
    }

    async fn list_entries(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.probe.delay().await;
        let rows = self
            .work
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned();
        Ok(window(rows, page))
    }

    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer, LedgerError> {
        self.probe.delay().await;
        self.probe.trip(FailPoint::CreateTransfer)?;
        self.work.require_account(from_account_id, "transfer")?;
        self.work.require_account(to_account_id, "transfer")?;
        if amount <= 0 {
            return Err(LedgerError::ConstraintViolation(
                "transfer amount must be positive".to_string(),
            ));
        }

        self.work.next_transfer_id += 1;
        let transfer = Transfer {
            id: self.work.next_transfer_id,
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.work.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        self.probe.delay().await;
        self.work
            .transfers
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transfer {id}")))
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, LedgerError> {
        self.probe.delay().await;
        let rows = self
            .work
            .transfers
            .iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .cloned();
        Ok(window(rows, page))
    }

    async fn add_account_balance(
        &mut self,
        id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        self.probe.delay().await;
        self.probe
            .balance_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        self.probe.trip(FailPoint::AddAccountBalance)?;

        let account = self
            .work
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::Database {
                code: Some("22003".to_string()),
                message: "bigint out of range".to_string(),
            })?;
        Ok(account.clone())
    }
}
