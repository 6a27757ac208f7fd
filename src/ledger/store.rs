//! Ledger Store
//!
//! The capability the outer API layer depends on. [`LedgerStore`] is the one
//! implementation; it runs everything through a [`TxCoordinator`], so the
//! backend (PostgreSQL or in-memory) is chosen by the [`TxSource`] handed in.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use super::error::LedgerError;
use super::models::{
    Account, AccountId, CreateAccountParams, Entry, Page, Transfer, TransferParams, TransferResult,
};
use super::postgres::PgTxSource;
use super::transfer::{transfer_in_tx, validate_params};
use super::tx::{IsolationLevel, TxContext, TxCoordinator, TxSource};
use crate::config::LedgerConfig;

/// Ledger capability
#[async_trait]
pub trait Store: Send + Sync {
    /// Move `amount` between two accounts as one atomic unit
    async fn tx_transfer(
        &self,
        params: TransferParams,
        ctx: &TxContext,
    ) -> Result<TransferResult, LedgerError>;

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account, LedgerError>;

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError>;

    async fn list_accounts(&self, owner: &str, page: Page) -> Result<Vec<Account>, LedgerError>;

    async fn get_entry(&self, id: i64) -> Result<Entry, LedgerError>;

    async fn list_entries(&self, account_id: AccountId, page: Page)
    -> Result<Vec<Entry>, LedgerError>;

    async fn get_transfer(&self, id: i64) -> Result<Transfer, LedgerError>;

    async fn list_transfers(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, LedgerError>;
}

/// [`Store`] implementation over any [`TxSource`]
#[derive(Clone)]
pub struct LedgerStore {
    coordinator: TxCoordinator,
    check_currency: bool,
}

impl LedgerStore {
    pub fn new(source: Arc<dyn TxSource>, config: &LedgerConfig) -> Self {
        Self {
            coordinator: TxCoordinator::new(source, config.isolation_level)
                .with_retry(config.retry),
            check_currency: config.check_currency,
        }
    }

    /// Store on a PostgreSQL pool
    pub fn postgres(pool: PgPool, config: &LedgerConfig) -> Self {
        Self::new(Arc::new(PgTxSource::new(pool)), config)
    }

    /// Reads and single-row writes outside the transfer path
    fn background() -> TxContext {
        TxContext::background()
    }
}

#[async_trait]
impl Store for LedgerStore {
    async fn tx_transfer(
        &self,
        params: TransferParams,
        ctx: &TxContext,
    ) -> Result<TransferResult, LedgerError> {
        validate_params(&params)?;

        let check_currency = self.check_currency;
        let result = self
            .coordinator
            .exec(ctx, move |q| {
                Box::pin(transfer_in_tx(q, params, check_currency))
            })
            .await;

        match &result {
            Ok(res) => info!(
                label = %ctx.label(),
                transfer_id = res.transfer.id,
                from = params.from_account_id,
                to = params.to_account_id,
                amount = params.amount,
                "Transfer committed"
            ),
            Err(e) => warn!(
                label = %ctx.label(),
                from = params.from_account_id,
                to = params.to_account_id,
                amount = params.amount,
                code = e.code(),
                retryable = e.is_retryable(),
                "Transfer failed: {}",
                e
            ),
        }
        result
    }

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| {
                    let params = params.clone();
                    Box::pin(async move { q.create_account(&params).await })
                },
            )
            .await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| q.get_account(id),
            )
            .await
    }

    async fn list_accounts(&self, owner: &str, page: Page) -> Result<Vec<Account>, LedgerError> {
        let owner = owner.to_string();
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| {
                    let owner = owner.clone();
                    Box::pin(async move { q.list_accounts(&owner, page).await })
                },
            )
            .await
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| q.get_entry(id),
            )
            .await
    }

    async fn list_entries(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| q.list_entries(account_id, page),
            )
            .await
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| q.get_transfer(id),
            )
            .await
    }

    async fn list_transfers(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, LedgerError> {
        self.coordinator
            .exec_at(
                IsolationLevel::ReadCommitted,
                &Self::background(),
                move |q| q.list_transfers(account_id, page),
            )
            .await
    }
}
