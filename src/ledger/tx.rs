//! Transaction Coordinator
//!
//! Runs one caller-supplied operation against a transaction-scoped
//! [`Queries`] handle and commits or rolls back as a single step.
//!
//! # Outcomes
//!
//! | Operation | Cancelled | Rollback | Result |
//! |-----------|-----------|----------|--------|
//! | Ok        | no        | -        | commit, `CommitFailed` if commit errors |
//! | Ok        | yes       | ok       | `Cancelled` |
//! | Err(e)    | -         | ok       | `TransactionAborted(e)` |
//! | Err(e)    | -         | err(r)   | `RollbackFailed { e, r }` |
//!
//! # Retries
//!
//! At REPEATABLE READ and SERIALIZABLE a concurrent update of the same row
//! aborts with a serialization failure (40001) or a deadlock (40P01). At
//! those levels the whole unit of work is re-run in a fresh transaction
//! under [`RetryPolicy`]. Lower levels never retry; the add-delta update
//! already waits on the row lock and sees the latest committed balance.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use super::error::LedgerError;
use super::queries::Queries;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statement issued right after BEGIN
    pub fn set_transaction_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"
            }
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }

    /// Levels where PostgreSQL aborts concurrent writers instead of waiting
    pub fn retries_conflicts(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("Unknown isolation level: {}", other)),
        }
    }
}

/// Re-run policy for serialization failures and deadlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 5,
            max_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): doubling from the initial
    /// backoff, capped, then scaled by a random factor in [0.5, 1.5)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        let jitter = 0.5 + rand::random::<f64>();
        Duration::from_millis((base as f64 * jitter) as u64)
    }
}

/// Per-call metadata for a unit of work
///
/// `label` only feeds log correlation. `cancel` aborts the unit of work:
/// once it fires, nothing is committed.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    label: Option<String>,
    cancel: CancellationToken,
}

impl TxContext {
    /// Unlabelled context that is never cancelled from outside
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an externally owned cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("-")
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An open transaction
#[async_trait]
pub trait TxHandle: Send {
    /// Transaction-scoped persistence primitives
    fn queries(&mut self) -> &mut dyn Queries;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

/// Something that can open transactions (a connection pool, an in-memory store)
#[async_trait]
pub trait TxSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, LedgerError>;
}

/// Operation run inside a unit of work
///
/// Same shape as `sqlx::Connection::transaction`: the future borrows the
/// transaction-scoped handle for its whole lifetime.
pub type TxOp<'q, T> = BoxFuture<'q, Result<T, LedgerError>>;

/// Transaction Coordinator
///
/// `op` may run more than once when a retryable conflict is reported at
/// REPEATABLE READ or SERIALIZABLE, each time in a fresh transaction.
#[derive(Clone)]
pub struct TxCoordinator {
    source: Arc<dyn TxSource>,
    isolation: IsolationLevel,
    retry: RetryPolicy,
}

impl TxCoordinator {
    pub fn new(source: Arc<dyn TxSource>, isolation: IsolationLevel) -> Self {
        Self {
            source,
            isolation,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Run `op` inside a transaction at the configured isolation level
    pub async fn exec<T, F>(&self, ctx: &TxContext, op: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'q> Fn(&'q mut dyn Queries) -> TxOp<'q, T> + Send + Sync,
    {
        self.exec_at(self.isolation, ctx, op).await
    }

    /// Run `op` inside a transaction at an explicit isolation level
    pub async fn exec_at<T, F>(
        &self,
        isolation: IsolationLevel,
        ctx: &TxContext,
        op: F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'q> Fn(&'q mut dyn Queries) -> TxOp<'q, T> + Send + Sync,
    {
        let span = info_span!(
            "ledger_tx",
            label = %ctx.label(),
            isolation = %isolation,
            source = self.source.name()
        );

        async move {
            let mut attempt = 0;
            loop {
                match self.run_once(isolation, ctx, &op).await {
                    Err(e)
                        if isolation.retries_conflicts()
                            && e.is_retryable()
                            && attempt < self.retry.max_retries =>
                    {
                        attempt += 1;
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            attempt,
                            max_retries = self.retry.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Conflict - retrying unit of work"
                        );
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => return Err(LedgerError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One attempt: begin, run `op`, commit or roll back
    async fn run_once<T, F>(
        &self,
        isolation: IsolationLevel,
        ctx: &TxContext,
        op: &F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'q> Fn(&'q mut dyn Queries) -> TxOp<'q, T> + Send + Sync,
    {
        if ctx.is_cancelled() {
            debug!("Context cancelled before begin");
            return Err(LedgerError::Cancelled);
        }

        let mut tx = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!("Context cancelled during begin");
                return Err(LedgerError::Cancelled);
            }
            begun = self.source.begin(isolation) => begun?,
        };

        let outcome = {
            let fut = op(tx.queries());
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(LedgerError::Cancelled),
                res = fut => res,
            }
        };

        match outcome {
            Ok(_) if ctx.is_cancelled() => {
                warn!("Context cancelled before commit - rolling back");
                Err(Self::rollback(tx, LedgerError::Cancelled).await)
            }
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    debug!("Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    error!(error = %e, "Commit failed");
                    Err(LedgerError::commit_failed(e))
                }
            },
            Err(e) => Err(Self::rollback(tx, e).await),
        }
    }

    /// Roll back after a failure and build the error to return
    async fn rollback(tx: Box<dyn TxHandle>, cause: LedgerError) -> LedgerError {
        match tx.rollback().await {
            Ok(()) => {
                warn!(error = %cause, "Transaction rolled back");
                match cause {
                    LedgerError::Cancelled => LedgerError::Cancelled,
                    other => LedgerError::aborted(other),
                }
            }
            Err(rollback_err) => {
                error!(
                    error = %cause,
                    rollback_error = %rollback_err,
                    "Rollback failed"
                );
                LedgerError::rollback_failed(cause, rollback_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{FailPoint, MemoryTxSource};
    use crate::ledger::models::{Account, CreateAccountParams};

    fn coordinator(source: &MemoryTxSource) -> TxCoordinator {
        TxCoordinator::new(Arc::new(source.clone()), IsolationLevel::RepeatableRead)
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(
            IsolationLevel::RepeatableRead.set_transaction_sql(),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        );
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert!(!IsolationLevel::ReadCommitted.retries_conflicts());
        assert!(IsolationLevel::Serializable.retries_conflicts());
    }

    #[test]
    fn test_context_label() {
        assert_eq!(TxContext::background().label(), "-");
        assert_eq!(TxContext::with_label("tx 1").label(), "tx 1");
    }

    #[test]
    fn test_context_shares_external_token() {
        let token = CancellationToken::new();
        let ctx = TxContext::with_label("cli").with_cancel(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_retry_backoff_bounds() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        };
        for _ in 0..100 {
            let first = policy.backoff(1).as_millis();
            assert!((5..15).contains(&first), "{first}");
            // Capped at 40ms before jitter
            let late = policy.backoff(30).as_millis();
            assert!((20..60).contains(&late), "{late}");
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn create_alice(coord: &TxCoordinator, ctx: &TxContext) -> Result<Account, LedgerError> {
        coord
            .exec(ctx, |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("alice", 100, "USD"))
                        .await
                })
            })
            .await
    }

    #[tokio::test]
    async fn test_conflict_retried_at_repeatable_read() {
        let source = MemoryTxSource::new();
        source.conflict_at_nth(FailPoint::Commit, 1);
        source.conflict_at_nth(FailPoint::Commit, 1);
        let coord = coordinator(&source).with_retry(fast_retry(3));

        let account = create_alice(&coord, &TxContext::background()).await.unwrap();

        assert_eq!(source.begin_count(), 3);
        assert_eq!(source.commit_count(), 1);
        assert_eq!(source.account_count().await, 1);
        assert_eq!(source.account(account.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_conflict_mid_operation_rolls_back_then_retries() {
        let source = MemoryTxSource::new();
        let coord = coordinator(&source).with_retry(fast_retry(3));
        let seeded = create_alice(&coord, &TxContext::background()).await.unwrap();
        source.conflict_at_nth(FailPoint::GetAccount, 1);
        let id = seeded.id;

        let read = coord
            .exec(&TxContext::background(), move |q| q.get_account(id))
            .await
            .unwrap();

        assert_eq!(read, seeded);
        assert_eq!(source.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_conflict_not_retried_at_read_committed() {
        let source = MemoryTxSource::new();
        source.conflict_at_nth(FailPoint::Commit, 1);
        let coord = TxCoordinator::new(Arc::new(source.clone()), IsolationLevel::ReadCommitted)
            .with_retry(fast_retry(3));

        let err = create_alice(&coord, &TxContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::CommitFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(source.begin_count(), 1);
        assert_eq!(source.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_conflict() {
        let source = MemoryTxSource::new();
        for nth in 1..=3 {
            source.conflict_at_nth(FailPoint::Commit, nth);
        }
        let coord = coordinator(&source).with_retry(fast_retry(2));

        let err = create_alice(&coord, &TxContext::background())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(source.begin_count(), 3);
        assert_eq!(source.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let source = MemoryTxSource::new();
        source.conflict_at_nth(FailPoint::Commit, 1);
        let coord = coordinator(&source).with_retry(RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 1_000,
        });
        let ctx = TxContext::with_label("backoff");
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = create_alice(&coord, &ctx).await.unwrap_err();

        assert!(matches!(err, LedgerError::Cancelled));
        assert_eq!(source.begin_count(), 1);
        assert_eq!(source.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_exec_commits_on_success() {
        let source = MemoryTxSource::new();
        let coord = coordinator(&source);

        let account = coord
            .exec(&TxContext::background(), |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("alice", 100, "USD"))
                        .await
                })
            })
            .await
            .unwrap();

        assert_eq!(source.account(account.id).await.unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_exec_rolls_back_on_failure() {
        let source = MemoryTxSource::new();
        let coord = coordinator(&source);

        let err = coord
            .exec(&TxContext::background(), |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("alice", 100, "USD"))
                        .await?;
                    q.get_account(999).await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::TransactionAborted(_)));
        assert!(err.is_not_found());
        assert_eq!(source.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let source = MemoryTxSource::new();
        source.fail_at(FailPoint::Rollback);
        let coord = coordinator(&source);

        let err = coord
            .exec(&TxContext::background(), |q| {
                Box::pin(async move { q.get_account(42).await })
            })
            .await
            .unwrap_err();

        match &err {
            LedgerError::RollbackFailed { source, rollback } => {
                assert!(source.is_not_found());
                assert!(matches!(**rollback, LedgerError::Connection(_)));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_failure() {
        let source = MemoryTxSource::new();
        source.fail_at(FailPoint::Commit);
        let coord = coordinator(&source);

        let err = coord
            .exec(&TxContext::background(), |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("bob", 5, "EUR"))
                        .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::CommitFailed(_)));
        assert_eq!(source.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_begin() {
        let source = MemoryTxSource::new();
        let coord = coordinator(&source);
        let ctx = TxContext::with_label("cancelled");
        ctx.cancel_token().cancel();

        let err = coord
            .exec(&ctx, |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("carol", 1, "USD"))
                        .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Cancelled));
        assert_eq!(source.account_count().await, 0);
        assert_eq!(source.begin_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_operation_leaves_nothing_committed() {
        let source = MemoryTxSource::new();
        source.set_latency(Duration::from_millis(200));
        let coord = coordinator(&source);
        let ctx = TxContext::with_label("slow");

        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = coord
            .exec(&ctx, |q| {
                Box::pin(async move {
                    q.create_account(&CreateAccountParams::new("dave", 1, "USD"))
                        .await?;
                    q.create_account(&CreateAccountParams::new("erin", 1, "USD"))
                        .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Cancelled));
        assert_eq!(source.account_count().await, 0);
        assert_eq!(source.commit_count(), 0);
    }
}
