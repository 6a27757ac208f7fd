//! PostgreSQL transaction source
//!
//! Opens sqlx transactions on a pool and pins the isolation level with
//! `SET TRANSACTION` before handing the connection to the operation.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::LedgerError;
use super::queries::Queries;
use super::tx::{IsolationLevel, TxHandle, TxSource};

/// [`TxSource`] backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgTxSource {
    pool: PgPool,
}

impl PgTxSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TxSource for PgTxSource {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // Dropping `tx` on error rolls it back
        sqlx::query(isolation.set_transaction_sql())
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// Open PostgreSQL transaction
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TxHandle for PgTx {
    fn queries(&mut self) -> &mut dyn Queries {
        &mut *self.tx
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
