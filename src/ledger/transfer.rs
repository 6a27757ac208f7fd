//! Transfer Orchestrator
//!
//! The body of a ledger transfer, run inside one unit of work:
//!
//! ```text
//! 1. INSERT transfer {from, to, amount}
//! 2. INSERT entry    {from, -amount}
//! 3. INSERT entry    {to,   +amount}
//! 4. UPDATE balance  lower id first, then the other (atomic add-delta)
//! 5. return transfer, both accounts (post-update), both entries
//! ```
//!
//! Any failing step aborts the whole unit; the coordinator rolls back
//! everything staged before it.

use tracing::debug;

use super::error::LedgerError;
use super::lock_order::ordered_moves;
use super::models::{Account, TransferParams, TransferResult};
use super::queries::Queries;

/// Reject parameters that can never produce a valid transfer
///
/// Runs before any I/O.
pub fn validate_params(params: &TransferParams) -> Result<(), LedgerError> {
    if params.amount <= 0 {
        return Err(LedgerError::InvalidAmount);
    }
    if params.from_account_id == params.to_account_id {
        return Err(LedgerError::SameAccount);
    }
    Ok(())
}

/// Both accounts must exist and share a currency
pub async fn check_currency(
    q: &mut dyn Queries,
    params: &TransferParams,
) -> Result<(), LedgerError> {
    let from = q.get_account(params.from_account_id).await?;
    let to = q.get_account(params.to_account_id).await?;
    if from.currency != to.currency {
        return Err(LedgerError::CurrencyMismatch {
            from: from.currency,
            to: to.currency,
        });
    }
    Ok(())
}

/// Execute the five transfer steps against a transaction-scoped handle
pub async fn transfer_in_tx(
    q: &mut dyn Queries,
    params: TransferParams,
    verify_currency: bool,
) -> Result<TransferResult, LedgerError> {
    if verify_currency {
        check_currency(q, &params).await?;
    }

    let transfer = q
        .create_transfer(params.from_account_id, params.to_account_id, params.amount)
        .await?;
    debug!(transfer_id = transfer.id, "Transfer record created");

    let from_entry = q
        .create_entry(params.from_account_id, -params.amount)
        .await?;
    let to_entry = q.create_entry(params.to_account_id, params.amount).await?;
    debug!(
        from_entry_id = from_entry.id,
        to_entry_id = to_entry.id,
        "Entries created"
    );

    let (from_account, to_account) = apply_balance_moves(q, &params).await?;

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Step 4: both add-delta updates in lock order, returned as (from, to)
async fn apply_balance_moves(
    q: &mut dyn Queries,
    params: &TransferParams,
) -> Result<(Account, Account), LedgerError> {
    let [first, second] = ordered_moves(params);

    let first_account = q
        .add_account_balance(first.account_id, first.delta)
        .await?;
    let second_account = q
        .add_account_balance(second.account_id, second.delta)
        .await?;
    debug!(
        first = first.account_id,
        second = second.account_id,
        "Balances updated"
    );

    if first.account_id == params.from_account_id {
        Ok((first_account, second_account))
    } else {
        Ok((second_account, first_account))
    }
}
