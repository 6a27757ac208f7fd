//! Lock-Ordering Policy
//!
//! Balance rows are locked by the UPDATE that mutates them. Two transfers
//! between the same pair of accounts in opposite directions would lock the
//! rows in opposite order and deadlock each other. Mutating the lower id
//! first, whatever the direction, gives every transfer the same global
//! acquisition order.
//!
//! This only rules out two-account cycles. Cycles across three or more
//! accounts are left to the storage engine's deadlock detector.

use super::models::{AccountId, TransferParams};

/// The two ids in ascending order
#[inline]
pub fn order_pair(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// One atomic add-delta on an account balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceMove {
    pub account_id: AccountId,
    pub delta: i64,
}

/// The debit and credit of a transfer, in lock order
pub fn ordered_moves(params: &TransferParams) -> [BalanceMove; 2] {
    let debit = BalanceMove {
        account_id: params.from_account_id,
        delta: -params.amount,
    };
    let credit = BalanceMove {
        account_id: params.to_account_id,
        delta: params.amount,
    };

    let (first, _) = order_pair(params.from_account_id, params.to_account_id);
    if first == debit.account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}
