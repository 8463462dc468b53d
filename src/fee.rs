//! Gas price resolution for creation transactions
//!
//! Resolves the price actually paid per unit of gas for both legacy
//! and EIP-1559 transactions.

use crate::types::{Receipt, Transaction};
use alloy_primitives::U256;

/// Resolve the effective gas price for a transaction.
///
/// Priority order:
/// 1. `effective_gas_price` from the receipt if available (post-London)
/// 2. `gas_price` for legacy transactions
/// 3. For EIP-1559: `min(max_fee, base_fee + max_priority_fee)`
///
/// Returns `None` when none of the inputs are available (e.g. an EIP-1559
/// transaction in a block without a base fee).
pub fn effective_gas_price(
    tx: &Transaction,
    receipt: &Receipt,
    base_fee_per_gas: Option<U256>,
) -> Option<U256> {
    if receipt.effective_gas_price.is_some() {
        return receipt.effective_gas_price;
    }

    if tx.is_legacy() {
        return tx.gas_price;
    }

    if tx.is_eip1559() {
        let base_fee = base_fee_per_gas?;
        let max_fee = tx.max_fee_per_gas?;
        let max_priority_fee = tx.max_priority_fee_per_gas.unwrap_or(U256::ZERO);
        return Some(base_fee.saturating_add(max_priority_fee).min(max_fee));
    }

    None
}
