use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wattbill_core::{AccountNumber, Bill, BillAllocation, LedgerKey, Period};
use wattbill_ledger::{BillStore, LedgerStore, MeterStore, UnitOfWork};

use crate::{meter, BillingError, BillingResult};

/// Everything undone by deleting a bill.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReversalResult {
    pub bill: Bill,
    pub allocations: Vec<BillAllocation>,
    pub removed_ledgers: Vec<LedgerKey>,
    pub restored_reading: Decimal,
}

/// Undo a bill: subtract exactly what it added to each ledger, drop ledgers left with
/// nothing in them and rewind the meter.
///
/// Only the bill with the meter's most recent period can be reversed. Readings alone cannot
/// tell which bill is latest: a zero-consumption month ends on the same reading as the
/// month before it.
pub fn reverse(
    unit: &dyn UnitOfWork,
    account: &AccountNumber,
    period: Period,
) -> BillingResult<ReversalResult> {
    period.validate()?;
    let bill = unit
        .bill(account, period)?
        .ok_or_else(|| BillingError::BillNotFound {
            account: account.clone(),
            period,
        })?;
    let latest = unit.latest_bill(account)?;
    if latest.map(|latest| latest.period) != Some(period) {
        return Err(BillingError::NotLatestBill {
            account: account.clone(),
            period,
        });
    }
    let current = unit
        .meter(account)?
        .ok_or_else(|| BillingError::UnknownMeter(account.clone()))?;
    if current.final_reading != bill.current_reading {
        return Err(BillingError::Integrity(format!(
            "meter {account} reads {} but its {period} bill ends at {}",
            current.final_reading, bill.current_reading
        )));
    }

    let allocations = unit.allocations_for_bill(account, period)?;
    let mut touched = BTreeSet::new();
    for allocation in &allocations {
        let key = LedgerKey::new(allocation.station, allocation.technology, allocation.period);
        let ledger = unit.decrement_ledger(&key, allocation.power, allocation.cost)?;
        debug!(ledger = %key, power = %ledger.power, cost = %ledger.bill_total, "allocation reversed");
        touched.insert(key);
    }
    unit.delete_bill(account, period)?;

    let mut removed_ledgers = Vec::new();
    for key in touched {
        let Some(ledger) = unit.ledger(&key)? else {
            continue;
        };
        if !ledger.has_volume() && unit.allocations_for_ledger(&key)?.is_empty() {
            unit.delete_ledger(&key)?;
            removed_ledgers.push(key);
        }
    }

    meter::rewind(unit, &bill)?;
    Ok(ReversalResult {
        restored_reading: bill.previous_reading,
        bill,
        allocations,
        removed_ledgers,
    })
}
