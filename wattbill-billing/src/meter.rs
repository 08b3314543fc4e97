use tracing::debug;
use wattbill_core::Bill;
use wattbill_ledger::{MeterStore, UnitOfWork};

use crate::BillingResult;

/// Move the meter forward to the accepted bill's current reading.
pub fn advance(unit: &dyn UnitOfWork, bill: &Bill) -> BillingResult<()> {
    unit.set_final_reading(&bill.account, bill.current_reading)?;
    debug!(account = %bill.account, reading = %bill.current_reading, "meter advanced");
    Ok(())
}

/// Put the meter back to the reading it had before `bill` was accepted.
pub fn rewind(unit: &dyn UnitOfWork, bill: &Bill) -> BillingResult<()> {
    unit.set_final_reading(&bill.account, bill.previous_reading)?;
    debug!(account = %bill.account, reading = %bill.previous_reading, "meter rewound");
    Ok(())
}
