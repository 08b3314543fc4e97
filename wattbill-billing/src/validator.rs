use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;
use wattbill_core::{Bill, ReadingSubmission, Relation};
use wattbill_ledger::{BillStore, MeterStore, RelationStore, UnitOfWork};

use crate::tariff::{self, TotalBreakdown};
use crate::{BillingError, BillingResult};

/// A submission that passed every check, with the relation set captured for allocation.
#[derive(Clone, Debug)]
pub struct ValidatedBill {
    pub bill: Bill,
    pub relations: Vec<Relation>,
    pub breakdown: TotalBreakdown,
}

/// Checks reading continuity and the claimed total of a submission.
#[derive(Clone, Debug)]
pub struct BillValidator {
    total_tolerance: i64,
}

impl BillValidator {
    pub fn new(total_tolerance: i64) -> Self {
        Self { total_tolerance }
    }

    /// Run the fail-fast validation sequence inside the caller's transaction.
    pub fn validate(
        &self,
        unit: &dyn UnitOfWork,
        submission: &ReadingSubmission,
    ) -> BillingResult<ValidatedBill> {
        check_shape(submission)?;
        let account = &submission.account;

        let relations = unit.active_relations(account)?;
        if relations.is_empty() {
            return Err(BillingError::NotLinked(account.clone()));
        }

        let meter = unit
            .meter(account)?
            .ok_or_else(|| BillingError::UnknownMeter(account.clone()))?;
        if submission.previous_reading != meter.final_reading {
            return Err(BillingError::ReadingMismatch {
                account: account.clone(),
                expected: meter.final_reading,
                submitted: submission.previous_reading,
            });
        }
        if submission.reading_factor != meter.factor {
            return Err(BillingError::FactorMismatch {
                expected: meter.factor,
                submitted: submission.reading_factor,
            });
        }

        let tariff = unit.tariff(meter.tariff_id)?.ok_or_else(|| {
            BillingError::Integrity(format!(
                "meter {account} references missing tariff {}",
                meter.tariff_id
            ))
        })?;
        let diff = tariff::reading_diff(submission.previous_reading, submission.current_reading)?;
        let breakdown = tariff::compute_total(
            diff,
            submission.reading_factor,
            tariff.cost_per_kwh,
            tariff.fixed_fee,
            &submission.items,
        )?;
        tariff::check_total(submission.bill_total, breakdown.total, self.total_tolerance)?;

        if unit.bill(account, submission.period)?.is_some() {
            return Err(BillingError::Integrity(format!(
                "meter {account} already has a bill for {}",
                submission.period
            )));
        }
        debug!(
            account = %account,
            reading_diff = %breakdown.reading_diff,
            computed = %breakdown.total,
            claimed = %submission.bill_total,
            "submission validated"
        );

        let bill = Bill {
            id: Uuid::new_v4(),
            account: account.clone(),
            period: submission.period,
            previous_reading: submission.previous_reading,
            current_reading: submission.current_reading,
            reading_factor: submission.reading_factor,
            power_consumption: submission.power_consumption,
            tariff_id: tariff.id,
            tariff_cost: tariff.cost_per_kwh,
            fixed_fee: tariff.fixed_fee,
            consumption_cost: breakdown.consumption_cost,
            items: submission.items.clone(),
            computed_total: breakdown.total,
            bill_total: submission.bill_total,
            is_paid: submission.is_paid,
            notes: submission.notes.clone(),
            delay: submission.delay,
            created_at: Utc::now(),
        };
        Ok(ValidatedBill {
            bill,
            relations,
            breakdown,
        })
    }
}

/// Checks that need no stored state.
fn check_shape(submission: &ReadingSubmission) -> BillingResult<()> {
    submission.period.validate()?;
    if let Some(delay) = submission.delay {
        delay.validate()?;
    }
    for (label, value) in [
        ("previous reading", submission.previous_reading),
        ("current reading", submission.current_reading),
        ("power consumption", submission.power_consumption),
    ] {
        if value < Decimal::ZERO {
            return Err(BillingError::InvalidReading(format!(
                "{label} {value} is negative"
            )));
        }
    }
    Ok(())
}
