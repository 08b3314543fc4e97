use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AccountNumber, Period, StationId, TariffId, TechnologyId};

/// Monetary line items printed on a utility bill besides the consumption charge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetaryItems {
    pub fixed_installment: Decimal,
    pub settlements: Decimal,
    pub settlement_qty: Decimal,
    pub stamp: Decimal,
    pub prior_payments: Decimal,
    pub rounding: Decimal,
}

/// Raw meter reading submission as entered by an operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadingSubmission {
    pub account: AccountNumber,
    pub period: Period,
    pub previous_reading: Decimal,
    pub current_reading: Decimal,
    pub reading_factor: i64,
    pub power_consumption: Decimal,
    #[serde(default)]
    pub items: MonetaryItems,
    /// Total printed on the bill; checked against the tariff formula.
    pub bill_total: Decimal,
    #[serde(default)]
    pub is_paid: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub delay: Option<Period>,
}

/// Accepted meter-level bill.
///
/// Tariff cost and fixed fee are snapshots taken at submission time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: Uuid,
    pub account: AccountNumber,
    pub period: Period,
    pub previous_reading: Decimal,
    pub current_reading: Decimal,
    pub reading_factor: i64,
    pub power_consumption: Decimal,
    pub tariff_id: TariffId,
    pub tariff_cost: Decimal,
    pub fixed_fee: Decimal,
    pub consumption_cost: Decimal,
    pub items: MonetaryItems,
    pub computed_total: Decimal,
    pub bill_total: Decimal,
    pub is_paid: bool,
    pub notes: Option<String>,
    pub delay: Option<Period>,
    pub created_at: DateTime<Utc>,
}

/// Share of one bill applied to one technology ledger.
///
/// `percentage` is `None` while the bill sits unsplit on the ledger. `power` and
/// `cost` are the exact amounts added, so reversal subtracts precisely what was applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillAllocation {
    pub account: AccountNumber,
    pub period: Period,
    pub station: StationId,
    pub technology: TechnologyId,
    pub percentage: Option<Decimal>,
    pub power: Decimal,
    pub cost: Decimal,
}
