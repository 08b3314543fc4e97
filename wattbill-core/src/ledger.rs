use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ChemicalReadings, Period, ReferenceRanges, StationId, TechnologyId};

/// Natural key of a technology ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub station: StationId,
    pub technology: TechnologyId,
    pub period: Period,
}

impl LedgerKey {
    pub fn new(station: StationId, technology: TechnologyId, period: Period) -> Self {
        Self {
            station,
            technology,
            period,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "station {} / technology {} @ {}",
            self.station, self.technology, self.period
        )
    }
}

/// Allocation state of a technology ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Allocation {
    /// Holds raw, undivided bill contributions until every sibling reports volume.
    Unsplit,
    /// Holds its fractional share of the shared meter.
    Normalized { percentage: Decimal },
}

impl Allocation {
    pub fn full() -> Self {
        Allocation::Normalized {
            percentage: Decimal::ONE_HUNDRED,
        }
    }

    pub fn percentage(&self) -> Option<Decimal> {
        match self {
            Allocation::Unsplit => None,
            Allocation::Normalized { percentage } => Some(*percentage),
        }
    }

    pub fn is_normalized(&self) -> bool {
        matches!(self, Allocation::Normalized { .. })
    }
}

/// Monthly consumption ledger of one technology at one station.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TechnologyLedger {
    pub key: LedgerKey,
    pub allocation: Allocation,
    pub power: Decimal,
    pub bill_total: Decimal,
    pub water_amount: Option<Decimal>,
    pub chemicals: ChemicalReadings,
    pub power_per_water: Option<Decimal>,
    pub ranges: ReferenceRanges,
}

impl TechnologyLedger {
    /// Fresh ledger with zero amounts and no volume data.
    pub fn empty(key: LedgerKey, allocation: Allocation) -> Self {
        Self {
            key,
            allocation,
            power: Decimal::ZERO,
            bill_total: Decimal::ZERO,
            water_amount: None,
            chemicals: ChemicalReadings::default(),
            power_per_water: None,
            ranges: ReferenceRanges::default(),
        }
    }

    pub fn has_volume(&self) -> bool {
        self.water_amount.is_some()
    }
}
