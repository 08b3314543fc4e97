use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountNumber, StationId, TariffId, TechnologyId, WaterSourceId};

/// Voltage tariff: cost per kWh plus a fixed monthly fee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub id: TariffId,
    pub voltage_type: String,
    pub cost_per_kwh: Decimal,
    pub fixed_fee: Decimal,
}

/// Electricity meter and its durable cumulative reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub account: AccountNumber,
    pub meter_id: String,
    pub factor: i64,
    pub final_reading: Decimal,
    pub tariff_id: TariffId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub water_source: WaterSourceId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Technology {
    pub id: TechnologyId,
    pub name: String,
    /// Reference energy intensity (kWh per cubic metre of treated water).
    pub power_per_water: Decimal,
}

/// Link between a meter and a (station, technology) pair.
///
/// Relations referenced by bills are deactivated instead of deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub station: StationId,
    pub technology: TechnologyId,
    pub account: AccountNumber,
    pub active: bool,
}
