use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Season, TechnologyId, WaterSourceId};

/// Chemical consumption recorded against a technology ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChemicalReadings {
    #[serde(default)]
    pub chlorine: Option<Decimal>,
    #[serde(default)]
    pub solid_alum: Option<Decimal>,
    #[serde(default)]
    pub liquid_alum: Option<Decimal>,
}

/// Inclusive reference band for a chemical dose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseRange {
    pub from: Decimal,
    pub to: Decimal,
}

impl DoseRange {
    pub fn new(from: Decimal, to: Decimal) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.from && value <= self.to
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRanges {
    #[serde(default)]
    pub chlorine: Option<DoseRange>,
    #[serde(default)]
    pub solid_alum: Option<DoseRange>,
    #[serde(default)]
    pub liquid_alum: Option<DoseRange>,
}

/// Seasonal dosing reference for a technology fed by a given water source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChemicalReference {
    pub technology: TechnologyId,
    pub water_source: WaterSourceId,
    pub season: Season,
    pub chlorine: DoseRange,
    #[serde(default)]
    pub solid_alum: Option<DoseRange>,
    #[serde(default)]
    pub liquid_alum: Option<DoseRange>,
}

impl ChemicalReference {
    pub fn ranges(&self) -> ReferenceRanges {
        ReferenceRanges {
            chlorine: Some(self.chlorine),
            solid_alum: self.solid_alum,
            liquid_alum: self.liquid_alum,
        }
    }
}
