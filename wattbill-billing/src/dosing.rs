use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wattbill_core::{ChemicalReadings, DoseRange, Period, ReferenceRanges, Season};

/// Maps billing months onto dosing seasons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeasonCalendar {
    summer_months: Vec<u32>,
}

impl SeasonCalendar {
    pub fn new(summer_months: impl IntoIterator<Item = u32>) -> Self {
        Self {
            summer_months: summer_months.into_iter().collect(),
        }
    }

    pub fn season_of(&self, period: Period) -> Season {
        if self.summer_months.contains(&period.month) {
            Season::Summer
        } else {
            Season::Winter
        }
    }
}

impl Default for SeasonCalendar {
    fn default() -> Self {
        Self::new(4..=10)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DosingStatus {
    Below,
    Within,
    Above,
}

/// Classification of each recorded chemical against its seasonal reference band.
///
/// A chemical without a reading or without a reference band is left unclassified.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DosingReport {
    pub chlorine: Option<DosingStatus>,
    pub solid_alum: Option<DosingStatus>,
    pub liquid_alum: Option<DosingStatus>,
}

impl DosingReport {
    pub fn evaluate(readings: &ChemicalReadings, ranges: &ReferenceRanges) -> Self {
        Self {
            chlorine: classify(readings.chlorine, ranges.chlorine),
            solid_alum: classify(readings.solid_alum, ranges.solid_alum),
            liquid_alum: classify(readings.liquid_alum, ranges.liquid_alum),
        }
    }

    /// True when no classified chemical falls outside its band.
    pub fn is_within(&self) -> bool {
        [self.chlorine, self.solid_alum, self.liquid_alum]
            .into_iter()
            .flatten()
            .all(|status| status == DosingStatus::Within)
    }
}

fn classify(value: Option<Decimal>, range: Option<DoseRange>) -> Option<DosingStatus> {
    let (value, range) = (value?, range?);
    Some(if value < range.from {
        DosingStatus::Below
    } else if value > range.to {
        DosingStatus::Above
    } else {
        DosingStatus::Within
    })
}
