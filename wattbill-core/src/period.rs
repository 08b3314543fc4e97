use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing or parsing a billing period.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("month {0} is outside 1..=12")]
    InvalidMonth(u32),
    #[error("malformed period '{0}', expected MM/YYYY")]
    Malformed(String),
}

/// Monthly billing period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Result<Self, PeriodError> {
        let period = Self { month, year };
        period.validate()?;
        Ok(period)
    }

    /// Deserialized periods bypass [`Period::new`]; callers re-check them at the boundary.
    pub fn validate(&self) -> Result<(), PeriodError> {
        if (1..=12).contains(&self.month) {
            Ok(())
        } else {
            Err(PeriodError::InvalidMonth(self.month))
        }
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.year, self.month).cmp(&(other.year, other.month))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PeriodError::Malformed(s.to_string());
        let (month, year) = s.trim().split_once('/').ok_or_else(malformed)?;
        let month = month.parse().map_err(|_| malformed())?;
        let year = year.parse().map_err(|_| malformed())?;
        Self::new(month, year)
    }
}

/// Dosing season used to pick chemical reference ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Summer,
    Winter,
}

impl Season {
    pub fn as_str(self) -> &'static str {
        match self {
            Season::Summer => "summer",
            Season::Winter => "winter",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summer" => Ok(Season::Summer),
            "winter" => Ok(Season::Winter),
            other => Err(format!("unknown season: {other}")),
        }
    }
}
