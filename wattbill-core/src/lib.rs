//! Domain types shared by the wattbill storage layer, billing engine and CLI.

mod bill;
mod chemistry;
mod ids;
mod ledger;
mod period;
mod registry;

pub use bill::{Bill, BillAllocation, MonetaryItems, ReadingSubmission};
pub use chemistry::{ChemicalReadings, ChemicalReference, DoseRange, ReferenceRanges};
pub use ids::{AccountNumber, StationId, TariffId, TechnologyId, WaterSourceId};
pub use ledger::{Allocation, LedgerKey, TechnologyLedger};
pub use period::{Period, PeriodError, Season};
pub use registry::{Meter, Relation, Station, Tariff, Technology};
