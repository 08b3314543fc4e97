//! Billing engine: validates meter readings, advances meters, allocates bills to
//! technology ledgers and re-splits shared meters by treated water volume.

pub mod allocator;
pub mod dosing;
mod error;
pub mod meter;
pub mod reversal;
pub mod service;
pub mod tariff;
pub mod validator;

pub use allocator::{Allocator, NormalizedGroup};
pub use dosing::{DosingReport, DosingStatus, SeasonCalendar};
pub use error::{BillingError, BillingResult};
pub use reversal::ReversalResult;
pub use service::{
    AcceptedBill, BillingService, BillingSettings, LedgerUpdateResult, VolumeEntry,
};
pub use tariff::{check_total, compute_total, reading_diff, TotalBreakdown};
pub use validator::{BillValidator, ValidatedBill};
