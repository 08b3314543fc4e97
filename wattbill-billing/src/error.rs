use rust_decimal::Decimal;
use thiserror::Error;
use wattbill_core::{AccountNumber, Period, PeriodError, StationId, TechnologyId};
use wattbill_ledger::LedgerError;

/// Result alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

/// Request-scoped billing failures. Every variant rolls back the enclosing transaction.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("meter {0} is not linked to any station")]
    NotLinked(AccountNumber),
    #[error(
        "previous reading {submitted} does not match the final reading {expected} of meter {account}"
    )]
    ReadingMismatch {
        account: AccountNumber,
        expected: Decimal,
        submitted: Decimal,
    },
    #[error("reading factor {submitted} does not match the registered factor {expected}")]
    FactorMismatch { expected: i64, submitted: i64 },
    #[error("bill total {claimed} does not match computed total {computed} (difference {delta})")]
    TotalMismatch {
        claimed: Decimal,
        computed: Decimal,
        delta: Decimal,
    },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid period: {0}")]
    InvalidPeriod(#[from] PeriodError),
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("meter {0} is not registered")]
    UnknownMeter(AccountNumber),
    #[error("station {0} is not registered")]
    UnknownStation(StationId),
    #[error("technology {0} is not registered")]
    UnknownTechnology(TechnologyId),
    #[error("no bill for meter {account} in {period}")]
    BillNotFound {
        account: AccountNumber,
        period: Period,
    },
    #[error("bill {period} of meter {account} is not the latest; delete newer bills first")]
    NotLatestBill {
        account: AccountNumber,
        period: Period,
    },
    #[error("water volume {0} must not be negative")]
    InvalidVolume(Decimal),
}

impl From<LedgerError> for BillingError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Integrity(msg) => Self::Integrity(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
