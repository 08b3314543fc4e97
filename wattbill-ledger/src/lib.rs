//! Storage collaborators for the billing engine: meter registry, relations, bills and
//! technology ledgers, plus a SQLite backend.

mod error;
mod query;
mod repository;
mod sqlite;

pub use error::{LedgerError, LedgerResult};
pub use query::LedgerQuery;
pub use repository::{
    BillStore, BillingRepository, LedgerStore, MeterStore, ReferenceStore, Registry,
    RelationStore, UnitOfWork, UnlinkOutcome,
};
pub use sqlite::SqliteBillingRepository;
