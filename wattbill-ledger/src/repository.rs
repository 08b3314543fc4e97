use rust_decimal::Decimal;
use wattbill_core::{
    AccountNumber, Bill, BillAllocation, ChemicalReference, LedgerKey, Meter, Period, Relation,
    Season, Station, StationId, Tariff, TariffId, Technology, TechnologyId, TechnologyLedger,
    WaterSourceId,
};

use crate::{LedgerError, LedgerQuery, LedgerResult};

/// Meter registry access.
pub trait MeterStore {
    fn meter(&self, account: &AccountNumber) -> LedgerResult<Option<Meter>>;

    fn tariff(&self, id: TariffId) -> LedgerResult<Option<Tariff>>;

    /// Overwrite the meter's cumulative reading.
    fn set_final_reading(&self, account: &AccountNumber, reading: Decimal) -> LedgerResult<()>;
}

/// Station/technology/meter relation lookups.
pub trait RelationStore {
    /// Active relations of a meter, ordered by (station, technology).
    fn active_relations(&self, account: &AccountNumber) -> LedgerResult<Vec<Relation>>;

    /// Active relations feeding one (station, technology) pair.
    fn active_relations_for(
        &self,
        station: StationId,
        technology: TechnologyId,
    ) -> LedgerResult<Vec<Relation>>;
}

/// Meter-level bills and the per-ledger allocations captured when they were accepted.
pub trait BillStore {
    fn insert_bill(&self, bill: &Bill) -> LedgerResult<()>;

    fn bill(&self, account: &AccountNumber, period: Period) -> LedgerResult<Option<Bill>>;

    /// The meter's bill with the most recent period, if any.
    fn latest_bill(&self, account: &AccountNumber) -> LedgerResult<Option<Bill>>;

    /// Delete a bill together with its allocations. Returns `false` when no row matched.
    fn delete_bill(&self, account: &AccountNumber, period: Period) -> LedgerResult<bool>;

    fn insert_allocation(&self, allocation: &BillAllocation) -> LedgerResult<()>;

    fn update_allocation(&self, allocation: &BillAllocation) -> LedgerResult<()>;

    /// Allocations of one bill, ordered by (station, technology).
    fn allocations_for_bill(
        &self,
        account: &AccountNumber,
        period: Period,
    ) -> LedgerResult<Vec<BillAllocation>>;

    fn allocations_for_ledger(&self, key: &LedgerKey) -> LedgerResult<Vec<BillAllocation>>;
}

/// Technology ledger rows keyed by (station, technology, month, year).
pub trait LedgerStore {
    fn ledger(&self, key: &LedgerKey) -> LedgerResult<Option<TechnologyLedger>>;

    fn upsert_ledger(&self, ledger: &TechnologyLedger) -> LedgerResult<()>;

    fn delete_ledger(&self, key: &LedgerKey) -> LedgerResult<()>;

    /// Subtract previously applied amounts from an existing ledger.
    fn decrement_ledger(
        &self,
        key: &LedgerKey,
        power: Decimal,
        cost: Decimal,
    ) -> LedgerResult<TechnologyLedger> {
        let mut ledger = self.ledger(key)?.ok_or_else(|| {
            LedgerError::InvalidState(format!("cannot decrement missing ledger {key}"))
        })?;
        ledger.power = ledger.power.checked_sub(power).ok_or_else(|| {
            LedgerError::InvalidState(format!("power of ledger {key} out of range"))
        })?;
        ledger.bill_total = ledger.bill_total.checked_sub(cost).ok_or_else(|| {
            LedgerError::InvalidState(format!("bill total of ledger {key} out of range"))
        })?;
        self.upsert_ledger(&ledger)?;
        Ok(ledger)
    }
}

/// Read-only reference tables consulted when snapshotting dosing data.
pub trait ReferenceStore {
    fn station(&self, id: StationId) -> LedgerResult<Option<Station>>;

    fn technology(&self, id: TechnologyId) -> LedgerResult<Option<Technology>>;

    fn chemical_reference(
        &self,
        technology: TechnologyId,
        water_source: WaterSourceId,
        season: Season,
    ) -> LedgerResult<Option<ChemicalReference>>;
}

/// Every store scoped to one storage transaction.
pub trait UnitOfWork: MeterStore + RelationStore + BillStore + LedgerStore + ReferenceStore {}

impl<T> UnitOfWork for T where T: MeterStore + RelationStore + BillStore + LedgerStore + ReferenceStore
{}

/// Abstraction over durable billing storage engines.
pub trait BillingRepository: Send + Sync {
    /// Run `work` inside one write transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// Writers are serialized, so read-check-advance sequences against a meter
    /// cannot interleave.
    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn UnitOfWork) -> Result<T, E>,
        E: From<LedgerError>;

    /// Run `work` against a consistent read snapshot.
    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn UnitOfWork) -> Result<T, E>,
        E: From<LedgerError>;

    /// List technology ledgers matching the supplied query.
    fn query_ledgers(&self, query: &LedgerQuery) -> LedgerResult<Vec<TechnologyLedger>>;
}

/// Outcome of removing a station/technology link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Removed,
    Deactivated,
    Missing,
}

/// Reference-data plumbing used to set up meters, tariffs and relations.
pub trait Registry {
    fn add_tariff(&self, tariff: &Tariff) -> LedgerResult<()>;

    fn add_station(&self, station: &Station) -> LedgerResult<()>;

    fn add_technology(&self, technology: &Technology) -> LedgerResult<()>;

    fn add_meter(&self, meter: &Meter) -> LedgerResult<()>;

    fn add_chemical_reference(&self, reference: &ChemicalReference) -> LedgerResult<()>;

    /// Insert a relation, or reactivate it when it already exists.
    fn link(
        &self,
        station: StationId,
        technology: TechnologyId,
        account: &AccountNumber,
    ) -> LedgerResult<()>;

    /// Remove a relation; relations referenced by bills are only deactivated.
    fn unlink(
        &self,
        station: StationId,
        technology: TechnologyId,
        account: &AccountNumber,
    ) -> LedgerResult<UnlinkOutcome>;

    /// Set a meter's reading directly. Refused once bills exist for the meter.
    fn set_final_reading(&self, account: &AccountNumber, reading: Decimal) -> LedgerResult<()>;

    /// Every relation of a meter, active or not.
    fn relations(&self, account: &AccountNumber) -> LedgerResult<Vec<Relation>>;
}
