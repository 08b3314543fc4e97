use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wattbill_core::{
    AccountNumber, Allocation, Bill, BillAllocation, ChemicalReadings, LedgerKey, Period,
    ReadingSubmission, ReferenceRanges, StationId, TechnologyId, TechnologyLedger,
};
use wattbill_events::{
    BillAcceptedEvent, BillReversedEvent, BillingEvent, EventBus, GroupNormalizedEvent,
    VolumeRecordedEvent,
};
use wattbill_ledger::{
    BillStore, BillingRepository, LedgerQuery, LedgerStore, ReferenceStore, UnitOfWork,
};

use crate::allocator::{Allocator, NormalizedGroup};
use crate::dosing::{DosingReport, SeasonCalendar};
use crate::reversal::{self, ReversalResult};
use crate::validator::BillValidator;
use crate::{meter, BillingError, BillingResult};

/// Tunables of the billing engine.
#[derive(Clone, Debug)]
pub struct BillingSettings {
    pub total_tolerance: i64,
    pub money_scale: u32,
    pub power_scale: u32,
    pub calendar: SeasonCalendar,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            total_tolerance: 1,
            money_scale: 4,
            power_scale: 4,
            calendar: SeasonCalendar::default(),
        }
    }
}

/// A bill that was accepted and fanned out to its ledgers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptedBill {
    pub bill: Bill,
    pub allocations: Vec<BillAllocation>,
}

/// Operator entry of monthly treated volume and chemical readings for one ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub station: StationId,
    pub technology: TechnologyId,
    pub period: Period,
    pub volume: Decimal,
    #[serde(default)]
    pub chemicals: ChemicalReadings,
}

/// The ledger after a volume entry, any groups it re-split and its dosing classification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerUpdateResult {
    pub ledger: TechnologyLedger,
    pub normalized: Vec<NormalizedGroup>,
    pub dosing: DosingReport,
}

/// Entry point for reading submissions, bill deletion and volume entry.
///
/// Each operation runs in a single repository transaction; events go out only after commit.
pub struct BillingService<R> {
    repo: R,
    validator: BillValidator,
    allocator: Allocator,
    calendar: SeasonCalendar,
    events: Option<Arc<EventBus>>,
}

impl<R: BillingRepository> BillingService<R> {
    pub fn new(repo: R, settings: BillingSettings) -> Self {
        Self {
            repo,
            validator: BillValidator::new(settings.total_tolerance),
            allocator: Allocator::new(settings.money_scale, settings.power_scale),
            calendar: settings.calendar,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Validate a submission, store the bill, advance the meter and allocate to ledgers.
    pub fn submit_bill(&self, submission: ReadingSubmission) -> BillingResult<AcceptedBill> {
        let outcome = self.repo.atomically(|unit| {
            let validated = self.validator.validate(unit, &submission)?;
            unit.insert_bill(&validated.bill)?;
            meter::advance(unit, &validated.bill)?;
            let allocations = self
                .allocator
                .allocate(unit, &validated.bill, &validated.relations)?;
            Ok::<_, BillingError>(AcceptedBill {
                bill: validated.bill,
                allocations,
            })
        });
        let accepted = match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(
                    account = %submission.account,
                    period = %submission.period,
                    error = %err,
                    "reading submission rejected"
                );
                return Err(err);
            }
        };
        info!(
            account = %accepted.bill.account,
            period = %accepted.bill.period,
            total = %accepted.bill.bill_total,
            ledgers = accepted.allocations.len(),
            "bill accepted"
        );
        self.publish(BillingEvent::BillAccepted(BillAcceptedEvent {
            bill: accepted.bill.clone(),
            allocations: accepted.allocations.clone(),
        }));
        Ok(accepted)
    }

    /// Delete a meter's latest bill and undo its ledger contributions and meter advance.
    pub fn delete_bill(
        &self,
        account: &AccountNumber,
        period: Period,
    ) -> BillingResult<ReversalResult> {
        let reversed = self
            .repo
            .atomically(|unit| reversal::reverse(unit, account, period))
            .inspect_err(|err| {
                warn!(%account, %period, error = %err, "bill deletion rejected");
            })?;
        info!(
            %account,
            %period,
            restored_reading = %reversed.restored_reading,
            removed_ledgers = reversed.removed_ledgers.len(),
            "bill deleted"
        );
        self.publish(BillingEvent::BillReversed(BillReversedEvent {
            bill: reversed.bill.clone(),
            allocations: reversed.allocations.clone(),
            removed_ledgers: reversed.removed_ledgers.clone(),
        }));
        Ok(reversed)
    }

    /// Record treated volume and chemical readings, then re-split any shared meter whose
    /// sibling ledgers now all carry a volume.
    pub fn record_volume(&self, entry: VolumeEntry) -> BillingResult<LedgerUpdateResult> {
        entry.period.validate()?;
        if entry.volume < Decimal::ZERO {
            return Err(BillingError::InvalidVolume(entry.volume));
        }
        let key = LedgerKey::new(entry.station, entry.technology, entry.period);
        let result = self
            .repo
            .atomically(|unit| self.apply_volume(unit, key, &entry))
            .inspect_err(|err| {
                warn!(ledger = %key, error = %err, "volume entry rejected");
            })?;
        info!(
            ledger = %key,
            volume = %entry.volume,
            groups = result.normalized.len(),
            within_range = result.dosing.is_within(),
            "volume recorded"
        );
        self.publish(BillingEvent::VolumeRecorded(VolumeRecordedEvent {
            ledger: result.ledger.clone(),
        }));
        for group in &result.normalized {
            self.publish(BillingEvent::GroupNormalized(GroupNormalizedEvent {
                account: group.account.clone(),
                period: group.period,
                ledgers: group.ledgers.clone(),
            }));
        }
        Ok(result)
    }

    fn apply_volume(
        &self,
        unit: &dyn UnitOfWork,
        key: LedgerKey,
        entry: &VolumeEntry,
    ) -> BillingResult<LedgerUpdateResult> {
        let station = unit
            .station(entry.station)?
            .ok_or(BillingError::UnknownStation(entry.station))?;
        let technology = unit
            .technology(entry.technology)?
            .ok_or(BillingError::UnknownTechnology(entry.technology))?;
        let season = self.calendar.season_of(entry.period);
        let ranges = unit
            .chemical_reference(technology.id, station.water_source, season)?
            .map(|reference| reference.ranges())
            .unwrap_or_else(ReferenceRanges::default);

        let mut ledger = unit
            .ledger(&key)?
            .unwrap_or_else(|| TechnologyLedger::empty(key, Allocation::Unsplit));
        ledger.water_amount = Some(entry.volume);
        ledger.chemicals = entry.chemicals.clone();
        ledger.power_per_water = Some(technology.power_per_water);
        ledger.ranges = ranges;
        unit.upsert_ledger(&ledger)?;

        let normalized = self.allocator.renormalize(unit, key)?;
        let ledger = unit.ledger(&key)?.ok_or_else(|| {
            BillingError::Integrity(format!("ledger {key} vanished while recording volume"))
        })?;
        let dosing = DosingReport::evaluate(&ledger.chemicals, &ledger.ranges);
        Ok(LedgerUpdateResult {
            ledger,
            normalized,
            dosing,
        })
    }

    pub fn bill(&self, account: &AccountNumber, period: Period) -> BillingResult<Option<Bill>> {
        self.repo.snapshot(|unit| Ok(unit.bill(account, period)?))
    }

    pub fn allocations(
        &self,
        account: &AccountNumber,
        period: Period,
    ) -> BillingResult<Vec<BillAllocation>> {
        self.repo
            .snapshot(|unit| Ok(unit.allocations_for_bill(account, period)?))
    }

    pub fn ledgers(&self, query: &LedgerQuery) -> BillingResult<Vec<TechnologyLedger>> {
        Ok(self.repo.query_ledgers(query)?)
    }

    fn publish(&self, event: BillingEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
