//! Fans a meter bill out across technology ledgers and re-splits shared meters once every
//! sibling ledger has reported its water volume.
//!
//! Each bill records the exact amounts it added to each ledger (`BillAllocation`). Re-splits
//! and reversals work from the source bill and those recorded amounts, never by scaling a
//! ledger's already-divided balance, so repeated volume edits do not compound.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wattbill_core::{
    AccountNumber, Allocation, Bill, BillAllocation, LedgerKey, Period, Relation,
    TechnologyLedger,
};
use wattbill_ledger::{BillStore, LedgerStore, RelationStore, UnitOfWork};

use crate::{BillingError, BillingResult};

/// Percentages summing to 100 within this distance are treated as a complete split.
const COMPLETE_SPLIT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Ledgers of one shared meter rewritten by a re-normalization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedGroup {
    pub account: AccountNumber,
    pub period: Period,
    pub ledgers: Vec<TechnologyLedger>,
}

#[derive(Clone, Debug)]
pub struct Allocator {
    money_scale: u32,
    power_scale: u32,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl Allocator {
    pub fn new(money_scale: u32, power_scale: u32) -> Self {
        Self {
            money_scale,
            power_scale,
        }
    }

    /// Apply an accepted bill to the ledgers of its captured relation set.
    pub fn allocate(
        &self,
        unit: &dyn UnitOfWork,
        bill: &Bill,
        relations: &[Relation],
    ) -> BillingResult<Vec<BillAllocation>> {
        let keys: Vec<LedgerKey> = relations
            .iter()
            .map(|relation| LedgerKey::new(relation.station, relation.technology, bill.period))
            .collect();
        let allocations = match keys.as_slice() {
            [key] => vec![self.assign_full(unit, bill, *key)?],
            _ => self.assign_shared(unit, bill, &keys)?,
        };
        for allocation in &allocations {
            unit.insert_allocation(allocation)?;
        }
        Ok(allocations)
    }

    /// Single relation: the ledger carries the whole bill at 100%.
    fn assign_full(
        &self,
        unit: &dyn UnitOfWork,
        bill: &Bill,
        key: LedgerKey,
    ) -> BillingResult<BillAllocation> {
        let mut ledger = unit
            .ledger(&key)?
            .unwrap_or_else(|| TechnologyLedger::empty(key, Allocation::full()));
        ledger.power = accumulate(ledger.power, bill.power_consumption, "power", key)?;
        ledger.bill_total = accumulate(ledger.bill_total, bill.bill_total, "bill total", key)?;
        unit.upsert_ledger(&ledger)?;
        debug!(ledger = %key, power = %ledger.power, "full bill assigned");
        Ok(allocation_row(
            bill,
            key,
            Some(Decimal::ONE_HUNDRED),
            bill.power_consumption,
            bill.bill_total,
        ))
    }

    /// Shared meter: once every sibling has a volume the bill is split by this meter's own
    /// volume ratio. Otherwise normalized ledgers take their stored share and unsplit ledgers
    /// take the whole bill until volume data arrives.
    fn assign_shared(
        &self,
        unit: &dyn UnitOfWork,
        bill: &Bill,
        keys: &[LedgerKey],
    ) -> BillingResult<Vec<BillAllocation>> {
        let mut ledgers = Vec::with_capacity(keys.len());
        for key in keys {
            ledgers.push(
                unit.ledger(key)?
                    .unwrap_or_else(|| TechnologyLedger::empty(*key, Allocation::Unsplit)),
            );
        }
        // A ledger fed by several shared meters keeps only the last group's percentage, so
        // a complete group is split from the volumes themselves.
        let volumes: Option<Vec<Decimal>> =
            ledgers.iter().map(|ledger| ledger.water_amount).collect();
        let group_shares = match volumes {
            Some(volumes) => volume_percentages(&volumes)?,
            None => None,
        };
        let shares: Vec<Option<Decimal>> = match group_shares {
            Some(percentages) => percentages.into_iter().map(Some).collect(),
            None => ledgers
                .iter()
                .map(|ledger| ledger.allocation.percentage())
                .collect(),
        };

        let amounts: Vec<(Decimal, Decimal)> = match complete_split(&shares) {
            Some(percentages) => self.split_bill(bill, &percentages)?,
            None => shares
                .iter()
                .map(|share| match share {
                    Some(pct) => self.share_of(bill, *pct),
                    None => Ok((bill.power_consumption, bill.bill_total)),
                })
                .collect::<BillingResult<_>>()?,
        };

        let mut allocations = Vec::with_capacity(ledgers.len());
        for ((ledger, share), (power, cost)) in ledgers.iter_mut().zip(&shares).zip(amounts) {
            ledger.power = accumulate(ledger.power, power, "power", ledger.key)?;
            ledger.bill_total = accumulate(ledger.bill_total, cost, "bill total", ledger.key)?;
            unit.upsert_ledger(ledger)?;
            debug!(ledger = %ledger.key, share = ?share, %power, %cost, "shared bill applied");
            allocations.push(allocation_row(bill, ledger.key, *share, power, cost));
        }
        Ok(allocations)
    }

    /// Re-split every shared meter feeding `key` in its period once all of that meter's
    /// sibling ledgers have a water volume. Groups with missing volumes are left untouched.
    pub fn renormalize(
        &self,
        unit: &dyn UnitOfWork,
        key: LedgerKey,
    ) -> BillingResult<Vec<NormalizedGroup>> {
        let groups = sibling_groups(unit, key)?;
        let mut normalized = Vec::new();
        for (account, group) in groups {
            if group.siblings.len() < 2 {
                continue;
            }
            if let Some(ledgers) = self.normalize_group(unit, &account, key.period, &group)? {
                normalized.push(NormalizedGroup {
                    account,
                    period: key.period,
                    ledgers,
                });
            }
        }
        Ok(normalized)
    }

    fn normalize_group(
        &self,
        unit: &dyn UnitOfWork,
        account: &AccountNumber,
        period: Period,
        group: &SiblingGroup,
    ) -> BillingResult<Option<Vec<TechnologyLedger>>> {
        let mut ledgers = BTreeMap::new();
        for sibling in &group.siblings {
            let Some(ledger) = unit.ledger(sibling)? else {
                debug!(%account, ledger = %sibling, "sibling ledger missing; split deferred");
                return Ok(None);
            };
            let Some(volume) = ledger.water_amount else {
                debug!(%account, ledger = %sibling, "sibling volume missing; split deferred");
                return Ok(None);
            };
            ledgers.insert(*sibling, (ledger, volume));
        }
        let volumes: Vec<Decimal> = ledgers.values().map(|(_, volume)| *volume).collect();
        let Some(group_shares) = volume_percentages(&volumes)? else {
            debug!(%account, %period, "group has no water volume; split deferred");
            return Ok(None);
        };

        let mut percentages = BTreeMap::new();
        for ((sibling, (ledger, _)), percentage) in ledgers.iter_mut().zip(group_shares) {
            ledger.allocation = Allocation::Normalized { percentage };
            percentages.insert(*sibling, percentage);
        }

        if group.billed {
            let allocations = unit.allocations_for_bill(account, period)?;
            let bill = unit.bill(account, period)?;
            if let Some(bill) = bill {
                let shares: Vec<Decimal> = allocations
                    .iter()
                    .map(|allocation| {
                        percentages
                            .get(&allocation_key(allocation))
                            .copied()
                            .unwrap_or(Decimal::ZERO)
                    })
                    .collect();
                let amounts = self.split_bill(&bill, &shares)?;
                for ((allocation, share), (power, cost)) in
                    allocations.iter().zip(shares).zip(amounts)
                {
                    let Some((ledger, _)) = ledgers.get_mut(&allocation_key(allocation)) else {
                        continue;
                    };
                    let key = ledger.key;
                    ledger.power = power
                        .checked_sub(allocation.power)
                        .and_then(|delta| ledger.power.checked_add(delta))
                        .ok_or_else(|| out_of_range("power", key))?;
                    ledger.bill_total = cost
                        .checked_sub(allocation.cost)
                        .and_then(|delta| ledger.bill_total.checked_add(delta))
                        .ok_or_else(|| out_of_range("bill total", key))?;
                    unit.update_allocation(&BillAllocation {
                        percentage: Some(share),
                        power,
                        cost,
                        ..allocation.clone()
                    })?;
                }
            }
        }

        let mut rewritten = Vec::with_capacity(ledgers.len());
        for (ledger, _) in ledgers.into_values() {
            unit.upsert_ledger(&ledger)?;
            debug!(
                %account,
                ledger = %ledger.key,
                percentage = ?ledger.allocation.percentage(),
                power = %ledger.power,
                "ledger normalized"
            );
            rewritten.push(ledger);
        }
        Ok(Some(rewritten))
    }

    /// Split a bill by percentages that sum to 100; the last share absorbs rounding so the
    /// parts add up to the bill exactly.
    fn split_bill(
        &self,
        bill: &Bill,
        percentages: &[Decimal],
    ) -> BillingResult<Vec<(Decimal, Decimal)>> {
        let powers = split(bill.power_consumption, percentages, self.power_scale)
            .ok_or_else(|| bill_out_of_range(bill))?;
        let costs = split(bill.bill_total, percentages, self.money_scale)
            .ok_or_else(|| bill_out_of_range(bill))?;
        Ok(powers.into_iter().zip(costs).collect())
    }

    /// One ledger's rounded share of a bill.
    fn share_of(&self, bill: &Bill, percentage: Decimal) -> BillingResult<(Decimal, Decimal)> {
        let power = scale(bill.power_consumption, percentage, self.power_scale);
        let cost = scale(bill.bill_total, percentage, self.money_scale);
        power.zip(cost).ok_or_else(|| bill_out_of_range(bill))
    }
}

/// Sibling ledgers of one meter in a period, and whether a bill already exists for it.
struct SiblingGroup {
    siblings: Vec<LedgerKey>,
    billed: bool,
}

/// Meters feeding `key`, each with its sibling set: the captured allocations when the meter
/// is billed for the period, otherwise its current active relations.
fn sibling_groups(
    unit: &dyn UnitOfWork,
    key: LedgerKey,
) -> BillingResult<BTreeMap<AccountNumber, SiblingGroup>> {
    let mut groups = BTreeMap::new();
    for allocation in unit.allocations_for_ledger(&key)? {
        if groups.contains_key(&allocation.account) {
            continue;
        }
        let siblings = unit
            .allocations_for_bill(&allocation.account, key.period)?
            .iter()
            .map(allocation_key)
            .collect();
        groups.insert(
            allocation.account.clone(),
            SiblingGroup {
                siblings,
                billed: true,
            },
        );
    }
    for relation in unit.active_relations_for(key.station, key.technology)? {
        if groups.contains_key(&relation.account)
            || unit.bill(&relation.account, key.period)?.is_some()
        {
            continue;
        }
        let siblings = unit
            .active_relations(&relation.account)?
            .iter()
            .map(|sibling| LedgerKey::new(sibling.station, sibling.technology, key.period))
            .collect();
        groups.insert(
            relation.account.clone(),
            SiblingGroup {
                siblings,
                billed: false,
            },
        );
    }
    Ok(groups)
}

/// Each volume's percentage of the group total, or `None` when the group holds no water.
fn volume_percentages(volumes: &[Decimal]) -> BillingResult<Option<Vec<Decimal>>> {
    let total = volumes.iter().try_fold(Decimal::ZERO, |total, volume| {
        total
            .checked_add(*volume)
            .ok_or(BillingError::InvalidVolume(*volume))
    })?;
    if total <= Decimal::ZERO {
        return Ok(None);
    }
    volumes
        .iter()
        .map(|volume| {
            // Dividing first keeps the product at or below 100.
            volume
                .checked_div(total)
                .and_then(|fraction| fraction.checked_mul(Decimal::ONE_HUNDRED))
                .ok_or(BillingError::InvalidVolume(*volume))
        })
        .collect::<BillingResult<Vec<_>>>()
        .map(Some)
}

fn complete_split(shares: &[Option<Decimal>]) -> Option<Vec<Decimal>> {
    let percentages: Vec<Decimal> = shares.iter().copied().collect::<Option<_>>()?;
    let sum: Decimal = percentages.iter().copied().sum();
    ((sum - Decimal::ONE_HUNDRED).abs() <= COMPLETE_SPLIT_TOLERANCE).then_some(percentages)
}

/// `amount × percentage / 100`, rounded half away from zero. `None` on overflow.
fn scale(amount: Decimal, percentage: Decimal, dp: u32) -> Option<Decimal> {
    let scaled = amount
        .checked_mul(percentage)?
        .checked_div(Decimal::ONE_HUNDRED)?;
    Some(scaled.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero))
}

fn split(amount: Decimal, percentages: &[Decimal], dp: u32) -> Option<Vec<Decimal>> {
    let mut parts = Vec::with_capacity(percentages.len());
    let mut assigned = Decimal::ZERO;
    for (idx, percentage) in percentages.iter().enumerate() {
        if idx + 1 == percentages.len() {
            parts.push(amount.checked_sub(assigned)?);
        } else {
            let part = scale(amount, *percentage, dp)?;
            assigned = assigned.checked_add(part)?;
            parts.push(part);
        }
    }
    Some(parts)
}

fn accumulate(
    total: Decimal,
    amount: Decimal,
    what: &str,
    key: LedgerKey,
) -> BillingResult<Decimal> {
    total
        .checked_add(amount)
        .ok_or_else(|| out_of_range(what, key))
}

fn out_of_range(what: &str, key: LedgerKey) -> BillingError {
    BillingError::InvalidReading(format!("{what} of ledger {key} is out of range"))
}

fn bill_out_of_range(bill: &Bill) -> BillingError {
    BillingError::InvalidReading(format!(
        "bill of meter {} for {} is too large to split",
        bill.account, bill.period
    ))
}

fn allocation_key(allocation: &BillAllocation) -> LedgerKey {
    LedgerKey::new(allocation.station, allocation.technology, allocation.period)
}

fn allocation_row(
    bill: &Bill,
    key: LedgerKey,
    percentage: Option<Decimal>,
    power: Decimal,
    cost: Decimal,
) -> BillAllocation {
    BillAllocation {
        account: bill.account.clone(),
        period: bill.period,
        station: key.station,
        technology: key.technology,
        percentage,
        power,
        cost,
    }
}
