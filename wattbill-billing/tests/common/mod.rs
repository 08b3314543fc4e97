#![allow(dead_code)]

use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use wattbill_billing::{BillingService, BillingSettings};
use wattbill_core::{
    AccountNumber, ChemicalReference, DoseRange, LedgerKey, Meter, MonetaryItems, Period,
    ReadingSubmission, Season, Station, StationId, Tariff, TariffId, Technology, TechnologyId,
    TechnologyLedger, WaterSourceId,
};
use wattbill_ledger::{
    BillingRepository, LedgerError, LedgerStore, MeterStore, Registry, SqliteBillingRepository,
};

pub const NORTH: StationId = StationId(10);
pub const SOUTH: StationId = StationId(11);
pub const FILTRATION: TechnologyId = TechnologyId(20);
pub const SOFTENING: TechnologyId = TechnologyId(21);

/// Meter feeding north/filtration only, cumulative reading 1000.
pub const SINGLE: &str = "ACC-1";
/// Meter shared by north/softening and south/softening, reading 0.
pub const SHARED: &str = "ACC-SHARED";
/// Meter feeding south/filtration near the top of its 4-digit counter.
pub const ROLLOVER: &str = "ACC-ROLL";
/// Registered meter without any relation.
pub const LONE: &str = "ACC-LONE";

pub fn account(raw: &str) -> AccountNumber {
    AccountNumber::from(raw)
}

pub fn period(month: u32, year: i32) -> Period {
    Period::new(month, year).unwrap()
}

pub fn key(station: StationId, technology: TechnologyId, period: Period) -> LedgerKey {
    LedgerKey::new(station, technology, period)
}

/// Repository with a 2.00/kWh tariff (fixed fee 5), two stations, two technologies and
/// the meters above.
pub fn seeded_repo(dir: &Path) -> SqliteBillingRepository {
    let repo = SqliteBillingRepository::new(dir.join("wattbill.db")).unwrap();
    repo.add_tariff(&Tariff {
        id: TariffId(1),
        voltage_type: "medium".into(),
        cost_per_kwh: dec!(2.00),
        fixed_fee: dec!(5),
    })
    .unwrap();
    for (id, name, source) in [(NORTH, "north", 1), (SOUTH, "south", 2)] {
        repo.add_station(&Station {
            id,
            name: name.into(),
            water_source: WaterSourceId(source),
        })
        .unwrap();
    }
    for (id, name, intensity) in [
        (FILTRATION, "filtration", dec!(0.35)),
        (SOFTENING, "softening", dec!(0.5)),
    ] {
        repo.add_technology(&Technology {
            id,
            name: name.into(),
            power_per_water: intensity,
        })
        .unwrap();
    }
    for (raw, reading) in [
        (SINGLE, dec!(1000)),
        (SHARED, dec!(0)),
        (ROLLOVER, dec!(9998)),
        (LONE, dec!(0)),
    ] {
        repo.add_meter(&Meter {
            account: account(raw),
            meter_id: format!("M-{raw}"),
            factor: 1,
            final_reading: reading,
            tariff_id: TariffId(1),
        })
        .unwrap();
    }
    repo.link(NORTH, FILTRATION, &account(SINGLE)).unwrap();
    repo.link(NORTH, SOFTENING, &account(SHARED)).unwrap();
    repo.link(SOUTH, SOFTENING, &account(SHARED)).unwrap();
    repo.link(SOUTH, FILTRATION, &account(ROLLOVER)).unwrap();
    repo.add_chemical_reference(&ChemicalReference {
        technology: SOFTENING,
        water_source: WaterSourceId(1),
        season: Season::Summer,
        chlorine: DoseRange::new(dec!(2), dec!(4)),
        solid_alum: Some(DoseRange::new(dec!(10), dec!(20))),
        liquid_alum: None,
    })
    .unwrap();
    repo
}

pub fn service(dir: &Path) -> BillingService<SqliteBillingRepository> {
    BillingService::new(seeded_repo(dir), BillingSettings::default())
}

/// Submission with factor 1 and no extra monetary items.
pub fn submission(
    raw: &str,
    period: Period,
    previous: Decimal,
    current: Decimal,
    power: Decimal,
    total: Decimal,
) -> ReadingSubmission {
    ReadingSubmission {
        account: account(raw),
        period,
        previous_reading: previous,
        current_reading: current,
        reading_factor: 1,
        power_consumption: power,
        items: MonetaryItems::default(),
        bill_total: total,
        is_paid: false,
        notes: None,
        delay: None,
    }
}

pub fn final_reading(repo: &SqliteBillingRepository, raw: &str) -> Decimal {
    repo.snapshot(|unit| unit.meter(&account(raw)))
        .unwrap()
        .unwrap()
        .final_reading
}

pub fn ledger(repo: &SqliteBillingRepository, key: LedgerKey) -> Option<TechnologyLedger> {
    repo.snapshot(|unit| Ok::<_, LedgerError>(unit.ledger(&key)?))
        .unwrap()
}
