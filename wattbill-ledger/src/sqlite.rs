use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;
use wattbill_core::{
    AccountNumber, Allocation, Bill, BillAllocation, ChemicalReadings, ChemicalReference,
    DoseRange, LedgerKey, Meter, MonetaryItems, Period, ReferenceRanges, Relation, Season,
    Station, StationId, Tariff, TariffId, Technology, TechnologyId, TechnologyLedger,
    WaterSourceId,
};

use crate::{
    BillStore, BillingRepository, LedgerError, LedgerQuery, LedgerResult, LedgerStore,
    MeterStore, ReferenceStore, Registry, RelationStore, UnitOfWork, UnlinkOutcome,
};

const BILLING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tariffs (
    tariff_id INTEGER PRIMARY KEY,
    voltage_type TEXT NOT NULL,
    cost_per_kwh TEXT NOT NULL,
    fixed_fee TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stations (
    station_id INTEGER PRIMARY KEY,
    station_name TEXT NOT NULL UNIQUE,
    water_source_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS technologies (
    technology_id INTEGER PRIMARY KEY,
    technology_name TEXT NOT NULL UNIQUE,
    power_per_water TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meters (
    account_number TEXT PRIMARY KEY,
    meter_id TEXT NOT NULL UNIQUE,
    meter_factor INTEGER NOT NULL,
    final_reading TEXT NOT NULL,
    tariff_id INTEGER NOT NULL REFERENCES tariffs(tariff_id)
);
CREATE TABLE IF NOT EXISTS relations (
    station_id INTEGER NOT NULL REFERENCES stations(station_id),
    technology_id INTEGER NOT NULL REFERENCES technologies(technology_id),
    account_number TEXT NOT NULL REFERENCES meters(account_number),
    active INTEGER NOT NULL,
    PRIMARY KEY (station_id, technology_id, account_number)
);
CREATE INDEX IF NOT EXISTS relations_idx_account ON relations(account_number, active);
CREATE TABLE IF NOT EXISTS chemical_references (
    technology_id INTEGER NOT NULL REFERENCES technologies(technology_id),
    water_source_id INTEGER NOT NULL,
    season TEXT NOT NULL,
    chlorine_from TEXT NOT NULL,
    chlorine_to TEXT NOT NULL,
    solid_alum_from TEXT,
    solid_alum_to TEXT,
    liquid_alum_from TEXT,
    liquid_alum_to TEXT,
    PRIMARY KEY (technology_id, water_source_id, season)
);
CREATE TABLE IF NOT EXISTS bills (
    bill_id TEXT NOT NULL UNIQUE,
    account_number TEXT NOT NULL REFERENCES meters(account_number),
    bill_month INTEGER NOT NULL,
    bill_year INTEGER NOT NULL,
    prev_reading TEXT NOT NULL,
    current_reading TEXT NOT NULL,
    reading_factor INTEGER NOT NULL,
    power_consump TEXT NOT NULL,
    tariff_id INTEGER NOT NULL REFERENCES tariffs(tariff_id),
    tariff_cost TEXT NOT NULL,
    fixed_fee TEXT NOT NULL,
    consump_cost TEXT NOT NULL,
    fixed_installment TEXT NOT NULL,
    settlements TEXT NOT NULL,
    settlement_qty TEXT NOT NULL,
    stamp TEXT NOT NULL,
    prior_payments TEXT NOT NULL,
    rounding TEXT NOT NULL,
    computed_total TEXT NOT NULL,
    bill_total TEXT NOT NULL,
    is_paid INTEGER NOT NULL,
    notes TEXT,
    delay_month INTEGER,
    delay_year INTEGER,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account_number, bill_month, bill_year)
);
CREATE TABLE IF NOT EXISTS bill_allocations (
    account_number TEXT NOT NULL,
    bill_month INTEGER NOT NULL,
    bill_year INTEGER NOT NULL,
    station_id INTEGER NOT NULL,
    technology_id INTEGER NOT NULL,
    percentage TEXT,
    power TEXT NOT NULL,
    cost TEXT NOT NULL,
    PRIMARY KEY (account_number, bill_month, bill_year, station_id, technology_id),
    FOREIGN KEY (account_number, bill_month, bill_year)
        REFERENCES bills(account_number, bill_month, bill_year) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS bill_allocations_idx_ledger
    ON bill_allocations(station_id, technology_id, bill_year, bill_month);
CREATE TABLE IF NOT EXISTS technology_ledgers (
    station_id INTEGER NOT NULL REFERENCES stations(station_id),
    technology_id INTEGER NOT NULL REFERENCES technologies(technology_id),
    bill_month INTEGER NOT NULL,
    bill_year INTEGER NOT NULL,
    percentage TEXT,
    power TEXT NOT NULL,
    bill_total TEXT NOT NULL,
    water_amount TEXT,
    chlorine TEXT,
    solid_alum TEXT,
    liquid_alum TEXT,
    power_per_water TEXT,
    chlorine_from TEXT,
    chlorine_to TEXT,
    solid_alum_from TEXT,
    solid_alum_to TEXT,
    liquid_alum_from TEXT,
    liquid_alum_to TEXT,
    PRIMARY KEY (station_id, technology_id, bill_month, bill_year)
);
"#;

const BILL_COLUMNS: &str = "bill_id, account_number, bill_month, bill_year, prev_reading,
    current_reading, reading_factor, power_consump, tariff_id, tariff_cost, fixed_fee,
    consump_cost, fixed_installment, settlements, settlement_qty, stamp, prior_payments,
    rounding, computed_total, bill_total, is_paid, notes, delay_month, delay_year, created_at";

const LEDGER_COLUMNS: &str = "station_id, technology_id, bill_month, bill_year, percentage,
    power, bill_total, water_amount, chlorine, solid_alum, liquid_alum, power_per_water,
    chlorine_from, chlorine_to, solid_alum_from, solid_alum_to, liquid_alum_from,
    liquid_alum_to";

const ALLOCATION_COLUMNS: &str =
    "account_number, bill_month, bill_year, station_id, technology_id, percentage, power, cost";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed billing repository.
#[derive(Clone, Debug)]
pub struct SqliteBillingRepository {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBillingRepository {
    pub fn new(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open the database, waiting up to `busy_timeout` for competing writers.
    pub fn with_busy_timeout(path: impl Into<PathBuf>, busy_timeout: Duration) -> LedgerResult<Self> {
        let repo = Self {
            path: path.into(),
            busy_timeout,
        };
        repo.initialize_schema()?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize_schema(&self) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(BILLING_SCHEMA)?;
        Ok(())
    }

    fn connect(&self) -> LedgerResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    fn run<T, E, F>(&self, behavior: TransactionBehavior, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn UnitOfWork) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(LedgerError::from)?;
        let unit = SqliteUnit { conn: &tx };
        match work(&unit) {
            Ok(value) => {
                tx.commit().map_err(LedgerError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "failed to roll back billing transaction");
                }
                Err(err)
            }
        }
    }
}

impl BillingRepository for SqliteBillingRepository {
    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn UnitOfWork) -> Result<T, E>,
        E: From<LedgerError>,
    {
        self.run(TransactionBehavior::Immediate, work)
    }

    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn UnitOfWork) -> Result<T, E>,
        E: From<LedgerError>,
    {
        self.run(TransactionBehavior::Deferred, work)
    }

    fn query_ledgers(&self, query: &LedgerQuery) -> LedgerResult<Vec<TechnologyLedger>> {
        let conn = self.connect()?;
        let mut sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM technology_ledgers
             WHERE (?1 IS NULL OR bill_month = ?1)
               AND (?2 IS NULL OR bill_year = ?2)
               AND (?3 IS NULL OR station_id = ?3)
               AND (?4 IS NULL OR technology_id = ?4)"
        );
        sql.push_str(if query.ascending {
            " ORDER BY bill_year ASC, bill_month ASC, station_id ASC, technology_id ASC"
        } else {
            " ORDER BY bill_year DESC, bill_month DESC, station_id ASC, technology_id ASC"
        });
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?5");
        }

        let mut params: Vec<Value> = Vec::with_capacity(5);
        params.push(optional_int(query.period.map(|p| i64::from(p.month))));
        params.push(optional_int(query.period.map(|p| i64::from(p.year))));
        params.push(optional_int(query.station.map(StationId::get)));
        params.push(optional_int(query.technology.map(TechnologyId::get)));
        if let Some(limit) = query.limit {
            params.push(Value::Integer(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut ledgers = Vec::new();
        while let Some(row) = rows.next()? {
            ledgers.push(row_to_ledger(row)?);
        }
        Ok(ledgers)
    }
}

/// Stores bound to one open SQLite transaction.
struct SqliteUnit<'a> {
    conn: &'a Connection,
}

impl MeterStore for SqliteUnit<'_> {
    fn meter(&self, account: &AccountNumber) -> LedgerResult<Option<Meter>> {
        let mut stmt = self.conn.prepare(
            "SELECT account_number, meter_id, meter_factor, final_reading, tariff_id
             FROM meters WHERE account_number = ?1",
        )?;
        let mut rows = stmt.query(params![account.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_meter(row)?)),
            None => Ok(None),
        }
    }

    fn tariff(&self, id: TariffId) -> LedgerResult<Option<Tariff>> {
        let mut stmt = self.conn.prepare(
            "SELECT tariff_id, voltage_type, cost_per_kwh, fixed_fee
             FROM tariffs WHERE tariff_id = ?1",
        )?;
        let mut rows = stmt.query(params![id.get()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Tariff {
                id: TariffId(row.get(0)?),
                voltage_type: row.get(1)?,
                cost_per_kwh: decimal_column(row, 2)?,
                fixed_fee: decimal_column(row, 3)?,
            })),
            None => Ok(None),
        }
    }

    fn set_final_reading(&self, account: &AccountNumber, reading: Decimal) -> LedgerResult<()> {
        let updated = self.conn.execute(
            "UPDATE meters SET final_reading = ?1 WHERE account_number = ?2",
            params![decimal_text(reading), account.as_str()],
        )?;
        if updated == 0 {
            return Err(LedgerError::InvalidState(format!(
                "meter {account} does not exist"
            )));
        }
        Ok(())
    }
}

impl RelationStore for SqliteUnit<'_> {
    fn active_relations(&self, account: &AccountNumber) -> LedgerResult<Vec<Relation>> {
        let mut stmt = self.conn.prepare(
            "SELECT station_id, technology_id, account_number, active FROM relations
             WHERE account_number = ?1 AND active = 1
             ORDER BY station_id, technology_id",
        )?;
        let relations = collect_relations(stmt.query(params![account.as_str()])?)?;
        Ok(relations)
    }

    fn active_relations_for(
        &self,
        station: StationId,
        technology: TechnologyId,
    ) -> LedgerResult<Vec<Relation>> {
        let mut stmt = self.conn.prepare(
            "SELECT station_id, technology_id, account_number, active FROM relations
             WHERE station_id = ?1 AND technology_id = ?2 AND active = 1
             ORDER BY account_number",
        )?;
        let relations = collect_relations(stmt.query(params![station.get(), technology.get()])?)?;
        Ok(relations)
    }
}

impl BillStore for SqliteUnit<'_> {
    fn insert_bill(&self, bill: &Bill) -> LedgerResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO bills ({BILL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                 ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
            ),
            params![
                bill.id.to_string(),
                bill.account.as_str(),
                bill.period.month,
                bill.period.year,
                decimal_text(bill.previous_reading),
                decimal_text(bill.current_reading),
                bill.reading_factor,
                decimal_text(bill.power_consumption),
                bill.tariff_id.get(),
                decimal_text(bill.tariff_cost),
                decimal_text(bill.fixed_fee),
                decimal_text(bill.consumption_cost),
                decimal_text(bill.items.fixed_installment),
                decimal_text(bill.items.settlements),
                decimal_text(bill.items.settlement_qty),
                decimal_text(bill.items.stamp),
                decimal_text(bill.items.prior_payments),
                decimal_text(bill.items.rounding),
                decimal_text(bill.computed_total),
                decimal_text(bill.bill_total),
                bill.is_paid,
                bill.notes,
                bill.delay.map(|p| p.month),
                bill.delay.map(|p| p.year),
                bill.created_at.to_rfc3339(),
            ],
        )?;
        debug!(account = %bill.account, period = %bill.period, "bill row inserted");
        Ok(())
    }

    fn bill(&self, account: &AccountNumber, period: Period) -> LedgerResult<Option<Bill>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BILL_COLUMNS} FROM bills
             WHERE account_number = ?1 AND bill_month = ?2 AND bill_year = ?3"
        ))?;
        let mut rows = stmt.query(params![account.as_str(), period.month, period.year])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_bill(row)?)),
            None => Ok(None),
        }
    }

    fn latest_bill(&self, account: &AccountNumber) -> LedgerResult<Option<Bill>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BILL_COLUMNS} FROM bills WHERE account_number = ?1
             ORDER BY bill_year DESC, bill_month DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![account.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_bill(row)?)),
            None => Ok(None),
        }
    }

    fn delete_bill(&self, account: &AccountNumber, period: Period) -> LedgerResult<bool> {
        self.conn.execute(
            "DELETE FROM bill_allocations
             WHERE account_number = ?1 AND bill_month = ?2 AND bill_year = ?3",
            params![account.as_str(), period.month, period.year],
        )?;
        let deleted = self.conn.execute(
            "DELETE FROM bills WHERE account_number = ?1 AND bill_month = ?2 AND bill_year = ?3",
            params![account.as_str(), period.month, period.year],
        )?;
        Ok(deleted > 0)
    }

    fn insert_allocation(&self, allocation: &BillAllocation) -> LedgerResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO bill_allocations ({ALLOCATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                allocation.account.as_str(),
                allocation.period.month,
                allocation.period.year,
                allocation.station.get(),
                allocation.technology.get(),
                allocation.percentage.map(decimal_text),
                decimal_text(allocation.power),
                decimal_text(allocation.cost),
            ],
        )?;
        Ok(())
    }

    fn update_allocation(&self, allocation: &BillAllocation) -> LedgerResult<()> {
        let updated = self.conn.execute(
            "UPDATE bill_allocations SET percentage = ?1, power = ?2, cost = ?3
             WHERE account_number = ?4 AND bill_month = ?5 AND bill_year = ?6
               AND station_id = ?7 AND technology_id = ?8",
            params![
                allocation.percentage.map(decimal_text),
                decimal_text(allocation.power),
                decimal_text(allocation.cost),
                allocation.account.as_str(),
                allocation.period.month,
                allocation.period.year,
                allocation.station.get(),
                allocation.technology.get(),
            ],
        )?;
        if updated == 0 {
            return Err(LedgerError::InvalidState(format!(
                "no allocation of bill {} {} to station {} technology {}",
                allocation.account, allocation.period, allocation.station, allocation.technology
            )));
        }
        Ok(())
    }

    fn allocations_for_bill(
        &self,
        account: &AccountNumber,
        period: Period,
    ) -> LedgerResult<Vec<BillAllocation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM bill_allocations
             WHERE account_number = ?1 AND bill_month = ?2 AND bill_year = ?3
             ORDER BY station_id, technology_id"
        ))?;
        let mut rows = stmt.query(params![account.as_str(), period.month, period.year])?;
        let mut allocations = Vec::new();
        while let Some(row) = rows.next()? {
            allocations.push(row_to_allocation(row)?);
        }
        Ok(allocations)
    }

    fn allocations_for_ledger(&self, key: &LedgerKey) -> LedgerResult<Vec<BillAllocation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM bill_allocations
             WHERE station_id = ?1 AND technology_id = ?2 AND bill_month = ?3 AND bill_year = ?4
             ORDER BY account_number"
        ))?;
        let mut rows = stmt.query(params![
            key.station.get(),
            key.technology.get(),
            key.period.month,
            key.period.year
        ])?;
        let mut allocations = Vec::new();
        while let Some(row) = rows.next()? {
            allocations.push(row_to_allocation(row)?);
        }
        Ok(allocations)
    }
}

impl LedgerStore for SqliteUnit<'_> {
    fn ledger(&self, key: &LedgerKey) -> LedgerResult<Option<TechnologyLedger>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM technology_ledgers
             WHERE station_id = ?1 AND technology_id = ?2 AND bill_month = ?3 AND bill_year = ?4"
        ))?;
        let mut rows = stmt.query(params![
            key.station.get(),
            key.technology.get(),
            key.period.month,
            key.period.year
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_ledger(row)?)),
            None => Ok(None),
        }
    }

    fn upsert_ledger(&self, ledger: &TechnologyLedger) -> LedgerResult<()> {
        let (chlorine_from, chlorine_to) = range_columns(ledger.ranges.chlorine);
        let (solid_from, solid_to) = range_columns(ledger.ranges.solid_alum);
        let (liquid_from, liquid_to) = range_columns(ledger.ranges.liquid_alum);
        self.conn.execute(
            &format!(
                "INSERT INTO technology_ledgers ({LEDGER_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18)
                 ON CONFLICT (station_id, technology_id, bill_month, bill_year) DO UPDATE SET
                    percentage = excluded.percentage,
                    power = excluded.power,
                    bill_total = excluded.bill_total,
                    water_amount = excluded.water_amount,
                    chlorine = excluded.chlorine,
                    solid_alum = excluded.solid_alum,
                    liquid_alum = excluded.liquid_alum,
                    power_per_water = excluded.power_per_water,
                    chlorine_from = excluded.chlorine_from,
                    chlorine_to = excluded.chlorine_to,
                    solid_alum_from = excluded.solid_alum_from,
                    solid_alum_to = excluded.solid_alum_to,
                    liquid_alum_from = excluded.liquid_alum_from,
                    liquid_alum_to = excluded.liquid_alum_to"
            ),
            params![
                ledger.key.station.get(),
                ledger.key.technology.get(),
                ledger.key.period.month,
                ledger.key.period.year,
                ledger.allocation.percentage().map(decimal_text),
                decimal_text(ledger.power),
                decimal_text(ledger.bill_total),
                ledger.water_amount.map(decimal_text),
                ledger.chemicals.chlorine.map(decimal_text),
                ledger.chemicals.solid_alum.map(decimal_text),
                ledger.chemicals.liquid_alum.map(decimal_text),
                ledger.power_per_water.map(decimal_text),
                chlorine_from,
                chlorine_to,
                solid_from,
                solid_to,
                liquid_from,
                liquid_to,
            ],
        )?;
        Ok(())
    }

    fn delete_ledger(&self, key: &LedgerKey) -> LedgerResult<()> {
        self.conn.execute(
            "DELETE FROM technology_ledgers
             WHERE station_id = ?1 AND technology_id = ?2 AND bill_month = ?3 AND bill_year = ?4",
            params![
                key.station.get(),
                key.technology.get(),
                key.period.month,
                key.period.year
            ],
        )?;
        Ok(())
    }
}

impl ReferenceStore for SqliteUnit<'_> {
    fn station(&self, id: StationId) -> LedgerResult<Option<Station>> {
        let mut stmt = self.conn.prepare(
            "SELECT station_id, station_name, water_source_id FROM stations WHERE station_id = ?1",
        )?;
        let mut rows = stmt.query(params![id.get()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Station {
                id: StationId(row.get(0)?),
                name: row.get(1)?,
                water_source: WaterSourceId(row.get(2)?),
            })),
            None => Ok(None),
        }
    }

    fn technology(&self, id: TechnologyId) -> LedgerResult<Option<Technology>> {
        let mut stmt = self.conn.prepare(
            "SELECT technology_id, technology_name, power_per_water
             FROM technologies WHERE technology_id = ?1",
        )?;
        let mut rows = stmt.query(params![id.get()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Technology {
                id: TechnologyId(row.get(0)?),
                name: row.get(1)?,
                power_per_water: decimal_column(row, 2)?,
            })),
            None => Ok(None),
        }
    }

    fn chemical_reference(
        &self,
        technology: TechnologyId,
        water_source: WaterSourceId,
        season: Season,
    ) -> LedgerResult<Option<ChemicalReference>> {
        let mut stmt = self.conn.prepare(
            "SELECT technology_id, water_source_id, season, chlorine_from, chlorine_to,
                    solid_alum_from, solid_alum_to, liquid_alum_from, liquid_alum_to
             FROM chemical_references
             WHERE technology_id = ?1 AND water_source_id = ?2 AND season = ?3",
        )?;
        let mut rows = stmt.query(params![technology.get(), water_source.get(), season.as_str()])?;
        match rows.next()? {
            Some(row) => {
                let season: String = row.get(2)?;
                let chlorine = range_from_columns(row, 3, 4)?.ok_or_else(|| {
                    LedgerError::Serialization("chemical reference without chlorine range".into())
                })?;
                Ok(Some(ChemicalReference {
                    technology: TechnologyId(row.get(0)?),
                    water_source: WaterSourceId(row.get(1)?),
                    season: Season::from_str(&season).map_err(LedgerError::Serialization)?,
                    chlorine,
                    solid_alum: range_from_columns(row, 5, 6)?,
                    liquid_alum: range_from_columns(row, 7, 8)?,
                }))
            }
            None => Ok(None),
        }
    }
}

impl Registry for SqliteBillingRepository {
    fn add_tariff(&self, tariff: &Tariff) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO tariffs (tariff_id, voltage_type, cost_per_kwh, fixed_fee)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tariff.id.get(),
                tariff.voltage_type,
                decimal_text(tariff.cost_per_kwh),
                decimal_text(tariff.fixed_fee)
            ],
        )?;
        Ok(())
    }

    fn add_station(&self, station: &Station) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO stations (station_id, station_name, water_source_id) VALUES (?1, ?2, ?3)",
            params![station.id.get(), station.name, station.water_source.get()],
        )?;
        Ok(())
    }

    fn add_technology(&self, technology: &Technology) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO technologies (technology_id, technology_name, power_per_water)
             VALUES (?1, ?2, ?3)",
            params![
                technology.id.get(),
                technology.name,
                decimal_text(technology.power_per_water)
            ],
        )?;
        Ok(())
    }

    fn add_meter(&self, meter: &Meter) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO meters (account_number, meter_id, meter_factor, final_reading, tariff_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                meter.account.as_str(),
                meter.meter_id,
                meter.factor,
                decimal_text(meter.final_reading),
                meter.tariff_id.get()
            ],
        )?;
        Ok(())
    }

    fn add_chemical_reference(&self, reference: &ChemicalReference) -> LedgerResult<()> {
        let conn = self.connect()?;
        let (solid_from, solid_to) = range_columns(reference.solid_alum);
        let (liquid_from, liquid_to) = range_columns(reference.liquid_alum);
        conn.execute(
            "INSERT INTO chemical_references (technology_id, water_source_id, season,
                chlorine_from, chlorine_to, solid_alum_from, solid_alum_to,
                liquid_alum_from, liquid_alum_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                reference.technology.get(),
                reference.water_source.get(),
                reference.season.as_str(),
                decimal_text(reference.chlorine.from),
                decimal_text(reference.chlorine.to),
                solid_from,
                solid_to,
                liquid_from,
                liquid_to
            ],
        )?;
        Ok(())
    }

    fn link(
        &self,
        station: StationId,
        technology: TechnologyId,
        account: &AccountNumber,
    ) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO relations (station_id, technology_id, account_number, active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (station_id, technology_id, account_number) DO UPDATE SET active = 1",
            params![station.get(), technology.get(), account.as_str()],
        )?;
        Ok(())
    }

    fn unlink(
        &self,
        station: StationId,
        technology: TechnologyId,
        account: &AccountNumber,
    ) -> LedgerResult<UnlinkOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM bill_allocations
             WHERE station_id = ?1 AND technology_id = ?2 AND account_number = ?3",
            params![station.get(), technology.get(), account.as_str()],
            |row| row.get(0),
        )?;
        let outcome = if referenced > 0 {
            let updated = tx.execute(
                "UPDATE relations SET active = 0
                 WHERE station_id = ?1 AND technology_id = ?2 AND account_number = ?3",
                params![station.get(), technology.get(), account.as_str()],
            )?;
            if updated > 0 {
                UnlinkOutcome::Deactivated
            } else {
                UnlinkOutcome::Missing
            }
        } else {
            let deleted = tx.execute(
                "DELETE FROM relations
                 WHERE station_id = ?1 AND technology_id = ?2 AND account_number = ?3",
                params![station.get(), technology.get(), account.as_str()],
            )?;
            if deleted > 0 {
                UnlinkOutcome::Removed
            } else {
                UnlinkOutcome::Missing
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn set_final_reading(&self, account: &AccountNumber, reading: Decimal) -> LedgerResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let bills: i64 = tx.query_row(
            "SELECT COUNT(*) FROM bills WHERE account_number = ?1",
            params![account.as_str()],
            |row| row.get(0),
        )?;
        if bills > 0 {
            return Err(LedgerError::InvalidState(format!(
                "meter {account} has {bills} bill(s); its reading only moves through billing"
            )));
        }
        SqliteUnit { conn: &tx }.set_final_reading(account, reading)?;
        tx.commit()?;
        Ok(())
    }

    fn relations(&self, account: &AccountNumber) -> LedgerResult<Vec<Relation>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT station_id, technology_id, account_number, active FROM relations
             WHERE account_number = ?1 ORDER BY station_id, technology_id",
        )?;
        let relations = collect_relations(stmt.query(params![account.as_str()])?)?;
        Ok(relations)
    }
}

fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn parse_decimal(raw: &str) -> LedgerResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|err| LedgerError::Serialization(format!("invalid decimal {raw}: {err}")))
}

fn decimal_column(row: &Row<'_>, idx: usize) -> LedgerResult<Decimal> {
    let raw: String = row.get(idx)?;
    parse_decimal(&raw)
}

fn optional_decimal_column(row: &Row<'_>, idx: usize) -> LedgerResult<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref().map(parse_decimal).transpose()
}

fn optional_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

fn range_columns(range: Option<DoseRange>) -> (Option<String>, Option<String>) {
    match range {
        Some(range) => (Some(decimal_text(range.from)), Some(decimal_text(range.to))),
        None => (None, None),
    }
}

fn range_from_columns(row: &Row<'_>, from: usize, to: usize) -> LedgerResult<Option<DoseRange>> {
    match (
        optional_decimal_column(row, from)?,
        optional_decimal_column(row, to)?,
    ) {
        (Some(from), Some(to)) => Ok(Some(DoseRange::new(from, to))),
        _ => Ok(None),
    }
}

fn period_columns(row: &Row<'_>, month: usize, year: usize) -> LedgerResult<Period> {
    let month: u32 = row.get(month)?;
    let year: i32 = row.get(year)?;
    Period::new(month, year).map_err(|err| LedgerError::Serialization(err.to_string()))
}

fn collect_relations(mut rows: rusqlite::Rows<'_>) -> LedgerResult<Vec<Relation>> {
    let mut relations = Vec::new();
    while let Some(row) = rows.next()? {
        let account: String = row.get(2)?;
        relations.push(Relation {
            station: StationId(row.get(0)?),
            technology: TechnologyId(row.get(1)?),
            account: AccountNumber::from(account),
            active: row.get(3)?,
        });
    }
    Ok(relations)
}

fn row_to_meter(row: &Row<'_>) -> LedgerResult<Meter> {
    let account: String = row.get(0)?;
    Ok(Meter {
        account: AccountNumber::from(account),
        meter_id: row.get(1)?,
        factor: row.get(2)?,
        final_reading: decimal_column(row, 3)?,
        tariff_id: TariffId(row.get(4)?),
    })
}

fn row_to_bill(row: &Row<'_>) -> LedgerResult<Bill> {
    let bill_id: String = row.get(0)?;
    let account: String = row.get(1)?;
    let delay_month: Option<u32> = row.get(22)?;
    let delay_year: Option<i32> = row.get(23)?;
    let created_at: String = row.get(24)?;

    let delay = match (delay_month, delay_year) {
        (Some(month), Some(year)) => Some(
            Period::new(month, year).map_err(|err| LedgerError::Serialization(err.to_string()))?,
        ),
        _ => None,
    };
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|err| LedgerError::Serialization(format!("invalid timestamp {created_at}: {err}")))?
        .with_timezone(&Utc);

    Ok(Bill {
        id: Uuid::parse_str(&bill_id)
            .map_err(|err| LedgerError::Serialization(format!("invalid bill id {bill_id}: {err}")))?,
        account: AccountNumber::from(account),
        period: period_columns(row, 2, 3)?,
        previous_reading: decimal_column(row, 4)?,
        current_reading: decimal_column(row, 5)?,
        reading_factor: row.get(6)?,
        power_consumption: decimal_column(row, 7)?,
        tariff_id: TariffId(row.get(8)?),
        tariff_cost: decimal_column(row, 9)?,
        fixed_fee: decimal_column(row, 10)?,
        consumption_cost: decimal_column(row, 11)?,
        items: MonetaryItems {
            fixed_installment: decimal_column(row, 12)?,
            settlements: decimal_column(row, 13)?,
            settlement_qty: decimal_column(row, 14)?,
            stamp: decimal_column(row, 15)?,
            prior_payments: decimal_column(row, 16)?,
            rounding: decimal_column(row, 17)?,
        },
        computed_total: decimal_column(row, 18)?,
        bill_total: decimal_column(row, 19)?,
        is_paid: row.get(20)?,
        notes: row.get(21)?,
        delay,
        created_at,
    })
}

fn row_to_allocation(row: &Row<'_>) -> LedgerResult<BillAllocation> {
    let account: String = row.get(0)?;
    Ok(BillAllocation {
        account: AccountNumber::from(account),
        period: period_columns(row, 1, 2)?,
        station: StationId(row.get(3)?),
        technology: TechnologyId(row.get(4)?),
        percentage: optional_decimal_column(row, 5)?,
        power: decimal_column(row, 6)?,
        cost: decimal_column(row, 7)?,
    })
}

fn row_to_ledger(row: &Row<'_>) -> LedgerResult<TechnologyLedger> {
    let key = LedgerKey::new(
        StationId(row.get(0)?),
        TechnologyId(row.get(1)?),
        period_columns(row, 2, 3)?,
    );
    let allocation = match optional_decimal_column(row, 4)? {
        Some(percentage) => Allocation::Normalized { percentage },
        None => Allocation::Unsplit,
    };
    Ok(TechnologyLedger {
        key,
        allocation,
        power: decimal_column(row, 5)?,
        bill_total: decimal_column(row, 6)?,
        water_amount: optional_decimal_column(row, 7)?,
        chemicals: ChemicalReadings {
            chlorine: optional_decimal_column(row, 8)?,
            solid_alum: optional_decimal_column(row, 9)?,
            liquid_alum: optional_decimal_column(row, 10)?,
        },
        power_per_water: optional_decimal_column(row, 11)?,
        ranges: ReferenceRanges {
            chlorine: range_from_columns(row, 12, 13)?,
            solid_alum: range_from_columns(row, 14, 15)?,
            liquid_alum: range_from_columns(row, 16, 17)?,
        },
    })
}
