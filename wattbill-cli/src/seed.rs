//! Reference-data seeding from a TOML document.
//!
//! ```toml
//! [[tariffs]]
//! id = 1
//! voltage_type = "medium"
//! cost_per_kwh = "2.00"
//! fixed_fee = "5"
//!
//! [[relations]]
//! station = 10
//! technology = 20
//! account = "ACC-1"
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use wattbill_core::{
    AccountNumber, ChemicalReference, Meter, Station, StationId, Tariff, Technology, TechnologyId,
};
use wattbill_ledger::Registry;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub tariffs: Vec<Tariff>,
    pub stations: Vec<Station>,
    pub technologies: Vec<Technology>,
    pub meters: Vec<Meter>,
    pub relations: Vec<SeedRelation>,
    pub chemical_references: Vec<ChemicalReference>,
}

#[derive(Debug, Deserialize)]
pub struct SeedRelation {
    pub station: StationId,
    pub technology: TechnologyId,
    pub account: AccountNumber,
}

/// Row counts written by a seed run.
#[derive(Debug, Default, Serialize)]
pub struct SeedSummary {
    pub tariffs: usize,
    pub stations: usize,
    pub technologies: usize,
    pub meters: usize,
    pub relations: usize,
    pub chemical_references: usize,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid seed file {}", path.display()))
    }

    /// Register every row in dependency order: tariffs, stations and technologies before
    /// the meters and relations that reference them.
    pub fn apply(&self, registry: &impl Registry) -> Result<SeedSummary> {
        for tariff in &self.tariffs {
            registry
                .add_tariff(tariff)
                .with_context(|| format!("failed to add tariff {}", tariff.id))?;
        }
        for station in &self.stations {
            registry
                .add_station(station)
                .with_context(|| format!("failed to add station {}", station.id))?;
        }
        for technology in &self.technologies {
            registry
                .add_technology(technology)
                .with_context(|| format!("failed to add technology {}", technology.id))?;
        }
        for meter in &self.meters {
            if meter.final_reading < Decimal::ZERO {
                bail!("meter {} has a negative reading", meter.account);
            }
            registry
                .add_meter(meter)
                .with_context(|| format!("failed to add meter {}", meter.account))?;
        }
        for relation in &self.relations {
            registry
                .link(relation.station, relation.technology, &relation.account)
                .with_context(|| {
                    format!(
                        "failed to link meter {} to station {} / technology {}",
                        relation.account, relation.station, relation.technology
                    )
                })?;
        }
        for reference in &self.chemical_references {
            registry.add_chemical_reference(reference).with_context(|| {
                format!(
                    "failed to add {} reference for technology {}",
                    reference.season, reference.technology
                )
            })?;
        }
        let summary = SeedSummary {
            tariffs: self.tariffs.len(),
            stations: self.stations.len(),
            technologies: self.technologies.len(),
            meters: self.meters.len(),
            relations: self.relations.len(),
            chemical_references: self.chemical_references.len(),
        };
        info!(?summary, "reference data seeded");
        Ok(summary)
    }
}
