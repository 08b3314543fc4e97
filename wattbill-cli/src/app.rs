use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use wattbill_billing::{BillingService, BillingSettings, SeasonCalendar, VolumeEntry};
use wattbill_config::{load_config, AppConfig};
use wattbill_core::{
    AccountNumber, ChemicalReadings, Period, ReadingSubmission, StationId, TechnologyId,
};
use wattbill_events::{EventBus, EventStream};
use wattbill_ledger::{LedgerQuery, Registry, SqliteBillingRepository};

use crate::seed::SeedFile;
use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Utility billing and technology ledger allocation")]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Environment overlay to load on top of default.toml
    #[arg(long, global = true)]
    env: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database schema
    Init,
    /// Print the effective configuration
    Config,
    /// Load tariffs, stations, technologies, meters, relations and chemical references
    Seed { file: PathBuf },
    /// Meter bills
    Bill {
        #[command(subcommand)]
        action: BillCommand,
    },
    /// Monthly treated volume and chemical readings
    Volume {
        #[command(subcommand)]
        action: VolumeCommand,
    },
    /// Technology ledgers
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
    /// Meter to station/technology links
    Relation {
        #[command(subcommand)]
        action: RelationCommand,
    },
}

#[derive(Subcommand)]
pub enum BillCommand {
    /// Submit a reading from a JSON file (`-` reads stdin)
    Submit { file: PathBuf },
    /// Delete a meter's latest bill and roll back its effects
    Delete(BillArgs),
    /// Show a bill and its ledger allocations
    Show(BillArgs),
}

#[derive(Args)]
pub struct BillArgs {
    #[arg(long)]
    account: AccountNumber,
    #[command(flatten)]
    period: PeriodArgs,
}

#[derive(Args)]
pub struct PeriodArgs {
    #[arg(long)]
    month: u32,
    #[arg(long)]
    year: i32,
}

impl PeriodArgs {
    fn period(&self) -> Result<Period> {
        Ok(Period::new(self.month, self.year)?)
    }
}

#[derive(Subcommand)]
pub enum VolumeCommand {
    /// Record treated volume and chemical readings for one ledger
    Record(VolumeArgs),
}

#[derive(Args)]
pub struct VolumeArgs {
    #[arg(long)]
    station: StationId,
    #[arg(long)]
    technology: TechnologyId,
    #[command(flatten)]
    period: PeriodArgs,
    #[arg(long)]
    volume: Decimal,
    #[arg(long)]
    chlorine: Option<Decimal>,
    #[arg(long)]
    solid_alum: Option<Decimal>,
    #[arg(long)]
    liquid_alum: Option<Decimal>,
}

#[derive(Subcommand)]
pub enum LedgerCommand {
    /// List ledgers, oldest period first
    List {
        #[arg(long, requires = "year")]
        month: Option<u32>,
        #[arg(long, requires = "month")]
        year: Option<i32>,
        #[arg(long)]
        station: Option<StationId>,
        #[arg(long)]
        technology: Option<TechnologyId>,
        #[arg(long)]
        limit: Option<usize>,
        /// Newest period first
        #[arg(long)]
        desc: bool,
    },
}

#[derive(Subcommand)]
pub enum RelationCommand {
    /// Link a meter to a station/technology pair (reactivates an existing link)
    Link(RelationArgs),
    /// Remove a link; links referenced by bills are deactivated instead
    Unlink(RelationArgs),
    /// Show every link of a meter
    List {
        #[arg(long)]
        account: AccountNumber,
    },
}

#[derive(Args)]
pub struct RelationArgs {
    #[arg(long)]
    station: StationId,
    #[arg(long)]
    technology: TechnologyId,
    #[arg(long)]
    account: AccountNumber,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config_dir.as_deref(), cli.env.as_deref())?;
    let _guard = init_tracing(&config.logging)?;

    if let Command::Config = cli.command {
        print!("{}", config.render()?);
        return Ok(());
    }

    let repo = open_repository(&config)?;
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();
    let service = BillingService::new(repo, settings(&config)).with_events(bus);

    let outcome = dispatch(&service, cli.command);
    log_events(&mut events);
    outcome
}

fn dispatch(service: &BillingService<SqliteBillingRepository>, command: Command) -> Result<()> {
    match command {
        Command::Init => print_json(&json!({ "database": service.repository().path() })),
        Command::Config => Ok(()),
        Command::Seed { file } => {
            let summary = SeedFile::load(&file)?.apply(service.repository())?;
            print_json(&summary)
        }
        Command::Bill { action } => match action {
            BillCommand::Submit { file } => {
                let submission = read_submission(&file)?;
                print_json(&service.submit_bill(submission)?)
            }
            BillCommand::Delete(args) => {
                let period = args.period.period()?;
                print_json(&service.delete_bill(&args.account, period)?)
            }
            BillCommand::Show(args) => {
                let period = args.period.period()?;
                let bill = service
                    .bill(&args.account, period)?
                    .ok_or_else(|| anyhow!("no bill for meter {} in {period}", args.account))?;
                let allocations = service.allocations(&args.account, period)?;
                print_json(&json!({ "bill": bill, "allocations": allocations }))
            }
        },
        Command::Volume {
            action: VolumeCommand::Record(args),
        } => {
            let entry = VolumeEntry {
                station: args.station,
                technology: args.technology,
                period: args.period.period()?,
                volume: args.volume,
                chemicals: ChemicalReadings {
                    chlorine: args.chlorine,
                    solid_alum: args.solid_alum,
                    liquid_alum: args.liquid_alum,
                },
            };
            print_json(&service.record_volume(entry)?)
        }
        Command::Ledger {
            action:
                LedgerCommand::List {
                    month,
                    year,
                    station,
                    technology,
                    limit,
                    desc,
                },
        } => {
            let mut query = LedgerQuery::default();
            if let (Some(month), Some(year)) = (month, year) {
                query = query.with_period(Period::new(month, year)?);
            }
            if let Some(station) = station {
                query = query.with_station(station);
            }
            if let Some(technology) = technology {
                query = query.with_technology(technology);
            }
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }
            if desc {
                query = query.descending();
            }
            print_json(&service.ledgers(&query)?)
        }
        Command::Relation { action } => {
            let registry = service.repository();
            match action {
                RelationCommand::Link(args) => {
                    registry.link(args.station, args.technology, &args.account)?;
                    print_json(&json!({ "linked": true }))
                }
                RelationCommand::Unlink(args) => {
                    let outcome = registry.unlink(args.station, args.technology, &args.account)?;
                    print_json(&json!({ "outcome": format!("{outcome:?}").to_lowercase() }))
                }
                RelationCommand::List { account } => print_json(&registry.relations(&account)?),
            }
        }
    }
}

fn open_repository(config: &AppConfig) -> Result<SqliteBillingRepository> {
    let path = &config.database.path;
    let repo = SqliteBillingRepository::with_busy_timeout(
        path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("failed to open billing database {}", path.display()))?;
    info!(path = %path.display(), "billing database ready");
    Ok(repo)
}

fn settings(config: &AppConfig) -> BillingSettings {
    BillingSettings {
        total_tolerance: config.billing.total_tolerance,
        money_scale: config.billing.money_scale,
        power_scale: config.billing.power_scale,
        calendar: SeasonCalendar::new(config.billing.summer_months.iter().copied()),
    }
}

fn read_submission(path: &Path) -> Result<ReadingSubmission> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read submission from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read submission {}", path.display()))?
    };
    serde_json::from_str(&raw).context("invalid reading submission")
}

fn log_events(stream: &mut EventStream) {
    while let Ok(envelope) = stream.try_recv() {
        info!(
            id = %envelope.id,
            kind = envelope.event.kind(),
            committed_at = %envelope.committed_at,
            "billing event"
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
