use chrono::{Datelike, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use hoa_ledger::application::billing::BillingEngine;
use hoa_ledger::application::ledger::{ExpenseRequest, IncomeRequest, LedgerService};
use hoa_ledger::application::reservations::{
    BookingChannel, ReservationRequest, ReservationService,
};
use hoa_ledger::config::AppConfig;
use hoa_ledger::domain::asset::Asset;
use hoa_ledger::domain::discount::{Discount, DiscountKind};
use hoa_ledger::domain::money::Amount;
use hoa_ledger::domain::penalty::simple_interest;
use hoa_ledger::domain::ports::Stores;
use hoa_ledger::domain::reservation::{Requester, ReservationId, TimeSlot};
use hoa_ledger::domain::statement::BillingPeriod;
use hoa_ledger::domain::transaction::PaymentType;
use hoa_ledger::domain::{OrgId, UserId};
use hoa_ledger::error::LedgerError;
#[cfg(feature = "storage-rocksdb")]
use hoa_ledger::infrastructure::rocksdb::RocksDBStore;
use hoa_ledger::interfaces::csv::ledger_reader::{LedgerEvent, LedgerEventType, LedgerReader};
use hoa_ledger::interfaces::csv::reservation_reader::{
    ReservationEvent, ReservationEventType, ReservationReader,
};
use hoa_ledger::interfaces::csv::summary_writer::SummaryWriter;
use hoa_ledger::telemetry;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Staff user the CLI records and approves entries as.
const CLI_USER: UserId = 1;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay dues statements, payments and expenses; print each unit's position
    Ledger {
        /// Input events CSV file (type, org, unit, amount, date)
        input: PathBuf,

        /// Date penalties are assessed at. Defaults to the latest event date.
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Replay asset bookings, payments and sweeps; print each reservation
    Reservations {
        /// Input events CSV file (type, org, asset, reservation, start, end, amount, at)
        input: PathBuf,

        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Compute a simple-interest late penalty
    Penalty {
        #[arg(long)]
        principal: Decimal,

        /// Monthly rate in percent (2 means 2% per month)
        #[arg(long)]
        rate: Decimal,

        /// Elapsed months past the grace period
        #[arg(long, allow_negative_numbers = true)]
        months: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().into_diagnostic()?;
    telemetry::init(&config.telemetry).into_diagnostic()?;

    match cli.command {
        Command::Ledger {
            input,
            as_of,
            db_path,
        } => run_ledger(&config, input, as_of, db_path).await,
        Command::Reservations { input, db_path } => run_reservations(&config, input, db_path).await,
        Command::Penalty {
            principal,
            rate,
            months,
        } => {
            let penalty = simple_interest(principal, rate / Decimal::ONE_HUNDRED, months).into_diagnostic()?;
            println!("{penalty:.2}");
            Ok(())
        }
    }
}

fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => Ok(RocksDBStore::open(path).into_diagnostic()?.into_stores()),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            warn!(
                "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
            );
            Ok(Stores::in_memory())
        }
        None => Ok(Stores::in_memory()),
    }
}

async fn run_ledger(
    config: &AppConfig,
    input: PathBuf,
    as_of: Option<NaiveDate>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let ledger = Arc::new(LedgerService::new(open_stores(db_path)?));
    let billing = BillingEngine::new(ledger.clone());

    let mut orgs: BTreeSet<OrgId> = BTreeSet::new();
    let mut latest: Option<NaiveDate> = None;

    let file = File::open(input).into_diagnostic()?;
    for (index, row) in LedgerReader::new(file).events().enumerate() {
        let row_number = index + 2;
        let event = match row {
            Ok(event) => event,
            Err(e) => {
                warn!(row = row_number, error = %e, "skipping unreadable row");
                continue;
            }
        };
        if orgs.insert(event.org) {
            let policies = &ledger.stores().policies;
            if policies.penalty_policy(event.org).await.into_diagnostic()?.is_none() {
                let policy = config.penalty.policy_for(event.org).into_diagnostic()?;
                policies.put_penalty_policy(policy).await.into_diagnostic()?;
            }
        }
        latest = latest.max(Some(event.date));

        if let Err(e) = apply_ledger_event(&ledger, &billing, &event).await {
            warn!(row = row_number, kind = ?event.r#type, error = %e, "event rejected");
        }
    }

    let as_of = as_of.or(latest).unwrap_or_else(|| Utc::now().date_naive());
    info!(%as_of, orgs = orgs.len(), "writing unit positions");
    let stdout = io::stdout();
    let mut writer = SummaryWriter::new(stdout.lock());
    for org_id in orgs {
        let positions = billing.unit_positions(org_id, as_of).await.into_diagnostic()?;
        writer.write_positions(org_id, &positions).into_diagnostic()?;
    }
    Ok(())
}

async fn apply_ledger_event(
    ledger: &LedgerService,
    billing: &BillingEngine,
    event: &LedgerEvent,
) -> hoa_ledger::error::Result<()> {
    let now = event.date.and_time(NaiveTime::MIN).and_utc();
    match event.r#type {
        LedgerEventType::Statement => {
            let period = BillingPeriod {
                year: event.date.year(),
                month: event.date.month(),
            };
            billing
                .issue_statement(
                    event.org,
                    event.require_unit()?,
                    period,
                    event.amount.value(),
                    event.date,
                    now,
                )
                .await?;
        }
        LedgerEventType::Exact | LedgerEventType::Advance => {
            let payment_type = if event.r#type == LedgerEventType::Exact {
                PaymentType::Exact
            } else {
                PaymentType::Advance
            };
            let mut request = IncomeRequest::dues(
                event.org,
                event.require_unit()?,
                event.amount,
                payment_type,
                event.date,
            );
            request.created_by = Some(CLI_USER);
            request.discount_id = event.discount;
            request.months = event.months.unwrap_or(1);
            if let Some(category) = &event.category {
                request.category = category.clone();
            }
            let (tx, _) = ledger.record_income(request, now).await?;
            ledger.submit_for_approval(tx.id, now).await?;
            ledger.approve(tx.id, CLI_USER, now).await?;
        }
        LedgerEventType::Expense => {
            let request = ExpenseRequest {
                org_id: event.org,
                unit_id: event.unit,
                asset_id: None,
                amount: event.amount,
                category: event.category.clone().unwrap_or_else(|| "General".to_string()),
                description: String::new(),
                transaction_date: event.date,
                requires_receipt: false,
                created_by: Some(CLI_USER),
            };
            let tx = ledger.record_expense(request, now).await?;
            ledger.submit_for_approval(tx.id, now).await?;
            ledger.approve(tx.id, CLI_USER, now).await?;
        }
        LedgerEventType::Discount => {
            let id = event.require_discount()?;
            let discount = Discount::new(
                id,
                event.org,
                format!("Discount {id}"),
                DiscountKind::Percentage,
                event.amount.value(),
                event.months.unwrap_or(1),
                None,
                None,
                event.date,
            )?;
            ledger.stores().policies.put_discount(discount).await?;
            info!(org = event.org, discount = id, "discount configured");
        }
    }
    Ok(())
}

async fn run_reservations(config: &AppConfig, input: PathBuf, db_path: Option<PathBuf>) -> Result<()> {
    let ledger = Arc::new(LedgerService::new(open_stores(db_path)?));
    let service = ReservationService::new(ledger, config.reservations.expiration_hours);
    let mut labels: Vec<(String, ReservationId)> = Vec::new();

    let file = File::open(input).into_diagnostic()?;
    for (index, row) in ReservationReader::new(file).events().enumerate() {
        let row_number = index + 2;
        let event = match row {
            Ok(event) => event,
            Err(e) => {
                warn!(row = row_number, error = %e, "skipping unreadable row");
                continue;
            }
        };
        if let Err(e) = apply_reservation_event(&service, &mut labels, &event).await {
            warn!(row = row_number, kind = ?event.r#type, error = %e, "event rejected");
        }
    }

    let mut reservations = Vec::with_capacity(labels.len());
    for (label, id) in &labels {
        reservations.push((label.as_str(), service.get(*id).await.into_diagnostic()?));
    }
    let stdout = io::stdout();
    let mut writer = SummaryWriter::new(stdout.lock());
    writer
        .write_reservations(reservations.iter().map(|(label, r)| (*label, r)))
        .into_diagnostic()?;
    Ok(())
}

async fn apply_reservation_event(
    service: &ReservationService,
    labels: &mut Vec<(String, ReservationId)>,
    event: &ReservationEvent,
) -> hoa_ledger::error::Result<()> {
    let lookup = |labels: &[(String, ReservationId)]| -> hoa_ledger::error::Result<ReservationId> {
        let label = event.require_label()?;
        labels
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, id)| *id)
            .ok_or_else(|| LedgerError::not_found("Reservation", label))
    };

    match event.r#type {
        ReservationEventType::Asset => {
            let asset_id = event.require_asset()?;
            let mut asset = Asset::new(asset_id, event.org, format!("Asset {asset_id}"));
            if let Some(rate) = event.amount.filter(|rate| *rate > Decimal::ZERO) {
                asset = asset.with_hourly_rate(rate);
            }
            service.register_asset(asset).await?;
        }
        ReservationEventType::Reserve | ReservationEventType::Book => {
            let label = event.require_label()?;
            if labels.iter().any(|(l, _)| l == label) {
                return Err(LedgerError::ValidationError(format!(
                    "reservation label '{label}' is already in use"
                )));
            }
            let (start, end) = event.require_window()?;
            let request = ReservationRequest {
                org_id: event.org,
                asset_id: event.require_asset()?,
                requester: Requester {
                    user_id: CLI_USER,
                    name: label.to_string(),
                    unit_id: None,
                },
                slot: TimeSlot::new(start, end)?,
                purpose: String::new(),
                discount_id: None,
            };
            let channel = if event.r#type == ReservationEventType::Reserve {
                BookingChannel::Homeowner
            } else {
                BookingChannel::Staff
            };
            let reservation = service.create(request, channel, event.at).await?;
            labels.push((label.to_string(), reservation.id));
        }
        ReservationEventType::Pay => {
            let id = lookup(labels.as_slice())?;
            let amount = Amount::new(event.amount.unwrap_or_default())?;
            service.record_payment(id, amount, CLI_USER, None, event.at).await?;
        }
        ReservationEventType::Cancel => {
            service.cancel(lookup(labels.as_slice())?, CLI_USER, "", event.at).await?;
        }
        ReservationEventType::Complete => {
            service.complete(lookup(labels.as_slice())?, event.at).await?;
        }
        ReservationEventType::Sweep => {
            let report = service.sweep_expired(event.at).await?;
            info!(expired = report.expired, failed = report.failed, at = %event.at, "sweep ran");
        }
    }
    Ok(())
}
