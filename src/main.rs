use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use turnstile::application::engine::TicketEngine;
use turnstile::application::redemption::Admission;
use turnstile::config::{DEFAULT_GRACE_MINUTES, DEFAULT_HOLD_MINUTES, EngineConfig};
use turnstile::domain::ids::{ReservationId, TicketId, TierId};
use turnstile::domain::inventory::PriceTier;
use turnstile::domain::payment::PaymentDelivery;
use turnstile::domain::ports::Stores;
use turnstile::domain::redemption::RedemptionOutcome;
use turnstile::domain::ticket::EventWindow;
use turnstile::domain::token::SigningKey;
use turnstile::error::EngineError;
#[cfg(feature = "storage-rocksdb")]
use turnstile::infrastructure::rocksdb::RocksDBStore;
use turnstile::interfaces::csv::delivery_reader::DeliveryReader;
use turnstile::interfaces::csv::outcome_writer::{
    AttemptRow, ConfirmationRow, OutcomeWriter, ReservationRow, ScanRow, SweepRow, TicketRow,
    TierRow,
};
use turnstile::interfaces::csv::scan_reader::ScanReader;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Settings {
    /// Secret used to sign redemption tokens (at least 32 bytes)
    #[arg(long, env = "TURNSTILE_SIGNING_SECRET", hide_env_values = true, global = true)]
    signing_secret: Option<String>,

    /// How long a reservation holds inventory
    #[arg(long, env = "TURNSTILE_HOLD_MINUTES", default_value_t = DEFAULT_HOLD_MINUTES,
          value_parser = clap::value_parser!(i64).range(1..), global = true)]
    hold_minutes: i64,

    /// Slack around an event's entry window when minting tokens
    #[arg(long, env = "TURNSTILE_GRACE_MINUTES", default_value_t = DEFAULT_GRACE_MINUTES,
          value_parser = clap::value_parser!(i64).range(0..), global = true)]
    grace_minutes: i64,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "TURNSTILE_DB_PATH", global = true)]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Register the entry window of an event
    Window {
        event_id: String,
        /// RFC 3339 timestamp, e.g. 2026-06-01T18:00:00Z
        #[arg(long)]
        opens: DateTime<Utc>,
        #[arg(long)]
        closes: DateTime<Utc>,
    },
    /// Create a price tier
    Tier {
        tier_id: String,
        #[arg(long)]
        event: String,
        /// Unit price in minor units
        #[arg(long)]
        price: i64,
        #[arg(long, default_value = "EUR")]
        currency: String,
        #[arg(long)]
        total: u32,
        #[arg(long)]
        limit: u32,
    },
    /// Show a price tier's counters
    Inventory { tier_id: String },
    /// Hold inventory for a buyer
    Reserve {
        tier_id: String,
        #[arg(long, default_value_t = 1)]
        quantity: u32,
        #[arg(long)]
        buyer: String,
    },
    /// Give a held reservation back
    Release { reservation_id: ReservationId },
    /// Lapse every expired hold on a tier
    Sweep { tier_id: String },
    /// Process one payment confirmation
    Confirm {
        #[arg(long)]
        event_id: String,
        #[arg(long)]
        reservation: ReservationId,
        /// Amount in minor units
        #[arg(long)]
        amount: i64,
    },
    /// Process a CSV of webhook deliveries (event_id,reservation_id,amount)
    Webhooks { input: PathBuf },
    /// Finish an admitted payment whose processing was interrupted
    Recover { event_id: String },
    /// Redeem one token
    Redeem {
        token: String,
        #[arg(long)]
        scanner: String,
    },
    /// Process a CSV of scans (token,scanner)
    Scans { input: PathBuf },
    /// Show a ticket's current state
    Ticket { ticket_id: TicketId },
    /// Void an unused ticket
    Void { ticket_id: TicketId },
    /// Issue a fresh token for an unused ticket, superseding older ones
    Rotate { ticket_id: TicketId },
    /// List the redemption attempts of a ticket
    Attempts { ticket_id: TicketId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnstile=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli.settings)?;

    let stdout = io::stdout();
    let mut out = OutcomeWriter::new(stdout.lock());
    run(&engine, cli.command, &mut out).await?;
    out.flush().into_diagnostic()?;

    Ok(())
}

fn build_engine(settings: &Settings) -> Result<TicketEngine> {
    let secret = settings.signing_secret.clone().ok_or_else(|| {
        miette!("A signing secret is required (--signing-secret or TURNSTILE_SIGNING_SECRET)")
    })?;
    let config = EngineConfig::new(SigningKey::new(secret).into_diagnostic()?)
        .with_hold_duration(Duration::minutes(settings.hold_minutes))
        .with_entry_grace(Duration::minutes(settings.grace_minutes));

    let stores = open_stores(settings.db_path.as_deref())?;
    Ok(TicketEngine::with_system_clock(stores, config))
}

fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = RocksDBStore::open(path).into_diagnostic()?;
        return Ok(Stores::shared(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Stores::in_memory())
}

async fn run<W: Write>(
    engine: &TicketEngine,
    command: Command,
    out: &mut OutcomeWriter<W>,
) -> Result<()> {
    match command {
        Command::Window {
            event_id,
            opens,
            closes,
        } => {
            let window = EventWindow::new(event_id, opens, closes).into_diagnostic()?;
            engine
                .register_event_window(window.clone())
                .await
                .into_diagnostic()?;
            out.write(&window).into_diagnostic()?;
        }
        Command::Tier {
            tier_id,
            event,
            price,
            currency,
            total,
            limit,
        } => {
            let tier = PriceTier::new(TierId::from(tier_id), event, price, currency, total, limit)
                .into_diagnostic()?;
            engine.create_tier(tier.clone()).await.into_diagnostic()?;
            out.write(&TierRow::from(&tier)).into_diagnostic()?;
        }
        Command::Inventory { tier_id } => {
            let tier = engine
                .tier(&TierId::from(tier_id))
                .await
                .into_diagnostic()?;
            out.write(&TierRow::from(&tier)).into_diagnostic()?;
        }
        Command::Reserve {
            tier_id,
            quantity,
            buyer,
        } => {
            let reservation = engine
                .reserve(&TierId::from(tier_id), quantity, &buyer)
                .await
                .into_diagnostic()?;
            out.write(&ReservationRow::from(&reservation))
                .into_diagnostic()?;
        }
        Command::Release { reservation_id } => {
            let reservation = engine.release(reservation_id).await.into_diagnostic()?;
            out.write(&ReservationRow::from(&reservation))
                .into_diagnostic()?;
        }
        Command::Sweep { tier_id } => {
            let tier_id = TierId::from(tier_id);
            let lapsed = engine.sweep(&tier_id).await.into_diagnostic()?;
            out.write(&SweepRow { tier_id, lapsed }).into_diagnostic()?;
        }
        Command::Confirm {
            event_id,
            reservation,
            amount,
        } => {
            let delivery = PaymentDelivery {
                external_event_id: event_id.clone(),
                reservation_id: reservation,
                amount_minor_units: amount,
            };
            let confirmation = engine.confirm_payment(delivery).await.into_diagnostic()?;
            out.write_all(ConfirmationRow::rows(&event_id, &confirmation))
                .into_diagnostic()?;
        }
        Command::Webhooks { input } => {
            let file = File::open(input).into_diagnostic()?;
            for delivery in DeliveryReader::new(file).deliveries() {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable delivery");
                        continue;
                    }
                };
                let event_id = delivery.external_event_id.clone();
                match engine.confirm_payment(delivery).await {
                    Ok(confirmation) => out
                        .write_all(ConfirmationRow::rows(&event_id, &confirmation))
                        .into_diagnostic()?,
                    Err(e) => warn!(payment_event = %event_id, error = %e, "Delivery not processed"),
                }
            }
        }
        Command::Recover { event_id } => {
            let confirmation = engine.recover(&event_id).await.into_diagnostic()?;
            out.write_all(ConfirmationRow::rows(&event_id, &confirmation))
                .into_diagnostic()?;
        }
        Command::Redeem { token, scanner } => {
            let result = engine.redeem(&token, &scanner).await;
            let row = scan_row(scanner, result).into_diagnostic()?;
            out.write(&row).into_diagnostic()?;
        }
        Command::Scans { input } => {
            let file = File::open(input).into_diagnostic()?;
            for scan in ScanReader::new(file).scans() {
                let scan = match scan {
                    Ok(scan) => scan,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable scan");
                        continue;
                    }
                };
                let result = engine.redeem(&scan.token, &scan.scanner).await;
                match scan_row(scan.scanner, result) {
                    Ok(row) => out.write(&row).into_diagnostic()?,
                    Err(e) => warn!(error = %e, "Scan not processed"),
                }
            }
        }
        Command::Ticket { ticket_id } => {
            let ticket = engine.ticket(ticket_id).await.into_diagnostic()?;
            out.write(&TicketRow::from(&ticket)).into_diagnostic()?;
        }
        Command::Void { ticket_id } => {
            let ticket = engine.void(ticket_id).await.into_diagnostic()?;
            out.write(&TicketRow::from(&ticket)).into_diagnostic()?;
        }
        Command::Rotate { ticket_id } => {
            let issued = engine.rotate_token(ticket_id).await.into_diagnostic()?;
            out.write(&TicketRow::from(&issued)).into_diagnostic()?;
        }
        Command::Attempts { ticket_id } => {
            let attempts = engine.attempts(ticket_id).await.into_diagnostic()?;
            out.write_all(attempts.iter().map(AttemptRow::from))
                .into_diagnostic()?;
        }
    }
    Ok(())
}

/// Turns a redemption verdict into the row shown to venue staff. Failures
/// that are not a verdict on the ticket are handed back.
fn scan_row(
    scanner: String,
    result: std::result::Result<Admission, EngineError>,
) -> std::result::Result<ScanRow, EngineError> {
    match result {
        Ok(admission) => Ok(ScanRow {
            scanner,
            ticket_id: Some(admission.ticket.id),
            outcome: admission.outcome,
            message: "Ticket accepted".to_string(),
        }),
        Err(e) => match RedemptionOutcome::for_error(&e) {
            Some(outcome) => Ok(ScanRow {
                scanner,
                ticket_id: rejected_ticket(&e),
                outcome,
                message: e.user_message(),
            }),
            None => Err(e),
        },
    }
}

fn rejected_ticket(error: &EngineError) -> Option<TicketId> {
    match error {
        EngineError::OutOfWindow { ticket } | EngineError::AlreadyUsed { ticket, .. } => {
            Some(*ticket)
        }
        EngineError::StaleToken(ticket) | EngineError::TicketNotFound(ticket) => Some(*ticket),
        _ => None,
    }
}
