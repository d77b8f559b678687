use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use pinelink::actions::{self, AlertCategory, TelemetrySubscription};
use pinelink::dfu::{self, DfuConfig, DfuPhase};
use pinelink::package;
use pinelink::transport_btleplug::BtleplugTransport;
use pinelink::{GattLink, LinkConfig};

/// Companion CLI for PineTime-class wearables
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device name or address
    target: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware package over legacy DFU
    Dfu {
        /// Firmware package path (zip with .dat and .bin)
        pkg: String,
        /// Packet-receipt-notification interval in segments
        #[arg(long)]
        ack_interval: Option<u32>,
    },
    /// Write the current local time to the watch
    SyncTime,
    /// Read the battery level
    Battery {
        /// Keep printing updates as they arrive
        #[arg(long)]
        watch: bool,
    },
    /// Read the heart rate
    HeartRate {
        #[arg(long)]
        watch: bool,
    },
    /// Read the step count
    Steps {
        #[arg(long)]
        watch: bool,
    },
    /// Read the firmware revision string
    FirmwareVersion,
    /// Push a notification to the watch
    Notify {
        title: String,
        body: String,
        #[arg(long, value_enum, default_value = "simple")]
        category: Category,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Category {
    Simple,
    Email,
    News,
    Call,
    MissedCall,
    Sms,
    Voicemail,
    Schedule,
    HighPriority,
    InstantMessage,
    All,
}

impl From<Category> for AlertCategory {
    fn from(category: Category) -> Self {
        match category {
            Category::Simple => AlertCategory::Simple,
            Category::Email => AlertCategory::Email,
            Category::News => AlertCategory::News,
            Category::Call => AlertCategory::Call,
            Category::MissedCall => AlertCategory::MissedCall,
            Category::Sms => AlertCategory::Sms,
            Category::Voicemail => AlertCategory::Voicemail,
            Category::Schedule => AlertCategory::Schedule,
            Category::HighPriority => AlertCategory::HighPriority,
            Category::InstantMessage => AlertCategory::InstantMessage,
            Category::All => AlertCategory::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let transport = BtleplugTransport::resolve(&args.target).await?;
    let link = GattLink::new(transport, LinkConfig::default());
    link.connect().await?;

    let result = run_command(&link, args.command).await;
    link.disconnect().await;
    result
}

async fn run_command(link: &GattLink<BtleplugTransport>, command: Commands) -> Result<()> {
    match command {
        Commands::Dfu { pkg, ack_interval } => {
            let package = package::load(&pkg)?;
            let mut config = DfuConfig::default();
            if let Some(interval) = ack_interval {
                config.ack_interval = interval;
            }
            run_dfu(link, &package, config).await?;
        }
        Commands::SyncTime => {
            actions::sync_time(link, chrono::Local::now().naive_local()).await?;
            println!("Time synced");
        }
        Commands::Battery { watch } => {
            let sub = actions::battery_level(link).await?;
            watch_telemetry(sub, watch, |payload| {
                format!("{}%", actions::parse_battery_level(payload))
            })
            .await;
        }
        Commands::HeartRate { watch } => {
            let sub = actions::heart_rate(link).await?;
            watch_telemetry(sub, watch, |payload| {
                format!("{} bpm", actions::parse_heart_rate(payload))
            })
            .await;
        }
        Commands::Steps { watch } => {
            let sub = actions::step_count(link).await?;
            watch_telemetry(sub, watch, |payload| {
                format!("{} steps", actions::parse_step_count(payload))
            })
            .await;
        }
        Commands::FirmwareVersion => {
            match actions::firmware_version(link).await? {
                Some(version) => println!("{version}"),
                None => println!("No firmware version reported"),
            }
        }
        Commands::Notify {
            title,
            body,
            category,
        } => {
            actions::send_alert(link, category.into(), &title, &body).await?;
            println!("Notification sent");
        }
    }
    Ok(())
}

async fn run_dfu(
    link: &GattLink<BtleplugTransport>,
    package: &package::FirmwarePackage,
    config: DfuConfig,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let total = package.image_data.len() as u64;

    let render = tokio::spawn(async move {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{msg} [{elapsed}] [{wide_bar:.blue/white}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap()
            .progress_chars("#> "),
        );
        while let Some(phase) = rx.recv().await {
            match phase {
                DfuPhase::Transfer { bytes_sent, .. } => {
                    pb.set_message("Uploading...");
                    pb.set_position(bytes_sent);
                }
                DfuPhase::Done => pb.finish_with_message("Done"),
                DfuPhase::Failed(reason) => pb.abandon_with_message(format!("Failed: {reason}")),
                other => pb.set_message(other.description()),
            }
        }
    });

    let result = dfu::run_upload(link, package, config, tx).await;
    let _ = render.await;
    Ok(result?)
}

async fn watch_telemetry<F>(mut sub: TelemetrySubscription, watch: bool, format: F)
where
    F: Fn(&[u8]) -> String,
{
    match sub.initial.as_deref() {
        Some(payload) => println!("{}", format(payload)),
        None => println!("No value reported"),
    }
    if watch {
        while let Some(payload) = sub.updates.next().await {
            println!("{}", format(payload.as_slice()));
        }
    }
}
