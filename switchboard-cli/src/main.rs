//! Switchboard CLI Application

use anyhow::Result;
use clap::{Parser, Subcommand};
use scenarios::{CliVerdict, Device, Scenario};
use std::path::PathBuf;
use std::time::Duration;
use switchboard_core::prelude::*;
use switchboard_core::{FilterVerdict, OrchestratorConfig};
use tokio::sync::broadcast;

mod scenarios;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call on the simulated device
    Dial {
        /// Address to call (e.g. "tel:555-0100")
        address: String,

        /// Account to place the call on (sim1, sim2 or work)
        #[arg(long)]
        account: Option<String>,

        /// Hang up after this many milliseconds
        #[arg(long, default_value = "1000")]
        hangup_after_ms: u64,
    },

    /// Simulate an incoming call
    Incoming {
        /// Caller address
        from: String,

        /// Verdict of the incoming-call filter
        #[arg(long, value_enum, default_value = "allow")]
        verdict: CliVerdict,

        /// Answer as soon as the call rings
        #[arg(long)]
        auto_answer: bool,
    },

    /// Run a scripted scenario
    Demo {
        /// Scenario to run
        #[arg(value_enum)]
        scenario: Scenario,
    },

    /// Show the effective configuration and accounts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SWITCHBOARD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("switchboard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = scenarios::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Dial {
            address,
            account,
            hangup_after_ms,
        } => {
            let device = Device::new(config, FilterVerdict::Allow)?;
            let printer = print_events(device.orchestrator.subscribe());
            handle_dial(&device, &address, account.as_deref(), hangup_after_ms).await?;
            finish(&device, printer).await;
        }
        Commands::Incoming {
            from,
            verdict,
            auto_answer,
        } => {
            let device = Device::new(config, verdict.into())?;
            let printer = print_events(device.orchestrator.subscribe());
            handle_incoming(&device, &from, auto_answer).await?;
            finish(&device, printer).await;
        }
        Commands::Demo { scenario } => {
            let device = Device::new(config, FilterVerdict::Allow)?;
            let printer = print_events(device.orchestrator.subscribe());
            scenarios::run(&device, scenario).await?;
            finish(&device, printer).await;
        }
        Commands::Status => {
            handle_status(config)?;
        }
    }

    Ok(())
}

async fn handle_dial(
    device: &Device,
    address: &str,
    account: Option<&str>,
    hangup_after_ms: u64,
) -> Result<()> {
    let account = account.map(Device::account).transpose()?;
    println!("📞 Dialing {address}...");

    let call_id = device.dial(address, account).await?;
    println!("✅ Call {call_id} is {:?}", device.state(call_id));

    tokio::time::sleep(Duration::from_millis(hangup_after_ms)).await;
    device.hang_up(call_id)?;
    println!("👋 Hung up call {call_id}");
    Ok(())
}

async fn handle_incoming(device: &Device, from: &str, auto_answer: bool) -> Result<()> {
    println!("📲 Incoming call from {from}...");
    match device.receive(from, auto_answer).await? {
        Some(call_id) => {
            println!("   Call {call_id} is {:?}", device.state(call_id));
            if device.state(call_id).is_some() {
                device.hang_up(call_id)?;
            }
        }
        None => println!("🚫 Call was turned away"),
    }
    Ok(())
}

fn handle_status(config: OrchestratorConfig) -> Result<()> {
    println!("📊 Switchboard Status");
    println!("{}", serde_json::to_string_pretty(&config)?);

    let device = Device::new(config, FilterVerdict::Allow)?;
    let accounts = device.orchestrator.accounts();
    println!();
    println!("Accounts:");
    for handle in [Device::sim1(), Device::sim2(), Device::work_line()] {
        if let Some(account) = accounts.get(&handle) {
            println!("  {handle}  {}", account.label);
        }
    }
    Ok(())
}

fn print_events(mut events: broadcast::Receiver<CallEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("   • {}", scenarios::describe_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn finish(device: &Device, printer: tokio::task::JoinHandle<()>) {
    // Let the printer drain what is already queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.orchestrator.shutdown();
    printer.abort();
}
