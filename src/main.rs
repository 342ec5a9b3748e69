use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use swapbot::api::{Credentials, OkxClient, RestContext, RetryPolicy};
use swapbot::events::{ChannelSink, TracingSink};
use swapbot::{Engine, EngineConfig, EngineEvent, EventSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swapbot")]
#[command(version = "0.1.0")]
#[command(about = "Perpetual swap safety-line trading bot", long_about = None)]
struct Cli {
    /// Config file path (JSON or TOML); SWAPBOT__* env vars override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "swapbot=debug"
    #[arg(long, default_value = "swapbot=info")]
    log_level: String,

    /// Send engine events to the log instead of stdout
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================================
// Operator commands
// ============================================================================

#[derive(Debug, PartialEq)]
enum Command {
    Exit,
    Cancel,
    Modify,
    Status,
    Stop,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "exit" | "close" => Some(Command::Exit),
        "cancel" => Some(Command::Cancel),
        "modify" | "tpsl" => Some(Command::Modify),
        "status" => Some(Command::Status),
        "stop" | "quit" => Some(Command::Stop),
        _ => None,
    }
}

/// Returns false once the engine should stop
async fn handle_command(engine: &Engine, command: Command) -> bool {
    match command {
        Command::Exit => match engine.manual_exit().await {
            Ok(true) => tracing::info!("✅ Position closed"),
            Ok(false) => tracing::info!("No position to close"),
            Err(e) => tracing::error!("❌ Manual exit failed: {}", e),
        },
        Command::Cancel => match engine.batch_cancel_orders().await {
            Ok(n) => tracing::info!("🧹 Cancelled {} pending entry orders", n),
            Err(e) => tracing::error!("❌ Cancel failed: {}", e),
        },
        Command::Modify => {
            if let Err(e) = engine.batch_modify_tpsl().await {
                tracing::error!("❌ TP/SL modify failed: {}", e);
            }
        }
        Command::Status => {
            let report = engine.status();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::warn!("Could not render status: {}", e),
            }
        }
        Command::Stop => return false,
    }
    true
}

/// Print every engine event as one JSON line on stdout
fn forward_events(mut events: UnboundedReceiver<EngineEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Unserializable event: {}", e),
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    tracing::info!("🚀 SwapBot starting");

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {}", config.symbol);
    tracing::info!("  Leverage: {}x", config.leverage);
    tracing::info!("  Network: {}", if config.use_testnet { "demo" } else { "live" });
    tracing::info!(
        "  Safety lines: long > {}, short < {}",
        config.long_safety_line_price,
        config.short_safety_line_price
    );
    tracing::info!(
        "  Batch: {} orders, offset {}",
        config.batch_size_per_loop,
        config.batch_offset
    );

    let client = OkxClient::new(
        RestContext {
            base_url: config.rest_base_url.clone(),
            credentials: Credentials::new(
                config.okx_api_key.clone(),
                config.okx_api_secret.clone(),
                config.okx_passphrase.clone(),
            ),
            simulated: config.use_testnet,
        },
        RetryPolicy::default(),
        config.rest_rate_limit_per_sec,
    )?;

    let (sink, printer): (Arc<dyn EventSink>, _) = if cli.quiet {
        (Arc::new(TracingSink) as Arc<dyn EventSink>, None)
    } else {
        let (sink, events) = ChannelSink::new();
        (Arc::new(sink) as Arc<dyn EventSink>, Some(forward_events(events)))
    };

    let engine = Engine::start(config, Arc::new(client), sink)
        .await
        .context("engine startup")?;

    tracing::info!("\n⌨️  Commands: exit | cancel | modify | status | stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = engine.shutdown_signal();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("\n🛑 Shutdown signal received");
                break;
            }
            _ = shutdown.wait() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Some(command) => {
                            if !handle_command(&engine, command).await {
                                break;
                            }
                        }
                        None if line.trim().is_empty() => {}
                        None => tracing::warn!("Unknown command: {}", line.trim()),
                    },
                    // stdin closed; keep running until ctrl-c
                    Ok(None) => {
                        tokio::signal::ctrl_c().await.ok();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("stdin read failed: {}", e);
                        tokio::signal::ctrl_c().await.ok();
                        break;
                    }
                }
            }
        }
    }

    engine.stop().await;
    drop(engine);
    if let Some(printer) = printer {
        printer.abort();
    }

    tracing::info!("👋 SwapBot stopped");
    Ok(())
}

/// RUST_LOG wins over `--log-level`
fn setup_logging(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
