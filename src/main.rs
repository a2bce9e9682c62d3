//! hookbridge - Entry Point
//!
//! Bridges an injected chat-client agent to a message-processing pipeline.
//! Runs with a log-only work sink unless embedded as a library.

use std::sync::Arc;

use hookbridge::{Bridge, Config, LoggingSink};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let json_logs = args.iter().any(|a| a == "--json-logs" || a == "-j");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("hookbridge v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: hookbridge [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --json-logs, -j  Emit JSON logs instead of ANSI");
        println!("  --help, -h       Show this help");
        println!();
        println!("Environment variables:");
        println!("  HOOKBRIDGE_CONTROL_URL     Control endpoint base URL");
        println!("  HOOKBRIDGE_EVENT_HOST      Event listener bind host");
        println!("  HOOKBRIDGE_EVENT_PORT      Event listener bind port");
        println!("  HOOKBRIDGE_ADVERTISE_HOST  Host registered with the hook");
        println!("  HOOKBRIDGE_WHITELIST       Comma-separated sender names");
        println!("  HOOKBRIDGE_MAX_RETRIES     Control request retry budget");
        println!("  HOOKBRIDGE_TIMEOUT_SECS    Control request timeout");
        println!("  HOOKBRIDGE_HOOK_RETRIES    Hook reclaim cycle budget");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("hookbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let bridge = Bridge::new(config, Arc::new(LoggingSink));
    bridge.run().await
}
