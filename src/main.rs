//! editrpc - transport and dispatch core for editor protocols
//!
//! Stdout carries protocol traffic for `echo`, `frame` and `inspect`, so
//! logs and errors go to stderr.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use editrpc::cli::{Cli, Commands};
use editrpc::models::EditRpcConfig;

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!(
                r#"{{"success":false,"error":"Failed to create runtime: {}"}}"#,
                e
            );
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(async_main(cli));

    if let Err(e) = result {
        let response = serde_json::json!({
            "success": false,
            "error": format!("{e:#}")
        });
        eprintln!(
            "{}",
            serde_json::to_string(&response)
                .unwrap_or_else(|_| format!(r#"{{"success":false,"error":"{}"}}"#, e))
        );
        std::process::exit(2);
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let config = EditRpcConfig::load(cli.config.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    init_tracing(&config.logging.filter);
    editrpc::config::init(&config);
    tracing::debug!(?config, "Configuration loaded");

    execute_command(cli.command).await
}

/// Quiet by default; RUST_LOG wins over the configured filter.
/// Use RUST_LOG=editrpc=debug for verbose output.
fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("editrpc=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

async fn execute_command(command: Commands) -> anyhow::Result<()> {
    use editrpc::cli::commands;

    match command {
        Commands::Inspect(args) => commands::inspect::execute(args).await,
        Commands::Frame(args) => commands::frame::execute(args).await,
        Commands::Echo(args) => commands::echo::execute(args).await,
    }
}
