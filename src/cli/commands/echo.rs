//! Echo command implementation
//!
//! A small stdio server for poking at the runtime by hand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cli::DialectArg;
use crate::error::HandlerError;
use crate::protocol::Dialect;
use crate::rpc::{
    Connection, ConnectionOptions, HandlerDescriptor, HandlerOptions, HandlerRegistry,
    NotificationHandler, ProcessType, RequestContext, RequestHandler,
};

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Message dialect spoken on stdio
    #[arg(short, long, value_enum, default_value_t = DialectArg::Lsp)]
    pub dialect: DialectArg,
}

pub async fn execute(args: EchoArgs) -> Result<()> {
    let dialect = Dialect::from(args.dialect);
    let registry = demo_registry().context("Failed to register demo handlers")?;
    tracing::info!(%dialect, methods = ?registry.methods(), "Serving on stdio");

    Connection::builder(dialect)
        .registry(registry)
        .options(ConnectionOptions::default())
        .build()
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Connection failed")
}

type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

#[derive(Debug, Serialize)]
struct SleepResult {
    slept_ms: u64,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
}

/// Appends `log` messages, one at a time and in arrival order
struct LogHandler {
    journal: Journal,
}

#[async_trait]
impl NotificationHandler for LogHandler {
    type Params = LogParams;

    const METHOD: &'static str = "log";
    const PROCESS_TYPE: ProcessType = ProcessType::Serial;

    async fn handle(&self, params: LogParams, _cx: RequestContext) -> Result<(), HandlerError> {
        self.journal.lock().await.push(params.message);
        Ok(())
    }
}

struct JournalHandler {
    journal: Journal,
}

#[async_trait]
impl RequestHandler for JournalHandler {
    type Params = ();
    type Result = Vec<String>;

    const METHOD: &'static str = "journal";
    const PROCESS_TYPE: ProcessType = ProcessType::Serial;

    async fn handle(&self, _params: (), _cx: RequestContext) -> Result<Vec<String>, HandlerError> {
        Ok(self.journal.lock().await.clone())
    }
}

fn demo_registry() -> Result<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    let journal = Journal::default();

    registry.on_request("echo", HandlerOptions::parallel(), |params: Value, _cx| async move {
        Ok(params)
    })?;
    registry.on_request(
        "sleep",
        HandlerOptions::parallel(),
        |params: SleepParams, cx: RequestContext| async move {
            cx.run_until_cancelled(tokio::time::sleep(Duration::from_millis(params.ms)))
                .await?;
            Ok::<_, HandlerError>(SleepResult {
                slept_ms: params.ms,
            })
        },
    )?;
    registry.register(HandlerDescriptor::notification(LogHandler {
        journal: Arc::clone(&journal),
    }))?;
    // Each call gets its own handler sharing the journal
    registry.register(HandlerDescriptor::request_factory(
        JournalHandler::METHOD,
        move || JournalHandler {
            journal: Arc::clone(&journal),
        },
    ))?;

    Ok(registry)
}
