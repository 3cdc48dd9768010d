//! fieldsync CLI: operator interface to a device's offline mutation queue.

use clap::{Parser, Subcommand};
use fieldsync_rs::applier::HttpApplier;
use fieldsync_rs::client::SyncClient;
use fieldsync_rs::config::Config;
use fieldsync_rs::model::{Mutation, MutationId, PendingMutation};
use fieldsync_rs::store::FileStore;
use fieldsync_rs::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "fieldsync", about = "Offline mutation queue for field clients")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queue counts and last sync time
    Status,
    /// Queue a mutation given as JSON, e.g. '{"type":"checklist_toggle",...}'
    Enqueue {
        /// Mutation JSON, tagged by "type"
        json: String,
        /// Flush right after queueing
        #[arg(long)]
        flush: bool,
    },
    /// Replay the queue once
    Flush,
    /// List mutations with a recorded error
    Failed,
    /// Retry one failed mutation
    Retry {
        /// Mutation ID (full UUID or prefix)
        id: String,
    },
    /// Drop one mutation without applying it
    Dismiss {
        /// Mutation ID (full UUID or prefix)
        id: String,
    },
    /// Flush on start, then periodically until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "fieldsync".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = FileStore::open(&config.store_dir).await?;
    let applier = HttpApplier::new(config.api_url.clone(), config.api_token.clone())?;
    let client = SyncClient::open(Arc::new(store), Arc::new(applier), config.engine.clone()).await?;

    match cli.command {
        Command::Status => cmd_status(&client),
        Command::Enqueue { json, flush } => cmd_enqueue(&client, &json, flush).await,
        Command::Flush => cmd_flush(&client).await,
        Command::Failed => cmd_failed(&client).await,
        Command::Retry { id } => cmd_retry(&client, &id).await,
        Command::Dismiss { id } => cmd_dismiss(&client, &id).await,
        Command::Run => cmd_run(&client, &config).await,
    }
}

fn cmd_status(client: &SyncClient) -> anyhow::Result<()> {
    let state = client.state();
    println!("Pending:    {}", state.pending_count);
    println!("Failed:     {}", state.failed_count);
    println!(
        "Last Sync:  {}",
        state
            .last_sync_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

async fn cmd_enqueue(client: &SyncClient, json: &str, flush: bool) -> anyhow::Result<()> {
    let mutation: Mutation = serde_json::from_str(json)?;
    // No background trigger here: the process may exit before it finishes.
    let pending = client.engine().queue().enqueue(mutation).await?.into_mutation();
    println!(
        "Queued: {} ({})",
        pending.id.0,
        pending.mutation.mutation_type()
    );
    if flush {
        cmd_flush(client).await?;
    }
    Ok(())
}

async fn cmd_flush(client: &SyncClient) -> anyhow::Result<()> {
    let report = client.engine().flush_with_report().await?;
    if report.skipped {
        println!("A flush is already running.");
        return Ok(());
    }
    println!(
        "Applied {} of {} ({} failed, {} parked).",
        report.applied.len(),
        report.attempted,
        report.failed.len(),
        report.parked.len()
    );
    Ok(())
}

async fn cmd_failed(client: &SyncClient) -> anyhow::Result<()> {
    let failed = client.inbox().list().await?;
    if failed.is_empty() {
        println!("No failed mutations.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<18}  {:<8}  {:<6}  {:<16}  ERROR",
        "ID", "TYPE", "PARKED", "TRIES", "QUEUED"
    );
    println!("{}", "-".repeat(100));
    for m in &failed {
        println!(
            "{:<8}  {:<18}  {:<8}  {:<6}  {:<16}  {}",
            m.id,
            m.mutation.mutation_type(),
            if m.parked { "yes" } else { "no" },
            m.attempts,
            m.created_at.format("%Y-%m-%d %H:%M"),
            m.last_error.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} failed mutation(s)", failed.len());
    Ok(())
}

async fn cmd_retry(client: &SyncClient, id: &str) -> anyhow::Result<()> {
    let id = resolve_id(client, id).await?;
    if client.inbox().retry_one(id).await? {
        println!("Applied: {}", id.0);
    } else {
        let entry = client.engine().queue().get(id).await?;
        println!(
            "Still failing: {} ({})",
            id.0,
            entry.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_dismiss(client: &SyncClient, id: &str) -> anyhow::Result<()> {
    let id = resolve_id(client, id).await?;
    let dismissed = client.inbox().dismiss_one(id).await?;
    println!(
        "Dismissed: {} ({})",
        dismissed.id.0,
        dismissed.mutation.mutation_type()
    );
    Ok(())
}

async fn cmd_run(client: &SyncClient, config: &Config) -> anyhow::Result<()> {
    let triggers = client.triggers().clone();
    let applied = triggers.on_mount().await;
    tracing::info!(applied, "startup flush done");

    let shutdown = Arc::new(Notify::new());
    let periodic = triggers.periodic(config.sync_interval, Arc::clone(&shutdown));

    tokio::signal::ctrl_c().await.ok();
    shutdown.notify_one();
    periodic.await?;
    Ok(())
}

/// Resolve a full UUID or unique prefix against the queue.
async fn resolve_id(client: &SyncClient, id_str: &str) -> anyhow::Result<MutationId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_str) {
        return Ok(MutationId(uuid));
    }

    let entries = client.engine().queue().load().await?;
    let matches: Vec<&PendingMutation> = entries
        .iter()
        .filter(|m| m.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no mutation matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} mutations match prefix '{id_str}', be more specific"),
    }
}
