//! docqueue CLI: operator interface and sample host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docqueue::config::secrets::{ExposeSecret, redacted_url};
use docqueue::config::{Config, ConsumerSettings};
use docqueue::consumer::{HandlerOutcome, LeaseReaper, QueueConsumer, ReceivedItem, handler_fn};
use docqueue::model::ItemId;
use docqueue::producer::QueueProducer;
use docqueue::store::{DocumentStore, PgStore};
use docqueue::telemetry::{TelemetryConfig, init_telemetry};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "docqueue", about = "Work queue on a document store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Enqueue work items
    Produce {
        /// JSON payload
        data: String,
        /// Item id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Enqueue this many copies (ignored with --id)
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Run a consumer until Ctrl-C
    Consume {
        /// TOML file with a [consumer] table (env config when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Process one item at a time in feed order
        #[arg(long)]
        single_threaded: bool,
        /// Reject items whose payload has `"reject": true`
        #[arg(long)]
        honor_reject: bool,
        /// Simulated work per item in milliseconds
        #[arg(long, default_value_t = 0)]
        work_ms: u64,
    },
    /// Show a queue item
    Show {
        /// Item id
        id: String,
    },
    /// Return expired claims to pending once
    Reap,
}

/// Fields the sample handler looks at. Anything else in the payload is ignored.
#[derive(Debug, Default, Deserialize)]
struct SampleFlags {
    #[serde(default)]
    reject: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "docqueue".to_string(),
        default_level: Some(config.log_level.clone()),
    })?;

    info!(database = %redacted_url(&config.database_url), "connecting");
    let store = PgStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;

    match cli.command {
        Command::Migrate => {
            println!("Migrations applied.");
            Ok(())
        }
        Command::Produce { data, id, count } => cmd_produce(&config, store, data, id, count).await,
        Command::Consume {
            config: path,
            single_threaded,
            honor_reject,
            work_ms,
        } => {
            let settings = match path {
                Some(path) => ConsumerSettings::from_toml_file(&path)?,
                None => config.consumer_settings(),
            };
            let settings = if single_threaded {
                settings.single_threaded(true)
            } else {
                settings
            };
            cmd_consume(store, settings, honor_reject, work_ms).await
        }
        Command::Show { id } => cmd_show(&config, &store, id).await,
        Command::Reap => {
            let reaper = LeaseReaper::new(
                Arc::new(store.clone()),
                config.queue_collection(),
                &config.worker_id,
            );
            let reclaimed = reaper.reclaim_once().await?;
            println!("Reclaimed {reclaimed} expired claim(s).");
            Ok(())
        }
    }
}

async fn cmd_produce(
    config: &Config,
    store: PgStore,
    data: String,
    id: Option<String>,
    count: usize,
) -> anyhow::Result<()> {
    let data: serde_json::Value = serde_json::from_str(&data)?;

    let producer = QueueProducer::new(Arc::new(store));
    producer.initialize(config.producer_settings()).await?;

    match id {
        Some(id) => {
            let id = producer.enqueue_with_id(id, &data).await?;
            println!("Enqueued: {id}");
        }
        None => {
            for _ in 0..count {
                let id = producer.enqueue(&data).await?;
                println!("Enqueued: {id}");
            }
        }
    }

    producer.close();
    Ok(())
}

async fn cmd_consume(
    store: PgStore,
    settings: ConsumerSettings,
    honor_reject: bool,
    work_ms: u64,
) -> anyhow::Result<()> {
    let handler = handler_fn(move |item: ReceivedItem| async move {
        info!(id = %item.id(), errors = item.errors(), data = %item.data(), "processing");
        if work_ms > 0 {
            tokio::time::sleep(Duration::from_millis(work_ms)).await;
        }
        // non-object payloads carry no flags
        let flags: SampleFlags = item.data_as().unwrap_or_default();
        let reject = honor_reject && flags.reject;
        anyhow::Ok(if reject {
            HandlerOutcome::Rejected
        } else {
            HandlerOutcome::Success
        })
    });

    let store = Arc::new(store);
    let consumer = QueueConsumer::new(store.clone(), store).with_handler(handler);

    let cancel = CancellationToken::new();
    let handle = consumer.start(settings, cancel.clone()).await?;
    println!("Consuming as worker {}. Ctrl-C to stop.", handle.worker_id());

    tokio::signal::ctrl_c().await.ok();
    cancel.cancel();
    handle.join().await?;
    Ok(())
}

async fn cmd_show(config: &Config, store: &PgStore, id: String) -> anyhow::Result<()> {
    let item = store
        .read_item(&config.queue_collection(), &ItemId::from(id.clone()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no queue item '{id}'"))?;
    let value = &item.value;

    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or("-".to_string())
    };

    println!("ID:          {}", value.id);
    println!("Status:      {}", value.status);
    println!("ETag:        {}", item.etag);
    println!("Errors:      {}", value.errors);
    println!("Queued:      {}", value.queued_time.format("%Y-%m-%d %H:%M:%S"));
    println!("Started:     {}", fmt_time(value.process_start_time));
    println!("Completed:   {}", fmt_time(value.completed_time));
    println!(
        "Worker:      {}",
        value.current_worker.as_deref().unwrap_or("-")
    );
    println!("Expires:     {}", fmt_time(value.worker_expires));
    println!("Data:        {}", serde_json::to_string_pretty(&value.data)?);

    Ok(())
}
