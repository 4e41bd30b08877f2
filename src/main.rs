use clap::{Args, Parser, Subcommand};
use loyalty_accrual::application::dispatcher::Dispatcher;
use loyalty_accrual::application::observer::AccrualObserver;
use loyalty_accrual::application::relay::OutboxRelay;
use loyalty_accrual::config::{QueueSettings, Settings};
use loyalty_accrual::domain::luhn;
use loyalty_accrual::domain::ports::{OrderLedger, Outbox, TaskQueueRef};
use loyalty_accrual::infrastructure::accrual_client::HttpAccrualAuthority;
use loyalty_accrual::infrastructure::in_memory::InMemoryLedger;
use loyalty_accrual::infrastructure::memory_queue::InMemoryTaskQueue;
use loyalty_accrual::logging;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(feature = "queue-amqp")]
use loyalty_accrual::infrastructure::amqp::{AmqpConfig, AmqpTaskQueue};
#[cfg(feature = "storage-rocksdb")]
use loyalty_accrual::infrastructure::rocksdb::RocksDbLedger;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML settings file, layered over configs/loyalty.yml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile submitted orders with the accrual system until Ctrl-C
    Serve(ServeArgs),
    /// Check an order number's Luhn checksum
    Check { number: String },
    /// Print the effective settings as JSON
    Config,
}

#[derive(Args)]
struct ServeArgs {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Base URL of the accrual system
    #[arg(long, env = "ACCRUAL_SYSTEM_ADDRESS")]
    accrual_address: Option<String>,

    /// AMQP broker URL (optional). If provided, uses RabbitMQ.
    #[arg(long)]
    queue_url: Option<String>,
}

impl ServeArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(path) = self.db_path {
            settings.storage.path = Some(path);
        }
        if let Some(address) = self.accrual_address {
            settings.accrual.address = address;
        }
        if let Some(url) = self.queue_url {
            settings.queue.url = Some(url);
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;

    match cli.command {
        Command::Check { number } => {
            if luhn::is_valid(&number) {
                println!("valid");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("invalid");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Config => {
            let rendered = serde_json::to_string_pretty(&settings).into_diagnostic()?;
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve(args) => {
            args.apply(&mut settings);
            logging::init(&settings.log).into_diagnostic()?;
            serve(settings).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            shutdown.cancel();
        }
    });

    let queue = open_queue(&settings.queue).await?;

    match settings.storage.path.as_deref() {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let ledger = RocksDbLedger::open(path).into_diagnostic()?;
            info!(path = %path.display(), "Using RocksDB storage");
            run(Arc::new(ledger), queue, &settings, shutdown).await
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            tracing::warn!(
                "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            run(Arc::new(InMemoryLedger::new()), queue, &settings, shutdown).await
        }
        None => run(Arc::new(InMemoryLedger::new()), queue, &settings, shutdown).await,
    }
}

async fn open_queue(settings: &QueueSettings) -> Result<TaskQueueRef> {
    match settings.url.as_deref() {
        #[cfg(feature = "queue-amqp")]
        Some(url) => {
            let queue = AmqpTaskQueue::connect(AmqpConfig {
                url: url.to_string(),
                queue: settings.name.clone(),
                prefetch: settings.prefetch,
            })
            .await
            .into_diagnostic()?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "queue-amqp"))]
        Some(_) => {
            tracing::warn!(
                "AMQP queue requested via --queue-url, but 'queue-amqp' feature is not enabled. Falling back to the in-process queue."
            );
            Ok(Arc::new(InMemoryTaskQueue::new()))
        }
        None => Ok(Arc::new(InMemoryTaskQueue::new())),
    }
}

async fn run<L>(
    ledger: Arc<L>,
    queue: TaskQueueRef,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<()>
where
    L: OrderLedger + Outbox + 'static,
{
    let authority = HttpAccrualAuthority::new(
        settings.accrual.address.as_str(),
        settings.accrual.request_timeout(),
    )
    .into_diagnostic()?;
    let observer = AccrualObserver::new(
        Arc::new(authority),
        ledger.clone(),
        settings.accrual.observer(),
    );
    let dispatcher = Dispatcher::new(
        queue.clone(),
        Arc::new(observer),
        settings.worker.dispatcher(),
    );
    let relay = OutboxRelay::new(
        ledger,
        queue,
        settings.outbox.relay_interval(),
        settings.outbox.batch_size,
    );

    info!(
        env = %settings.app.env,
        accrual = %settings.accrual.address,
        pool_size = settings.worker.pool_size,
        "Reconciliation started"
    );

    let dispatched = async {
        let result = dispatcher.run(shutdown.clone()).await;
        shutdown.cancel();
        result
    };
    let (dispatched, ()) = tokio::join!(dispatched, relay.run(shutdown.clone()));
    dispatched.into_diagnostic()?;

    info!("Reconciliation stopped");
    Ok(())
}
