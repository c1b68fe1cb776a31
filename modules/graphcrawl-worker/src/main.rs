use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use graphcrawl_common::{Config, QueueKind};
use graphcrawl_graph::{migrate::migrate, GraphClient, GraphWriter, RetryPolicy};
use graphcrawl_worker::blob::FsBlobStore;
use graphcrawl_worker::source::TwitterSource;
use graphcrawl_worker::{seed, Consumer, ConsumerSettings, FanoutPolicy, Paginator, PgQueue};
use twitter_client::{ApiFlavor, TwitterClient};

#[derive(Parser)]
#[command(name = "graphcrawl-worker", about = "Location-scoped social graph crawler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume one queue until interrupted.
    Work(WorkArgs),
    /// Store root users and queue their first crawl tasks.
    Seed {
        #[arg(long)]
        location: String,
        /// Root user ids (repeat or comma-separate).
        #[arg(long = "user-id", required = true, value_delimiter = ',')]
        user_ids: Vec<String>,
        #[command(flatten)]
        platform: PlatformArgs,
    },
    /// Queue a keyword search for a location.
    Search {
        #[arg(long)]
        location: String,
        #[arg(long)]
        query: String,
    },
    /// Apply graph constraints and queue table migrations.
    Migrate,
}

#[derive(Args)]
struct WorkArgs {
    /// tweets | followers | retweeters | search
    #[arg(long)]
    queue: QueueKind,
    /// Stop each resource after this many records.
    #[arg(long)]
    count: Option<usize>,
    /// Stop each resource after this many pages.
    #[arg(long)]
    max_batches: Option<u32>,
    #[arg(long, default_value_t = 100)]
    page_size: u32,
    /// Process a single message and exit.
    #[arg(long)]
    once: bool,
    #[command(flatten)]
    platform: PlatformArgs,
}

#[derive(Args)]
struct PlatformArgs {
    /// Credential selector: reads TWITTER_BEARER_TOKEN_<ACCOUNT>.
    #[arg(long)]
    account: Option<String>,
    /// v2 | v1
    #[arg(long, default_value = "v2")]
    flavor: ApiFlavor,
}

impl PlatformArgs {
    fn client(&self, config: &Config) -> Result<TwitterClient> {
        let token = config.twitter_token(self.account.as_deref())?;
        Ok(match &config.twitter_api_base {
            Some(base) => TwitterClient::with_base_url(token, self.flavor, base.clone()),
            None => TwitterClient::new(token, self.flavor),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    info!("graphcrawl worker starting...");
    let config = Config::worker_from_env();
    config.log_redacted();

    let client = GraphClient::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
        .await
        .context("connect to Neo4j")?;
    let queue = PgQueue::connect(&config.database_url, config.visibility_timeout)
        .await
        .context("connect to queue database")?;

    let result = match cli.command {
        Command::Migrate => run_migrations(&client, &queue).await,
        Command::Work(args) => work(&config, client.clone(), queue, args).await,
        Command::Seed {
            location,
            user_ids,
            platform,
        } => {
            let writer = GraphWriter::new(client.clone());
            let source = TwitterSource::new(platform.client(&config)?, 100);
            let report = seed::seed_roots(&source, &writer, &queue, &location, &user_ids).await?;
            info!(
                requested = report.requested,
                found = report.found,
                enqueued = report.enqueued,
                "Seeding complete"
            );
            Ok(())
        }
        Command::Search { location, query } => {
            seed::enqueue_search(&queue, &location, &query).await
        }
    };

    client.shutdown();
    result
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("graphcrawl=info".parse()?);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn run_migrations(client: &GraphClient, queue: &PgQueue) -> Result<()> {
    migrate(client).await.context("graph migrations")?;
    queue.migrate().await.context("queue migrations")?;
    info!("Migrations complete");
    Ok(())
}

async fn work(config: &Config, client: GraphClient, queue: PgQueue, args: WorkArgs) -> Result<()> {
    client.spawn_keepalive(config.keepalive_interval);

    let writer = GraphWriter::with_retry(client, RetryPolicy::with_retries(config.conflict_retries));
    let source = TwitterSource::new(args.platform.client(config)?, args.page_size);
    let blobs = FsBlobStore::new(&config.blob_root);

    let settings = ConsumerSettings {
        queue: args.queue,
        visibility_timeout: config.visibility_timeout,
        receive_wait: config.receive_wait,
        paginator: Paginator::new(config.rate_limit_cooldown)
            .max_batches(args.max_batches)
            .target_count(args.count),
        fanout: FanoutPolicy::new(config.influence_threshold).with_limit(config.fanout_limit),
    };
    info!(
        queue = %args.queue,
        flavor = args.platform.flavor.as_str(),
        account = args.platform.account.as_deref().unwrap_or("default"),
        "Starting consumer"
    );

    let consumer = Consumer::new(
        Arc::new(queue),
        Arc::new(writer),
        Arc::new(blobs),
        Arc::new(source),
        settings,
    );

    if args.once {
        match consumer.run_once().await? {
            Some(report) => info!(outcome = %report.outcome, "Processed one message"),
            None => info!("No message available"),
        }
        return Ok(());
    }

    let stats = consumer
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;
    info!("Consumer stopped. {stats}");
    Ok(())
}
