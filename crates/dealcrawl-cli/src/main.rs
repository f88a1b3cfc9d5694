use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dealcrawl_adapters::{
    ExtractionAdapter, FixtureExtractionAdapter, HttpExtractionAdapter, HttpExtractionConfig,
};
use dealcrawl_storage::{DealStore, PgStore, PoolConfig};
use dealcrawl_sync::{
    maybe_build_scheduler, seed_registry, BatchOrchestrator, LifecycleSweeper, ReconcileOptions,
    SyncConfig,
};
use dealcrawl_web::{AppState, AuthConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dealcrawl")]
#[command(about = "Deal crawl and ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP trigger surface plus the cron scheduler when enabled.
    Serve {
        #[arg(long, env = "DEALCRAWL_WEB_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// One scheduled sweep over every active connector.
    Crawl,
    /// Manual run of a single connector.
    Run {
        #[arg(long)]
        connector: Uuid,
        #[arg(long)]
        auto_approve: bool,
        #[arg(long)]
        expire_old_deals: bool,
    },
    /// Expire, hide and recount. Recount scope follows DEALCRAWL_LIFECYCLE_RECOUNT_ALL
    /// unless --recount-all forces every merchant.
    Sweep {
        #[arg(long)]
        recount_all: bool,
    },
    Migrate,
    /// Upsert merchants and connectors from the YAML registry.
    Seed {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Recent crawl runs, newest first.
    Runs {
        #[arg(long)]
        connector: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Serve { port } => serve(&config, port).await?,
        Commands::Crawl => {
            let store = connect(&config).await?;
            let orchestrator = orchestrator(&config, store)?;
            let summary = orchestrator.run_scheduled_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Run {
            connector,
            auto_approve,
            expire_old_deals,
        } => {
            let store = connect(&config).await?;
            let orchestrator = orchestrator(&config, store)?;
            let options = ReconcileOptions {
                auto_approve,
                expire_old_deals,
            };
            let outcome = orchestrator.run_single(connector, options).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Sweep { recount_all } => {
            let store = connect(&config).await?;
            let sweeper =
                LifecycleSweeper::new(store).with_scheduled_recount_all(config.lifecycle_recount_all);
            let summary = if recount_all {
                sweeper.run(Utc::now(), true).await?
            } else {
                sweeper.run_scheduled(Utc::now()).await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, PoolConfig::default()).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Seed { path } => {
            let store = connect(&config).await?;
            let path = path.unwrap_or_else(|| config.connectors_path.clone());
            let summary = seed_registry(store.as_ref(), &path).await?;
            println!(
                "seeded merchants={} connectors={} from {}",
                summary.merchants,
                summary.connectors,
                path.display()
            );
        }
        Commands::Runs { connector, limit } => {
            let store = connect(&config).await?;
            for run in store.list_runs(connector, limit.max(1)).await? {
                println!(
                    "{} connector={} trigger={} status={} new={} updated={} skipped={} tokens={} started={}{}",
                    run.id,
                    run.connector_id,
                    run.trigger,
                    run.status,
                    run.new_count,
                    run.updated_count,
                    run.skipped_count,
                    run.tokens_used,
                    run.started_at.to_rfc3339(),
                    run.error_message
                        .as_deref()
                        .map(|e| format!(" error={e:?}"))
                        .unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(std::env::var("DEALCRAWL_LOG").unwrap_or_else(|_| "info".to_string()))
    })?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<Arc<dyn DealStore>> {
    let store = PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

fn build_adapter(config: &SyncConfig) -> Result<Arc<dyn ExtractionAdapter>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture extraction adapter");
        return Ok(Arc::new(FixtureExtractionAdapter::new(dir.clone())));
    }
    let Some(endpoint) = &config.extraction_endpoint else {
        bail!("set EXTRACTION_ENDPOINT or DEALCRAWL_FIXTURES_DIR to choose an extraction adapter");
    };
    let adapter = HttpExtractionAdapter::new(HttpExtractionConfig {
        endpoint: endpoint.clone(),
        api_key: config.extraction_api_key.clone(),
        timeout: config.extraction_timeout,
        user_agent: Some(config.user_agent.clone()),
    })
    .context("building extraction client")?;
    Ok(Arc::new(adapter))
}

fn orchestrator(config: &SyncConfig, store: Arc<dyn DealStore>) -> Result<BatchOrchestrator> {
    Ok(BatchOrchestrator::new(
        store,
        build_adapter(config)?,
        config.orchestrator_config(),
    ))
}

async fn serve(config: &SyncConfig, port: u16) -> Result<()> {
    let pg = PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to postgres")?;
    pg.migrate().await?;
    let store: Arc<dyn DealStore> = Arc::new(pg);

    let orchestrator = Arc::new(orchestrator(config, store.clone())?);
    let sweeper = Arc::new(
        LifecycleSweeper::new(store.clone())
            .with_scheduled_recount_all(config.lifecycle_recount_all),
    );

    let mut scheduler =
        maybe_build_scheduler(config, orchestrator.clone(), sweeper.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(
            crawl = %config.crawl_cron,
            lifecycle = %config.lifecycle_cron,
            "scheduler started"
        );
    }

    let state = AppState {
        store,
        orchestrator,
        sweeper,
    };
    let router = dealcrawl_web::app(state, AuthConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    dealcrawl_web::serve(listener, router, shutdown_signal()).await?;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, starting graceful shutdown");
}
