use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use taskmesh::config::{NodeIdentity, SchedulerConfig};
use taskmesh::listener::LoggingListener;
use taskmesh::node::RequesterNode;
use taskmesh::price_for_work;
use taskmesh::resource::LocalDirManager;
use taskmesh::scheduler::TaskHeader;
use taskmesh::shutdown::install_shutdown_handler;
use taskmesh::work_unit::ChunkedWorkUnit;

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(version)]
#[command(about = "Requester-side scheduler for distributed subtask computation")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a requester node until SIGINT or SIGTERM
    Serve(ServeArgs),

    /// Compute what a provider is owed for a piece of work
    Price {
        /// Price per second quoted by the provider
        #[arg(long)]
        price: u64,

        /// Seconds of work
        #[arg(long)]
        seconds: f64,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Key id of this node; offers carrying it are refused
    #[arg(long, default_value = "requester")]
    key_id: String,

    #[arg(long, default_value = "taskmesh")]
    node_name: String,

    /// Address providers return results to
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    #[arg(long, default_value = "40102")]
    port: u16,

    /// Root of per-task scratch directories (defaults to the system temp dir)
    #[arg(long)]
    scratch_root: Option<PathBuf>,

    /// Deadline sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    sweep_interval_ms: u64,

    /// Register a demo task covering this many items
    #[arg(long)]
    demo_items: Option<u64>,

    /// Items per demo subtask
    #[arg(long, default_value = "10")]
    demo_chunk: u64,

    /// Demo task ttl in seconds
    #[arg(long, default_value = "3600")]
    demo_ttl: f64,

    /// Demo subtask timeout in seconds
    #[arg(long, default_value = "600")]
    demo_subtask_timeout: f64,

    /// Highest price per second the demo task pays
    #[arg(long, default_value = "100")]
    demo_max_price: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct PriceOutput {
    price: u64,
    seconds: f64,
    value: u64,
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let node_identity = NodeIdentity {
        key_id: args.key_id,
        node_name: args.node_name,
        address: args.address,
        port: args.port,
    };
    let mut config = SchedulerConfig::default().with_sweep_interval_ms(args.sweep_interval_ms);
    config.node = node_identity;
    if let Some(root) = args.scratch_root {
        config.scratch_root = root;
    }

    tracing::info!(
        key_id = %config.node.key_id,
        address = %config.node.address,
        port = config.node.port,
        scratch_root = %config.scratch_root.display(),
        "Starting taskmesh requester"
    );

    let dir_manager = Arc::new(LocalDirManager::new(config.scratch_root.clone()));
    let (penalty_tx, mut penalty_rx) = mpsc::channel::<String>(256);
    let node = RequesterNode::new(config, dir_manager).with_penalty_sink(penalty_tx);
    node.add_listener(Arc::new(LoggingListener)).await;

    tokio::spawn(async move {
        while let Some(node_id) = penalty_rx.recv().await {
            tracing::warn!(node_id = %node_id, "Node missed a subtask deadline");
        }
    });

    if let Some(items) = args.demo_items {
        let task_id = uuid::Uuid::new_v4().to_string();
        let header = TaskHeader::new(task_id.clone(), args.demo_ttl, args.demo_subtask_timeout)
            .with_max_price(args.demo_max_price);
        node.register(Box::new(ChunkedWorkUnit::new(header, items, args.demo_chunk)))
            .await?;
        tracing::info!(task_id = %task_id, items, "Demo task registered");
    }

    let shutdown = install_shutdown_handler();
    let sweeper = tokio::spawn(node.clone().run_sweeper(shutdown.clone()));

    shutdown.cancelled().await;
    sweeper.await?;

    let progresses = node.progresses().await;
    println!("{}", serde_json::to_string_pretty(&progresses)?);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_serve(serve_args).await?;
        }
        Commands::Price {
            price,
            seconds,
            output,
        } => {
            let value = price_for_work(price, seconds);
            match output {
                OutputFormat::Json => {
                    let out = PriceOutput {
                        price,
                        seconds,
                        value,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => println!("{}", value),
            }
        }
    }

    Ok(())
}
