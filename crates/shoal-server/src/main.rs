use clap::Parser;
use tracing::{error, info};

use shoal_server::{Server, ServerConfig};

/// A Redis-protocol-compatible, multi-shard persistent KV server.
#[derive(Parser, Debug)]
#[command(name = "shoal-server", version, about)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 6379)]
    port: u16,

    /// Number of shard stores (fixed at first boot).
    #[arg(long, default_value_t = 10)]
    kv_store_count: u32,

    /// Chunk count for the segment hash.
    #[arg(long, default_value_t = 16384)]
    chunk_size: u32,

    /// Password clients must AUTH with.
    #[arg(long)]
    requirepass: Option<String>,

    /// Password used when syncing from an upstream master.
    #[arg(long)]
    masterauth: Option<String>,

    /// Do not bump binlog versions for idempotent operations.
    #[arg(long)]
    no_version_increase: bool,

    /// Log every command.
    #[arg(long)]
    general_log: bool,

    /// Shared store budget in MiB (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    block_cache_mb: u64,

    /// TTL scanner batch size per shard per tick.
    #[arg(long, default_value_t = 1000)]
    scan_batch: usize,

    /// TTL scanner pool size.
    #[arg(long, default_value_t = 1)]
    scan_jobs: usize,

    /// TTL deleter batch size per shard per job.
    #[arg(long, default_value_t = 1000)]
    del_batch: usize,

    /// TTL deleter pool size.
    #[arg(long, default_value_t = 1)]
    del_jobs: usize,

    /// Seconds between TTL index manager ticks.
    #[arg(long, default_value_t = 10)]
    pause_secs: u64,

    /// Enable cluster mode.
    #[arg(long)]
    cluster_enabled: bool,

    /// Directory for store logs and the catalog.
    #[arg(long, default_value = "./shoal-data")]
    data_dir: std::path::PathBuf,

    /// Request executor size; defaults to max(4, cores / 2).
    #[arg(long)]
    executor_threads: Option<usize>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_ip: args.bind,
            port: args.port,
            kv_store_count: args.kv_store_count,
            chunk_size: args.chunk_size,
            requirepass: args.requirepass,
            masterauth: args.masterauth,
            version_increase: !args.no_version_increase,
            general_log: args.general_log,
            block_cache_mb: args.block_cache_mb,
            scan_batch: args.scan_batch,
            scan_jobs: args.scan_jobs,
            del_batch: args.del_batch,
            del_jobs: args.del_jobs,
            pause_secs: args.pause_secs,
            cluster_enabled: args.cluster_enabled,
            data_dir: args.data_dir,
            executor_threads: args.executor_threads,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=info".into()),
        )
        .init();

    let cfg: ServerConfig = Args::parse().into();

    let server = match Server::startup(cfg).await {
        Ok(server) => server,
        Err(e) => {
            error!("server startup failed: {e}");
            std::process::exit(1);
        }
    };

    // ctrl-c behaves like a client SHUTDOWN: record the request and
    // let wait_stop_complete run the actual stop
    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                server.handle_shutdown_cmd();
            }
        });
    }

    server.wait_stop_complete().await;
}
