//! Server configuration.
//!
//! `ServerConfig` is the plain struct the server consumes; the CLI
//! layer in `main.rs` maps clap arguments onto it. Defaults follow the
//! conventions of the wire-compatible servers this one speaks to:
//! port 6379, 16384 chunks, ten shards.

use std::path::PathBuf;

use shoal_core::Error;

/// Everything the server reads at startup. Only the auth strings and
/// the ftmc toggle can change at runtime (via `CONFIG SET`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: String,
    pub port: u16,
    /// Fixed shard count; recorded in the catalog at first boot.
    pub kv_store_count: u32,
    /// Chunk count for the segment hash. Keys map to chunks, chunks
    /// map to shards.
    pub chunk_size: u32,
    /// Password clients must AUTH with; empty means no auth.
    pub requirepass: Option<String>,
    /// Password sent when syncing from an upstream master.
    pub masterauth: Option<String>,
    /// When false, binlog versions are not bumped for idempotent ops.
    pub version_increase: bool,
    /// Log every command at info level.
    pub general_log: bool,
    /// Shared store budget in MiB; zero disables the cap.
    pub block_cache_mb: u64,
    /// TTL scanner: max index entries read per shard per tick.
    pub scan_batch: usize,
    /// TTL scanner pool size.
    pub scan_jobs: usize,
    /// TTL deleter: max deletions per shard per job.
    pub del_batch: usize,
    /// TTL deleter pool size.
    pub del_jobs: usize,
    /// Seconds between index manager ticks.
    pub pause_secs: u64,
    pub cluster_enabled: bool,
    pub data_dir: PathBuf,
    /// Request executor size; defaults to `max(4, cores / 2)`.
    pub executor_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "127.0.0.1".to_string(),
            port: 6379,
            kv_store_count: 10,
            chunk_size: 16384,
            requirepass: None,
            masterauth: None,
            version_increase: true,
            general_log: false,
            block_cache_mb: 0,
            scan_batch: 1000,
            scan_jobs: 1,
            del_batch: 1000,
            del_jobs: 1,
            pause_secs: 10,
            cluster_enabled: false,
            data_dir: PathBuf::from("./shoal-data"),
            executor_threads: None,
        }
    }
}

impl ServerConfig {
    /// Rejects configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.kv_store_count == 0 {
            return Err(Error::Internal("kv_store_count must be at least 1".into()));
        }
        if self.chunk_size < self.kv_store_count {
            return Err(Error::Internal(
                "chunk_size must be at least kv_store_count".into(),
            ));
        }
        if self.scan_jobs == 0 || self.del_jobs == 0 {
            return Err(Error::Internal(
                "index manager pools need at least one worker".into(),
            ));
        }
        if self.scan_batch == 0 || self.del_batch == 0 {
            return Err(Error::Internal(
                "index manager batch sizes must be positive".into(),
            ));
        }
        if let Some(0) = self.executor_threads {
            return Err(Error::Internal(
                "executor_threads must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Resolved request executor size.
    pub fn executor_size(&self) -> usize {
        self.executor_threads.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cores / 2).max(4)
        })
    }
}
