//! Runtime configuration for both services.
//!
//! Every knob is available as a CLI flag and an environment variable, with
//! flags taking precedence. Defaults follow the deployment contract:
//! `REDIS_HOST=localhost`, `CLAMD_URL=tcp://127.0.0.1:3310`,
//! `SCAN_TMP_DIR=/tmp/virusscan`, `PRODUCER_PORT=50051`, metrics on 8080.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::CachePolicyConfig;
use crate::core::KeySpace;
use crate::transport::TransportConfig;

/// Absolute cap on a single inspected body.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Flags shared by both binaries.
#[derive(Debug, Clone, Args)]
pub struct RedisArgs {
    /// Redis host.
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis port.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Prefix applied to every Redis key.
    #[arg(long, env = "SCAN_KEY_PREFIX", default_value = "")]
    pub key_prefix: String,
}

impl RedisArgs {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    /// Key space under the configured prefix.
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }
}

/// Producer (external processor) configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "scangate-producer")]
#[command(about = "Envoy ext_proc / ICAP front end for the scan pipeline", long_about = None)]
pub struct ProducerConfig {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// gRPC listen port for the external processor.
    #[arg(long, env = "PRODUCER_PORT", default_value_t = 50051)]
    pub port: u16,

    /// ICAP listen port; unset disables the ICAP front end.
    #[arg(long, env = "ICAP_PORT")]
    pub icap_port: Option<u16>,

    /// Preview size advertised to ICAP clients.
    #[arg(long, env = "ICAP_PREVIEW_SIZE", default_value_t = 4096)]
    pub icap_preview_size: usize,

    /// Observability (metrics/health) port.
    #[arg(long, env = "OBSERVABILITY_PORT", default_value_t = 8080)]
    pub observability_port: u16,

    /// Verdict wait budget per task, milliseconds.
    #[arg(long, env = "PROCESSING_TIMEOUT_MS", default_value_t = 30_000)]
    pub processing_timeout_ms: u64,

    /// Admit traffic when the verdict times out or errors.
    #[arg(
        long,
        env = "FAILURE_MODE_ALLOW",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub failure_mode_allow: bool,

    /// Shared RWX scan directory; empty disables SHARED_DISK transport.
    #[arg(long, env = "SCAN_TMP_DIR", default_value = "/tmp/virusscan")]
    pub scan_tmp_dir: String,

    /// In-memory buffering threshold before spilling, MiB.
    #[arg(long, env = "SCAN_FILE_THRESHOLD_MB", default_value_t = 10)]
    pub scan_file_threshold_mb: u64,

    /// Bodies at or under this many bytes use INLINE transport.
    #[arg(long, env = "SCAN_INLINE_MAX_BYTES", default_value_t = 64 * 1024)]
    pub inline_max_bytes: u64,

    /// Absolute body cap; larger uploads are rejected with 413.
    #[arg(long, env = "SCAN_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: u64,

    /// HTTP status for blocked (infected) requests.
    #[arg(long, env = "SCAN_BLOCK_STATUS", default_value_t = 406)]
    pub block_status: u16,

    /// Verdict cache TTL, seconds.
    #[arg(long, env = "SCAN_CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub cache_ttl_seconds: u64,

    /// Extra trusted registry hosts (comma separated).
    #[arg(long, env = "SCAN_TRUSTED_HOSTS", value_delimiter = ',')]
    pub trusted_hosts: Vec<String>,

    /// Hosts exempted from scanning (comma separated).
    #[arg(long, env = "SCAN_BYPASS_HOSTS", value_delimiter = ',')]
    pub bypass_hosts: Vec<String>,
}

impl ProducerConfig {
    /// Verdict wait budget as a duration.
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Transport selection parameters derived from the flags.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            inline_max: self.inline_max_bytes,
            spill_threshold: self.scan_file_threshold_mb * 1024 * 1024,
            shared_dir: (!self.scan_tmp_dir.is_empty())
                .then(|| PathBuf::from(&self.scan_tmp_dir)),
            ..TransportConfig::default()
        }
    }

    /// Host policy for the intelligent cache.
    pub fn cache_policy(&self) -> CachePolicyConfig {
        CachePolicyConfig {
            trusted_hosts: self.trusted_hosts.clone(),
            bypass_hosts: self.bypass_hosts.clone(),
            ttl_seconds: Some(self.cache_ttl_seconds),
        }
    }
}

/// Consumer (worker) configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "scangate-consumer")]
#[command(about = "Queue-driven ClamAV scan worker", long_about = None)]
pub struct ConsumerCli {
    #[command(flatten)]
    pub config: ConsumerConfig,

    #[command(subcommand)]
    pub command: Option<ConsumerCommand>,
}

/// Operator subcommands for the consumer binary.
#[derive(Debug, Clone, Subcommand)]
pub enum ConsumerCommand {
    /// Bumps the cluster target epoch, triggering coordinated reloads.
    SetTargetEpoch {
        /// Explicit epoch; omitted means increment the current one.
        #[arg(long)]
        epoch: Option<u64>,
    },
}

/// Worker-loop configuration.
#[derive(Debug, Clone, Args)]
pub struct ConsumerConfig {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// ClamD connection URL (tcp://host:port or unix:///path).
    #[arg(long, env = "CLAMD_URL", default_value = "tcp://127.0.0.1:3310")]
    pub clamd_url: String,

    /// Shared RWX scan directory for PATH tasks.
    #[arg(long, env = "SCAN_TMP_DIR", default_value = "/tmp/virusscan")]
    pub scan_tmp_dir: String,

    /// Worker count; 0 means one per CPU core.
    #[arg(long, env = "SCAN_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Observability (metrics/health) port.
    #[arg(long, env = "OBSERVABILITY_PORT", default_value_t = 8080)]
    pub observability_port: u16,

    /// Node identity for heartbeats; defaults to the pod hostname.
    #[arg(long, env = "HOSTNAME", default_value = "unknown-node")]
    pub node_id: String,

    /// Engine reload budget, seconds.
    #[arg(long, env = "SCAN_RELOAD_TIMEOUT_SECONDS", default_value_t = 120)]
    pub reload_timeout_seconds: u64,

    /// Shutdown drain budget, seconds.
    #[arg(long, env = "SCAN_DRAIN_SECONDS", default_value_t = 30)]
    pub drain_seconds: u64,
}

impl ConsumerConfig {
    /// Effective worker count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Transport parameters for reconstructing task bodies.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            shared_dir: (!self.scan_tmp_dir.is_empty())
                .then(|| PathBuf::from(&self.scan_tmp_dir)),
            ..TransportConfig::default()
        }
    }

    /// Engine reload budget as a duration.
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_seconds)
    }

    /// Shutdown drain budget as a duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }
}

/// Process exit codes shared by both binaries.
pub mod exit_codes {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Invalid configuration.
    pub const CONFIG_ERROR: i32 = 1;
    /// A required dependency was unreachable at startup.
    pub const DEPENDENCY_UNREACHABLE: i32 = 2;
    /// Interrupted by SIGINT.
    pub const SIGINT: i32 = 130;
}
