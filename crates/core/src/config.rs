use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CobaltError;

/// SQS refuses batches larger than this, so the outbound batch size is capped here.
pub const MAX_SEND_BATCH: usize = 10;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Profiled lookup over an arbitrary key source.
///
/// Tries `{PROFILE}_{KEY}` first and falls back to `{KEY}`.
struct Lookup<'a> {
    profile: &'a str,
    source: &'a dyn Fn(&str) -> Option<String>,
}

impl Lookup<'_> {
    fn opt(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = (self.source)(&prefixed).filter(|s| !s.is_empty()) {
                return Some(v);
            }
        }
        (self.source)(key).filter(|s| !s.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.opt(key).as_deref() {
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            _ => default,
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Process configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub aws: AwsConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `COBALT_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_opt("COBALT_PROFILE").unwrap_or_default();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        Self::from_lookup(profile, &env_opt)
    }

    /// Build config from any key source. Used by tests to avoid touching the
    /// process environment.
    pub fn from_lookup(profile: &str, source: &dyn Fn(&str) -> Option<String>) -> Self {
        let p = profile.to_uppercase();
        let lookup = Lookup {
            profile: &p,
            source,
        };
        Self {
            profile: p.clone(),
            aws: AwsConfig::from_lookup(&lookup),
            storage: StorageConfig::from_lookup(&lookup),
            queue: QueueConfig::from_lookup(&lookup),
            ingest: IngestConfig::from_lookup(&lookup),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), CobaltError> {
        if self.ingest.workers == 0 {
            return Err(CobaltError::Config("workers must be at least 1".into()));
        }
        if self.ingest.batch_max == 0 || self.ingest.batch_max > MAX_SEND_BATCH {
            return Err(CobaltError::Config(format!(
                "batch size must be between 1 and {MAX_SEND_BATCH}, got {}",
                self.ingest.batch_max
            )));
        }
        if self.ingest.batch_tick_ms == 0 {
            return Err(CobaltError::Config("batch tick must be positive".into()));
        }
        if self.queue.inbound.is_empty() || self.queue.outbound.is_empty() {
            return Err(CobaltError::Config("inbound and outbound queues must be set".into()));
        }
        if self.storage.processed_bucket.is_empty() {
            return Err(CobaltError::Config("processed bucket must be set".into()));
        }
        match self.storage.backend.as_str() {
            "s3" | "local" => Ok(()),
            other => Err(CobaltError::Config(format!(
                "unknown storage backend '{other}' (expected s3 or local)"
            ))),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  aws:      region={}, static_credentials={}, endpoint={}",
            self.aws.region,
            self.aws.has_static_credentials(),
            self.aws.endpoint_url.as_deref().unwrap_or("(default)")
        );
        tracing::info!(
            "  storage:  backend={}, processed_bucket={}",
            self.storage.backend,
            self.storage.processed_bucket
        );
        tracing::info!(
            "  queue:    inbound={}, outbound={}, wait={}s",
            self.queue.inbound,
            self.queue.outbound,
            self.queue.wait_time_secs
        );
        tracing::info!(
            "  ingest:   workers={}, batch={}/{}ms, report={}, drain={}",
            self.ingest.workers,
            self.ingest.batch_max,
            self.ingest.batch_idle_ms,
            self.ingest.report_path.display(),
            self.ingest.stop_when_idle
        );
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_lookup(l: &Lookup<'_>) -> Self {
        Self {
            region: l.or("AWS_REGION", "us-west-2"),
            access_key_id: l.opt("AWS_ACCESS_KEY_ID"),
            secret_access_key: l.opt("AWS_SECRET_ACCESS_KEY"),
            session_token: l.opt("AWS_SESSION_TOKEN"),
            endpoint_url: l.opt("AWS_ENDPOINT_URL"),
        }
    }

    /// Static keys win over the default credential chain when both are set.
    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    /// Endpoint override with a scheme, if one is configured.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint_url
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.starts_with("http://") || e.starts_with("https://") {
                    e.to_string()
                } else {
                    format!("https://{e}")
                }
            })
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "s3" or "local".
    pub backend: String,
    /// Root directory for the local backend; each bucket is a subdirectory.
    pub data_dir: PathBuf,
    /// Bucket that receives unpacked entries.
    pub processed_bucket: String,
}

impl StorageConfig {
    fn from_lookup(l: &Lookup<'_>) -> Self {
        Self {
            backend: l.or("STORAGE_BACKEND", "s3").to_lowercase(),
            data_dir: PathBuf::from(l.or("DATA_DIR", "data")),
            processed_bucket: l.or("PROCESSED_BUCKET", "processed"),
        }
    }
}

// ── Queues ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue receiving storage notifications (name or URL).
    pub inbound: String,
    /// Queue receiving reconciled work items (name or URL).
    pub outbound: String,
    /// Long-poll wait per receive call.
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
    /// Messages requested per poll.
    pub poll_batch: u32,
}

impl QueueConfig {
    fn from_lookup(l: &Lookup<'_>) -> Self {
        Self {
            inbound: l.or("INBOUND_QUEUE", "new-content"),
            outbound: l.or("OUTBOUND_QUEUE", "ingestion"),
            wait_time_secs: l.u64("QUEUE_WAIT_TIME_SECS", 2),
            visibility_timeout_secs: l.u64("QUEUE_VISIBILITY_TIMEOUT_SECS", 300),
            poll_batch: l.u32("QUEUE_POLL_BATCH", 1),
        }
    }
}

// ── Ingest engine ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum number of archives processed concurrently.
    pub workers: usize,
    /// Append-only problem/summary report.
    pub report_path: PathBuf,
    pub batch_max: usize,
    pub batch_idle_ms: u64,
    pub batch_tick_ms: u64,
    /// Return after the first empty poll instead of polling forever.
    pub stop_when_idle: bool,
}

impl IngestConfig {
    fn from_lookup(l: &Lookup<'_>) -> Self {
        Self {
            workers: l.usize("WORKERS", 2),
            report_path: PathBuf::from(l.or("REPORT_PATH", "report.log")),
            batch_max: l.usize("BATCH_MAX", MAX_SEND_BATCH),
            batch_idle_ms: l.u64("BATCH_IDLE_MS", 10_000),
            batch_tick_ms: l.u64("BATCH_TICK_MS", 1_000),
            stop_when_idle: l.bool("DRAIN", false),
        }
    }
}
