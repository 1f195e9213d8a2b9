//! Ingestion configuration
//!
//! Environment-driven settings for LEI snapshot acquisition, processing,
//! scheduling and retention. Timer strings are kept raw here and parsed by
//! the scheduler at start-up.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::models::JobKind;

fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        std::env::temp_dir().join("refdata-ingest")
    } else {
        PathBuf::from("/tmp/refdata-ingest")
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Whether the scheduler is started with the server
    pub enabled: bool,
    /// Root for downloaded artifacts; one sub-directory per job kind
    pub data_dir: PathBuf,
    pub full_source_url: String,
    pub delta_source_url: String,
    /// Duration between delta runs, e.g. "6h", "30m"
    pub delta_sync_interval: String,
    /// Weekday of the full run, e.g. "sunday"
    pub full_sync_day: String,
    /// "HH:MM" UTC
    pub full_sync_time: String,
    /// "HH:MM" UTC
    pub cleanup_time: String,
    pub keep_full_files: usize,
    pub keep_delta_files: usize,
    /// Records per transactional flush
    pub batch_size: usize,
    /// Processing attempts allowed per snapshot
    pub max_retries: i32,
    pub download_timeout_secs: u64,
    /// Attempts per download before giving up with a network error
    pub download_attempts: u32,
    /// Base delay between download attempts; grows linearly
    pub retry_delay_secs: u64,
    /// A RUNNING job without a heartbeat for this long is considered dead
    pub stale_job_timeout_secs: u64,
    /// Names this process in job claims; must be stable across restarts of
    /// the same deployment and unique among live processes
    pub instance_id: String,
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            enabled: env_or("INGEST_ENABLED", defaults.enabled),
            data_dir: std::env::var("INGEST_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            full_source_url: env_string("INGEST_FULL_SOURCE_URL", &defaults.full_source_url),
            delta_source_url: env_string("INGEST_DELTA_SOURCE_URL", &defaults.delta_source_url),
            delta_sync_interval: env_string(
                "INGEST_DELTA_SYNC_INTERVAL",
                &defaults.delta_sync_interval,
            ),
            full_sync_day: env_string("INGEST_FULL_SYNC_DAY", &defaults.full_sync_day),
            full_sync_time: env_string("INGEST_FULL_SYNC_TIME", &defaults.full_sync_time),
            cleanup_time: env_string("INGEST_CLEANUP_TIME", &defaults.cleanup_time),
            keep_full_files: env_or("INGEST_KEEP_FULL_FILES", defaults.keep_full_files),
            keep_delta_files: env_or("INGEST_KEEP_DELTA_FILES", defaults.keep_delta_files),
            batch_size: env_or("INGEST_BATCH_SIZE", defaults.batch_size),
            max_retries: env_or("INGEST_MAX_RETRIES", defaults.max_retries),
            download_timeout_secs: env_or(
                "INGEST_DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout_secs,
            ),
            download_attempts: env_or("INGEST_DOWNLOAD_ATTEMPTS", defaults.download_attempts),
            retry_delay_secs: env_or("INGEST_RETRY_DELAY_SECS", defaults.retry_delay_secs),
            stale_job_timeout_secs: env_or(
                "INGEST_STALE_JOB_TIMEOUT_SECS",
                defaults.stale_job_timeout_secs,
            ),
            instance_id: std::env::var("INGEST_INSTANCE_ID")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or(defaults.instance_id),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than 0");
        }
        if self.max_retries <= 0 {
            anyhow::bail!("INGEST_MAX_RETRIES must be greater than 0");
        }
        if self.download_attempts == 0 {
            anyhow::bail!("INGEST_DOWNLOAD_ATTEMPTS must be greater than 0");
        }
        if self.stale_job_timeout_secs == 0 {
            anyhow::bail!("INGEST_STALE_JOB_TIMEOUT_SECS must be greater than 0");
        }
        if self.instance_id.trim().is_empty() {
            anyhow::bail!("INGEST_INSTANCE_ID must not be empty");
        }
        if self.download_timeout_secs == 0 {
            anyhow::bail!("INGEST_DOWNLOAD_TIMEOUT_SECS must be greater than 0");
        }
        if self.enabled {
            if self.full_source_url.trim().is_empty() {
                anyhow::bail!("INGEST_FULL_SOURCE_URL is required when ingestion is enabled");
            }
            if self.delta_source_url.trim().is_empty() {
                anyhow::bail!("INGEST_DELTA_SOURCE_URL is required when ingestion is enabled");
            }
        }
        Ok(())
    }

    pub fn source_url(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Full => &self.full_source_url,
            JobKind::Delta => &self.delta_source_url,
        }
    }

    /// Number of raw artifacts retention keeps for a kind
    pub fn keep_files(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Full => self.keep_full_files,
            JobKind::Delta => self.keep_delta_files,
        }
    }

    pub fn kind_dir(&self, kind: JobKind) -> PathBuf {
        self.data_dir.join(kind.as_str())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }

    /// Heartbeat period of a running job, well inside the stale timeout
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.stale_job_timeout_secs / 4).max(1))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: default_data_dir(),
            full_source_url: String::new(),
            delta_source_url: String::new(),
            delta_sync_interval: "6h".to_string(),
            full_sync_day: "sunday".to_string(),
            full_sync_time: "02:00".to_string(),
            cleanup_time: "04:30".to_string(),
            keep_full_files: 2,
            keep_delta_files: 14,
            batch_size: 1000,
            max_retries: 3,
            download_timeout_secs: 3600,
            download_attempts: 3,
            retry_delay_secs: 5,
            stale_job_timeout_secs: 600,
            instance_id: "refdata-server".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_config_default() {
        let config = IngestConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.keep_files(JobKind::Full), 2);
        assert_eq!(config.keep_files(JobKind::Delta), 14);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = IngestConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_requires_sources() {
        let mut config = IngestConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.full_source_url = "https://registry.example/full.csv.gz".to_string();
        config.delta_source_url = "https://registry.example/delta.csv.gz".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.source_url(JobKind::Delta), "https://registry.example/delta.csv.gz");
    }

    #[test]
    fn test_kind_dir_and_durations() {
        let config = IngestConfig {
            data_dir: PathBuf::from("/data"),
            retry_delay_secs: 7,
            ..Default::default()
        };
        assert_eq!(config.kind_dir(JobKind::Full), PathBuf::from("/data/full"));
        assert_eq!(config.retry_delay(), Duration::from_secs(7));
        assert_eq!(config.stale_job_timeout(), Duration::from_secs(600));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(150));
    }

    #[test]
    fn test_blank_instance_id_rejected() {
        let config = IngestConfig {
            instance_id: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
