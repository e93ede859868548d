//! Environment configuration, validated once at boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::queue::QueueName;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set for the selected storage backend")]
    Missing(&'static str),

    #[error("TASK_TIME_LIMIT ({hard}s) must be greater than TASK_SOFT_TIME_LIMIT ({soft}s)")]
    HardLimitNotAboveSoft { soft: u64, hard: u64 },

    #[error("RESULT_EXPIRES ({result_ttl}s) must not exceed FILE_RETENTION_HOURS ({retention}s)")]
    ResultsOutliveArtifacts { result_ttl: u64, retention: u64 },
}

/// Remote object store settings shared by the S3 flavours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    /// Lifetime of signed download URLs.
    pub url_expiry: Duration,
    /// When set, objects are served from `<base>/<key>` instead of signed URLs.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local,
    S3(S3Settings),
    Supabase(S3Settings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Local storage root, or the scratch area when a remote backend is active.
    pub root: PathBuf,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLimits {
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            soft_time_limit: Duration::from_secs(300),
            hard_time_limit: Duration::from_secs(600),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub soffice: Option<PathBuf>,
    pub pdftoppm: Option<PathBuf>,
    pub pdf_dpi: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            soffice: None,
            pdftoppm: None,
            pdf_dpi: 144,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Worker loops per consumed queue.
    pub concurrency: usize,
    pub queues: Vec<QueueName>,
    pub worker_id: String,
    /// Ceiling per queue, in jobs per minute.
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub storage: StorageConfig,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub limits: TaskLimits,
    pub result_ttl: Duration,
    pub worker: WorkerConfig,
    pub max_upload_bytes: u64,
    pub tools: ToolConfig,
    pub bind_addr: SocketAddr,
}

/// Reads typed values out of a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
        }
    }

    fn positive(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse_or(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    /// A positive value in some unit, multiplied out to the base unit.
    fn scaled(&self, key: &'static str, default: u64, factor: u64) -> Result<u64, ConfigError> {
        let value = self.positive(key, default)?;
        value.checked_mul(factor).ok_or_else(|| ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "value is too large".to_string(),
        })
    }

    fn positive_u32(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value = self.positive(key, u64::from(default))?;
        u32::try_from(value).map_err(|err| ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: err.to_string(),
        })
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.string(key).ok_or(ConfigError::Missing(key))
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let soft = env.positive("TASK_SOFT_TIME_LIMIT", 300)?;
        let hard = env.positive("TASK_TIME_LIMIT", 600)?;
        if hard <= soft {
            return Err(ConfigError::HardLimitNotAboveSoft { soft, hard });
        }

        let limits = TaskLimits {
            soft_time_limit: Duration::from_secs(soft),
            hard_time_limit: Duration::from_secs(hard),
            max_retries: env.parse_or("TASK_MAX_RETRIES", 3)?,
            retry_delay: Duration::from_secs(env.parse_or("TASK_RETRY_DELAY", 60)?),
        };

        let queues = match env.string("WORKER_QUEUES") {
            None => QueueName::ALL.to_vec(),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    name.parse::<QueueName>().map_err(|reason| ConfigError::Invalid {
                        key: "WORKER_QUEUES",
                        value: name.to_string(),
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        if queues.is_empty() {
            return Err(ConfigError::Invalid {
                key: "WORKER_QUEUES",
                value: String::new(),
                reason: "at least one queue is required".to_string(),
            });
        }

        let worker_id = env
            .string("WORKER_ID")
            .or_else(|| env.string("HOSTNAME"))
            .unwrap_or_else(|| "worker".to_string());

        let worker = WorkerConfig {
            concurrency: env.positive("WORKER_CONCURRENCY", 2)? as usize,
            queues,
            worker_id,
            rate_limit_per_minute: env.positive_u32("QUEUE_RATE_LIMIT", 100)?,
        };

        let tools = ToolConfig {
            soffice: env.string("LIBREOFFICE_PATH").map(PathBuf::from),
            pdftoppm: env.string("PDFTOPPM_PATH").map(PathBuf::from),
            pdf_dpi: env.positive_u32("PDF_RENDER_DPI", 144)?,
        };

        // A job record must not point at artifacts the sweeper already removed.
        let retention = env.scaled("FILE_RETENTION_HOURS", 24, 3600)?;
        let result_ttl = env.positive("RESULT_EXPIRES", 86_400)?;
        if result_ttl > retention {
            return Err(ConfigError::ResultsOutliveArtifacts { result_ttl, retention });
        }

        Ok(Self {
            redis_url: env.string_or("REDIS_URL", "redis://127.0.0.1/"),
            storage: Self::storage(&env)?,
            retention: Duration::from_secs(retention),
            sweep_interval: Duration::from_secs(env.positive("SWEEP_INTERVAL_SECS", 3600)?),
            limits,
            result_ttl: Duration::from_secs(result_ttl),
            worker,
            max_upload_bytes: env.scaled("MAX_FILE_SIZE_MB", 50, 1024 * 1024)?,
            tools,
            bind_addr: env.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
        })
    }

    fn storage<F>(env: &Env<F>) -> Result<StorageConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = PathBuf::from(env.string_or("STORAGE_ROOT", "storage"));
        let url_expiry = Duration::from_secs(env.positive("S3_PRESIGNED_URL_EXPIRATION", 3600)?);

        let backend = match env.string_or("STORAGE_BACKEND", "local").to_ascii_lowercase().as_str() {
            "local" => BackendConfig::Local,
            "s3" => BackendConfig::S3(S3Settings {
                bucket: env.required("S3_BUCKET_NAME")?,
                region: env.string_or("AWS_REGION", "us-east-1"),
                endpoint: env.string("S3_ENDPOINT"),
                access_key_id: env.string("AWS_ACCESS_KEY_ID"),
                secret_access_key: env.string("AWS_SECRET_ACCESS_KEY"),
                allow_http: env.flag("S3_ALLOW_HTTP")?,
                url_expiry,
                public_base_url: None,
            }),
            "supabase" => {
                let url = env.required("SUPABASE_URL")?;
                let url = url.trim_end_matches('/');
                let bucket = env.required("SUPABASE_BUCKET_NAME")?;
                let public_base_url = if env.flag("SUPABASE_PUBLIC_BUCKET")? {
                    Some(format!("{url}/storage/v1/object/public/{bucket}"))
                } else {
                    None
                };
                BackendConfig::Supabase(S3Settings {
                    endpoint: Some(format!("{url}/storage/v1/s3")),
                    bucket,
                    region: env.string_or("SUPABASE_REGION", "us-east-1"),
                    access_key_id: Some(env.required("SUPABASE_ACCESS_KEY_ID")?),
                    secret_access_key: Some(env.required("SUPABASE_SECRET_ACCESS_KEY")?),
                    allow_http: false,
                    url_expiry,
                    public_base_url,
                })
            }
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected one of local, s3, supabase".to_string(),
                })
            }
        };

        Ok(StorageConfig { root, backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.storage.backend, BackendConfig::Local);
        assert_eq!(config.storage.root, PathBuf::from("storage"));
        assert_eq!(config.limits, TaskLimits::default());
        assert_eq!(config.retention, Duration::from_secs(24 * 3600));
        assert_eq!(config.worker.queues, QueueName::ALL.to_vec());
        assert_eq!(config.worker.rate_limit_per_minute, 100);
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.tools.pdf_dpi, 144);
    }

    #[test]
    fn test_hard_limit_must_exceed_soft() {
        let err = load(&[("TASK_SOFT_TIME_LIMIT", "60"), ("TASK_TIME_LIMIT", "60")]).unwrap_err();
        assert!(matches!(err, ConfigError::HardLimitNotAboveSoft { soft: 60, hard: 60 }));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        assert!(matches!(
            load(&[("TASK_MAX_RETRIES", "lots")]),
            Err(ConfigError::Invalid { key: "TASK_MAX_RETRIES", .. })
        ));
        assert!(matches!(
            load(&[("QUEUE_RATE_LIMIT", "0")]),
            Err(ConfigError::Invalid { key: "QUEUE_RATE_LIMIT", .. })
        ));
    }

    #[test]
    fn test_oversized_values_are_rejected_not_wrapped() {
        assert!(matches!(
            load(&[("PDF_RENDER_DPI", "4294967296")]),
            Err(ConfigError::Invalid { key: "PDF_RENDER_DPI", .. })
        ));
        assert!(matches!(
            load(&[("FILE_RETENTION_HOURS", "18446744073709551615")]),
            Err(ConfigError::Invalid { key: "FILE_RETENTION_HOURS", .. })
        ));
        assert!(matches!(
            load(&[("MAX_FILE_SIZE_MB", "17592186044417")]),
            Err(ConfigError::Invalid { key: "MAX_FILE_SIZE_MB", .. })
        ));

        let config = load(&[("PDF_RENDER_DPI", "300"), ("MAX_FILE_SIZE_MB", "1")]).unwrap();
        assert_eq!(config.tools.pdf_dpi, 300);
        assert_eq!(config.max_upload_bytes, 1024 * 1024);
    }

    #[test]
    fn test_job_records_must_not_outlive_artifacts() {
        let err = load(&[("FILE_RETENTION_HOURS", "1"), ("RESULT_EXPIRES", "7200")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ResultsOutliveArtifacts {
                result_ttl: 7200,
                retention: 3600
            }
        ));

        let config = load(&[("FILE_RETENTION_HOURS", "1"), ("RESULT_EXPIRES", "3600")]).unwrap();
        assert_eq!(config.result_ttl, config.retention);
    }

    #[test]
    fn test_s3_requires_bucket() {
        assert!(matches!(
            load(&[("STORAGE_BACKEND", "s3")]),
            Err(ConfigError::Missing("S3_BUCKET_NAME"))
        ));

        let config = load(&[
            ("STORAGE_BACKEND", "S3"),
            ("S3_BUCKET_NAME", "artifacts"),
            ("AWS_REGION", "eu-west-1"),
        ])
        .unwrap();
        match config.storage.backend {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "artifacts");
                assert_eq!(s3.region, "eu-west-1");
                assert_eq!(s3.url_expiry, Duration::from_secs(3600));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_supabase_public_bucket_url() {
        let config = load(&[
            ("STORAGE_BACKEND", "supabase"),
            ("SUPABASE_URL", "https://proj.supabase.co/"),
            ("SUPABASE_BUCKET_NAME", "files"),
            ("SUPABASE_ACCESS_KEY_ID", "id"),
            ("SUPABASE_SECRET_ACCESS_KEY", "secret"),
            ("SUPABASE_PUBLIC_BUCKET", "true"),
        ])
        .unwrap();
        match config.storage.backend {
            BackendConfig::Supabase(s3) => {
                assert_eq!(s3.endpoint.as_deref(), Some("https://proj.supabase.co/storage/v1/s3"));
                assert_eq!(
                    s3.public_base_url.as_deref(),
                    Some("https://proj.supabase.co/storage/v1/object/public/files")
                );
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_worker_queue_selection() {
        let config = load(&[("WORKER_QUEUES", "image, document"), ("WORKER_ID", "box-1")]).unwrap();
        assert_eq!(config.worker.queues, vec![QueueName::Image, QueueName::Document]);
        assert_eq!(config.worker.worker_id, "box-1");

        assert!(load(&[("WORKER_QUEUES", "video")]).is_err());
        assert!(load(&[("STORAGE_BACKEND", "ftp")]).is_err());
    }
}
