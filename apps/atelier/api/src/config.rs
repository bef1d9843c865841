//! Application configuration from environment variables.

use core_config::{env_or_default, env_parse_or, ConfigError, FromEnv};
use core_config::server::ServerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// All knobs of the execution plane, with their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: core_config::Environment,
    pub server: ServerConfig,

    /// Fixed runtime URL override; bypasses container supervision.
    pub comfyui_url: Option<String>,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub queue_path: PathBuf,
    pub database_url: PathBuf,
    /// Workflow template served by `/api/generate`.
    pub workflow_path: Option<PathBuf>,
    pub workflow_id: String,

    pub max_queue_size: usize,
    pub max_ws_connections: usize,
    pub max_concurrent_tasks: usize,
    pub task_timeout: Duration,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_threshold: usize,

    /// When set, non-health endpoints require this key in `X-API-Key`.
    pub api_key: Option<String>,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        let tmp = std::env::temp_dir();

        let task_timeout_secs: f64 = env_parse_or("TASK_TIMEOUT", 300.0)?;

        Ok(Self {
            environment: core_config::Environment::from_env(),
            server: ServerConfig::from_env()?,
            comfyui_url: std::env::var("COMFYUI_URL").ok().filter(|v| !v.is_empty()),
            output_dir: env_or_default("OUTPUT_DIR", &tmp.join("outputs").to_string_lossy()).into(),
            input_dir: env_or_default("INPUT_DIR", &tmp.join("inputs").to_string_lossy()).into(),
            queue_path: env_or_default("QUEUE_PATH", &tmp.join("task_queue").to_string_lossy())
                .into(),
            database_url: env_or_default("DATABASE_URL", &tmp.join("atelier.db").to_string_lossy())
                .into(),
            workflow_path: std::env::var("WORKFLOW_PATH").ok().map(PathBuf::from),
            workflow_id: env_or_default("WORKFLOW_ID", "default"),
            max_queue_size: env_parse_or("MAX_QUEUE_SIZE", 1000)?,
            max_ws_connections: env_parse_or("MAX_WS_CONNECTIONS", 100)?,
            max_concurrent_tasks: env_parse_or("MAX_CONCURRENT_TASKS", 2)?,
            task_timeout: Duration::from_secs_f64(task_timeout_secs),
            min_workers: env_parse_or("MIN_WORKERS", 1)?,
            max_workers: env_parse_or("MAX_WORKERS", 4)?,
            scale_threshold: env_parse_or("SCALE_THRESHOLD", 5)?,
            api_key: std::env::var("API_KEY").ok().filter(|v| !v.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("MAX_QUEUE_SIZE", None::<&str>),
                ("TASK_TIMEOUT", None),
                ("MIN_WORKERS", None),
                ("COMFYUI_URL", None),
                ("API_KEY", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.max_queue_size, 1000);
                assert_eq!(config.max_ws_connections, 100);
                assert_eq!(config.max_concurrent_tasks, 2);
                assert_eq!(config.task_timeout, Duration::from_secs(300));
                assert_eq!(config.min_workers, 1);
                assert_eq!(config.max_workers, 4);
                assert_eq!(config.scale_threshold, 5);
                assert!(config.comfyui_url.is_none());
                assert!(config.api_key.is_none());
                assert_eq!(config.workflow_id, "default");
            },
        );
    }

    #[test]
    fn test_overrides() {
        temp_env::with_vars(
            [
                ("MAX_QUEUE_SIZE", Some("10")),
                ("TASK_TIMEOUT", Some("12.5")),
                ("COMFYUI_URL", Some("http://10.0.0.5:8188")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.max_queue_size, 10);
                assert_eq!(config.task_timeout, Duration::from_secs_f64(12.5));
                assert_eq!(config.comfyui_url.as_deref(), Some("http://10.0.0.5:8188"));
            },
        );
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        temp_env::with_var("MAX_QUEUE_SIZE", Some("lots"), || {
            assert!(Config::from_env().is_err());
        });
    }
}
