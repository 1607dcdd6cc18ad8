//! Engine configuration.
//!
//! Loaded from the environment the way the surface layers hand it over;
//! every knob has a process-level override on [`crate::ProcessBuilder`].

use std::path::PathBuf;
use std::time::Duration;

use crate::hash::CacheMode;

/// Per-task error routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStrategy {
    /// Abort the session on the first failed firing.
    #[default]
    Terminate,
    /// Log and keep going; the failed firing binds nothing.
    Ignore,
    /// Resubmit a fresh attempt up to the cap, then terminate.
    Retry { max_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Backend name: `local`, `slurm`, `native`.
    pub executor: String,
    /// Per-process parallelism cap; defaults to the pool size.
    pub max_forks: usize,
    /// Per-task walltime.
    pub max_duration: Option<Duration>,
    /// Container image; switches env handling and adds mounts.
    pub container: Option<String>,
    /// Appended verbatim to grid submit argv.
    pub cluster_options: Vec<String>,
    /// Grid queue name.
    pub queue: Option<String>,
    pub cache: CacheMode,
    /// Cache hits are only honored when resuming.
    pub resume: bool,
    /// Skip execution when prior artifacts exist here.
    pub store_dir: Option<PathBuf>,
    pub error_strategy: ErrorStrategy,
    /// Monitor admission capacity per backend.
    pub queue_size: usize,
    /// Handler poll cadence.
    pub poll_interval: Duration,
    /// Grid queue-snapshot refresh cadence.
    pub queue_stat_interval: Duration,
    /// How long a grid task may sit without `.exitcode` after leaving the
    /// queue before it is declared failed.
    pub exit_read_grace: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            executor: "local".to_string(),
            max_forks: num_cpus::get().max(1),
            max_duration: None,
            container: None,
            cluster_options: Vec::new(),
            queue: None,
            cache: CacheMode::Standard,
            resume: false,
            store_dir: None,
            error_strategy: ErrorStrategy::Terminate,
            queue_size: 100,
            poll_interval: Duration::from_millis(50),
            queue_stat_interval: Duration::from_secs(1),
            exit_read_grace: Duration::from_secs(90),
        }
    }
}

impl ExecConfig {
    /// Load configuration from `WEIR_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(executor) = std::env::var("WEIR_EXECUTOR") {
            config.executor = executor;
        }
        if let Some(max_forks) = env_parse::<usize>("WEIR_MAX_FORKS") {
            config.max_forks = max_forks.max(1);
        }
        if let Some(ms) = env_parse::<u64>("WEIR_MAX_DURATION_MS") {
            config.max_duration = Some(Duration::from_millis(ms));
        }
        if let Ok(container) = std::env::var("WEIR_CONTAINER") {
            if !container.is_empty() {
                config.container = Some(container);
            }
        }
        if let Ok(opts) = std::env::var("WEIR_CLUSTER_OPTIONS") {
            config.cluster_options = opts.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(queue) = std::env::var("WEIR_QUEUE") {
            if !queue.is_empty() {
                config.queue = Some(queue);
            }
        }
        if let Ok(mode) = std::env::var("WEIR_CACHE") {
            if let Some(mode) = CacheMode::parse(&mode) {
                config.cache = mode;
            }
        }
        if let Some(size) = env_parse::<usize>("WEIR_QUEUE_SIZE") {
            config.queue_size = size.max(1);
        }
        if let Some(ms) = env_parse::<u64>("WEIR_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_parse::<u64>("WEIR_QUEUE_STAT_INTERVAL_MS") {
            config.queue_stat_interval = Duration::from_millis(ms.max(1));
        }
        config
    }

    /// Effective walltime as `HH:MM:SS` for grid submit flags.
    pub fn walltime_spec(duration: Duration) -> String {
        let secs = duration.as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pool() {
        let config = ExecConfig::default();
        assert_eq!(config.executor, "local");
        assert_eq!(config.max_forks, num_cpus::get().max(1));
        assert!(config.cache.enabled());
        assert!(!config.resume);
    }

    #[test]
    fn walltime_formats_hms() {
        assert_eq!(
            ExecConfig::walltime_spec(Duration::from_secs(3661)),
            "01:01:01"
        );
        assert_eq!(
            ExecConfig::walltime_spec(Duration::from_millis(50)),
            "00:00:00"
        );
    }
}
