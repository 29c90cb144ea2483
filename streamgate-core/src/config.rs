//! Centralized configuration for Streamgate.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Streamgate components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub cookies: CookieConfig,
    pub processing: ProcessingConfig,
    pub network: NetworkConfig,
    pub cluster: ClusterConfig,
}

/// Cookie store persistence and rotation configuration.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    /// Path to the JSON cookie file (None disables persistence)
    pub path: Option<PathBuf>,
    /// How often the dirty table is flushed back to disk
    pub flush_interval: Duration,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval: Duration::from_secs(60),
        }
    }
}

/// External media-processing subprocess configuration.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Processing binary invoked for remux/convert work
    pub ffmpeg_path: String,
    /// Optional niceness level the subprocess is wrapped with
    pub nice_level: Option<i32>,
    /// Grace window between cooperative and forceful termination
    pub kill_grace: Duration,
    /// Size of chunks read from the subprocess output pipe
    pub chunk_size: usize,
    /// Bounded channel depth between the pipe reader and the response
    pub pipe_depth: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            nice_level: None,
            kill_grace: Duration::from_secs(5),
            chunk_size: 256 * 1024, // 256 KiB
            pipe_depth: 16,
        }
    }
}

/// Upstream HTTP request configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// User agent presented to upstream origins
    pub user_agent: &'static str,
    /// Timeout for length-estimation probes
    pub probe_timeout: Duration,
    /// Maximum redirect hops followed on the proxy path
    pub max_redirects: usize,
    /// Connect timeout for upstream requests
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
            probe_timeout: Duration::from_secs(3),
            max_redirects: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Multi-process deployment configuration.
///
/// When clustering is enabled exactly one process is the primary: it owns
/// the durable cookie file and relays point updates between workers.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Whether this deployment runs more than one process
    pub enabled: bool,
    /// Whether this process is the authoritative primary
    pub primary: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            primary: true,
        }
    }
}

impl GatewayConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STREAMGATE_COOKIE_PATH") {
            config.cookies.path = Some(PathBuf::from(path));
        }

        if let Ok(interval) = std::env::var("STREAMGATE_COOKIE_FLUSH_SECS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.cookies.flush_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(path) = std::env::var("STREAMGATE_FFMPEG_PATH") {
            config.processing.ffmpeg_path = path;
        }

        if let Ok(nice) = std::env::var("STREAMGATE_PROCESSING_PRIORITY") {
            if let Ok(level) = nice.parse::<i32>() {
                config.processing.nice_level = Some(level);
            }
        }

        if let Ok(redirects) = std::env::var("STREAMGATE_MAX_REDIRECTS") {
            if let Ok(count) = redirects.parse::<usize>() {
                config.network.max_redirects = count;
            }
        }

        if let Ok(enabled) = std::env::var("STREAMGATE_CLUSTER_MODE") {
            config.cluster.enabled = enabled.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            cookies: CookieConfig {
                path: None,
                flush_interval: Duration::from_millis(50),
            },
            processing: ProcessingConfig {
                kill_grace: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = GatewayConfig::default();

        assert_eq!(config.cookies.flush_interval, Duration::from_secs(60));
        assert_eq!(config.processing.ffmpeg_path, "ffmpeg");
        assert_eq!(config.processing.kill_grace, Duration::from_secs(5));
        assert_eq!(config.network.max_redirects, 10);
        assert!(config.processing.nice_level.is_none());
        assert!(!config.cluster.enabled);
        assert!(config.cluster.primary);
    }

    #[test]
    fn test_testing_preset() {
        let config = GatewayConfig::for_testing();
        assert!(config.cookies.path.is_none());
        assert!(config.cookies.flush_interval < Duration::from_secs(1));
        assert!(config.processing.kill_grace < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("STREAMGATE_COOKIE_PATH", "/tmp/cookies.json");
            std::env::set_var("STREAMGATE_COOKIE_FLUSH_SECS", "120");
            std::env::set_var("STREAMGATE_PROCESSING_PRIORITY", "10");
            std::env::set_var("STREAMGATE_MAX_REDIRECTS", "4");
            std::env::set_var("STREAMGATE_CLUSTER_MODE", "true");
        }

        let config = GatewayConfig::from_env();

        assert_eq!(
            config.cookies.path,
            Some(PathBuf::from("/tmp/cookies.json"))
        );
        assert_eq!(config.cookies.flush_interval, Duration::from_secs(120));
        assert_eq!(config.processing.nice_level, Some(10));
        assert_eq!(config.network.max_redirects, 4);
        assert!(config.cluster.enabled);

        // Cleanup
        unsafe {
            std::env::remove_var("STREAMGATE_COOKIE_PATH");
            std::env::remove_var("STREAMGATE_COOKIE_FLUSH_SECS");
            std::env::remove_var("STREAMGATE_PROCESSING_PRIORITY");
            std::env::remove_var("STREAMGATE_MAX_REDIRECTS");
            std::env::remove_var("STREAMGATE_CLUSTER_MODE");
        }
    }
}
