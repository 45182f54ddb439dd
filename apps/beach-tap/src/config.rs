use std::env;
use std::time::Duration;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;
pub const DEFAULT_VIEWER_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 2_592_000; // 30 days

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub redis_url: String,
    /// Keep session records in process memory instead of Redis. Targets do
    /// not survive a restart in this mode.
    pub ephemeral: bool,
    /// Always non-zero.
    pub session_ttl_seconds: u64,
    pub log_capacity: usize,
    /// Events queued per viewer before it is considered stalled and dropped.
    pub viewer_queue_capacity: usize,
    pub forward_timeout_seconds: u64,
    /// Zero disables idle suspension.
    pub idle_suspend_seconds: u64,
    pub public_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unparseable values
    /// fall back to defaults.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            host: var("BEACH_TAP_HOST").unwrap_or(defaults.host),
            port: var("BEACH_TAP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: var("REDIS_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.redis_url),
            ephemeral: var("BEACH_TAP_EPHEMERAL")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            session_ttl_seconds: var("SESSION_TTL")
                .and_then(|t| t.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(defaults.session_ttl_seconds),
            log_capacity: var("TAP_LOG_CAPACITY")
                .and_then(|val| val.parse::<usize>().ok())
                .unwrap_or(defaults.log_capacity)
                .max(1),
            viewer_queue_capacity: var("TAP_VIEWER_QUEUE_CAPACITY")
                .and_then(|val| val.parse::<usize>().ok())
                .unwrap_or(defaults.viewer_queue_capacity)
                .max(1),
            forward_timeout_seconds: var("TAP_FORWARD_TIMEOUT_SECS")
                .and_then(|t| t.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(defaults.forward_timeout_seconds),
            idle_suspend_seconds: var("TAP_IDLE_SUSPEND_SECS")
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.idle_suspend_seconds),
            public_url: var("BEACH_TAP_PUBLIC_URL").filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_suspend_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Base URL advertised in proxy and viewer links.
    pub fn public_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            ephemeral: false,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            log_capacity: DEFAULT_LOG_CAPACITY,
            viewer_queue_capacity: DEFAULT_VIEWER_QUEUE_CAPACITY,
            forward_timeout_seconds: 30,
            idle_suspend_seconds: 900,
            public_url: None,
        }
    }
}
