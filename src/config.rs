use clap::Parser;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fingerprint::FingerprintSettings;
use crate::suspicion::SuspicionSettings;
use crate::sweep::SweepTrigger;

// CLI argument structure; every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "about-town-gateway")]
#[command(about = "Request admission and anti-abuse gateway for the About Town API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Upstream API servers (comma-separated)
    // Example: "localhost:3001,localhost:3002"
    #[arg(short, long, env = "UPSTREAM_URLS", default_value = "")]
    pub upstreams: String,

    // Upstream health check interval in seconds
    #[arg(long, env = "UPSTREAM_HEALTH_INTERVAL", default_value_t = 30)]
    pub health_interval: u64,

    // Redis REST endpoint; unset keeps the cache in memory
    #[arg(long, env = "UPSTASH_REDIS_REST_URL")]
    pub cache_url: Option<String>,

    #[arg(long, env = "UPSTASH_REDIS_REST_TOKEN", hide_env_values = true)]
    pub cache_token: Option<String>,

    #[arg(long, env = "CACHE_TIMEOUT_MS", default_value_t = 400)]
    pub cache_timeout_ms: u64,

    // Cache TTL in seconds for proxied GET responses
    #[arg(short, long, env = "CACHE_TTL", default_value_t = 300)]
    pub cache_ttl: u64,

    // Rate limit max requests per window
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 100)]
    pub rate_limit: u64,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value_t = 900)]
    pub rate_window: u64,

    // Same, for POST/PUT/PATCH/DELETE
    #[arg(long, env = "STRICT_RATE_LIMIT_MAX", default_value_t = 20)]
    pub strict_rate_limit: u64,

    #[arg(long, env = "STRICT_RATE_LIMIT_WINDOW", default_value_t = 900)]
    pub strict_rate_window: u64,

    #[arg(long, env = "BLOCK_THRESHOLD", default_value_t = 10)]
    pub block_threshold: u32,

    // Seconds a blocked IP stays blocked after its last suspicious event
    #[arg(long, env = "BLOCK_DURATION", default_value_t = 3600)]
    pub block_duration: u64,

    #[arg(long, env = "IDLE_EVICTION_WINDOW", default_value_t = 86_400)]
    pub idle_eviction: u64,

    #[arg(long, env = "FINGERPRINT_WINDOW_MS", default_value_t = 10_000)]
    pub fingerprint_window_ms: u64,

    #[arg(long, env = "FINGERPRINT_MAX_IDENTICAL", default_value_t = 20)]
    pub fingerprint_max: usize,

    #[arg(long, env = "STRICT_MODE", default_value_t = false)]
    pub strict_mode: bool,

    #[arg(long, env = "HONEYPOT_DELAY_MS", default_value_t = 3000)]
    pub honeypot_delay_ms: u64,

    #[arg(long, env = "SWEEP_PROBABILITY", default_value_t = 0.01)]
    pub sweep_probability: f64,

    // Deterministic sweep every N requests, overrides the probability
    #[arg(long, env = "SWEEP_EVERY")]
    pub sweep_every: Option<u64>,

    #[arg(long, env = "TRUST_PROXY", default_value_t = true, action = clap::ArgAction::Set)]
    pub trust_proxy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrictSettings {
    pub enabled: bool,
    pub expected_headers: Vec<String>,
    pub max_query_params: usize,
    pub max_url_len: usize,
}

impl Default for StrictSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            expected_headers: vec!["accept".to_string(), "accept-language".to_string()],
            max_query_params: 20,
            max_url_len: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoneypotSettings {
    pub delay: Duration,
    pub paths: Vec<String>,
}

impl Default for HoneypotSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            paths: [
                "/api/admin/export",
                "/api/internal/users",
                "/api/v0/bills/all",
                "/hidden/sitemap-full.xml",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCacheConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub port: u16,
    pub upstreams: Vec<String>,
    pub health_interval: Duration,
    pub remote_cache: Option<RemoteCacheConfig>,
    pub cache_timeout: Duration,
    pub cache_ttl: u64,
    pub api_rate: RateLimitSettings,
    pub strict_rate: RateLimitSettings,
    pub suspicion: SuspicionSettings,
    pub fingerprint: FingerprintSettings,
    pub strict: StrictSettings,
    pub honeypot: HoneypotSettings,
    pub sweep: SweepTrigger,
    pub trust_proxy: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            upstreams: Vec::new(),
            health_interval: Duration::from_secs(30),
            remote_cache: None,
            cache_timeout: Duration::from_millis(400),
            cache_ttl: 300,
            api_rate: RateLimitSettings {
                max_requests: 100,
                window: Duration::from_secs(900),
            },
            strict_rate: RateLimitSettings {
                max_requests: 20,
                window: Duration::from_secs(900),
            },
            suspicion: SuspicionSettings::default(),
            fingerprint: FingerprintSettings::default(),
            strict: StrictSettings::default(),
            honeypot: HoneypotSettings::default(),
            sweep: SweepTrigger::default(),
            trust_proxy: true,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("rate window", self.api_rate.window.is_zero()),
            ("rate limit", self.api_rate.max_requests == 0),
            ("strict rate window", self.strict_rate.window.is_zero()),
            ("strict rate limit", self.strict_rate.max_requests == 0),
            ("block threshold", self.suspicion.block_threshold == 0),
            ("block duration", self.suspicion.block_duration.is_zero()),
            ("idle eviction window", self.suspicion.idle_eviction.is_zero()),
            ("fingerprint window", self.fingerprint.window.is_zero()),
            ("fingerprint max", self.fingerprint.max_identical == 0),
            ("health interval", self.health_interval.is_zero()),
            ("cache timeout", self.cache_timeout.is_zero()),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(name));
        }

        if let SweepTrigger::Probabilistic(p) = self.sweep {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::SweepProbability(p));
            }
        }
        if self.cache_timeout >= Duration::from_millis(500) {
            return Err(ConfigError::CacheTimeout(self.cache_timeout));
        }
        if let Some(bad) = self.upstreams.iter().find(|u| reqwest::Url::parse(u).is_err()) {
            return Err(ConfigError::Upstream(bad.clone()));
        }
        Ok(())
    }
}

// Add http:// if not present
fn normalize_upstream(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", url.trim_end_matches('/'))
    }
}

impl TryFrom<Args> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let remote_cache = match (args.cache_url, args.cache_token) {
            (Some(url), Some(token)) if !url.is_empty() => Some(RemoteCacheConfig { url, token }),
            (Some(url), None) if !url.is_empty() => return Err(ConfigError::MissingCacheToken),
            _ => None,
        };
        let sweep = match args.sweep_every {
            Some(every) if every > 0 => SweepTrigger::EveryNth(every),
            _ => SweepTrigger::Probabilistic(args.sweep_probability),
        };

        let config = GatewayConfig {
            port: args.port,
            upstreams: args
                .upstreams
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(normalize_upstream)
                .collect(),
            health_interval: Duration::from_secs(args.health_interval),
            remote_cache,
            cache_timeout: Duration::from_millis(args.cache_timeout_ms),
            cache_ttl: args.cache_ttl,
            api_rate: RateLimitSettings {
                max_requests: args.rate_limit,
                window: Duration::from_secs(args.rate_window),
            },
            strict_rate: RateLimitSettings {
                max_requests: args.strict_rate_limit,
                window: Duration::from_secs(args.strict_rate_window),
            },
            suspicion: SuspicionSettings {
                block_threshold: args.block_threshold,
                block_duration: Duration::from_secs(args.block_duration),
                idle_eviction: Duration::from_secs(args.idle_eviction),
            },
            fingerprint: FingerprintSettings {
                window: Duration::from_millis(args.fingerprint_window_ms),
                max_identical: args.fingerprint_max,
            },
            strict: StrictSettings {
                enabled: args.strict_mode,
                ..StrictSettings::default()
            },
            honeypot: HoneypotSettings {
                delay: Duration::from_millis(args.honeypot_delay_ms),
                ..HoneypotSettings::default()
            },
            sweep,
            trust_proxy: args.trust_proxy,
        };
        config.validate()?;
        Ok(config)
    }
}
