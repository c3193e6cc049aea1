use std::sync::Arc;

use crate::cache::{Cache, RestBackend};
use crate::clock::SharedClock;
use crate::config::GatewayConfig;
use crate::load_balancer::LoadBalancer;
use crate::pipeline::Guard;
use crate::rate_limit::{RateLimitOptions, RateLimiter};
use crate::sweep::Sweep;

// App's shared state, built once at startup and handed to every layer.
// Nothing here is shared between processes unless the remote cache is configured.
#[derive(Debug)]
pub struct AppState {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
    pub cache: Arc<Cache>,
    pub guard: Arc<Guard>,
    pub api_limiter: Arc<RateLimiter>,
    pub strict_limiter: Arc<RateLimiter>,
    pub load_balancer: Option<Arc<LoadBalancer>>,
}

impl AppState {
    pub fn new(config: GatewayConfig, clock: SharedClock) -> Result<Self, reqwest::Error> {
        // Redirects go back to the caller untouched
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let cache = Arc::new(match &config.remote_cache {
            Some(remote) => Cache::with_remote(
                RestBackend::new(client.clone(), &remote.url, &remote.token, config.cache_timeout),
                clock.clone(),
            ),
            None => Cache::in_memory(clock.clone()),
        });

        let local_cache: Arc<dyn Sweep> = cache.local_store();
        let guard = Arc::new(Guard::new(&config, clock.clone(), vec![local_cache]));

        let api_options = RateLimitOptions::new(config.api_rate.max_requests, config.api_rate.window)
            .trust_proxy(config.trust_proxy);
        let mut strict_options = RateLimitOptions::strict().trust_proxy(config.trust_proxy);
        strict_options.max_requests = config.strict_rate.max_requests;
        strict_options.window = config.strict_rate.window;

        Ok(Self {
            api_limiter: Arc::new(RateLimiter::new("api", api_options, clock.clone())),
            strict_limiter: Arc::new(RateLimiter::new("strict", strict_options, clock)),
            load_balancer: LoadBalancer::new(&config.upstreams).map(Arc::new),
            client,
            cache,
            guard,
            config,
        })
    }

    pub fn limiters(&self) -> [Arc<RateLimiter>; 2] {
        [Arc::clone(&self.api_limiter), Arc::clone(&self.strict_limiter)]
    }
}
