use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, interval};
use tracing::{info, warn};

// Single upstream API server
#[derive(Debug)]
pub struct Upstream {
    pub url: String,
    healthy: AtomicBool,
}

impl Upstream {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

// Round-robin over the upstream API servers
#[derive(Debug)]
pub struct LoadBalancer {
    upstreams: Vec<Arc<Upstream>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Urls are expected normalized (see `config`). `None` when the list is empty.
    pub fn new(urls: &[String]) -> Option<Self> {
        if urls.is_empty() {
            return None;
        }
        let upstreams: Vec<Arc<Upstream>> = urls
            .iter()
            .map(|url| Arc::new(Upstream::new(url.clone())))
            .collect();

        for (i, u) in upstreams.iter().enumerate() {
            info!(index = i + 1, url = %u.url, "upstream registered");
        }

        Some(Self {
            upstreams,
            current: AtomicUsize::new(0),
        })
    }

    // Get next healthy upstream (round-robin)
    pub fn get_upstream(&self) -> Option<Arc<Upstream>> {
        let len = self.upstreams.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|i| &self.upstreams[(start + i) % len])
            .find(|u| u.is_healthy())
            .map(Arc::clone)
    }

    pub fn all_upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }
}

// Health check loop; the About Town API answers GET /health
pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    check_interval: Duration,
) {
    let mut interval = interval(check_interval);
    info!(interval = ?check_interval, "upstream health checker started");

    loop {
        interval.tick().await;

        for upstream in load_balancer.all_upstreams() {
            let url = format!("{}/health", upstream.url);
            let was_healthy = upstream.is_healthy();

            let is_healthy = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            upstream.set_healthy(is_healthy);

            // Log status changes
            if was_healthy != is_healthy {
                if is_healthy {
                    info!(url = %upstream.url, "upstream is healthy again");
                } else {
                    warn!(url = %upstream.url, "upstream is unhealthy");
                }
            }
        }
    }
}
