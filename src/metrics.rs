use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("about_town_requests_total", "Total number of guarded requests").unwrap();
    pub static ref DENIED_TOTAL: CounterVec = register_counter_vec!(
        "about_town_denied_total",
        "Requests terminated by the admission pipeline",
        &["reason"]
    )
    .unwrap();
    pub static ref HONEYPOT_HITS: Counter =
        register_counter!("about_town_honeypot_hits_total", "Total honeypot hits").unwrap();
    pub static ref SUSPICIOUS_IPS: Gauge =
        register_gauge!("about_town_suspicious_ips", "IPs currently tracked by the suspicion ledger").unwrap();
    pub static ref CACHE_FALLBACKS: Counter = register_counter!(
        "about_town_cache_fallbacks_total",
        "Remote cache calls answered by the in-process store"
    )
    .unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("about_town_cache_hits_total", "Total response cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("about_town_cache_misses_total", "Total response cache misses").unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "about_town_upstream_latency_seconds",
        "Upstream request latency in seconds"
    )
    .unwrap();
}

pub fn denied(reason: &str) {
    DENIED_TOTAL.with_label_values(&[reason]).inc();
}
