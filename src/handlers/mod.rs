mod health;
mod honeypot;
mod metrics;
mod proxy;

pub use health::health_handler;
pub use honeypot::{HONEYPOT_WEIGHT, honeypot_handler};
pub use metrics::metrics_handler;
pub use proxy::{CachedResponse, not_found_handler, proxy_handler};
