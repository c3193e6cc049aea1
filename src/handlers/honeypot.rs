use axum::{Json, extract::Request, extract::State};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::client;
use crate::metrics::HONEYPOT_HITS;
use crate::state::AppState;

// Suspicion events recorded per hit
pub const HONEYPOT_WEIGHT: u32 = 3;

const CHAMBERS: &[&str] = &["HB", "SB", "AB", "HR", "SJR"];
const TOPICS: &[&str] = &[
    "Relating to county transit funding",
    "Relating to school district boundaries",
    "Relating to short-term rental permits",
    "Relating to public records retention",
    "Relating to wildfire mitigation grants",
    "Relating to municipal broadband",
    "Relating to property tax exemptions for veterans",
];
const STATUSES: &[&str] = &["introduced", "in committee", "passed house", "passed senate", "signed"];

// Configured delay plus up to half again
fn jittered(delay: Duration) -> Duration {
    let extra_ms = delay.as_millis() as u64 / 2;
    if extra_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
}

fn decoy_bills() -> Value {
    let mut rng = rand::thread_rng();
    let count = rng.gen_range(8..16);
    let bills: Vec<Value> = (0..count)
        .map(|_| {
            let chamber = CHAMBERS.choose(&mut rng).copied().unwrap_or("HB");
            let updated = Utc::now() - ChronoDuration::days(rng.gen_range(1..90));
            json!({
                "id": rng.gen_range(10_000..100_000),
                "identifier": format!("{chamber} {}", rng.gen_range(1..2_000)),
                "title": TOPICS.choose(&mut rng).copied().unwrap_or_default(),
                "status": STATUSES.choose(&mut rng).copied().unwrap_or_default(),
                "updatedAt": updated.to_rfc3339(),
            })
        })
        .collect();
    json!({ "data": bills, "page": 1, "total": count })
}

pub async fn honeypot_handler(State(state): State<Arc<AppState>>, req: Request) -> Json<Value> {
    HONEYPOT_HITS.inc();
    let ip = client::request_ip(&req, state.config.trust_proxy);
    let ledger = state.guard.ledger();
    for _ in 0..HONEYPOT_WEIGHT {
        ledger.mark_suspicious(&ip, "honeypot");
    }
    warn!(ip = %ip, path = %req.uri().path(), count = ledger.count(&ip), "honeypot hit");

    let delay = jittered(state.config.honeypot.delay);
    tokio::time::sleep(delay).await;
    Json(decoy_bills())
}
