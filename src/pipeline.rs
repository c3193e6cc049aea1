use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bot::{BotClassifier, BotDecision};
use crate::client::RequestFacts;
use crate::clock::SharedClock;
use crate::config::{GatewayConfig, StrictSettings};
use crate::error::Denial;
use crate::fingerprint::{FingerprintTracker, FloodLevel};
use crate::metrics::{self, REQUEST_TOTAL};
use crate::rate_limit::{RateLimiter, rate_limit_middleware};
use crate::suspicion::SuspicionLedger;
use crate::sweep::{LazySweeper, Sweep};

// Lowercased substrings of paths only vulnerability scanners ask for.
const SCAN_PATTERNS: &[&str] = &[
    ".php",
    ".asp",
    "/wp-",
    "/.env",
    "/.git",
    "/phpmyadmin",
    "/cgi-bin",
    "/etc/passwd",
    "/admin.",
    "..",
];

const SECURITY_HEADERS: [(HeaderName, &str); 5] = [
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'self'; frame-ancestors 'none'",
    ),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Proceed,
    Deny {
        denial: Denial,
        reason: &'static str,
    },
}

impl Admission {
    fn deny(denial: Denial, reason: &'static str) -> Self {
        Admission::Deny { denial, reason }
    }
}

pub fn is_scan_path(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    SCAN_PATTERNS.iter().any(|p| path.contains(p))
}

#[derive(Debug)]
pub struct Guard {
    classifier: BotClassifier,
    ledger: Arc<SuspicionLedger>,
    fingerprints: Arc<FingerprintTracker>,
    strict: StrictSettings,
    sweeper: LazySweeper,
    trust_proxy: bool,
}

impl Guard {
    // `extra_sweep` lets stores owned elsewhere (the local cache) share the sweep.
    pub fn new(config: &GatewayConfig, clock: SharedClock, extra_sweep: Vec<Arc<dyn Sweep>>) -> Self {
        let ledger = Arc::new(SuspicionLedger::new(config.suspicion, clock.clone()));
        let fingerprints = Arc::new(FingerprintTracker::new(config.fingerprint, clock.clone()));

        let mut sweeper = LazySweeper::new(config.sweep, clock)
            .with_target(ledger.clone())
            .with_target(fingerprints.clone());
        for target in extra_sweep {
            sweeper = sweeper.with_target(target);
        }

        Self {
            classifier: BotClassifier::default(),
            ledger,
            fingerprints,
            strict: config.strict.clone(),
            sweeper,
            trust_proxy: config.trust_proxy,
        }
    }

    pub fn ledger(&self) -> &Arc<SuspicionLedger> {
        &self.ledger
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintTracker> {
        &self.fingerprints
    }

    pub fn sweeper(&self) -> &LazySweeper {
        &self.sweeper
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    pub fn admit(&self, facts: &RequestFacts) -> Admission {
        let ip = facts.ip.as_str();
        if self.ledger.is_blocked(ip) {
            return Admission::deny(Denial::forbidden(), "blocked_ip");
        }

        let user_agent = facts.user_agent.as_deref();
        let classification = self.classifier.classify(user_agent, &facts.headers);
        if classification.decision == BotDecision::AllowCrawler {
            debug!(ip, crawler = classification.matched_pattern, "known crawler admitted");
            return Admission::Proceed;
        }

        if self.classifier.is_implausible(user_agent) {
            self.ledger.mark_suspicious(ip, "missing-user-agent");
            return Admission::deny(Denial::forbidden(), "missing_user_agent");
        }
        if let (BotDecision::Deny, Some(rule)) = (classification.decision, classification.matched_pattern) {
            self.ledger.mark_suspicious(ip, &format!("bot-user-agent:{rule}"));
            return Admission::deny(Denial::forbidden(), "bot_user_agent");
        }

        if self.strict.enabled {
            if let Some(denial) = self.strict_checks(facts) {
                return denial;
            }
        }

        let verdict = self.fingerprints.record(
            ip,
            user_agent.unwrap_or_default(),
            facts.accept_language.as_deref().unwrap_or_default(),
        );
        match verdict.level {
            FloodLevel::Flood => {
                self.ledger.mark_suspicious(ip, "request-flood");
                let retry = self.fingerprints.settings().window.as_secs().max(1);
                return Admission::deny(
                    Denial::too_many_requests(retry).with_message("Please slow down."),
                    "fingerprint_flood",
                );
            }
            FloodLevel::Elevated if verdict.newly_elevated => {
                self.ledger.mark_suspicious(ip, "request-flood");
            }
            _ => {}
        }

        Admission::Proceed
    }

    fn strict_checks(&self, facts: &RequestFacts) -> Option<Admission> {
        let ip = facts.ip.as_str();
        let missing_header = self
            .strict
            .expected_headers
            .iter()
            .any(|name| !facts.headers.contains_key(name.as_str()));
        if missing_header {
            self.ledger.mark_suspicious(ip, "missing-browser-headers");
        }
        if facts.query_params > self.strict.max_query_params {
            self.ledger.mark_suspicious(ip, "excessive-query-params");
        }
        if facts.url_len > self.strict.max_url_len {
            self.ledger.mark_suspicious(ip, "oversized-url");
        }
        if is_scan_path(&facts.path) {
            self.ledger.mark_suspicious(ip, "scan-path");
            return Some(Admission::deny(Denial::not_found(), "scan_path"));
        }
        None
    }
}

pub async fn admission_middleware(State(guard): State<Arc<Guard>>, req: Request, next: Next) -> Response {
    REQUEST_TOTAL.inc();
    guard.sweeper.on_request();

    let facts = RequestFacts::from_request(&req, guard.trust_proxy);
    match guard.admit(&facts) {
        Admission::Proceed => next.run(req).await,
        Admission::Deny { denial, reason } => {
            metrics::denied(reason);
            warn!(ip = %facts.ip, path = %facts.path, reason, status = denial.status.as_u16(), "request denied");
            denial.into_response()
        }
    }
}

pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

// Wraps `routes` in admission followed by each limiter, first limiter outermost.
pub fn protect<S>(routes: Router<S>, guard: Arc<Guard>, limiters: &[Arc<RateLimiter>]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let limited = limiters.iter().rev().fold(routes, |router, limiter| {
        router.layer(middleware::from_fn_with_state(
            Arc::clone(limiter),
            rate_limit_middleware,
        ))
    });
    limited.layer(middleware::from_fn_with_state(guard, admission_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::FingerprintSettings;
    use axum::http::{HeaderMap, Method, StatusCode};
    use std::time::Duration;

    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

    fn guard(config: GatewayConfig) -> Guard {
        Guard::new(&config, Arc::new(ManualClock::default()), Vec::new())
    }

    fn facts(ip: &str, ua: Option<&str>, path: &str) -> RequestFacts {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));
        RequestFacts {
            ip: ip.to_string(),
            method: Method::GET,
            path: path.to_string(),
            url_len: path.len(),
            query_params: 0,
            user_agent: ua.map(str::to_string),
            accept_language: Some("en-US".to_string()),
            headers,
        }
    }

    fn status(admission: &Admission) -> Option<StatusCode> {
        match admission {
            Admission::Proceed => None,
            Admission::Deny { denial, .. } => Some(denial.status),
        }
    }

    #[test]
    fn browser_proceeds_and_tools_are_refused() {
        let guard = guard(GatewayConfig::default());
        assert_eq!(guard.admit(&facts("1.1.1.1", Some(FIREFOX), "/api/bills")), Admission::Proceed);

        let curl = guard.admit(&facts("1.2.3.4", Some("curl/8.0"), "/api/bills"));
        assert_eq!(status(&curl), Some(StatusCode::FORBIDDEN));
        assert_eq!(guard.ledger().count("1.2.3.4"), 1);

        let missing = guard.admit(&facts("1.2.3.5", None, "/api/bills"));
        assert!(matches!(missing, Admission::Deny { reason: "missing_user_agent", .. }));
    }

    #[test]
    fn blocked_ip_is_refused_before_anything_else() {
        let guard = guard(GatewayConfig::default());
        for _ in 0..10 {
            guard.ledger().mark_suspicious("6.6.6.6", "honeypot");
        }
        let googlebot = facts("6.6.6.6", Some("Mozilla/5.0 (compatible; Googlebot/2.1)"), "/");
        assert!(matches!(guard.admit(&googlebot), Admission::Deny { reason: "blocked_ip", .. }));
    }

    #[test]
    fn crawlers_skip_strict_and_fingerprint_checks() {
        let mut config = GatewayConfig::default();
        config.strict.enabled = true;
        config.fingerprint = FingerprintSettings {
            window: Duration::from_secs(10),
            max_identical: 1,
        };
        let guard = guard(config);
        let mut crawler = facts("7.7.7.7", Some("Mozilla/5.0 (compatible; bingbot/2.0)"), "/wp-login.php");
        crawler.headers.clear();
        for _ in 0..5 {
            assert_eq!(guard.admit(&crawler), Admission::Proceed);
        }
        assert!(guard.fingerprints().is_empty());
        assert_eq!(guard.ledger().count("7.7.7.7"), 0);
    }

    #[test]
    fn strict_mode_flags_and_hides_scans() {
        let mut config = GatewayConfig::default();
        config.strict.enabled = true;
        let guard = guard(config);

        let mut bare = facts("8.8.8.8", Some(FIREFOX), "/api/bills");
        bare.headers.remove(header::ACCEPT_LANGUAGE);
        bare.query_params = 50;
        assert_eq!(guard.admit(&bare), Admission::Proceed);
        let entry = guard.ledger().entry("8.8.8.8").unwrap();
        assert_eq!(entry.count, 2);
        assert!(entry.reasons.contains("missing-browser-headers"));
        assert!(entry.reasons.contains("excessive-query-params"));

        let scan = guard.admit(&facts("8.8.4.4", Some(FIREFOX), "/WP-ADMIN/setup-config.php"));
        assert_eq!(status(&scan), Some(StatusCode::NOT_FOUND));
        assert_eq!(guard.ledger().count("8.8.4.4"), 1);
    }

    #[test]
    fn scan_paths_are_ignored_outside_strict_mode() {
        let guard = guard(GatewayConfig::default());
        assert_eq!(guard.admit(&facts("8.8.4.4", Some(FIREFOX), "/.env")), Admission::Proceed);
    }

    #[test]
    fn fingerprint_flags_then_refuses() {
        let mut config = GatewayConfig::default();
        config.fingerprint = FingerprintSettings {
            window: Duration::from_secs(10),
            max_identical: 5,
        };
        let guard = guard(config);
        let request = facts("9.9.9.9", Some(FIREFOX), "/api/bills");

        for _ in 0..6 {
            assert_eq!(guard.admit(&request), Admission::Proceed);
        }
        assert_eq!(guard.ledger().count("9.9.9.9"), 1);

        for _ in 0..4 {
            assert_eq!(guard.admit(&request), Admission::Proceed);
        }
        let flood = guard.admit(&request);
        assert_eq!(status(&flood), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(guard.ledger().count("9.9.9.9"), 2);
        assert!(!guard.ledger().is_blocked("9.9.9.9"));
    }

    #[test]
    fn scan_pattern_matching() {
        assert!(is_scan_path("/wp-login.php"));
        assert!(is_scan_path("/static/../../etc/passwd"));
        assert!(is_scan_path("/.git/config"));
        assert!(!is_scan_path("/api/bills/hb-12/comments"));
    }
}
