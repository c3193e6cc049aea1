mod memory;
mod remote;

pub use memory::{CacheEntry, MemoryStore};
pub use remote::RestBackend;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::clock::SharedClock;
use crate::error::CacheError;
use crate::metrics::CACHE_FALLBACKS;

#[derive(Debug)]
pub(crate) enum CacheOutcome<T> {
    Remote(T),
    Local(T),
    Fallback { value: T, cause: CacheError },
}

impl<T> CacheOutcome<T> {
    pub(crate) fn into_value(self) -> T {
        match self {
            CacheOutcome::Remote(v) | CacheOutcome::Local(v) => v,
            CacheOutcome::Fallback { value, .. } => value,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_fallback(&self) -> bool {
        matches!(self, CacheOutcome::Fallback { .. })
    }
}

#[derive(Debug)]
pub struct Cache {
    remote: Option<RestBackend>,
    local: Arc<MemoryStore>,
}

impl Cache {
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            remote: None,
            local: Arc::new(MemoryStore::new(clock)),
        }
    }

    pub fn with_remote(remote: RestBackend, clock: SharedClock) -> Self {
        Self {
            remote: Some(remote),
            local: Arc::new(MemoryStore::new(clock)),
        }
    }

    pub fn backend(&self) -> &'static str {
        if self.remote.is_some() { "remote" } else { "memory" }
    }

    // Handed to the sweeper so expired local entries get reclaimed.
    pub fn local_store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.local)
    }

    fn fallback<T>(&self, op: &'static str, key: &str, cause: CacheError, local: impl FnOnce() -> T) -> CacheOutcome<T> {
        CACHE_FALLBACKS.inc();
        warn!(op, key, error = %cause, "remote cache unavailable, using in-process store");
        CacheOutcome::Fallback {
            value: local(),
            cause,
        }
    }

    pub(crate) async fn get_raw(&self, key: &str) -> CacheOutcome<Option<String>> {
        let Some(remote) = &self.remote else {
            return CacheOutcome::Local(self.local.get(key));
        };
        match remote.get(key).await {
            Ok(value) => CacheOutcome::Remote(value),
            Err(cause) => self.fallback("get", key, cause, || self.local.get(key)),
        }
    }

    pub(crate) async fn set_raw(&self, key: &str, value: String, ttl_secs: u64) -> CacheOutcome<()> {
        let Some(remote) = &self.remote else {
            return CacheOutcome::Local(self.local.set(key, value, ttl_secs));
        };
        match remote.set(key, &value, ttl_secs).await {
            Ok(()) => CacheOutcome::Remote(()),
            Err(cause) => self.fallback("set", key, cause, || self.local.set(key, value, ttl_secs)),
        }
    }

    pub(crate) async fn delete_raw(&self, key: &str) -> CacheOutcome<()> {
        let Some(remote) = &self.remote else {
            return CacheOutcome::Local(self.local.delete(key));
        };
        match remote.delete(key).await {
            Ok(()) => CacheOutcome::Remote(()),
            Err(cause) => self.fallback("delete", key, cause, || self.local.delete(key)),
        }
    }

    pub(crate) async fn incr_raw(&self, key: &str, ttl_secs: u64) -> CacheOutcome<u64> {
        let Some(remote) = &self.remote else {
            return CacheOutcome::Local(self.local.incr(key, ttl_secs));
        };
        match remote.incr(key, ttl_secs).await {
            Ok(count) => CacheOutcome::Remote(count),
            Err(cause) => self.fallback("incr", key, cause, || self.local.incr(key, ttl_secs)),
        }
    }

    pub(crate) async fn ttl_raw(&self, key: &str) -> CacheOutcome<i64> {
        let Some(remote) = &self.remote else {
            return CacheOutcome::Local(self.local.ttl(key));
        };
        match remote.ttl(key).await {
            Ok(secs) => CacheOutcome::Remote(secs),
            Err(cause) => self.fallback("ttl", key, cause, || self.local.ttl(key)),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await.into_value()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    // Stores `value` as JSON. A zero TTL stores without expiry.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        match serde_json::to_string(value) {
            Ok(json) => self.set_raw(key, json, ttl_secs).await.into_value(),
            Err(e) => warn!(key, error = %e, "value not cacheable"),
        }
    }

    pub async fn delete(&self, key: &str) {
        self.delete_raw(key).await.into_value()
    }

    // Increments a counter. The TTL only applies when this call creates it.
    pub async fn incr(&self, key: &str, ttl_secs: u64) -> u64 {
        assert!(ttl_secs > 0, "incr needs a positive ttl (key {key:?})");
        self.incr_raw(key, ttl_secs).await.into_value()
    }

    // Seconds until `key` expires; `-1` without expiry, `-2` when absent.
    pub async fn ttl(&self, key: &str) -> i64 {
        self.ttl_raw(key).await.into_value()
    }
}

// Create a cache key (hash of method + path and query)
pub fn make_cache_key(method: &str, path_and_query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method);
    hasher.update(b" ");
    hasher.update(path_and_query);
    format!("response:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    // Minimal Redis REST server: enough of GET/SET/DEL/INCR/EXPIRE/TTL and
    // /pipeline to exercise the wire path. TTLs are recorded, not enforced.
    #[derive(Default)]
    struct FakeRedis {
        down: AtomicBool,
        slow: AtomicBool,
        failing: Mutex<HashSet<String>>,
        values: Mutex<HashMap<String, String>>,
        ttls: Mutex<HashMap<String, i64>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRedis {
        fn apply(&self, cmd: Vec<String>) -> Value {
            self.commands.lock().unwrap().push(cmd.clone());
            if self.failing.lock().unwrap().contains(&cmd[0]) {
                return json!({ "error": format!("ERR {} rejected", cmd[0]) });
            }
            let mut values = self.values.lock().unwrap();
            let mut ttls = self.ttls.lock().unwrap();
            let result = match cmd[0].as_str() {
                "GET" => values.get(&cmd[1]).map_or(Value::Null, |v| json!(v)),
                "SET" => {
                    values.insert(cmd[1].clone(), cmd[2].clone());
                    if cmd.len() == 5 {
                        ttls.insert(cmd[1].clone(), cmd[4].parse().unwrap());
                    }
                    json!("OK")
                }
                "DEL" => json!(values.remove(&cmd[1]).map_or(0, |_| 1)),
                "INCR" => {
                    let next = values.get(&cmd[1]).map_or(0, |v| v.parse::<i64>().unwrap()) + 1;
                    values.insert(cmd[1].clone(), next.to_string());
                    json!(next)
                }
                "EXPIRE" => {
                    let nx = cmd.get(3).is_some_and(|flag| flag == "NX");
                    if nx && ttls.contains_key(&cmd[1]) {
                        json!(0)
                    } else {
                        ttls.insert(cmd[1].clone(), cmd[2].parse().unwrap());
                        json!(1)
                    }
                }
                "TTL" => match (values.contains_key(&cmd[1]), ttls.get(&cmd[1])) {
                    (_, Some(ttl)) => json!(ttl),
                    (true, None) => json!(-1),
                    (false, None) => json!(-2),
                },
                other => return json!({ "error": format!("ERR unknown command {other}") }),
            };
            json!({ "result": result })
        }

        async fn unavailable(&self) -> bool {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            self.down.load(Ordering::SeqCst)
        }
    }

    async fn fake_redis(
        State(redis): State<Arc<FakeRedis>>,
        Json(cmd): Json<Vec<String>>,
    ) -> (StatusCode, Json<Value>) {
        if redis.unavailable().await {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "down"})));
        }
        (StatusCode::OK, Json(redis.apply(cmd)))
    }

    async fn fake_redis_pipeline(
        State(redis): State<Arc<FakeRedis>>,
        Json(cmds): Json<Vec<Vec<String>>>,
    ) -> (StatusCode, Json<Value>) {
        if redis.unavailable().await {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "down"})));
        }
        let replies: Vec<Value> = cmds.into_iter().map(|cmd| redis.apply(cmd)).collect();
        (StatusCode::OK, Json(json!(replies)))
    }

    async fn spawn_fake_redis() -> (Arc<FakeRedis>, String) {
        let redis = Arc::new(FakeRedis::default());
        let app = Router::new()
            .route("/", post(fake_redis))
            .route("/pipeline", post(fake_redis_pipeline))
            .with_state(redis.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (redis, format!("http://{addr}"))
    }

    fn remote_cache_with_timeout(url: &str, timeout: Duration) -> Cache {
        let backend = RestBackend::new(reqwest::Client::new(), url, "token", timeout);
        Cache::with_remote(backend, Arc::new(ManualClock::default()))
    }

    fn remote_cache(url: &str) -> Cache {
        remote_cache_with_timeout(url, Duration::from_millis(400))
    }

    #[tokio::test]
    async fn memory_set_get_and_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = Cache::in_memory(clock.clone());
        cache.set("bill:1", &json!({"id": 1, "title": "HB 12"}), 30).await;
        assert_eq!(cache.get::<Value>("bill:1").await, Some(json!({"id": 1, "title": "HB 12"})));

        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.get::<Value>("bill:1").await, None);
    }

    #[tokio::test]
    async fn incr_keeps_the_first_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = Cache::in_memory(clock.clone());
        assert_eq!(cache.incr("x", 60).await, 1);
        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.incr("x", 60).await, 2);
        assert_eq!(cache.incr("x", 60).await, 3);
        assert_eq!(cache.ttl("x").await, 50);
        assert_eq!(cache.get::<u64>("x").await, Some(3));
    }

    #[tokio::test]
    async fn delete_and_missing_ttl() {
        let cache = Cache::in_memory(Arc::new(ManualClock::default()));
        cache.set("k", &"v", 10).await;
        cache.delete("k").await;
        assert_eq!(cache.get::<String>("k").await, None);
        assert_eq!(cache.ttl("k").await, -2);
    }

    #[tokio::test]
    async fn undecodable_entry_reads_as_absent() {
        let cache = Cache::in_memory(Arc::new(ManualClock::default()));
        cache.set("k", &"text", 10).await;
        assert_eq!(cache.get::<u64>("k").await, None);
    }

    #[tokio::test]
    async fn remote_round_trip_uses_wire_commands() {
        let (redis, url) = spawn_fake_redis().await;
        let cache = remote_cache(&url);

        cache.set("k", &json!([1, 2]), 60).await;
        assert_eq!(cache.get::<Value>("k").await, Some(json!([1, 2])));
        assert_eq!(cache.incr("hits", 60).await, 1);
        assert_eq!(cache.incr("hits", 30).await, 2);
        assert_eq!(cache.ttl("hits").await, 60);

        let commands = redis.commands.lock().unwrap().clone();
        assert_eq!(commands[0], vec!["SET", "k", "[1,2]", "EX", "60"]);
        let expires: Vec<_> = commands.iter().filter(|c| c[0] == "EXPIRE").collect();
        assert_eq!(expires.len(), 2);
        assert!(expires.iter().all(|c| c[3] == "NX"));
    }

    #[tokio::test]
    async fn failed_expire_keeps_the_remote_count() {
        let (redis, url) = spawn_fake_redis().await;
        let cache = remote_cache(&url);

        redis.failing.lock().unwrap().insert("EXPIRE".to_string());
        let outcome = cache.incr_raw("hits", 60).await;
        assert!(matches!(outcome, CacheOutcome::Remote(1)), "{outcome:?}");
        assert_eq!(cache.ttl("hits").await, -1);
        assert_eq!(cache.local_store().ttl("hits"), -2);

        redis.failing.lock().unwrap().clear();
        assert_eq!(cache.incr("hits", 60).await, 2);
        assert_eq!(cache.ttl("hits").await, 60);
    }

    #[tokio::test]
    async fn failed_incr_falls_back_locally() {
        let (redis, url) = spawn_fake_redis().await;
        let cache = remote_cache(&url);

        redis.failing.lock().unwrap().insert("INCR".to_string());
        let outcome = cache.incr_raw("hits", 60).await;
        assert!(matches!(
            outcome,
            CacheOutcome::Fallback { value: 1, cause: CacheError::Remote(_) }
        ));
    }

    #[tokio::test]
    async fn slow_remote_times_out_into_the_fallback() {
        let (redis, url) = spawn_fake_redis().await;
        let cache = remote_cache_with_timeout(&url, Duration::from_millis(100));
        redis.slow.store(true, Ordering::SeqCst);

        let started = std::time::Instant::now();
        let outcome = cache.get_raw("k").await;
        let elapsed = started.elapsed();

        assert!(
            matches!(outcome, CacheOutcome::Fallback { value: None, cause: CacheError::Timeout(_) }),
            "{outcome:?}"
        );
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_locally() {
        // Nothing listens on port 1.
        let cache = remote_cache("http://127.0.0.1:1");
        assert!(cache.set_raw("k", "\"v\"".into(), 60).await.is_fallback());
        let read = cache.get_raw("k").await;
        assert!(read.is_fallback());
        assert_eq!(read.into_value().as_deref(), Some("\"v\""));
        assert_eq!(cache.incr("n", 60).await, 1);
    }

    #[tokio::test]
    async fn fallback_is_decided_per_call() {
        let (redis, url) = spawn_fake_redis().await;
        let cache = remote_cache(&url);

        redis.down.store(true, Ordering::SeqCst);
        assert!(cache.set_raw("k", "1".into(), 60).await.is_fallback());

        redis.down.store(false, Ordering::SeqCst);
        let outcome = cache.get_raw("k").await;
        assert!(matches!(outcome, CacheOutcome::Remote(None)));
    }

    #[test]
    fn cache_keys_depend_on_method_and_path() {
        let a = make_cache_key("GET", "/api/bills?page=1");
        assert_eq!(a, make_cache_key("GET", "/api/bills?page=1"));
        assert_ne!(a, make_cache_key("GET", "/api/bills?page=2"));
        assert_ne!(a, make_cache_key("HEAD", "/api/bills?page=1"));
        assert!(a.starts_with("response:"));
    }
}
