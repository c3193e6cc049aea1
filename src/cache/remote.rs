// Redis REST backend (Upstash wire format)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::error::CacheError;

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

impl RestReply {
    fn into_result(self) -> Result<Value, CacheError> {
        match self.error {
            Some(err) => Err(CacheError::Remote(err)),
            None => Ok(self.result),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    url: String,
    token: String,
    timeout: Duration,
}

impl RestBackend {
    pub fn new(client: reqwest::Client, url: &str, token: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, CacheError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let res = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CacheError::from_reqwest(e, self.timeout))?;

        if !res.status().is_success() {
            return Err(CacheError::Status(res.status().as_u16()));
        }

        res.json()
            .await
            .map_err(|e| CacheError::from_reqwest(e, self.timeout))
    }

    async fn command(&self, args: &[&str]) -> Result<Value, CacheError> {
        let reply: RestReply = self.post(&self.url, args).await?;
        reply.into_result()
    }

    // Several commands in one round trip; each reply is checked on its own.
    async fn pipeline(&self, commands: &[&[&str]]) -> Result<Vec<Result<Value, CacheError>>, CacheError> {
        let url = format!("{}/pipeline", self.url);
        let replies: Vec<RestReply> = self.post(&url, commands).await?;
        if replies.len() != commands.len() {
            return Err(CacheError::Malformed(format!(
                "pipeline returned {} replies for {} commands",
                replies.len(),
                commands.len()
            )));
        }
        Ok(replies.into_iter().map(RestReply::into_result).collect())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(CacheError::Malformed(format!("GET returned {other}"))),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let ttl = ttl_secs.to_string();
        let reply = if ttl_secs > 0 {
            self.command(&["SET", key, value, "EX", &ttl]).await?
        } else {
            self.command(&["SET", key, value]).await?
        };
        match reply {
            Value::String(s) if s == "OK" => Ok(()),
            other => Err(CacheError::Malformed(format!("SET returned {other}"))),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.command(&["DEL", key]).await.map(|_| ())
    }

    // INCR and EXPIRE NX travel together. NX keeps the first expiry and
    // repairs a key left without one by an earlier failed EXPIRE.
    pub async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u64, CacheError> {
        let ttl = ttl_secs.to_string();
        let commands: [&[&str]; 2] = [&["INCR", key], &["EXPIRE", key, &ttl, "NX"]];
        let mut replies = self.pipeline(&commands).await?.into_iter();
        let count = match replies.next() {
            Some(reply) => as_integer(reply?, "INCR")?,
            None => return Err(CacheError::Malformed("INCR reply missing".to_string())),
        };
        // Counter already moved remotely; never fall back past this point
        if let Some(Err(e)) = replies.next() {
            warn!(key = %key, error = %e, "EXPIRE failed after INCR, retried on the next increment");
        }
        u64::try_from(count).map_err(|_| CacheError::Malformed(format!("INCR returned {count}")))
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        as_integer(self.command(&["TTL", key]).await?, "TTL")
    }
}

fn as_integer(value: Value, command: &str) -> Result<i64, CacheError> {
    match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| CacheError::Malformed(format!("{command} returned {value}")))
}
