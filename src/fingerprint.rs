use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::sweep::Sweep;

const UA_PREFIX: usize = 50;
const LANG_PREFIX: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintSettings {
    pub window: Duration,
    pub max_identical: usize,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_identical: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodLevel {
    Normal,
    Elevated,
    Flood,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintVerdict {
    pub level: FloodLevel,
    pub count: usize,
    // True only for the request that first crossed `max_identical`.
    pub newly_elevated: bool,
}

fn prefix(s: &str, chars: usize) -> &str {
    s.char_indices().nth(chars).map_or(s, |(i, _)| &s[..i])
}

pub fn fingerprint_key(ip: &str, user_agent: &str, accept_language: &str) -> String {
    format!(
        "{ip}|{}|{}",
        prefix(user_agent, UA_PREFIX),
        prefix(accept_language, LANG_PREFIX)
    )
}

#[derive(Debug)]
pub struct FingerprintTracker {
    windows: DashMap<String, VecDeque<u64>>,
    settings: FingerprintSettings,
    clock: SharedClock,
}

impl FingerprintTracker {
    pub fn new(settings: FingerprintSettings, clock: SharedClock) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &FingerprintSettings {
        &self.settings
    }

    fn window_ms(&self) -> u64 {
        self.settings.window.as_millis() as u64
    }

    pub fn record(&self, ip: &str, user_agent: &str, accept_language: &str) -> FingerprintVerdict {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms();
        let key = fingerprint_key(ip, user_agent, accept_language);

        let mut samples = self.windows.entry(key).or_default();
        while samples.front().is_some_and(|t| now.saturating_sub(*t) >= window_ms) {
            samples.pop_front();
        }
        samples.push_back(now);

        let count = samples.len();
        let max = self.settings.max_identical;
        let level = if count > max * 2 {
            FloodLevel::Flood
        } else if count > max {
            FloodLevel::Elevated
        } else {
            FloodLevel::Normal
        };
        FingerprintVerdict {
            level,
            count,
            newly_elevated: count == max + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Sweep for FingerprintTracker {
    fn name(&self) -> &'static str {
        "fingerprints"
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let window_ms = self.window_ms();
        let keys: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            if let Some(mut samples) = self.windows.get_mut(&key) {
                samples.retain(|t| now_ms.saturating_sub(*t) < window_ms);
            }
            if self.windows.remove_if(&key, |_, s| s.is_empty()).is_some() {
                removed += 1;
            }
        }
        removed
    }
}
