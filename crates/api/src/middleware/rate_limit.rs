//! Fixed-window per-client rate limiting for the ingest path.
//!
//! State is in-process: the counter window resets on the first request after
//! expiry. Enforcement is per serving process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ApiError;

pub struct RateLimiter {
    requests: u32,
    window: Duration,
    store: Mutex<HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(requests: u32, window_seconds: u64) -> Self {
        RateLimiter {
            requests,
            window: Duration::from_secs(window_seconds),
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `client`; errors with `429` once the window is
    /// exhausted.
    pub fn check(&self, client: &str) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut store = self.store.lock().expect("rate limit lock");
        let entry = store.entry(client.to_string()).or_insert((0, now + self.window));
        let (count, reset_at) = *entry;

        let (count, reset_at) = if now > reset_at {
            (0, now + self.window)
        } else {
            (count, reset_at)
        };

        if count >= self.requests {
            return Err(ApiError::RateLimited {
                requests: self.requests,
                window_seconds: self.window.as_secs(),
            });
        }

        *entry = (count + 1, reset_at);
        Ok(())
    }
}
