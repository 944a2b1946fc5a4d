use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use courier_shared::types::UserId;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::error::ServerError;
use crate::identity::identity_from_headers;

/// Writes a user may still make, refilled continuously up to the limit.
#[derive(Debug, Clone)]
struct WriteAllowance {
    remaining: f64,
    updated_at: Instant,
}

impl WriteAllowance {
    fn full(limit: f64, now: Instant) -> Self {
        Self {
            remaining: limit,
            updated_at: now,
        }
    }

    fn take(&mut self, per_sec: f64, limit: f64, now: Instant) -> bool {
        let idle = now.saturating_duration_since(self.updated_at).as_secs_f64();
        self.remaining = (self.remaining + idle * per_sec).min(limit);
        self.updated_at = now;

        if self.remaining < 1.0 {
            return false;
        }
        self.remaining -= 1.0;
        true
    }
}

/// Per-user write throttle: `limit` writes per `window`, refilled smoothly
/// so a throttled user regains one write every `window / limit`.
#[derive(Clone)]
pub struct RateLimiter {
    allowances: Arc<Mutex<HashMap<UserId, WriteAllowance>>>,
    per_sec: f64,
    limit: f64,
}

impl RateLimiter {
    pub fn per_window(limit: u32, window: Duration) -> Self {
        let limit = f64::from(limit.max(1));
        Self {
            allowances: Arc::new(Mutex::new(HashMap::new())),
            per_sec: limit / window.as_secs_f64().max(1.0),
            limit,
        }
    }

    /// Spend one write of `user`'s allowance. `false` means throttled.
    pub async fn check(&self, user: UserId) -> bool {
        self.check_at(user, Instant::now()).await
    }

    async fn check_at(&self, user: UserId, now: Instant) -> bool {
        let mut allowances = self.allowances.lock().await;
        allowances
            .entry(user)
            .or_insert_with(|| WriteAllowance::full(self.limit, now))
            .take(self.per_sec, self.limit, now)
    }

    /// Forget users that have not written for `max_idle`. They start over
    /// with a full allowance, which is what refilling would give them.
    pub async fn purge_idle(&self, max_idle: Duration) {
        self.purge_idle_at(max_idle, Instant::now()).await;
    }

    async fn purge_idle_at(&self, max_idle: Duration, now: Instant) {
        let mut allowances = self.allowances.lock().await;
        let before = allowances.len();
        allowances.retain(|_, a| now.saturating_duration_since(a.updated_at) < max_idle);
        let evicted = before - allowances.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle write allowances");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_window(50, Duration::from_secs(60))
    }
}

/// Throttle message and group writes per authenticated user. Requests
/// without an identity pass through and are rejected by the handler.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(user) = identity_from_headers(req.headers(), &state.config.identity_header) {
        if !state.rate_limiter.check(user).await {
            warn!(user = %user, "Rate limit exceeded");
            return ServerError::RateLimited.into_response();
        }
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chatty_user_does_not_throttle_others() {
        let limiter = RateLimiter::per_window(3, Duration::from_secs(60));
        let (chatty, quiet) = (UserId::new(), UserId::new());
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(chatty, now).await);
        }
        assert!(!limiter.check_at(chatty, now).await);
        assert!(limiter.check_at(quiet, now).await);
    }

    #[tokio::test]
    async fn test_throttled_user_regains_one_write_per_slot() {
        // 6 writes a minute: one slot every 10 seconds.
        let limiter = RateLimiter::per_window(6, Duration::from_secs(60));
        let user = UserId::new();
        let start = Instant::now();

        for _ in 0..6 {
            assert!(limiter.check_at(user, start).await);
        }
        assert!(!limiter.check_at(user, start + Duration::from_secs(5)).await);

        let later = start + Duration::from_secs(11);
        assert!(limiter.check_at(user, later).await);
        assert!(!limiter.check_at(user, later).await);
    }

    #[tokio::test]
    async fn test_long_silence_refills_only_to_the_limit() {
        let limiter = RateLimiter::per_window(2, Duration::from_secs(60));
        let user = UserId::new();
        let start = Instant::now();
        assert!(limiter.check_at(user, start).await);

        let much_later = start + Duration::from_secs(3600);
        assert!(limiter.check_at(user, much_later).await);
        assert!(limiter.check_at(user, much_later).await);
        assert!(!limiter.check_at(user, much_later).await);
    }

    #[tokio::test]
    async fn test_idle_users_are_forgotten() {
        let limiter = RateLimiter::default();
        let (idle, active) = (UserId::new(), UserId::new());
        let start = Instant::now();

        limiter.check_at(idle, start).await;
        limiter.check_at(active, start + Duration::from_secs(500)).await;
        limiter
            .purge_idle_at(Duration::from_secs(600), start + Duration::from_secs(700))
            .await;

        let allowances = limiter.allowances.lock().await;
        assert!(!allowances.contains_key(&idle));
        assert!(allowances.contains_key(&active));
    }
}
