use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::TaskId;

/// Exclusive permission to process one task, bounded by a TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub token_id: Uuid,
    pub holder_task_id: TaskId,
    pub acquired_at: DateTime<Utc>,
    /// Wall-clock view of `deadline`, for display and logs
    pub expires_at: DateTime<Utc>,
    deadline: Instant,
    acquired_instant: Instant,
}

impl LockToken {
    fn issue(task_id: &TaskId, ttl: Duration) -> Self {
        let now = Instant::now();
        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            token_id: Uuid::new_v4(),
            holder_task_id: task_id.clone(),
            acquired_at,
            expires_at,
            deadline: now + ttl,
            acquired_instant: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the token is reclaimable
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Counters describing lock usage since startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockMetrics {
    pub acquire_attempts: u64,
    pub acquired: u64,
    pub contended: u64,
    pub released: u64,
    /// Releases refused because the caller no longer held the lock
    pub stale_releases: u64,
    pub expired_reclaimed: u64,
    pub average_hold: Duration,
    pub currently_held: bool,
    #[serde(skip)]
    total_hold: Duration,
}

#[derive(Debug)]
pub struct LockManager {
    default_ttl: Duration,
    current: Mutex<Option<LockToken>>,
    metrics: Mutex<LockMetrics>,
}

impl LockManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            current: Mutex::new(None),
            metrics: Mutex::new(LockMetrics::default()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Non-blocking acquisition. An expired holder is reclaimed first.
    pub fn try_acquire(&self, task_id: &TaskId, ttl: Duration) -> Option<LockToken> {
        let mut current = self.current.lock();
        let mut metrics = self.metrics.lock();
        metrics.acquire_attempts += 1;

        if let Some(held) = current.as_ref() {
            if !held.is_expired() {
                metrics.contended += 1;
                debug!(
                    task_id = %task_id,
                    holder = %held.holder_task_id,
                    "🔒 Lock held, skipping"
                );
                return None;
            }

            warn!(
                task_id = %task_id,
                abandoned_by = %held.holder_task_id,
                expired_at = %held.expires_at.to_rfc3339(),
                "♻️ Reclaiming expired lock"
            );
            metrics.expired_reclaimed += 1;
        }

        let token = LockToken::issue(task_id, ttl);
        *current = Some(token.clone());
        metrics.acquired += 1;
        metrics.currently_held = true;

        info!(
            task_id = %task_id,
            token_id = %token.token_id,
            ttl_seconds = ttl.as_secs(),
            "🔐 Lock acquired"
        );
        Some(token)
    }

    /// Acquire with the default TTL, returning a guard that releases on drop
    pub fn try_acquire_guard(self: &Arc<Self>, task_id: &TaskId) -> Option<LockGuard> {
        self.try_acquire(task_id, self.default_ttl)
            .map(|token| LockGuard::new(self.clone(), token))
    }

    /// Release only if `token` is still the current holder
    pub fn release(&self, token: &LockToken) -> bool {
        let mut current = self.current.lock();
        let mut metrics = self.metrics.lock();

        match current.as_ref() {
            Some(held) if held.token_id == token.token_id => {
                let hold = held.acquired_instant.elapsed();
                *current = None;
                metrics.released += 1;
                metrics.total_hold += hold;
                metrics.average_hold = metrics.total_hold / metrics.released as u32;
                metrics.currently_held = false;
                info!(
                    task_id = %token.holder_task_id,
                    held_ms = hold.as_millis(),
                    "🔓 Lock released"
                );
                true
            }
            _ => {
                metrics.stale_releases += 1;
                warn!(
                    task_id = %token.holder_task_id,
                    token_id = %token.token_id,
                    "Ignoring release of a lock no longer held by this token"
                );
                false
            }
        }
    }

    pub fn is_expired(&self, token: &LockToken) -> bool {
        token.is_expired()
    }

    /// Drop the current token if it has expired. Returns whether one was removed.
    pub fn cleanup_expired(&self) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(LockToken::is_expired) {
            if let Some(stale) = current.take() {
                let mut metrics = self.metrics.lock();
                metrics.expired_reclaimed += 1;
                metrics.currently_held = false;
                warn!(task_id = %stale.holder_task_id, "♻️ Removed expired lock");
            }
            return true;
        }
        false
    }

    /// The live holder, if any. Expired tokens are not reported.
    pub fn current_holder(&self) -> Option<LockToken> {
        self.current
            .lock()
            .as_ref()
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Operator override: drop the lock regardless of holder
    pub fn force_release(&self) -> Option<LockToken> {
        let released = self.current.lock().take();
        if let Some(token) = &released {
            self.metrics.lock().currently_held = false;
            warn!(task_id = %token.holder_task_id, "🚨 Lock force-released");
        }
        released
    }

    pub fn metrics(&self) -> LockMetrics {
        self.metrics.lock().clone()
    }
}

/// Holds a [`LockToken`] and releases it when dropped
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn new(manager: Arc<LockManager>, token: LockToken) -> Self {
        Self {
            manager,
            token: Some(token),
        }
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release now and report whether this guard still held the lock
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        match self.token.take() {
            Some(token) => self.manager.release(&token),
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
