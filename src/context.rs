//! Request context: deadline propagation and cooperative cancellation (§4.5).
//!
//! Mirrors the teacher's split between monotonic `Instant` arithmetic for
//! timing decisions and `chrono::DateTime<Utc>` for anything surfaced to a
//! caller (see `provider_health.rs`'s `cooldown_until` vs. `last_failure_at`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared cancellation flag. Cloning shares the same underlying flag, so a
/// child token observes the parent's cancellation without polling the parent.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    /// Derive a child token chained to this one: cancelling the parent is
    /// visible through the child because they share the same flag.
    pub fn child(&self) -> Self {
        self.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Idempotent: a repeat `cancel()` is a no-op (first reason wins).
    pub async fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write().await = Some(reason.into());
        }
    }

    pub async fn reason(&self) -> Option<String> {
        self.reason.read().await.clone()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A request's deadline, id, and cancellation token. Owned by the originating
/// handler; destroyed when the handler returns.
#[derive(Clone)]
pub struct RequestContext {
    pub id: String,
    pub start_time: Instant,
    deadline: Instant,
    token: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, timeout: Duration) -> Self {
        let start_time = Instant::now();
        Self {
            id: request_id.into(),
            start_time,
            deadline: start_time + timeout,
            token: CancellationToken::new(),
        }
    }

    pub fn generate(timeout: Duration) -> Self {
        Self::new(Uuid::new_v4().to_string(), timeout)
    }

    /// `max(0, deadline - now)`.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.remaining().is_zero()
    }

    pub async fn cancel(&self, reason: impl Into<String>) {
        self.token.cancel(reason).await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child()
    }

    /// Derive a child deadline for a sub-operation: `min(requested, remaining)`.
    /// If the result is `<= 0`, the caller must fail with `timeout` without
    /// attempting any I/O (§4.5, §8 P4/P5).
    pub fn child_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.remaining())
    }

    /// Spawn the background timer that fires `cancel("timeout")` at the
    /// deadline if nothing else has cancelled the context first.
    pub fn arm_deadline_timer(&self) {
        let token = self.token.clone();
        let remaining = self.remaining();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            token.cancel("timeout").await;
        });
    }
}

/// Process-wide registry of active contexts, for observability only. Readers
/// (metrics) may see stale snapshots — no ordering guarantee across entries.
#[derive(Clone)]
pub struct ContextRegistry {
    active: Arc<RwLock<HashMap<String, Instant>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn track(&self, ctx: &RequestContext) {
        self.active.write().await.insert(ctx.id.clone(), ctx.deadline);
    }

    pub async fn untrack(&self, ctx: &RequestContext) {
        self.active.write().await.remove(&ctx.id);
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Sweep expired entries. Intended to run every 60s per §4.5.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut active = self.active.write().await;
        active.retain(|_, deadline| *deadline > now);
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remaining_never_goes_negative() {
        let ctx = RequestContext::new("r1", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn child_timeout_never_exceeds_parent_remaining() {
        let ctx = RequestContext::new("r1", Duration::from_millis(50));
        let child = ctx.child_timeout(Duration::from_secs(10));
        assert!(child <= ctx.remaining());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let ctx = RequestContext::new("r1", Duration::from_secs(5));
        ctx.cancel("first").await;
        ctx.cancel("second").await;
        assert_eq!(ctx.cancellation_token().reason().await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn child_token_observes_parent_cancellation() {
        let ctx = RequestContext::new("r1", Duration::from_secs(5));
        let child = ctx.cancellation_token();
        assert!(!child.is_cancelled());
        ctx.cancel("stop").await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn registry_sweeps_expired_entries() {
        let registry = ContextRegistry::new();
        let ctx = RequestContext::new("r1", Duration::from_millis(1));
        registry.track(&ctx).await;
        assert_eq!(registry.active_count().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.sweep_expired().await;
        assert_eq!(registry.active_count().await, 0);
    }
}
