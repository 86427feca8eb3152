//! Event sink for fallback decisions and circuit breaker transitions (§6.4).
//!
//! The spec leaves the sink abstract ("out of scope: metrics aggregation").
//! This mirrors the teacher's `ProviderHealthTracker`, which keeps a bounded
//! ring buffer of `FallbackEvent`s (`provider_health.rs`) fed by
//! `record_fallback_event` and read back by `api/model_routing.rs`'s
//! `list_fallback_events` handler. We keep the same shape: a trait any
//! subscriber can implement, plus a ring-buffer implementation that is also
//! an observer, so the admin surface can read back recent history.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::ErrorKind;

const MAX_EVENTS: usize = 200;

/// One entry in the gateway's event log. Variants correspond to the
/// observable transitions named across §4.3 (circuit breaker), §4.7
/// (router fallback), and §4.8 (health check).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    CircuitOpened {
        endpoint_id: String,
        pool_id: String,
        consecutive_failures: u32,
        trip_count: u32,
        at: DateTime<Utc>,
    },
    CircuitHalfOpen {
        endpoint_id: String,
        pool_id: String,
        at: DateTime<Utc>,
    },
    CircuitClosed {
        endpoint_id: String,
        pool_id: String,
        at: DateTime<Utc>,
    },
    EndpointFallback {
        request_id: String,
        model: String,
        from_endpoint_id: Option<String>,
        to_endpoint_id: String,
        reason: ErrorKind,
        at: DateTime<Utc>,
    },
    AllEndpointsExhausted {
        request_id: String,
        model: String,
        attempted: u32,
        at: DateTime<Utc>,
    },
    HealthCheckFailed {
        endpoint_id: String,
        message: String,
        at: DateTime<Utc>,
    },
    HealthCheckRecovered {
        endpoint_id: String,
        at: DateTime<Utc>,
    },
}

impl GatewayEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            GatewayEvent::CircuitOpened { at, .. }
            | GatewayEvent::CircuitHalfOpen { at, .. }
            | GatewayEvent::CircuitClosed { at, .. }
            | GatewayEvent::EndpointFallback { at, .. }
            | GatewayEvent::AllEndpointsExhausted { at, .. }
            | GatewayEvent::HealthCheckFailed { at, .. }
            | GatewayEvent::HealthCheckRecovered { at, .. } => *at,
        }
    }
}

/// Anything that wants to subscribe to gateway events implements this.
/// The default method is a no-op so existing implementors (and tests that
/// only care about a subset) aren't forced to handle every variant.
#[async_trait::async_trait]
pub trait GatewayObserver: Send + Sync {
    async fn on_event(&self, event: GatewayEvent);
}

/// Writes every event to `tracing` at `info` level with structured fields,
/// matching the teacher's logging style in `provider_health.rs`
/// (`tracing::warn!(endpoint_id = %..., consecutive_failures = ..., "...")`).
pub struct TracingObserver;

#[async_trait::async_trait]
impl GatewayObserver for TracingObserver {
    async fn on_event(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::CircuitOpened {
                endpoint_id,
                pool_id,
                consecutive_failures,
                trip_count,
                ..
            } => info!(
                endpoint_id = %endpoint_id,
                pool_id = %pool_id,
                consecutive_failures,
                trip_count,
                "circuit breaker opened"
            ),
            GatewayEvent::CircuitHalfOpen { endpoint_id, pool_id, .. } => {
                info!(endpoint_id = %endpoint_id, pool_id = %pool_id, "circuit breaker half-open")
            }
            GatewayEvent::CircuitClosed { endpoint_id, pool_id, .. } => {
                info!(endpoint_id = %endpoint_id, pool_id = %pool_id, "circuit breaker closed")
            }
            GatewayEvent::EndpointFallback {
                request_id,
                model,
                from_endpoint_id,
                to_endpoint_id,
                reason,
                ..
            } => info!(
                request_id = %request_id,
                model = %model,
                from_endpoint_id = ?from_endpoint_id,
                to_endpoint_id = %to_endpoint_id,
                reason = ?reason,
                "falling back to next endpoint"
            ),
            GatewayEvent::AllEndpointsExhausted {
                request_id,
                model,
                attempted,
                ..
            } => info!(
                request_id = %request_id,
                model = %model,
                attempted,
                "all endpoints exhausted"
            ),
            GatewayEvent::HealthCheckFailed { endpoint_id, message, .. } => {
                info!(endpoint_id = %endpoint_id, message = %message, "health check failed")
            }
            GatewayEvent::HealthCheckRecovered { endpoint_id, .. } => {
                info!(endpoint_id = %endpoint_id, "health check recovered")
            }
        }
    }
}

/// Bounded ring buffer of recent events plus fan-out to any number of
/// registered observers, mirroring `ProviderHealthTracker`'s
/// `fallback_events: RwLock<VecDeque<FallbackEvent>>` capped at 200 entries.
pub struct EventLog {
    events: RwLock<VecDeque<GatewayEvent>>,
    observers: Vec<Arc<dyn GatewayObserver>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(observers: Vec<Arc<dyn GatewayObserver>>) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENTS)),
            observers,
            capacity: MAX_EVENTS,
        }
    }

    pub async fn record(&self, event: GatewayEvent) {
        {
            let mut events = self.events.write().await;
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        for observer in &self.observers {
            observer.on_event(event.clone()).await;
        }
    }

    /// Returns the `limit` most recent events, newest first, matching the
    /// teacher's `list_fallback_events` ordering.
    pub async fn recent(&self, limit: usize) -> Vec<GatewayEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl GatewayObserver for CountingObserver {
        async fn on_event(&self, _event: GatewayEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ring_buffer_stays_bounded() {
        let log = EventLog::new(vec![]);
        for i in 0..(MAX_EVENTS + 10) {
            log.record(GatewayEvent::CircuitClosed {
                endpoint_id: format!("ep-{i}"),
                pool_id: "pool-a".to_string(),
                at: Utc::now(),
            })
            .await;
        }
        assert_eq!(log.len().await, MAX_EVENTS);
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = EventLog::new(vec![]);
        log.record(GatewayEvent::CircuitClosed {
            endpoint_id: "first".to_string(),
            pool_id: "pool-a".to_string(),
            at: Utc::now(),
        })
        .await;
        log.record(GatewayEvent::CircuitClosed {
            endpoint_id: "second".to_string(),
            pool_id: "pool-a".to_string(),
            at: Utc::now(),
        })
        .await;

        let recent = log.recent(1).await;
        assert_eq!(recent.len(), 1);
        match &recent[0] {
            GatewayEvent::CircuitClosed { endpoint_id, .. } => assert_eq!(endpoint_id, "second"),
            _ => panic!("unexpected variant"),
        }
    }

    #[tokio::test]
    async fn observers_are_notified() {
        let count = Arc::new(AtomicUsize::new(0));
        let log = EventLog::new(vec![Arc::new(CountingObserver(count.clone()))]);
        log.record(GatewayEvent::CircuitClosed {
            endpoint_id: "ep".to_string(),
            pool_id: "pool-a".to_string(),
            at: Utc::now(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
