//! Server-side registry of single-connection stream reservations.
//!
//! A `PUT` reserves a stream under an unguessable token; the matching
//! `GET` attaches to it exactly once; `POST`/`DELETE` requests address
//! operations inside it. When the output stream closes, every contained
//! operation is cancelled and the reservation disappears.

use crate::error::{ErrorCode, TransportError, TransportResult};
use crate::sse::{EventSink, SseBody};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Generates a stream token: 128 random bits, hex-encoded.
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// One in-flight operation inside a reservation. Firing (or dropping)
/// the stop signal ends its forwarding task, which drops the producer
/// stream and runs the producer's cleanup.
struct OperationRecord {
    stop: oneshot::Sender<()>,
}

struct Reservation {
    sink: EventSink,
    /// Present until the stream is attached; taking it marks the
    /// reservation consumed.
    body: Option<SseBody>,
    ops: HashMap<String, OperationRecord>,
    created_at: Instant,
    last_active_at: Instant,
}

/// Process-local map from stream token to reservation.
///
/// Lookups take a read lock and clone the per-reservation handle;
/// mutation happens inside short per-reservation critical sections.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<Reservation>>>>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reservation under `token`, creating the output sink
    /// with the given buffer capacity. Fails when the token is taken.
    pub async fn reserve(&self, token: &str, sink_capacity: usize) -> TransportResult<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(token) {
            return Err(TransportError::conflict("stream token already reserved"));
        }
        let (sink, body) = EventSink::channel(sink_capacity);
        let now = Instant::now();
        map.insert(
            token.to_string(),
            Arc::new(Mutex::new(Reservation {
                sink,
                body: Some(body),
                ops: HashMap::new(),
                created_at: now,
                last_active_at: now,
            })),
        );
        debug!(token, "stream reserved");
        Ok(())
    }

    /// Attaches the consuming `GET` to a reservation, returning the
    /// response body. A second attach fails with a conflict.
    pub async fn attach(&self, token: &str) -> TransportResult<SseBody> {
        let reservation = self.get(token).await?;
        let mut reservation = reservation.lock().await;
        reservation.last_active_at = Instant::now();
        reservation
            .body
            .take()
            .ok_or_else(|| TransportError::conflict("stream already attached"))
    }

    /// Returns the reservation's output sink.
    pub async fn sink(&self, token: &str) -> TransportResult<EventSink> {
        let reservation = self.get(token).await?;
        let sink = reservation.lock().await.sink.clone();
        Ok(sink)
    }

    /// Registers an operation. Rejects duplicate ids within the
    /// reservation.
    pub async fn register_operation(
        &self,
        token: &str,
        id: &str,
        stop: oneshot::Sender<()>,
    ) -> TransportResult<()> {
        let reservation = self.get(token).await?;
        let mut reservation = reservation.lock().await;
        if reservation.ops.contains_key(id) {
            return Err(TransportError::conflict(format!(
                "operation id already in use: {}",
                id
            )));
        }
        reservation.last_active_at = Instant::now();
        reservation.ops.insert(id.to_string(), OperationRecord { stop });
        Ok(())
    }

    /// Drops an operation record after its execution terminated on its
    /// own. A no-op when the reservation is already gone.
    pub async fn finish_operation(&self, token: &str, id: &str) {
        if let Ok(reservation) = self.get(token).await {
            reservation.lock().await.ops.remove(id);
        }
    }

    /// Cancels one operation, firing its stop signal. Returns false when
    /// the token or id is unknown.
    pub async fn cancel_operation(&self, token: &str, id: &str) -> bool {
        let Ok(reservation) = self.get(token).await else {
            return false;
        };
        let record = {
            let mut reservation = reservation.lock().await;
            reservation.last_active_at = Instant::now();
            reservation.ops.remove(id)
        };
        match record {
            Some(record) => {
                let _ = record.stop.send(());
                debug!(token, id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Removes a reservation, cancelling everything it contains.
    pub async fn remove(&self, token: &str) {
        let removed = self.inner.write().await.remove(token);
        if let Some(reservation) = removed {
            let mut reservation = reservation.lock().await;
            for (_, record) in reservation.ops.drain() {
                let _ = record.stop.send(());
            }
            debug!(
                token,
                lived = ?reservation.created_at.elapsed(),
                "stream reservation removed"
            );
        }
    }

    /// Removes the reservation only if it was never attached. Used by
    /// the idle-eviction timer; holds the map lock so a concurrent
    /// attach cannot lose its stream.
    pub async fn evict_unclaimed(&self, token: &str) -> bool {
        let mut map = self.inner.write().await;
        let Some(reservation) = map.get(token) else {
            return false;
        };
        let unclaimed = reservation.lock().await.body.is_some();
        if unclaimed {
            if let Some(reservation) = map.remove(token) {
                let mut reservation = reservation.lock().await;
                for (_, record) in reservation.ops.drain() {
                    let _ = record.stop.send(());
                }
            }
        }
        unclaimed
    }

    /// Returns how long the reservation has been idle: time since it
    /// was created or last touched by an attach, submission, or
    /// cancellation. `None` for unknown tokens. The eviction timer uses
    /// this to re-arm instead of evicting a reservation that saw
    /// activity.
    pub async fn idle_for(&self, token: &str) -> Option<std::time::Duration> {
        let reservation = self.get(token).await.ok()?;
        let last_active_at = reservation.lock().await.last_active_at;
        Some(last_active_at.elapsed())
    }

    /// Number of live reservations.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// True when no reservation is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn get(&self, token: &str) -> TransportResult<Arc<Mutex<Reservation>>> {
        self.inner
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| TransportError::new(ErrorCode::NotFound, "unknown stream token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn test_attach_is_single_use() {
        let registry = StreamRegistry::new();
        registry.reserve("t", 4).await.unwrap();
        assert!(registry.attach("t").await.is_ok());

        let second = registry.attach("t").await.unwrap_err();
        assert_eq!(second.code, ErrorCode::Conflict);

        let unknown = registry.attach("nope").await.unwrap_err();
        assert_eq!(unknown.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_operation_id_rejected() {
        let registry = StreamRegistry::new();
        registry.reserve("t", 4).await.unwrap();

        let (stop_a, _rx_a) = oneshot::channel();
        registry.register_operation("t", "op", stop_a).await.unwrap();
        let (stop_b, _rx_b) = oneshot::channel();
        let err = registry
            .register_operation("t", "op", stop_b)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_remove_fires_stop_signals() {
        let registry = StreamRegistry::new();
        registry.reserve("t", 4).await.unwrap();

        let (stop, rx) = oneshot::channel();
        registry.register_operation("t", "op", stop).await.unwrap();
        registry.remove("t").await;

        assert!(rx.await.is_ok());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_unclaimed_spares_attached_streams() {
        let registry = StreamRegistry::new();
        registry.reserve("a", 4).await.unwrap();
        registry.reserve("b", 4).await.unwrap();
        let _body = registry.attach("a").await.unwrap();

        assert!(!registry.evict_unclaimed("a").await);
        assert!(registry.evict_unclaimed("b").await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_idle_time_resets_on_activity() {
        let registry = StreamRegistry::new();
        registry.reserve("t", 4).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let idle_before = registry.idle_for("t").await.unwrap();

        let (stop, _rx) = oneshot::channel();
        registry.register_operation("t", "op", stop).await.unwrap();
        let idle_after = registry.idle_for("t").await.unwrap();

        assert!(idle_after < idle_before);
        assert!(registry.idle_for("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_operation() {
        let registry = StreamRegistry::new();
        registry.reserve("t", 4).await.unwrap();

        let (stop, rx) = oneshot::channel();
        registry.register_operation("t", "op", stop).await.unwrap();

        assert!(!registry.cancel_operation("t", "other").await);
        assert!(registry.cancel_operation("t", "op").await);
        assert!(rx.await.is_ok());
        assert!(!registry.cancel_operation("t", "op").await);
    }
}
