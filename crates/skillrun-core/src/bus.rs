// Visibility-filtered event bus
//
// Delivery policy per the backpressure contract: SUMMARY subscribers ride a
// broadcast channel whose lagging receivers drop the oldest events
// (newest-preserving), so a slow end-user stream never blocks the driver.
// DETAIL and FULL subscribers get bounded mpsc channels and lossless
// delivery; they are assumed to consume at rate, and the driver awaits the
// bounded send. Events for one task are delivered in emission order.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use skillrun_contracts::{ExecutionEvent, Visibility};

use crate::error::Result;
use crate::traits::EventEmitter;

/// Default per-subscriber buffer.
pub const DEFAULT_BUFFER: usize = 256;

pub type EventStream = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

struct LosslessSubscriber {
    id: u64,
    level: Visibility,
    task_filter: Option<Uuid>,
    tx: mpsc::Sender<ExecutionEvent>,
}

/// The event bus: one per orchestrator, shared by all executions.
pub struct EventBus {
    summary_tx: broadcast::Sender<ExecutionEvent>,
    lossless: RwLock<Vec<LosslessSubscriber>>,
    buffer: usize,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (summary_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            summary_tx,
            lossless: RwLock::new(Vec::new()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe at a visibility level, optionally filtered to one task.
    ///
    /// Summary subscriptions are lossy under backpressure; Detail and Full
    /// subscriptions are lossless.
    pub async fn subscribe(&self, level: Visibility, task_filter: Option<Uuid>) -> EventStream {
        if level == Visibility::Summary {
            let rx = self.summary_tx.subscribe();
            let stream = BroadcastStream::new(rx).filter_map(move |item| {
                // Lagged errors mark dropped (oldest) events; the stream
                // resumes with the newest.
                let event = item.ok().filter(|e: &ExecutionEvent| {
                    task_filter.map(|t| e.task_id() == t).unwrap_or(true)
                });
                async move { event }
            });
            return Box::pin(stream);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.lossless.write().await.push(LosslessSubscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            level,
            task_filter,
            tx,
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn deliver(&self, event: &ExecutionEvent) {
        if event.visibility() <= Visibility::Summary {
            // No receivers is fine
            let _ = self.summary_tx.send(event.clone());
        }

        let mut dead = Vec::new();
        {
            let subscribers = self.lossless.read().await;
            for sub in subscribers.iter() {
                if event.visibility() > sub.level {
                    continue;
                }
                if let Some(task) = sub.task_filter {
                    if event.task_id() != task {
                        continue;
                    }
                }
                if sub.tx.send(event.clone()).await.is_err() {
                    dead.push(sub.id);
                }
            }
        }

        if !dead.is_empty() {
            self.lossless
                .write()
                .await
                .retain(|s| !dead.contains(&s.id));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

#[async_trait]
impl EventEmitter for EventBus {
    async fn emit(&self, event: ExecutionEvent) -> Result<()> {
        self.deliver(&event).await;
        Ok(())
    }
}

/// Emitter that forwards to a shared bus while stamping a tenant id.
pub struct TenantScopedEmitter {
    bus: Arc<EventBus>,
    tenant_id: Option<String>,
}

impl TenantScopedEmitter {
    pub fn new(bus: Arc<EventBus>, tenant_id: Option<String>) -> Self {
        Self { bus, tenant_id }
    }
}

#[async_trait]
impl EventEmitter for TenantScopedEmitter {
    async fn emit(&self, event: ExecutionEvent) -> Result<()> {
        self.bus
            .emit(event.with_tenant(self.tenant_id.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillrun_contracts::TaskState;

    #[tokio::test]
    async fn test_visibility_filtering() {
        let bus = EventBus::new(16);
        let task_id = Uuid::now_v7();

        let mut summary = bus.subscribe(Visibility::Summary, Some(task_id)).await;
        let mut full = bus.subscribe(Visibility::Full, Some(task_id)).await;

        bus.emit(ExecutionEvent::status(task_id, TaskState::Working))
            .await
            .unwrap();
        bus.emit(ExecutionEvent::message(
            task_id,
            Visibility::Detail,
            "iteration 1 starting",
        ))
        .await
        .unwrap();
        bus.emit(ExecutionEvent::done(task_id, TaskState::Completed))
            .await
            .unwrap();

        // Full sees all three, in order
        let e1 = full.next().await.unwrap();
        let e2 = full.next().await.unwrap();
        let e3 = full.next().await.unwrap();
        assert!(matches!(e1, ExecutionEvent::Status { .. }));
        assert!(matches!(e2, ExecutionEvent::Message { .. }));
        assert!(e3.is_done());

        // Summary skips the detail message
        let s1 = summary.next().await.unwrap();
        let s2 = summary.next().await.unwrap();
        assert!(matches!(s1, ExecutionEvent::Status { .. }));
        assert!(s2.is_done());
    }

    #[tokio::test]
    async fn test_task_filter() {
        let bus = EventBus::new(16);
        let task_a = Uuid::now_v7();
        let task_b = Uuid::now_v7();

        let mut only_a = bus.subscribe(Visibility::Full, Some(task_a)).await;

        bus.emit(ExecutionEvent::status(task_b, TaskState::Working))
            .await
            .unwrap();
        bus.emit(ExecutionEvent::status(task_a, TaskState::Working))
            .await
            .unwrap();

        let event = only_a.next().await.unwrap();
        assert_eq!(event.task_id(), task_a);
    }

    #[tokio::test]
    async fn test_summary_drops_oldest_under_backpressure() {
        let bus = EventBus::new(2);
        let task_id = Uuid::now_v7();
        let mut summary = bus.subscribe(Visibility::Summary, Some(task_id)).await;

        for i in 0..5 {
            bus.emit(ExecutionEvent::status_with_message(
                task_id,
                TaskState::Working,
                format!("update {i}"),
            ))
            .await
            .unwrap();
        }

        // The receiver lagged; the newest events survive.
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), summary.next()).await
        {
            if let ExecutionEvent::Status { message, .. } = event {
                seen.push(message.unwrap());
            }
        }
        assert!(seen.contains(&"update 4".to_string()));
        assert!(!seen.contains(&"update 0".to_string()));
    }

    #[tokio::test]
    async fn test_tenant_scoped_emitter_stamps_tenant() {
        let bus = Arc::new(EventBus::new(16));
        let task_id = Uuid::now_v7();
        let mut stream = bus.subscribe(Visibility::Full, Some(task_id)).await;

        let emitter = TenantScopedEmitter::new(bus.clone(), Some("acme".to_string()));
        emitter
            .emit(ExecutionEvent::status(task_id, TaskState::Working))
            .await
            .unwrap();

        if let ExecutionEvent::Status { tenant_id, .. } = stream.next().await.unwrap() {
            assert_eq!(tenant_id.as_deref(), Some("acme"));
        } else {
            panic!("expected status event");
        }
    }
}
