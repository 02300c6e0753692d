// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dispatcher: typed work items and step results over a queue transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pagewerk_core::error::Result;
use pagewerk_core::{ErrorKind, StepResult, WorkItem};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;
use crate::transport::{DeliveryToken, QueueDepth, QueueTransport};

pub const WORK_QUEUE: &str = "pagewerk.work";
pub const RESULT_QUEUE: &str = "pagewerk.results";

/// Receives step results, in delivery order, possibly more than once.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    async fn handle_result(&self, result: StepResult) -> Result<()>;
}

/// A work item received by a worker.
#[derive(Debug, Clone)]
pub struct WorkDelivery {
    pub token: DeliveryToken,
    pub item: WorkItem,
    pub delivery_count: u32,
}

/// Typed front end over a [`QueueTransport`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn QueueTransport>,
    visibility: Duration,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn QueueTransport>, visibility: Duration, poll_interval: Duration) -> Self {
        Self {
            transport,
            visibility,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    // -- Work side -------------------------------------------------------------

    /// Publish a work item; it becomes visible after `delay`.
    pub async fn publish(&self, item: &WorkItem, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        self.transport.publish(WORK_QUEUE, &payload, delay).await?;
        debug!(
            key = %item.idempotency_key,
            attempt = item.attempt,
            kind = %item.operation_kind,
            "work item published"
        );
        Ok(())
    }

    /// Pull the next work item, if any.
    ///
    /// Undecodable payloads are rejected to the dead-letter store and skipped.
    pub async fn next_work(&self) -> Result<Option<WorkDelivery>> {
        loop {
            let Some(delivery) = self.transport.receive(WORK_QUEUE, self.visibility).await? else {
                return Ok(None);
            };
            match serde_json::from_str::<WorkItem>(&delivery.payload) {
                Ok(item) => {
                    return Ok(Some(WorkDelivery {
                        token: delivery.token,
                        item,
                        delivery_count: delivery.delivery_count,
                    }));
                }
                Err(e) => {
                    error!(token = %delivery.token, "malformed work item: {e}");
                    self.transport
                        .reject(&delivery.token, &format!("malformed work item: {e}"))
                        .await?;
                }
            }
        }
    }

    pub async fn ack(&self, token: &DeliveryToken) -> Result<bool> {
        self.transport.ack(token).await
    }

    pub async fn nack(&self, token: &DeliveryToken, delay: Duration) -> Result<bool> {
        self.transport.nack(token, delay).await
    }

    // -- Result side -----------------------------------------------------------

    /// Report the outcome of a work item.
    pub async fn report(&self, result: &StepResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        self.transport.publish(RESULT_QUEUE, &payload, Duration::ZERO).await?;
        debug!(key = %result.idempotency_key, success = result.is_success(), "result reported");
        Ok(())
    }

    /// Work items that exhausted their deliveries, as permanent failures.
    pub async fn drain_dead_letters(&self, limit: usize) -> Result<Vec<StepResult>> {
        let letters = self.transport.drain_dead_letters(WORK_QUEUE, limit).await?;
        let mut results = Vec::with_capacity(letters.len());
        for letter in letters {
            match serde_json::from_str::<WorkItem>(&letter.payload) {
                Ok(item) => {
                    warn!(
                        key = %item.idempotency_key,
                        deliveries = letter.delivery_count,
                        "work item dead-lettered"
                    );
                    results.push(StepResult::failure(
                        &item,
                        ErrorKind::PermanentOperation,
                        format!("dead-lettered: {}", letter.reason),
                    ));
                }
                Err(e) => error!("discarding undecodable dead letter: {e}"),
            }
        }
        Ok(results)
    }

    /// Deliver one pending result (or dead letter) to `handler`.
    ///
    /// Returns whether anything was handled. A transient handler error leaves
    /// the result on the queue for another try; any other error is logged and
    /// the result dropped.
    pub async fn pump_once(&self, handler: &dyn ResultHandler) -> Result<bool> {
        for result in self.drain_dead_letters(16).await? {
            if let Err(e) = handler.handle_result(result).await {
                error!("dead-letter result handling failed: {e}");
            }
        }

        let Some(delivery) = self.transport.receive(RESULT_QUEUE, self.visibility).await? else {
            return Ok(false);
        };
        let result = match serde_json::from_str::<StepResult>(&delivery.payload) {
            Ok(result) => result,
            Err(e) => {
                error!(token = %delivery.token, "malformed result: {e}");
                self.transport
                    .reject(&delivery.token, &format!("malformed result: {e}"))
                    .await?;
                return Ok(true);
            }
        };

        match handler.handle_result(result).await {
            Ok(()) => {
                self.transport.ack(&delivery.token).await?;
            }
            Err(e) if e.kind().is_transient() => {
                warn!("result handling failed, will redeliver: {e}");
                self.transport.nack(&delivery.token, self.poll_interval).await?;
            }
            Err(e) => {
                error!("result handling failed permanently: {e}");
                self.transport.ack(&delivery.token).await?;
            }
        }
        Ok(true)
    }

    /// Spawn a task feeding every result to `handler` until `shutdown`.
    pub fn on_result(&self, handler: Arc<dyn ResultHandler>, shutdown: Shutdown) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            info!("result pump started");
            loop {
                if shutdown.is_triggered() {
                    break;
                }
                let idle = match dispatcher.pump_once(handler.as_ref()).await {
                    Ok(handled) => !handled,
                    Err(e) => {
                        error!("result pump error: {e}");
                        true
                    }
                };
                if idle {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(dispatcher.poll_interval) => {}
                    }
                }
            }
            info!("result pump stopped");
        })
    }

    pub async fn work_depth(&self) -> Result<QueueDepth> {
        self.transport.depth(WORK_QUEUE).await
    }

    pub async fn result_depth(&self) -> Result<QueueDepth> {
        self.transport.depth(RESULT_QUEUE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_queue::SqliteQueue;
    use chrono::Utc;
    use pagewerk_core::error::PagewerkError;
    use pagewerk_core::{
        DocumentId, JobId, Operation, PageId, Step, StepKey, StepOutcome, StepOutput, StepStatus,
    };
    use std::sync::Mutex;

    fn dispatcher(max_deliveries: u32) -> Dispatcher {
        let queue = SqliteQueue::open_in_memory(max_deliveries).expect("queue");
        Dispatcher::new(Arc::new(queue), Duration::ZERO, Duration::from_millis(5))
    }

    fn item() -> WorkItem {
        let step = Step {
            key: StepKey::new(JobId::new(), 0),
            operation: Operation::Delete {
                pages: vec![PageId::new()],
            },
            input_document: DocumentId::new(),
            input_version: 1,
            attempt: 1,
            deadline: Utc::now() + chrono::Duration::minutes(5),
            status: StepStatus::Dispatched,
            committed_version: None,
        };
        WorkItem::for_step(&step, Vec::new()).expect("work item")
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<StepResult>>,
        fail_first_with: Mutex<Option<PagewerkError>>,
    }

    #[async_trait]
    impl ResultHandler for Recorder {
        async fn handle_result(&self, result: StepResult) -> Result<()> {
            if let Some(err) = self.fail_first_with.lock().expect("lock").take() {
                return Err(err);
            }
            self.seen.lock().expect("lock").push(result);
            Ok(())
        }
    }

    #[tokio::test]
    async fn work_item_round_trips_through_the_queue() {
        let d = dispatcher(5);
        let published = item();
        d.publish(&published, Duration::ZERO).await.expect("publish");

        let delivery = d.next_work().await.expect("next").expect("work");
        assert_eq!(delivery.item, published);
        assert!(d.ack(&delivery.token).await.expect("ack"));
        assert!(d.next_work().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn results_reach_the_handler_once_acked() {
        let d = dispatcher(5);
        let work = item();
        d.report(&StepResult::success(&work, StepOutput::default()))
            .await
            .expect("report");

        let recorder = Recorder::default();
        assert!(d.pump_once(&recorder).await.expect("pump"));
        assert!(!d.pump_once(&recorder).await.expect("pump idle"));
        let seen = recorder.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].idempotency_key, work.idempotency_key);
    }

    #[tokio::test]
    async fn transient_handler_error_redelivers_the_result() {
        let d = Dispatcher::new(
            Arc::new(SqliteQueue::open_in_memory(5).expect("queue")),
            Duration::ZERO,
            Duration::ZERO,
        );
        let work = item();
        d.report(&StepResult::success(&work, StepOutput::default()))
            .await
            .expect("report");

        let recorder = Recorder {
            fail_first_with: Mutex::new(Some(PagewerkError::Database("busy".into()))),
            ..Default::default()
        };
        d.pump_once(&recorder).await.expect("first pump");
        d.pump_once(&recorder).await.expect("second pump");
        assert_eq!(recorder.seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_work_surfaces_as_permanent_failure() {
        let d = dispatcher(1);
        let work = item();
        d.publish(&work, Duration::ZERO).await.expect("publish");

        // Delivered once, never acked, then dead-lettered on the next receive.
        assert!(d.next_work().await.expect("next").is_some());
        assert!(d.next_work().await.expect("next").is_none());

        let results = d.drain_dead_letters(10).await.expect("drain");
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            StepOutcome::Failure(f) => assert_eq!(f.kind, ErrorKind::PermanentOperation),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(results[0].step_key(), work.step_key());
    }

    #[tokio::test]
    async fn malformed_work_is_rejected_not_returned() {
        let queue = Arc::new(SqliteQueue::open_in_memory(5).expect("queue"));
        queue
            .publish(WORK_QUEUE, "{\"garbage\":true}", Duration::ZERO)
            .await
            .expect("publish");
        let d = Dispatcher::new(queue.clone(), Duration::ZERO, Duration::ZERO);
        assert!(d.next_work().await.expect("next").is_none());
        assert_eq!(d.work_depth().await.expect("depth").dead, 1);
    }

    #[tokio::test]
    async fn pump_task_stops_on_shutdown() {
        let d = dispatcher(5);
        let recorder = Arc::new(Recorder::default());
        let shutdown = Shutdown::new();
        let handle = d.on_result(recorder.clone(), shutdown.clone());

        d.report(&StepResult::success(&item(), StepOutput::default()))
            .await
            .expect("report");
        for _ in 0..100 {
            if !recorder.seen.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump stopped")
            .expect("join");
        assert_eq!(recorder.seen.lock().expect("lock").len(), 1);
    }
}
