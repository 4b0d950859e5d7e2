use crate::connectors::Connectors;
use crate::message::{JobMessage, Stage};
use crate::metrics;
use crate::queue::{Delivery, QueueReceiver};
use crate::stages::StageHandlers;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

const BATCH_MAX: usize = 10;

pub fn retry_base_from_env() -> Duration {
    let millis = std::env::var("RETRY_BASE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1000);
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { attempts: u32, delay: Duration },
    Drop,
}

/// Failure bookkeeping for one message. Attempts count failures: a message
/// that has failed `max_attempts` times is dropped, so a message with
/// `max_attempts = 3` is tried three times and redelivered twice. The delay
/// doubles per recorded failure from `base`.
pub fn retry_decision(message: &JobMessage, base: Duration) -> Disposition {
    let attempts = message.attempts + 1;
    if attempts >= message.max_attempts {
        Disposition::Drop
    } else {
        Disposition::Retry {
            attempts,
            delay: base * 2u32.saturating_pow(attempts),
        }
    }
}

/// Spawns the consumer loop for one queue. The loop pulls small batches and
/// resolves every delivery exactly once, by ack or by scheduling a retry.
pub fn spawn<C: Connectors>(
    handlers: StageHandlers<C>,
    mut receiver: QueueReceiver,
    retry_base: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(target: "dropflow.dispatch", queue = receiver.name(), "consumer started");
        while let Some(batch) = receiver.next_batch(BATCH_MAX).await {
            for delivery in batch {
                process_delivery(&handlers, delivery, retry_base).await;
            }
        }
        info!(target: "dropflow.dispatch", "consumer stopped, queue closed");
    })
}

/// Routes one delivery. Routing happens on the raw `type` tag before the
/// payload is validated; messages that route nowhere or fail validation are
/// acknowledged and never retried, since redelivery cannot fix them.
pub async fn process_delivery<C: Connectors>(
    handlers: &StageHandlers<C>,
    delivery: Delivery,
    retry_base: Duration,
) {
    let queue = delivery.queue_name();
    let Some(tag) = delivery.body["type"].as_str().map(str::to_owned) else {
        warn!(target: "dropflow.dispatch", queue, "message without a type tag, dropping");
        metrics::job_dropped(queue, "missing_type");
        delivery.ack();
        return;
    };

    let Some(stage) = Stage::from_type_tag(&tag) else {
        warn!(target: "dropflow.dispatch", queue, tag, "unroutable message type, dropping");
        metrics::job_dropped(queue, "unknown_type");
        delivery.ack();
        return;
    };

    let mut message: JobMessage = match serde_json::from_value(delivery.body.clone()) {
        Ok(message) => message,
        Err(err) => {
            warn!(target: "dropflow.dispatch", queue, tag, error = %err, "malformed payload, dropping");
            metrics::job_dropped(queue, "malformed_payload");
            delivery.ack();
            return;
        }
    };

    let started = Instant::now();
    match handlers.run_stage(stage, &message).await {
        Ok(()) => {
            metrics::job_processed(queue, stage.as_str(), started.elapsed().as_millis());
            delivery.ack();
        }
        Err(err) => match retry_decision(&message, retry_base) {
            Disposition::Retry { attempts, delay } => {
                message.attempts = attempts;
                warn!(
                    target: "dropflow.dispatch",
                    queue,
                    message_id = %message.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "stage failed, scheduling retry"
                );
                metrics::job_retried(queue, attempts);
                match serde_json::to_value(&message) {
                    Ok(body) => delivery.retry(body, delay),
                    Err(encode_err) => {
                        error!(target: "dropflow.dispatch", queue, error = %encode_err, "retry encode failed, dropping");
                        delivery.ack();
                    }
                }
            }
            Disposition::Drop => {
                error!(
                    target: "dropflow.dispatch",
                    queue,
                    message_id = %message.id,
                    attempts = message.attempts + 1,
                    max_attempts = message.max_attempts,
                    error = %err,
                    "retries exhausted, dropping message"
                );
                metrics::job_dropped(queue, "retries_exhausted");
                handlers.record_terminal_failure(&message, &err);
                delivery.ack();
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JobPayload, ScrapeJob};
    use crate::queue::Queues;
    use crate::stages::testing::ScriptedConnectors;
    use crate::store::{KvStore, Store};
    use std::sync::Arc;
    use tokio::time::timeout;

    fn scrape_message(attempts: u32) -> JobMessage {
        let mut message = JobMessage::new(JobPayload::ScrapeProduct(ScrapeJob {
            url: "https://example.com/p/1".into(),
            tenant_id: "t1".into(),
            user_id: None,
            task_id: None,
        }));
        message.attempts = attempts;
        message
    }

    #[test]
    fn three_attempts_mean_two_redeliveries() {
        let base = Duration::from_millis(100);
        let mut message = scrape_message(0);
        assert_eq!(message.max_attempts, 3);

        match retry_decision(&message, base) {
            Disposition::Retry { attempts, delay } => {
                assert_eq!(attempts, 1);
                assert_eq!(delay, Duration::from_millis(200));
                message.attempts = attempts;
            }
            Disposition::Drop => panic!("first failure must retry"),
        }
        match retry_decision(&message, base) {
            Disposition::Retry { attempts, delay } => {
                assert_eq!(attempts, 2);
                assert_eq!(delay, Duration::from_millis(400));
                message.attempts = attempts;
            }
            Disposition::Drop => panic!("second failure must retry"),
        }
        assert_eq!(retry_decision(&message, base), Disposition::Drop);
    }

    fn failing_handlers() -> (
        StageHandlers<ScriptedConnectors>,
        crate::queue::QueueReceivers,
    ) {
        let (queues, receivers) = Queues::bounded(16);
        let connectors = ScriptedConnectors {
            fail_scrape: true,
            ..Default::default()
        };
        let store = Store::new(KvStore::in_memory());
        (
            StageHandlers::new(Arc::new(connectors), store, queues),
            receivers,
        )
    }

    #[tokio::test]
    async fn failed_stage_is_redelivered_with_incremented_attempts() {
        let (handlers, mut receivers) = failing_handlers();
        handlers
            .queues
            .scrape
            .send(&scrape_message(0))
            .await
            .expect("send");

        let mut batch = receivers.scrape.next_batch(1).await.expect("delivery");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;

        let redelivered = timeout(Duration::from_secs(1), receivers.scrape.next_batch(1))
            .await
            .expect("within deadline")
            .expect("redelivery");
        assert_eq!(redelivered[0].body["attempts"], 1);
    }

    #[tokio::test]
    async fn exhausted_message_is_dropped_not_redelivered() {
        let (handlers, mut receivers) = failing_handlers();
        let task_id = handlers.store.task_started(1);
        let mut message = scrape_message(2);
        if let JobPayload::ScrapeProduct(job) = &mut message.job {
            job.task_id = Some(task_id.clone());
        }
        handlers.queues.scrape.send(&message).await.expect("send");

        let mut batch = receivers.scrape.next_batch(1).await.expect("delivery");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;

        assert!(
            timeout(Duration::from_millis(50), receivers.scrape.next_batch(1))
                .await
                .is_err(),
            "a message at its attempt limit must not be redelivered"
        );
        let task = handlers.store.task(&task_id).expect("task");
        assert_eq!(task.failed, 1);
        assert_eq!(handlers.store.tenant_errors("t1").len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_acked_without_retry() {
        let (handlers, mut receivers) = failing_handlers();
        handlers
            .queues
            .scrape
            .send_raw(serde_json::json!({
                "id": "job_x",
                "type": "BILLING_SYNC",
                "data": {},
                "attempts": 0,
                "maxAttempts": 3,
                "scheduledAt": chrono::Utc::now(),
            }))
            .await
            .expect("send");

        let mut batch = receivers.scrape.next_batch(1).await.expect("delivery");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;
        assert!(
            timeout(Duration::from_millis(50), receivers.scrape.next_batch(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_without_retry() {
        let (handlers, mut receivers) = failing_handlers();
        handlers
            .queues
            .scrape
            .send_raw(serde_json::json!({
                "type": "SCRAPE_PRODUCT",
                "data": { "url": 42 },
            }))
            .await
            .expect("send");

        let mut batch = receivers.scrape.next_batch(1).await.expect("delivery");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;
        assert!(
            timeout(Duration::from_millis(50), receivers.scrape.next_batch(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn pipeline_chains_scrape_score_and_order() {
        let (queues, mut receivers) = Queues::bounded(16);
        let connectors = ScriptedConnectors::default();
        connectors.set_analysis(crate::stages::testing::high_analysis());
        let handlers = StageHandlers::new(
            Arc::new(connectors),
            Store::new(KvStore::in_memory()),
            queues,
        );

        handlers
            .queues
            .scrape
            .send(&scrape_message(0))
            .await
            .expect("send");
        let mut batch = receivers.scrape.next_batch(1).await.expect("scrape");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;

        let product = handlers
            .store
            .product_by_source_url("t1", "https://example.com/p/1")
            .expect("product persisted");

        let mut batch = receivers.ai.next_batch(1).await.expect("score");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;
        let scored = handlers.store.product("t1", &product.id).await.expect("scored");
        assert!(scored.has_scores());

        let mut batch = receivers.order.next_batch(1).await.expect("order");
        let order_message: JobMessage =
            serde_json::from_value(batch[0].body.clone()).expect("order message");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;

        let order = handlers
            .store
            .order("t1", &crate::stages::order_id_for(&order_message.id))
            .await
            .expect("order persisted");
        assert_eq!(order.tenant_id, "t1");
        assert!(!order.items.is_empty());
        assert_eq!(order.items[0].product_id, product.id);
    }

    #[tokio::test]
    async fn successful_stage_is_acked_and_feeds_downstream() {
        let (queues, mut receivers) = Queues::bounded(16);
        let handlers = StageHandlers::new(
            Arc::new(ScriptedConnectors::default()),
            Store::new(KvStore::in_memory()),
            queues,
        );
        handlers
            .queues
            .scrape
            .send(&scrape_message(0))
            .await
            .expect("send");

        let mut batch = receivers.scrape.next_batch(1).await.expect("delivery");
        process_delivery(&handlers, batch.pop().unwrap(), Duration::from_millis(1)).await;

        let ai = receivers.ai.next_batch(1).await.expect("downstream job");
        assert_eq!(ai[0].body["type"], "AI_SCORE_PRODUCT");
        assert!(
            timeout(Duration::from_millis(50), receivers.scrape.next_batch(1))
                .await
                .is_err()
        );
    }
}
