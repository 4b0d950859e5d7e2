use crate::message::JobMessage;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::warn;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue `{0}` is not accepting messages")]
    Closed(&'static str),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Producer handle for one named queue. The transport is an in-process
/// bounded channel standing in for the managed queue service; delivery and
/// durability guarantees live with that service, not here.
#[derive(Clone)]
pub struct Queue {
    name: &'static str,
    tx: mpsc::Sender<Value>,
}

impl Queue {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
        let body = serde_json::to_value(message).map_err(|err| QueueError::Encode(err.to_string()))?;
        self.send_raw(body).await
    }

    pub(crate) async fn send_raw(&self, body: Value) -> Result<(), QueueError> {
        self.tx
            .send(body)
            .await
            .map_err(|_| QueueError::Closed(self.name))
    }
}

/// Consumer side of a named queue. Holds a producer clone so redeliveries can
/// be pushed back through the same channel.
pub struct QueueReceiver {
    name: &'static str,
    rx: mpsc::Receiver<Value>,
    sender: Queue,
}

impl QueueReceiver {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for at least one message, then drains whatever else is already
    /// pending up to `max`. Returns `None` once every producer is gone.
    pub async fn next_batch(&mut self, max: usize) -> Option<Vec<Delivery>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![self.delivery(first)];
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(body) => batch.push(self.delivery(body)),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    fn delivery(&self, body: Value) -> Delivery {
        Delivery {
            body,
            queue: self.sender.clone(),
        }
    }
}

/// One delivered message plus the acknowledge/retry capabilities the consumer
/// must resolve exactly once.
pub struct Delivery {
    pub body: Value,
    queue: Queue,
}

impl Delivery {
    pub fn queue_name(&self) -> &'static str {
        self.queue.name
    }

    /// Marks the message as done; for the in-process transport this simply
    /// drops it.
    pub fn ack(self) {}

    /// Schedules a redelivery of `body` after `delay`. Consumes the delivery
    /// so it cannot also be acknowledged.
    pub fn retry(self, body: Value, delay: Duration) {
        let queue = self.queue;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = queue.send_raw(body).await {
                warn!(target: "dropflow.queue", queue = queue.name, error = %err, "redelivery failed");
            }
        });
    }
}

pub fn channel(name: &'static str, capacity: usize) -> (Queue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let queue = Queue { name, tx };
    let receiver = QueueReceiver {
        name,
        rx,
        sender: queue.clone(),
    };
    (queue, receiver)
}

/// The three logical pipeline queues.
#[derive(Clone)]
pub struct Queues {
    pub scrape: Queue,
    pub ai: Queue,
    pub order: Queue,
}

pub struct QueueReceivers {
    pub scrape: QueueReceiver,
    pub ai: QueueReceiver,
    pub order: QueueReceiver,
}

impl Queues {
    pub fn bounded(capacity: usize) -> (Queues, QueueReceivers) {
        let (scrape, scrape_rx) = channel("scrape-queue", capacity);
        let (ai, ai_rx) = channel("ai-score-queue", capacity);
        let (order, order_rx) = channel("order-queue", capacity);
        (
            Queues { scrape, ai, order },
            QueueReceivers {
                scrape: scrape_rx,
                ai: ai_rx,
                order: order_rx,
            },
        )
    }
}

pub fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JobMessage, JobPayload, ScrapeJob};

    fn scrape_message(url: &str) -> JobMessage {
        JobMessage::new(JobPayload::ScrapeProduct(ScrapeJob {
            url: url.into(),
            tenant_id: "t1".into(),
            user_id: None,
            task_id: None,
        }))
    }

    #[tokio::test]
    async fn batch_drains_pending_messages() {
        let (queue, mut receiver) = channel("scrape-queue", 8);
        for i in 0..3 {
            queue
                .send(&scrape_message(&format!("https://example.com/{i}")))
                .await
                .expect("send");
        }

        let batch = receiver.next_batch(10).await.expect("batch");
        assert_eq!(batch.len(), 3);
        for delivery in batch {
            assert_eq!(delivery.body["type"], "SCRAPE_PRODUCT");
            delivery.ack();
        }
    }

    #[tokio::test]
    async fn retry_redelivers_after_delay() {
        let (queue, mut receiver) = channel("scrape-queue", 8);
        queue
            .send(&scrape_message("https://example.com/a"))
            .await
            .expect("send");

        let mut batch = receiver.next_batch(1).await.expect("batch");
        let delivery = batch.pop().expect("delivery");
        let mut body = delivery.body.clone();
        body["attempts"] = serde_json::json!(1);
        delivery.retry(body, Duration::from_millis(5));

        let redelivered = receiver.next_batch(1).await.expect("redelivery");
        assert_eq!(redelivered[0].body["attempts"], 1);
    }
}
