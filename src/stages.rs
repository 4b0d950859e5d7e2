use crate::connectors::{Connectors, OrderDraft};
use crate::message::{JobMessage, JobPayload, OrderJob, ScoreJob, ScrapeJob, Stage};
use crate::models::{Address, Order, OrderItem, OrderStatus};
use crate::queue::Queues;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error)]
#[error("{stage}: {message}")]
pub struct StageError {
    stage: &'static str,
    message: String,
    kind: StageErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    InvalidInput,
    Internal,
}

impl StageError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: StageErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: StageErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> StageErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// The three pipeline stages, bound to a connector set, the store and the
/// downstream queues. One instance is shared by all consumers.
pub struct StageHandlers<C> {
    pub connectors: Arc<C>,
    pub store: Store,
    pub queues: Queues,
}

impl<C> Clone for StageHandlers<C> {
    fn clone(&self) -> Self {
        Self {
            connectors: self.connectors.clone(),
            store: self.store.clone(),
            queues: self.queues.clone(),
        }
    }
}

pub fn order_id_for(message_id: &str) -> String {
    format!("ord_{}", message_id.trim_start_matches("job_"))
}

/// Fallback ship-to when a job does not carry one; auto-reorders restock the
/// tenant's fulfillment center.
pub fn warehouse_destination() -> Address {
    Address {
        street: "100 Fulfillment Way".into(),
        city: "Wilmington".into(),
        state: "DE".into(),
        zip_code: "19801".into(),
        country: "US".into(),
    }
}

impl<C: Connectors> StageHandlers<C> {
    pub fn new(connectors: Arc<C>, store: Store, queues: Queues) -> Self {
        Self {
            connectors,
            store,
            queues,
        }
    }

    /// Entry point used by the dispatcher once a message has been routed and
    /// validated. The payload must belong to the routed stage.
    pub async fn run_stage(&self, stage: Stage, message: &JobMessage) -> Result<(), StageError> {
        if message.stage() != stage {
            return Err(StageError::invalid_input(
                stage.as_str(),
                format!("payload does not belong to the {} stage", stage.as_str()),
            ));
        }
        let autopilot = message.job.is_autopilot();
        match &message.job {
            JobPayload::ScrapeProduct(job) | JobPayload::AutopilotScrape(job) => {
                self.handle_scrape(job, autopilot).await
            }
            JobPayload::AiScoreProduct(job) | JobPayload::AutopilotAiAnalysis(job) => {
                self.handle_score(job, autopilot).await
            }
            JobPayload::ProcessProductOrder(job) | JobPayload::AutopilotCreateOrder(job) => {
                self.handle_order(&message.id, job, autopilot).await
            }
        }
    }

    /// Scrape stage: fetch the source page, upsert the catalog row, then hand
    /// the product to the scoring stage.
    pub async fn handle_scrape(&self, job: &ScrapeJob, autopilot: bool) -> Result<(), StageError> {
        let scraped = self
            .connectors
            .scrape(&job.url)
            .await
            .map_err(|err| StageError::internal("scrape", err.to_string()))?;

        let product = self
            .store
            .upsert_product_from_scrape(&job.tenant_id, &scraped)
            .await;
        if let Some(task_id) = &job.task_id {
            self.store.task_completed(task_id, &job.url);
        }
        info!(
            target: "dropflow.stages",
            tenant_id = %job.tenant_id,
            product_id = %product.id,
            autopilot,
            "product scraped"
        );

        let score_job = ScoreJob {
            product_id: product.id,
            tenant_id: job.tenant_id.clone(),
            user_id: job.user_id.clone(),
            task_id: None,
        };
        let payload = if autopilot {
            JobPayload::AutopilotAiAnalysis(score_job)
        } else {
            JobPayload::AiScoreProduct(score_job)
        };
        self.queues
            .ai
            .send(&JobMessage::new(payload))
            .await
            .map_err(|err| StageError::internal("scrape", err.to_string()))
    }

    /// Scoring stage: run the analysis, persist the scores, and enqueue an
    /// order job only for strong candidates.
    pub async fn handle_score(&self, job: &ScoreJob, autopilot: bool) -> Result<(), StageError> {
        let product = self
            .store
            .product(&job.tenant_id, &job.product_id)
            .await
            .ok_or_else(|| {
                StageError::invalid_input("score", format!("product `{}` not found", job.product_id))
            })?;

        let analysis = self
            .connectors
            .analyze(&product)
            .await
            .map_err(|err| StageError::internal("score", err.to_string()))?;
        self.store
            .update_scores(&job.tenant_id, &job.product_id, &analysis)
            .await
            .map_err(|err| StageError::internal("score", err.to_string()))?;

        if !analysis.warrants_order() {
            info!(
                target: "dropflow.stages",
                product_id = %job.product_id,
                overall = analysis.overall(),
                "analysis complete, below order bar"
            );
            return Ok(());
        }

        let order_job = OrderJob {
            product_id: job.product_id.clone(),
            tenant_id: job.tenant_id.clone(),
            user_id: job.user_id.clone(),
            task_id: None,
            quantity: None,
            max_value: None,
            unit_price: None,
            currency: None,
            destination: None,
        };
        let payload = if autopilot {
            JobPayload::AutopilotCreateOrder(order_job)
        } else {
            JobPayload::ProcessProductOrder(order_job)
        };
        self.queues
            .order
            .send(&JobMessage::new(payload))
            .await
            .map_err(|err| StageError::internal("score", err.to_string()))
    }

    /// Order stage: place the supplier order and persist the result. The
    /// order id derives from the message id, so a redelivery of the same
    /// message updates the row it already created instead of duplicating it.
    pub async fn handle_order(
        &self,
        message_id: &str,
        job: &OrderJob,
        autopilot: bool,
    ) -> Result<(), StageError> {
        let product = self
            .store
            .product(&job.tenant_id, &job.product_id)
            .await
            .ok_or_else(|| {
                StageError::invalid_input("order", format!("product `{}` not found", job.product_id))
            })?;

        // A job carrying a creation-time price snapshot keeps it; jobs fed by
        // the scoring stage or autopilot use the live catalog price.
        let unit_price = job.unit_price.unwrap_or(product.price);
        let currency = job.currency.clone().unwrap_or_else(|| product.currency.clone());
        let quantity = job.quantity.unwrap_or(1).max(1);
        let total_amount = unit_price * quantity as f64;
        if let Some(max_value) = job.max_value
            && total_amount > max_value
        {
            return Err(StageError::invalid_input(
                "order",
                format!("order value {total_amount:.2} exceeds cap {max_value:.2}"),
            ));
        }

        let order_id = order_id_for(message_id);
        let supplier_priority = self
            .store
            .tenant(&job.tenant_id)
            .map(|tenant| tenant.autopilot.supplier_priority)
            .unwrap_or_default();
        let destination = job.destination.clone().unwrap_or_else(warehouse_destination);
        let items = vec![OrderItem {
            product_id: product.id.clone(),
            quantity,
            price: unit_price,
        }];

        let draft = OrderDraft {
            order_id: order_id.clone(),
            tenant_id: job.tenant_id.clone(),
            items: items.clone(),
            destination: destination.clone(),
            total_amount,
            currency: currency.clone(),
            supplier_priority,
        };
        let placed = self
            .connectors
            .place_order(&draft)
            .await
            .map_err(|err| StageError::internal("order", err.to_string()))?;

        let now = Utc::now();
        let order = Order {
            id: order_id.clone(),
            tenant_id: job.tenant_id.clone(),
            supplier_id: Some(placed.supplier.clone()),
            status: OrderStatus::Processing,
            items,
            destination,
            tracking_code: Some(placed.tracking_code),
            supplier_order_id: Some(placed.supplier_order_id),
            estimated_delivery: Some(placed.estimated_delivery),
            total_amount,
            currency,
            auto_created: autopilot,
            created_at: now,
            updated_at: now,
        };
        self.store
            .upsert_order(&order)
            .await
            .map_err(|err| StageError::internal("order", err.to_string()))?;

        if autopilot {
            // Committed inbound stock, so the reorder scan stops flagging the
            // product while the shipment is on its way.
            self.store.adjust_stock(&job.product_id, quantity as i64);
        }
        self.connectors
            .sync_stock(&placed.supplier)
            .await
            .map_err(|err| StageError::internal("order", err.to_string()))?;
        info!(
            target: "dropflow.stages",
            order_id = %order_id,
            supplier = %placed.supplier,
            autopilot,
            "order placed"
        );
        Ok(())
    }

    /// Bookkeeping for a message the dispatcher gave up on.
    pub fn record_terminal_failure(&self, message: &JobMessage, error: &StageError) {
        if let Some(task_id) = message.job.task_id() {
            self.store.task_failed(task_id, message.job.subject());
        }
        self.store.log_tenant_error(
            message.tenant_id(),
            error.stage(),
            error.detail(),
        );
        warn!(
            target: "dropflow.stages",
            message_id = %message.id,
            stage = error.stage(),
            "job failed terminally"
        );
    }
}
