use crate::models::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Unit of work moving through the queues. Serializes to the wire shape
/// `{id, type, data, attempts, maxAttempts, scheduledAt, processedAt}` with
/// the variant tag in `type` and the variant fields under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub id: String,
    #[serde(flatten)]
    pub job: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl JobMessage {
    pub fn new(job: JobPayload) -> Self {
        Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            job,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.job.stage()
    }

    pub fn tenant_id(&self) -> &str {
        self.job.tenant_id()
    }
}

/// One payload shape per message type. Autopilot-originated variants carry the
/// same data as their request-driven twins but keep a distinct tag so the
/// origin stays visible in logs and stored rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    ScrapeProduct(ScrapeJob),
    AiScoreProduct(ScoreJob),
    ProcessProductOrder(OrderJob),
    AutopilotScrape(ScrapeJob),
    AutopilotAiAnalysis(ScoreJob),
    AutopilotCreateOrder(OrderJob),
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::ScrapeProduct(_) | JobPayload::AutopilotScrape(_) => Stage::Scrape,
            JobPayload::AiScoreProduct(_) | JobPayload::AutopilotAiAnalysis(_) => Stage::Score,
            JobPayload::ProcessProductOrder(_) | JobPayload::AutopilotCreateOrder(_) => {
                Stage::Order
            }
        }
    }

    pub fn is_autopilot(&self) -> bool {
        matches!(
            self,
            JobPayload::AutopilotScrape(_)
                | JobPayload::AutopilotAiAnalysis(_)
                | JobPayload::AutopilotCreateOrder(_)
        )
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            JobPayload::ScrapeProduct(job) | JobPayload::AutopilotScrape(job) => &job.tenant_id,
            JobPayload::AiScoreProduct(job) | JobPayload::AutopilotAiAnalysis(job) => {
                &job.tenant_id
            }
            JobPayload::ProcessProductOrder(job) | JobPayload::AutopilotCreateOrder(job) => {
                &job.tenant_id
            }
        }
    }

    /// The thing the job is about: the source URL for scrapes, the product id
    /// for everything else. Used to key task progress per unit of work.
    pub fn subject(&self) -> &str {
        match self {
            JobPayload::ScrapeProduct(job) | JobPayload::AutopilotScrape(job) => &job.url,
            JobPayload::AiScoreProduct(job) | JobPayload::AutopilotAiAnalysis(job) => {
                &job.product_id
            }
            JobPayload::ProcessProductOrder(job) | JobPayload::AutopilotCreateOrder(job) => {
                &job.product_id
            }
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            JobPayload::ScrapeProduct(job) | JobPayload::AutopilotScrape(job) => {
                job.task_id.as_deref()
            }
            JobPayload::AiScoreProduct(job) | JobPayload::AutopilotAiAnalysis(job) => {
                job.task_id.as_deref()
            }
            JobPayload::ProcessProductOrder(job) | JobPayload::AutopilotCreateOrder(job) => {
                job.task_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeJob {
    pub url: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreJob {
    pub product_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderJob {
    pub product_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Unit price agreed when the order was created; without it the order
    /// stage falls back to the live catalog price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scrape,
    Score,
    Order,
}

impl Stage {
    /// Coarse routing used before the payload is validated: any tag mentioning
    /// SCRAPE goes to the scrape handler, then AI, then ORDER. Tags matching
    /// none of the three are dropped by the dispatcher.
    pub fn from_type_tag(tag: &str) -> Option<Stage> {
        if tag.contains("SCRAPE") {
            Some(Stage::Scrape)
        } else if tag.contains("AI") {
            Some(Stage::Score)
        } else if tag.contains("ORDER") {
            Some(Stage::Order)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Score => "score",
            Stage::Order => "order",
        }
    }
}
