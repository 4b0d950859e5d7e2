use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Uniform response envelope returned by every HTTP handler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub request_id: String,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T, request_id: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id: request_id.into(),
        }
    }

    pub fn err(error: ApiErrorBody, request_id: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            request_id: request_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Tenant-scoped catalog entity. Created by the scrape stage, enriched with
/// scores by the AI stage; the pipeline never deletes products.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub images: Vec<String>,
    pub availability: bool,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub source_url: String,
    pub ai_score: Option<u8>,
    pub price_score: Option<u8>,
    pub demand_score: Option<u8>,
    pub sentiment_score: Option<u8>,
    #[serde(default)]
    pub stock_quantity: u32,
    pub auto_order_threshold: Option<u32>,
    #[serde(default)]
    pub automation_enabled: bool,
    pub supplier_id: Option<String>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn has_scores(&self) -> bool {
        self.price_score.is_some() && self.demand_score.is_some() && self.sentiment_score.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Forward path: CREATED -> PROCESSING -> SHIPPED -> DELIVERED, with
    /// CANCELLED/FAILED reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Created => false,
            OrderStatus::Processing => matches!(self, OrderStatus::Created),
            OrderStatus::Shipped => matches!(self, OrderStatus::Processing),
            OrderStatus::Delivered => matches!(self, OrderStatus::Shipped),
            OrderStatus::Cancelled | OrderStatus::Failed => true,
        }
    }
}

/// Immutable snapshot of a product reference at order-creation time. Unit
/// prices are copied, never re-read from the live product row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub tenant_id: String,
    pub supplier_id: Option<String>,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub destination: Address,
    pub tracking_code: Option<String>,
    pub supplier_order_id: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub total_amount: f64,
    pub currency: String,
    #[serde(default)]
    pub auto_created: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Predicate half of an automation rule. Absent fields do not constrain.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    pub min_ai_score: Option<u8>,
    pub max_stock: Option<u32>,
    pub max_price: Option<f64>,
    pub category: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleActions {
    #[serde(default)]
    pub create_order: bool,
    #[serde(default)]
    pub alert: bool,
    pub update_price: Option<f64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    pub enabled: bool,
    #[serde(default)]
    pub executions: u64,
    #[serde(default)]
    pub successes: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl AutomationRule {
    pub fn matches(&self, product: &Product) -> bool {
        let conditions = &self.conditions;
        if let Some(min) = conditions.min_ai_score
            && product.ai_score.unwrap_or(0) < min
        {
            return false;
        }
        if let Some(max) = conditions.max_stock
            && product.stock_quantity > max
        {
            return false;
        }
        if let Some(max) = conditions.max_price
            && product.price > max
        {
            return false;
        }
        if let Some(category) = &conditions.category
            && product.category.as_deref() != Some(category.as_str())
        {
            return false;
        }
        true
    }
}

/// Per-tenant autopilot settings, read at the start of every run and mutated
/// only through the config endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_daily_orders")]
    pub max_daily_orders: u32,
    #[serde(default = "default_max_order_value")]
    pub max_order_value: f64,
    #[serde(default = "default_min_ai_score")]
    pub min_ai_score: u8,
    #[serde(default = "default_auto_order_threshold")]
    pub auto_order_threshold: u32,
    #[serde(default)]
    pub monitor_urls: Vec<String>,
    #[serde(default = "default_budget_limit")]
    pub budget_limit: f64,
    #[serde(default = "default_supplier_priority")]
    pub supplier_priority: Vec<String>,
}

fn default_max_daily_orders() -> u32 {
    10
}

fn default_max_order_value() -> f64 {
    1000.0
}

fn default_min_ai_score() -> u8 {
    70
}

fn default_auto_order_threshold() -> u32 {
    5
}

fn default_budget_limit() -> f64 {
    5000.0
}

fn default_supplier_priority() -> Vec<String> {
    vec!["amazon".to_string(), "aliexpress".to_string()]
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily_orders: default_max_daily_orders(),
            max_order_value: default_max_order_value(),
            min_ai_score: default_min_ai_score(),
            auto_order_threshold: default_auto_order_threshold(),
            monitor_urls: Vec::new(),
            budget_limit: default_budget_limit(),
            supplier_priority: default_supplier_priority(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Error,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub last_sync_status: Option<SyncStatus>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Aggregate progress of a scrape import task, keyed by task id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl TaskProgress {
    pub fn status(&self) -> &'static str {
        if self.completed + self.failed >= self.total {
            "DONE"
        } else {
            "PROCESSING"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub orders_count: u32,
    pub total_spent: f64,
}

// -------- HTTP request / response bodies --------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeImportRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeImportResponse {
    pub task_id: String,
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiScoreRequest {
    pub product_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiScoreResponse {
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItem>,
    pub destination: Address,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_ids: Vec<String>,
    pub status: OrderStatus,
}

#[cfg(test)]
pub(crate) fn sample_product(tenant_id: &str, source_url: &str) -> Product {
    let now = Utc::now();
    Product {
        id: format!("prod_{}", uuid::Uuid::new_v4().simple()),
        tenant_id: tenant_id.to_string(),
        title: "Wireless Earphones TWS Pro".into(),
        description: "High quality wireless earphones.".into(),
        price: 45.99,
        currency: "USD".into(),
        images: vec![],
        availability: true,
        sku: None,
        brand: None,
        category: Some("Electronics".into()),
        source_url: source_url.to_string(),
        ai_score: None,
        price_score: None,
        demand_score: None,
        sentiment_score: None,
        stock_quantity: 0,
        auto_order_threshold: None,
        automation_enabled: false,
        supplier_id: None,
        last_scraped_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_forward_path() {
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Created.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Processing.can_transition_to(OrderStatus::Created));
    }

    #[test]
    fn order_status_terminal_states_are_sinks() {
        for terminal in [
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert!(!terminal.can_transition_to(OrderStatus::Processing));
            assert!(!terminal.can_transition_to(OrderStatus::Cancelled));
        }
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn rule_matching_respects_all_conditions() {
        let rule = AutomationRule {
            id: "rule-1".into(),
            tenant_id: "t1".into(),
            name: "restock electronics".into(),
            conditions: RuleConditions {
                min_ai_score: Some(70),
                max_stock: Some(5),
                max_price: Some(500.0),
                category: Some("Electronics".into()),
            },
            actions: RuleActions::default(),
            enabled: true,
            executions: 0,
            successes: 0,
            last_run_at: None,
        };

        let mut product = sample_product("t1", "https://example.com/p/1");
        product.ai_score = Some(80);
        product.stock_quantity = 2;
        product.price = 120.0;
        assert!(rule.matches(&product));

        product.stock_quantity = 9;
        assert!(!rule.matches(&product));

        product.stock_quantity = 2;
        product.category = Some("Toys".into());
        assert!(!rule.matches(&product));
    }
}
