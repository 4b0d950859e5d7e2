use crate::connectors::{AiAnalysis, ScrapedProduct, detect_supplier};
use crate::models::{
    AutomationRule, AutopilotConfig, DailyStats, Order, Product, Supplier, SyncStatus, TaskProgress,
    Tenant,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid order status transition: {0}")]
    InvalidTransition(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Best-effort key/value tier. Backed by Redis when `REDIS_URL` is set,
/// otherwise by an in-process map with TTL emulation. Every operation
/// swallows backend errors: callers that depend on an answer must treat
/// `None` as "no information", which is what makes the rate limiter fail
/// open and the fallback reads optional.
#[derive(Clone)]
pub struct KvStore {
    client: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl KvStore {
    pub fn from_env() -> Self {
        let client = std::env::var("REDIS_URL").ok().and_then(|url| {
            match redis::Client::open(url.as_str()) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target: "dropflow.store", error = %err, "invalid REDIS_URL, using in-memory kv");
                    None
                }
            }
        });
        Self {
            client,
            memory: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            client: None,
            memory: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn put_json(&self, key: &str, value: &Value, ttl: Option<Duration>) {
        if let Some(client) = &self.client {
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let body = value.to_string();
                    let result: redis::RedisResult<()> = match ttl {
                        Some(ttl) => {
                            redis::cmd("SET")
                                .arg(key)
                                .arg(body)
                                .arg("EX")
                                .arg(ttl.as_secs().max(1))
                                .query_async(&mut conn)
                                .await
                        }
                        None => {
                            redis::cmd("SET")
                                .arg(key)
                                .arg(body)
                                .query_async(&mut conn)
                                .await
                        }
                    };
                    if let Err(err) = result {
                        warn!(target: "dropflow.store", key, error = %err, "kv write failed");
                    }
                    return;
                }
                Err(err) => {
                    warn!(target: "dropflow.store", key, error = %err, "kv unreachable, using in-memory fallback");
                }
            }
        }
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        memory.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub async fn get_json(&self, key: &str) -> Option<Value> {
        if let Some(client) = &self.client {
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let result: redis::RedisResult<Option<String>> =
                        redis::cmd("GET").arg(key).query_async(&mut conn).await;
                    return match result {
                        Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
                        Ok(None) => None,
                        Err(err) => {
                            warn!(target: "dropflow.store", key, error = %err, "kv read failed");
                            None
                        }
                    };
                }
                Err(err) => {
                    warn!(target: "dropflow.store", key, error = %err, "kv unreachable, reading in-memory fallback");
                }
            }
        }
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        match memory.get(key) {
            Some(entry) if entry.expired() => {
                memory.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Atomic counter increment with a TTL set on first touch. Returns `None`
    /// when the backend fails, which callers interpret as "cannot count".
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Option<u64> {
        if let Some(client) = &self.client {
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let count: redis::RedisResult<u64> =
                        redis::cmd("INCR").arg(key).query_async(&mut conn).await;
                    return match count {
                        Ok(count) => {
                            if count == 1 {
                                let _: redis::RedisResult<()> = redis::cmd("EXPIRE")
                                    .arg(key)
                                    .arg(ttl.as_secs().max(1))
                                    .query_async(&mut conn)
                                    .await;
                            }
                            Some(count)
                        }
                        Err(err) => {
                            warn!(target: "dropflow.store", key, error = %err, "kv incr failed");
                            None
                        }
                    };
                }
                Err(err) => {
                    warn!(target: "dropflow.store", key, error = %err, "kv unreachable for incr");
                    return None;
                }
            }
        }
        let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let entry = memory.get(key).filter(|entry| !entry.expired());
        let next = entry.and_then(|e| e.value.as_u64()).unwrap_or(0) + 1;
        let expires_at = if next == 1 {
            Some(Instant::now() + ttl)
        } else {
            entry.and_then(|e| e.expires_at)
        };
        memory.insert(
            key.to_string(),
            MemoryEntry {
                value: Value::from(next),
                expires_at,
            },
        );
        Some(next)
    }
}

#[derive(Default)]
struct Tables {
    products: HashMap<String, Product>,
    orders: HashMap<String, Order>,
    rules: HashMap<String, AutomationRule>,
    tenants: HashMap<String, Tenant>,
    suppliers: HashMap<String, Supplier>,
    tasks: HashMap<String, TaskRecord>,
    error_log: Vec<TenantErrorEntry>,
}

#[derive(Default)]
struct TaskRecord {
    progress: TaskProgress,
    resolved: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct TenantErrorEntry {
    pub tenant_id: String,
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Two-tier persistence: an in-process relational tier as the source of
/// truth, with the key/value tier carrying denormalized copies so pipeline
/// stages keep making progress when the primary is down. `primary_available`
/// is the fault switch used to exercise that degraded path.
#[derive(Clone)]
pub struct Store {
    tables: Arc<Mutex<Tables>>,
    pub kv: KvStore,
    primary_available: Arc<AtomicBool>,
}

impl Store {
    pub fn new(kv: KvStore) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            kv,
            primary_available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn from_env() -> Self {
        Self::new(KvStore::from_env())
    }

    pub fn set_primary_available(&self, available: bool) {
        self.primary_available.store(available, Ordering::SeqCst);
    }

    fn primary_up(&self) -> bool {
        self.primary_available.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------- products --------

    /// Creates or refreshes the product row for a scraped page. Idempotent on
    /// `(tenant_id, source_url)`: a re-scrape updates price, availability and
    /// `last_scraped_at` on the existing row instead of inserting a sibling.
    pub async fn upsert_product_from_scrape(
        &self,
        tenant_id: &str,
        scraped: &ScrapedProduct,
    ) -> Product {
        let now = Utc::now();
        let product = if self.primary_up() {
            let mut tables = self.lock();
            let existing_id = tables
                .products
                .values()
                .find(|p| p.tenant_id == tenant_id && p.source_url == scraped.url)
                .map(|p| p.id.clone());
            match existing_id {
                Some(id) => {
                    let product = tables
                        .products
                        .get_mut(&id)
                        .map(|product| {
                            product.title = scraped.title.clone();
                            product.description = scraped.description.clone();
                            product.price = scraped.price;
                            product.currency = scraped.currency.clone();
                            product.images = scraped.images.clone();
                            product.availability = scraped.availability;
                            product.last_scraped_at = Some(now);
                            product.updated_at = now;
                            product.clone()
                        });
                    // The id was looked up under the same lock.
                    product.unwrap_or_else(|| new_product_row(tenant_id, scraped, now))
                }
                None => {
                    let product = new_product_row(tenant_id, scraped, now);
                    tables.products.insert(product.id.clone(), product.clone());
                    product
                }
            }
        } else {
            new_product_row(tenant_id, scraped, now)
        };

        if let Ok(body) = serde_json::to_value(&product) {
            self.kv
                .put_json(&format!("product:{}", product.id), &body, None)
                .await;
        }
        product
    }

    pub async fn product(&self, tenant_id: &str, product_id: &str) -> Option<Product> {
        if self.primary_up()
            && let Some(product) = self.lock().products.get(product_id)
        {
            if product.tenant_id == tenant_id {
                return Some(product.clone());
            }
            return None;
        }
        let fallback = self.kv.get_json(&format!("product:{product_id}")).await?;
        let product: Product = serde_json::from_value(fallback).ok()?;
        (product.tenant_id == tenant_id).then_some(product)
    }

    /// Persists an analysis result against the product. Degrades to the
    /// key/value copy when the primary is down so the scoring stage still
    /// completes; the fallback row is keyed `ai_analysis:{product_id}`.
    pub async fn update_scores(
        &self,
        tenant_id: &str,
        product_id: &str,
        analysis: &AiAnalysis,
    ) -> Result<(), StoreError> {
        if let Ok(body) = serde_json::to_value(analysis) {
            self.kv
                .put_json(&format!("ai_analysis:{product_id}"), &body, None)
                .await;
        }

        if !self.primary_up() {
            debug!(target: "dropflow.store", product_id, "primary down, scores kept in kv only");
            return Ok(());
        }

        let mut tables = self.lock();
        let product = tables
            .products
            .get_mut(product_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        product.price_score = Some(analysis.price_score);
        product.demand_score = Some(analysis.demand_score);
        product.sentiment_score = Some(analysis.sentiment_score);
        product.ai_score = Some(analysis.overall());
        product.updated_at = Utc::now();
        Ok(())
    }

    pub fn products_needing_analysis(
        &self,
        tenant_id: &str,
        stale_after: ChronoDuration,
        limit: usize,
    ) -> Vec<Product> {
        if !self.primary_up() {
            return Vec::new();
        }
        let cutoff = Utc::now() - stale_after;
        let mut candidates: Vec<Product> = self
            .lock()
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .filter(|p| !p.has_scores() || p.updated_at < cutoff)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        candidates.truncate(limit);
        candidates
    }

    pub fn products_below_reorder(&self, tenant_id: &str, default_threshold: u32) -> Vec<Product> {
        if !self.primary_up() {
            return Vec::new();
        }
        self.lock()
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.automation_enabled)
            .filter(|p| p.stock_quantity <= p.auto_order_threshold.unwrap_or(default_threshold))
            .cloned()
            .collect()
    }

    pub fn products_for_tenant(&self, tenant_id: &str) -> Vec<Product> {
        if !self.primary_up() {
            return Vec::new();
        }
        self.lock()
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn product_by_source_url(&self, tenant_id: &str, url: &str) -> Option<Product> {
        if !self.primary_up() {
            return None;
        }
        self.lock()
            .products
            .values()
            .find(|p| p.tenant_id == tenant_id && p.source_url == url)
            .cloned()
    }

    pub fn insert_product(&self, product: Product) {
        self.lock().products.insert(product.id.clone(), product);
    }

    pub fn set_product_price(&self, product_id: &str, price: f64) {
        if let Some(product) = self.lock().products.get_mut(product_id) {
            product.price = price;
            product.updated_at = Utc::now();
        }
    }

    pub fn adjust_stock(&self, product_id: &str, delta: i64) {
        if let Some(product) = self.lock().products.get_mut(product_id) {
            let next = product.stock_quantity as i64 + delta;
            product.stock_quantity = next.max(0) as u32;
            product.updated_at = Utc::now();
        }
    }

    // -------- orders --------

    /// Write-through upsert keyed by order id. Stage re-runs for the same
    /// message land on the same row, so a redelivered order job cannot
    /// duplicate an order.
    pub async fn upsert_order(&self, order: &Order) -> Result<(), StoreError> {
        if let Ok(body) = serde_json::to_value(order) {
            self.kv
                .put_json(&format!("order:{}", order.id), &body, None)
                .await;
        }
        if !self.primary_up() {
            debug!(target: "dropflow.store", order_id = %order.id, "primary down, order kept in kv only");
            return Ok(());
        }
        let mut tables = self.lock();
        if let Some(existing) = tables.orders.get(&order.id)
            && existing.status != order.status
            && !existing.status.can_transition_to(order.status)
        {
            return Err(StoreError::InvalidTransition(format!(
                "{:?} -> {:?}",
                existing.status, order.status
            )));
        }
        tables.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    pub async fn order(&self, tenant_id: &str, order_id: &str) -> Option<Order> {
        if self.primary_up()
            && let Some(order) = self.lock().orders.get(order_id)
        {
            if order.tenant_id == tenant_id {
                return Some(order.clone());
            }
            return None;
        }
        let fallback = self.kv.get_json(&format!("order:{order_id}")).await?;
        let order: Order = serde_json::from_value(fallback).ok()?;
        (order.tenant_id == tenant_id).then_some(order)
    }

    /// Orders auto-created today, counted against the tenant's daily quota.
    /// Returns `None` when the primary is down: the quota guard must not
    /// mistake "cannot count" for "nothing spent", so spending decisions
    /// fail closed instead.
    pub fn daily_auto_order_stats(&self, tenant_id: &str) -> Option<DailyStats> {
        if !self.primary_up() {
            return None;
        }
        let today = Utc::now().date_naive();
        let tables = self.lock();
        let mut stats = DailyStats::default();
        for order in tables.orders.values() {
            if order.tenant_id == tenant_id
                && order.auto_created
                && order.created_at.date_naive() == today
            {
                stats.orders_count += 1;
                stats.total_spent += order.total_amount;
            }
        }
        Some(stats)
    }

    // -------- rules --------

    pub fn upsert_rule(&self, rule: AutomationRule) {
        self.lock().rules.insert(rule.id.clone(), rule);
    }

    pub fn enabled_rules(&self, tenant_id: &str) -> Vec<AutomationRule> {
        if !self.primary_up() {
            return Vec::new();
        }
        self.lock()
            .rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.enabled)
            .cloned()
            .collect()
    }

    pub fn record_rule_run(&self, rule_id: &str, success: bool) {
        if let Some(rule) = self.lock().rules.get_mut(rule_id) {
            rule.executions += 1;
            if success {
                rule.successes += 1;
            }
            rule.last_run_at = Some(Utc::now());
        }
    }

    // -------- tenants --------

    pub fn upsert_tenant(&self, tenant: Tenant) {
        self.lock().tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.lock().tenants.get(tenant_id).cloned()
    }

    pub fn list_active_tenants(&self) -> Vec<Tenant> {
        self.lock()
            .tenants
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    pub fn update_autopilot_config(
        &self,
        tenant_id: &str,
        config: AutopilotConfig,
    ) -> Result<AutopilotConfig, StoreError> {
        let mut tables = self.lock();
        let tenant = tables
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::not_found("tenant", tenant_id))?;
        tenant.autopilot = config;
        Ok(tenant.autopilot.clone())
    }

    // -------- suppliers --------

    pub fn upsert_supplier(&self, supplier: Supplier) {
        self.lock().suppliers.insert(supplier.id.clone(), supplier);
    }

    pub fn active_suppliers(&self, tenant_id: &str) -> Vec<Supplier> {
        self.lock()
            .suppliers
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.active)
            .cloned()
            .collect()
    }

    pub fn set_supplier_sync_status(&self, supplier_id: &str, status: SyncStatus) {
        if let Some(supplier) = self.lock().suppliers.get_mut(supplier_id) {
            supplier.last_sync_status = Some(status);
            supplier.last_synced_at = Some(Utc::now());
        }
    }

    // -------- task progress --------

    pub fn task_started(&self, total: u32) -> String {
        let task_id = format!("task_{}", Uuid::new_v4().simple());
        self.lock().tasks.insert(
            task_id.clone(),
            TaskRecord {
                progress: TaskProgress {
                    total,
                    completed: 0,
                    failed: 0,
                },
                resolved: HashSet::new(),
            },
        );
        task_id
    }

    /// Marks one unit of the task done. Keyed per unit of work, so a
    /// redelivered job that already counted cannot count again.
    pub fn task_completed(&self, task_id: &str, key: &str) {
        if let Some(task) = self.lock().tasks.get_mut(task_id)
            && task.resolved.insert(key.to_string())
        {
            task.progress.completed += 1;
        }
    }

    pub fn task_failed(&self, task_id: &str, key: &str) {
        if let Some(task) = self.lock().tasks.get_mut(task_id)
            && task.resolved.insert(key.to_string())
        {
            task.progress.failed += 1;
        }
    }

    pub fn task(&self, task_id: &str) -> Option<TaskProgress> {
        self.lock().tasks.get(task_id).map(|t| t.progress.clone())
    }

    // -------- tenant error log --------

    pub fn log_tenant_error(&self, tenant_id: &str, context: &str, message: &str) {
        self.lock().error_log.push(TenantErrorEntry {
            tenant_id: tenant_id.to_string(),
            context: context.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub fn tenant_errors(&self, tenant_id: &str) -> Vec<TenantErrorEntry> {
        self.lock()
            .error_log
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

fn new_product_row(tenant_id: &str, scraped: &ScrapedProduct, now: DateTime<Utc>) -> Product {
    Product {
        id: format!("prod_{}", Uuid::new_v4().simple()),
        tenant_id: tenant_id.to_string(),
        title: scraped.title.clone(),
        description: scraped.description.clone(),
        price: scraped.price,
        currency: scraped.currency.clone(),
        images: scraped.images.clone(),
        availability: scraped.availability,
        sku: scraped.sku.clone(),
        brand: scraped.brand.clone(),
        category: scraped.category.clone(),
        source_url: scraped.url.clone(),
        ai_score: None,
        price_score: None,
        demand_score: None,
        sentiment_score: None,
        stock_quantity: 0,
        auto_order_threshold: None,
        automation_enabled: false,
        supplier_id: Some(detect_supplier(&scraped.url).to_string()),
        last_scraped_at: Some(now),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, OrderItem, OrderStatus, sample_product};

    fn scraped(url: &str) -> ScrapedProduct {
        ScrapedProduct {
            url: url.into(),
            title: "Wireless Earphones".into(),
            description: "High quality wireless earphones.".into(),
            price: 45.99,
            currency: "USD".into(),
            images: vec![],
            availability: true,
            sku: Some("ALI-000001".into()),
            brand: Some("TechPro".into()),
            category: Some("Electronics".into()),
            reviews: vec![],
        }
    }

    fn order(id: &str, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id: id.into(),
            tenant_id: "t1".into(),
            supplier_id: None,
            status,
            items: vec![OrderItem {
                product_id: "prod-1".into(),
                quantity: 1,
                price: 45.99,
            }],
            destination: Address {
                street: "1 Demo St".into(),
                city: "Springfield".into(),
                state: "IL".into(),
                zip_code: "62701".into(),
                country: "US".into(),
            },
            tracking_code: None,
            supplier_order_id: None,
            estimated_delivery: None,
            total_amount: 45.99,
            currency: "USD".into(),
            auto_created: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn rescrape_updates_existing_row() {
        let store = Store::new(KvStore::in_memory());
        let first = store
            .upsert_product_from_scrape("t1", &scraped("https://aliexpress.example/item/1"))
            .await;

        let mut updated = scraped("https://aliexpress.example/item/1");
        updated.price = 39.99;
        let second = store.upsert_product_from_scrape("t1", &updated).await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.price, 39.99);
        assert_eq!(second.supplier_id.as_deref(), Some("aliexpress"));
        let fetched = store.product("t1", &first.id).await.expect("product");
        assert_eq!(fetched.price, 39.99);
    }

    #[tokio::test]
    async fn product_read_falls_back_to_kv_when_primary_down() {
        let store = Store::new(KvStore::in_memory());
        let product = store
            .upsert_product_from_scrape("t1", &scraped("https://amazon.example/dp/X"))
            .await;

        store.set_primary_available(false);
        let fetched = store.product("t1", &product.id).await.expect("kv fallback");
        assert_eq!(fetched.id, product.id);
        assert!(store.product("t2", &product.id).await.is_none());
    }

    #[tokio::test]
    async fn score_write_degrades_to_kv() {
        let store = Store::new(KvStore::in_memory());
        let product = store
            .upsert_product_from_scrape("t1", &scraped("https://amazon.example/dp/X"))
            .await;
        store.set_primary_available(false);

        let analysis = AiAnalysis {
            price_score: 80,
            demand_score: 75,
            sentiment_score: 90,
            recommendation: crate::connectors::Recommendation::High,
            confidence: 0.9,
            market_data: None,
        };
        store
            .update_scores("t1", &product.id, &analysis)
            .await
            .expect("degraded write succeeds");

        let stored = store
            .kv
            .get_json(&format!("ai_analysis:{}", product.id))
            .await
            .expect("fallback row");
        assert_eq!(stored["priceScore"], 80);
    }

    #[tokio::test]
    async fn order_upsert_rejects_backward_transition() {
        let store = Store::new(KvStore::in_memory());
        store
            .upsert_order(&order("ord-1", OrderStatus::Processing))
            .await
            .expect("insert");
        let result = store.upsert_order(&order("ord-1", OrderStatus::Created)).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition(_))));
        store
            .upsert_order(&order("ord-1", OrderStatus::Shipped))
            .await
            .expect("forward transition");
    }

    #[tokio::test]
    async fn daily_stats_count_only_todays_auto_orders() {
        let store = Store::new(KvStore::in_memory());
        store
            .upsert_order(&order("ord-1", OrderStatus::Created))
            .await
            .expect("insert");
        let mut manual = order("ord-2", OrderStatus::Created);
        manual.auto_created = false;
        store.upsert_order(&manual).await.expect("insert");
        let mut yesterday = order("ord-3", OrderStatus::Created);
        yesterday.created_at = Utc::now() - ChronoDuration::days(1);
        store.upsert_order(&yesterday).await.expect("insert");

        let stats = store.daily_auto_order_stats("t1").expect("stats");
        assert_eq!(stats.orders_count, 1);
        assert!((stats.total_spent - 45.99).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn daily_stats_are_unavailable_when_primary_down() {
        let store = Store::new(KvStore::in_memory());
        store
            .upsert_order(&order("ord-1", OrderStatus::Created))
            .await
            .expect("insert");
        store.set_primary_available(false);
        assert!(store.daily_auto_order_stats("t1").is_none());
    }

    #[test]
    fn task_progress_counts_each_key_once() {
        let store = Store::new(KvStore::in_memory());
        let task_id = store.task_started(2);
        store.task_completed(&task_id, "https://example.com/p/1");
        store.task_completed(&task_id, "https://example.com/p/1");
        store.task_failed(&task_id, "https://example.com/p/1");
        store.task_failed(&task_id, "https://example.com/p/2");

        let task = store.task(&task_id).expect("task");
        assert_eq!(task.completed, 1);
        assert_eq!(task.failed, 1);
        assert_eq!(task.status(), "DONE");
    }

    #[tokio::test]
    async fn kv_counter_expires() {
        let kv = KvStore::in_memory();
        tokio::time::pause();
        assert_eq!(kv.incr_with_ttl("w:1", Duration::from_secs(60)).await, Some(1));
        assert_eq!(kv.incr_with_ttl("w:1", Duration::from_secs(60)).await, Some(2));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(kv.incr_with_ttl("w:1", Duration::from_secs(60)).await, Some(1));
    }

    #[tokio::test]
    async fn stale_products_are_offered_for_analysis() {
        let store = Store::new(KvStore::in_memory());
        let mut scored = sample_product("t1", "https://example.com/p/1");
        scored.price_score = Some(80);
        scored.demand_score = Some(80);
        scored.sentiment_score = Some(80);
        scored.updated_at = Utc::now() - ChronoDuration::hours(2);
        let stale_id = scored.id.clone();
        store.insert_product(scored);

        let mut fresh = sample_product("t1", "https://example.com/p/2");
        fresh.price_score = Some(80);
        fresh.demand_score = Some(80);
        fresh.sentiment_score = Some(80);
        store.insert_product(fresh);

        let unscored = sample_product("t1", "https://example.com/p/3");
        let unscored_id = unscored.id.clone();
        store.insert_product(unscored);

        let candidates = store.products_needing_analysis("t1", ChronoDuration::hours(1), 10);
        let ids: Vec<_> = candidates.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&stale_id.as_str()));
        assert!(ids.contains(&unscored_id.as_str()));
        assert_eq!(candidates.len(), 2);
    }
}
