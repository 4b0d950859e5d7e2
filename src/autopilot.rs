use crate::connectors::Connectors;
use crate::message::{JobMessage, JobPayload, OrderJob, ScoreJob, ScrapeJob};
use crate::metrics;
use crate::models::{AutopilotConfig, Product, SyncStatus};
use crate::queue::Queues;
use crate::store::Store;
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{error, info, warn};

/// How many stale or unscored products one run may push to the scoring queue.
const ANALYSIS_BATCH_LIMIT: usize = 10;
/// A product is re-analyzed when its last update is older than this.
const ANALYSIS_STALE_AFTER_HOURS: i64 = 1;

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("tenant `{0}` not found")]
    TenantNotFound(String),
    #[error("enqueue failed: {0}")]
    Enqueue(String),
}

/// Outcome of one autopilot run for one tenant.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotRun {
    pub tenant_id: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub scrapes_enqueued: u32,
    pub rescrapes: u32,
    pub analyses_enqueued: u32,
    pub orders_enqueued: u32,
    pub rules_matched: u32,
    pub alerts: u32,
    pub prices_updated: u32,
    pub suppliers_synced: u32,
    pub supplier_errors: u32,
    pub reorders_enqueued: u32,
}

/// Per-tenant automation loop: watches configured URLs, keeps scores fresh,
/// evaluates ordering rules, syncs supplier stock and reorders low inventory.
/// Everything it decides goes through the same queues as user-driven work, so
/// downstream behavior is identical either way.
pub struct AutopilotEngine<C> {
    connectors: Arc<C>,
    store: Store,
    queues: Queues,
}

impl<C: Connectors> AutopilotEngine<C> {
    pub fn new(connectors: Arc<C>, store: Store, queues: Queues) -> Self {
        Self {
            connectors,
            store,
            queues,
        }
    }

    pub async fn run_autopilot(&self, tenant_id: &str) -> Result<AutopilotRun, AutopilotError> {
        let started = Instant::now();
        let tenant = self
            .store
            .tenant(tenant_id)
            .ok_or_else(|| AutopilotError::TenantNotFound(tenant_id.to_string()))?;
        let config = tenant.autopilot;

        let mut run = AutopilotRun {
            tenant_id: tenant_id.to_string(),
            enabled: config.enabled,
            ..AutopilotRun::default()
        };
        if !config.enabled {
            run.skipped = Some("disabled".into());
            return Ok(run);
        }

        // Quota guard comes before any work: a tenant at its daily order or
        // budget limit gets a pure no-op run. When the usage counters cannot
        // be read the guard fails closed and the run is skipped outright.
        let Some(stats) = self.store.daily_auto_order_stats(tenant_id) else {
            run.skipped = Some("order_stats_unavailable".into());
            warn!(target: "dropflow.autopilot", tenant_id, "skipping run, daily order stats unavailable");
            return Ok(run);
        };
        if stats.orders_count >= config.max_daily_orders {
            run.skipped = Some("daily_order_limit_reached".into());
            info!(target: "dropflow.autopilot", tenant_id, orders = stats.orders_count, "skipping run, daily order limit reached");
            return Ok(run);
        }
        if stats.total_spent >= config.budget_limit {
            run.skipped = Some("budget_limit_reached".into());
            info!(target: "dropflow.autopilot", tenant_id, spent = stats.total_spent, "skipping run, budget exhausted");
            return Ok(run);
        }
        let mut order_slots = config.max_daily_orders - stats.orders_count;

        self.monitor_urls(tenant_id, &config, &mut run).await?;
        self.refresh_scores(tenant_id, &mut run).await?;

        let mut ordered: HashSet<String> = HashSet::new();
        self.evaluate_rules(tenant_id, &config, &mut order_slots, &mut ordered, &mut run)
            .await?;
        self.sync_suppliers(tenant_id, &mut run).await;
        self.reorder_low_stock(tenant_id, &config, &mut order_slots, &mut ordered, &mut run)
            .await?;

        metrics::autopilot_run(tenant_id, run.orders_enqueued, started.elapsed().as_millis());
        info!(
            target: "dropflow.autopilot",
            tenant_id,
            scrapes = run.scrapes_enqueued,
            analyses = run.analyses_enqueued,
            orders = run.orders_enqueued,
            "run complete"
        );
        Ok(run)
    }

    /// Known monitor URLs are re-scraped inline to refresh price and
    /// availability; unknown ones enter the pipeline from the top.
    async fn monitor_urls(
        &self,
        tenant_id: &str,
        config: &AutopilotConfig,
        run: &mut AutopilotRun,
    ) -> Result<(), AutopilotError> {
        for url in &config.monitor_urls {
            if self.store.product_by_source_url(tenant_id, url).is_some() {
                match self.connectors.scrape(url).await {
                    Ok(scraped) => {
                        self.store
                            .upsert_product_from_scrape(tenant_id, &scraped)
                            .await;
                        run.rescrapes += 1;
                    }
                    Err(err) => {
                        warn!(target: "dropflow.autopilot", tenant_id, url, error = %err, "monitor re-scrape failed");
                        self.store
                            .log_tenant_error(tenant_id, "monitor", &err.to_string());
                    }
                }
                continue;
            }
            let message = JobMessage::new(JobPayload::AutopilotScrape(ScrapeJob {
                url: url.clone(),
                tenant_id: tenant_id.to_string(),
                user_id: None,
                task_id: None,
            }));
            self.queues
                .scrape
                .send(&message)
                .await
                .map_err(|err| AutopilotError::Enqueue(err.to_string()))?;
            run.scrapes_enqueued += 1;
        }
        Ok(())
    }

    async fn refresh_scores(
        &self,
        tenant_id: &str,
        run: &mut AutopilotRun,
    ) -> Result<(), AutopilotError> {
        let candidates = self.store.products_needing_analysis(
            tenant_id,
            ChronoDuration::hours(ANALYSIS_STALE_AFTER_HOURS),
            ANALYSIS_BATCH_LIMIT,
        );
        for product in candidates {
            let message = JobMessage::new(JobPayload::AutopilotAiAnalysis(ScoreJob {
                product_id: product.id,
                tenant_id: tenant_id.to_string(),
                user_id: None,
                task_id: None,
            }));
            self.queues
                .ai
                .send(&message)
                .await
                .map_err(|err| AutopilotError::Enqueue(err.to_string()))?;
            run.analyses_enqueued += 1;
        }
        Ok(())
    }

    async fn evaluate_rules(
        &self,
        tenant_id: &str,
        config: &AutopilotConfig,
        order_slots: &mut u32,
        ordered: &mut HashSet<String>,
        run: &mut AutopilotRun,
    ) -> Result<(), AutopilotError> {
        let rules = self.store.enabled_rules(tenant_id);
        if rules.is_empty() {
            return Ok(());
        }
        let products = self.store.products_for_tenant(tenant_id);

        for rule in rules {
            let mut triggered = false;
            for product in products.iter().filter(|p| rule.matches(p)) {
                run.rules_matched += 1;
                triggered = true;
                if rule.actions.alert {
                    info!(
                        target: "dropflow.autopilot",
                        tenant_id,
                        rule = %rule.name,
                        product_id = %product.id,
                        "rule alert"
                    );
                    run.alerts += 1;
                }
                if let Some(price) = rule.actions.update_price {
                    self.store.set_product_price(&product.id, price);
                    run.prices_updated += 1;
                }
                if !rule.actions.create_order {
                    continue;
                }
                if !should_create_order(config, product, *order_slots) {
                    continue;
                }
                if !ordered.insert(product.id.clone()) {
                    continue;
                }
                self.enqueue_auto_order(tenant_id, &product.id, None, config)
                    .await?;
                *order_slots -= 1;
                run.orders_enqueued += 1;
            }
            self.store.record_rule_run(&rule.id, triggered);
        }
        Ok(())
    }

    async fn sync_suppliers(&self, tenant_id: &str, run: &mut AutopilotRun) {
        for supplier in self.store.active_suppliers(tenant_id) {
            match self.connectors.sync_stock(&supplier.id).await {
                Ok(()) => {
                    self.store
                        .set_supplier_sync_status(&supplier.id, SyncStatus::Synced);
                    run.suppliers_synced += 1;
                }
                Err(err) => {
                    warn!(target: "dropflow.autopilot", tenant_id, supplier = %supplier.id, error = %err, "stock sync failed");
                    self.store
                        .set_supplier_sync_status(&supplier.id, SyncStatus::Error);
                    self.store
                        .log_tenant_error(tenant_id, "stock_sync", &err.to_string());
                    run.supplier_errors += 1;
                }
            }
        }
    }

    async fn reorder_low_stock(
        &self,
        tenant_id: &str,
        config: &AutopilotConfig,
        order_slots: &mut u32,
        ordered: &mut HashSet<String>,
        run: &mut AutopilotRun,
    ) -> Result<(), AutopilotError> {
        let low = self
            .store
            .products_below_reorder(tenant_id, config.auto_order_threshold);
        for product in low {
            if *order_slots == 0 {
                break;
            }
            if !should_create_order(config, &product, *order_slots) {
                continue;
            }
            if !ordered.insert(product.id.clone()) {
                continue;
            }
            let threshold = product
                .auto_order_threshold
                .unwrap_or(config.auto_order_threshold);
            let quantity = reorder_quantity(threshold, product.ai_score.unwrap_or(50));
            self.enqueue_auto_order(tenant_id, &product.id, Some(quantity), config)
                .await?;
            *order_slots -= 1;
            run.orders_enqueued += 1;
            run.reorders_enqueued += 1;
        }
        Ok(())
    }

    async fn enqueue_auto_order(
        &self,
        tenant_id: &str,
        product_id: &str,
        quantity: Option<u32>,
        config: &AutopilotConfig,
    ) -> Result<(), AutopilotError> {
        let message = JobMessage::new(JobPayload::AutopilotCreateOrder(OrderJob {
            product_id: product_id.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: None,
            task_id: None,
            quantity,
            max_value: Some(config.max_order_value),
            unit_price: None,
            currency: None,
            destination: None,
        }));
        self.queues
            .order
            .send(&message)
            .await
            .map_err(|err| AutopilotError::Enqueue(err.to_string()))
    }

    /// Runs autopilot for every active tenant. One tenant failing never stops
    /// the sweep: the error is logged against that tenant and the loop moves
    /// on.
    pub async fn run_sweep(&self) -> Vec<(String, Result<AutopilotRun, AutopilotError>)> {
        let mut results = Vec::new();
        for tenant in self.store.list_active_tenants() {
            let result = self.run_autopilot(&tenant.id).await;
            if let Err(err) = &result {
                error!(target: "dropflow.autopilot", tenant_id = %tenant.id, error = %err, "run failed");
                self.store
                    .log_tenant_error(&tenant.id, "autopilot", &err.to_string());
            }
            results.push((tenant.id, result));
        }
        results
    }
}

/// Tenant-level gate applied on top of rule conditions before an auto order
/// is enqueued: the score bar, the reorder threshold, and the value cap.
fn should_create_order(config: &AutopilotConfig, product: &Product, order_slots: u32) -> bool {
    let threshold = product
        .auto_order_threshold
        .unwrap_or(config.auto_order_threshold);
    order_slots > 0
        && product.ai_score.unwrap_or(0) >= config.min_ai_score
        && product.stock_quantity <= threshold
        && product.price <= config.max_order_value
}

/// Deterministic restock amount: twice the threshold with a floor of ten,
/// scaled by the AI score so weak products get smaller batches. Never zero.
pub fn reorder_quantity(threshold: u32, ai_score: u8) -> u32 {
    let base = (threshold * 2).max(10);
    let scaled = (base as f64 * ai_score.min(100) as f64 / 100.0).round() as u32;
    scaled.max(1)
}

pub fn autopilot_interval_from_env() -> Duration {
    let secs = std::env::var("AUTOPILOT_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

/// Hourly scheduler; the first sweep runs one period after boot.
pub fn spawn_scheduler<C: Connectors>(
    engine: Arc<AutopilotEngine<C>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let results = engine.run_sweep().await;
            let failures = results.iter().filter(|(_, r)| r.is_err()).count();
            info!(
                target: "dropflow.autopilot",
                tenants = results.len(),
                failures,
                "sweep finished"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Address, AutomationRule, Order, OrderItem, OrderStatus, RuleActions, RuleConditions,
        Supplier, Tenant, sample_product,
    };
    use crate::queue::QueueReceivers;
    use crate::stages::testing::ScriptedConnectors;
    use crate::store::KvStore;
    use chrono::Utc;
    use tokio::time::timeout;

    fn tenant(id: &str, config: AutopilotConfig) -> Tenant {
        Tenant {
            id: id.into(),
            name: format!("tenant {id}"),
            active: true,
            autopilot: config,
            created_at: Utc::now(),
        }
    }

    fn enabled_config() -> AutopilotConfig {
        AutopilotConfig {
            enabled: true,
            ..AutopilotConfig::default()
        }
    }

    fn auto_order(id: &str, tenant_id: &str, amount: f64) -> Order {
        let now = Utc::now();
        Order {
            id: id.into(),
            tenant_id: tenant_id.into(),
            supplier_id: None,
            status: OrderStatus::Processing,
            items: vec![OrderItem {
                product_id: "prod-1".into(),
                quantity: 1,
                price: amount,
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
            total_amount: amount,
            currency: "USD".into(),
            auto_created: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn engine() -> (AutopilotEngine<ScriptedConnectors>, QueueReceivers) {
        let (queues, receivers) = Queues::bounded(32);
        let store = Store::new(KvStore::in_memory());
        (
            AutopilotEngine::new(Arc::new(ScriptedConnectors::default()), store, queues),
            receivers,
        )
    }

    async fn assert_queues_idle(receivers: &mut QueueReceivers) {
        assert!(
            timeout(Duration::from_millis(20), receivers.scrape.next_batch(1))
                .await
                .is_err()
        );
        assert!(
            timeout(Duration::from_millis(20), receivers.ai.next_batch(1))
                .await
                .is_err()
        );
        assert!(
            timeout(Duration::from_millis(20), receivers.order.next_batch(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn disabled_tenant_is_a_no_op() {
        let (engine, mut receivers) = engine();
        engine
            .store
            .upsert_tenant(tenant("t1", AutopilotConfig::default()));
        let run = engine.run_autopilot("t1").await.expect("run");
        assert!(!run.enabled);
        assert_eq!(run.skipped.as_deref(), Some("disabled"));
        assert_queues_idle(&mut receivers).await;
    }

    #[tokio::test]
    async fn daily_order_limit_short_circuits_the_run() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.max_daily_orders = 2;
        config.monitor_urls = vec!["https://amazon.example/dp/X".into()];
        engine.store.upsert_tenant(tenant("t1", config));
        for i in 0..2 {
            engine
                .store
                .upsert_order(&auto_order(&format!("ord-{i}"), "t1", 50.0))
                .await
                .expect("seed order");
        }

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.skipped.as_deref(), Some("daily_order_limit_reached"));
        assert_eq!(run.scrapes_enqueued, 0);
        assert_queues_idle(&mut receivers).await;
    }

    #[tokio::test]
    async fn budget_limit_short_circuits_the_run() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.budget_limit = 100.0;
        engine.store.upsert_tenant(tenant("t1", config));
        engine
            .store
            .upsert_order(&auto_order("ord-1", "t1", 150.0))
            .await
            .expect("seed order");

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.skipped.as_deref(), Some("budget_limit_reached"));
        assert_queues_idle(&mut receivers).await;
    }

    #[tokio::test]
    async fn quota_guard_fails_closed_when_order_stats_are_unavailable() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.max_daily_orders = 1;
        config.monitor_urls = vec!["https://amazon.example/dp/new".into()];
        engine.store.upsert_tenant(tenant("t1", config));
        engine
            .store
            .upsert_order(&auto_order("ord-1", "t1", 50.0))
            .await
            .expect("seed order");

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.skipped.as_deref(), Some("daily_order_limit_reached"));

        // With the primary down the usage counters cannot be read; the run
        // must skip instead of treating the tenant as having spent nothing.
        engine.store.set_primary_available(false);
        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.skipped.as_deref(), Some("order_stats_unavailable"));
        assert_eq!(run.scrapes_enqueued, 0);
        assert_queues_idle(&mut receivers).await;
    }

    #[tokio::test]
    async fn unknown_monitor_urls_enter_the_pipeline() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.monitor_urls = vec![
            "https://amazon.example/dp/known".into(),
            "https://amazon.example/dp/new".into(),
        ];
        engine.store.upsert_tenant(tenant("t1", config));
        engine
            .store
            .insert_product(sample_product("t1", "https://amazon.example/dp/known"));

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.rescrapes, 1);
        assert_eq!(run.scrapes_enqueued, 1);
        let batch = receivers.scrape.next_batch(1).await.expect("scrape job");
        assert_eq!(batch[0].body["type"], "AUTOPILOT_SCRAPE");
        assert_eq!(batch[0].body["data"]["url"], "https://amazon.example/dp/new");
    }

    #[tokio::test]
    async fn unscored_products_are_sent_for_analysis() {
        let (engine, mut receivers) = engine();
        engine.store.upsert_tenant(tenant("t1", enabled_config()));
        for i in 0..12 {
            engine
                .store
                .insert_product(sample_product("t1", &format!("https://example.com/p/{i}")));
        }

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.analyses_enqueued, ANALYSIS_BATCH_LIMIT as u32);
        let batch = receivers.ai.next_batch(20).await.expect("analysis jobs");
        assert_eq!(batch.len(), ANALYSIS_BATCH_LIMIT);
        assert_eq!(batch[0].body["type"], "AUTOPILOT_AI_ANALYSIS");
    }

    #[tokio::test]
    async fn matching_rule_enqueues_a_capped_order() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.min_ai_score = 70;
        engine.store.upsert_tenant(tenant("t1", config));

        let mut product = sample_product("t1", "https://example.com/p/1");
        product.ai_score = Some(85);
        product.price_score = Some(85);
        product.demand_score = Some(85);
        product.sentiment_score = Some(85);
        product.stock_quantity = 1;
        let product_id = product.id.clone();
        engine.store.insert_product(product);

        engine.store.upsert_rule(AutomationRule {
            id: "rule-1".into(),
            tenant_id: "t1".into(),
            name: "order winners".into(),
            conditions: RuleConditions {
                min_ai_score: Some(80),
                ..RuleConditions::default()
            },
            actions: RuleActions {
                create_order: true,
                ..RuleActions::default()
            },
            enabled: true,
            executions: 0,
            successes: 0,
            last_run_at: None,
        });

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.orders_enqueued, 1);
        let batch = receivers.order.next_batch(1).await.expect("order job");
        assert_eq!(batch[0].body["type"], "AUTOPILOT_CREATE_ORDER");
        assert_eq!(batch[0].body["data"]["productId"], product_id.as_str());
        assert_eq!(batch[0].body["data"]["maxValue"], 1000.0);
    }

    #[tokio::test]
    async fn low_score_products_never_trigger_auto_orders() {
        let (engine, mut receivers) = engine();
        engine.store.upsert_tenant(tenant("t1", enabled_config()));

        let mut product = sample_product("t1", "https://example.com/p/1");
        product.ai_score = Some(40);
        product.price_score = Some(40);
        product.demand_score = Some(40);
        product.sentiment_score = Some(40);
        engine.store.insert_product(product);

        engine.store.upsert_rule(AutomationRule {
            id: "rule-1".into(),
            tenant_id: "t1".into(),
            name: "order everything".into(),
            conditions: RuleConditions::default(),
            actions: RuleActions {
                create_order: true,
                ..RuleActions::default()
            },
            enabled: true,
            executions: 0,
            successes: 0,
            last_run_at: None,
        });

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.orders_enqueued, 0);
        assert!(
            timeout(Duration::from_millis(20), receivers.order.next_batch(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn low_stock_products_are_reordered_with_deterministic_quantity() {
        let (engine, mut receivers) = engine();
        let mut config = enabled_config();
        config.auto_order_threshold = 5;
        engine.store.upsert_tenant(tenant("t1", config));

        let mut product = sample_product("t1", "https://example.com/p/1");
        product.automation_enabled = true;
        product.stock_quantity = 2;
        product.auto_order_threshold = Some(8);
        product.demand_score = Some(75);
        product.price_score = Some(75);
        product.sentiment_score = Some(75);
        product.ai_score = Some(75);
        product.updated_at = Utc::now();
        engine.store.insert_product(product);

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.reorders_enqueued, 1);
        let batch = receivers.order.next_batch(1).await.expect("order job");
        // max(10, 8 * 2) = 16, scaled by score 75 -> 12.
        assert_eq!(batch[0].body["data"]["quantity"], 12);
    }

    #[tokio::test]
    async fn rule_actions_update_price_and_alert() {
        let (engine, _receivers) = engine();
        engine.store.upsert_tenant(tenant("t1", enabled_config()));

        let mut product = sample_product("t1", "https://example.com/p/1");
        product.ai_score = Some(90);
        product.price_score = Some(90);
        product.demand_score = Some(90);
        product.sentiment_score = Some(90);
        let product_id = product.id.clone();
        engine.store.insert_product(product);

        engine.store.upsert_rule(AutomationRule {
            id: "rule-1".into(),
            tenant_id: "t1".into(),
            name: "reprice winners".into(),
            conditions: RuleConditions {
                min_ai_score: Some(80),
                ..RuleConditions::default()
            },
            actions: RuleActions {
                create_order: false,
                alert: true,
                update_price: Some(39.99),
            },
            enabled: true,
            executions: 0,
            successes: 0,
            last_run_at: None,
        });

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.alerts, 1);
        assert_eq!(run.prices_updated, 1);
        assert_eq!(run.orders_enqueued, 0);
        let product = engine.store.product("t1", &product_id).await.expect("product");
        assert_eq!(product.price, 39.99);
        let rule = &engine.store.enabled_rules("t1")[0];
        assert_eq!(rule.executions, 1);
        assert!(rule.last_run_at.is_some());
    }

    #[tokio::test]
    async fn supplier_sync_records_status_per_supplier() {
        let (engine, _receivers) = engine();
        engine.store.upsert_tenant(tenant("t1", enabled_config()));
        engine.store.upsert_supplier(Supplier {
            id: "sup-1".into(),
            tenant_id: "t1".into(),
            name: "amazon".into(),
            active: true,
            last_sync_status: None,
            last_synced_at: None,
        });

        let run = engine.run_autopilot("t1").await.expect("run");
        assert_eq!(run.suppliers_synced, 1);
        let suppliers = engine.store.active_suppliers("t1");
        assert_eq!(suppliers[0].last_sync_status, Some(SyncStatus::Synced));
        assert!(suppliers[0].last_synced_at.is_some());
    }

    #[tokio::test]
    async fn sweep_isolates_tenant_failures() {
        let (queues, receivers) = Queues::bounded(32);
        let store = Store::new(KvStore::in_memory());
        let engine = AutopilotEngine::new(Arc::new(ScriptedConnectors::default()), store, queues);

        // Tenant A will try to enqueue into a closed queue; tenant B is
        // disabled and must still complete its run.
        let mut failing = enabled_config();
        failing.monitor_urls = vec!["https://amazon.example/dp/new".into()];
        engine.store.upsert_tenant(tenant("a", failing));
        engine.store.upsert_tenant(tenant("b", AutopilotConfig::default()));
        drop(receivers);

        let results = engine.run_sweep().await;
        assert_eq!(results.len(), 2);
        let by_tenant: std::collections::HashMap<_, _> = results
            .iter()
            .map(|(id, result)| (id.as_str(), result.is_ok()))
            .collect();
        assert_eq!(by_tenant["a"], false);
        assert_eq!(by_tenant["b"], true);
        assert_eq!(engine.store.tenant_errors("a").len(), 1);
    }

    #[test]
    fn reorder_quantity_is_floored_and_demand_scaled() {
        assert_eq!(reorder_quantity(3, 100), 10);
        assert_eq!(reorder_quantity(8, 100), 16);
        assert_eq!(reorder_quantity(8, 75), 12);
        assert_eq!(reorder_quantity(0, 1), 1);
    }
}
