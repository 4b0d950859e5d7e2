use crate::http::build_client;
use crate::models::{Address, OrderItem, Product};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("scrape failed for {url}: {message}")]
    Scrape { url: String, message: String },
    #[error("analysis failed: {0}")]
    Analyze(String),
    #[error("order placement failed: {0}")]
    Order(String),
    #[error("stock sync failed for supplier `{supplier}`: {message}")]
    Stock { supplier: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedProduct {
    pub url: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub images: Vec<String>,
    pub availability: bool,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub rating: u8,
    pub text: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketTrend {
    Rising,
    Stable,
    Falling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    pub avg_price: f64,
    pub competitors: u32,
    pub trend: MarketTrend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub price_score: u8,
    pub demand_score: u8,
    pub sentiment_score: u8,
    pub recommendation: Recommendation,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data: Option<MarketData>,
}

impl AiAnalysis {
    pub fn overall(&self) -> u8 {
        let sum = self.price_score as u16 + self.demand_score as u16 + self.sentiment_score as u16;
        (sum / 3) as u8
    }

    /// Pruning policy for the pipeline: only strong candidates continue to the
    /// order stage.
    pub fn warrants_order(&self) -> bool {
        self.recommendation == Recommendation::High
            || (self.price_score > 70 && self.demand_score > 70)
    }
}

#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub order_id: String,
    pub tenant_id: String,
    pub items: Vec<OrderItem>,
    pub destination: Address,
    pub total_amount: f64,
    pub currency: String,
    pub supplier_priority: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub supplier: String,
    pub supplier_order_id: String,
    pub tracking_code: String,
    pub estimated_delivery: DateTime<Utc>,
}

/// Capability interface over the four external services the pipeline calls.
/// Stage handlers and the autopilot engine receive an implementation by
/// injection so tests can substitute fakes without network access.
pub trait Connectors: Send + Sync + 'static {
    fn scrape(&self, url: &str)
    -> impl Future<Output = Result<ScrapedProduct, ConnectorError>> + Send;
    fn analyze(
        &self,
        product: &Product,
    ) -> impl Future<Output = Result<AiAnalysis, ConnectorError>> + Send;
    fn place_order(
        &self,
        draft: &OrderDraft,
    ) -> impl Future<Output = Result<PlacedOrder, ConnectorError>> + Send;
    fn sync_stock(
        &self,
        supplier_id: &str,
    ) -> impl Future<Output = Result<(), ConnectorError>> + Send;
}

/// Fixed per-supplier lead times in days; unknown suppliers fall back to the
/// `generic` entry.
static SUPPLIER_LEAD_TIMES: Lazy<Vec<(&'static str, i64)>> = Lazy::new(|| {
    vec![
        ("amazon", 3),
        ("mercadolivre", 5),
        ("shopee", 7),
        ("ebay", 7),
        ("aliexpress", 20),
        ("generic", 7),
    ]
});

fn lead_time_days(supplier: &str) -> i64 {
    SUPPLIER_LEAD_TIMES
        .iter()
        .find(|(name, _)| *name == supplier)
        .or_else(|| SUPPLIER_LEAD_TIMES.iter().find(|(name, _)| *name == "generic"))
        .map(|(_, days)| *days)
        .unwrap_or(7)
}

pub fn detect_supplier(url: &str) -> &'static str {
    if url.contains("amazon.") {
        "amazon"
    } else if url.contains("aliexpress.") {
        "aliexpress"
    } else if url.contains("mercadolivre.") || url.contains("mercadolibre.") {
        "mercadolivre"
    } else if url.contains("shopee.") {
        "shopee"
    } else if url.contains("ebay.") {
        "ebay"
    } else {
        "generic"
    }
}

/// Default connector set. Outputs are simulated per supplier with a seed
/// derived from the input, so repeated calls for the same URL or product are
/// stable. When `SCRAPE_ENABLE_NETWORK` is set, the scrape first probes the
/// target URL with a bounded-retry fetch before returning catalog data.
pub struct DemoConnectors {
    http: reqwest::Client,
    network_enabled: bool,
    fetch_attempts: u32,
}

impl DemoConnectors {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            network_enabled: parse_env_bool("SCRAPE_ENABLE_NETWORK"),
            fetch_attempts: std::env::var("SCRAPE_FETCH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(3),
        }
    }

    /// Bounded-retry fetch with exponential backoff, distinct from the outer
    /// queue-level retry. Timeouts come from the shared client (~10s).
    async fn probe_url(&self, url: &str) -> Result<(), ConnectorError> {
        let mut last_error = String::new();
        for attempt in 0..self.fetch_attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(250 * (1 << attempt))).await;
            }
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_error = format!("HTTP {}", response.status()),
                Err(err) => last_error = err.to_string(),
            }
        }
        Err(ConnectorError::Scrape {
            url: url.to_string(),
            message: last_error,
        })
    }

    fn catalog_entry(url: &str, rng: &mut SmallRng) -> ScrapedProduct {
        let supplier = detect_supplier(url);
        let (title, description, price, currency, brand, category, sku_prefix) = match supplier {
            "amazon" => (
                "iPhone 15 Pro Max 256GB",
                "The most advanced smartphone with a pro camera system and titanium design. Premium build quality.",
                899.99,
                "USD",
                "Apple",
                "Smartphones",
                "AMZ",
            ),
            "aliexpress" => (
                "Wireless Bluetooth Earphones TWS Pro",
                "High quality wireless earphones with noise cancellation and long battery life.",
                45.99,
                "USD",
                "TechPro",
                "Electronics",
                "ALI",
            ),
            "mercadolivre" => (
                "Gaming Laptop RTX 4060 16GB RAM",
                "Gaming laptop with dedicated graphics, excellent thermals and a fast display.",
                1299.90,
                "USD",
                "Lenovo",
                "Computers",
                "ML",
            ),
            "shopee" => (
                "Smartwatch Fitness Tracker IP68",
                "Water resistant smartwatch with health and fitness monitoring.",
                89.99,
                "USD",
                "FitTech",
                "Wearables",
                "SPE",
            ),
            "ebay" => (
                "Vintage Camera Canon AE-1 35mm Film",
                "Classic vintage 35mm film camera in excellent condition.",
                299.99,
                "USD",
                "Canon",
                "Cameras",
                "EBY",
            ),
            _ => (
                "Generic Product - Auto Scraped",
                "This product was automatically captured from a generic storefront.",
                99.99,
                "USD",
                "Generic",
                "General",
                "GEN",
            ),
        };

        // Small stable jitter so re-scrapes of the same URL observe a price move.
        let jitter = 1.0 + (rng.random_range(-50..=50) as f64 / 1000.0);
        ScrapedProduct {
            url: url.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            price: (price * jitter * 100.0).round() / 100.0,
            currency: currency.to_string(),
            images: vec![
                format!("https://cdn.{supplier}.example/{}/main.jpg", sku_prefix.to_lowercase()),
            ],
            availability: true,
            sku: Some(format!("{sku_prefix}-{:06}", rng.random_range(0..1_000_000u32))),
            brand: Some(brand.to_string()),
            category: Some(category.to_string()),
            reviews: Vec::new(),
        }
    }
}

impl Connectors for DemoConnectors {
    async fn scrape(&self, url: &str) -> Result<ScrapedProduct, ConnectorError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConnectorError::Scrape {
                url: url.to_string(),
                message: "unsupported url scheme".into(),
            });
        }
        if self.network_enabled {
            self.probe_url(url).await?;
        }
        let mut rng = seeded_rng(url);
        let product = Self::catalog_entry(url, &mut rng);
        debug!(target: "dropflow.connectors", url, supplier = detect_supplier(url), "scraped product");
        Ok(product)
    }

    async fn analyze(&self, product: &Product) -> Result<AiAnalysis, ConnectorError> {
        let mut rng = seeded_rng(&format!("{}:{}", product.id, product.title));

        let base_price_score: i32 = if product.price < 100.0 {
            85
        } else if product.price < 500.0 {
            75
        } else if product.price < 1000.0 {
            65
        } else {
            50
        };
        let brand_adjustment: i32 = match product.brand.as_deref() {
            Some("Apple") => -10,
            Some("Samsung") => -5,
            Some("Generic") => 15,
            _ => 0,
        };
        let price_score =
            (base_price_score + brand_adjustment + rng.random_range(-10..=10)).clamp(0, 100) as u8;

        let category_multiplier = match product.category.as_deref() {
            Some("Smartphones") => 1.2,
            Some("Electronics") | Some("Wearables") => 1.1,
            Some("Computers") => 1.0,
            _ => 0.9,
        };
        let demand_base = 60.0 + rng.random_range(0..30) as f64;
        let demand_score = (demand_base * category_multiplier).min(100.0).round() as u8;

        let description = product.description.to_lowercase();
        let mut sentiment = 70.0 + rng.random_range(0..20) as f64;
        if description.contains("high quality")
            || description.contains("excellent")
            || description.contains("premium")
        {
            sentiment += 10.0;
        }
        if product.description.len() > 100 {
            sentiment += 5.0;
        }
        let sentiment_score = sentiment.min(100.0).round() as u8;

        let overall = (price_score as u16 + demand_score as u16 + sentiment_score as u16) / 3;
        let recommendation = if overall >= 80 {
            Recommendation::High
        } else if overall >= 60 {
            Recommendation::Medium
        } else {
            Recommendation::Low
        };

        let variance = (price_score as i32 - demand_score as i32).abs()
            + (demand_score as i32 - sentiment_score as i32).abs()
            + (sentiment_score as i32 - price_score as i32).abs();
        let confidence = ((1.0 - variance as f64 / 300.0) * 100.0).round() / 100.0;

        let trend = match rng.random_range(0..10) {
            0..3 => MarketTrend::Rising,
            3..7 => MarketTrend::Stable,
            _ => MarketTrend::Falling,
        };

        Ok(AiAnalysis {
            price_score,
            demand_score,
            sentiment_score,
            recommendation,
            confidence,
            market_data: Some(MarketData {
                avg_price: (product.price * (0.8 + rng.random::<f64>() * 0.4) * 100.0).round()
                    / 100.0,
                competitors: rng.random_range(10..60),
                trend,
            }),
        })
    }

    async fn place_order(&self, draft: &OrderDraft) -> Result<PlacedOrder, ConnectorError> {
        if draft.items.is_empty() {
            return Err(ConnectorError::Order("order has no items".into()));
        }

        let supplier = draft
            .supplier_priority
            .iter()
            .find(|name| SUPPLIER_LEAD_TIMES.iter().any(|(known, _)| known == &name.as_str()))
            .cloned()
            .unwrap_or_else(|| "generic".to_string());

        let mut rng = seeded_rng(&draft.order_id);
        let supplier_order_id =
            format!("{}-{}", supplier.to_uppercase(), Utc::now().timestamp_millis());
        let tracking_code = tracking_code(&mut rng);
        let estimated_delivery = Utc::now() + ChronoDuration::days(lead_time_days(&supplier));

        debug!(
            target: "dropflow.connectors",
            order_id = %draft.order_id,
            supplier = %supplier,
            "supplier accepted order"
        );

        Ok(PlacedOrder {
            supplier,
            supplier_order_id,
            tracking_code,
            estimated_delivery,
        })
    }

    async fn sync_stock(&self, supplier_id: &str) -> Result<(), ConnectorError> {
        if supplier_id.trim().is_empty() {
            return Err(ConnectorError::Stock {
                supplier: supplier_id.to_string(),
                message: "missing supplier id".into(),
            });
        }
        let mut rng = seeded_rng(supplier_id);
        let tracked_products: u32 = rng.random_range(50..150);
        debug!(
            target: "dropflow.connectors",
            supplier = supplier_id,
            tracked_products,
            "stock sync completed"
        );
        Ok(())
    }
}

fn tracking_code(rng: &mut SmallRng) -> String {
    const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut code = String::with_capacity(13);
    for _ in 0..2 {
        code.push(LETTERS[rng.random_range(0..LETTERS.len())] as char);
    }
    for _ in 0..9 {
        code.push(char::from_digit(rng.random_range(0..10u32), 10).unwrap_or('0'));
    }
    code.push_str("US");
    code
}

fn seeded_rng(input: &str) -> SmallRng {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    SmallRng::seed_from_u64(hasher.finish())
}

fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
