mod autopilot;
mod connectors;
mod dispatch;
mod http;
mod message;
mod metrics;
mod models;
mod queue;
mod ratelimit;
mod security;
mod stages;
mod store;

use autopilot::{AutopilotEngine, AutopilotError, autopilot_interval_from_env, spawn_scheduler};
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use connectors::DemoConnectors;
use message::{JobMessage, JobPayload, OrderJob, ScoreJob, ScrapeJob};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    AiScoreRequest, AiScoreResponse, ApiEnvelope, ApiErrorBody, AutopilotConfig,
    CreateOrderRequest, CreateOrderResponse, Order, OrderStatus, ScrapeImportRequest,
    ScrapeImportResponse, Supplier, Tenant,
};
use queue::{Queues, queue_capacity_from_env};
use ratelimit::{RateLimiter, api_rate_limit, global_rate_limit};
use security::{AuthContext, AuthState, RequestId, assign_request_id, require_api_auth};
use serde_json::{Value, json};
use stages::{StageHandlers, order_id_for};
use std::{net::SocketAddr, sync::Arc};
use store::Store;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const MAX_BATCH_ITEMS: usize = 50;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "dropflow.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let store = Store::from_env();
    seed_demo_data(&store, &auth_state);

    let (queues, receivers) = Queues::bounded(queue_capacity_from_env());
    let connectors = Arc::new(DemoConnectors::from_env());
    let handlers = StageHandlers::new(connectors.clone(), store.clone(), queues.clone());

    let retry_base = dispatch::retry_base_from_env();
    let _scrape_consumer = dispatch::spawn(handlers.clone(), receivers.scrape, retry_base);
    let _ai_consumer = dispatch::spawn(handlers.clone(), receivers.ai, retry_base);
    let _order_consumer = dispatch::spawn(handlers.clone(), receivers.order, retry_base);

    let engine = Arc::new(AutopilotEngine::new(connectors, store.clone(), queues));
    let _scheduler = spawn_scheduler(engine.clone(), autopilot_interval_from_env());

    let openapi: Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let limiter = RateLimiter::new(store.kv.clone());

    let state = AppState {
        handlers,
        engine,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/v1",
            Router::new()
                .route("/scrape/import", post(scrape_import))
                .route("/scrape/status/{task_id}", get(scrape_status))
                .route("/ai/score", post(ai_score))
                .route("/orders", post(create_order))
                .route("/orders/{order_id}", get(get_order))
                .nest(
                    "/autopilot",
                    Router::new()
                        .route("/status", get(autopilot_status))
                        .route("/config", post(autopilot_config))
                        .route("/run", post(autopilot_run)),
                ),
        )
        .route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            api_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, global_rate_limit))
        .layer(middleware::from_fn(assign_request_id))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "dropflow.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    handlers: StageHandlers<DemoConnectors>,
    engine: Arc<AutopilotEngine<DemoConnectors>>,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

/// Tenants come from the API key table; each gets default autopilot settings
/// and the demo supplier pair until configured otherwise.
fn seed_demo_data(store: &Store, auth: &AuthState) {
    for tenant_id in auth.tenant_ids() {
        if store.tenant(&tenant_id).is_some() {
            continue;
        }
        store.upsert_tenant(Tenant {
            id: tenant_id.clone(),
            name: tenant_id.clone(),
            active: true,
            autopilot: AutopilotConfig::default(),
            created_at: chrono::Utc::now(),
        });
        for supplier in ["amazon", "aliexpress"] {
            store.upsert_supplier(Supplier {
                id: format!("{tenant_id}-{supplier}"),
                tenant_id: tenant_id.clone(),
                name: supplier.to_string(),
                active: true,
                last_sync_status: None,
                last_synced_at: None,
            });
        }
    }
}

type ApiResult<T> = Result<Json<ApiEnvelope<T>>, ApiFailure>;

struct ApiFailure {
    status: StatusCode,
    body: ApiErrorBody,
    request_id: String,
}

impl ApiFailure {
    fn bad_request(code: &str, message: impl Into<String>, request_id: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ApiErrorBody::new(code, message),
            request_id,
        }
    }

    fn not_found(code: &str, message: impl Into<String>, request_id: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ApiErrorBody::new(code, message),
            request_id,
        }
    }

    fn internal(message: impl Into<String>, request_id: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ApiErrorBody::new("INTERNAL_ERROR", message),
            request_id,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.body = self.body.with_details(details);
        self
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let envelope = ApiEnvelope::<()>::err(self.body, self.request_id);
        (self.status, Json(envelope)).into_response()
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "dropflow-api-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

async fn openapi_json(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(ApiFailure {
                status: StatusCode::UNAUTHORIZED,
                body: ApiErrorBody::new("UNAUTHORIZED", "docs key required"),
                request_id: request_id.0,
            });
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Dropflow API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn validate_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Queue a batch of product pages for import.
///
/// - Method: `POST`
/// - Path: `/v1/scrape/import`
/// - Auth: `Authorization: Bearer <key>` or `X-Dropflow-Key: <key>`
///
/// Validation failures reject the whole batch before anything is queued.
async fn scrape_import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<ScrapeImportRequest>,
) -> ApiResult<ScrapeImportResponse> {
    crate::metrics::inc_requests("/v1/scrape/import");
    if payload.urls.is_empty() || payload.urls.len() > MAX_BATCH_ITEMS {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            format!("urls must contain between 1 and {MAX_BATCH_ITEMS} entries"),
            request_id.0,
        ));
    }
    let invalid: Vec<&str> = payload
        .urls
        .iter()
        .filter(|url| !validate_url(url))
        .map(String::as_str)
        .collect();
    if !invalid.is_empty() {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            "urls must use the http or https scheme",
            request_id.0,
        )
        .with_details(json!({ "invalidUrls": invalid })));
    }

    let task_id = state.handlers.store.task_started(payload.urls.len() as u32);
    for url in &payload.urls {
        let message = JobMessage::new(JobPayload::ScrapeProduct(ScrapeJob {
            url: url.clone(),
            tenant_id: context.tenant_id.clone(),
            user_id: Some(context.api_key_id.clone()),
            task_id: Some(task_id.clone()),
        }));
        state
            .handlers
            .queues
            .scrape
            .send(&message)
            .await
            .map_err(|err| ApiFailure::internal(err.to_string(), request_id.0.clone()))?;
    }
    info!(
        target = "dropflow.api",
        tenant_id = %context.tenant_id,
        task_id = %task_id,
        urls = payload.urls.len(),
        "scrape import queued"
    );
    Ok(Json(ApiEnvelope::ok(
        ScrapeImportResponse {
            task_id,
            queued: payload.urls.len(),
        },
        request_id.0,
    )))
}

/// Progress of a scrape import batch.
///
/// - Method: `GET`
/// - Path: `/v1/scrape/status/{task_id}`
async fn scrape_status(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(task_id): Path<String>,
) -> ApiResult<Value> {
    crate::metrics::inc_requests("/v1/scrape/status");
    let Some(task) = state.handlers.store.task(&task_id) else {
        return Err(ApiFailure::not_found(
            "TASK_NOT_FOUND",
            format!("task `{task_id}` not found"),
            request_id.0,
        ));
    };
    Ok(Json(ApiEnvelope::ok(
        json!({
            "taskId": task_id,
            "total": task.total,
            "completed": task.completed,
            "failed": task.failed,
            "status": task.status(),
        }),
        request_id.0,
    )))
}

/// Queue products for (re-)analysis.
///
/// - Method: `POST`
/// - Path: `/v1/ai/score`
async fn ai_score(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<AiScoreRequest>,
) -> ApiResult<AiScoreResponse> {
    crate::metrics::inc_requests("/v1/ai/score");
    if payload.product_ids.is_empty() || payload.product_ids.len() > MAX_BATCH_ITEMS {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            format!("productIds must contain between 1 and {MAX_BATCH_ITEMS} entries"),
            request_id.0,
        ));
    }
    for product_id in &payload.product_ids {
        let message = JobMessage::new(JobPayload::AiScoreProduct(ScoreJob {
            product_id: product_id.clone(),
            tenant_id: context.tenant_id.clone(),
            user_id: Some(context.api_key_id.clone()),
            task_id: None,
        }));
        state
            .handlers
            .queues
            .ai
            .send(&message)
            .await
            .map_err(|err| ApiFailure::internal(err.to_string(), request_id.0.clone()))?;
    }
    Ok(Json(ApiEnvelope::ok(
        AiScoreResponse {
            queued: payload.product_ids.len(),
        },
        request_id.0,
    )))
}

/// Create an order; each item becomes one supplier order job. The rows are
/// visible immediately in `CREATED` state and move forward as the order
/// stage processes them.
///
/// - Method: `POST`
/// - Path: `/v1/orders`
async fn create_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<CreateOrderRequest>,
) -> ApiResult<CreateOrderResponse> {
    crate::metrics::inc_requests("/v1/orders");
    if payload.items.is_empty() || payload.items.len() > MAX_BATCH_ITEMS {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            format!("items must contain between 1 and {MAX_BATCH_ITEMS} entries"),
            request_id.0,
        ));
    }
    if payload.items.iter().any(|item| item.quantity == 0) {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            "item quantities must be at least 1",
            request_id.0,
        ));
    }
    let mut products = Vec::with_capacity(payload.items.len());
    for item in &payload.items {
        match state
            .handlers
            .store
            .product(&context.tenant_id, &item.product_id)
            .await
        {
            Some(product) => products.push(product),
            None => {
                return Err(ApiFailure::bad_request(
                    "UNKNOWN_PRODUCT",
                    format!("product `{}` not found", item.product_id),
                    request_id.0,
                ));
            }
        }
    }

    let mut order_ids = Vec::with_capacity(payload.items.len());
    for (item, product) in payload.items.iter().zip(&products) {
        // The job carries the creation-time price and currency so the order
        // stage persists the same snapshot the caller saw, even if the
        // catalog row changes before the job is processed.
        let message = JobMessage::new(JobPayload::ProcessProductOrder(OrderJob {
            product_id: item.product_id.clone(),
            tenant_id: context.tenant_id.clone(),
            user_id: Some(context.api_key_id.clone()),
            task_id: None,
            quantity: Some(item.quantity),
            max_value: None,
            unit_price: Some(item.price),
            currency: Some(product.currency.clone()),
            destination: Some(payload.destination.clone()),
        }));
        let order_id = order_id_for(&message.id);

        let now = chrono::Utc::now();
        let pending = Order {
            id: order_id.clone(),
            tenant_id: context.tenant_id.clone(),
            supplier_id: None,
            status: OrderStatus::Created,
            items: vec![item.clone()],
            destination: payload.destination.clone(),
            tracking_code: None,
            supplier_order_id: None,
            estimated_delivery: None,
            total_amount: item.price * item.quantity as f64,
            currency: product.currency.clone(),
            auto_created: false,
            created_at: now,
            updated_at: now,
        };
        state
            .handlers
            .store
            .upsert_order(&pending)
            .await
            .map_err(|err| ApiFailure::internal(err.to_string(), request_id.0.clone()))?;
        state
            .handlers
            .queues
            .order
            .send(&message)
            .await
            .map_err(|err| ApiFailure::internal(err.to_string(), request_id.0.clone()))?;
        order_ids.push(order_id);
    }

    Ok(Json(ApiEnvelope::ok(
        CreateOrderResponse {
            order_ids,
            status: OrderStatus::Created,
        },
        request_id.0,
    )))
}

/// Fetch one order, falling back to the key/value copy when the primary
/// store is unavailable.
///
/// - Method: `GET`
/// - Path: `/v1/orders/{order_id}`
async fn get_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Path(order_id): Path<String>,
) -> ApiResult<Order> {
    crate::metrics::inc_requests("/v1/orders/get");
    match state.handlers.store.order(&context.tenant_id, &order_id).await {
        Some(order) => Ok(Json(ApiEnvelope::ok(order, request_id.0))),
        None => Err(ApiFailure::not_found(
            "ORDER_NOT_FOUND",
            format!("order `{order_id}` not found"),
            request_id.0,
        )),
    }
}

/// Current autopilot configuration plus today's usage against the quotas.
///
/// - Method: `GET`
/// - Path: `/v1/autopilot/status`
async fn autopilot_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<Value> {
    crate::metrics::inc_requests("/v1/autopilot/status");
    let Some(tenant) = state.handlers.store.tenant(&context.tenant_id) else {
        return Err(ApiFailure::not_found(
            "TENANT_NOT_FOUND",
            format!("tenant `{}` not found", context.tenant_id),
            request_id.0,
        ));
    };
    let stats = state.handlers.store.daily_auto_order_stats(&context.tenant_id);
    let errors = state.handlers.store.tenant_errors(&context.tenant_id);
    Ok(Json(ApiEnvelope::ok(
        json!({
            "config": tenant.autopilot,
            "today": stats,
            "recentErrors": errors.len(),
        }),
        request_id.0,
    )))
}

/// Replace the tenant's autopilot configuration.
///
/// - Method: `POST`
/// - Path: `/v1/autopilot/config`
async fn autopilot_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
    Json(config): Json<AutopilotConfig>,
) -> ApiResult<AutopilotConfig> {
    crate::metrics::inc_requests("/v1/autopilot/config");
    if config.monitor_urls.iter().any(|url| !validate_url(url)) {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            "monitorUrls must use the http or https scheme",
            request_id.0,
        ));
    }
    if config.max_daily_orders == 0 {
        return Err(ApiFailure::bad_request(
            "VALIDATION_ERROR",
            "maxDailyOrders must be at least 1",
            request_id.0,
        ));
    }
    let updated = state
        .handlers
        .store
        .update_autopilot_config(&context.tenant_id, config)
        .map_err(|err| {
            ApiFailure::not_found("TENANT_NOT_FOUND", err.to_string(), request_id.0.clone())
        })?;
    Ok(Json(ApiEnvelope::ok(updated, request_id.0)))
}

/// Trigger one autopilot run for the calling tenant, outside the schedule.
///
/// - Method: `POST`
/// - Path: `/v1/autopilot/run`
async fn autopilot_run(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<autopilot::AutopilotRun> {
    crate::metrics::inc_requests("/v1/autopilot/run");
    match state.engine.run_autopilot(&context.tenant_id).await {
        Ok(run) => Ok(Json(ApiEnvelope::ok(run, request_id.0))),
        Err(AutopilotError::TenantNotFound(id)) => Err(ApiFailure::not_found(
            "TENANT_NOT_FOUND",
            format!("tenant `{id}` not found"),
            request_id.0,
        )),
        Err(err) => Err(ApiFailure::internal(err.to_string(), request_id.0)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation_accepts_only_http_schemes() {
        assert!(validate_url("https://amazon.example/dp/X"));
        assert!(validate_url("http://example.com/p/1"));
        assert!(!validate_url("ftp://example.com/p/1"));
        assert!(!validate_url("javascript:alert(1)"));
        assert!(!validate_url("example.com/p/1"));
    }

    #[test]
    fn seeded_tenants_get_default_config_and_suppliers() {
        let store = Store::new(store::KvStore::in_memory());
        // Uses the fallback demo credentials when the env var is unset.
        let auth = AuthState::from_env();
        seed_demo_data(&store, &auth);

        let tenants = store.list_active_tenants();
        assert!(!tenants.is_empty());
        let tenant = &tenants[0];
        assert!(!tenant.autopilot.enabled);
        assert_eq!(store.active_suppliers(&tenant.id).len(), 2);
    }
}
