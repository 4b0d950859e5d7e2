use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "dropflow.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn job_processed(queue: &str, stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "dropflow.metrics",
        queue = queue,
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "job_processed"
    );
}

pub fn job_retried(queue: &str, attempts: u32) {
    trace!(
        target = "dropflow.metrics",
        queue = queue,
        attempts = attempts,
        "job_retried"
    );
}

pub fn job_dropped(queue: &str, reason: &'static str) {
    trace!(
        target = "dropflow.metrics",
        queue = queue,
        reason = reason,
        "job_dropped"
    );
}

pub fn autopilot_run(tenant_id: &str, orders_created: u32, elapsed_ms: u128) {
    trace!(
        target = "dropflow.metrics",
        tenant_id = tenant_id,
        orders_created = orders_created,
        elapsed_ms = elapsed_ms as u64,
        "autopilot_run"
    );
}
