use tracing::trace;

// Lightweight metrics helpers emitted as trace events.

pub fn inc_requests(route: &'static str) {
    trace!(target = "sokoni.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "sokoni.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn rate_limited(policy: &str) {
    trace!(target = "sokoni.metrics", policy = policy, "rate_limited_total_inc");
}

pub fn blocked(identifier: &str, duration_secs: u64) {
    trace!(
        target = "sokoni.metrics",
        identifier = identifier,
        duration_secs = duration_secs,
        "blocks_total_inc"
    );
}

pub fn rejected_blocked(endpoint: &str) {
    trace!(target = "sokoni.metrics", endpoint = endpoint, "blocked_requests_total_inc");
}
