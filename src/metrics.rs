use tracing::trace;

// Counters are emitted as trace events under `argus.metrics`; the Prometheus
// recorder installed in main picks up what it subscribes to, and everything
// stays greppable in plain logs.

pub fn inc_requests(route: &'static str) {
    trace!(target = "argus.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "argus.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn cache_hit(market_data_fresh: bool) {
    trace!(
        target = "argus.metrics",
        fresh = market_data_fresh,
        "research_cache_hit"
    );
}

pub fn cache_sweep(cleared: usize) {
    trace!(
        target = "argus.metrics",
        cleared = cleared as u64,
        "research_cache_sweep"
    );
}
