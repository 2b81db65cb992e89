use metrics::{counter, histogram};
use tracing::trace;

// Every helper emits a trace event and feeds the global recorder; without an
// installed recorder the counters are no-ops, which keeps tests silent.

pub fn inc_requests(route: &'static str) {
    trace!(target = "argus.metrics", route = route, "requests_total_inc");
    counter!("argus_http_requests_total", "route" => route).increment(1);
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "argus.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
    histogram!("argus_stage_elapsed_ms", "stage" => stage).record(elapsed_ms as f64);
}

pub fn listing_outcome(outcome: &'static str) {
    trace!(target = "argus.metrics", outcome = outcome, "listing_outcome");
    counter!("argus_listings_total", "outcome" => outcome).increment(1);
}

pub fn task_finished(task: &str, outcome: &'static str) {
    trace!(target = "argus.metrics", task = task, outcome = outcome, "task_finished");
    counter!("argus_task_runs_total", "task" => task.to_string(), "outcome" => outcome).increment(1);
}
