//! Prometheus metrics for the pool manager (`SPEC_FULL.md` §4.10).

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, register_int_gauge_vec, IntGauge, IntGaugeVec};

pub static FREE_SLOTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pubtxmgr_engine_free_slots", "Free orchestrator pool slots after the last tick.")
        .expect("metric registration")
});

pub static ORCHESTRATORS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pubtxmgr_orchestrators_by_state",
        "Number of orchestrators currently in each lifecycle state.",
        &["state"]
    )
    .expect("metric registration")
});

pub static FAIRNESS_EVICTIONS_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "pubtxmgr_fairness_evictions_total",
        "Orchestrators stopped and paused by fairness eviction."
    )
    .expect("metric registration")
});
