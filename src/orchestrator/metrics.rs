//! Prometheus metrics colocated with the orchestrator code that updates
//! them (`SPEC_FULL.md` §4.10).

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

pub static BROADCASTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("pubtxmgr_broadcasts_total", "Total broadcast attempts that reached the ledger.")
        .expect("metric registration")
});
