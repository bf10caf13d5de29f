pub mod reconciliation;

pub use reconciliation::{
    compute_stats, select_expired, select_query_candidates, CycleReport, QueryPassReport,
    ReconciliationConfig, ReconciliationStats, ReconciliationWorker, StateTotals,
};
