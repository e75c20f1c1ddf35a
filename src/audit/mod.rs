pub mod reconcile;
pub mod sink;

pub use reconcile::{reconcile, totals};
pub use sink::{run_stem, AuditSink};
