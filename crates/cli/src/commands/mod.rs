//! CLI commands.

pub mod backfill;
pub mod context;
pub mod gaps;
pub mod run;
pub mod status;

pub use backfill::{run_backfill, BackfillArgs};
pub use context::ConfigArgs;
pub use gaps::{run_gaps, GapsArgs};
pub use run::{run_daemon, RunArgs};
pub use status::{run_status, StatusArgs};
