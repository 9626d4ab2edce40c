pub mod cancel;
pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod traits;
pub mod types;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{
    AppConfig, DatabaseConfig, GapConfig, OrchestratorConfig, PersistenceConfig,
    RateLimitConfig, SchedulerConfig, SeriesConfig, ServerConfig,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{ConfigError, SourceError, SourceResult};
pub use traits::SourceAdapter;
pub use types::{
    completeness_pct, is_valid_cadence, Bound, CollectionRun, FailureReason, FieldMap, Gap, GapKind,
    HealthConfig, HealthRecord, Observation, RunOutcome, StopReason, SubRangeFailure,
    SymbolRunSummary, SymbolState,
};
