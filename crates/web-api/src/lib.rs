pub mod data_health;
pub mod handlers;
pub mod server;

pub use data_health::{DataHealthResponse, HealthSummary};
pub use handlers::{ApiError, BackfillResponse};
pub use server::ApiServer;
