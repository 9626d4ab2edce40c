pub mod error;
pub mod inflight;
pub mod orchestrator;
pub mod status;

pub use error::TriggerError;
pub use inflight::{InFlight, InFlightPermit, SymbolKey};
pub use orchestrator::{is_due, CollectionOrchestrator, TriggerRequest};
pub use status::{SymbolStatus, TickReport};
