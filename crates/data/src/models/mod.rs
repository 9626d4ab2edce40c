//! Database row models.

pub mod observation;

pub use observation::ObservationRecord;
