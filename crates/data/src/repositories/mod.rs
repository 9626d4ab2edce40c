//! Database repositories.

pub mod observation_repo;

pub use observation_repo::ObservationRepository;
