pub mod batch;
pub mod models;
pub mod orchestrator;

pub use models::*;
pub use orchestrator::{DistributionConfig, Orchestrator};
