pub mod market;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod publisher;
pub mod seed;

pub use orchestrator::{DaemonHandle, DaemonState, Orchestrator};
