pub mod config;
pub mod coordinator;
pub mod executor;
pub mod task;
pub mod worker;

#[cfg(test)]
mod tests;

// Re-export common types
pub use config::{SiteSpec, TaskConfigOverride};
pub use coordinator::GroupCoordinator;
pub use executor::TaskExecutor;
pub use task::GroupStatus;
pub use worker::WorkerPool;
