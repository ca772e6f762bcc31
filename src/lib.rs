pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::ResolverConfig;
pub use crate::error::{ResolveError, Result};
pub use crate::models::{FileReference, ReferenceDescriptor, ResolvedLocation, ValidationPolicy};
pub use crate::services::lifecycle::{ExecutionReport, LifecycleCoordinator, Output};
pub use crate::services::resolver::{ExecutionEnvironment, ResolveMode, Resolver};

/// Coordinator wired from a config and an environment with the default fetch
/// session.
pub fn coordinator(config: ResolverConfig, environment: ExecutionEnvironment) -> LifecycleCoordinator {
    let resolver = Resolver::new(environment, &config);
    LifecycleCoordinator::new(resolver, config)
}
