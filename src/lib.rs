pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod logging;
pub mod scheduler;
pub mod simulation;
pub mod tenancy;

// Re-export commonly used items for convenience
pub use config::AppConfig;
pub use errors::{AppError, AppResult, ContainerError, TaskError, TenancyError};
pub use infrastructure::container::{
    ServiceCollection, ServiceKey, ServiceLifetime, ServiceProvider, ServiceScope,
};
pub use scheduler::{BackgroundScheduler, DrainOutcome, MethodRegistry, QueuedTask};
pub use tenancy::{
    ContainerCloner, PipelineCache, RequestContext, TenantContainerFactory, TenantContainers,
    TenantHost, TenantId,
};
