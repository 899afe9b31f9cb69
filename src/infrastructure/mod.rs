//! 基础设施层
//!
//! 提供具体的技术实现，包括：
//! - 依赖注入容器

// 容器实现
pub mod container;

// 重新导出API
pub use container::{
    ContainerStats, Instance, ServiceCollection, ServiceKey, ServiceLifetime, ServiceProvider,
    ServiceRegistration, ServiceScope,
};
