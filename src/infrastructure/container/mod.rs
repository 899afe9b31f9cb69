//! 依赖注入容器
//!
//! 提供带生命周期的服务注册和解析功能，支持：
//! - 单例 / 作用域 / 瞬态三种生命周期
//! - 同一能力键的多重绑定
//! - 开放泛型族
//! - 循环依赖检测

pub mod provider;
pub mod registration;

pub use provider::{ContainerStats, Resolver, ServiceProvider, ServiceScope};
pub use registration::{
    GenericRequest, Instance, RegistrationId, ServiceCollection, ServiceKey, ServiceLifetime,
    ServiceRegistration, ServiceShape,
};
