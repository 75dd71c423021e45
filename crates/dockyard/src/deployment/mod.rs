pub mod allocator;
pub mod docker;
pub mod nginx;
pub mod service;

pub use allocator::PortAllocator;
pub use docker::ImageManager;
pub use nginx::NginxConfigurator;
pub use service::{
    DomainList, Manifest, PortSpec, Service, ServiceConfiguration, ServiceStatus, WebSocket,
};
