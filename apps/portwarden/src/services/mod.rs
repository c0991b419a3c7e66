pub mod account_service;
pub mod host_executor;
pub mod lifecycle_service;
pub mod notification_service;
pub mod port_alloc;
pub mod sync_service;
pub mod traffic_service;
