pub mod account_repo;
pub mod notification_repo;
pub mod traffic_repo;

pub use account_repo::{AccountRepository, UsageTotals};
pub use notification_repo::NotificationRepository;
pub use traffic_repo::TrafficRepository;
