pub mod account;
pub mod notification;
pub mod traffic;

pub use account::{Account, ADMIN_USERNAME};
pub use notification::{NotificationEvent, NotificationKind};
pub use traffic::{DailyUsage, TrafficSnapshot};
