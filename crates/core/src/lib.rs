pub mod config;
pub mod error;
pub mod notification;
pub mod work_item;

pub use config::Config;
pub use error::*;
pub use notification::InboundNotification;
pub use work_item::WorkItem;
