//! Trigger subsystems that create executions outside a direct request:
//! cron schedules and inbox watching.

pub mod error;
pub mod imap;
pub mod inbox;
pub mod schedule;

pub use error::TriggerError;
pub use imap::{ImapConfig, ImapConnector, MailboxConnector, MailboxSession, UidWatermark};
pub use inbox::{Delivery, InboxMonitor, MonitorConfig};
pub use schedule::{parse_cron, ScheduleKey, ScheduleRegistry, SCHEDULE_REFRESH_CHANNEL};
