// Service layer: live-log plumbing, email, firewall control, the auto-block
// actor, the notification pipeline, and background workers.

pub mod alert_monitor;
pub mod auto_block;
pub mod blocklist;
pub mod broadcaster;
pub mod email;
pub mod firewall;
pub mod hot_cache;
pub mod notification;
pub mod tailer;
pub mod workers;
