pub mod collector;
pub mod event;
pub mod monitor;
pub mod multiline;
pub mod tokenizer;

pub use collector::{spawn_collector, Collector, CollectorError, CollectorHandle, Notification};
pub use event::{FileIdentity, LogEvent};
pub use monitor::{DirectoryMonitor, MonitorCommand, MonitorError};
pub use multiline::MultilineAssembler;
