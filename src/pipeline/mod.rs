pub mod channel;
pub mod fatal;
pub mod request;
pub mod spooler;
pub mod timer;

pub use channel::{create_channel, watermark_channel, Control, PipelineMessage, Receiver, Sender};
pub use request::{Request, Serial};
pub use spooler::{request_handoff, PendingRequest, RequestReceiver, RequestSender, SpoolError, Spooler};
