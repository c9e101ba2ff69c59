//! The boundary between the redirect handler and the session authority:
//! a bounded, non-blocking message queue for authentication events and an
//! in-process authority that consumes it.

pub mod queue;
pub mod table;

pub use queue::{msg_queue, MsgReceiver, MsgSender};
pub use table::SessionTable;
