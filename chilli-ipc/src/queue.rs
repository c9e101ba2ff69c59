use chilli_core::{PostError, RedirMsg};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Creates the authority's message queue with room for `depth` messages.
///
/// Posting never waits: when the queue is full the message is dropped and
/// the caller gets [`PostError::QueueFull`] to log.
pub fn msg_queue(depth: usize) -> (MsgSender, MsgReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (MsgSender { tx }, MsgReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct MsgSender {
    tx: mpsc::Sender<RedirMsg>,
}

impl MsgSender {
    pub fn post(&self, msg: RedirMsg) -> Result<(), PostError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                debug!(client = %msg.addr, kind = ?msg.kind, "message queue full, dropping");
                Err(PostError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PostError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct MsgReceiver {
    rx: mpsc::Receiver<RedirMsg>,
}

impl MsgReceiver {
    pub async fn recv(&mut self) -> Option<RedirMsg> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RedirMsg> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new messages; already queued ones can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
