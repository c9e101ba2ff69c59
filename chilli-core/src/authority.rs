use crate::error::PostError;
use crate::msg::RedirMsg;
use crate::session::SessionSnapshot;
use async_trait::async_trait;
use std::net::Ipv4Addr;

/// The component that owns the durable table of authenticated clients.
///
/// The redirect handler only reads from it (`get_state`) and asks it to
/// change (`publish`); it never holds session state of its own.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Current session for `addr`, or `None` if the client is unknown.
    async fn get_state(&self, addr: Ipv4Addr) -> Option<SessionSnapshot>;

    /// Queues `msg` for the authority without waiting for it to be consumed.
    fn publish(&self, msg: RedirMsg) -> Result<(), PostError>;
}
