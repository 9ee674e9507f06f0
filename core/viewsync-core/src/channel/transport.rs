use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use viewsync_protocol::{ClientFrame, RawFrame};

use crate::error::TransportError;

/// What a live transport session reports back to the channel manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(RawFrame),
    /// The session ended; the manager will reconnect.
    Closed(String),
}

pub type InboundSender = Sender<Inbound>;

/// A push channel with at-least-once, unordered delivery.
///
/// Implementors should:
/// - Push every received frame to `inbound`, in arrival order
/// - Send [`Inbound::Closed`] once when the session ends for any reason
/// - Swallow transport-level heartbeats
pub trait Transport: Send + Sync {
    /// Open one session. `timeout` bounds connection establishment.
    fn open(&self, timeout: Duration, inbound: InboundSender)
        -> Result<Arc<dyn Link>, TransportError>;
}

/// Outbound half of an open session.
pub trait Link: Send + Sync {
    fn emit(&self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Close the session. Must be safe to call more than once.
    fn close(&self);
}
