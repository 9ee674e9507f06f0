//! The shared push channel: connection lifecycle, reconnects, and event
//! fan-out to typed handlers.

mod backoff;
mod manager;
mod transport;
#[cfg(unix)]
mod unix;

pub use backoff::ReconnectBackoff;
pub use manager::{
    ChannelHandle, ChannelManager, ConnectionState, EventHandler, StateListener, Subscription,
};
pub use transport::{Inbound, InboundSender, Link, Transport};
#[cfg(unix)]
pub use unix::{UnixSocketTransport, DEFAULT_LIVENESS_TIMEOUT};
