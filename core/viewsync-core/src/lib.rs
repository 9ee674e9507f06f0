//! # viewsync-core
//!
//! Keeps locally cached, paginated resource views and a per-recipient
//! notification list consistent with a server's authoritative state, using
//! pushed mutation events instead of re-fetching.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The channel runs on its own
//!   thread; clients can wrap with async if needed.
//! - **Thread-safe**: Every shared cache is internally locked and cheap to clone.
//! - **Graceful degradation**: Transport and decode failures are logged and
//!   absorbed; the channel reconnects forever and views keep serving their
//!   last good page.
//! - **Explicit lifetimes**: Subscriptions, view guards and channel handles
//!   release on drop. Nothing lives in a process global.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use viewsync_core::{ChannelManager, SyncEngine, UnixSocketTransport, ViewDescriptor};
//!
//! let config = viewsync_core::load_config(None)?;
//! let manager = ChannelManager::new(
//!     Arc::new(UnixSocketTransport::new("/tmp/viewsync.sock")),
//!     config.channel.clone(),
//! );
//! let channel = manager.connect();
//! let engine = Arc::new(SyncEngine::from_config("user-1", &config));
//! let _handlers = engine.attach(&channel);
//!
//! let products = ViewDescriptor::new("products", 25)?;
//! let _view = engine.open_view(&channel, &products, |_, page| {
//!     println!("{} products", page.total());
//! });
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod permissions;
pub mod store;
pub mod ticker;
pub mod view;

pub use channel::{ChannelHandle, ChannelManager, ConnectionState, Subscription, Transport};
#[cfg(unix)]
pub use channel::UnixSocketTransport;
pub use config::{load_config, SyncConfig};
pub use engine::{
    poll_once, spawn_configured_poller, spawn_poller, EventOutcome, OpenView, SyncEngine,
};
pub use error::{Result, SyncError, TransportError};
pub use notifications::{NotificationCache, NOTIFICATION_CAPACITY};
pub use permissions::{
    authorize, can_perform, can_perform_any, permission_for, Action, AuthContext,
    AuthContextSource, StaticAuthContexts,
};
pub use store::{ChangeFeed, MemoryRowStore, RowSource, RowWrite, CHANGE_LOG_CAPACITY};
pub use ticker::Ticker;
pub use view::{
    FieldPredicates, StatusScope, ViewDescriptor, ViewPage, ViewPredicates, ViewRegistry,
    ViewSubscription,
};
