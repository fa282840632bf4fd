//! The tsdproxy control plane.
//!
//! [`ProxyManager`] owns the provider registries and the proxy table,
//! demultiplexes target lifecycle events through a bounded worker pool,
//! and fans proxy status events out to subscribers. Each [`Proxy`] owns an
//! overlay node and its [`PortListener`]s.

mod manager;
mod port;
mod proxy;

pub use manager::{
    ProxyManager, StatusEvents, ERROR_CHANNEL_BUFFER, EVENT_CHANNEL_BUFFER,
    MAX_CONCURRENT_EVENT_HANDLERS, STATUS_EVENT_CHANNEL_BUFFER,
};
pub use port::PortListener;
pub use proxy::Proxy;
